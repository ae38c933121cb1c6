//! Runtime-reconfigurable grammar control plane for Kaldi nnet3 speech
//! decoders.
//!
//! Applications define speech-recognition grammars as in-memory WFSTs,
//! compile them into HCLG decoding-graph fragments, and load, reload,
//! activate and destroy them at runtime with sub-second latency, so the set
//! of recognizable utterances tracks the application's context.
//!
//! # Architecture
//!
//! - **[`wfst`]**: the in-memory weighted transducer grammars are built from
//! - **[`compiler`]**: the rule manager — id space, compile/load queues,
//!   the top FST, and recognition-output parsing
//! - **[`graph`]**: compilation of one grammar into an HCLG fragment via
//!   the external `fstcompile | compile-graph-agf` pipeline
//! - **[`cache`]**: content-addressed store of compiled graphs, keyed by
//!   grammar text hash and invalidated when any model file changes
//! - **[`model`]**: model-directory resolution, the user lexicon, and
//!   lexicon file regeneration
//! - **[`decoder`]**: the FFI proxy over the native AGF nnet3 decoder
//! - **[`dictation`]**: re-transcription of dictation spans by an
//!   alternative recognizer

pub mod cache;
pub mod compiler;
pub mod config;
pub mod decoder;
pub mod dictation;
pub mod error;
pub mod graph;
pub mod lexicon;
pub mod model;
pub mod rule;
pub mod symbols;
pub mod test_utils;
pub mod wfst;

pub use compiler::{GrammarCompiler, ParsedOutput, PartialParsedOutput, MAX_RULE_ID};
pub use config::{CompilerOptions, DecoderConfig};
pub use decoder::{AgfNnet3Decoder, DecodeInfo, DecoderBackend, WordAlignEntry};
pub use dictation::{AlternativeDictation, TranscribeOptions};
pub use error::{GrammarError, Result};
pub use model::Model;
pub use rule::{GrammarRule, RuleOptions};
pub use wfst::Wfst;
