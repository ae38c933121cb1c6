//! Configuration types for the compiler and the native decoder.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options for [`crate::compiler::GrammarCompiler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Model directory (see the model-directory layout the engine consumes).
    pub model_dir: PathBuf,
    /// Directory for compiled graph artifacts and the cache index. Defaults
    /// to `<model_dir>_cache`.
    pub tmp_dir: Option<PathBuf>,
    /// Directory holding the OpenFST / Kaldi companion executables. When
    /// unset they are looked up on `PATH`.
    pub exec_dir: Option<PathBuf>,
    /// Whether compiled graphs are cached on disk.
    pub cache_fsts: bool,
    /// Language code forwarded to the alternative-dictation callback.
    pub dictation_language: String,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("kaldi_model"),
            tmp_dir: None,
            exec_dir: None,
            cache_fsts: true,
            dictation_language: "en-US".to_owned(),
        }
    }
}

/// Decoder-init configuration, serialized to JSON and handed to the native
/// library's `init` call.
///
/// Path fields are strings because they cross the FFI boundary verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub model_dir: String,
    pub mfcc_config_filename: String,
    pub ie_config_filename: String,
    pub model_filename: String,
    pub nonterm_phones_offset: u32,
    pub rules_phones_offset: u32,
    pub dictation_phones_offset: u32,
    pub word_syms_filename: String,
    pub word_align_lexicon_filename: String,
    pub top_fst_filename: String,
    pub dictation_fst_filename: String,
    /// Maximum number of rule slots (`max_rule_id + 1`).
    pub max_num_rules: u32,

    // Decoding tuning; the native defaults apply when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beam: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_active: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lattice_beam: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acoustic_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_subsampling_factor: Option<i32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
