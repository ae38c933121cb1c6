//! Shared fixtures for the integration suite: a stub graph backend and a
//! mock decoder, so rule lifecycle and parsing can be exercised without the
//! external Kaldi toolchain.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use active_grammar::compiler::GrammarCompiler;
use active_grammar::config::CompilerOptions;
use active_grammar::decoder::{DecodeInfo, DecoderBackend, WordAlignEntry};
use active_grammar::error::Result;
use active_grammar::graph::{GraphBackend, GraphInput, GraphRequest};
use active_grammar::rule::GrammarRule;
use active_grammar::test_utils::write_model_fixture;

/// One recorded graph compilation.
#[derive(Debug, Clone)]
pub struct CompileRecord {
    pub output: PathBuf,
    pub nonterm: bool,
    pub simplify_lg: bool,
    pub from_text: bool,
}

/// Graph backend that writes a placeholder artifact and records the request.
#[derive(Default)]
pub struct StubBackend {
    pub compiles: Mutex<Vec<CompileRecord>>,
}

impl StubBackend {
    pub fn compile_count(&self) -> usize {
        self.compiles.lock().unwrap().len()
    }
}

impl GraphBackend for StubBackend {
    fn compile_graph(&self, request: &GraphRequest<'_>) -> Result<()> {
        std::fs::write(request.output, b"\x00stub-graph")?;
        self.compiles.lock().unwrap().push(CompileRecord {
            output: request.output.to_owned(),
            nonterm: request.nonterm,
            simplify_lg: request.simplify_lg,
            from_text: matches!(request.input, GraphInput::Text(_)),
        });
        Ok(())
    }
}

/// Everything the mock decoder observed, shared with the test body.
#[derive(Debug, Default)]
pub struct DecoderLog {
    pub added: Vec<PathBuf>,
    pub reloaded: Vec<(u32, PathBuf)>,
    pub removed: Vec<u32>,
    pub lexicon_loads: usize,
    pub decoded_chunks: usize,
    pub output: Option<String>,
}

/// In-memory decoder honoring the dense-slot contract.
pub struct MockDecoder {
    log: Arc<Mutex<DecoderLog>>,
    num_grammars: u32,
}

impl MockDecoder {
    pub fn new() -> (Self, Arc<Mutex<DecoderLog>>) {
        let log = Arc::new(Mutex::new(DecoderLog::default()));
        (
            Self {
                log: log.clone(),
                num_grammars: 0,
            },
            log,
        )
    }
}

impl DecoderBackend for MockDecoder {
    fn add_grammar_fst(&mut self, graph: &Path) -> Result<u32> {
        self.log.lock().unwrap().added.push(graph.to_owned());
        let index = self.num_grammars;
        self.num_grammars += 1;
        Ok(index)
    }

    fn reload_grammar_fst(&mut self, index: u32, graph: &Path) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .reloaded
            .push((index, graph.to_owned()));
        Ok(())
    }

    fn remove_grammar_fst(&mut self, index: u32) -> Result<()> {
        self.log.lock().unwrap().removed.push(index);
        self.num_grammars -= 1;
        Ok(())
    }

    fn load_lexicon(&mut self, _words_file: &Path, _align_lexicon_file: &Path) -> Result<()> {
        self.log.lock().unwrap().lexicon_loads += 1;
        Ok(())
    }

    fn decode(
        &mut self,
        _audio_bytes: &[u8],
        _finalize: bool,
        _grammars_activity: Option<&[bool]>,
    ) -> Result<()> {
        self.log.lock().unwrap().decoded_chunks += 1;
        Ok(())
    }

    fn get_output(&mut self) -> Result<(String, DecodeInfo)> {
        let output = self.log.lock().unwrap().output.clone().unwrap_or_default();
        Ok((output, DecodeInfo::default()))
    }

    fn get_word_align(&mut self, output: &str) -> Result<Vec<WordAlignEntry>> {
        // One frame-aligned word per 960 bytes, for tests that need shape
        // rather than timing.
        Ok(output
            .split_whitespace()
            .enumerate()
            .map(|(index, word)| WordAlignEntry {
                word: word.to_owned(),
                offset_bytes: index * 960,
                length_bytes: 960,
            })
            .collect())
    }

    fn save_adaptation_state(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset_adaptation_state(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A compiler over the fixture model with a stub graph backend.
pub fn new_compiler(model_dir: &Path, tmp_dir: &Path) -> (GrammarCompiler, Arc<StubBackend>) {
    write_model_fixture(model_dir);
    new_compiler_reusing_model(model_dir, tmp_dir)
}

/// Same, without rewriting the fixture (for restart scenarios).
pub fn new_compiler_reusing_model(
    model_dir: &Path,
    tmp_dir: &Path,
) -> (GrammarCompiler, Arc<StubBackend>) {
    let backend = Arc::new(StubBackend::default());
    let options = CompilerOptions {
        model_dir: model_dir.to_owned(),
        tmp_dir: Some(tmp_dir.to_owned()),
        ..CompilerOptions::default()
    };
    let compiler = GrammarCompiler::with_graph_backend(options, backend.clone())
        .expect("open fixture model");
    (compiler, backend)
}

pub fn attach_mock_decoder(compiler: &mut GrammarCompiler) -> Arc<Mutex<DecoderLog>> {
    let (decoder, log) = MockDecoder::new();
    compiler.attach_decoder(Box::new(decoder)).expect("attach decoder");
    log
}

/// Two-state grammar accepting exactly one word.
pub fn build_single_word_rule(rule: &GrammarRule, word: &str) {
    rule.edit_fst(|fst| {
        let initial = fst.add_state(None, true, false);
        let final_state = fst.add_state(None, false, true);
        fst.add_arc(initial, final_state, Some(word), None, None);
    });
}
