//! FFI proxy over the native AGF nnet3 decoder shared library.
//!
//! The library is loaded at runtime with `libloading`; nothing links against
//! it at build time. All strings crossing the boundary are UTF-8 `CString`s
//! owned by this side for the duration of the call, and integer arrays
//! returned by the native side are copied out before the call returns.

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;

use libloading::Library;
use serde::Serialize;
use tracing::debug;

use crate::config::DecoderConfig;
use crate::error::{GrammarError, Result};
use crate::graph::{GraphBackend, GraphInput, GraphRequest};

/// Audio sample rate the decoder consumes (16-bit mono PCM).
pub const SAMPLE_RATE: u32 = 16_000;
const NUM_CHANNELS: u32 = 1;
const KALDI_FRAME_MS: u32 = 30;

/// Bytes of audio per Kaldi frame, used to convert the native side's frame
/// counts into byte offsets.
pub fn bytes_per_kaldi_frame() -> usize {
    let sample_size_bytes = 2 * NUM_CHANNELS;
    (KALDI_FRAME_MS * SAMPLE_RATE / 1000 * sample_size_bytes) as usize
}

/// Seconds of audio represented by `audio_bytes` bytes.
pub fn audio_bytes_to_s(audio_bytes: usize) -> f64 {
    let sample_size_bytes = 2 * NUM_CHANNELS as usize;
    (audio_bytes / sample_size_bytes) as f64 / f64::from(SAMPLE_RATE)
}

/// Per-utterance scores reported alongside the recognized text.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecodeInfo {
    pub likelihood: f32,
    pub am_score: f32,
    pub lm_score: f32,
    pub confidence: f32,
    pub expected_error_rate: f32,
}

/// One aligned word: its byte offset into the utterance audio and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordAlignEntry {
    pub word: String,
    pub offset_bytes: usize,
    pub length_bytes: usize,
}

/// The contract the grammar control plane consumes from the native decoder.
///
/// Rule ids are allocated densely starting at 0 and `add_grammar_fst` always
/// returns the next id; `remove_grammar_fst` does not renumber inside the
/// decoder — the control plane keeps the id space dense itself.
pub trait DecoderBackend: Send {
    /// Add a compiled grammar; returns the allocated slot index.
    fn add_grammar_fst(&mut self, graph: &Path) -> Result<u32>;
    /// Replace the grammar in slot `index` in place.
    fn reload_grammar_fst(&mut self, index: u32, graph: &Path) -> Result<()>;
    fn remove_grammar_fst(&mut self, index: u32) -> Result<()>;
    /// Refresh the word symbols and alignment lexicon after the lexicon
    /// files have been regenerated.
    fn load_lexicon(&mut self, words_file: &Path, align_lexicon_file: &Path) -> Result<()>;
    /// Feed an audio chunk (16-bit LE mono PCM). `grammars_activity` is
    /// latched at the start of an utterance and enables/disables each loaded
    /// rule.
    fn decode(
        &mut self,
        audio_bytes: &[u8],
        finalize: bool,
        grammars_activity: Option<&[bool]>,
    ) -> Result<()>;
    fn get_output(&mut self) -> Result<(String, DecodeInfo)>;
    /// Per-word time alignment of `output` (non-terminals included, ε
    /// excluded), in byte offsets into the utterance audio.
    fn get_word_align(&mut self, output: &str) -> Result<Vec<WordAlignEntry>>;
    fn save_adaptation_state(&mut self) -> Result<()>;
    fn reset_adaptation_state(&mut self) -> Result<()>;
}

type InitFn = unsafe extern "C" fn(*const c_char, *const c_char, i32) -> *mut c_void;
type LoadLexiconFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> bool;
type AddGrammarFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> i32;
type ReloadGrammarFn = unsafe extern "C" fn(*mut c_void, i32, *const c_char) -> bool;
type RemoveGrammarFn = unsafe extern "C" fn(*mut c_void, i32) -> bool;
type DecodeFn = unsafe extern "C" fn(
    *mut c_void,
    f32,
    i32,
    *const f32,
    bool,
    *const bool,
    i32,
    bool,
) -> bool;
type GetOutputFn = unsafe extern "C" fn(
    *mut c_void,
    *mut c_char,
    i32,
    *mut f32,
    *mut f32,
    *mut f32,
    *mut f32,
    *mut f32,
) -> bool;
type GetWordAlignFn = unsafe extern "C" fn(*mut c_void, *mut i32, *mut i32, i32) -> bool;
type AdaptationFn = unsafe extern "C" fn(*mut c_void) -> bool;

const OUTPUT_MAX_LENGTH: usize = 4 * 1024;

/// The AGF nnet3 decoder, dynamically loaded.
#[derive(Debug)]
pub struct AgfNnet3Decoder {
    library: Library,
    model: *mut c_void,
    num_grammars: u32,
    saving_adaptation_state: bool,
}

// SAFETY: the native handle is only ever driven by its owner; the control
// plane guarantees single-writer access from the main thread.
unsafe impl Send for AgfNnet3Decoder {}

impl AgfNnet3Decoder {
    /// Load the decoder library and initialize a decoder from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Decoder`] when the library cannot be loaded
    /// or initialization fails.
    pub fn load(library_path: &Path, config: &DecoderConfig, verbosity: i32) -> Result<Self> {
        debug!("loading decoder library {}", library_path.display());
        let library = unsafe { Library::new(library_path) }.map_err(|err| {
            GrammarError::Decoder(format!(
                "failed to load decoder library {}: {err}",
                library_path.display()
            ))
        })?;
        let config_json = serde_json::to_string(config)
            .map_err(|err| GrammarError::Decoder(format!("serialize decoder config: {err}")))?;
        let model_dir = cstring(&config.model_dir)?;
        let config_cstr = cstring(&config_json)?;
        let model = unsafe {
            let init: libloading::Symbol<'_, InitFn> = symbol(&library, b"init_agf_nnet3")?;
            init(model_dir.as_ptr(), config_cstr.as_ptr(), verbosity)
        };
        if model.is_null() {
            return Err(GrammarError::Decoder("init_agf_nnet3 failed".into()));
        }
        Ok(Self {
            library,
            model,
            num_grammars: 0,
            saving_adaptation_state: false,
        })
    }

    /// Whether updated adaptation state is saved at the end of each
    /// utterance.
    pub fn saving_adaptation_state(&self) -> bool {
        self.saving_adaptation_state
    }

    pub fn set_saving_adaptation_state(&mut self, value: bool) {
        self.saving_adaptation_state = value;
    }

    pub fn num_grammars(&self) -> u32 {
        self.num_grammars
    }
}

impl DecoderBackend for AgfNnet3Decoder {
    fn add_grammar_fst(&mut self, graph: &Path) -> Result<u32> {
        debug!("adding grammar fst: {}", graph.display());
        let path = cstring_path(graph)?;
        let index = unsafe {
            let add: libloading::Symbol<'_, AddGrammarFn> =
                symbol(&self.library, b"add_grammar_fst_agf_nnet3")?;
            add(self.model, path.as_ptr())
        };
        if index < 0 {
            return Err(GrammarError::Decoder(format!(
                "error adding grammar {}",
                graph.display()
            )));
        }
        self.num_grammars += 1;
        Ok(index as u32)
    }

    fn reload_grammar_fst(&mut self, index: u32, graph: &Path) -> Result<()> {
        debug!("reloading grammar fst #{index}: {}", graph.display());
        let path = cstring_path(graph)?;
        let ok = unsafe {
            let reload: libloading::Symbol<'_, ReloadGrammarFn> =
                symbol(&self.library, b"reload_grammar_fst_agf_nnet3")?;
            reload(self.model, index as i32, path.as_ptr())
        };
        if !ok {
            return Err(GrammarError::Decoder(format!(
                "error reloading grammar #{index} {}",
                graph.display()
            )));
        }
        Ok(())
    }

    fn remove_grammar_fst(&mut self, index: u32) -> Result<()> {
        debug!("removing grammar fst #{index}");
        let ok = unsafe {
            let remove: libloading::Symbol<'_, RemoveGrammarFn> =
                symbol(&self.library, b"remove_grammar_fst_agf_nnet3")?;
            remove(self.model, index as i32)
        };
        if !ok {
            return Err(GrammarError::Decoder(format!(
                "error removing grammar #{index}"
            )));
        }
        self.num_grammars -= 1;
        Ok(())
    }

    fn load_lexicon(&mut self, words_file: &Path, align_lexicon_file: &Path) -> Result<()> {
        let words = cstring_path(words_file)?;
        let align = cstring_path(align_lexicon_file)?;
        let ok = unsafe {
            let load: libloading::Symbol<'_, LoadLexiconFn> =
                symbol(&self.library, b"load_lexicon_agf_nnet3")?;
            load(self.model, words.as_ptr(), align.as_ptr())
        };
        if !ok {
            return Err(GrammarError::Decoder(format!(
                "error loading lexicon ({}, {})",
                words_file.display(),
                align_lexicon_file.display()
            )));
        }
        Ok(())
    }

    fn decode(
        &mut self,
        audio_bytes: &[u8],
        finalize: bool,
        grammars_activity: Option<&[bool]>,
    ) -> Result<()> {
        let samples: Vec<f32> = audio_bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])))
            .collect();
        let activity = grammars_activity.unwrap_or(&[]);
        if grammars_activity.is_some() && activity.len() as u32 != self.num_grammars {
            // Start of utterance with a mismatched bitmap: the native side
            // will clamp, but flag it loudly.
            tracing::error!(
                "wrong grammars_activity length {} != {} loaded grammars",
                activity.len(),
                self.num_grammars
            );
        }
        let ok = unsafe {
            let decode: libloading::Symbol<'_, DecodeFn> =
                symbol(&self.library, b"decode_agf_nnet3")?;
            decode(
                self.model,
                SAMPLE_RATE as f32,
                samples.len() as i32,
                samples.as_ptr(),
                finalize,
                activity.as_ptr(),
                activity.len() as i32,
                self.saving_adaptation_state,
            )
        };
        if !ok {
            return Err(GrammarError::Decoder("decoding error".into()));
        }
        Ok(())
    }

    fn get_output(&mut self) -> Result<(String, DecodeInfo)> {
        let mut buffer = vec![0u8; OUTPUT_MAX_LENGTH];
        let mut info = DecodeInfo::default();
        let ok = unsafe {
            let get: libloading::Symbol<'_, GetOutputFn> =
                symbol(&self.library, b"get_output_agf_nnet3")?;
            get(
                self.model,
                buffer.as_mut_ptr().cast::<c_char>(),
                buffer.len() as i32,
                &mut info.likelihood,
                &mut info.am_score,
                &mut info.lm_score,
                &mut info.confidence,
                &mut info.expected_error_rate,
            )
        };
        if !ok {
            return Err(GrammarError::Decoder("get_output error".into()));
        }
        let text = unsafe { CStr::from_ptr(buffer.as_ptr().cast::<c_char>()) }
            .to_string_lossy()
            .into_owned();
        Ok((text, info))
    }

    fn get_word_align(&mut self, output: &str) -> Result<Vec<WordAlignEntry>> {
        let words: Vec<&str> = output.split_whitespace().collect();
        let mut frame_times = vec![0i32; words.len()];
        let mut frame_lengths = vec![0i32; words.len()];
        let ok = unsafe {
            let get: libloading::Symbol<'_, GetWordAlignFn> =
                symbol(&self.library, b"get_word_align_agf_nnet3")?;
            get(
                self.model,
                frame_times.as_mut_ptr(),
                frame_lengths.as_mut_ptr(),
                words.len() as i32,
            )
        };
        if !ok {
            return Err(GrammarError::Decoder("get_word_align error".into()));
        }
        let frame_bytes = bytes_per_kaldi_frame();
        Ok(words
            .into_iter()
            .zip(frame_times.into_iter().zip(frame_lengths))
            .map(|(word, (time, length))| WordAlignEntry {
                word: word.to_owned(),
                offset_bytes: time as usize * frame_bytes,
                length_bytes: length as usize * frame_bytes,
            })
            .collect())
    }

    fn save_adaptation_state(&mut self) -> Result<()> {
        self.adaptation_call(b"save_adaptation_state_agf_nnet3", "save_adaptation_state")
    }

    fn reset_adaptation_state(&mut self) -> Result<()> {
        self.adaptation_call(b"reset_adaptation_state_agf_nnet3", "reset_adaptation_state")
    }
}

impl AgfNnet3Decoder {
    fn adaptation_call(&mut self, symbol_name: &[u8], description: &str) -> Result<()> {
        let ok = unsafe {
            let call: libloading::Symbol<'_, AdaptationFn> = symbol(&self.library, symbol_name)?;
            call(self.model)
        };
        if !ok {
            return Err(GrammarError::Decoder(format!("{description} error")));
        }
        Ok(())
    }
}

/// Per-request configuration for the in-process graph compiler, serialized
/// to JSON. Keys mirror the external `compile-graph-agf` arguments.
#[derive(Debug, Clone, Serialize)]
struct NativeCompileConfig {
    tree_rxfilename: String,
    model_rxfilename: String,
    lex_rxfilename: String,
    disambig_rxfilename: String,
    word_syms_filename: String,
    nonterm_phones_offset: u32,
    simplify_lg: bool,
    verbose: i32,
    hclg_wxfilename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar_prepend_nonterm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar_append_nonterm: Option<u32>,
}

/// In-process graph compiler from the decoder library (no external CLI
/// programs needed).
pub struct NativeGraphCompiler {
    library: Library,
    compiler: *mut c_void,
    files: crate::graph::GraphModelFiles,
}

// SAFETY: the native compiler object synchronizes its own internal state;
// concurrent compile calls from the worker pool are part of its contract.
unsafe impl Send for NativeGraphCompiler {}
unsafe impl Sync for NativeGraphCompiler {}

type CompilerConstructFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type CompilerDestructFn = unsafe extern "C" fn(*mut c_void) -> bool;
type CompilerCompileFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> bool;

impl NativeGraphCompiler {
    /// Load the in-process compiler from the decoder library.
    pub fn load(library_path: &Path, files: crate::graph::GraphModelFiles) -> Result<Self> {
        let library = unsafe { Library::new(library_path) }.map_err(|err| {
            GrammarError::Decoder(format!(
                "failed to load decoder library {}: {err}",
                library_path.display()
            ))
        })?;
        let base_config = serde_json::json!({
            "tree_rxfilename": files.tree.display().to_string(),
            "model_rxfilename": files.final_mdl.display().to_string(),
            "lex_rxfilename": files.l_disambig_fst.display().to_string(),
            "disambig_rxfilename": files.disambig_int.display().to_string(),
            "word_syms_filename": files.words_txt.display().to_string(),
        });
        let config = cstring(&base_config.to_string())?;
        let compiler = unsafe {
            let construct: libloading::Symbol<'_, CompilerConstructFn> =
                symbol(&library, b"agf_compiler__construct")?;
            construct(config.as_ptr())
        };
        if compiler.is_null() {
            return Err(GrammarError::Decoder("agf_compiler__construct failed".into()));
        }
        Ok(Self {
            library,
            compiler,
            files,
        })
    }

    fn request_config(&self, request: &GraphRequest<'_>) -> NativeCompileConfig {
        NativeCompileConfig {
            tree_rxfilename: self.files.tree.display().to_string(),
            model_rxfilename: self.files.final_mdl.display().to_string(),
            lex_rxfilename: self.files.l_disambig_fst.display().to_string(),
            disambig_rxfilename: self.files.disambig_int.display().to_string(),
            word_syms_filename: self.files.words_txt.display().to_string(),
            nonterm_phones_offset: self.files.nonterm_phones_offset,
            simplify_lg: request.simplify_lg,
            verbose: 0,
            hclg_wxfilename: request.output.display().to_string(),
            grammar_prepend_nonterm: request
                .nonterm
                .then_some(self.files.nonterm_words_offset),
            grammar_append_nonterm: request
                .nonterm
                .then_some(self.files.nonterm_words_offset + 1),
        }
    }
}

impl GraphBackend for NativeGraphCompiler {
    fn compile_graph(&self, request: &GraphRequest<'_>) -> Result<()> {
        let config = serde_json::to_string(&self.request_config(request))
            .map_err(|err| GrammarError::Decoder(format!("serialize compile config: {err}")))?;
        let config = cstring(&config)?;
        let (symbol_name, grammar): (&[u8], CString) = match request.input {
            GraphInput::Text(text) => (b"agf_compiler__compile_graph_text", cstring(text)?),
            GraphInput::File(path) => (b"agf_compiler__compile_graph_file", cstring_path(path)?),
        };
        let ok = unsafe {
            let compile: libloading::Symbol<'_, CompilerCompileFn> =
                symbol(&self.library, symbol_name)?;
            compile(self.compiler, config.as_ptr(), grammar.as_ptr())
        };
        if !ok {
            return Err(GrammarError::Decoder(format!(
                "native graph compilation failed for {}",
                request.output.display()
            )));
        }
        Ok(())
    }
}

impl Drop for NativeGraphCompiler {
    fn drop(&mut self) {
        unsafe {
            if let Ok(destruct) = self
                .library
                .get::<CompilerDestructFn>(b"agf_compiler__destruct")
            {
                destruct(self.compiler);
            }
        }
    }
}

fn symbol<'lib, T>(library: &'lib Library, name: &[u8]) -> Result<libloading::Symbol<'lib, T>> {
    unsafe { library.get(name) }.map_err(|err| {
        GrammarError::Decoder(format!(
            "missing symbol {} in decoder library: {err}",
            String::from_utf8_lossy(name)
        ))
    })
}

fn cstring(text: &str) -> Result<CString> {
    CString::new(text)
        .map_err(|_| GrammarError::Decoder("interior NUL in string crossing FFI".into()))
}

fn cstring_path(path: &Path) -> Result<CString> {
    cstring(&path.display().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
