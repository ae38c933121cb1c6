//! The rule manager: owns the id space, the compile/load queues, the top
//! FST, and recognition-output parsing.
//!
//! Rule ids are dense integers `[0, num_rules)`; the decoder indexes rules
//! by their slot in the top FST, so on destroy all higher ids shift down and
//! loads are issued in ascending id order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use regex::{Captures, Regex};
use tracing::{debug, error, info, warn};

use crate::cache::FstFileCache;
use crate::config::{CompilerOptions, DecoderConfig};
use crate::decoder::{DecoderBackend, WordAlignEntry};
use crate::dictation::{AlternativeDictation, TranscribeOptions};
use crate::error::{GrammarError, Result};
use crate::graph::{
    AgfGraphCompiler, GraphBackend, GraphInput, GraphModelFiles, GraphRequest, ToolPaths,
};
use crate::model::{
    DEFAULT_DICTATION_FST_FILENAME, DEFAULT_DICTATION_G_FILENAME,
    DEFAULT_PLAIN_DICTATION_HCLG_FST_FILENAME, LexiconRebuilder, Model,
};
use crate::rule::{GrammarRule, RuleOptions};
use crate::symbols::symbol_table_lookup;

/// Highest allocatable rule id; the top FST always enumerates slots
/// `0..=MAX_RULE_ID`.
pub const MAX_RULE_ID: u32 = 999;

/// Closes the most recent dictation scope in recognizer output.
pub const NONTERM_END: &str = "#nonterm:end";
/// Opens a dictation span handled by the embedded dictation grammar.
pub const NONTERM_DICTATION: &str = "#nonterm:dictation";
/// Opens a dictation span earmarked for alternative re-transcription.
pub const NONTERM_DICTATION_CLOUD: &str = "#nonterm:dictation_cloud";
/// Non-terminals the output matcher treats as accept-anything wildcards.
pub const WILDCARD_NONTERMS: [&str; 2] = [NONTERM_DICTATION, NONTERM_DICTATION_CLOUD];

const RULE_NONTERM_PREFIX: &str = "#nonterm:rule";

/// Result of parsing one final recognition output.
#[derive(Debug)]
pub struct ParsedOutput {
    /// The recognized rule; `None` for empty or noise-only output.
    pub rule: Option<Arc<GrammarRule>>,
    pub words: Vec<String>,
    /// Per-word flag: inside a dictation span.
    pub dictation_mask: Vec<bool>,
}

/// Result of parsing a partial (in-utterance) recognition output.
#[derive(Debug)]
pub struct PartialParsedOutput {
    pub rule: Option<Arc<GrammarRule>>,
    pub words: Vec<String>,
    pub dictation_mask: Vec<bool>,
    /// Whether the output currently ends inside a dictation span.
    pub in_dictation: bool,
}

/// Supplies the utterance audio and per-word alignment needed for
/// alternative dictation.
pub type DictationInfoFn<'a> = dyn Fn() -> Result<(Vec<u8>, Vec<WordAlignEntry>)> + 'a;

/// The grammar compiler and rule manager.
pub struct GrammarCompiler {
    options: CompilerOptions,
    model: Model,
    tools: Option<ToolPaths>,
    backend: Arc<dyn GraphBackend>,
    decoder: Option<Box<dyn DecoderBackend>>,
    alternative_dictation: Option<Box<dyn AlternativeDictation>>,

    rules_by_id: BTreeMap<u32, Arc<GrammarRule>>,
    next_seq: u64,
    compile_queue: BTreeMap<u64, Arc<GrammarRule>>,
    /// Rules whose content (and thus filename) duplicates one already in
    /// `compile_queue`; they resolve via the cache once that one compiles.
    compile_duplicate_filename_queue: BTreeMap<u64, Arc<GrammarRule>>,
    load_queue: BTreeMap<u64, Arc<GrammarRule>>,

    lexicon_files_stale: Arc<AtomicBool>,
    lexicon_regen_lock: Arc<Mutex<()>>,
    decoder_lexicon_stale: bool,

    noise_words: BTreeSet<String>,
    oov_word: Option<String>,
}

impl GrammarCompiler {
    /// Open the model and set up the external-tool graph compiler.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Config`] when the model directory or the
    /// external executables cannot be resolved.
    pub fn new(options: CompilerOptions) -> Result<Self> {
        let tools = ToolPaths::discover(options.exec_dir.as_deref())?;
        let model = Model::new(&options.model_dir, options.tmp_dir.as_deref(), Some(&tools))?;
        let backend: Arc<dyn GraphBackend> = Arc::new(AgfGraphCompiler::new(
            tools.clone(),
            graph_model_files(&model),
        ));
        Self::from_parts(options, model, Some(tools), backend)
    }

    /// Open the model with a caller-supplied graph backend (the in-process
    /// native compiler, or a stub in tests). External tools are used when
    /// available but are not required.
    pub fn with_graph_backend(
        options: CompilerOptions,
        backend: Arc<dyn GraphBackend>,
    ) -> Result<Self> {
        let tools = ToolPaths::discover(options.exec_dir.as_deref()).ok();
        let model = Model::new(&options.model_dir, options.tmp_dir.as_deref(), tools.as_ref())?;
        Self::from_parts(options, model, tools, backend)
    }

    fn from_parts(
        options: CompilerOptions,
        model: Model,
        tools: Option<ToolPaths>,
        backend: Arc<dyn GraphBackend>,
    ) -> Result<Self> {
        let noise_words: BTreeSet<String> = ["<unk>", "!SIL"]
            .iter()
            .filter(|word| model.words_table().contains(word))
            .map(|word| (*word).to_owned())
            .collect();
        let oov_word = model
            .words_table()
            .contains("<unk>")
            .then(|| "<unk>".to_owned());
        Ok(Self {
            options,
            model,
            tools,
            backend,
            decoder: None,
            alternative_dictation: None,
            rules_by_id: BTreeMap::new(),
            next_seq: 0,
            compile_queue: BTreeMap::new(),
            compile_duplicate_filename_queue: BTreeMap::new(),
            load_queue: BTreeMap::new(),
            lexicon_files_stale: Arc::new(AtomicBool::new(false)),
            lexicon_regen_lock: Arc::new(Mutex::new(())),
            decoder_lexicon_stale: false,
            noise_words,
            oov_word,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn tmp_dir(&self) -> &Path {
        self.model.tmp_dir()
    }

    pub fn noise_words(&self) -> &BTreeSet<String> {
        &self.noise_words
    }

    /// The reserved non-terminals the decoder knows: the dictation
    /// non-terminal plus one per rule slot.
    pub fn reserved_nonterminals() -> Vec<String> {
        std::iter::once(NONTERM_DICTATION.to_owned())
            .chain((0..=MAX_RULE_ID).map(|i| format!("{RULE_NONTERM_PREFIX}{i}")))
            .collect()
    }

    pub fn oov_word(&self) -> Option<&str> {
        self.oov_word.as_deref()
    }

    /// Install the alternative-dictation recognizer consulted by
    /// [`parse_output`](Self::parse_output).
    pub fn set_alternative_dictation(&mut self, recognizer: Box<dyn AlternativeDictation>) {
        self.alternative_dictation = Some(recognizer);
    }

    /// Hand the native decoder to the compiler. Build it from
    /// [`decoder_config`](Self::decoder_config) after compiling the top FST.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Usage`] when a decoder is already attached.
    pub fn attach_decoder(&mut self, decoder: Box<dyn DecoderBackend>) -> Result<()> {
        if self.decoder.is_some() {
            return Err(GrammarError::Usage("decoder already initialized".into()));
        }
        self.decoder = Some(decoder);
        Ok(())
    }

    pub fn decoder_mut(&mut self) -> Option<&mut (dyn DecoderBackend + '_)> {
        match self.decoder.as_mut() {
            Some(boxed) => Some(boxed.as_mut()),
            None => None,
        }
    }

    // ── Rule management ───────────────────────────────────────────────────

    /// Create a rule in the next free id slot.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Usage`] when all `MAX_RULE_ID + 1` slots are
    /// taken.
    pub fn add_rule(&mut self, name: &str, options: RuleOptions) -> Result<Arc<GrammarRule>> {
        let id = self.rules_by_id.len() as u32;
        if id > MAX_RULE_ID {
            return Err(GrammarError::Usage(format!(
                "rule id {id} > max rule id {MAX_RULE_ID}"
            )));
        }
        let rule = Arc::new(GrammarRule::new(name, self.alloc_seq(), Some(id), true, options));
        self.rules_by_id.insert(id, rule.clone());
        Ok(rule)
    }

    pub fn num_rules(&self) -> usize {
        self.rules_by_id.len()
    }

    pub fn rule_by_id(&self, id: u32) -> Option<Arc<GrammarRule>> {
        self.rules_by_id.get(&id).cloned()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<GrammarRule>> {
        self.rules_by_id.values()
    }

    fn alloc_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Whether the rule sits in either compile queue.
    pub fn pending_compile(&self, rule: &GrammarRule) -> bool {
        self.compile_queue.contains_key(&rule.seq())
            || self.compile_duplicate_filename_queue.contains_key(&rule.seq())
    }

    /// Whether the rule sits in the load queue.
    pub fn pending_load(&self, rule: &GrammarRule) -> bool {
        self.load_queue.contains_key(&rule.seq())
    }

    /// Absolute path of the rule's compiled artifact.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Usage`] before the rule has been serialized.
    pub fn rule_filepath(&self, rule: &GrammarRule) -> Result<PathBuf> {
        match rule.filename() {
            Some(filename) => Ok(self.model.tmp_dir().join(filename)),
            None => Err(GrammarError::Usage(format!(
                "rule {} has no artifact filename yet",
                rule.name()
            ))),
        }
    }

    // ── Compilation ───────────────────────────────────────────────────────

    /// Compile the rule's WFST into a decoding-graph artifact.
    ///
    /// With `lazy`, the rule is queued for
    /// [`process_compile_and_load_queues`](Self::process_compile_and_load_queues);
    /// a rule whose content duplicates one already queued goes to the
    /// duplicate queue instead so only one of the pair runs the compiler.
    pub fn compile_rule(&mut self, rule: &Arc<GrammarRule>, lazy: bool) -> Result<()> {
        self.compile_rule_inner(rule, lazy, false)
    }

    fn compile_rule_inner(
        &mut self,
        rule: &Arc<GrammarRule>,
        lazy: bool,
        duplicate: bool,
    ) -> Result<()> {
        let filepath = {
            let mut state = rule.state();
            if state.destroyed {
                return Err(destroyed_error(rule));
            }
            if state.compiled {
                return Ok(());
            }
            if state.fst_text.is_none() {
                let text = state.fst.fst_text(false);
                state.filename = Some(FstFileCache::graph_filename(&text));
                state.fst_text = Some(text);
            }
            let filename = state.filename.clone().ok_or_else(|| {
                GrammarError::Usage(format!("rule {} was never serialized", rule.name()))
            })?;
            self.model.tmp_dir().join(filename)
        };

        if self.options.cache_fsts && lock(self.model.fst_cache()).graph_is_current(&filepath) {
            debug!("{rule}: skipped FST compilation thanks to cache");
            rule.state().compiled = true;
            return Ok(());
        } else if duplicate {
            warn!("{rule}: was supposed to be a duplicate compile, but was not found in cache");
        }

        if lazy {
            if !self.pending_compile(rule) {
                let filename = rule.filename();
                let duplicates_queued = self.compile_queue.values().any(|queued| {
                    queued.seq() != rule.seq() && queued.filename() == filename
                });
                if duplicates_queued {
                    self.compile_duplicate_filename_queue
                        .insert(rule.seq(), rule.clone());
                } else {
                    self.compile_queue.insert(rule.seq(), rule.clone());
                }
            }
            return Ok(());
        }

        self.prepare_for_compilation()?;
        let context = self.compile_context();
        finish_compile(&context, rule)
    }

    /// Regenerate lexicon files and refresh the decoder's lexicon when user
    /// words were added since the last compile pass.
    pub fn prepare_for_compilation(&mut self) -> Result<()> {
        if self.lexicon_files_stale.load(Ordering::Acquire) {
            let guard = self
                .lexicon_regen_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.lexicon_files_stale.load(Ordering::Acquire) {
                self.model.generate_lexicon_files(self.tools.as_ref())?;
                self.lexicon_files_stale.store(false, Ordering::Release);
            }
            drop(guard);
        }
        if self.decoder_lexicon_stale {
            self.model.load_words()?;
            let words = self.model.file("words.txt").to_owned();
            let align = self.model.file("align_lexicon.int").to_owned();
            if let Some(decoder) = &mut self.decoder {
                decoder.load_lexicon(&words, &align)?;
            }
            self.decoder_lexicon_stale = false;
        }
        Ok(())
    }

    /// Add a word to the user lexicon; the lexicon files are regenerated
    /// lazily before the next compile pass (or immediately when
    /// `lazy_compilation` is false).
    pub fn add_word(
        &mut self,
        word: &str,
        phones: Option<&[&str]>,
        lazy_compilation: bool,
    ) -> Result<Vec<Vec<String>>> {
        let pronunciations = self.model.add_word(word, phones)?;
        self.lexicon_files_stale.store(true, Ordering::Release);
        self.decoder_lexicon_stale = true;
        if !lazy_compilation {
            self.prepare_for_compilation()?;
        }
        Ok(pronunciations)
    }

    fn compile_context(&self) -> CompileContext {
        CompileContext {
            backend: self.backend.clone(),
            cache: self.model.fst_cache().clone(),
            tmp_dir: self.model.tmp_dir().to_owned(),
            cache_fsts: self.options.cache_fsts,
            lexicon_files_stale: self.lexicon_files_stale.clone(),
            lexicon_regen_lock: self.lexicon_regen_lock.clone(),
            rebuilder: Arc::new(self.model.lexicon_rebuilder(self.tools.clone())),
        }
    }

    // ── Loading ───────────────────────────────────────────────────────────

    /// Load the rule's compiled artifact into the decoder, verifying the
    /// allocated slot equals the rule's id. With `lazy` (or while a compile
    /// is pending) the rule is queued instead.
    pub fn load_rule(&mut self, rule: &Arc<GrammarRule>, lazy: bool) -> Result<()> {
        if rule.is_destroyed() {
            return Err(destroyed_error(rule));
        }
        if lazy || self.pending_compile(rule) {
            self.load_queue.insert(rule.seq(), rule.clone());
            return Ok(());
        }
        let (compiled, has_been_loaded, id) = {
            let state = rule.state();
            (state.compiled, state.has_been_loaded, state.id)
        };
        if !compiled {
            return Err(GrammarError::Usage(format!(
                "cannot load uncompiled rule {}",
                rule.name()
            )));
        }
        let id = id.ok_or_else(|| {
            GrammarError::Usage(format!("rule {} has no decoder slot", rule.name()))
        })?;
        let filepath = self.rule_filepath(rule)?;
        let decoder = self
            .decoder
            .as_deref_mut()
            .ok_or_else(|| GrammarError::Usage("decoder not initialized".into()))?;
        if has_been_loaded {
            decoder.reload_grammar_fst(id, &filepath)?;
        } else {
            let index = decoder.add_grammar_fst(&filepath)?;
            if index != id {
                return Err(GrammarError::Decoder(format!(
                    "add_grammar_fst allocated invalid index {index} != {id} for {rule}"
                )));
            }
        }
        let mut state = rule.state();
        state.loaded = true;
        state.has_been_loaded = true;
        Ok(())
    }

    /// Rebuild a rule in place: clears the WFST and lifecycle flags, runs
    /// `rebuild` (which re-populates the WFST and calls
    /// [`compile_rule`](Self::compile_rule)), then reloads into the decoder
    /// or re-queues for load. The reloading flag is restored even when
    /// `rebuild` fails or panics.
    pub fn reload_rule<F>(&mut self, rule: &Arc<GrammarRule>, rebuild: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let was_loaded = {
            let mut state = rule.state();
            if state.destroyed {
                return Err(destroyed_error(rule));
            }
            let was_loaded = state.loaded;
            state.reloading = true;
            state.fst.clear();
            state.fst_text = None;
            state.filename = None;
            state.compiled = false;
            state.loaded = false;
            was_loaded
        };
        let _guard = ReloadingGuard { rule: rule.clone() };

        rebuild(self)?;

        let (compiled, loaded, id) = {
            let state = rule.state();
            (state.compiled, state.loaded, state.id)
        };
        if compiled && was_loaded {
            if !loaded {
                let id = id.ok_or_else(|| {
                    GrammarError::Usage(format!("rule {} has no decoder slot", rule.name()))
                })?;
                let filepath = self.rule_filepath(rule)?;
                let decoder = self
                    .decoder
                    .as_deref_mut()
                    .ok_or_else(|| GrammarError::Usage("decoder not initialized".into()))?;
                decoder.reload_grammar_fst(id, &filepath)?;
                rule.state().loaded = true;
            }
        } else if was_loaded {
            // The compile during reload was lazy; load once it finishes.
            self.load_queue.insert(rule.seq(), rule.clone());
        }
        Ok(())
    }

    /// Unload and retire a rule, shifting all higher rule ids down by one to
    /// keep the id space dense.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Usage`] when the rule still has a pending or
    /// in-flight compile.
    pub fn destroy_rule(&mut self, rule: &Arc<GrammarRule>) -> Result<()> {
        if rule.is_destroyed() {
            return Ok(());
        }
        if self.pending_compile(rule) {
            return Err(GrammarError::Usage(format!(
                "cannot destroy rule {} with a pending compile",
                rule.name()
            )));
        }
        let (loaded, id) = {
            let state = rule.state();
            (state.loaded, state.id)
        };
        if loaded {
            let slot = id.ok_or_else(|| {
                GrammarError::Usage(format!("rule {} has no decoder slot", rule.name()))
            })?;
            let decoder = self
                .decoder
                .as_deref_mut()
                .ok_or_else(|| GrammarError::Usage("decoder not initialized".into()))?;
            decoder.remove_grammar_fst(slot)?;
        }
        self.load_queue.remove(&rule.seq());

        if let Some(id) = id {
            self.rules_by_id.remove(&id);
            let remaining = std::mem::take(&mut self.rules_by_id);
            for (slot, other) in remaining {
                if slot > id {
                    other.state().id = Some(slot - 1);
                    self.rules_by_id.insert(slot - 1, other);
                } else {
                    self.rules_by_id.insert(slot, other);
                }
            }
        }
        rule.state().destroyed = true;
        Ok(())
    }

    // ── Queue processing ──────────────────────────────────────────────────

    /// Drain the queues: compile every queued rule on a worker pool, resolve
    /// duplicates via the cache, then load pending rules in ascending id
    /// order (the decoder expects the i-th added rule to occupy slot i).
    pub fn process_compile_and_load_queues(&mut self) -> Result<()> {
        self.compile_queue.retain(|_, rule| !rule.is_compiled());
        self.compile_duplicate_filename_queue
            .retain(|_, rule| !rule.is_compiled());
        self.load_queue.retain(|_, rule| !rule.is_loaded());
        if self.compile_queue.is_empty()
            && self.compile_duplicate_filename_queue.is_empty()
            && self.load_queue.is_empty()
        {
            return Ok(());
        }

        self.prepare_for_compilation()?;

        if !self.compile_queue.is_empty() {
            let context = self.compile_context();
            let pending: Vec<Arc<GrammarRule>> = self.compile_queue.values().cloned().collect();
            let mut first_error = None;
            for (rule, result) in run_compile_pool(&context, pending) {
                match result {
                    Ok(()) => {
                        self.compile_queue.remove(&rule.seq());
                    }
                    Err(err) => {
                        error!("{rule}: compile failed: {err}");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        // Duplicates were compiled by/for another rule; they resolve from
        // the cache now.
        let duplicates: Vec<Arc<GrammarRule>> = self
            .compile_duplicate_filename_queue
            .values()
            .cloned()
            .collect();
        for rule in duplicates {
            self.compile_rule_inner(&rule, false, true)?;
            self.compile_duplicate_filename_queue.remove(&rule.seq());
        }

        let mut loads: Vec<Arc<GrammarRule>> = self.load_queue.values().cloned().collect();
        loads.sort_by_key(|rule| rule.id());
        for rule in loads {
            self.load_rule(&rule, false)?;
            self.load_queue.remove(&rule.seq());
        }
        Ok(())
    }

    /// Drain the queues if non-empty and persist the cache if dirty. Call
    /// before starting an utterance.
    pub fn prepare_for_recognition(&mut self) -> Result<()> {
        let queues_result = if !self.compile_queue.is_empty()
            || !self.compile_duplicate_filename_queue.is_empty()
            || !self.load_queue.is_empty()
        {
            self.process_compile_and_load_queues()
        } else {
            Ok(())
        };
        let save_result = {
            let mut cache = lock(self.model.fst_cache());
            if cache.is_dirty() { cache.save() } else { Ok(()) }
        };
        queues_result?;
        save_result
    }

    // ── Top FST and bundled grammars ──────────────────────────────────────

    /// Build and compile the fixed top FST enumerating every rule slot plus
    /// the noise words.
    pub fn compile_top_fst(&mut self) -> Result<Arc<GrammarRule>> {
        let nonterms: Vec<String> = (0..=MAX_RULE_ID)
            .map(|i| format!("{RULE_NONTERM_PREFIX}{i}"))
            .collect();
        let rule = self.build_top_fst(&nonterms);
        self.compile_rule(&rule, false)?;
        Ok(rule)
    }

    /// Top FST with only the dictation non-terminal (dictation-only setups).
    pub fn compile_top_fst_dictation_only(&mut self) -> Result<Arc<GrammarRule>> {
        let rule = self.build_top_fst(&[NONTERM_DICTATION.to_owned()]);
        self.compile_rule(&rule, false)?;
        Ok(rule)
    }

    fn build_top_fst(&mut self, nonterms: &[String]) -> Arc<GrammarRule> {
        let rule = Arc::new(GrammarRule::new(
            "top",
            self.alloc_seq(),
            None,
            false,
            RuleOptions::default(),
        ));
        let noise_words = &self.noise_words;
        rule.edit_fst(|fst| {
            let state_initial = fst.add_state(None, true, false);
            let state_final = fst.add_state(None, false, true);
            let state_return = fst.add_state(None, false, false);
            for nonterm in nonterms {
                fst.add_arc(state_initial, state_return, Some(nonterm), None, None);
            }
            fst.add_arc(state_return, state_final, None, Some(NONTERM_END), None);
            for word in noise_words {
                fst.add_arc(state_initial, state_final, Some(word), None, None);
            }
        });
        rule
    }

    /// A grammar accepting any sequence of the given words (the whole
    /// lexicon by default).
    pub fn compile_universal_grammar(
        &mut self,
        words: Option<&[String]>,
    ) -> Result<Arc<GrammarRule>> {
        let rule = Arc::new(GrammarRule::new(
            "universal",
            self.alloc_seq(),
            None,
            false,
            RuleOptions::default(),
        ));
        let words: Vec<String> = match words {
            Some(words) => words.to_vec(),
            None => {
                // Sorted for a deterministic artifact hash.
                let mut words: Vec<String> =
                    self.model.lexicon_words().iter().cloned().collect();
                words.sort();
                words
            }
        };
        rule.edit_fst(|fst| {
            let backoff = fst.add_state(None, true, true);
            for word in &words {
                fst.add_arc(backoff, backoff, Some(word), None, None);
            }
        });
        self.compile_rule(&rule, false)?;
        Ok(rule)
    }

    /// Path of the pre-compiled dictation HCLG fragment, if the model ships
    /// one. Its absence is logged; command-only operation continues.
    pub fn dictation_fst_path(&self) -> Option<PathBuf> {
        let path = self
            .model
            .model_dir()
            .join(DEFAULT_DICTATION_FST_FILENAME);
        if path.is_file() {
            Some(path)
        } else {
            error!("cannot find dictation fst: {}", path.display());
            None
        }
    }

    /// Compile the statistical dictation `G.fst` into the AGF dictation
    /// fragment (`Dictation.fst`).
    pub fn compile_agf_dictation_fst(&mut self, g_fst: Option<&Path>) -> Result<()> {
        let g_fst = match g_fst {
            Some(path) => path.to_owned(),
            None => self.model.model_dir().join(DEFAULT_DICTATION_G_FILENAME),
        };
        let output = self
            .model
            .model_dir()
            .join(DEFAULT_DICTATION_FST_FILENAME);
        self.backend.compile_graph(&GraphRequest {
            input: GraphInput::File(&g_fst),
            output: &output,
            nonterm: true,
            simplify_lg: false,
        })
    }

    /// Compile a plain (non-AGF) dictation HCLG from `G.fst`.
    pub fn compile_plain_dictation_fst(
        &mut self,
        g_fst: Option<&Path>,
        output: Option<&Path>,
    ) -> Result<()> {
        let tools = self.tools.clone().ok_or_else(|| {
            GrammarError::Config("external tools required for plain dictation compilation".into())
        })?;
        let g_fst = match g_fst {
            Some(path) => path.to_owned(),
            None => self.model.model_dir().join(DEFAULT_DICTATION_G_FILENAME),
        };
        let output = match output {
            Some(path) => path.to_owned(),
            None => self
                .model
                .model_dir()
                .join(DEFAULT_PLAIN_DICTATION_HCLG_FST_FILENAME),
        };
        AgfGraphCompiler::new(tools, graph_model_files(&self.model))
            .compile_plain_dictation(&g_fst, &output)
    }

    /// Decoder-init configuration for the given top FST (and optional
    /// dictation-FST override).
    pub fn decoder_config(
        &self,
        top_fst: &Path,
        dictation_fst: Option<&Path>,
    ) -> Result<DecoderConfig> {
        let phones_file = self.model.file("phones.txt");
        let rules_phones_offset = symbol_table_lookup(phones_file, "#nonterm:rule0")?
            .ok_or_else(|| {
                GrammarError::Config("cannot find #nonterm:rule0 symbol in phones.txt".into())
            })?;
        let dictation_phones_offset = symbol_table_lookup(phones_file, NONTERM_DICTATION)?
            .ok_or_else(|| {
                GrammarError::Config("cannot find #nonterm:dictation symbol in phones.txt".into())
            })?;
        let mfcc_conf = {
            let hires = self.model.find_file("mfcc_hires.conf");
            if hires.is_file() {
                hires
            } else {
                let plain = self.model.find_file("mfcc.conf");
                if plain.is_file() {
                    plain
                } else {
                    return Err(GrammarError::Config(format!(
                        "cannot find mfcc config in {}",
                        self.model.model_dir().display()
                    )));
                }
            }
        };
        let ie_conf = self.model.convert_ie_conf_file()?;
        let dictation_fst = dictation_fst
            .map(Path::to_path_buf)
            .or_else(|| self.dictation_fst_path());
        Ok(DecoderConfig {
            model_dir: self.model.model_dir().display().to_string(),
            mfcc_config_filename: mfcc_conf.display().to_string(),
            ie_config_filename: ie_conf.display().to_string(),
            model_filename: self.model.file("final.mdl").display().to_string(),
            nonterm_phones_offset: self.model.nonterm_phones_offset(),
            rules_phones_offset,
            dictation_phones_offset,
            word_syms_filename: self.model.file("words.txt").display().to_string(),
            word_align_lexicon_filename: self
                .model
                .file("align_lexicon.int")
                .display()
                .to_string(),
            top_fst_filename: top_fst.display().to_string(),
            dictation_fst_filename: dictation_fst
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            max_num_rules: MAX_RULE_ID + 1,
            ..DecoderConfig::default()
        })
    }

    // ── Output parsing ────────────────────────────────────────────────────

    /// Parse one final recognition output into `(rule, words, mask)`.
    ///
    /// When an alternative-dictation recognizer is installed, the rule has
    /// dictation, the output contains a cloud-dictation span, and
    /// `dictation_info` is supplied, the span text is substituted with the
    /// recognizer's transcription of the corresponding audio slice.
    /// Substitution failures are logged and the original text kept.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Parse`] for output missing the
    /// `#nonterm:rule<i>` prefix (an invariant violation).
    pub fn parse_output(
        &self,
        output: &str,
        dictation_info: Option<&DictationInfoFn<'_>>,
    ) -> Result<ParsedOutput> {
        debug!("parse_output({output:?})");
        let Some((rule, mut parsed)) = self.split_rule_prefix(output)? else {
            return Ok(ParsedOutput {
                rule: None,
                words: Vec::new(),
                dictation_mask: Vec::new(),
            });
        };

        if let (Some(recognizer), Some(info)) = (&self.alternative_dictation, dictation_info) {
            if rule.has_dictation() && parsed.contains(NONTERM_DICTATION_CLOUD) {
                match self.substitute_dictation(&parsed, recognizer.as_ref(), info) {
                    Ok(substituted) => parsed = substituted,
                    Err(err) => error!("exception performing alternative dictation: {err}"),
                }
            }
        }

        let (words, dictation_mask, _) = walk_tokens(&parsed);
        Ok(ParsedOutput {
            rule: Some(rule),
            words,
            dictation_mask,
        })
    }

    /// Parse a partial (in-utterance) output; additionally reports whether
    /// the output currently ends inside a dictation span.
    pub fn parse_partial_output(&self, output: &str) -> Result<PartialParsedOutput> {
        let Some((rule, parsed)) = self.split_rule_prefix(output)? else {
            return Ok(PartialParsedOutput {
                rule: None,
                words: Vec::new(),
                dictation_mask: Vec::new(),
                in_dictation: false,
            });
        };
        let (words, dictation_mask, in_dictation) = walk_tokens(&parsed);
        Ok(PartialParsedOutput {
            rule: Some(rule),
            words,
            dictation_mask,
            in_dictation,
        })
    }

    /// Parse a plain text utterance against one rule's grammar via the WFST
    /// matcher. Returns the content words, or `None` when the grammar does
    /// not accept the text.
    pub fn parse_output_for_rule(&self, rule: &GrammarRule, output: &str) -> Option<Vec<String>> {
        let target: Vec<&str> = output.split_whitespace().collect();
        let labels = rule.with_fst(|fst| fst.does_match(&target, &WILDCARD_NONTERMS, false))?;
        let words: Vec<String> = labels
            .into_iter()
            .filter(|label| !label.starts_with("#nonterm:"))
            .collect();
        if words.join(" ").to_lowercase() != output.to_lowercase() {
            error!(
                "parsed output {:?} does not match output {output:?}",
                words.join(" ")
            );
        }
        Some(words)
    }

    fn split_rule_prefix(&self, output: &str) -> Result<Option<(Arc<GrammarRule>, String)>> {
        if output.is_empty() || self.noise_words.contains(output) {
            return Ok(None);
        }
        let (nonterm_token, parsed) = output.split_once(' ').unwrap_or((output, ""));
        let id: u32 = nonterm_token
            .strip_prefix(RULE_NONTERM_PREFIX)
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| {
                GrammarError::Parse(format!("output does not start with a rule: {output:?}"))
            })?;
        let rule = self
            .rules_by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| GrammarError::Parse(format!("unknown rule id {id} in {output:?}")))?;
        Ok(Some((rule, parsed.to_owned())))
    }

    fn substitute_dictation(
        &self,
        parsed: &str,
        recognizer: &dyn AlternativeDictation,
        dictation_info: &DictationInfoFn<'_>,
    ) -> Result<String> {
        let (audio, word_align) = dictation_info()?;
        debug!("alternative dictation word_align: {word_align:?}");
        let words: Vec<&str> = word_align.iter().map(|entry| entry.word.as_str()).collect();
        let times: Vec<usize> = word_align.iter().map(|entry| entry.offset_bytes).collect();

        struct Span {
            offset_start: usize,
            index_end: usize,
            offset_end: usize,
        }
        let mut spans: VecDeque<Span> = VecDeque::new();
        for (index, entry) in word_align.iter().enumerate() {
            if entry.word.starts_with(NONTERM_DICTATION_CLOUD) {
                let index_end = words[index..]
                    .iter()
                    .position(|word| *word == NONTERM_END)
                    .map(|offset| index + offset)
                    .ok_or_else(|| {
                        GrammarError::Parse(format!(
                            "dictation span at alignment index {index} has no {NONTERM_END}"
                        ))
                    })?;
                spans.push_back(Span {
                    offset_start: entry.offset_bytes,
                    index_end,
                    offset_end: times[index_end],
                });
            }
        }
        // The last span either runs to the end of the audio or to the
        // midpoint between its end marker and the next word.
        if let Some(last) = spans.back_mut() {
            if last.index_end == word_align.len() - 1 {
                last.offset_end = audio.len();
            } else {
                last.offset_end = (last.offset_end + times[last.index_end + 1]) / 2;
            }
        }

        let options = TranscribeOptions {
            language_code: Some(self.options.dictation_language.clone()),
        };
        let replaced = dictation_span_regex().replace_all(parsed, |caps: &Captures<'_>| {
            let original = &caps[1];
            let Some(span) = spans.pop_front() else {
                return caps[0].to_owned();
            };
            let start = span.offset_start.min(audio.len());
            let end = span.offset_end.clamp(start, audio.len());
            let started = Instant::now();
            let alternative_text = recognizer.transcribe(&audio[start..end], &options);
            debug!(
                "alternative dictation: {:.2}s audio -> {alternative_text:?} in {:?}",
                crate::decoder::audio_bytes_to_s(end - start),
                started.elapsed()
            );
            let text = match alternative_text {
                Some(text) if !text.is_empty() => text,
                _ => original.to_owned(),
            };
            format!("{NONTERM_DICTATION_CLOUD} {text} {NONTERM_END}")
        });
        Ok(replaced.into_owned())
    }
}

/// Walk tokens into `(words, dictation_mask, in_dictation)`.
fn walk_tokens(parsed: &str) -> (Vec<String>, Vec<bool>, bool) {
    let mut words = Vec::new();
    let mut mask = Vec::new();
    let mut in_dictation = false;
    for token in parsed.split_whitespace() {
        if token.starts_with("#nonterm:") {
            if token.starts_with(NONTERM_DICTATION) {
                in_dictation = true;
            } else if in_dictation && token == NONTERM_END {
                in_dictation = false;
            }
        } else {
            words.push(token.to_owned());
            mask.push(in_dictation);
        }
    }
    (words, mask, in_dictation)
}

fn dictation_span_regex() -> &'static Regex {
    static DICTATION_SPAN_RE: OnceLock<Regex> = OnceLock::new();
    DICTATION_SPAN_RE.get_or_init(|| {
        Regex::new(r"#nonterm:dictation_cloud (.*?) #nonterm:end").expect("static regex")
    })
}

fn destroyed_error(rule: &GrammarRule) -> GrammarError {
    GrammarError::Usage(format!(
        "cannot use rule {} after destroy()",
        rule.name()
    ))
}

fn lock<T>(mutex: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Model file paths the graph backends reference.
pub fn graph_model_files(model: &Model) -> GraphModelFiles {
    GraphModelFiles {
        words_txt: model.file("words.txt").to_owned(),
        disambig_int: model.file("disambig.int").to_owned(),
        tree: model.file("tree").to_owned(),
        final_mdl: model.file("final.mdl").to_owned(),
        l_disambig_fst: model.file("L_disambig.fst").to_owned(),
        nonterm_phones_offset: model.nonterm_phones_offset(),
        nonterm_words_offset: model.nonterm_words_offset(),
    }
}

/// Everything a compile worker needs, snapshotted off the compiler.
struct CompileContext {
    backend: Arc<dyn GraphBackend>,
    cache: Arc<Mutex<FstFileCache>>,
    tmp_dir: PathBuf,
    cache_fsts: bool,
    lexicon_files_stale: Arc<AtomicBool>,
    lexicon_regen_lock: Arc<Mutex<()>>,
    rebuilder: Arc<LexiconRebuilder>,
}

impl CompileContext {
    /// Regenerate the lexicon files at most once per compile pass, no matter
    /// which worker gets here first.
    fn ensure_lexicon_files(&self) -> Result<()> {
        if self.lexicon_files_stale.load(Ordering::Acquire) {
            let _guard = self
                .lexicon_regen_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.lexicon_files_stale.load(Ordering::Acquire) {
                self.rebuilder.generate()?;
                self.lexicon_files_stale.store(false, Ordering::Release);
            }
        }
        Ok(())
    }
}

/// Compile one rule's serialized FST into its artifact. Thread-safe; called
/// from pool workers and from the synchronous compile path.
fn finish_compile(context: &CompileContext, rule: &Arc<GrammarRule>) -> Result<()> {
    context.ensure_lexicon_files().map_err(|err| wrap_compile(rule, &err))?;

    let (fst_text, filename, num_states, num_arcs) = {
        let state = rule.state();
        (
            state.fst_text.clone(),
            state.filename.clone(),
            state.fst.num_states(),
            state.fst.num_arcs(),
        )
    };
    let filename = filename
        .ok_or_else(|| GrammarError::Usage(format!("rule {} was never serialized", rule.name())))?;
    let fst_text = fst_text
        .ok_or_else(|| GrammarError::Usage(format!("rule {} has no FST text", rule.name())))?;
    info!(
        "{rule}: compiling {num_states}-state/{num_arcs}-arc FST ({} bytes) to {filename}",
        fst_text.len()
    );

    let output = context.tmp_dir.join(&filename);
    let request = GraphRequest {
        input: GraphInput::Text(&fst_text),
        output: &output,
        nonterm: rule.is_nonterm(),
        simplify_lg: true,
    };
    context
        .backend
        .compile_graph(&request)
        .map_err(|err| wrap_compile(rule, &err))?;

    if context.cache_fsts {
        let mut cache = lock(&context.cache);
        cache.add_graph(&output);
        cache.save().map_err(|err| wrap_compile(rule, &err))?;
    }

    let mut state = rule.state();
    state.compiled = true;
    state.fst_text = None;
    Ok(())
}

fn wrap_compile(rule: &GrammarRule, err: &GrammarError) -> GrammarError {
    GrammarError::Compile {
        rule: rule.name().to_owned(),
        message: err.to_string(),
    }
}

/// Run `finish_compile` for every rule on a bounded worker pool (worker
/// count = hardware parallelism). Completion order is arbitrary.
fn run_compile_pool(
    context: &CompileContext,
    rules: Vec<Arc<GrammarRule>>,
) -> Vec<(Arc<GrammarRule>, Result<()>)> {
    let worker_count = std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1)
        .min(rules.len().max(1));
    let total = rules.len();
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<Arc<GrammarRule>>();
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    for rule in rules {
        let _ = job_tx.send(rule);
    }
    drop(job_tx);

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                while let Ok(rule) = job_rx.recv() {
                    let result = finish_compile(context, &rule);
                    if done_tx.send((rule, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);
        done_rx.iter().take(total).collect()
    })
}

struct ReloadingGuard {
    rule: Arc<GrammarRule>,
}

impl Drop for ReloadingGuard {
    fn drop(&mut self) {
        self.rule.state().reloading = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_walk_tokens_plain_words() {
        let (words, mask, in_dictation) = walk_tokens("hello there world");
        assert_eq!(words, vec!["hello", "there", "world"]);
        assert_eq!(mask, vec![false, false, false]);
        assert!(!in_dictation);
    }

    #[test]
    fn test_walk_tokens_dictation_scope() {
        let (words, mask, in_dictation) =
            walk_tokens("hello #nonterm:dictation some words #nonterm:end bye");
        assert_eq!(words, vec!["hello", "some", "words", "bye"]);
        assert_eq!(mask, vec![false, true, true, false]);
        assert!(!in_dictation);
    }

    #[test]
    fn test_walk_tokens_unclosed_dictation() {
        let (words, mask, in_dictation) = walk_tokens("hello #nonterm:dictation_cloud more");
        assert_eq!(words, vec!["hello", "more"]);
        assert_eq!(mask, vec![false, true]);
        assert!(in_dictation);
    }

    #[test]
    fn test_dictation_span_regex_is_non_greedy() {
        let replaced = dictation_span_regex().replace_all(
            "#nonterm:dictation_cloud a b #nonterm:end x #nonterm:dictation_cloud c #nonterm:end",
            "<span>",
        );
        assert_eq!(replaced, "<span> x <span>");
    }
}
