//! Model-directory resolution, the user lexicon, and lexicon file
//! regeneration.
//!
//! A model directory holds the acoustic model, the lexicon FST and the
//! symbol tables the graph compiler composes against. Read-only `.base.*`
//! companions of the mutable lexicon files are the originals; the mutable
//! copies are regenerated whenever the user lexicon changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cache::FstFileCache;
use crate::error::{GrammarError, Result};
use crate::graph::{LexiconFstFiles, ToolPaths, rebuild_lexicon_fst};
use crate::lexicon::{Lexicon, PronunciationGenerator, make_position_dependent};
use crate::symbols::{SymbolTable, symbol_table_lookup};
use crate::wfst::EPS;

/// Model format version this crate understands (`KAG_VERSION` file).
pub const REQUIRED_MODEL_VERSION: &str = "0.5.0";
/// Artifact-cache index filename inside the tmp dir.
pub const FILE_CACHE_FILENAME: &str = "file_cache.json";
/// Statistical dictation grammar (input to dictation graph compilation).
pub const DEFAULT_DICTATION_G_FILENAME: &str = "G.fst";
/// Pre-compiled dictation HCLG fragment linkable as a non-terminal branch.
pub const DEFAULT_DICTATION_FST_FILENAME: &str = "Dictation.fst";
/// Pre-compiled plain-dictation HCLG.
pub const DEFAULT_PLAIN_DICTATION_HCLG_FST_FILENAME: &str = "HCLG.fst";

const TMP_DIR_SUFFIX: &str = "_cache";
const VERSION_FILENAME: &str = "KAG_VERSION";

/// Lexicon files that must match the cache for compiled graphs to be reused.
const LEXICON_FILES: [&str; 5] = [
    "user_lexicon.txt",
    "words.txt",
    "align_lexicon.int",
    "lexiconp_disambig.txt",
    "L_disambig.fst",
];

/// Names resolved within the model directory tree at startup.
const MODEL_FILE_NAMES: [&str; 16] = [
    "words.txt",
    "words.base.txt",
    "phones.txt",
    "align_lexicon.int",
    "align_lexicon.base.int",
    "disambig.int",
    "L_disambig.fst",
    "tree",
    "final.mdl",
    "user_lexicon.txt",
    "left_context_phones.txt",
    "nonterminals.txt",
    "wdisambig_phones.int",
    "wdisambig_words.int",
    "lexiconp_disambig.txt",
    "lexiconp_disambig.base.txt",
];

/// A loaded Kaldi AGF model directory.
pub struct Model {
    model_dir: PathBuf,
    tmp_dir: PathBuf,
    files: BTreeMap<String, PathBuf>,
    fst_cache: Arc<Mutex<FstFileCache>>,
    phone_to_id: HashMap<String, u32>,
    lexicon: Lexicon,
    nonterm_phones_offset: u32,
    nonterm_words_offset: u32,
    words_table: SymbolTable,
    lexicon_words: HashSet<String>,
    longest_word: String,
    pronunciation_generator: Option<Box<dyn PronunciationGenerator>>,
}

impl Model {
    /// Open `model_dir`, creating the tmp dir and any regenerable files, and
    /// validate the model version and reserved symbols.
    ///
    /// `tools` is needed only when the lexicon FST must be rebuilt at open
    /// time (a non-empty user lexicon with stale generated files).
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Config`] for a missing or incompatible model.
    pub fn new(
        model_dir: &Path,
        tmp_dir: Option<&Path>,
        tools: Option<&ToolPaths>,
    ) -> Result<Self> {
        if !model_dir.is_dir() {
            return Err(GrammarError::Config(format!(
                "cannot find model_dir: {}",
                model_dir.display()
            )));
        }
        let tmp_dir = match tmp_dir {
            Some(dir) => dir.to_owned(),
            None => {
                let mut name = model_dir.as_os_str().to_owned();
                name.push(TMP_DIR_SUFFIX);
                PathBuf::from(name)
            }
        };
        if tmp_dir.is_file() {
            return Err(GrammarError::Config(format!(
                "please specify an available tmp_dir, or remove {}",
                tmp_dir.display()
            )));
        }
        if !tmp_dir.exists() {
            warn!("creating tmp dir: {}", tmp_dir.display());
            std::fs::create_dir_all(&tmp_dir)?;
            std::fs::write(tmp_dir.join("FILES_ARE_SAFE_TO_DELETE"), b"")?;
        }

        check_model_version(model_dir)?;
        create_missing_files(model_dir)?;

        let mut files = BTreeMap::new();
        for name in MODEL_FILE_NAMES {
            files.insert(name.to_owned(), find_file(model_dir, name));
        }

        let cache_path = tmp_dir.join(FILE_CACHE_FILENAME);
        let fst_cache = Arc::new(Mutex::new(FstFileCache::open(
            &cache_path,
            files.clone(),
            false,
        )));

        let phones_table = SymbolTable::load(&files["phones.txt"])?;
        let phone_to_id: HashMap<String, u32> = phones_table
            .words()
            .filter_map(|phone| phones_table.lookup(phone).map(|id| (phone.to_owned(), id)))
            .collect();
        let lexicon = Lexicon::new(phone_to_id.keys().map(String::as_str));
        let nonterm_phones_offset = symbol_table_lookup(&files["phones.txt"], "#nonterm_bos")?
            .ok_or_else(|| GrammarError::Config("missing nonterms in 'phones.txt'".into()))?;
        let nonterm_words_offset =
            symbol_table_lookup(&files["words.base.txt"], "#nonterm_begin")?.ok_or_else(|| {
                GrammarError::Config("missing nonterms in 'words.base.txt'".into())
            })?;

        let mut model = Self {
            model_dir: model_dir.to_owned(),
            tmp_dir,
            files,
            fst_cache,
            phone_to_id,
            lexicon,
            nonterm_phones_offset,
            nonterm_words_offset,
            words_table: SymbolTable::default(),
            lexicon_words: HashSet::new(),
            longest_word: String::new(),
            pronunciation_generator: None,
        };

        // Regenerate the lexicon files before loading words when the cache
        // cannot vouch for them.
        let must_generate = {
            let cache = lock(&model.fst_cache);
            cache.is_new()
                || !LEXICON_FILES
                    .iter()
                    .all(|name| cache.file_is_current(&model.files[*name], None))
        };
        if must_generate {
            model.generate_lexicon_files(tools)?;
            let mut cache = lock(&model.fst_cache);
            cache.update_dependencies();
            cache.save()?;
        }

        model.load_words()?;
        Ok(model)
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Resolved path of a model file by its well-known name.
    ///
    /// Panics for names outside the fixed model-file set (a programming
    /// error).
    pub fn file(&self, name: &str) -> &Path {
        &self.files[name]
    }

    pub fn files(&self) -> &BTreeMap<String, PathBuf> {
        &self.files
    }

    pub fn fst_cache(&self) -> &Arc<Mutex<FstFileCache>> {
        &self.fst_cache
    }

    pub fn phone_to_id(&self) -> &HashMap<String, u32> {
        &self.phone_to_id
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    pub fn nonterm_phones_offset(&self) -> u32 {
        self.nonterm_phones_offset
    }

    pub fn nonterm_words_offset(&self) -> u32 {
        self.nonterm_words_offset
    }

    pub fn words_table(&self) -> &SymbolTable {
        &self.words_table
    }

    /// Ordinary words usable in grammars (reserved and non-terminal symbols
    /// excluded).
    pub fn lexicon_words(&self) -> &HashSet<String> {
        &self.lexicon_words
    }

    pub fn longest_word(&self) -> &str {
        &self.longest_word
    }

    pub fn set_pronunciation_generator(&mut self, generator: Box<dyn PronunciationGenerator>) {
        self.pronunciation_generator = Some(generator);
    }

    /// (Re)load `words.txt` into the symbol table and word set.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Config`] when the lexicon is empty or the
    /// reserved `<eps>`/`#0` symbols are missing or misnumbered.
    pub fn load_words(&mut self) -> Result<()> {
        let words_file = self.files["words.txt"].clone();
        debug!("loading words from {}", words_file.display());
        self.words_table = SymbolTable::load(&words_file)?;
        if self.words_table.lookup(EPS) != Some(0) {
            return Err(GrammarError::Config(format!(
                "{EPS:?} must have id 0 in {}",
                words_file.display()
            )));
        }
        if !self.words_table.contains("#0") {
            return Err(GrammarError::Config(format!(
                "missing \"#0\" in {}",
                words_file.display()
            )));
        }

        let invalid_words = ["<eps>", "!sil", "<unk>", "#0", "<s>", "</s>"];
        self.lexicon_words = self
            .words_table
            .words()
            .filter(|word| {
                !invalid_words.contains(&word.to_lowercase().as_str())
                    && !word.starts_with("#nonterm")
            })
            .map(str::to_owned)
            .collect();
        if self.lexicon_words.is_empty() {
            return Err(GrammarError::Config(format!(
                "empty lexicon from {}",
                words_file.display()
            )));
        }
        self.longest_word = self
            .lexicon_words
            .iter()
            .max_by_key(|word| word.len())
            .cloned()
            .unwrap_or_default();
        Ok(())
    }

    /// Read the user lexicon: one `(word, phones…)` entry per non-blank
    /// line, words lower-cased.
    pub fn read_user_lexicon(&self) -> Result<Vec<(String, Vec<String>)>> {
        read_user_lexicon_file(&self.files["user_lexicon.txt"])
    }

    fn write_user_lexicon(&self, entries: &[(String, Vec<String>)]) -> Result<()> {
        let mut lines: Vec<String> = entries
            .iter()
            .map(|(word, phones)| format!("{word} {}\n", phones.join(" ")))
            .collect();
        lines.sort();
        std::fs::write(&self.files["user_lexicon.txt"], lines.concat())?;
        Ok(())
    }

    /// Add `word` to the user lexicon.
    ///
    /// With explicit CMU `phones` they are normalized to XSAMPA; without,
    /// the configured pronunciation generator is consulted. Returns the
    /// XSAMPA pronunciations added. A duplicate `(word, phones)` entry is a
    /// warning and a no-op; the same word with different phones warns and
    /// appends.
    ///
    /// The lexicon files are *not* regenerated here; callers schedule that
    /// separately.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Lexicon`] for unknown phones or when no
    /// pronunciation generator is configured.
    pub fn add_word(&mut self, word: &str, phones: Option<&[&str]>) -> Result<Vec<Vec<String>>> {
        let word = word.trim().to_lowercase();
        let Some(phones) = phones else {
            let generated = match &self.pronunciation_generator {
                Some(generator) => generator.pronounce(&word)?,
                None => {
                    return Err(GrammarError::Lexicon(format!(
                        "cannot generate pronunciation for {word:?}: no generator configured"
                    )));
                }
            };
            let mut added = Vec::new();
            for pronunciation in generated {
                let phones: Vec<&str> = pronunciation.iter().map(String::as_str).collect();
                added.extend(self.add_word(&word, Some(&phones))?);
            }
            return Ok(added);
        };

        let phones = self.lexicon.cmu_to_xsampa(phones)?;
        let new_entry = (word.clone(), phones.clone());
        let mut entries = self.read_user_lexicon()?;
        if entries.contains(&new_entry) {
            warn!("word & pronunciation already in user_lexicon: {word:?}");
            return Ok(vec![phones]);
        }
        for (existing, existing_phones) in &entries {
            if *existing == word {
                warn!(
                    "word (with different pronunciation) already in user_lexicon: {existing_phones:?}"
                );
            }
        }
        entries.push(new_entry);
        self.write_user_lexicon(&entries)?;
        self.lexicon_words.insert(word);
        Ok(vec![phones])
    }

    /// Regenerate `words.txt`, `align_lexicon.int`, `lexiconp_disambig.txt`
    /// and `L_disambig.fst` from the base files plus the user lexicon.
    pub fn generate_lexicon_files(&self, tools: Option<&ToolPaths>) -> Result<()> {
        self.lexicon_rebuilder(tools.cloned()).generate()
    }

    /// Truncate the user lexicon and regenerate the lexicon files.
    pub fn reset_user_lexicon(&mut self, tools: Option<&ToolPaths>) -> Result<()> {
        std::fs::write(&self.files["user_lexicon.txt"], b"")?;
        self.generate_lexicon_files(tools)?;
        self.load_words()
    }

    /// Snapshot everything lexicon regeneration needs, for use off the main
    /// thread.
    pub(crate) fn lexicon_rebuilder(&self, tools: Option<ToolPaths>) -> LexiconRebuilder {
        LexiconRebuilder {
            files: self.files.clone(),
            phone_to_id: self.phone_to_id.clone(),
            nonterm_words_offset: self.nonterm_words_offset,
            tools,
        }
    }

    /// Rewrite `ivector_extractor.conf` into the tmp dir with its relative
    /// paths resolved to absolute ones, returning the new path.
    pub fn convert_ie_conf_file(&self) -> Result<PathBuf> {
        let old_path = find_file(&self.model_dir, "ivector_extractor.conf");
        if !old_path.is_file() {
            return Err(GrammarError::Config(format!(
                "cannot find ivector_extractor.conf in {}",
                self.model_dir.display()
            )));
        }
        let options_with_path = [
            ("--splice-config", "splice.conf"),
            ("--cmvn-config", "online_cmvn.conf"),
            ("--lda-matrix", "final.mat"),
            ("--global-cmvn-stats", "global_cmvn.stats"),
            ("--diag-ubm", "final.dubm"),
            ("--ivector-extractor", "final.ie"),
        ];
        let new_path = self.tmp_dir.join("ivector_extractor.conf");
        let mut rewritten = String::new();
        for line in std::fs::read_to_string(&old_path)?.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = match options_with_path.iter().find(|(option, _)| *option == key) {
                Some((_, filename)) => {
                    let found = find_file(&self.model_dir, filename);
                    if !found.is_file() {
                        return Err(GrammarError::Config(format!(
                            "cannot find {filename:?} in {}",
                            self.model_dir.display()
                        )));
                    }
                    found.display().to_string()
                }
                None => value.to_owned(),
            };
            rewritten.push_str(&format!("{key}={value}\n"));
        }
        std::fs::write(&new_path, rewritten)?;
        Ok(new_path)
    }

    /// Locate a file by name anywhere under the model directory, defaulting
    /// to `model_dir/name`.
    pub fn find_file(&self, name: &str) -> PathBuf {
        find_file(&self.model_dir, name)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("model_dir", &self.model_dir)
            .field("tmp_dir", &self.tmp_dir)
            .finish_non_exhaustive()
    }
}

/// Off-main-thread lexicon file regeneration (see
/// [`Model::lexicon_rebuilder`]).
pub(crate) struct LexiconRebuilder {
    files: BTreeMap<String, PathBuf>,
    phone_to_id: HashMap<String, u32>,
    nonterm_words_offset: u32,
    tools: Option<ToolPaths>,
}

impl LexiconRebuilder {
    pub(crate) fn generate(&self) -> Result<()> {
        info!("generating lexicon files");
        let base_words = std::fs::read_to_string(base_filepath(&self.files["words.txt"]))?;
        let mut max_word_id = 0u32;
        for line in base_words.lines() {
            let mut tokens = line.split_whitespace();
            if let (Some(_), Some(id)) = (tokens.next(), tokens.next()) {
                if let Ok(id) = id.parse::<u32>() {
                    if id < self.nonterm_words_offset {
                        max_word_id = max_word_id.max(id);
                    }
                }
            }
        }

        let mut user_entries: Vec<(String, u32, Vec<String>)> = Vec::new();
        for (word, phones) in read_user_lexicon_file(&self.files["user_lexicon.txt"])? {
            let phones = make_position_dependent(&phones);
            let unknown: Vec<&String> = phones
                .iter()
                .filter(|phone| !self.phone_to_id.contains_key(*phone))
                .collect();
            if !unknown.is_empty() {
                return Err(GrammarError::Lexicon(format!(
                    "word {word:?} has unknown phone(s) {unknown:?}"
                )));
            }
            max_word_id += 1;
            user_entries.push((word, max_word_id, phones));
        }

        self.generate_file_from_base("words.txt", &user_entries, |word, id, _| {
            format!("{word} {id}")
        })?;
        self.generate_file_from_base("align_lexicon.int", &user_entries, |_, id, phones| {
            let phone_ids: Vec<String> = phones
                .iter()
                .map(|phone| self.phone_to_id[phone].to_string())
                .collect();
            format!("{id} {id} {}", phone_ids.join(" "))
        })?;
        self.generate_file_from_base("lexiconp_disambig.txt", &user_entries, |word, _, phones| {
            format!("{word}\t1.0 {}", phones.join(" "))
        })?;

        // With no user entries the base L_disambig.fst is already correct;
        // skip the external rebuild when it is present.
        if user_entries.is_empty() && self.files["L_disambig.fst"].is_file() {
            return Ok(());
        }
        let Some(tools) = &self.tools else {
            return Err(GrammarError::Config(
                "lexicon FST rebuild required but external tools are unavailable".into(),
            ));
        };
        rebuild_lexicon_fst(
            tools,
            &LexiconFstFiles {
                lexiconp_disambig_txt: self.files["lexiconp_disambig.txt"].clone(),
                phones_txt: self.files["phones.txt"].clone(),
                words_txt: self.files["words.txt"].clone(),
                wdisambig_phones_int: self.files["wdisambig_phones.int"].clone(),
                wdisambig_words_int: self.files["wdisambig_words.int"].clone(),
                left_context_phones_txt: self.files["left_context_phones.txt"].clone(),
                nonterminals_txt: self.files["nonterminals.txt"].clone(),
                l_disambig_fst: self.files["L_disambig.fst"].clone(),
            },
        )
    }

    fn generate_file_from_base(
        &self,
        name: &str,
        user_entries: &[(String, u32, Vec<String>)],
        write_line: impl Fn(&str, u32, &[String]) -> String,
    ) -> Result<()> {
        let path = &self.files[name];
        let mut content = std::fs::read_to_string(base_filepath(path))?;
        for (word, id, phones) in user_entries {
            content.push_str(&write_line(word, *id, phones));
            content.push('\n');
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn check_model_version(model_dir: &Path) -> Result<()> {
    let version_file = model_dir.join(VERSION_FILENAME);
    if !version_file.is_file() {
        warn!("model_dir has no version information; errors may indicate an incompatible model");
        return Ok(());
    }
    let version = std::fs::read_to_string(&version_file)?;
    if version.trim() != REQUIRED_MODEL_VERSION {
        return Err(GrammarError::Config(format!(
            "invalid model_dir version {:?} (need {REQUIRED_MODEL_VERSION:?}); \
             please download a compatible model",
            version.trim()
        )));
    }
    Ok(())
}

/// Create regenerable files missing from a freshly downloaded model.
fn create_missing_files(model_dir: &Path) -> Result<()> {
    let user_lexicon = find_file(model_dir, "user_lexicon.txt");
    if !user_lexicon.is_file() {
        std::fs::write(&user_lexicon, b"")?;
    }
    for (name, base_name) in [
        ("words.txt", "words.base.txt"),
        ("align_lexicon.int", "align_lexicon.base.int"),
        ("lexiconp_disambig.txt", "lexiconp_disambig.base.txt"),
    ] {
        let path = find_file(model_dir, name);
        if !path.is_file() {
            let base = find_file(model_dir, base_name);
            if base.is_file() {
                std::fs::copy(&base, &path)?;
            }
        }
    }
    Ok(())
}

/// Recursively locate `name` under `directory`, preferring the shallowest
/// match; falls back to `directory/name`.
pub(crate) fn find_file(directory: &Path, name: &str) -> PathBuf {
    fn walk(dir: &Path, name: &str, matches: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, name, matches);
            } else if entry.file_name().to_str() == Some(name) {
                matches.push(path);
            }
        }
    }
    let mut matches = Vec::new();
    walk(directory, name, &mut matches);
    matches.sort_by_key(|path| path.as_os_str().len());
    match matches.into_iter().next() {
        Some(path) => path,
        None => directory.join(name),
    }
}

fn read_user_lexicon_file(path: &Path) -> Result<Vec<(String, Vec<String>)>> {
    let content = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if let Some(word) = tokens.next() {
            entries.push((
                word.to_lowercase(),
                tokens.map(str::to_owned).collect::<Vec<String>>(),
            ));
        }
    }
    Ok(entries)
}

fn base_filepath(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let ext = path.extension().and_then(|s| s.to_str());
    let base_name = match ext {
        Some(ext) => format!("{stem}.base.{ext}"),
        None => format!("{stem}.base"),
    };
    path.with_file_name(base_name)
}

fn lock<T>(mutex: &Arc<Mutex<T>>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
