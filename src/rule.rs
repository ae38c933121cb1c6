//! One grammar rule: a WFST, its compiled artifact, and lifecycle flags.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::wfst::Wfst;

/// Caller-facing options for a new rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleOptions {
    /// Whether the grammar embeds a dictation non-terminal.
    pub has_dictation: bool,
    /// Whether the grammar is large/complex (advisory).
    pub is_complex: bool,
}

/// Mutable lifecycle state, guarded so compile workers can observe it.
#[derive(Debug)]
pub(crate) struct RuleState {
    /// Decoder-side slot id; `None` for the top FST, which is not a
    /// non-terminal branch. Shifts down when lower-numbered rules are
    /// destroyed.
    pub id: Option<u32>,
    pub fst: Wfst,
    /// Serialized FST text, set before a compile is queued; the compile
    /// worker reads it and clears it once the graph is built.
    pub fst_text: Option<String>,
    /// Artifact filename (`<sha1>.fst`), derived from the FST text.
    pub filename: Option<String>,
    pub compiled: bool,
    pub loaded: bool,
    /// Inside a scoped reload.
    pub reloading: bool,
    /// Was loaded at least once; subsequent loads become in-place reloads.
    pub has_been_loaded: bool,
    /// Destroyed rules reject every operation.
    pub destroyed: bool,
}

/// One grammar rule. Owned by the compiler's id map; shared with the caller
/// and with compile workers.
pub struct GrammarRule {
    name: String,
    /// Stable identity for queue membership; never reused, unlike `id`.
    seq: u64,
    /// Whether the rule is a non-terminal branch of the top FST (false only
    /// for the top FST itself and other standalone graphs).
    nonterm: bool,
    has_dictation: bool,
    is_complex: bool,
    state: Mutex<RuleState>,
}

impl GrammarRule {
    pub(crate) fn new(
        name: &str,
        seq: u64,
        id: Option<u32>,
        nonterm: bool,
        options: RuleOptions,
    ) -> Self {
        Self {
            name: name.to_owned(),
            seq,
            nonterm,
            has_dictation: options.has_dictation,
            is_complex: options.is_complex,
            state: Mutex::new(RuleState {
                id,
                fst: Wfst::new(),
                fst_text: None,
                filename: None,
                compiled: false,
                loaded: false,
                reloading: false,
                has_been_loaded: false,
                destroyed: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn is_nonterm(&self) -> bool {
        self.nonterm
    }

    pub fn has_dictation(&self) -> bool {
        self.has_dictation
    }

    pub fn is_complex(&self) -> bool {
        self.is_complex
    }

    /// Current decoder-side id (`None` for the top FST).
    pub fn id(&self) -> Option<u32> {
        self.state().id
    }

    pub fn is_compiled(&self) -> bool {
        self.state().compiled
    }

    pub fn is_loaded(&self) -> bool {
        self.state().loaded
    }

    pub fn is_reloading(&self) -> bool {
        self.state().reloading
    }

    pub fn has_been_loaded(&self) -> bool {
        self.state().has_been_loaded
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    /// Artifact filename, available once the rule has been serialized.
    pub fn filename(&self) -> Option<String> {
        self.state().filename.clone()
    }

    /// Mutate the rule's WFST. Invalidates any previously serialized text
    /// and artifact filename.
    pub fn edit_fst<R>(&self, edit: impl FnOnce(&mut Wfst) -> R) -> R {
        let mut state = self.state();
        state.fst_text = None;
        state.filename = None;
        edit(&mut state.fst)
    }

    /// Read-only access to the rule's WFST.
    pub fn with_fst<R>(&self, read: impl FnOnce(&Wfst) -> R) -> R {
        read(&self.state().fst)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for GrammarRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarRule")
            .field("name", &self.name)
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for GrammarRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}(#{id})", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
