//! In-memory weighted finite-state transducer used to describe one grammar.
//!
//! Weights are stored as raw probabilities and converted to negative log
//! likelihood on export. Final states carry an explicit `Option<f64>` weight
//! (`None` = non-final) instead of the zero-as-non-final sentinel some FST
//! toolkits use; a raw weight of exactly `0.0` normalizes to non-final so
//! both conventions export identically.

use std::collections::VecDeque;

/// The epsilon label.
pub const EPS: &str = "<eps>";
/// The disambiguation epsilon emitted in place of `<eps>` when requested.
pub const EPS_DISAMBIG: &str = "#0";
/// The silence word.
pub const SIL_WORD: &str = "!SIL";

/// State id within one [`Wfst`]. The start state is always 0.
pub type StateId = u32;

#[derive(Debug, Clone)]
struct WfstArc {
    dst: StateId,
    ilabel: String,
    olabel: String,
    weight: f64,
}

/// A directed multigraph over integer state ids with weighted labeled arcs.
///
/// States are created in id order; arcs are kept per source state in
/// insertion order, which makes [`Wfst::fst_text`] deterministic.
#[derive(Debug, Clone)]
pub struct Wfst {
    arcs: Vec<Vec<WfstArc>>,
    finals: Vec<Option<f64>>,
    num_arcs: usize,
}

impl Default for Wfst {
    fn default() -> Self {
        Self::new()
    }
}

impl Wfst {
    /// Create an empty transducer holding only the start state.
    pub fn new() -> Self {
        Self {
            arcs: vec![Vec::new()],
            finals: vec![None],
            num_arcs: 0,
        }
    }

    /// Reset to a single start state.
    pub fn clear(&mut self) {
        self.arcs.clear();
        self.arcs.push(Vec::new());
        self.finals.clear();
        self.finals.push(None);
        self.num_arcs = 0;
    }

    /// The start state, always 0.
    pub fn start_state(&self) -> StateId {
        0
    }

    pub fn num_states(&self) -> usize {
        self.finals.len()
    }

    pub fn num_arcs(&self) -> usize {
        self.num_arcs
    }

    /// Whether `state` is final (has a finite export weight).
    pub fn is_final(&self, state: StateId) -> bool {
        self.finals[state as usize].is_some()
    }

    /// Add a state and return its id.
    ///
    /// `weight` is a raw probability and implies `is_final`; `is_final`
    /// without a weight defaults to weight one. `initial` additionally
    /// inserts an ε-arc from the start state to the new state.
    pub fn add_state(&mut self, weight: Option<f64>, initial: bool, is_final: bool) -> StateId {
        assert!(
            weight.is_none() || is_final,
            "an explicit state weight requires is_final"
        );
        let final_weight = match weight {
            Some(w) if w != 0.0 => Some(w),
            Some(_) => None,
            None if is_final => Some(1.0),
            None => None,
        };
        let id = self.finals.len() as StateId;
        self.finals.push(final_weight);
        self.arcs.push(Vec::new());
        if initial {
            self.add_arc(self.start_state(), id, None, None, None);
        }
        id
    }

    /// Add an arc. A `None` ilabel becomes `<eps>`; a missing olabel mirrors
    /// the ilabel; a missing weight defaults to one.
    pub fn add_arc(
        &mut self,
        src: StateId,
        dst: StateId,
        ilabel: Option<&str>,
        olabel: Option<&str>,
        weight: Option<f64>,
    ) {
        assert!((src as usize) < self.finals.len(), "arc src state must exist");
        assert!((dst as usize) < self.finals.len(), "arc dst state must exist");
        let ilabel = ilabel.unwrap_or(EPS);
        let olabel = olabel.unwrap_or(ilabel);
        self.arcs[src as usize].push(WfstArc {
            dst,
            ilabel: ilabel.to_owned(),
            olabel: olabel.to_owned(),
            weight: weight.unwrap_or(1.0),
        });
        self.num_arcs += 1;
    }

    /// Deterministic textual encoding: one arc line `src dst ilabel olabel
    /// -ln(w)` per arc (grouped by source state in state order, insertion
    /// order within a group), then one `id -ln(w)` line per final state.
    ///
    /// With `eps2disambig`, `<eps>` ilabels are emitted as `#0`.
    pub fn fst_text(&self, eps2disambig: bool) -> String {
        let mut text = String::new();
        for (src, arcs) in self.arcs.iter().enumerate() {
            for arc in arcs {
                let ilabel = if eps2disambig && arc.ilabel == EPS {
                    EPS_DISAMBIG
                } else {
                    &arc.ilabel
                };
                text.push_str(&format!(
                    "{} {} {} {} {:.6}\n",
                    src,
                    arc.dst,
                    ilabel,
                    arc.olabel,
                    neg_log(arc.weight)
                ));
            }
        }
        for (id, weight) in self.finals.iter().enumerate() {
            if let Some(w) = weight {
                text.push_str(&format!("{} {:.6}\n", id, neg_log(*w)));
            }
        }
        text
    }

    /// Whether `label` is consumed silently: ε, the disambiguation ε, the
    /// silence word, or any non-terminal.
    pub fn label_is_silent(label: &str) -> bool {
        label == EPS || label == EPS_DISAMBIG || label == SIL_WORD || label.starts_with("#nonterm")
    }

    /// Whether there is an ε path from `src` to `dst`. BFS over arcs whose
    /// ilabel is ε-like (`<eps>`, `#0`, or one of `extra_eps_labels`). Does
    /// not follow non-terminals.
    pub fn has_eps_path(&self, src: StateId, dst: StateId, extra_eps_labels: &[&str]) -> bool {
        let is_eps_like = |label: &str| {
            label == EPS || label == EPS_DISAMBIG || extra_eps_labels.contains(&label)
        };
        let mut queue = VecDeque::from([src]);
        let mut queued = vec![false; self.finals.len()];
        queued[src as usize] = true;
        while let Some(state) = queue.pop_front() {
            if state == dst {
                return true;
            }
            for arc in &self.arcs[state as usize] {
                if is_eps_like(&arc.ilabel) && !queued[arc.dst as usize] {
                    queued[arc.dst as usize] = true;
                    queue.push_back(arc.dst);
                }
            }
        }
        false
    }

    /// Return the olabels on a path accepting exactly `target_words`, or
    /// `None` when the transducer does not accept them. BFS.
    ///
    /// Silent labels traverse without consuming input. An ilabel in
    /// `wildcard_nonterms` accepts zero or more words; its olabel is
    /// recorded at most once per path. Silent olabels are filtered from the
    /// result unless `include_silent`.
    pub fn does_match(
        &self,
        target_words: &[&str],
        wildcard_nonterms: &[&str],
        include_silent: bool,
    ) -> Option<Vec<String>> {
        let mut queue: VecDeque<(StateId, Vec<String>, usize)> = VecDeque::new();
        queue.push_back((self.start_state(), Vec::new(), 0));
        while let Some((state, path, index)) = queue.pop_front() {
            let target_word = target_words.get(index).copied();
            if target_word.is_none() && self.is_final(state) {
                return Some(
                    path.into_iter()
                        .filter(|olabel| include_silent || !Self::label_is_silent(olabel))
                        .collect(),
                );
            }
            // The wildcard branch extends `path` in place, so later arcs of
            // the same state see the recorded olabel too.
            let mut path = path;
            for arc in &self.arcs[state as usize] {
                if target_word.is_some() && Some(arc.ilabel.as_str()) == target_word {
                    let mut next = path.clone();
                    next.push(arc.olabel.clone());
                    queue.push_back((arc.dst, next, index + 1));
                } else if wildcard_nonterms.contains(&arc.ilabel.as_str()) {
                    if !path.iter().any(|olabel| *olabel == arc.olabel) {
                        path.push(arc.olabel.clone());
                    }
                    if let Some(word) = target_word {
                        let mut accepted = path.clone();
                        accepted.push(word.to_owned());
                        // Accept the word and stay on the wildcard.
                        queue.push_back((state, accepted, index + 1));
                    }
                    queue.push_back((arc.dst, path.clone(), index));
                } else if Self::label_is_silent(&arc.ilabel) {
                    let mut next = path.clone();
                    next.push(arc.olabel.clone());
                    queue.push_back((arc.dst, next, index));
                }
            }
        }
        None
    }
}

fn neg_log(weight: f64) -> f64 {
    if weight != 0.0 { -weight.ln() } else { f64::INFINITY }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
