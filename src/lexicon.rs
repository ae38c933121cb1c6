//! CMU/ARPAbet → XSAMPA phone mapping and position-dependent phone tagging.

use std::collections::HashSet;

use crate::error::{GrammarError, Result};

/// Fixed CMU → XSAMPA mapping. XSAMPA phones are one letter each, so a
/// two-letter value represents two separate phones unless the model's phone
/// set carries the combined form.
const CMU_TO_XSAMPA: &[(&str, &str)] = &[
    ("AA", "A"),
    ("AE", "{"),
    ("AH", "V"),
    ("AO", "O"),
    ("AW", "aU"),
    ("AX", "@"),
    ("AY", "aI"),
    ("B", "b"),
    ("CH", "tS"),
    ("D", "d"),
    ("DH", "D"),
    ("EH", "E"),
    ("ER", "3"),
    ("EY", "eI"),
    ("F", "f"),
    ("G", "g"),
    ("HH", "h"),
    ("IH", "I"),
    ("IY", "i"),
    ("JH", "dZ"),
    ("K", "k"),
    ("L", "l"),
    ("M", "m"),
    ("N", "n"),
    ("NG", "N"),
    ("OW", "oU"),
    ("OY", "OI"),
    ("P", "p"),
    ("R", "r"),
    ("S", "s"),
    ("SH", "S"),
    ("T", "t"),
    ("TH", "T"),
    ("UH", "U"),
    ("UW", "u"),
    ("V", "v"),
    ("W", "w"),
    ("Y", "j"),
    ("Z", "z"),
    ("ZH", "Z"),
];

const POSITION_TAGS: [&str; 4] = ["_S", "_B", "_I", "_E"];

/// Generates pronunciations for words absent from the base lexicon.
///
/// Implementations return one or more CMU/ARPAbet phone sequences (stress
/// digits allowed). The transport (G2P model, web service, …) is up to the
/// implementor.
pub trait PronunciationGenerator: Send + Sync {
    fn pronounce(&self, word: &str) -> Result<Vec<Vec<String>>>;
}

/// Phone-set-aware CMU → XSAMPA conversion.
#[derive(Debug, Clone)]
pub struct Lexicon {
    /// Position-independent phones known to the model.
    phone_set: HashSet<String>,
}

impl Lexicon {
    /// Build from the model's phone symbols (position-dependent forms are
    /// normalized away).
    pub fn new<'a>(phones: impl IntoIterator<Item = &'a str>) -> Self {
        let phone_set = phones
            .into_iter()
            .map(|phone| make_position_independent(phone))
            .collect();
        Self { phone_set }
    }

    /// Convert CMU phones to XSAMPA, keeping multi-letter phones atomic when
    /// the model's phone set knows them and splitting them otherwise.
    ///
    /// Stress suffix `1` becomes a `'` mark on the next phone; `0` and `2`
    /// are stripped.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Lexicon`] for a CMU phone outside the mapping
    /// table.
    pub fn cmu_to_xsampa(&self, phones: &[&str]) -> Result<Vec<String>> {
        cmu_to_xsampa_generic(phones, Some(&self.phone_set))
    }

    pub fn phone_set(&self) -> &HashSet<String> {
        &self.phone_set
    }
}

/// CMU → XSAMPA without (or with) a model phone set; see
/// [`Lexicon::cmu_to_xsampa`].
pub fn cmu_to_xsampa_generic(
    phones: &[&str],
    lexicon_phones: Option<&HashSet<String>>,
) -> Result<Vec<String>> {
    let mut converted = Vec::with_capacity(phones.len());
    for &phone in phones {
        let (bare, stress) = match phone {
            p if p.ends_with('1') => (&p[..p.len() - 1], true),
            p if p.ends_with('0') || p.ends_with('2') => (&p[..p.len() - 1], false),
            p => (p, false),
        };
        let mapped = CMU_TO_XSAMPA
            .iter()
            .find(|(cmu, _)| *cmu == bare)
            .map(|(_, xsampa)| *xsampa)
            .ok_or_else(|| GrammarError::Lexicon(format!("unknown CMU phone {phone:?}")))?;

        let whole = if stress {
            format!("'{mapped}")
        } else {
            mapped.to_owned()
        };
        if lexicon_phones.is_some_and(|set| set.contains(&whole)) {
            converted.push(whole);
        } else {
            // Split a two-letter phone into one-letter phones; the stress
            // mark stays on the first.
            let mut chars = mapped.chars();
            if let Some(first) = chars.next() {
                converted.push(if stress {
                    format!("'{first}")
                } else {
                    first.to_string()
                });
            }
            for ch in chars {
                converted.push(ch.to_string());
            }
        }
    }
    Ok(converted)
}

/// Tag a phone sequence with word positions: `_S` single, `_B` begin, `_I`
/// internal, `_E` end.
pub fn make_position_dependent(phones: &[String]) -> Vec<String> {
    match phones {
        [] => Vec::new(),
        [only] => vec![format!("{only}_S")],
        [first, middle @ .., last] => {
            let mut tagged = Vec::with_capacity(phones.len());
            tagged.push(format!("{first}_B"));
            for phone in middle {
                tagged.push(format!("{phone}_I"));
            }
            tagged.push(format!("{last}_E"));
            tagged
        }
    }
}

/// Strip a position tag from a phone.
pub fn make_position_independent(phone: &str) -> String {
    for tag in POSITION_TAGS {
        if let Some(stripped) = phone.strip_suffix(tag) {
            return stripped.to_owned();
        }
    }
    phone.to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
