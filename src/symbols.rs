//! Word ⇄ id symbol tables, as read from Kaldi `words.txt` / `phones.txt`.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{GrammarError, Result};

/// Prefix of all non-terminal symbols (`#nonterm_begin`, `#nonterm:rule0`, …).
pub const NONTERM_PREFIX: &str = "#nonterm";

/// Bidirectional word ⇄ id map backed by a Kaldi symbol-table file.
///
/// Tracks the highest id among ordinary (non-`#nonterm`) words so new words
/// can be appended without colliding with the reserved non-terminal block.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    word_to_id: HashMap<String, u32>,
    id_to_word: HashMap<u32, String>,
    max_term_word_id: u32,
}

impl SymbolTable {
    /// Load a symbol table from a `word id` per-line UTF-8 file.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Config`] on malformed lines or duplicate ids,
    /// and [`GrammarError::Io`] if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut table = Self::default();
        for line in content.lines() {
            let mut tokens = line.split_whitespace();
            let (Some(word), Some(id)) = (tokens.next(), tokens.next()) else {
                return Err(GrammarError::Config(format!(
                    "malformed symbol table line {line:?} in {}",
                    path.display()
                )));
            };
            let id: u32 = id.parse().map_err(|_| {
                GrammarError::Config(format!(
                    "non-numeric symbol id {id:?} in {}",
                    path.display()
                ))
            })?;
            table.insert(word, id)?;
        }
        Ok(table)
    }

    fn insert(&mut self, word: &str, id: u32) -> Result<()> {
        if let Some(existing) = self.id_to_word.get(&id) {
            if existing != word {
                return Err(GrammarError::Config(format!(
                    "symbol id {id} assigned to both {existing:?} and {word:?}"
                )));
            }
        }
        self.word_to_id.insert(word.to_owned(), id);
        self.id_to_word.insert(id, word.to_owned());
        if !word.starts_with(NONTERM_PREFIX) {
            self.max_term_word_id = self.max_term_word_id.max(id);
        }
        Ok(())
    }

    /// Add a word, allocating the next free ordinary-word id unless one is
    /// given explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Config`] if the explicit id is already taken
    /// by a different word.
    pub fn add_word(&mut self, word: &str, id: Option<u32>) -> Result<u32> {
        let id = match id {
            Some(id) => id,
            None => self.max_term_word_id + 1,
        };
        self.insert(word, id)?;
        Ok(id)
    }

    pub fn contains(&self, word: &str) -> bool {
        self.word_to_id.contains_key(word)
    }

    pub fn lookup(&self, word: &str) -> Option<u32> {
        self.word_to_id.get(word).copied()
    }

    /// Reverse lookup: id → word.
    pub fn reverse(&self, id: u32) -> Option<&str> {
        self.id_to_word.get(&id).map(String::as_str)
    }

    /// Highest id among ordinary (non-`#nonterm`) words.
    pub fn max_term_word_id(&self) -> u32 {
        self.max_term_word_id
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.word_to_id.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.word_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_to_id.is_empty()
    }
}

/// Look up one symbol's id in a symbol-table file without loading the whole
/// table.
pub fn symbol_table_lookup(path: &Path, symbol: &str) -> Result<Option<u32>> {
    let content = std::fs::read_to_string(path)?;
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if let (Some(word), Some(id)) = (tokens.next(), tokens.next()) {
            if word == symbol {
                let id = id.parse().map_err(|_| {
                    GrammarError::Config(format!(
                        "non-numeric id for symbol {symbol:?} in {}",
                        path.display()
                    ))
                })?;
                return Ok(Some(id));
            }
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::io::Write;

    fn write_table(lines: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(lines.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_lookup() {
        let file = write_table("<eps> 0\nhello 1\nworld 2\n#0 3\n#nonterm_begin 4\n");
        let table = SymbolTable::load(file.path()).unwrap();
        assert_eq!(table.lookup("<eps>"), Some(0));
        assert_eq!(table.lookup("hello"), Some(1));
        assert_eq!(table.reverse(2), Some("world"));
        assert!(table.contains("#0"));
        assert!(!table.contains("missing"));
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_max_term_word_id_skips_nonterms() {
        let file = write_table("<eps> 0\nhello 1\n#nonterm_begin 10\n#nonterm:rule0 11\n");
        let table = SymbolTable::load(file.path()).unwrap();
        assert_eq!(table.max_term_word_id(), 1);
    }

    #[test]
    fn test_add_word_allocates_next_id() {
        let file = write_table("<eps> 0\nhello 1\n#nonterm_begin 10\n");
        let mut table = SymbolTable::load(file.path()).unwrap();
        let id = table.add_word("world", None).unwrap();
        assert_eq!(id, 2);
        assert_eq!(table.lookup("world"), Some(2));
        assert_eq!(table.max_term_word_id(), 2);
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let file = write_table("<eps> 0\nhello 1\n");
        let mut table = SymbolTable::load(file.path()).unwrap();
        let err = table.add_word("world", Some(1)).unwrap_err();
        assert!(matches!(err, GrammarError::Config(_)));
    }

    #[test]
    fn test_symbol_table_lookup() {
        let file = write_table("<eps> 0\n#nonterm_bos 321\n");
        assert_eq!(
            symbol_table_lookup(file.path(), "#nonterm_bos").unwrap(),
            Some(321)
        );
        assert_eq!(symbol_table_lookup(file.path(), "absent").unwrap(), None);
    }
}
