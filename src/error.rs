//! Error types for the grammar control plane.

/// Top-level error type for the active-grammar engine.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    /// Missing model files, incompatible model version, missing reserved
    /// symbols. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// API misuse: operation on a destroyed rule, rule-id overflow,
    /// duplicate id, destroy of a rule with a pending compile.
    #[error("usage error: {0}")]
    Usage(String),

    /// Graph compilation failure, carrying the offending rule's name.
    #[error("compile error for rule {rule}: {message}")]
    Compile { rule: String, message: String },

    /// Lexicon failure: unknown phone, pronunciation generation failure.
    #[error("lexicon error: {0}")]
    Lexicon(String),

    /// Native decoder FFI failure. The decoder may be inconsistent
    /// afterwards; callers should reinitialize it.
    #[error("decoder error: {0}")]
    Decoder(String),

    /// Artifact cache persistence failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Malformed recognizer output (missing `#nonterm:rule<i>` prefix).
    #[error("parse error: {0}")]
    Parse(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GrammarError>;
