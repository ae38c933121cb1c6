//! Alternative-dictation bridge: re-transcribe selected dictation spans of
//! an utterance with a user-supplied recognizer.

use std::path::Path;

use crate::decoder::SAMPLE_RATE;
use crate::error::{GrammarError, Result};

/// Options forwarded to the alternative recognizer.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    /// BCP-47 language code, e.g. `en-US`.
    pub language_code: Option<String>,
}

/// A recognizer that can re-transcribe a slice of utterance audio.
///
/// `audio` is 16-bit LE mono PCM at 16 kHz. Returning `None` (or an empty
/// string) keeps the decoder's original text for the span; errors on the
/// implementor's side should be handled internally the same way.
pub trait AlternativeDictation: Send + Sync {
    fn transcribe(&self, audio: &[u8], options: &TranscribeOptions) -> Option<String>;
}

impl<F> AlternativeDictation for F
where
    F: Fn(&[u8], &TranscribeOptions) -> Option<String> + Send + Sync,
{
    fn transcribe(&self, audio: &[u8], options: &TranscribeOptions) -> Option<String> {
        self(audio, options)
    }
}

/// Dump raw utterance audio to a WAV file (16-bit mono, 16 kHz); useful for
/// debugging what a dictation span actually contained.
pub fn write_wav(path: &Path, audio: &[u8]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|err| GrammarError::Io(std::io::Error::other(err)))?;
    for pair in audio.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
            .map_err(|err| GrammarError::Io(std::io::Error::other(err)))?;
    }
    writer
        .finalize()
        .map_err(|err| GrammarError::Io(std::io::Error::other(err)))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
