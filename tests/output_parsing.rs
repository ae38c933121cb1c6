//! Recognition-output parsing: rule selection, dictation masks, partial
//! output, mimic matching, and alternative-dictation substitution.

mod common;

use std::sync::{Arc, Mutex};

use active_grammar::compiler::DictationInfoFn;
use active_grammar::decoder::WordAlignEntry;
use active_grammar::dictation::TranscribeOptions;
use active_grammar::error::GrammarError;
use active_grammar::rule::RuleOptions;
use common::{build_single_word_rule, new_compiler};

#[test]
fn plain_output_selects_the_rule_and_words() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");

    let parsed = compiler.parse_output("#nonterm:rule0 hello", None).unwrap();
    assert_eq!(parsed.rule.unwrap().name(), "TestRule");
    assert_eq!(parsed.words, vec!["hello"]);
    assert_eq!(parsed.dictation_mask, vec![false]);
}

#[test]
fn empty_and_noise_output_parse_to_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));

    for output in ["", "<unk>", "!SIL"] {
        let parsed = compiler.parse_output(output, None).unwrap();
        assert!(parsed.rule.is_none());
        assert!(parsed.words.is_empty());
        assert!(parsed.dictation_mask.is_empty());
    }
}

#[test]
fn output_without_rule_prefix_is_an_invariant_violation() {
    let dir = tempfile::tempdir().unwrap();
    let (compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let err = compiler.parse_output("hello world", None).unwrap_err();
    assert!(matches!(err, GrammarError::Parse(_)));
}

#[test]
fn dictation_mask_toggles_within_the_span() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    compiler
        .add_rule("Dict", RuleOptions { has_dictation: true, is_complex: false })
        .unwrap();

    let parsed = compiler
        .parse_output(
            "#nonterm:rule0 hello #nonterm:dictation some words #nonterm:end world",
            None,
        )
        .unwrap();
    assert_eq!(parsed.words, vec!["hello", "some", "words", "world"]);
    assert_eq!(parsed.dictation_mask, vec![false, true, true, false]);
}

#[test]
fn partial_output_reports_open_dictation() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    compiler
        .add_rule("Dict", RuleOptions { has_dictation: true, is_complex: false })
        .unwrap();

    let parsed = compiler
        .parse_partial_output("#nonterm:rule0 hello #nonterm:dictation_cloud more")
        .unwrap();
    assert_eq!(parsed.words, vec!["hello", "more"]);
    assert_eq!(parsed.dictation_mask, vec![false, true]);
    assert!(parsed.in_dictation);

    let closed = compiler.parse_partial_output("#nonterm:rule0 hello").unwrap();
    assert!(!closed.in_dictation);
}

#[test]
fn alternative_dictation_substitutes_the_span() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let rule = compiler
        .add_rule("Dict", RuleOptions { has_dictation: true, is_complex: false })
        .unwrap();
    assert!(rule.has_dictation());

    let received: Arc<Mutex<Vec<(usize, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_in_callback = received.clone();
    compiler.set_alternative_dictation(Box::new(
        move |audio: &[u8], options: &TranscribeOptions| {
            received_in_callback
                .lock()
                .unwrap()
                .push((audio.len(), options.language_code.clone()));
            Some("ALT".to_owned())
        },
    ));

    // Alignment: hello @0, the cloud marker @960 (dictation audio starts
    // there), original @1920, words @2880, the end marker @3840 closing the
    // utterance, so the span extends to the end of the audio.
    let audio = vec![0u8; 4800];
    let align = vec![
        WordAlignEntry { word: "hello".into(), offset_bytes: 0, length_bytes: 960 },
        WordAlignEntry { word: "#nonterm:dictation_cloud".into(), offset_bytes: 960, length_bytes: 0 },
        WordAlignEntry { word: "original".into(), offset_bytes: 1920, length_bytes: 960 },
        WordAlignEntry { word: "words".into(), offset_bytes: 2880, length_bytes: 960 },
        WordAlignEntry { word: "#nonterm:end".into(), offset_bytes: 3840, length_bytes: 0 },
    ];
    let info = move || Ok((audio.clone(), align.clone()));
    let info: &DictationInfoFn<'_> = &info;

    let parsed = compiler
        .parse_output(
            "#nonterm:rule0 hello #nonterm:dictation_cloud original words #nonterm:end",
            Some(info),
        )
        .unwrap();
    assert_eq!(parsed.words, vec!["hello", "ALT"]);
    assert_eq!(parsed.dictation_mask, vec![false, true]);

    let calls = received.lock().unwrap();
    assert_eq!(calls.len(), 1);
    // Span runs from the cloud marker to the end of the audio.
    assert_eq!(calls[0].0, 4800 - 960);
    assert_eq!(calls[0].1.as_deref(), Some("en-US"));
}

#[test]
fn mid_utterance_span_ends_at_the_midpoint_before_the_next_word() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    compiler
        .add_rule("Dict", RuleOptions { has_dictation: true, is_complex: false })
        .unwrap();

    let received: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let received_in_callback = received.clone();
    compiler.set_alternative_dictation(Box::new(
        move |audio: &[u8], _options: &TranscribeOptions| {
            received_in_callback.lock().unwrap().push(audio.len());
            Some("ALT".to_owned())
        },
    ));

    let audio = vec![0u8; 9600];
    let align = vec![
        WordAlignEntry { word: "#nonterm:dictation_cloud".into(), offset_bytes: 0, length_bytes: 0 },
        WordAlignEntry { word: "original".into(), offset_bytes: 960, length_bytes: 960 },
        WordAlignEntry { word: "#nonterm:end".into(), offset_bytes: 1920, length_bytes: 0 },
        WordAlignEntry { word: "world".into(), offset_bytes: 4800, length_bytes: 960 },
    ];
    let info = move || Ok((audio.clone(), align.clone()));
    let info: &DictationInfoFn<'_> = &info;

    let parsed = compiler
        .parse_output(
            "#nonterm:rule0 #nonterm:dictation_cloud original #nonterm:end world",
            Some(info),
        )
        .unwrap();
    assert_eq!(parsed.words, vec!["ALT", "world"]);
    // Span end is the midpoint of the end marker (1920) and the next word
    // (4800).
    assert_eq!(received.lock().unwrap()[0], (1920 + 4800) / 2);
}

#[test]
fn failing_dictation_info_keeps_the_original_text() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    compiler
        .add_rule("Dict", RuleOptions { has_dictation: true, is_complex: false })
        .unwrap();
    compiler.set_alternative_dictation(Box::new(
        |_audio: &[u8], _options: &TranscribeOptions| Some("ALT".to_owned()),
    ));

    let info = || {
        Err::<(Vec<u8>, Vec<WordAlignEntry>), _>(GrammarError::Decoder("no alignment".into()))
    };
    let info: &DictationInfoFn<'_> = &info;
    let parsed = compiler
        .parse_output(
            "#nonterm:rule0 hello #nonterm:dictation_cloud original #nonterm:end",
            Some(info),
        )
        .unwrap();
    assert_eq!(parsed.words, vec!["hello", "original"]);
    assert_eq!(parsed.dictation_mask, vec![false, true]);
}

#[test]
fn empty_alternative_text_keeps_the_original_text() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    compiler
        .add_rule("Dict", RuleOptions { has_dictation: true, is_complex: false })
        .unwrap();
    compiler.set_alternative_dictation(Box::new(
        |_audio: &[u8], _options: &TranscribeOptions| None,
    ));

    let audio = vec![0u8; 1920];
    let align = vec![
        WordAlignEntry { word: "#nonterm:dictation_cloud".into(), offset_bytes: 0, length_bytes: 0 },
        WordAlignEntry { word: "original".into(), offset_bytes: 0, length_bytes: 960 },
        WordAlignEntry { word: "#nonterm:end".into(), offset_bytes: 960, length_bytes: 0 },
    ];
    let info = move || Ok((audio.clone(), align.clone()));
    let info: &DictationInfoFn<'_> = &info;
    let parsed = compiler
        .parse_output(
            "#nonterm:rule0 #nonterm:dictation_cloud original #nonterm:end",
            Some(info),
        )
        .unwrap();
    assert_eq!(parsed.words, vec!["original"]);
}

#[test]
fn mimic_parsing_matches_against_the_rule_grammar() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let rule = compiler.add_rule("LoopRule", RuleOptions::default()).unwrap();
    rule.edit_fst(|fst| {
        let initial = fst.add_state(None, true, false);
        let loop_state = fst.add_state(None, false, false);
        let final_state = fst.add_state(None, false, true);
        fst.add_arc(initial, loop_state, Some("repeat"), None, None);
        fst.add_arc(loop_state, loop_state, Some("again"), None, None);
        fst.add_arc(loop_state, final_state, Some("done"), None, None);
    });

    let words = compiler
        .parse_output_for_rule(&rule, "repeat again again done")
        .unwrap();
    assert_eq!(words, vec!["repeat", "again", "again", "done"]);
    assert!(compiler.parse_output_for_rule(&rule, "again done").is_none());
}

#[test]
fn universal_grammar_accepts_any_word_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let universal = compiler.compile_universal_grammar(None).unwrap();
    assert!(universal.is_compiled());
    assert!(
        compiler
            .parse_output_for_rule(&universal, "hello world again")
            .is_some()
    );
}
