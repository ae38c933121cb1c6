//! Rule lifecycle: compile, queue processing, load order, id compaction,
//! scoped reload, and cache behavior across restarts.

mod common;

use active_grammar::cache::FstFileCache;
use active_grammar::error::GrammarError;
use active_grammar::rule::RuleOptions;
use common::{attach_mock_decoder, build_single_word_rule, new_compiler, new_compiler_reusing_model};

#[test]
fn simple_rule_compiles_and_loads_into_slot_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let decoder_log = attach_mock_decoder(&mut compiler);

    let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
    assert_eq!(rule.id(), Some(0));
    build_single_word_rule(&rule, "hello");

    compiler.compile_rule(&rule, false).unwrap();
    assert!(rule.is_compiled());
    let filename = rule.filename().unwrap();
    assert!(filename.ends_with(".fst"));
    assert_eq!(filename.len(), 40 + ".fst".len());
    assert!(compiler.rule_filepath(&rule).unwrap().is_file());
    assert_eq!(backend.compile_count(), 1);
    {
        let record = &backend.compiles.lock().unwrap()[0];
        assert!(record.nonterm);
        assert!(record.simplify_lg);
        assert!(record.from_text);
    }

    compiler.load_rule(&rule, false).unwrap();
    assert!(rule.is_loaded());
    let log = decoder_log.lock().unwrap();
    assert_eq!(log.added.len(), 1);
    assert!(log.added[0].ends_with(&filename));
}

#[test]
fn identical_rules_share_one_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let decoder_log = attach_mock_decoder(&mut compiler);

    let first = compiler.add_rule("First", RuleOptions::default()).unwrap();
    let second = compiler.add_rule("Second", RuleOptions::default()).unwrap();
    let third = compiler.add_rule("Third", RuleOptions::default()).unwrap();
    build_single_word_rule(&first, "hello");
    build_single_word_rule(&second, "hello");
    build_single_word_rule(&third, "world");

    for rule in [&first, &second, &third] {
        compiler.compile_rule(rule, true).unwrap();
        compiler.load_rule(rule, true).unwrap();
    }
    assert!(compiler.pending_compile(&first));
    assert!(compiler.pending_compile(&second));
    assert_eq!(first.filename(), second.filename());
    assert_ne!(first.filename(), third.filename());

    compiler.process_compile_and_load_queues().unwrap();

    // The duplicate resolved via the cache: two distinct artifacts compiled.
    assert_eq!(backend.compile_count(), 2);
    for rule in [&first, &second, &third] {
        assert!(rule.is_compiled());
        assert!(rule.is_loaded());
        assert!(!compiler.pending_compile(rule));
        assert!(!compiler.pending_load(rule));
    }
    // Loads happened in ascending id order, filling slots 0, 1, 2.
    let log = decoder_log.lock().unwrap();
    assert_eq!(log.added.len(), 3);
    assert!(log.added[0].ends_with(&first.filename().unwrap()));
    assert!(log.added[1].ends_with(&second.filename().unwrap()));
    assert!(log.added[2].ends_with(&third.filename().unwrap()));
}

#[test]
fn destroy_compacts_the_id_space() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let decoder_log = attach_mock_decoder(&mut compiler);

    let a = compiler.add_rule("A", RuleOptions::default()).unwrap();
    let b = compiler.add_rule("B", RuleOptions::default()).unwrap();
    let c = compiler.add_rule("C", RuleOptions::default()).unwrap();
    for (rule, word) in [(&a, "hello"), (&b, "world"), (&c, "say")] {
        build_single_word_rule(rule, word);
        compiler.compile_rule(rule, false).unwrap();
        compiler.load_rule(rule, false).unwrap();
    }
    assert_eq!((a.id(), b.id(), c.id()), (Some(0), Some(1), Some(2)));

    compiler.destroy_rule(&b).unwrap();
    assert!(b.is_destroyed());
    assert_eq!(a.id(), Some(0));
    assert_eq!(c.id(), Some(1));
    assert_eq!(compiler.num_rules(), 2);
    assert_eq!(decoder_log.lock().unwrap().removed, vec![1]);
    assert!(compiler.rule_by_id(1).unwrap().name() == "C");

    let d = compiler.add_rule("D", RuleOptions::default()).unwrap();
    assert_eq!(d.id(), Some(2));

    // Destroyed rules reject every operation.
    let err = compiler.compile_rule(&b, false).unwrap_err();
    assert!(matches!(err, GrammarError::Usage(_)));
}

#[test]
fn destroy_is_rejected_while_a_compile_is_pending() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));

    let rule = compiler.add_rule("Pending", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");
    compiler.compile_rule(&rule, true).unwrap();

    let err = compiler.destroy_rule(&rule).unwrap_err();
    assert!(matches!(err, GrammarError::Usage(_)));
    assert!(!rule.is_destroyed());
}

#[test]
fn scoped_reload_swaps_the_grammar_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let decoder_log = attach_mock_decoder(&mut compiler);

    let rule = compiler.add_rule("Reloadable", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");
    compiler.compile_rule(&rule, false).unwrap();
    compiler.load_rule(&rule, false).unwrap();
    let old_filename = rule.filename().unwrap();

    compiler
        .reload_rule(&rule, |compiler| {
            assert!(rule.is_reloading());
            build_single_word_rule(&rule, "world");
            compiler.compile_rule(&rule, false)
        })
        .unwrap();

    assert!(!rule.is_reloading());
    assert!(rule.is_compiled());
    assert!(rule.is_loaded());
    assert_ne!(rule.filename().unwrap(), old_filename);
    let log = decoder_log.lock().unwrap();
    assert_eq!(log.reloaded.len(), 1);
    assert_eq!(log.reloaded[0].0, 0);
}

#[test]
fn scoped_reload_with_lazy_compile_queues_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let decoder_log = attach_mock_decoder(&mut compiler);

    let rule = compiler.add_rule("Reloadable", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");
    compiler.compile_rule(&rule, false).unwrap();
    compiler.load_rule(&rule, false).unwrap();

    compiler
        .reload_rule(&rule, |compiler| {
            build_single_word_rule(&rule, "world");
            compiler.compile_rule(&rule, true)
        })
        .unwrap();
    assert!(!rule.is_loaded());
    assert!(compiler.pending_load(&rule));

    compiler.prepare_for_recognition().unwrap();
    assert!(rule.is_loaded());
    assert_eq!(decoder_log.lock().unwrap().reloaded.len(), 1);
}

#[test]
fn reloading_flag_is_restored_when_rebuild_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));

    let rule = compiler.add_rule("Reloadable", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");
    compiler.compile_rule(&rule, false).unwrap();

    let err = compiler
        .reload_rule(&rule, |_compiler| {
            Err(GrammarError::Usage("rebuild failed".into()))
        })
        .unwrap_err();
    assert!(matches!(err, GrammarError::Usage(_)));
    assert!(!rule.is_reloading());
}

#[test]
fn cache_hit_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let tmp_dir = dir.path().join("tmp");

    let filename = {
        let (mut compiler, backend) = new_compiler(&model_dir, &tmp_dir);
        let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
        build_single_word_rule(&rule, "hello");
        compiler.compile_rule(&rule, false).unwrap();
        compiler.prepare_for_recognition().unwrap();
        assert_eq!(backend.compile_count(), 1);
        rule.filename().unwrap()
    };

    // Fresh compiler, unchanged model: the cache vouches for the artifact
    // and no graph compilation runs.
    let (mut compiler, backend) = new_compiler_reusing_model(&model_dir, &tmp_dir);
    let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");
    compiler.compile_rule(&rule, false).unwrap();
    assert!(rule.is_compiled());
    assert_eq!(rule.filename().unwrap(), filename);
    assert_eq!(backend.compile_count(), 0);
}

#[test]
fn model_change_invalidates_cached_graphs() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let tmp_dir = dir.path().join("tmp");

    let filename = {
        let (mut compiler, _backend) = new_compiler(&model_dir, &tmp_dir);
        let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
        build_single_word_rule(&rule, "hello");
        compiler.compile_rule(&rule, false).unwrap();
        compiler.prepare_for_recognition().unwrap();
        rule.filename().unwrap()
    };

    std::fs::write(model_dir.join("final.mdl"), b"\x00retrained-model").unwrap();

    let (mut compiler, backend) = new_compiler_reusing_model(&model_dir, &tmp_dir);
    let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");
    compiler.compile_rule(&rule, false).unwrap();
    // Same text, same filename, but a real compilation ran.
    assert_eq!(rule.filename().unwrap(), filename);
    assert_eq!(backend.compile_count(), 1);
}

#[test]
fn top_fst_enumerates_every_rule_slot() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));

    let top = compiler.compile_top_fst().unwrap();
    assert_eq!(top.id(), None);
    assert!(top.is_compiled());
    assert!(compiler.rule_filepath(&top).unwrap().is_file());
    // 1000 rule arcs + the end arc + the initial ε-arc + 2 noise words.
    assert_eq!(top.with_fst(active_grammar::Wfst::num_arcs), 1004);
    let record = &backend.compiles.lock().unwrap()[0];
    assert!(!record.nonterm);
    assert!(record.simplify_lg);
}

#[test]
fn top_fst_artifact_is_stable_across_builds() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let tmp_dir = dir.path().join("tmp");
    let (mut first, _backend) = new_compiler(&model_dir, &tmp_dir);
    let (mut second, _backend2) = new_compiler_reusing_model(&model_dir, &tmp_dir);
    let top_a = first.compile_top_fst().unwrap();
    let top_b = second.compile_top_fst().unwrap();
    assert_eq!(top_a.filename(), top_b.filename());
}

#[test]
fn adding_a_word_requires_the_external_toolchain() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));

    compiler
        .add_word("hullo", Some(&["HH", "AH0", "L", "OW1"]), true)
        .unwrap();
    let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hullo");
    // The lexicon FST rebuild needs make-lexicon-fst & friends, which the
    // test environment does not ship.
    let err = compiler.compile_rule(&rule, false).unwrap_err();
    assert!(matches!(err, GrammarError::Config(_)));
}

#[test]
fn rule_id_overflow_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    for i in 0..=active_grammar::MAX_RULE_ID {
        compiler.add_rule(&format!("Rule{i}"), RuleOptions::default()).unwrap();
    }
    let err = compiler.add_rule("Overflow", RuleOptions::default()).unwrap_err();
    assert!(matches!(err, GrammarError::Usage(_)));
}

#[test]
fn decoder_config_resolves_model_paths_and_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));

    let top = compiler.compile_top_fst().unwrap();
    let top_path = compiler.rule_filepath(&top).unwrap();
    let config = compiler.decoder_config(&top_path, None).unwrap();

    assert_eq!(config.nonterm_phones_offset, 10);
    assert_eq!(config.rules_phones_offset, 14);
    assert_eq!(config.dictation_phones_offset, 13);
    assert_eq!(config.max_num_rules, 1000);
    assert!(config.top_fst_filename.ends_with(".fst"));
    assert!(config.dictation_fst_filename.ends_with("Dictation.fst"));
    assert!(config.mfcc_config_filename.ends_with("mfcc_hires.conf"));

    // The ivector config was rewritten into the tmp dir with absolute paths.
    let ie_conf = std::path::Path::new(&config.ie_config_filename);
    assert!(ie_conf.starts_with(dir.path().join("tmp")));
    let rewritten = std::fs::read_to_string(ie_conf).unwrap();
    let final_mat = dir.path().join("model/ivector_extractor/final.mat");
    assert!(rewritten.contains(&format!("--lda-matrix={}", final_mat.display())));
}

#[test]
fn dictation_graph_compiles_as_a_nonterminal_branch() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));

    compiler.compile_agf_dictation_fst(None).unwrap();
    let record = &backend.compiles.lock().unwrap()[0];
    assert!(record.nonterm);
    assert!(!record.simplify_lg);
    assert!(!record.from_text);
    assert!(record.output.ends_with("Dictation.fst"));
    assert!(compiler.dictation_fst_path().is_some());
}

#[test]
fn artifact_filename_matches_fst_text_hash() {
    let dir = tempfile::tempdir().unwrap();
    let (mut compiler, _backend) = new_compiler(&dir.path().join("model"), &dir.path().join("tmp"));
    let rule = compiler.add_rule("TestRule", RuleOptions::default()).unwrap();
    build_single_word_rule(&rule, "hello");
    compiler.compile_rule(&rule, true).unwrap();
    let text = rule.with_fst(|fst| fst.fst_text(false));
    assert_eq!(rule.filename().unwrap(), FstFileCache::graph_filename(&text));
}
