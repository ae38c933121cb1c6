//! Shared test utilities used by unit tests and the integration suite.

use std::path::Path;

/// Write a minimal but well-formed AGF model directory into `dir`.
///
/// The fixture carries just enough symbols for the grammar and lexicon
/// tests: a handful of ordinary words, the reserved symbols, a non-terminal
/// block at the conventional high offset, and position-dependent phones for
/// the pronunciations the tests add.
pub fn write_model_fixture(dir: &Path) {
    let write = |name: &str, contents: &[u8]| {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture dir");
        }
        std::fs::write(path, contents).expect("write fixture file");
    };

    let words = "\
<eps> 0
!SIL 1
<unk> 2
hello 3
world 4
say 5
repeat 6
again 7
done 8
#0 10
#nonterm_begin 600000
#nonterm_end 600001
#nonterm:dictation 600002
#nonterm:dictation_cloud 600003
#nonterm:rule0 600004
#nonterm:rule1 600005
#nonterm:rule2 600006
";
    write("words.base.txt", words.as_bytes());
    write("words.txt", words.as_bytes());

    write(
        "phones.txt",
        b"<eps> 0
SIL 1
h_B 2
h_E 3
V_I 4
l_I 5
oU_E 6
'oU_E 7
#0 8
#14 9
#nonterm_bos 10
#nonterm_begin 11
#nonterm_end 12
#nonterm:dictation 13
#nonterm:rule0 14
",
    );

    let align = "\
1 1 1
3 3 2 6
4 4 2 6
5 5 2 6
6 6 2 6
7 7 2 6
8 8 2 6
";
    write("align_lexicon.base.int", align.as_bytes());
    write("align_lexicon.int", align.as_bytes());

    let lexiconp = "\
!SIL\t1.0 SIL
hello\t1.0 h_B oU_E
world\t1.0 h_B oU_E
say\t1.0 h_B oU_E
repeat\t1.0 h_B oU_E
again\t1.0 h_B oU_E
done\t1.0 h_B oU_E
";
    write("lexiconp_disambig.base.txt", lexiconp.as_bytes());
    write("lexiconp_disambig.txt", lexiconp.as_bytes());

    write("disambig.int", b"8\n9\n");
    write("left_context_phones.txt", b"1\n2\n3\n4\n5\n6\n7\n");
    write(
        "nonterminals.txt",
        b"#nonterm:dictation\n#nonterm:rule0\n#nonterm:rule1\n#nonterm:rule2\n",
    );
    write("wdisambig_phones.int", b"8\n");
    write("wdisambig_words.int", b"10\n");
    write("user_lexicon.txt", b"");

    write("tree", b"\x00fixture-tree");
    write("final.mdl", b"\x00fixture-model");
    write("L_disambig.fst", b"\x00fixture-lexicon-fst");
    write("G.fst", b"\x00fixture-dictation-g");
    write("Dictation.fst", b"\x00fixture-dictation-hclg");

    write("KAG_VERSION", b"0.5.0\n");

    write("mfcc_hires.conf", b"--sample-frequency=16000\n--num-mel-bins=40\n");
    write(
        "ivector_extractor.conf",
        b"--splice-config=conf/splice.conf
--cmvn-config=conf/online_cmvn.conf
--lda-matrix=ivector_extractor/final.mat
--global-cmvn-stats=ivector_extractor/global_cmvn.stats
--diag-ubm=ivector_extractor/final.dubm
--ivector-extractor=ivector_extractor/final.ie
--num-gselect=5
",
    );
    write("conf/splice.conf", b"--left-context=3\n--right-context=3\n");
    write("conf/online_cmvn.conf", b"--norm-means=false\n");
    write("ivector_extractor/final.mat", b"\x00mat");
    write("ivector_extractor/global_cmvn.stats", b"\x00stats");
    write("ivector_extractor/final.dubm", b"\x00dubm");
    write("ivector_extractor/final.ie", b"\x00ie");
}
