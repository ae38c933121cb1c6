//! Compilation of grammar FSTs into HCLG decoding-graph fragments via the
//! OpenFST / Kaldi companion executables.
//!
//! The external pipeline mirrors the classic recipe: the textual grammar is
//! compiled by `fstcompile` and piped into `compile-graph-agf`, which
//! composes it with the tree, acoustic model and lexicon into a binary graph
//! usable as a non-terminal branch of the top FST.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{debug, error};

use crate::error::{GrammarError, Result};

/// Grammar source handed to the compiler.
pub enum GraphInput<'a> {
    /// Textual FST encoding (see [`crate::wfst::Wfst::fst_text`]).
    Text(&'a str),
    /// A pre-compiled binary grammar FST on disk.
    File(&'a Path),
}

/// One graph-compilation job.
pub struct GraphRequest<'a> {
    pub input: GraphInput<'a>,
    pub output: &'a Path,
    /// Whether the grammar is a non-terminal branch of the top FST (adds the
    /// prepend/append non-terminal arcs).
    pub nonterm: bool,
    /// Whether to disambiguate and simplify LG. On for command grammars,
    /// off for the dictation graph.
    pub simplify_lg: bool,
}

/// Compiles one grammar into a binary decoding-graph fragment.
///
/// Implemented by the external-tool pipeline ([`AgfGraphCompiler`]) and by
/// the in-process native compiler ([`crate::decoder::NativeGraphCompiler`]).
pub trait GraphBackend: Send + Sync {
    fn compile_graph(&self, request: &GraphRequest<'_>) -> Result<()>;
}

/// Resolved paths of the external executables the pipelines shell out to.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub fstcompile: PathBuf,
    pub fstarcsort: PathBuf,
    pub fstaddselfloops: PathBuf,
    pub compile_graph_agf: PathBuf,
    pub make_lexicon_fst: PathBuf,
}

impl ToolPaths {
    /// Locate the executables in `exec_dir`, or on `PATH` when no directory
    /// is given.
    ///
    /// # Errors
    ///
    /// Returns [`GrammarError::Config`] naming the first missing tool.
    pub fn discover(exec_dir: Option<&Path>) -> Result<Self> {
        let find = |name: &str| -> Result<PathBuf> {
            match exec_dir {
                Some(dir) => {
                    let path = dir.join(name);
                    if path.is_file() {
                        Ok(path)
                    } else {
                        Err(GrammarError::Config(format!(
                            "cannot find {name:?} in {}",
                            dir.display()
                        )))
                    }
                }
                None => which::which(name).map_err(|_| {
                    GrammarError::Config(format!("cannot find {name:?} on PATH"))
                }),
            }
        };
        Ok(Self {
            fstcompile: find("fstcompile")?,
            fstarcsort: find("fstarcsort")?,
            fstaddselfloops: find("fstaddselfloops")?,
            compile_graph_agf: find("compile-graph-agf")?,
            make_lexicon_fst: find("make-lexicon-fst")?,
        })
    }
}

/// Model files the graph pipelines reference.
#[derive(Debug, Clone)]
pub struct GraphModelFiles {
    pub words_txt: PathBuf,
    pub disambig_int: PathBuf,
    pub tree: PathBuf,
    pub final_mdl: PathBuf,
    pub l_disambig_fst: PathBuf,
    pub nonterm_phones_offset: u32,
    pub nonterm_words_offset: u32,
}

/// External-tool graph compiler: `fstcompile | compile-graph-agf`.
pub struct AgfGraphCompiler {
    tools: ToolPaths,
    files: GraphModelFiles,
}

impl AgfGraphCompiler {
    pub fn new(tools: ToolPaths, files: GraphModelFiles) -> Self {
        Self { tools, files }
    }

    fn agf_args(&self, compiled_from_text: bool, nonterm: bool, simplify_lg: bool) -> Vec<String> {
        let mut args = Vec::new();
        if compiled_from_text {
            args.push("--arcsort-grammar".to_owned());
        }
        if nonterm {
            args.push(format!(
                "--grammar-prepend-nonterm={}",
                self.files.nonterm_words_offset
            ));
            args.push(format!(
                "--grammar-append-nonterm={}",
                self.files.nonterm_words_offset + 1
            ));
        }
        args.push(format!(
            "--nonterm-phones-offset={}",
            self.files.nonterm_phones_offset
        ));
        args.push(format!(
            "--read-disambig-syms={}",
            self.files.disambig_int.display()
        ));
        args.push(format!("--simplify-lg={simplify_lg}"));
        args.push("--verbose=0".to_owned());
        args.push(self.files.tree.display().to_string());
        args.push(self.files.final_mdl.display().to_string());
        args.push(self.files.l_disambig_fst.display().to_string());
        args
    }

    /// Compile a plain dictation HCLG from a statistical `G.fst` (no
    /// non-terminal wrapping, no LG simplification).
    pub fn compile_plain_dictation(&self, g_fst: &Path, output: &Path) -> Result<()> {
        let status = Command::new(&self.tools.compile_graph_agf)
            .arg(format!(
                "--read-disambig-syms={}",
                self.files.disambig_int.display()
            ))
            .arg("--simplify-lg=false")
            .arg("--verbose=0")
            .arg(&self.files.tree)
            .arg(&self.files.final_mdl)
            .arg(&self.files.l_disambig_fst)
            .arg(g_fst)
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(&self.tools.compile_graph_agf, &err))?
            .wait_with_output()?;
        if !status.status.success() {
            let stderr = String::from_utf8_lossy(&status.stderr);
            error!("compile-graph-agf failed:\n{stderr}");
            return Err(GrammarError::Config(format!(
                "compile-graph-agf exited with {}",
                status.status
            )));
        }
        Ok(())
    }
}

impl GraphBackend for AgfGraphCompiler {
    fn compile_graph(&self, request: &GraphRequest<'_>) -> Result<()> {
        debug!("compiling graph to {}", request.output.display());
        match request.input {
            GraphInput::Text(text) => {
                // fstcompile reads the textual grammar on stdin and streams
                // the binary FST into compile-graph-agf.
                let mut fstcompile = Command::new(&self.tools.fstcompile)
                    .arg(format!("--isymbols={}", self.files.words_txt.display()))
                    .arg(format!("--osymbols={}", self.files.words_txt.display()))
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|err| spawn_error(&self.tools.fstcompile, &err))?;
                let fst_stdout = fstcompile
                    .stdout
                    .take()
                    .ok_or_else(|| GrammarError::Config("fstcompile stdout unavailable".into()))?;

                let mut args = self.agf_args(true, request.nonterm, request.simplify_lg);
                args.push("-".to_owned());
                args.push(request.output.display().to_string());
                let agf = Command::new(&self.tools.compile_graph_agf)
                    .args(&args)
                    .stdin(Stdio::from(fst_stdout))
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|err| spawn_error(&self.tools.compile_graph_agf, &err))?;

                if let Some(mut stdin) = fstcompile.stdin.take() {
                    // A write failure here means the tool died early; the
                    // exit-status check below reports its stderr.
                    if let Err(err) = stdin.write_all(text.as_bytes()) {
                        debug!("fstcompile stdin write failed: {err}");
                    }
                }
                wait_checked(fstcompile, "fstcompile")?;
                let agf_output = agf.wait_with_output()?;
                if !agf_output.status.success() {
                    let stderr = String::from_utf8_lossy(&agf_output.stderr);
                    error!("compile-graph-agf failed:\n{stderr}");
                    return Err(GrammarError::Config(format!(
                        "compile-graph-agf exited with {}",
                        agf_output.status
                    )));
                }
                Ok(())
            }
            GraphInput::File(input) => {
                // Pre-compiled grammar: feed it to compile-graph-agf directly.
                let file = std::fs::File::open(input)?;
                let mut args = self.agf_args(false, request.nonterm, request.simplify_lg);
                args.push("-".to_owned());
                args.push(request.output.display().to_string());
                let agf = Command::new(&self.tools.compile_graph_agf)
                    .args(&args)
                    .stdin(Stdio::from(file))
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|err| spawn_error(&self.tools.compile_graph_agf, &err))?;
                let output = agf.wait_with_output()?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    error!("compile-graph-agf failed:\n{stderr}");
                    return Err(GrammarError::Config(format!(
                        "compile-graph-agf exited with {}",
                        output.status
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Files consumed by the lexicon FST rebuild.
#[derive(Debug, Clone)]
pub struct LexiconFstFiles {
    pub lexiconp_disambig_txt: PathBuf,
    pub phones_txt: PathBuf,
    pub words_txt: PathBuf,
    pub wdisambig_phones_int: PathBuf,
    pub wdisambig_words_int: PathBuf,
    pub left_context_phones_txt: PathBuf,
    pub nonterminals_txt: PathBuf,
    pub l_disambig_fst: PathBuf,
}

/// Rebuild `L_disambig.fst` from the (possibly user-extended) disambiguated
/// lexicon: `make-lexicon-fst | fstcompile | fstaddselfloops | fstarcsort`.
pub fn rebuild_lexicon_fst(tools: &ToolPaths, files: &LexiconFstFiles) -> Result<()> {
    debug!("rebuilding {}", files.l_disambig_fst.display());
    let mut make = Command::new(&tools.make_lexicon_fst)
        .arg(format!(
            "--left-context-phones={}",
            files.left_context_phones_txt.display()
        ))
        .arg(format!("--nonterminals={}", files.nonterminals_txt.display()))
        .arg("--sil-prob=0.5")
        .arg("--sil-phone=SIL")
        .arg("--sil-disambig=#14")
        .arg(&files.lexiconp_disambig_txt)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(&tools.make_lexicon_fst, &err))?;

    // All stages are spawned before anything is waited on, so a full pipe
    // buffer can never wedge the pipeline.
    let mut compile = pipe_into(
        &mut make,
        Command::new(&tools.fstcompile)
            .arg(format!("--isymbols={}", files.phones_txt.display()))
            .arg(format!("--osymbols={}", files.words_txt.display()))
            .arg("--keep_isymbols=false")
            .arg("--keep_osymbols=false"),
        "make-lexicon-fst",
    )?;
    let mut selfloops = pipe_into(
        &mut compile,
        Command::new(&tools.fstaddselfloops)
            .arg(&files.wdisambig_phones_int)
            .arg(&files.wdisambig_words_int),
        "fstcompile",
    )?;
    let mut arcsort = pipe_into(
        &mut selfloops,
        Command::new(&tools.fstarcsort).arg("--sort_type=olabel"),
        "fstaddselfloops",
    )?;

    let mut binary = Vec::new();
    if let Some(stdout) = arcsort.stdout.as_mut() {
        stdout.read_to_end(&mut binary)?;
    }
    wait_checked(make, "make-lexicon-fst")?;
    wait_checked(compile, "fstcompile")?;
    wait_checked(selfloops, "fstaddselfloops")?;
    wait_checked(arcsort, "fstarcsort")?;
    std::fs::write(&files.l_disambig_fst, binary)?;
    Ok(())
}

/// Spawn `next` with its stdin wired to `prev`'s stdout.
fn pipe_into(prev: &mut Child, next: &mut Command, prev_name: &str) -> Result<Child> {
    let stdout = prev
        .stdout
        .take()
        .ok_or_else(|| GrammarError::Config(format!("{prev_name} stdout unavailable")))?;
    next.stdin(Stdio::from(stdout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| GrammarError::Config(format!("failed to spawn pipeline stage: {err}")))
}

fn wait_checked(child: Child, name: &str) -> Result<()> {
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("{name} failed:\n{stderr}");
        return Err(GrammarError::Config(format!(
            "{name} exited with {}",
            output.status
        )));
    }
    Ok(())
}

fn spawn_error(tool: &Path, err: &std::io::Error) -> GrammarError {
    GrammarError::Config(format!("failed to spawn {}: {err}", tool.display()))
}
