use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::datafile::DataFile;
use crate::error::PipelineError;

/// Raw script description as it appears in a source config.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ScriptSpec {
    /// Program to execute; may be a path literal like `./scripts/clean.sh`.
    pub path: String,
    /// Entry point name, passed to the program as its first argument.
    pub function: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, String>,
    /// Declared output file names, relative to the stage directory unless
    /// written as path literals.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    Input,
    Output,
    Download,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorProp {
    File,
    Dir,
    Path,
}

/// One parsed `{TYPE[N]-PROP[.suffix...]}` token.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub kind: SelectorKind,
    pub index: Option<usize>,
    pub prop: SelectorProp,
    pub suffixes: Vec<String>,
}

/// A script argument after the one-time parse at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptArg {
    Literal(String),
    /// `./x` relative to the source base dir.
    Relative(String),
    /// `../[../...]x` ancestor walk from the base dir.
    Ancestor { levels: usize, tail: String },
    /// `.<alias>/x` resolved through the named-directory table.
    Alias { alias: String, tail: String },
    Selector(Selector),
}

/// Directories and file lists a script's arguments are resolved against.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub base_dir: Utf8PathBuf,
    pub download_dir: Utf8PathBuf,
    pub process_dir: Utf8PathBuf,
    pub aliases: BTreeMap<String, Utf8PathBuf>,
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
}

impl ScriptContext {
    pub fn new(base_dir: Utf8PathBuf, download_dir: Utf8PathBuf, process_dir: Utf8PathBuf) -> Self {
        Self {
            base_dir,
            download_dir,
            process_dir,
            aliases: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

fn selector_regex() -> Result<Regex, PipelineError> {
    // {TYPE[N]-PROP.suffix.suffix...}
    Regex::new(r"^\{(IN|OUT|D|P)(?:\[(\d+)\])?-(FILE|DIR|PATH)((?:\.[A-Za-z0-9]*)*)\}$")
        .map_err(|err| PipelineError::InvalidSelector {
            selector: String::new(),
            reason: err.to_string(),
        })
}

pub fn parse_arg(raw: &str) -> Result<ScriptArg, PipelineError> {
    if raw.starts_with('{') && raw.ends_with('}') {
        let captures = selector_regex()?.captures(raw).ok_or_else(|| {
            PipelineError::InvalidSelector {
                selector: raw.to_string(),
                reason: "does not match {TYPE[N]-PROP[.suffix...]}".to_string(),
            }
        })?;
        let kind = match &captures[1] {
            "IN" => SelectorKind::Input,
            "OUT" => SelectorKind::Output,
            "D" => SelectorKind::Download,
            _ => SelectorKind::Process,
        };
        let index = captures
            .get(2)
            .map(|m| {
                m.as_str()
                    .parse::<usize>()
                    .map_err(|err| PipelineError::InvalidSelector {
                        selector: raw.to_string(),
                        reason: err.to_string(),
                    })
            })
            .transpose()?;
        let prop = match &captures[3] {
            "FILE" => SelectorProp::File,
            "DIR" => SelectorProp::Dir,
            _ => SelectorProp::Path,
        };
        let suffixes: Vec<String> = captures
            .get(4)
            .map(|m| m.as_str())
            .filter(|tail| !tail.is_empty())
            .map(|tail| {
                tail.split('.')
                    .skip(1)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !suffixes.is_empty() && prop != SelectorProp::Path {
            return Err(PipelineError::InvalidSelector {
                selector: raw.to_string(),
                reason: "suffix rewrites apply to PATH only".to_string(),
            });
        }
        return Ok(ScriptArg::Selector(Selector {
            kind,
            index,
            prop,
            suffixes,
        }));
    }

    if let Some(tail) = raw.strip_prefix("./") {
        return Ok(ScriptArg::Relative(tail.to_string()));
    }
    if raw.starts_with("../") {
        let mut rest = raw;
        let mut levels = 0usize;
        while let Some(tail) = rest.strip_prefix("../") {
            levels += 1;
            rest = tail;
        }
        return Ok(ScriptArg::Ancestor {
            levels,
            tail: rest.to_string(),
        });
    }
    if let Some(tail) = raw.strip_prefix('.') {
        if let Some((alias, rest)) = tail.split_once('/') {
            if !alias.is_empty() {
                return Ok(ScriptArg::Alias {
                    alias: alias.to_string(),
                    tail: rest.to_string(),
                });
            }
        }
    }
    Ok(ScriptArg::Literal(raw.to_string()))
}

impl ScriptArg {
    pub fn resolve(&self, ctx: &ScriptContext) -> Result<String, PipelineError> {
        match self {
            ScriptArg::Literal(value) => Ok(value.clone()),
            ScriptArg::Relative(tail) => Ok(ctx.base_dir.join(tail).to_string()),
            ScriptArg::Ancestor { levels, tail } => {
                let mut dir = ctx.base_dir.clone();
                for _ in 0..*levels {
                    dir = dir
                        .parent()
                        .map(Utf8Path::to_path_buf)
                        .ok_or_else(|| PipelineError::InvalidSelector {
                            selector: format!("../{tail}"),
                            reason: "ancestor walk past filesystem root".to_string(),
                        })?;
                }
                Ok(dir.join(tail).to_string())
            }
            ScriptArg::Alias { alias, tail } => {
                let root = ctx.aliases.get(alias).ok_or_else(|| {
                    PipelineError::InvalidSelector {
                        selector: format!(".{alias}/{tail}"),
                        reason: "unknown directory alias".to_string(),
                    }
                })?;
                Ok(root.join(tail).to_string())
            }
            ScriptArg::Selector(selector) => resolve_selector(selector, ctx),
        }
    }
}

fn resolve_selector(selector: &Selector, ctx: &ScriptContext) -> Result<String, PipelineError> {
    let path = match selector.kind {
        SelectorKind::Input | SelectorKind::Output => {
            let pool = if selector.kind == SelectorKind::Input {
                &ctx.inputs
            } else {
                &ctx.outputs
            };
            let index = selector.index.unwrap_or(0);
            pool.get(index)
                .cloned()
                .ok_or_else(|| PipelineError::InvalidSelector {
                    selector: format!("{selector:?}"),
                    reason: format!("selection {index} out of range ({} available)", pool.len()),
                })?
        }
        SelectorKind::Download => ctx.download_dir.clone(),
        SelectorKind::Process => ctx.process_dir.clone(),
    };

    let resolved = match selector.prop {
        SelectorProp::File => path.file_name().unwrap_or_default().to_string(),
        SelectorProp::Dir => path
            .parent()
            .map(Utf8Path::to_string)
            .unwrap_or_default(),
        SelectorProp::Path => {
            let mut out = path;
            for (position, suffix) in selector.suffixes.iter().enumerate() {
                if suffix.is_empty() {
                    out = out.with_extension("");
                } else if position == 0 {
                    out = out.with_extension(suffix);
                } else {
                    out = Utf8PathBuf::from(format!("{out}.{suffix}"));
                }
            }
            out.to_string()
        }
    };
    Ok(resolved)
}

/// An external transformation unit: a program plus entry-point name, with
/// arguments parsed once at construction and resolved against a context at
/// run time. Invocation hands the program a JSON request on stdin.
#[derive(Debug, Clone)]
pub struct Script {
    program: ScriptArg,
    function: String,
    args: Vec<ScriptArg>,
    kwargs: Vec<(String, ScriptArg)>,
    pub outputs: Vec<String>,
    pub parallel: bool,
}

impl Script {
    pub fn from_spec(spec: &ScriptSpec) -> Result<Self, PipelineError> {
        let args = spec
            .args
            .iter()
            .map(|raw| parse_arg(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = spec
            .kwargs
            .iter()
            .map(|(key, raw)| Ok((key.clone(), parse_arg(raw)?)))
            .collect::<Result<Vec<_>, PipelineError>>()?;
        Ok(Self {
            program: parse_arg(&spec.path)?,
            function: spec.function.clone(),
            args,
            kwargs,
            outputs: spec.outputs.clone(),
            parallel: spec.parallel,
        })
    }

    pub fn identifier(&self) -> String {
        match &self.program {
            ScriptArg::Literal(value) | ScriptArg::Relative(value) => {
                format!("{value}:{}", self.function)
            }
            other => format!("{other:?}:{}", self.function),
        }
    }

    pub fn build_request(&self, ctx: &ScriptContext) -> Result<ScriptRequest, PipelineError> {
        let program = Utf8PathBuf::from(self.program.resolve(ctx)?);
        let args = self
            .args
            .iter()
            .map(|arg| arg.resolve(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs: BTreeMap<String, String> = self
            .kwargs
            .iter()
            .map(|(key, arg)| Ok((key.clone(), arg.resolve(ctx)?)))
            .collect::<Result<_, PipelineError>>()?;
        let payload = json!({
            "function": self.function,
            "base_dir": ctx.base_dir.as_str(),
            "inputs": ctx.inputs.iter().map(|path| path.as_str()).collect::<Vec<_>>(),
            "outputs": ctx.outputs.iter().map(|path| path.as_str()).collect::<Vec<_>>(),
            "args": args,
            "kwargs": kwargs,
        });
        Ok(ScriptRequest {
            program,
            function: self.function.clone(),
            payload,
        })
    }

    /// Invoke the script. Failures are logged with the script identifier and
    /// surfaced as `success = false` rather than an error, so a stage can
    /// continue with its remaining tasks.
    pub fn run(&self, ctx: &ScriptContext, invoker: &dyn ScriptInvoker) -> ScriptOutcome {
        let request = match self.build_request(ctx) {
            Ok(request) => request,
            Err(err) => {
                warn!(script = %self.identifier(), error = %err, "argument resolution failed");
                return ScriptOutcome::failed();
            }
        };
        debug!(script = %self.identifier(), program = %request.program, "running script");
        match invoker.invoke(&request) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(script = %self.identifier(), error = %err, "script failed");
                ScriptOutcome::failed()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub program: Utf8PathBuf,
    pub function: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub success: bool,
    pub value: Option<Value>,
}

impl ScriptOutcome {
    pub fn failed() -> Self {
        Self {
            success: false,
            value: None,
        }
    }

    pub fn succeeded(value: Option<Value>) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

pub trait ScriptInvoker: Send + Sync {
    fn invoke(&self, request: &ScriptRequest) -> Result<ScriptOutcome, PipelineError>;
}

/// Runs scripts as child processes: the JSON request goes to stdin, exit
/// status 0 means success, and a non-empty stdout must be a JSON object
/// which is surfaced as the script's return value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker;

impl ScriptInvoker for ProcessInvoker {
    fn invoke(&self, request: &ScriptRequest) -> Result<ScriptOutcome, PipelineError> {
        let mut child = Command::new(request.program.as_std_path())
            .arg(&request.function)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| PipelineError::Script {
                script: request.program.to_string(),
                message: err.to_string(),
            })?;

        let payload = serde_json::to_vec(&request.payload)
            .map_err(|err| PipelineError::Script {
                script: request.program.to_string(),
                message: err.to_string(),
            })?;
        if let Some(stdin) = child.stdin.take() {
            let mut stdin = stdin;
            stdin
                .write_all(&payload)
                .map_err(|err| PipelineError::Script {
                    script: request.program.to_string(),
                    message: err.to_string(),
                })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|err| PipelineError::Script {
                script: request.program.to_string(),
                message: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exit status {:?}", output.status.code())
            } else {
                stderr
            };
            return Err(PipelineError::Script {
                script: request.program.to_string(),
                message,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value = if stdout.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&stdout).map_err(|err| PipelineError::Script {
                    script: request.program.to_string(),
                    message: format!("stdout is not valid JSON: {err}"),
                })?,
            )
        };
        Ok(ScriptOutcome::succeeded(value))
    }
}

/// A script that has declared exactly where its output lands. Handles the
/// skip/backup/verify/restore protocol around the underlying run.
#[derive(Debug, Clone)]
pub struct OutputScript {
    pub script: Script,
    pub output: DataFile,
}

impl OutputScript {
    pub fn new(script: Script, output: DataFile) -> Self {
        Self { script, output }
    }

    pub fn run(
        &self,
        ctx: &ScriptContext,
        invoker: &dyn ScriptInvoker,
        overwrite: bool,
    ) -> ScriptOutcome {
        if self.output.exists() && !overwrite {
            debug!(output = %self.output.path(), "output exists; skipping script");
            return ScriptOutcome::succeeded(None);
        }

        let had_existing = self.output.exists();
        if had_existing {
            if let Err(err) = self.output.backup(true) {
                warn!(script = %self.script.identifier(), error = %err, "backup failed");
                return ScriptOutcome::failed();
            }
        }

        let mut ctx = ctx.clone();
        ctx.outputs = vec![self.output.path().to_path_buf()];
        let outcome = self.script.run(&ctx, invoker);

        if !outcome.success || !self.output.exists() {
            if outcome.success {
                warn!(
                    script = %self.script.identifier(),
                    output = %self.output.path(),
                    "script succeeded but declared output is missing"
                );
            }
            if had_existing {
                if let Err(err) = self.output.restore_backup() {
                    warn!(output = %self.output.path(), error = %err, "backup restore failed");
                }
            }
            return ScriptOutcome::failed();
        }

        if had_existing {
            if let Err(err) = self.output.delete_backup() {
                warn!(output = %self.output.path(), error = %err, "backup cleanup failed");
            }
        }
        outcome
    }
}

/// Expand a `parallel = true` script over N inputs into N single-input
/// scripts, deriving each output from the declared output's basename within
/// `stage_dir`.
pub fn expand_parallel(
    script: &Script,
    inputs: &[Utf8PathBuf],
    stage_dir: &Utf8Path,
) -> Result<Vec<(OutputScript, Utf8PathBuf)>, PipelineError> {
    let declared = script.outputs.first().ok_or_else(|| PipelineError::Script {
        script: script.identifier(),
        message: "parallel script declares no output".to_string(),
    })?;
    let declared = Utf8PathBuf::from(declared);
    let stem = declared.file_stem().unwrap_or("output");
    let extension = declared.extension();

    let mut expanded = Vec::new();
    for (index, input) in inputs.iter().enumerate() {
        let name = match extension {
            Some(ext) => format!("{stem}_{index}.{ext}"),
            None => format!("{stem}_{index}"),
        };
        let output = DataFile::new(stage_dir.join(name));
        let mut single = script.clone();
        single.parallel = false;
        expanded.push((OutputScript::new(single, output), input.clone()));
    }
    Ok(expanded)
}
