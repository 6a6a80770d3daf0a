//! GGUF conversion through llama.cpp's out-of-process tools
//!
//! `convert_hf_to_gguf.py` writes f32/f16/bf16/q8_0 directly. K-quants are
//! produced in two steps: convert to f16, then `llama-quantize`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::{ExportError, ExportResult};

pub const CONVERTER_SCRIPT: &str = "convert_hf_to_gguf.py";
pub const QUANTIZE_BINARY: &str = "llama-quantize";

/// Lines of tool output kept for error reports
const TAIL_LINES: usize = 20;

/// Requested GGUF tensor type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GgufOuttype {
    /// Written by the converter itself
    Direct(String),
    /// Needs an f16 intermediate and `llama-quantize`
    KQuant(String),
}

impl GgufOuttype {
    pub fn parse(value: &str) -> ExportResult<Self> {
        let lower = value.trim().to_ascii_lowercase();
        match lower.as_str() {
            "f32" | "f16" | "bf16" | "q8_0" => Ok(GgufOuttype::Direct(lower)),
            other if is_k_quant(other) => Ok(GgufOuttype::KQuant(lower)),
            _ => Err(ExportError::InvalidOuttype(value.to_string())),
        }
    }

    /// Type name as `llama-quantize` expects it, e.g. `Q4_K_M`
    pub fn quantize_name(&self) -> String {
        match self {
            GgufOuttype::Direct(t) | GgufOuttype::KQuant(t) => t.to_ascii_uppercase(),
        }
    }
}

/// q2_k .. q6_k with optional _s/_m/_l size suffix
fn is_k_quant(value: &str) -> bool {
    let Some(rest) = value.strip_prefix('q') else {
        return false;
    };
    let mut parts = rest.split('_');
    let bits_ok = matches!(parts.next(), Some("2" | "3" | "4" | "5" | "6"));
    let k_ok = parts.next() == Some("k");
    let size_ok = match parts.next() {
        None => true,
        Some(size) => matches!(size, "s" | "m" | "l") && parts.next().is_none(),
    };
    bits_ok && k_ok && size_ok
}

/// Captured tail of a finished tool run
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

/// Runs an external program to completion
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> ExportResult<ToolOutput>;
}

/// Spawns real processes with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

async fn collect_tail<R>(reader: Option<R>, tool: &str, stream: &'static str) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(target: "testgen::tool", "[{} {}] {}", tool, stream, line);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read {} of {}: {}", stream, tool, e);
                break;
            }
        }
    }
    tail.into_iter().collect()
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> ExportResult<ToolOutput> {
        tracing::info!("Running {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExportError::ToolSpawn {
                tool: program.to_string(),
                source,
            })?;

        let (stdout_tail, stderr_tail) = futures::future::join(
            collect_tail(child.stdout.take(), program, "stdout"),
            collect_tail(child.stderr.take(), program, "stderr"),
        )
        .await;

        let status = child.wait().await.map_err(|source| ExportError::ToolSpawn {
            tool: program.to_string(),
            source,
        })?;
        if !status.success() {
            return Err(ExportError::ToolFailed {
                tool: program.to_string(),
                status: status.to_string(),
                stderr: stderr_tail.join("\n"),
            });
        }
        Ok(ToolOutput {
            stdout_tail,
            stderr_tail,
        })
    }
}

/// Records commands instead of running them
#[derive(Default)]
pub struct DryRunRunner {
    commands: Mutex<Vec<Vec<String>>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded invocation, program first
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }
}

impl fmt::Debug for DryRunRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DryRunRunner")
            .field("commands", &self.commands.lock().len())
            .finish()
    }
}

#[async_trait]
impl ToolRunner for DryRunRunner {
    async fn run(&self, program: &str, args: &[String]) -> ExportResult<ToolOutput> {
        tracing::info!("[dry-run] {} {}", program, args.join(" "));
        let mut command = vec![program.to_string()];
        command.extend(args.iter().cloned());
        self.commands.lock().push(command);
        Ok(ToolOutput::default())
    }
}

/// Inputs of a conversion run
#[derive(Debug, Clone)]
pub struct GgufOptions {
    pub python: String,
    pub llama_cpp_dir: PathBuf,
    pub merged_dir: PathBuf,
    pub outfile: PathBuf,
    pub outtype: String,
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `llama-quantize` sits at the checkout root or under `build/bin`
fn find_quantize_binary(llama_cpp_dir: &Path) -> ExportResult<PathBuf> {
    let candidates = [
        llama_cpp_dir.join(QUANTIZE_BINARY),
        llama_cpp_dir.join("build").join("bin").join(QUANTIZE_BINARY),
    ];
    candidates
        .iter()
        .find(|p| p.exists())
        .cloned()
        .ok_or_else(|| ExportError::MissingTool(candidates[0].clone()))
}

/// Intermediate f16 file next to the final output
fn intermediate_path(outfile: &Path) -> PathBuf {
    let stem = outfile
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    outfile.with_file_name(format!("{}.f16.gguf", stem))
}

/// Convert the merged model directory to a single GGUF file
pub async fn convert_to_gguf(runner: &dyn ToolRunner, opts: &GgufOptions) -> ExportResult<PathBuf> {
    let outtype = GgufOuttype::parse(&opts.outtype)?;
    let script = opts.llama_cpp_dir.join(CONVERTER_SCRIPT);
    if !script.exists() {
        return Err(ExportError::MissingTool(script));
    }
    if let Some(parent) = opts.outfile.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(ExportError::io(parent))?;
    }

    let convert = |outfile: &Path, t: &str| {
        vec![
            path_arg(&script),
            path_arg(&opts.merged_dir),
            "--outfile".to_string(),
            path_arg(outfile),
            "--outtype".to_string(),
            t.to_string(),
        ]
    };

    match &outtype {
        GgufOuttype::Direct(t) => {
            runner.run(&opts.python, &convert(&opts.outfile, t)).await?;
        }
        GgufOuttype::KQuant(_) => {
            let quantize = find_quantize_binary(&opts.llama_cpp_dir)?;
            let intermediate = intermediate_path(&opts.outfile);
            let result = async {
                runner.run(&opts.python, &convert(&intermediate, "f16")).await?;
                runner
                    .run(
                        &path_arg(&quantize),
                        &[
                            path_arg(&intermediate),
                            path_arg(&opts.outfile),
                            outtype.quantize_name(),
                        ],
                    )
                    .await
                    .map(|_| ())
            }
            .await;
            // Remove the f16 file whether or not quantization succeeded
            if let Err(e) = tokio::fs::remove_file(&intermediate).await {
                tracing::debug!("Intermediate {} not removed: {}", intermediate.display(), e);
            }
            result?;
        }
    }

    tracing::info!(
        "GGUF model ({}) written to {}",
        outtype.quantize_name(),
        opts.outfile.display()
    );
    Ok(opts.outfile.clone())
}
