//! Backend invocation
//!
//! Runs one external renderer per job inside the job's work area and turns
//! whatever it did into a [`ConversionResult`]. A backend is either a command
//! line (spawned as a child process) or an HTTP conversion gateway.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{ConvertError, Result};

use super::router::BackendDescriptor;
use super::work_area::WorkArea;

/// Longest stem kept when sanitizing upload names
const MAX_STEM_CHARS: usize = 200;

/// How long stderr may keep draining once a failed backend has exited
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// Outcome of a single backend run
pub type ConversionResult = Result<Artifact>;

/// A rendered file left in the work area by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
}

/// How a backend is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Spawn a local command
    Command(CommandTemplate),
    /// POST the upload to an HTTP conversion gateway (`files` multipart field)
    Gateway { url: String },
}

/// Command line with `{input}`, `{output}`, `{outdir}` and `{input_name}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
        }
    }

    /// Parse a whitespace-separated command line. No shell quoting is applied.
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace().map(str::to_string);
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn render(&self, vars: &TemplateVars<'_>) -> (Vec<String>, Vec<(String, String)>) {
        let args = self.args.iter().map(|a| vars.substitute(a)).collect();
        let env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), vars.substitute(v)))
            .collect();
        (args, env)
    }
}

struct TemplateVars<'a> {
    input: &'a Path,
    output: &'a Path,
    outdir: &'a Path,
    input_name: &'a str,
}

impl TemplateVars<'_> {
    fn substitute(&self, value: &str) -> String {
        value
            .replace("{input_name}", self.input_name)
            .replace("{input}", &self.input.to_string_lossy())
            .replace("{output}", &self.output.to_string_lossy())
            .replace("{outdir}", &self.outdir.to_string_lossy())
    }
}

/// Launches backends and checks what they produced
#[derive(Debug, Clone)]
pub struct BackendInvoker {
    http: reqwest::Client,
    max_diagnostic_bytes: usize,
}

impl BackendInvoker {
    pub fn new(max_diagnostic_bytes: usize) -> Self {
        // Gateways are reached directly on the internal network
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            max_diagnostic_bytes,
        }
    }

    /// Convert `data` (uploaded as `file_name`) inside `area`.
    ///
    /// The artifact stays in the work area; the caller owns its removal.
    pub async fn convert(
        &self,
        area: &WorkArea,
        file_name: &str,
        data: &[u8],
        descriptor: &BackendDescriptor,
        deadline: Instant,
    ) -> ConversionResult {
        let input_name = sanitize_file_name(file_name)?;
        let output_name = descriptor.output_name(&input_name);
        let input = area.file(&input_name);
        let output = area.file(&output_name);

        tokio::fs::write(&input, data).await.map_err(|e| {
            ConvertError::Internal(format!("Failed to write {}: {}", input.display(), e))
        })?;

        tracing::debug!(
            work_area = %area.id(),
            backend = %descriptor.class,
            input = %input_name,
            bytes = data.len(),
            "Invoking backend"
        );

        match &descriptor.invocation {
            Invocation::Command(template) => {
                let vars = TemplateVars {
                    input: &input,
                    output: &output,
                    outdir: area.path(),
                    input_name: &input_name,
                };
                self.run_command(template, &vars, area.path(), descriptor, deadline)
                    .await?
            }
            Invocation::Gateway { url } => {
                self.run_gateway(url, &input_name, data, &output, descriptor, deadline)
                    .await?
            }
        }

        match tokio::fs::metadata(&output).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Artifact {
                path: output,
                size: meta.len(),
            }),
            _ => Err(ConvertError::ArtifactMissing {
                backend: descriptor.class.name(),
                expected: output_name,
            }),
        }
    }

    async fn run_command(
        &self,
        template: &CommandTemplate,
        vars: &TemplateVars<'_>,
        workdir: &Path,
        descriptor: &BackendDescriptor,
        deadline: Instant,
    ) -> Result<()> {
        let backend = descriptor.class.name();
        let (args, env) = template.render(vars);

        let mut command = std::process::Command::new(&template.program);
        command
            .args(&args)
            .envs(env)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // Own process group, so helpers the renderer forks can be signalled with it
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = Command::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConvertError::Internal(format!("Failed to start {}: {}", template.program, e))
            })?;
        let group = child.id();

        let limit = self.max_diagnostic_bytes;
        let mut stderr = tokio::spawn(read_bounded(child.stderr.take(), limit));

        let outcome = timeout_at(deadline, child.wait()).await;

        // Whatever the renderer left behind dies with it
        kill_process_group(group);

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stderr.abort();
                return Err(ConvertError::Internal(format!(
                    "Failed to wait for {}: {}",
                    template.program, e
                )));
            }
            Err(_) => {
                stderr.abort();
                // kill() also waits, so the child is reaped before we return
                if let Err(e) = child.kill().await {
                    tracing::warn!(backend, error = %e, "Failed to kill timed out backend");
                }
                return Err(ConvertError::ConversionTimeout {
                    backend,
                    limit: descriptor.timeout,
                });
            }
        };

        if status.success() {
            stderr.abort();
            return Ok(());
        }

        // A helper that escaped the group may still hold the pipe open
        let (captured, overflowed) = match timeout(STDERR_GRACE, &mut stderr).await {
            Ok(Ok(captured)) => captured,
            _ => {
                stderr.abort();
                (Vec::new(), false)
            }
        };

        Err(ConvertError::ConversionFailed {
            backend,
            status: status.to_string(),
            stderr: truncate_diagnostic(&captured, limit, overflowed),
        })
    }

    async fn run_gateway(
        &self,
        url: &str,
        input_name: &str,
        data: &[u8],
        output: &Path,
        descriptor: &BackendDescriptor,
        deadline: Instant,
    ) -> Result<()> {
        let backend = descriptor.class.name();
        let limit = self.max_diagnostic_bytes;

        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(input_name.to_string());
        let form = reqwest::multipart::Form::new().part("files", part);

        let outcome = timeout_at(deadline, async {
            let response = self.http.post(url).multipart(form).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;

        let (status, body) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(ConvertError::ConversionFailed {
                    backend,
                    status: "gateway unreachable".to_string(),
                    stderr: truncate_diagnostic(e.to_string().as_bytes(), limit, false),
                })
            }
            Err(_) => {
                return Err(ConvertError::ConversionTimeout {
                    backend,
                    limit: descriptor.timeout,
                })
            }
        };

        if !status.is_success() {
            return Err(ConvertError::ConversionFailed {
                backend,
                status: format!("gateway returned {}", status),
                stderr: truncate_diagnostic(&body, limit, false),
            });
        }

        // An empty 2xx body is left for the artifact check to report
        if !body.is_empty() {
            tokio::fs::write(output, &body).await?;
        }

        Ok(())
    }
}

/// Reduce an uploaded name to something safe to create inside a work area.
///
/// Directory components are dropped, `..` components are rejected, and every
/// character outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_file_name(name: &str) -> Result<String> {
    if name.split(&['/', '\\'][..]).any(|component| component.trim() == "..") {
        return Err(ConvertError::BadRequest(format!(
            "Invalid file name: {}",
            name
        )));
    }

    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or(name);
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (base, None),
    };

    let mut stem: String = stem
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .take(MAX_STEM_CHARS)
        .collect::<String>()
        .trim_start_matches('.')
        .to_string();
    if stem.is_empty() {
        stem = "document".to_string();
    }

    let ext: Option<String> = ext
        .map(|e| e.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
        .filter(|e: &String| !e.is_empty());

    Ok(match ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    })
}

/// Render captured stderr, cut to `limit` bytes on a char boundary
pub fn truncate_diagnostic(bytes: &[u8], limit: usize, overflowed: bool) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();

    if text.len() <= limit && !overflowed {
        return text.to_string();
    }

    let mut end = limit.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated]", &text[..end])
}

/// SIGKILL every process left in the backend's group. An empty group is not an error.
#[cfg(unix)]
fn kill_process_group(group: Option<u32>) {
    let Some(pgid) = group.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal and touches no memory
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %err, "Failed to signal backend process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: Option<u32>) {}

/// Drain a pipe, keeping at most `limit` bytes. Returns whether anything was dropped.
async fn read_bounded<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };

    let mut kept = Vec::new();
    let mut overflowed = false;
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    overflowed = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }

    (kept, overflowed)
}
