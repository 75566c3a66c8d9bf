//! `shell_cmd` built-in tool.
//!
//! Timeout/output-size discipline and async-process handling, scoped to a
//! working-directory boundary with inline-eval rejections rather than an
//! allow/deny command-list model.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout as tokio_timeout;

const DEFAULT_MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Interpreters whose `-c`/`-e`/`-Command` flags accept an inline script
/// rather than a file path — rejected outright (sh -c, node -e, python -c,
/// powershell -Command).
const INLINE_EVAL_INTERPRETERS: &[(&str, &[&str])] = &[
    ("sh", &["-c"]),
    ("bash", &["-c"]),
    ("zsh", &["-c"]),
    ("node", &["-e", "--eval"]),
    ("python", &["-c"]),
    ("python3", &["-c"]),
    ("powershell", &["-Command"]),
    ("pwsh", &["-Command"]),
];

#[derive(Debug)]
pub enum ShellError {
    ScopeViolation(String),
    InlineEvalRejected(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ShellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellError::ScopeViolation(msg) => write!(f, "shell_cmd scope violation: {}", msg),
            ShellError::InlineEvalRejected(msg) => {
                write!(f, "shell_cmd rejected inline-eval form: {}", msg)
            }
            ShellError::Io(e) => write!(f, "shell_cmd io error: {}", e),
        }
    }
}

impl std::error::Error for ShellError {}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ShellCmdArgs {
    pub command: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(rename = "timeout", default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ShellResult {
    /// The "LLM-facing minimal result mode" of step e:
    /// status/exit_code/timed_out/reason — no transcript body. Full stdout
    /// and stderr still reach the client via `sse tool-stream` events; they
    /// never go back to the LLM directly.
    pub fn to_llm_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.timed_out {
                "timed_out"
            } else if self.exit_code == Some(0) {
                "ok"
            } else {
                "error"
            },
            "exit_code": self.exit_code,
            "timed_out": self.timed_out,
        })
    }
}

/// Checks that `directory` (if present) equals `working_directory` or is a
/// subpath of it.
pub fn check_directory_scope(
    working_directory: &Path,
    directory: Option<&str>,
) -> Result<PathBuf, ShellError> {
    let requested = match directory {
        None => return Ok(working_directory.to_path_buf()),
        Some(d) => PathBuf::from(d),
    };
    let candidate = if requested.is_absolute() {
        requested
    } else {
        working_directory.join(requested)
    };
    let normalized = normalize(&candidate);
    let boundary = normalize(working_directory);
    if normalized == boundary || normalized.starts_with(&boundary) {
        Ok(normalized)
    } else {
        Err(ShellError::ScopeViolation(format!(
            "{:?} escapes working directory {:?}",
            candidate, working_directory
        )))
    }
}

/// Lexically normalizes a path (resolves `.`/`..` components) without
/// touching the filesystem, so scope checks work against paths that may not
/// exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Rejects relative `..`-escapes, `--flag=/abs/path` and short-option-glued
/// (`-I/abs/path`) arguments that resolve outside `working_directory`, and
/// inline-eval interpreter invocations.
pub fn check_scoped_arguments(
    command: &str,
    parameters: &[String],
    working_directory: &Path,
) -> Result<(), ShellError> {
    let boundary = normalize(working_directory);
    let base = Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command);

    if let Some((_, flags)) = INLINE_EVAL_INTERPRETERS
        .iter()
        .find(|(name, _)| *name == base)
    {
        if parameters.iter().any(|p| flags.contains(&p.as_str())) {
            return Err(ShellError::InlineEvalRejected(format!(
                "{} {}",
                command,
                parameters.join(" ")
            )));
        }
    }

    for param in parameters {
        if let Some(path_part) = extract_embedded_path(param) {
            if path_part.contains("..") {
                let resolved = normalize(&working_directory.join(&path_part));
                if !resolved.starts_with(&boundary) {
                    return Err(ShellError::ScopeViolation(format!(
                        "argument {:?} escapes working directory via ..",
                        param
                    )));
                }
            }
            if path_part.starts_with('/') {
                let resolved = normalize(Path::new(&path_part));
                if !resolved.starts_with(&boundary) {
                    return Err(ShellError::ScopeViolation(format!(
                        "argument {:?} references an absolute path outside the working directory",
                        param
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Pulls a path-looking substring out of `--flag=/abs/path` and
/// short-option-glued `-I/abs/path` forms; returns `None` for arguments with
/// no embedded path (plain flags, bare words).
fn extract_embedded_path(arg: &str) -> Option<String> {
    if let Some(eq_pos) = arg.find('=') {
        if arg.starts_with("--") {
            return Some(arg[eq_pos + 1..].to_string());
        }
    }
    if arg.starts_with('-') && !arg.starts_with("--") && arg.len() > 2 {
        let rest = &arg[2..];
        if rest.starts_with('/') || rest.contains("..") {
            return Some(rest.to_string());
        }
    }
    if !arg.starts_with('-') && (arg.starts_with('/') || arg.contains("..")) {
        return Some(arg.to_string());
    }
    None
}

/// Runs `command parameters...` inside `working_directory`, honoring
/// `timeout_ms` (default : 600_000ms). Does not itself
/// perform scope/inline-eval validation — callers must run
/// [`check_directory_scope`] and [`check_scoped_arguments`] first.
pub async fn execute(
    args: &ShellCmdArgs,
    working_directory: &Path,
    default_timeout: Duration,
) -> Result<ShellResult, ShellError> {
    let started = Instant::now();
    let timeout_dur = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);

    let mut command = TokioCommand::new(&args.command);
    command
        .args(&args.parameters)
        .current_dir(working_directory)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(ShellError::Io)?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let run = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = read_limited(&mut pipe, &mut stdout, DEFAULT_MAX_OUTPUT_SIZE).await;
        }
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = read_limited(&mut pipe, &mut stderr, DEFAULT_MAX_OUTPUT_SIZE).await;
        }
        let status = child.wait().await.map_err(ShellError::Io)?;
        Ok::<_, ShellError>((stdout, stderr, status.code()))
    };

    match tokio_timeout(timeout_dur, run).await {
        Ok(Ok((stdout, stderr, exit_code))) => Ok(ShellResult {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
            timed_out: false,
            duration_ms: started.elapsed().as_millis() as u64,
        }),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => {
            // best-effort: the child is dropped and killed along with it.
            Ok(ShellResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                timed_out: true,
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
    }
}

async fn read_limited<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<(), ShellError> {
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await.map_err(ShellError::Io)? {
            0 => return Ok(()),
            n => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() >= max_bytes {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_scope_accepts_self_and_subpath() {
        let root = Path::new("/work");
        assert!(check_directory_scope(root, None).is_ok());
        assert!(check_directory_scope(root, Some("/work")).is_ok());
        assert!(check_directory_scope(root, Some("/work/sub")).is_ok());
    }

    #[test]
    fn directory_scope_rejects_escape() {
        let root = Path::new("/work");
        assert!(check_directory_scope(root, Some("/etc")).is_err());
        assert!(check_directory_scope(root, Some("../etc")).is_err());
    }

    #[test]
    fn rejects_relative_dotdot_argument() {
        let root = Path::new("/work");
        let err = check_scoped_arguments("cat", &["../../etc/passwd".to_string()], root);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_glued_short_option_escape() {
        let root = Path::new("/work");
        let err = check_scoped_arguments("gcc", &["-I/etc".to_string()], root);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_equals_style_flag_escape() {
        let root = Path::new("/work");
        let err = check_scoped_arguments(
            "rsync",
            &["--config=/etc/rsyncd.conf".to_string()],
            root,
        );
        assert!(err.is_err());
    }

    #[test]
    fn allows_in_scope_paths() {
        let root = Path::new("/work");
        assert!(check_scoped_arguments("ls", &["-la".to_string(), "sub/dir".to_string()], root).is_ok());
        assert!(check_scoped_arguments("gcc", &["-I/work/include".to_string()], root).is_ok());
    }

    #[test]
    fn rejects_inline_eval_forms() {
        let root = Path::new("/work");
        assert!(check_scoped_arguments(
            "sh",
            &["-c".to_string(), "rm -rf /".to_string()],
            root
        )
        .is_err());
        assert!(check_scoped_arguments(
            "python3",
            &["-c".to_string(), "import os".to_string()],
            root
        )
        .is_err());
    }

    #[tokio::test]
    async fn execute_runs_and_captures_output() {
        let dir = std::env::temp_dir();
        let args = ShellCmdArgs {
            command: "echo".to_string(),
            parameters: vec!["hello".to_string()],
            directory: None,
            timeout_ms: None,
        };
        let result = execute(&args, &dir, Duration::from_secs(5)).await.unwrap();
        assert!(result.stdout.contains("hello"));
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn execute_honors_timeout() {
        let dir = std::env::temp_dir();
        let args = ShellCmdArgs {
            command: "sleep".to_string(),
            parameters: vec!["2".to_string()],
            directory: None,
            timeout_ms: Some(50),
        };
        let result = execute(&args, &dir, Duration::from_secs(5)).await.unwrap();
        assert!(result.timed_out);
    }
}
