//! Process executor.
//!
//! Runs the subject executable once against a test case and captures its
//! output and termination status.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// How often a running child is polled while a timeout is armed.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which streams make up the matched output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Capture {
    /// stdout and stderr share one pipe, so lines keep their write order.
    #[default]
    Merged,
    /// Only stdout is matched; stderr is kept for diagnostics.
    Separate,
}

/// Options controlling a single subject run.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub capture: Capture,
    /// Whether the subject inherits the runner's environment.
    pub inherit_env: bool,
    /// Variables set on top of the (possibly cleared) environment.
    pub env: HashMap<String, String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            capture: Capture::Merged,
            inherit_env: true,
            env: HashMap::new(),
        }
    }
}

/// How the subject process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// Killed by a signal (Unix only).
    Signaled(i32),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit code {code}"),
            Termination::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Captured result of one subject run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Output lines the directives are matched against.
    pub lines: Vec<String>,
    /// stderr lines when captured separately; empty when merged.
    pub stderr: Vec<String>,
    pub termination: Termination,
}

/// Run `exe` with the test case's file name as its only argument, from the
/// test case's directory, with `stdin` redirected from a file when given.
pub fn execute(
    exe: &Path,
    test_case: &Path,
    stdin: Option<&Path>,
    options: &ExecOptions,
) -> Result<ProcessOutcome> {
    if !test_case.is_file() {
        return Err(Error::InputNotFound {
            path: test_case.to_path_buf(),
        });
    }
    if let Some(path) = stdin
        && !path.is_file()
    {
        return Err(Error::InputNotFound {
            path: path.to_path_buf(),
        });
    }

    let exe = resolve_executable(exe)?;
    let case_path = test_case
        .canonicalize()
        .map_err(|e| Error::io(format!("failed to resolve {}", test_case.display()), e))?;
    let (Some(work_dir), Some(file_name)) = (case_path.parent(), case_path.file_name()) else {
        return Err(Error::InputNotFound {
            path: test_case.to_path_buf(),
        });
    };

    let stdin = match stdin {
        Some(path) => File::open(path)
            .map(Stdio::from)
            .map_err(|e| Error::io(format!("failed to open {}", path.display()), e))?,
        None => Stdio::null(),
    };

    let mut cmd = Command::new(&exe);
    cmd.arg(file_name).current_dir(work_dir).stdin(stdin);
    if !options.inherit_env {
        cmd.env_clear();
    }
    cmd.envs(&options.env);

    tracing::debug!(
        exe = %exe.display(),
        arg = %file_name.to_string_lossy(),
        cwd = %work_dir.display(),
        capture = ?options.capture,
        "spawning subject"
    );

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so a timeout can take background children down too.
        cmd.process_group(0);
    }

    let (mut child, stdout_reader, stderr_reader) = match options.capture {
        Capture::Merged => {
            let (reader, writer) =
                io::pipe().map_err(|e| Error::io("failed to create output pipe", e))?;
            let writer_err = writer
                .try_clone()
                .map_err(|e| Error::io("failed to create output pipe", e))?;
            cmd.stdout(writer).stderr(writer_err);
            let child = spawn(cmd, &exe)?;
            (child, spawn_reader(Some(reader)), None)
        }
        Capture::Separate => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            let mut child = spawn(cmd, &exe)?;
            let stdout_reader = spawn_reader(child.stdout.take());
            let stderr_reader = spawn_reader(child.stderr.take());
            (child, stdout_reader, Some(stderr_reader))
        }
    };

    let start = Instant::now();
    let deadline = options.timeout.map(|limit| Deadline { start, limit });

    let status = match deadline {
        Some(deadline) => wait_until(&mut child, deadline)?,
        None => match child.wait() {
            Ok(status) => status,
            Err(e) => {
                kill_group(&mut child);
                return Err(Error::io("failed to wait for subject", e));
            }
        },
    };
    let termination = termination_of(status);
    tracing::debug!(%termination, elapsed = ?start.elapsed(), "subject finished");

    // Background children may still hold the pipes open after the subject
    // exits, so collecting output is bounded by the same deadline.
    let lines = split_lines(&collect(&stdout_reader, deadline, &mut child)?);
    let stderr = match &stderr_reader {
        Some(rx) => split_lines(&collect(rx, deadline, &mut child)?),
        None => Vec::new(),
    };

    Ok(ProcessOutcome {
        lines,
        stderr,
        termination,
    })
}

/// Make the executable path absolute against the runner's working directory
/// before the subject is started from the test case's directory.
fn resolve_executable(exe: &Path) -> Result<PathBuf> {
    std::path::absolute(exe)
        .map_err(|e| Error::io(format!("failed to resolve {}", exe.display()), e))
}

/// Spawn the child, consuming `cmd` so the parent's copies of any pipe write
/// ends are closed once the child holds them.
fn spawn(mut cmd: Command, exe: &Path) -> Result<Child> {
    cmd.spawn().map_err(|source| Error::Launch {
        exe: exe.to_path_buf(),
        source,
    })
}

type Captured = io::Result<Vec<u8>>;

/// Drain `source` on a helper thread; the bytes arrive on the returned channel
/// once every writer has closed the stream.
fn spawn_reader<R>(source: Option<R>) -> Receiver<Captured>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let result = match source {
            Some(mut source) => source.read_to_end(&mut buf).map(|_| buf),
            None => Ok(buf),
        };
        let _ = tx.send(result);
    });
    rx
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    start: Instant,
    limit: Duration,
}

impl Deadline {
    fn remaining(&self) -> Option<Duration> {
        self.limit.checked_sub(self.start.elapsed())
    }

    fn expired(&self) -> Error {
        Error::Timeout { limit: self.limit }
    }
}

fn collect(
    rx: &Receiver<Captured>,
    deadline: Option<Deadline>,
    child: &mut Child,
) -> Result<Vec<u8>> {
    let captured = match deadline {
        None => rx.recv().map_err(|_| reader_gone())?,
        Some(deadline) => {
            let remaining = deadline.remaining().unwrap_or(Duration::ZERO);
            match rx.recv_timeout(remaining) {
                Ok(captured) => captured,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!(
                        pid = child.id(),
                        "output still open at deadline, killing process group"
                    );
                    kill_group(child);
                    return Err(deadline.expired());
                }
                Err(RecvTimeoutError::Disconnected) => return Err(reader_gone()),
            }
        }
    };
    captured.map_err(|e| Error::io("failed to read output", e))
}

fn reader_gone() -> Error {
    Error::io(
        "failed to read output",
        io::Error::other("reader stopped without a result"),
    )
}

fn wait_until(child: &mut Child, deadline: Deadline) -> Result<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if deadline.remaining().is_none() {
                    tracing::debug!(pid = child.id(), "timeout reached, killing subject");
                    kill_group(child);
                    return Err(deadline.expired());
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_group(child);
                return Err(Error::io("failed to wait for subject", e));
            }
        }
    }
}

/// Kill the subject and everything left in its process group, then reap it.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: kill(2) has no memory-safety preconditions; the negative
            // pid names the group the subject leads.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn termination_of(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Exited(-1)
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    const SH: &str = "/bin/sh";

    /// Write a shell script test case and return its directory and path.
    fn script(body: &str) -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("case.sh");
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    fn run_sh(case: &Path, options: &ExecOptions) -> Result<ProcessOutcome> {
        execute(Path::new(SH), case, None, options)
    }

    // ==================== Capture Tests ====================

    #[test]
    fn merged_capture_keeps_write_order() {
        let (_dir, case) = script("echo out1\necho err1 >&2\necho out2\n");
        let outcome = run_sh(&case, &ExecOptions::default()).unwrap();

        assert_eq!(outcome.lines, vec!["out1", "err1", "out2"]);
        assert!(outcome.stderr.is_empty());
        assert_eq!(outcome.termination, Termination::Exited(0));
    }

    #[test]
    fn separate_capture_matches_stdout_only() {
        let (_dir, case) = script("echo out1\necho err1 >&2\necho out2\n");
        let options = ExecOptions {
            capture: Capture::Separate,
            ..ExecOptions::default()
        };
        let outcome = run_sh(&case, &options).unwrap();

        assert_eq!(outcome.lines, vec!["out1", "out2"]);
        assert_eq!(outcome.stderr, vec!["err1"]);
    }

    #[test]
    fn crlf_output_is_split_into_lines() {
        let (_dir, case) = script("printf 'a\\r\\nb\\r\\n'\n");
        let outcome = run_sh(&case, &ExecOptions::default()).unwrap();

        assert_eq!(outcome.lines, vec!["a", "b"]);
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let (_dir, case) = script("printf 'ok\\377\\n'\n");
        let outcome = run_sh(&case, &ExecOptions::default()).unwrap();

        assert_eq!(outcome.lines, vec!["ok\u{FFFD}"]);
    }

    // ==================== Invocation Tests ====================

    #[test]
    fn runs_from_test_case_directory_with_relative_argument() {
        let (dir, case) = script("pwd\necho \"$0\"\n");
        let outcome = run_sh(&case, &ExecOptions::default()).unwrap();

        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(outcome.lines[0], expected_dir.display().to_string());
        assert_eq!(outcome.lines[1], "case.sh");
    }

    #[test]
    fn executable_resolves_against_caller_directory() {
        let exe = Path::new("sub/tool");
        let resolved = resolve_executable(exe).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sub/tool"));

        let bare = resolve_executable(Path::new("mytool")).unwrap();
        assert_eq!(bare, std::env::current_dir().unwrap().join("mytool"));

        assert_eq!(resolve_executable(Path::new(SH)).unwrap(), Path::new(SH));
    }

    #[test]
    fn stdin_is_redirected_from_file() {
        let (dir, case) = script("cat\n");
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "line one\nline two\n").unwrap();

        let outcome = execute(
            Path::new(SH),
            &case,
            Some(input.as_path()),
            &ExecOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.lines, vec!["line one", "line two"]);
    }

    #[test]
    fn stdin_defaults_to_empty() {
        let (_dir, case) = script("cat\necho done\n");
        let outcome = run_sh(&case, &ExecOptions::default()).unwrap();

        assert_eq!(outcome.lines, vec!["done"]);
    }

    #[test]
    fn exit_code_is_recorded() {
        let (_dir, case) = script("echo failing\nexit 3\n");
        let outcome = run_sh(&case, &ExecOptions::default()).unwrap();

        assert_eq!(outcome.termination, Termination::Exited(3));
        assert_eq!(outcome.lines, vec!["failing"]);
    }

    #[cfg(unix)]
    #[test]
    fn signal_termination_is_recorded() {
        let (_dir, case) = script("kill -9 $$\n");
        let outcome = run_sh(&case, &ExecOptions::default()).unwrap();

        assert_eq!(outcome.termination, Termination::Signaled(9));
    }

    // ==================== Environment Tests ====================

    #[test]
    fn configured_env_is_applied() {
        let (_dir, case) = script("echo \"$CHECKRUN_MODE\"\n");
        let mut options = ExecOptions::default();
        options
            .env
            .insert("CHECKRUN_MODE".to_string(), "strict".to_string());
        let outcome = run_sh(&case, &options).unwrap();

        assert_eq!(outcome.lines, vec!["strict"]);
    }

    #[test]
    fn env_cleared_without_inherit() {
        let (_dir, case) = script("echo \"${HOME:-unset}\"\n");
        let options = ExecOptions {
            inherit_env: false,
            ..ExecOptions::default()
        };
        let outcome = run_sh(&case, &options).unwrap();

        assert_eq!(outcome.lines, vec!["unset"]);
    }

    // ==================== Failure Tests ====================

    #[test]
    fn missing_test_case() {
        let dir = tempdir().unwrap();
        let result = run_sh(&dir.path().join("absent.sh"), &ExecOptions::default());

        assert!(matches!(result, Err(Error::InputNotFound { .. })));
    }

    #[test]
    fn missing_stdin_file() {
        let (dir, case) = script("cat\n");
        let result = execute(
            Path::new(SH),
            &case,
            Some(dir.path().join("absent.txt").as_path()),
            &ExecOptions::default(),
        );

        match result {
            Err(Error::InputNotFound { path }) => assert!(path.ends_with("absent.txt")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_executable() {
        let (_dir, case) = script("echo hi\n");
        let result = execute(
            Path::new("/nonexistent/checkrun-subject"),
            &case,
            None,
            &ExecOptions::default(),
        );

        assert!(matches!(result, Err(Error::Launch { .. })));
    }

    #[test]
    fn timeout_kills_subject() {
        let (_dir, case) = script("sleep 5\n");
        let options = ExecOptions {
            timeout: Some(Duration::from_millis(200)),
            ..ExecOptions::default()
        };

        let start = Instant::now();
        let result = run_sh(&case, &options);
        match result {
            Err(Error::Timeout { limit }) => assert_eq!(limit, Duration::from_millis(200)),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn background_child_cannot_outlast_timeout() {
        // The script itself exits at once; its background child keeps the
        // output pipe open.
        let (_dir, case) = script("sleep 6 &\necho done\n");
        let options = ExecOptions {
            timeout: Some(Duration::from_secs(1)),
            ..ExecOptions::default()
        };

        let start = Instant::now();
        let result = run_sh(&case, &options);
        let elapsed = start.elapsed();

        assert!(
            matches!(result, Err(Error::Timeout { .. })),
            "unexpected result: {result:?}"
        );
        assert!(
            elapsed < Duration::from_secs(3),
            "runner took {elapsed:?} with a 1s limit"
        );
    }

    #[test]
    fn background_child_with_separate_capture_is_bounded() {
        let (_dir, case) = script("sleep 6 &\necho done\n");
        let options = ExecOptions {
            timeout: Some(Duration::from_secs(1)),
            capture: Capture::Separate,
            ..ExecOptions::default()
        };

        let start = Instant::now();
        let result = run_sh(&case, &options);

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn fast_subject_finishes_within_timeout() {
        let (_dir, case) = script("echo quick\n");
        let options = ExecOptions {
            timeout: Some(Duration::from_secs(10)),
            ..ExecOptions::default()
        };
        let outcome = run_sh(&case, &options).unwrap();

        assert_eq!(outcome.lines, vec!["quick"]);
    }
}
