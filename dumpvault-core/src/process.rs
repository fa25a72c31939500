/*!
Synchronous execution of external dump/restore tools.

Tools are spawned, fed from and written to files, and awaited before the caller
continues. An optional timeout kills a hung tool so callers can bound a run.
*/

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{Result, VaultError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Longest stderr tail kept in error messages
const DIAGNOSTIC_LIMIT: usize = 2048;

/// Description of one external tool invocation
#[derive(Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            stdout: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Set an environment variable for the child only. Secrets go here, never
    /// into arguments.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    /// Feed the file's bytes to the tool's standard input
    pub fn stdin_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdin = Some(path.as_ref().to_path_buf());
        self
    }

    /// Redirect the tool's standard output into a file
    pub fn stdout_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdout = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn stdin_path(&self) -> Option<&Path> {
        self.stdin.as_deref()
    }

    pub fn stdout_path(&self) -> Option<&Path> {
        self.stdout.as_deref()
    }
}

/// Environment values are credentials, so only their names are printed
impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_names: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_names)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .finish()
    }
}

/// Captured result of a finished tool
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Empty when stdout was redirected to a file
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Runs external tools, optionally bounded by a timeout
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run the command and return its output whatever the exit status.
    ///
    /// Launch failures and timeouts are `AdapterExecution` errors. A timed out
    /// tool is killed and its partial stdout file removed.
    pub fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        let program = command.program();
        let mut cmd = Command::new(program);
        cmd.args(&command.args);
        for (key, value) in &command.envs {
            cmd.env(key, value);
        }

        match &command.stdin {
            Some(path) => {
                let file = File::open(path).map_err(|e| {
                    VaultError::io(format!("open {} as input for {}", path.display(), program), e)
                })?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        match &command.stdout {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        VaultError::io(format!("create directory {}", parent.display()), e)
                    })?;
                }
                let file = File::create(path)
                    .map_err(|e| VaultError::io(format!("create {}", path.display()), e))?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }
        cmd.stderr(Stdio::piped());

        debug!(program = %program, args = command.args.len(), "Spawning external tool");

        let mut child = cmd.spawn().map_err(|e| {
            remove_partial(command.stdout_path());
            if e.kind() == io::ErrorKind::NotFound {
                VaultError::execution(program, "executable not found on PATH")
            } else {
                VaultError::execution(program, format!("failed to start: {e}"))
            }
        })?;

        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let status = match self.wait(&mut child, program) {
            Ok(status) => status,
            Err(e) => {
                remove_partial(command.stdout_path());
                return Err(e);
            }
        };

        let stdout = join(stdout_reader);
        let stderr = String::from_utf8_lossy(&join(stderr_reader)).into_owned();

        debug!(program = %program, status = %status, "External tool finished");
        if !stderr.trim().is_empty() {
            debug!(program = %program, stderr = %stderr.trim(), "External tool diagnostics");
        }

        Ok(ToolOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Run the command and fail on a nonzero exit, carrying the tool's stderr.
    pub fn run_checked(&self, command: &ToolCommand) -> Result<ToolOutput> {
        let output = self.run(command)?;
        if output.success() {
            return Ok(output);
        }

        remove_partial(command.stdout_path());
        let diagnostics = tail(output.stderr.trim(), DIAGNOSTIC_LIMIT);
        let message = if diagnostics.is_empty() {
            output.status.to_string()
        } else {
            format!("{}: {}", output.status, diagnostics)
        };
        Err(VaultError::execution(command.program(), message))
    }

    fn wait(&self, child: &mut Child, program: &str) -> Result<ExitStatus> {
        let Some(timeout) = self.timeout else {
            return child.wait().map_err(|e| {
                VaultError::execution(program, format!("failed waiting for process: {e}"))
            });
        };

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if started.elapsed() >= timeout => {
                    warn!(
                        program = %program,
                        timeout_secs = timeout.as_secs_f64(),
                        "External tool exceeded its timeout, terminating"
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(VaultError::execution(
                        program,
                        format!("timed out after {:.1}s and was terminated", timeout.as_secs_f64()),
                    ));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL.min(timeout)),
                Err(e) => {
                    return Err(VaultError::execution(
                        program,
                        format!("failed waiting for process: {e}"),
                    ))
                }
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default()
}

fn remove_partial(path: Option<&Path>) {
    if let Some(path) = path {
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove partial output");
            }
        }
    }
}

fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_debug_hides_environment_values() {
        let command = ToolCommand::new("mysqldump")
            .arg("--user=backup")
            .env("MYSQL_PWD", "hunter2");
        let printed = format!("{command:?}");
        assert!(printed.contains("MYSQL_PWD"));
        assert!(printed.contains("--user=backup"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_stdout_redirected_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("nested/out.txt");

        let command = ToolCommand::new("sh")
            .arg("-c")
            .arg("printf 'dump contents'")
            .stdout_file(&out);
        let output = ProcessRunner::new().run_checked(&command).unwrap();

        assert!(output.stdout.is_empty());
        assert_eq!(fs::read_to_string(&out).unwrap(), "dump contents");
    }

    #[test]
    fn test_stdin_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in.sql");
        fs::write(&input, "CREATE TABLE t (id INT);").unwrap();

        let command = ToolCommand::new("cat").stdin_file(&input);
        let output = ProcessRunner::new().run_checked(&command).unwrap();

        assert_eq!(output.stdout, b"CREATE TABLE t (id INT);");
    }

    #[test]
    fn test_env_passed_to_child() {
        let command = ToolCommand::new("sh")
            .arg("-c")
            .arg("printf '%s' \"$DUMPVAULT_TEST_SECRET\"")
            .env("DUMPVAULT_TEST_SECRET", "hunter2");
        let output = ProcessRunner::new().run_checked(&command).unwrap();

        assert_eq!(output.stdout, b"hunter2");
    }

    #[test]
    fn test_nonzero_exit_carries_stderr_and_removes_output() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("partial.sql");

        let command = ToolCommand::new("sh")
            .arg("-c")
            .arg("echo partial; echo 'access denied for user' >&2; exit 2")
            .stdout_file(&out);
        let err = ProcessRunner::new().run_checked(&command).unwrap_err();

        match err {
            VaultError::AdapterExecution { tool, message } => {
                assert_eq!(tool, "sh");
                assert!(message.contains("access denied for user"));
            }
            other => panic!("Expected adapter execution error, got {other:?}"),
        }
        assert!(!out.exists());
    }

    #[test]
    fn test_run_does_not_fail_on_nonzero() {
        let command = ToolCommand::new("sh").arg("-c").arg("exit 1");
        let output = ProcessRunner::new().run(&command).unwrap();
        assert!(!output.success());
        assert_eq!(output.status.code(), Some(1));
    }

    #[test]
    fn test_missing_program() {
        let command = ToolCommand::new("dumpvault-no-such-tool");
        let err = ProcessRunner::new().run(&command).unwrap_err();
        assert!(matches!(err, VaultError::AdapterExecution { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_timeout_kills_tool() {
        let runner = ProcessRunner::with_timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();

        let err = runner
            .run(&ToolCommand::new("sleep").arg("5"))
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_missing_stdin_file() {
        let temp_dir = TempDir::new().unwrap();
        let command = ToolCommand::new("cat").stdin_file(temp_dir.path().join("absent.sql"));
        let err = ProcessRunner::new().run(&command).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }
}
