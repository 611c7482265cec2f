//! Execution backends: subprocesses and blocking closures.
//!
//! Each backend returns a future that yields to the scheduler while the
//! child process or the blocking thread is busy, so a single-threaded
//! session can keep many of them in flight.

use std::ffi::OsString;
use std::fmt::{Debug, Display, Formatter};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::Handle;

use crate::error::{Error, ProcessError};
use crate::utils::panic_message;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

type Filter = Arc<dyn Fn(String) -> String + Send + Sync>;

/// A subprocess invocation.
///
/// ```no_run
/// # async fn demo() -> Result<(), hashflow::Error> {
/// use hashflow::Process;
///
/// let out = Process::new("sort")
///     .stdin("b\na\n")
///     .filter(|s| s.to_uppercase())
///     .run()
///     .await?;
/// assert_eq!(out.stdout, "A\nB\n");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Process {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    env: Vec<(OsString, OsString)>,
    filter: Option<Filter>,
}

impl Process {
    pub fn new(program: impl Into<String>) -> Self {
        Process {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            env: Vec::new(),
            filter: None,
        }
    }

    /// A command line run by `sh -c`.
    pub fn shell(command: impl Into<String>) -> Self {
        Process::new("sh").arg("-c").arg(command.into())
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Post-processes the captured standard output.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub(crate) fn has_cwd(&self) -> bool {
        self.cwd.is_some()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Spawns the process and waits for it. A non-zero exit status is an
    /// [`Error::Process`] carrying the captured streams.
    pub async fn run(self) -> Result<ProcessOutput, Error> {
        if Handle::try_current().is_err() {
            return Err(Error::InvalidState(format!(
                "'{}' must be run inside a tokio runtime",
                self.program
            )));
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(match self.stdin {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        });
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let spawn_error = |error: std::io::Error| Error::Spawn {
            program: self.program.clone(),
            error: Arc::new(error),
        };

        tracing::debug!("spawning {self}");
        let mut child = command.spawn().map_err(spawn_error)?;

        // stdin is written while stdout and stderr are being drained
        let pipe = child.stdin.take();
        let input = self.stdin.clone();
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (pipe, input) {
                match pipe.write_all(&input).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.map_err(spawn_error)?;
        let output = output.map_err(spawn_error)?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if let Some(filter) = &self.filter {
            stdout = filter(stdout);
        }
        let code = output.status.code().unwrap_or(-1);
        tracing::debug!("'{}' exited with code {code}", self.program);

        if !output.status.success() {
            return Err(ProcessError {
                program: self.to_string(),
                code,
                stdout,
                stderr,
            }
            .into());
        }

        Ok(ProcessOutput {
            code,
            stdout,
            stderr,
        })
    }
}

impl Display for Process {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl Debug for Process {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("stdin", &self.stdin.as_ref().map(Vec::len))
            .field("env", &self.env)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Runs `program` with `args`.
pub async fn run_process<I, S>(program: &str, args: I) -> Result<ProcessOutput, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    Process::new(program).args(args).run().await
}

/// Runs a command line through `sh -c`.
pub async fn run_shell(command: &str) -> Result<ProcessOutput, Error> {
    Process::shell(command).run().await
}

/// Runs a blocking closure on the runtime's blocking pool.
///
/// Errors returned by the closure are passed through; a panic becomes an
/// error as well.
pub async fn run_thread<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    if Handle::try_current().is_err() {
        anyhow::bail!("blocking calls must be run inside a tokio runtime");
    }

    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(error) if error.is_panic() => {
            let message = panic_message(&*error.into_panic());
            Err(anyhow::anyhow!("blocking call panicked: {message}"))
        }
        Err(error) => Err(anyhow::anyhow!("blocking call was cancelled: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let out = run_process("echo", ["hello"]).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.code, 0);
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_exit_code() {
        let err = run_shell("echo out; echo err >&2; exit 3").await.unwrap_err();
        match err {
            Error::Process(error) => {
                assert_eq!(error.code, 3);
                assert_eq!(error.stdout, "out\n");
                assert_eq!(error.stderr, "err\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stdin_and_filter() {
        let out = Process::new("cat")
            .stdin("a\nb\n")
            .filter(|s| s.lines().rev().collect::<Vec<_>>().join(","))
            .run()
            .await
            .unwrap();
        assert_eq!(out.stdout, "b,a");
    }

    #[tokio::test]
    async fn test_large_stdin() {
        let input = "x".repeat(1 << 20);
        let out = Process::shell("wc -c").stdin(input).run().await.unwrap();
        assert_eq!(out.stdout.trim(), (1 << 20).to_string());
    }

    #[tokio::test]
    async fn test_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = Process::shell("pwd; echo $GREETING")
            .cwd(dir.path())
            .env("GREETING", "hi")
            .run()
            .await
            .unwrap();

        let mut lines = out.stdout.lines();
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
        assert_eq!(lines.next(), Some("hi"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = run_process("hashflow-no-such-program", ["x"]).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_thread() {
        let value = run_thread(|| Ok(6 * 7)).await.unwrap();
        assert_eq!(value, 42);

        let err = run_thread(|| -> anyhow::Result<()> { anyhow::bail!("failed") })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed");

        let err = run_thread(|| -> anyhow::Result<()> { panic!("exploded") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn test_outside_runtime() {
        let err = futures::executor::block_on(run_shell("true")).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
