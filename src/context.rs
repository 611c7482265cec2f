use std::ffi::OsStr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::sync::OwnedSemaphorePermit;

use crate::engine::{Future, Node, Task};
use crate::error::Error;
use crate::executor::{self, Process, ProcessOutput};
use crate::session::Session;
use crate::value::Value;

/// What a rule body knows about the task it is running for.
///
/// The backends reached through the context honour the session's job limit
/// and run in the task's scoped working directory when the session has one.
#[derive(Clone)]
pub struct TaskContext {
    task: Task,
    session: Option<Session>,
}

impl TaskContext {
    pub(crate) fn new(task: Task, session: Session) -> Self {
        TaskContext {
            task,
            session: Some(session),
        }
    }

    /// Context of an eager call made outside any session.
    pub(crate) fn detached(task: Task) -> Self {
        TaskContext {
            task,
            session: None,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Directory reserved for this task, `<workdir>/<hash>`, created on first
    /// use. `None` when the session has no working directory configured.
    pub fn workdir(&self) -> std::io::Result<Option<Utf8PathBuf>> {
        let Some(root) = self.session.as_ref().and_then(|s| s.workdir()) else {
            return Ok(None);
        };
        let dir = root.join(self.task.hash().to_hex());
        std::fs::create_dir_all(&dir)?;
        Ok(Some(dir))
    }

    async fn permit(&self) -> Option<OwnedSemaphorePermit> {
        let jobs = self.session.as_ref()?.jobs()?;
        jobs.acquire_owned().await.ok()
    }

    pub async fn run(&self, mut process: Process) -> Result<ProcessOutput, Error> {
        if !process.has_cwd() {
            let dir = self.workdir().map_err(|error| Error::Spawn {
                program: process.program().to_string(),
                error: Arc::new(error),
            })?;
            if let Some(dir) = dir {
                process = process.cwd(dir);
            }
        }
        let _permit = self.permit().await;
        process.run().await
    }

    pub async fn run_process<I, S>(&self, program: &str, args: I) -> Result<ProcessOutput, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(Process::new(program).args(args)).await
    }

    pub async fn run_shell(&self, command: &str) -> Result<ProcessOutput, Error> {
        self.run(Process::shell(command)).await
    }

    pub async fn run_thread<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.permit().await;
        executor::run_thread(f).await
    }

    /// Registers `node` with the session and returns its future.
    pub fn future(&self, node: impl Into<Node>) -> Result<Future, Error> {
        match &self.session {
            Some(session) => session.future(node),
            None => Err(Error::InvalidState(format!(
                "'{}' is not running inside a session",
                self.task.label()
            ))),
        }
    }

    /// Waits for the result of another node of the graph.
    pub async fn resolve(&self, node: impl Into<Node>) -> Result<Value, Error> {
        self.future(node)?.wait().await
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("session", &self.session.is_some())
            .finish()
    }
}
