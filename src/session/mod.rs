//! The session: registry, scheduler loop and persistent cache.
//!
//! A session owns everything that is specific to one run: the state of every
//! registered node, the queue of ready tasks and the set of bodies currently
//! in flight. The only thing shared with other sessions is the [`Storage`].
//!
//! The scheduler is cooperative and single-threaded. Bodies are futures polled
//! by one loop; they yield whenever they wait on a subprocess, a blocking
//! call or another node, which is where the parallelism comes from.

mod export;
mod registry;

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{Instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::TaskContext;
use crate::core::Hash32;
use crate::engine::{Arg, Future, Node, Task, TaskComposite};
use crate::error::Error;
use crate::rule::Rule;
use crate::storage::{MemoryStorage, Storage};
use crate::utils::{PROGRESS_STYLE, TASK_STYLE, panic_message};
use crate::value::Value;

pub use crate::session::export::{EdgeInfo, GraphExport, NodeInfo, NodeKind};
pub use crate::session::registry::{NodeState, Stats};

use crate::session::registry::{Claim, Launch, Registry};

/// Handle on an evaluation session. Cloning is cheap and every clone refers
/// to the same session.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

struct SessionInner {
    registry: Mutex<Registry>,
    /// Signalled whenever the registry changed in a way a waiting driver
    /// might care about.
    progress: Notify,
    /// Held by the one loop currently driving the graph.
    driver: tokio::sync::Mutex<()>,
    /// Bodies claimed by `run_task`, waiting to be picked up by the driver.
    handoff: Mutex<Vec<Launch>>,
    current: Mutex<Option<Task>>,
    jobs: Option<Arc<Semaphore>>,
    workdir: Option<Utf8PathBuf>,
}

/// Configuration of a [`Session`].
///
/// ```
/// use hashflow::{Session, MemoryStorage};
///
/// let session = Session::builder()
///     .storage(MemoryStorage::new())
///     .jobs(4)
///     .finish();
/// assert!(session.workdir().is_none());
/// ```
#[derive(Default)]
pub struct SessionBuilder {
    storage: Option<Arc<dyn Storage>>,
    jobs: Option<usize>,
    workdir: Option<Utf8PathBuf>,
}

impl SessionBuilder {
    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Uses a storage handle that is already shared with other sessions.
    pub fn shared_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Bounds the number of subprocesses and blocking calls started through
    /// a [`TaskContext`] at the same time.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs.max(1));
        self
    }

    /// Root of the per-task scoped working directories.
    pub fn workdir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn finish(self) -> Session {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        Session(Arc::new(SessionInner {
            registry: Mutex::new(Registry::new(storage)),
            progress: Notify::new(),
            driver: tokio::sync::Mutex::new(()),
            handoff: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            jobs: self.jobs.map(|jobs| Arc::new(Semaphore::new(jobs))),
            workdir: self.workdir,
        }))
    }
}

struct Completion {
    hash: Hash32,
    result: anyhow::Result<Arg>,
    elapsed: Duration,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn new(storage: impl Storage + 'static) -> Session {
        Session::builder().storage(storage).finish()
    }

    /// A session whose results are forgotten when it is dropped.
    pub fn in_memory() -> Session {
        Session::builder().finish()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.0.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.registry().storage().clone()
    }

    pub fn workdir(&self) -> Option<&Utf8Path> {
        self.0.workdir.as_deref()
    }

    pub(crate) fn jobs(&self) -> Option<Arc<Semaphore>> {
        self.0.jobs.clone()
    }

    pub fn stats(&self) -> Stats {
        self.registry().stats
    }

    /// The task whose body is being polled right now, if any.
    pub fn running_task(&self) -> Option<Task> {
        self.0
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_handoff(&self) -> Vec<Launch> {
        std::mem::take(&mut *self.0.handoff.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_current(&self, task: Option<Task>) -> Option<Task> {
        let mut current = self.0.current.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, task)
    }

    /// Evaluates `arg`, blocking the calling thread.
    ///
    /// A current-thread tokio runtime is built for the duration of the call.
    /// Inside an existing runtime use [`Session::eval_async`] instead.
    ///
    /// ```
    /// use hashflow::{Rule, Session, args};
    ///
    /// let add = Rule::from_fn("add", |inputs| Ok(inputs.int(0)? + inputs.int(1)?));
    /// let session = Session::in_memory();
    ///
    /// let x = add.task(args![1, 2]).unwrap();
    /// let y = add.task(args![&x, 10]).unwrap();
    /// assert_eq!(session.eval(&y).unwrap().as_i64(), Some(13));
    /// ```
    pub fn eval(&self, arg: impl Into<Arg>) -> Result<Value, Error> {
        if Handle::try_current().is_ok() {
            return Err(Error::InvalidState(
                "eval() can't block inside a tokio runtime, use eval_async()".into(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(Arc::new(e)))?;
        runtime.block_on(self.eval_async(arg))
    }

    /// Evaluates `arg`: every node it embeds is resolved and substituted by
    /// its result.
    ///
    /// On failure the error of the task where the failure started is
    /// returned, annotated with its label and hash.
    ///
    /// Dropping the returned future stops new tasks from being started;
    /// bodies that are already running are moved onto the runtime, finish
    /// and have their results stored.
    pub async fn eval_async(&self, arg: impl Into<Arg>) -> Result<Value, Error> {
        let composite = TaskComposite::new(arg)?;
        let nodes = composite.nodes().to_vec();
        if nodes.is_empty() {
            return composite.resolve(|node| self.registry().result(&node.hash()));
        }

        self.registry().submit(&nodes)?;
        self.0.progress.notify_waiters();

        let roots: Vec<Hash32> = nodes.iter().map(Node::hash).collect();
        let span = tracing::info_span!("evaluating", roots = roots.len());
        span.pb_set_style(&PROGRESS_STYLE);
        span.pb_set_message(&composite.label());

        let start = Instant::now();
        self.resolve(&roots).instrument(span).await?;

        let registry = self.registry();
        let stats = registry.stats;
        tracing::info!(
            "evaluated {} in {:.2?}: {} executed, {} cached, {} failed",
            composite.label(),
            start.elapsed(),
            stats.executed,
            stats.cached,
            stats.failed + stats.propagated,
        );

        for hash in &roots {
            if let Err(error) = registry.result(hash) {
                return Err(error.root_cause().clone());
            }
        }
        composite.resolve(|node| registry.result(&node.hash()))
    }

    /// Builds a task and registers it without running anything.
    pub fn create_task(&self, rule: &Rule, args: Vec<Arg>) -> Result<Task, Error> {
        self.create_task_with(rule, args, BTreeMap::new())
    }

    /// Like [`Session::create_task`], with keyword arguments.
    pub fn create_task_with(
        &self,
        rule: &Rule,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
    ) -> Result<Task, Error> {
        let task = rule.task_with(args, kwargs)?;
        self.registry().submit(&[Node::Task(task.clone())])?;
        self.0.progress.notify_waiters();
        Ok(task)
    }

    /// Runs the body of a single task whose dependencies are done, unless
    /// storage already has its result.
    ///
    /// Calling this again for the same task, or while it is running, returns
    /// the outcome of the first run. The rule's limit is not applied.
    ///
    /// The body runs on the session's driver loop, so nodes it waits on are
    /// scheduled while it runs.
    pub async fn run_task(&self, task: &Task) -> Result<Value, Error> {
        let hash = task.hash();
        let claim = {
            let mut registry = self.registry();
            registry.submit(&[Node::Task(task.clone())])?;
            registry.claim(task)?
        };

        match claim {
            Claim::Finished(result) => return result,
            Claim::Wait => {}
            Claim::Run(launch) => {
                self.0
                    .handoff
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(launch);
                self.0.progress.notify_waiters();
            }
        }

        self.resolve(&[hash]).await?;
        self.registry().result(&hash)
    }

    /// Registers `node` and returns a future bound to its outcome.
    pub fn future(&self, node: impl Into<Node>) -> Result<Future, Error> {
        let node = node.into();
        let rx = {
            let mut registry = self.registry();
            registry.submit(std::slice::from_ref(&node))?;
            registry.subscribe(&node.hash())
        };
        self.0.progress.notify_waiters();

        match rx {
            Some(rx) => Ok(Future::new(node, rx)),
            None => Err(Error::Internal(format!("{} was not registered", node.label()))),
        }
    }

    /// Snapshot of the registered graph.
    pub fn dot_graph(&self) -> GraphExport {
        GraphExport::snapshot(&self.registry())
    }

    /// Waits until all `roots` are resolved, driving the graph unless some
    /// other call is already doing so.
    async fn resolve(&self, roots: &[Hash32]) -> Result<(), Error> {
        loop {
            let notified = self.0.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let registry = self.registry();
                if roots.iter().all(|hash| registry.is_resolved(hash)) {
                    return Ok(());
                }
            }

            if let Ok(_guard) = self.0.driver.try_lock() {
                return self.drive(roots).await;
            }
            notified.await;
        }
    }

    /// The scheduler loop. Must be called with the driver lock held.
    ///
    /// 1. Bodies handed over by `run_task` are launched, then every ready
    ///    task that may start (or is resolved from storage) in priority
    ///    order.
    /// 2. The loop waits for one body to finish, or for the registry to
    ///    change under its feet.
    /// 3. Finishing a body unblocks or fails its dependents, which makes
    ///    more tasks ready.
    ///
    /// It ends once nothing is ready or in flight.
    async fn drive(&self, roots: &[Hash32]) -> Result<(), Error> {
        let span = Span::current();
        let mut in_flight = InFlight::new(self.clone());

        loop {
            let notified = self.0.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut launches = self.take_handoff();
            let (launches, unresolved, foreign) = {
                let mut registry = self.registry();
                launches.extend(registry.take_ready());
                span.pb_set_length(registry.len() as u64);
                span.pb_set_position(registry.settled as u64);
                let unresolved = roots
                    .iter()
                    .filter(|hash| !registry.is_resolved(hash))
                    .count();
                let foreign = registry
                    .executing
                    .saturating_sub(in_flight.len() + launches.len());
                (launches, unresolved, foreign)
            };

            for launch in launches {
                let hash = launch.task.hash();
                in_flight.push(hash, self.launch(launch));
            }

            if in_flight.is_empty() {
                if unresolved == 0 {
                    return Ok(());
                }
                if foreign == 0 {
                    return Err(Error::Internal(format!(
                        "{unresolved} requested nodes can no longer make progress"
                    )));
                }
                // claimed by run_task, not yet handed over
                notified.await;
                continue;
            }

            tokio::select! {
                Some(completion) = in_flight.next() => self.complete(completion),
                _ = &mut notified => {}
            }
        }
    }

    fn complete(&self, completion: Completion) {
        let Completion {
            hash,
            result,
            elapsed,
        } = completion;
        self.registry().finish(hash, result, elapsed);
        self.0.progress.notify_waiters();
    }

    fn launch(&self, launch: Launch) -> BoxFuture<'static, Completion> {
        let Launch { task, inputs } = launch;
        let hash = task.hash();

        let span = tracing::info_span!("task", label = task.label(), hash = %hash.short());
        span.pb_set_style(&TASK_STYLE);
        span.pb_set_message(task.label());

        let rule = task.rule().clone();
        let context = TaskContext::new(task.clone(), self.clone());
        let run = async move {
            let start = Instant::now();
            let result = AssertUnwindSafe(async move { rule.invoke(context, inputs).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("task panicked: {}", panic_message(&*payload)))
                });
            Completion {
                hash,
                result,
                elapsed: start.elapsed(),
            }
        };

        Tracked {
            session: self.clone(),
            task,
            inner: run.instrument(span).boxed(),
        }
        .boxed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("Session")
            .field("nodes", &registry.len())
            .field("stats", &registry.stats)
            .field("workdir", &self.0.workdir)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(|e| e.into_inner());
        let never_run = registry.never_run();
        if never_run.is_empty() {
            return;
        }

        let mut labels: Vec<String> = never_run.iter().take(5).map(|node| node.label()).collect();
        if never_run.len() > 5 {
            labels.push("...".to_string());
        }
        tracing::warn!(
            "{} registered tasks were never run: {}",
            never_run.len(),
            labels.join(", ")
        );
    }
}

/// Publishes the task being polled as the session's running task.
struct Tracked {
    session: Session,
    task: Task,
    inner: BoxFuture<'static, Completion>,
}

impl std::future::Future for Tracked {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        let this = self.get_mut();
        let previous = this.session.set_current(Some(this.task.clone()));
        let poll = this.inner.as_mut().poll(cx);
        this.session.set_current(previous);
        poll
    }
}

/// Bodies launched by one driver.
struct InFlight {
    session: Session,
    futures: FuturesUnordered<BoxFuture<'static, Completion>>,
    hashes: HashSet<Hash32>,
}

impl InFlight {
    fn new(session: Session) -> Self {
        InFlight {
            session,
            futures: FuturesUnordered::new(),
            hashes: HashSet::new(),
        }
    }

    fn push(&mut self, hash: Hash32, future: BoxFuture<'static, Completion>) {
        self.hashes.insert(hash);
        self.futures.push(future);
    }

    fn len(&self) -> usize {
        self.futures.len()
    }

    fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    async fn next(&mut self) -> Option<Completion> {
        let completion = self.futures.next().await?;
        self.hashes.remove(&completion.hash);
        Some(completion)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.futures.is_empty() {
            let futures = std::mem::take(&mut self.futures);
            let hashes = std::mem::take(&mut self.hashes);
            let session = self.session.clone();

            match Handle::try_current() {
                Ok(handle) => {
                    tracing::debug!("detaching {} running tasks", futures.len());
                    handle.spawn(async move {
                        let mut futures = futures;
                        while let Some(completion) = futures.next().await {
                            session.complete(completion);
                        }
                    });
                }
                Err(_) => session.registry().abandon(hashes),
            }
        }
        self.session.0.progress.notify_waiters();
    }
}
