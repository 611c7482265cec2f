//! Per-session bookkeeping of every node seen in the current run.
//!
//! The registry is a plain state machine; it never awaits. Dependencies are
//! edges `dependency -> dependent` of a petgraph `DiGraph` whose weights are
//! node hashes, and every entry counts the dependencies it is still waiting
//! for, the same dependency counting the scheduler loop is built around.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use tokio::sync::watch;

use crate::core::Hash32;
use crate::engine::{Arg, Node, Resolution, Task, TaskComposite};
use crate::error::Error;
use crate::rule::Inputs;
use crate::storage::Storage;
use crate::value::Value;

/// Lifecycle of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Waiting for dependencies.
    Pending,
    /// Queued, all dependencies done.
    Ready,
    /// Body started, or waiting for the graph its body returned.
    Running,
    Done,
    Failed,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Failed)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Done => "done",
            NodeState::Failed => "failed",
        })
    }
}

/// Counters of what happened to the tasks of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bodies that ran to completion.
    pub executed: usize,
    /// Tasks resolved from storage without running.
    pub cached: usize,
    /// Bodies that returned an error or panicked.
    pub failed: usize,
    /// Tasks failed because a dependency failed.
    pub propagated: usize,
}

pub(crate) struct Entry {
    pub(crate) node: Node,
    pub(crate) index: NodeIndex,
    pub(crate) state: NodeState,
    seq: u64,
    waiting: usize,
    tx: watch::Sender<Resolution>,
    awaiting: Option<TaskComposite>,
    pub(crate) cached: bool,
    pub(crate) duration: Option<Duration>,
}

#[derive(PartialEq, Eq)]
struct Queued {
    priority: i32,
    seq: u64,
    hash: Hash32,
}

// Max-heap: higher priority first, then earlier registration.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A task whose body should be started now.
pub(crate) struct Launch {
    pub(crate) task: Task,
    pub(crate) inputs: Inputs,
}

/// What `run_task` should do with a task.
pub(crate) enum Claim {
    Finished(Result<Value, Error>),
    Wait,
    Run(Launch),
}

pub(crate) struct Registry {
    pub(crate) graph: DiGraph<Hash32, ()>,
    pub(crate) entries: HashMap<Hash32, Entry>,
    ready: BinaryHeap<Queued>,
    running: HashMap<String, usize>,
    pub(crate) executing: usize,
    next_seq: u64,
    pub(crate) settled: usize,
    pub(crate) stats: Stats,
    storage: Arc<dyn Storage>,
}

impl Registry {
    pub(crate) fn new(storage: Arc<dyn Storage>) -> Self {
        Registry {
            graph: DiGraph::new(),
            entries: HashMap::new(),
            ready: BinaryHeap::new(),
            running: HashMap::new(),
            executing: 0,
            next_seq: 0,
            settled: 0,
            stats: Stats::default(),
            storage,
        }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn subscribe(&self, hash: &Hash32) -> Option<watch::Receiver<Resolution>> {
        self.entries.get(hash).map(|entry| entry.tx.subscribe())
    }

    pub(crate) fn is_resolved(&self, hash: &Hash32) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|entry| entry.state.is_terminal())
    }

    pub(crate) fn result(&self, hash: &Hash32) -> Result<Value, Error> {
        let Some(entry) = self.entries.get(hash) else {
            return Err(Error::Internal(format!("node {} is not registered", hash.short())));
        };
        match &*entry.tx.borrow() {
            Resolution::Done(value) => Ok(value.clone()),
            Resolution::Failed(error) => Err(error.clone()),
            Resolution::Pending => Err(Error::InvalidState(format!(
                "'{}' ({}) has not finished yet",
                entry.node.label(),
                hash.short()
            ))),
        }
    }

    /// Registers `roots` and everything they depend on.
    ///
    /// Nodes already known are left alone. Nodes whose dependencies are all
    /// done become ready; components of finished tasks resolve right away.
    pub(crate) fn submit(&mut self, roots: &[Node]) -> Result<(), Error> {
        let mut stack: Vec<(Node, bool)> = roots.iter().rev().map(|n| (n.clone(), false)).collect();
        let mut on_path = HashSet::new();

        while let Some((node, expanded)) = stack.pop() {
            let hash = node.hash();
            if expanded {
                on_path.remove(&hash);
                if !self.entries.contains_key(&hash) {
                    self.register(node);
                }
                continue;
            }

            if self.entries.contains_key(&hash) {
                continue;
            }
            if !on_path.insert(hash) {
                return Err(cyclic(&node));
            }

            stack.push((node.clone(), true));
            for dependency in node.dependencies().into_iter().rev() {
                let dep_hash = dependency.hash();
                if on_path.contains(&dep_hash) {
                    return Err(cyclic(&dependency));
                }
                if !self.entries.contains_key(&dep_hash) {
                    stack.push((dependency, false));
                }
            }
        }

        Ok(())
    }

    fn register(&mut self, node: Node) {
        let hash = node.hash();
        let index = self.graph.add_node(hash);

        let mut waiting = 0;
        let mut failed = None;
        for dependency in node.dependencies() {
            let Some(dep) = self.entries.get(&dependency.hash()) else {
                continue;
            };
            self.graph.update_edge(dep.index, index, ());
            match &*dep.tx.borrow() {
                Resolution::Done(_) => {}
                Resolution::Failed(error) => failed = Some(error.clone()),
                Resolution::Pending => waiting += 1,
            }
        }

        tracing::debug!("registered {:?} waiting for {waiting}", node);

        let (tx, _) = watch::channel(Resolution::Pending);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            hash,
            Entry {
                node: node.clone(),
                index,
                state: NodeState::Pending,
                seq,
                waiting,
                tx,
                awaiting: None,
                cached: false,
                duration: None,
            },
        );

        if let Some(cause) = failed {
            self.stats.propagated += matches!(node, Node::Task(_)) as usize;
            self.settle(hash, Err(propagated(&node, &cause)), false);
        } else if waiting == 0 {
            self.unblock(hash);
        }
    }

    /// Moves a node whose dependencies are all done forward.
    fn unblock(&mut self, hash: Hash32) {
        let Some(entry) = self.entries.get_mut(&hash) else {
            return;
        };

        if let Some(composite) = entry.awaiting.take() {
            let outcome = self.resolve_composite(&composite);
            self.settle(hash, outcome, true);
            return;
        }

        match entry.node.clone() {
            Node::Component(component) => {
                let outcome = self
                    .result(&component.task().hash())
                    .and_then(|value| component.resolve(&value));
                self.settle(hash, outcome, false);
            }
            Node::Task(task) => {
                if entry.state == NodeState::Pending {
                    entry.state = NodeState::Ready;
                    self.ready.push(Queued {
                        priority: task.rule().config().priority,
                        seq: entry.seq,
                        hash,
                    });
                    tracing::debug!("ready: {}", task.label());
                }
            }
        }
    }

    fn resolve_composite(&self, composite: &TaskComposite) -> Result<Value, Error> {
        composite.resolve(|node| self.result(&node.hash()))
    }

    /// Records the outcome of a node and pushes it through the graph.
    ///
    /// Failures fail every dependent that has not finished yet, without
    /// running it; successes unblock dependents whose last dependency this
    /// was.
    fn settle(&mut self, hash: Hash32, outcome: Result<Value, Error>, persist: bool) {
        let mut work = vec![(hash, outcome, persist)];

        while let Some((hash, outcome, persist)) = work.pop() {
            let Some(entry) = self.entries.get_mut(&hash) else {
                continue;
            };
            if entry.state.is_terminal() {
                continue;
            }

            entry.awaiting = None;
            entry.state = match outcome {
                Ok(_) => NodeState::Done,
                Err(_) => NodeState::Failed,
            };
            let index = entry.index;
            entry.tx.send_replace(match &outcome {
                Ok(value) => Resolution::Done(value.clone()),
                Err(error) => Resolution::Failed(error.clone()),
            });
            self.settled += 1;

            if persist && let Ok(value) = &outcome {
                self.persist(&hash, value);
            }

            let dependents: Vec<Hash32> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .map(|i| self.graph[i])
                .collect();

            for dependent in dependents {
                let Some(entry) = self.entries.get_mut(&dependent) else {
                    continue;
                };
                if entry.state.is_terminal() {
                    continue;
                }

                match &outcome {
                    Err(cause) => {
                        let error = propagated(&entry.node, cause);
                        if let Node::Task(task) = &entry.node {
                            self.stats.propagated += 1;
                            tracing::debug!("not running {}: dependency failed", task.label());
                        }
                        work.push((dependent, Err(error), false));
                    }
                    Ok(value) => {
                        entry.waiting = entry.waiting.saturating_sub(1);
                        if entry.waiting > 0 {
                            continue;
                        }
                        if let Some(composite) = entry.awaiting.take() {
                            let resolved = self.resolve_composite(&composite);
                            work.push((dependent, resolved, true));
                        } else if let Node::Component(component) = entry.node.clone() {
                            work.push((dependent, component.resolve(value), false));
                        } else {
                            self.unblock(dependent);
                        }
                    }
                }
            }
        }
    }

    fn persist(&self, hash: &Hash32, value: &Value) {
        let blob = match value.to_cbor() {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!("couldn't encode result of {}: {e}", hash.short());
                return;
            }
        };
        if let Err(e) = self.storage.insert(hash, &blob) {
            tracing::warn!("couldn't store result of {}: {e}", hash.short());
        }
    }

    /// Looks a task up in storage. Unreadable or corrupt entries are misses,
    /// and corrupt ones are discarded so the recomputed result can be stored.
    fn lookup(&self, hash: &Hash32) -> Option<Value> {
        match self.storage.get(hash) {
            Ok(Some(blob)) => match Value::from_cbor(&blob) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("discarding corrupt stored result of {}: {e}", hash.short());
                    if let Err(e) = self.storage.discard(hash) {
                        tracing::warn!("couldn't discard stored result of {}: {e}", hash.short());
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("couldn't read stored result of {}: {e}", hash.short());
                None
            }
        }
    }

    fn try_cached(&mut self, hash: Hash32) -> bool {
        let Some(value) = self.lookup(&hash) else {
            return false;
        };
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.cached = true;
            tracing::debug!("cache hit: {}", entry.node.label());
        }
        self.stats.cached += 1;
        self.settle(hash, Ok(value), false);
        true
    }

    fn inputs(&self, task: &Task) -> Result<Inputs, Error> {
        task.inputs(&mut |node| self.result(&node.hash()))
    }

    fn start(&mut self, task: &Task) {
        let hash = task.hash();
        if let Some(entry) = self.entries.get_mut(&hash) {
            entry.state = NodeState::Running;
        }
        *self.running.entry(task.rule().name().to_string()).or_default() += 1;
        self.executing += 1;
    }

    fn stop(&mut self, task: &Task) {
        if let Some(count) = self.running.get_mut(task.rule().name()) {
            *count = count.saturating_sub(1);
        }
        self.executing = self.executing.saturating_sub(1);
    }

    /// Pops every ready task that may start now, in priority order.
    ///
    /// Stored results are picked up on the way and do not count against a
    /// rule's limit. Tasks held back by their limit stay queued.
    pub(crate) fn take_ready(&mut self) -> Vec<Launch> {
        let mut launches = Vec::new();
        let mut held = Vec::new();

        while let Some(queued) = self.ready.pop() {
            let Some(entry) = self.entries.get(&queued.hash) else {
                continue;
            };
            if entry.state != NodeState::Ready {
                continue;
            }
            let Node::Task(task) = entry.node.clone() else {
                continue;
            };

            if self.try_cached(queued.hash) {
                continue;
            }

            let config = task.rule().config();
            let running = self.running.get(task.rule().name()).copied().unwrap_or(0);
            if let Some(limit) = config.limit
                && running >= limit
            {
                held.push(queued);
                continue;
            }

            match self.inputs(&task) {
                Ok(inputs) => {
                    self.start(&task);
                    tracing::debug!("starting {}", task.label());
                    launches.push(Launch { task, inputs });
                }
                Err(error) => self.settle(queued.hash, Err(error), false),
            }
        }

        self.ready.extend(held);
        launches
    }

    /// Decides how `run_task` proceeds, starting the task if it can.
    pub(crate) fn claim(&mut self, task: &Task) -> Result<Claim, Error> {
        let hash = task.hash();
        let Some(entry) = self.entries.get(&hash) else {
            return Err(Error::Internal(format!("{} is not registered", task.label())));
        };

        let (state, waiting) = (entry.state, entry.waiting);

        match state {
            NodeState::Done | NodeState::Failed => Ok(Claim::Finished(self.result(&hash))),
            NodeState::Running => Ok(Claim::Wait),
            NodeState::Pending if waiting > 0 => Err(Error::InvalidState(format!(
                "'{}' ({}) still waits for {waiting} dependencies",
                task.label(),
                hash.short(),
            ))),
            NodeState::Pending | NodeState::Ready => {
                if self.try_cached(hash) {
                    return Ok(Claim::Finished(self.result(&hash)));
                }
                let inputs = self.inputs(task)?;
                self.start(task);
                Ok(Claim::Run(Launch {
                    task: task.clone(),
                    inputs,
                }))
            }
        }
    }

    /// Records the end of a body.
    pub(crate) fn finish(&mut self, hash: Hash32, result: anyhow::Result<Arg>, elapsed: Duration) {
        let Some(entry) = self.entries.get_mut(&hash) else {
            return;
        };
        entry.duration = Some(elapsed);
        let Node::Task(task) = entry.node.clone() else {
            return;
        };
        self.stop(&task);

        match result {
            Err(error) => {
                self.stats.failed += 1;
                tracing::error!("{} failed: {error:#}", task.label());
                let error = Error::TaskExecution {
                    label: task.label().to_string(),
                    hash: hash.short(),
                    error: Arc::new(error),
                };
                self.settle(hash, Err(error), false);
            }
            Ok(arg) => {
                self.stats.executed += 1;
                tracing::debug!("finished {} in {elapsed:.2?}", task.label());
                match arg.into_value_or_arg() {
                    Ok(value) => self.settle(hash, Ok(value), true),
                    Err(arg) => self.await_graph(&task, arg),
                }
            }
        }
    }

    /// The body returned more graph: the task is done once that resolves.
    fn await_graph(&mut self, task: &Task, arg: Arg) {
        let hash = task.hash();
        let composite = match TaskComposite::new(arg) {
            Ok(composite) => composite,
            Err(error) => return self.settle(hash, Err(error), false),
        };

        let children = composite.nodes().to_vec();
        if children.iter().any(|child| child.hash() == hash) {
            return self.settle(hash, Err(cyclic(&Node::Task(task.clone()))), false);
        }
        if let Err(error) = self.submit(&children) {
            return self.settle(hash, Err(error), false);
        }

        let Some(index) = self.entries.get(&hash).map(|entry| entry.index) else {
            return;
        };

        let mut waiting = 0;
        let mut failed = None;
        for child in &children {
            let Some(entry) = self.entries.get(&child.hash()) else {
                continue;
            };
            // A child that needs this task can never be resolved for it.
            if has_path_connecting(&self.graph, index, entry.index, None) {
                return self.settle(hash, Err(cyclic(&Node::Task(task.clone()))), false);
            }
            self.graph.update_edge(entry.index, index, ());
            match &*entry.tx.borrow() {
                Resolution::Done(_) => {}
                Resolution::Failed(error) => failed = Some(error.clone()),
                Resolution::Pending => waiting += 1,
            }
        }

        if let Some(cause) = failed {
            self.stats.propagated += 1;
            let error = propagated(&Node::Task(task.clone()), &cause);
            return self.settle(hash, Err(error), false);
        }

        if waiting == 0 {
            let outcome = self.resolve_composite(&composite);
            return self.settle(hash, outcome, true);
        }

        if let Some(entry) = self.entries.get_mut(&hash) {
            tracing::debug!("{} waits for {waiting} nodes of its result", task.label());
            entry.waiting = waiting;
            entry.awaiting = Some(composite);
        }
    }

    /// Puts back tasks whose bodies were dropped before finishing.
    pub(crate) fn abandon(&mut self, hashes: impl IntoIterator<Item = Hash32>) {
        for hash in hashes {
            let Some(entry) = self.entries.get_mut(&hash) else {
                continue;
            };
            if entry.state != NodeState::Running || entry.awaiting.is_some() {
                continue;
            }
            let Node::Task(task) = entry.node.clone() else {
                continue;
            };
            entry.state = NodeState::Ready;
            let seq = entry.seq;
            self.stop(&task);
            self.ready.push(Queued {
                priority: task.rule().config().priority,
                seq,
                hash,
            });
        }
    }

    /// Tasks that were registered but never started.
    pub(crate) fn never_run(&self) -> Vec<&Node> {
        self.entries
            .values()
            .filter(|entry| matches!(entry.state, NodeState::Pending | NodeState::Ready))
            .filter(|entry| matches!(entry.node, Node::Task(_)))
            .map(|entry| &entry.node)
            .collect()
    }
}

fn cyclic(node: &Node) -> Error {
    Error::CyclicGraph {
        label: node.label(),
        hash: node.hash().short(),
    }
}

/// The error a node fails with when one of its dependencies failed.
fn propagated(node: &Node, cause: &Error) -> Error {
    match node {
        Node::Component(_) => cause.clone(),
        Node::Task(task) => Error::DependencyFailed {
            label: task.label().to_string(),
            hash: task.hash().short(),
            cause: Box::new(cause.clone()),
        },
    }
}
