//! Rules turn functions into task factories.
//!
//! Calling a rule never runs the function: it builds a [`Task`] whose
//! identity is the rule's name (and version) plus the arguments. The body
//! runs later, when a [`Session`](crate::Session) schedules the task.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

use crate::context::TaskContext;
use crate::engine::{Arg, Task};
use crate::error::Error;
use crate::value::Value;

/// Type-erased rule body.
pub type RuleBody =
    Arc<dyn Fn(TaskContext, Inputs) -> BoxFuture<'static, anyhow::Result<Arg>> + Send + Sync>;

/// Scheduling and identity options of a rule.
#[derive(Clone, Debug, Default)]
pub struct RuleConfig {
    /// Maximum number of bodies of this rule running at once.
    pub limit: Option<usize>,
    /// Ready tasks with higher priority start first.
    pub priority: i32,
    /// Run the body at call time when no argument refers to the graph.
    pub eager: bool,
    /// Label for every task of this rule, instead of `name(args)`.
    pub label: Option<String>,
    /// Salt mixed into task hashes; bump it to invalidate stored results.
    pub version: Option<String>,
}

#[derive(Clone)]
pub struct Rule(Arc<RuleInner>);

struct RuleInner {
    name: String,
    config: RuleConfig,
    body: RuleBody,
    /// Set for [`RuleBuilder::func`] bodies, which complete on first poll.
    synchronous: bool,
}

impl Rule {
    /// A rule with an asynchronous body. The body receives a [`TaskContext`]
    /// to reach the execution backends.
    ///
    /// ```
    /// use hashflow::{Rule, TaskContext, Inputs};
    ///
    /// let greet = Rule::new("greet", |ctx: TaskContext, inputs: Inputs| async move {
    ///     let name = inputs.text(0)?.to_string();
    ///     let out = ctx.run_process("echo", &["hello", name.as_str()]).await?;
    ///     anyhow::Ok(out.stdout)
    /// });
    /// ```
    pub fn new<F, Fut, R>(name: impl Into<String>, body: F) -> Rule
    where
        F: Fn(TaskContext, Inputs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Arg>,
    {
        Rule::builder(name).body(body)
    }

    /// A rule with a synchronous, pure body.
    pub fn from_fn<F, R>(name: impl Into<String>, body: F) -> Rule
    where
        F: Fn(Inputs) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Arg>,
    {
        Rule::builder(name).func(body)
    }

    pub fn builder(name: impl Into<String>) -> RuleBuilder {
        RuleBuilder {
            name: name.into(),
            config: RuleConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn config(&self) -> &RuleConfig {
        &self.0.config
    }

    /// Builds a task from positional arguments.
    pub fn task(&self, args: Vec<Arg>) -> Result<Task, Error> {
        Task::new(self.clone(), args, BTreeMap::new())
    }

    /// Builds a task from positional and keyword arguments.
    pub fn task_with(&self, args: Vec<Arg>, kwargs: BTreeMap<String, Arg>) -> Result<Task, Error> {
        Task::new(self.clone(), args, kwargs)
    }

    /// Like [`Rule::task`], but eager rules whose arguments are plain data
    /// are run at once and return their result instead of a task.
    ///
    /// Synchronous bodies always run in place. Asynchronous ones are run to
    /// completion on a temporary current-thread runtime, which is why inside
    /// a tokio runtime they become tasks instead.
    pub fn call(&self, args: Vec<Arg>) -> Result<Arg, Error> {
        self.call_with(args, BTreeMap::new())
    }

    pub fn call_with(&self, args: Vec<Arg>, kwargs: BTreeMap<String, Arg>) -> Result<Arg, Error> {
        let task = self.task_with(args, kwargs)?;
        if !self.0.config.eager || !task.required().is_empty() {
            return Ok(task.into());
        }

        let inputs = task.inputs(&mut |_| Err(()));
        let Ok(inputs) = inputs else {
            return Ok(task.into());
        };

        let context = TaskContext::detached(task.clone());
        let outcome = if self.0.synchronous {
            self.invoke(context, inputs).now_or_never()
        } else if Handle::try_current().is_ok() {
            None
        } else {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Runtime(Arc::new(e)))?;
            Some(runtime.block_on(self.invoke(context, inputs)))
        };

        match outcome {
            Some(Ok(arg)) => Ok(arg),
            Some(Err(error)) => Err(Error::TaskExecution {
                label: task.label().to_string(),
                hash: task.hash().short(),
                error: Arc::new(error),
            }),
            None => {
                tracing::debug!("eager call of '{}' inside a runtime, deferring", task.label());
                Ok(task.into())
            }
        }
    }

    pub(crate) fn invoke(
        &self,
        context: TaskContext,
        inputs: Inputs,
    ) -> BoxFuture<'static, anyhow::Result<Arg>> {
        (self.0.body)(context, inputs)
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.0.name)
            .field("config", &self.0.config)
            .finish_non_exhaustive()
    }
}

/// Builder for rules with non-default [`RuleConfig`].
///
/// ```
/// use hashflow::Rule;
///
/// let compile = Rule::builder("compile")
///     .limit(2)
///     .priority(5)
///     .version("v2")
///     .func(|inputs| Ok(format!("compiled {}", inputs.text(0)?)));
/// assert_eq!(compile.config().limit, Some(2));
/// ```
#[derive(Debug)]
pub struct RuleBuilder {
    name: String,
    config: RuleConfig,
}

impl RuleBuilder {
    pub fn limit(mut self, limit: usize) -> Self {
        self.config.limit = Some(limit.max(1));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.config.eager = eager;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = Some(version.into());
        self
    }

    pub fn config(mut self, config: RuleConfig) -> Self {
        self.config = config;
        self
    }

    /// Finishes the rule with an asynchronous body.
    pub fn body<F, Fut, R>(self, body: F) -> Rule
    where
        F: Fn(TaskContext, Inputs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Arg>,
    {
        let body: RuleBody = Arc::new(move |context: TaskContext, inputs: Inputs| {
            body(context, inputs)
                .map(|out| out.map(Into::<Arg>::into))
                .boxed()
        });
        self.finish(body, false)
    }

    /// Finishes the rule with a synchronous body.
    pub fn func<F, R>(self, func: F) -> Rule
    where
        F: Fn(Inputs) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Arg>,
    {
        let func = Arc::new(func);
        let body: RuleBody = Arc::new(move |_: TaskContext, inputs: Inputs| {
            let func = func.clone();
            async move { func(inputs).map(Into::<Arg>::into) }.boxed()
        });
        self.finish(body, true)
    }

    fn finish(self, body: RuleBody, synchronous: bool) -> Rule {
        Rule(Arc::new(RuleInner {
            name: self.name,
            config: self.config,
            body,
            synchronous,
        }))
    }
}

/// Arguments of a task with every dependency replaced by its result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inputs {
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl Inputs {
    pub(crate) fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Inputs { args, kwargs }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arg(&self, index: usize) -> anyhow::Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("missing positional argument {index}"))
    }

    pub fn int(&self, index: usize) -> anyhow::Result<i64> {
        let value = self.arg(index)?;
        value
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("argument {index}: expected integer, got {}", value.type_name()))
    }

    pub fn float(&self, index: usize) -> anyhow::Result<f64> {
        let value = self.arg(index)?;
        value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("argument {index}: expected float, got {}", value.type_name()))
    }

    pub fn text(&self, index: usize) -> anyhow::Result<&str> {
        let value = self.arg(index)?;
        value
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("argument {index}: expected text, got {}", value.type_name()))
    }

    /// Deserializes a positional argument into any serde type.
    pub fn parse<T>(&self, index: usize) -> anyhow::Result<T>
    where
        T: DeserializeOwned,
    {
        self.arg(index)?.deserialize()
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Deserializes a keyword argument, if present.
    pub fn parse_kwarg<T>(&self, name: &str) -> anyhow::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.kwargs
            .get(name)
            .map(|value| value.deserialize::<T>())
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_task_construction_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rule = Rule::from_fn("count", {
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0i64)
            }
        });

        rule.task(args![1]).unwrap();
        assert!(matches!(rule.call(args![1]).unwrap(), Arg::Node(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_eager_call_returns_value() {
        let rule = Rule::builder("double")
            .eager(true)
            .func(|inputs| Ok(inputs.int(0)? * 2));

        let out = rule.call(args![21]).unwrap();
        assert_eq!(out.into_value(), Some(Value::Integer(42)));
    }

    #[test]
    fn test_eager_with_graph_argument_builds_task() {
        let rule = Rule::builder("double")
            .eager(true)
            .func(|inputs| Ok(inputs.int(0)? * 2));

        let inner = rule.task(args![1]).unwrap();
        let out = rule.call(args![&inner]).unwrap();
        match out {
            Arg::Node(node) => assert_eq!(node.task().required()[0].hash(), inner.hash()),
            other => panic!("expected a task, got {other:?}"),
        }
    }

    #[test]
    fn test_eager_async_body_runs_to_completion() {
        let rule = Rule::builder("later").eager(true).body(|_, _| async {
            tokio::task::yield_now().await;
            anyhow::Ok(1i64)
        });

        let out = rule.call(args![]).unwrap();
        assert_eq!(out.into_value(), Some(Value::Integer(1)));
    }

    #[test]
    fn test_eager_body_using_a_backend() {
        let rule = Rule::builder("echo")
            .eager(true)
            .body(|ctx: TaskContext, inputs: Inputs| async move {
                let word = inputs.text(0)?.to_string();
                let out = ctx.run_process("echo", [word.as_str()]).await?;
                anyhow::Ok(out.stdout)
            });

        let out = rule.call(args!["hi"]).unwrap();
        assert_eq!(out.into_value(), Some(Value::from("hi\n")));
    }

    #[tokio::test]
    async fn test_eager_async_body_inside_runtime_builds_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rule = Rule::builder("echo").eager(true).body({
            let calls = calls.clone();
            move |ctx: TaskContext, _: Inputs| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { anyhow::Ok(ctx.run_process("echo", ["hi"]).await?.stdout) }
            }
        });
        let double = Rule::builder("double")
            .eager(true)
            .func(|inputs| Ok(inputs.int(0)? * 2));

        assert!(matches!(rule.call(args![]).unwrap(), Arg::Node(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(double.call(args![4]).unwrap().into_value(), Some(Value::Integer(8)));
    }

    #[test]
    fn test_eager_failure() {
        let rule = Rule::builder("fail")
            .eager(true)
            .func(|_| -> anyhow::Result<i64> { anyhow::bail!("nope") });

        let err = rule.call(args![]).unwrap_err();
        assert!(matches!(err, Error::TaskExecution { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_inputs_accessors() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("basis".to_string(), Value::from("sto-3g"));
        let inputs = Inputs::new(vec![Value::from(3i64), Value::from(vec![1.5, 2.5])], kwargs);

        assert_eq!(inputs.int(0).unwrap(), 3);
        assert_eq!(inputs.parse::<Vec<f64>>(1).unwrap(), vec![1.5, 2.5]);
        assert!(inputs.text(0).is_err());
        assert!(inputs.arg(2).is_err());
        assert_eq!(inputs.parse_kwarg::<String>("basis").unwrap().as_deref(), Some("sto-3g"));
        assert_eq!(inputs.parse_kwarg::<String>("charge").unwrap(), None);
    }
}
