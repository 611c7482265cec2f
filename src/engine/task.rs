use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hasher;
use std::sync::Arc;

use crate::core::Hash32;
use crate::engine::{Arg, Key, Node, TaskComponent, collect_nodes};
use crate::error::Error;
use crate::hash::HashWriter;
use crate::rule::{Inputs, Rule};
use crate::value::Value;

const MAX_LABEL: usize = 80;

/// A single invocation of a [`Rule`] with concrete arguments.
///
/// Tasks are cheap handles; cloning one clones an `Arc`. Two tasks are equal
/// exactly when their content hashes are equal, which is the case whenever
/// they were built from the same rule and equal arguments.
#[derive(Clone)]
pub struct Task(Arc<TaskInner>);

struct TaskInner {
    rule: Rule,
    args: Vec<Arg>,
    kwargs: BTreeMap<String, Arg>,
    hash: Hash32,
    required: Vec<Node>,
    label: String,
}

impl Task {
    pub(crate) fn new(
        rule: Rule,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
    ) -> Result<Task, Error> {
        let mut writer = HashWriter::new("task");
        writer.write_str(rule.name());
        match &rule.config().version {
            Some(version) => {
                writer.write_tag(1);
                writer.write_str(version);
            }
            None => writer.write_tag(0),
        }
        writer.write_len(args.len());
        for arg in &args {
            arg.write_hash(&mut writer)?;
        }
        writer.write_len(kwargs.len());
        for (key, arg) in &kwargs {
            writer.write_str(key);
            arg.write_hash(&mut writer)?;
        }

        let mut required = Vec::new();
        collect_nodes(args.iter().chain(kwargs.values()), &mut required);

        let label = match &rule.config().label {
            Some(label) => label.clone(),
            None => default_label(rule.name(), &args, &kwargs),
        };

        Ok(Task(Arc::new(TaskInner {
            rule,
            args,
            kwargs,
            hash: writer.into(),
            required,
            label,
        })))
    }

    pub fn hash(&self) -> Hash32 {
        self.0.hash
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn rule(&self) -> &Rule {
        &self.0.rule
    }

    pub fn args(&self) -> &[Arg] {
        &self.0.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Arg> {
        &self.0.kwargs
    }

    /// Distinct nodes embedded anywhere in the arguments. These must all be
    /// done before the body can run.
    pub fn required(&self) -> &[Node] {
        &self.0.required
    }

    /// A view on a part of this task's result.
    ///
    /// ```
    /// # use hashflow::{Rule, args};
    /// let rule = Rule::from_fn("pair", |_| Ok(hashflow::Arg::from(vec![1i64, 2])));
    /// let task = rule.task(args![]).unwrap();
    /// let second = task.get(1usize);
    /// assert_eq!(second.task(), &task);
    /// ```
    pub fn get(&self, key: impl Into<Key>) -> TaskComponent {
        TaskComponent::new(self.clone(), vec![key.into()])
    }

    /// Alias of [`Task::get`] for map fields.
    pub fn field(&self, name: &str) -> TaskComponent {
        self.get(name)
    }

    /// Substitutes dependency results into the arguments.
    pub(crate) fn inputs<E>(
        &self,
        lookup: &mut impl FnMut(&Node) -> Result<Value, E>,
    ) -> Result<Inputs, E> {
        let args = self
            .0
            .args
            .iter()
            .map(|arg| arg.substitute(lookup))
            .collect::<Result<Vec<_>, _>>()?;
        let mut kwargs = BTreeMap::new();
        for (key, arg) in &self.0.kwargs {
            kwargs.insert(key.clone(), arg.substitute(lookup)?);
        }
        Ok(Inputs::new(args, kwargs))
    }
}

fn default_label(name: &str, args: &[Arg], kwargs: &BTreeMap<String, Arg>) -> String {
    let mut parts: Vec<String> = args.iter().map(render).collect();
    parts.extend(kwargs.iter().map(|(k, v)| format!("{k}={}", render(v))));

    let mut label = format!("{name}({})", parts.join(", "));
    if label.len() > MAX_LABEL {
        let mut cut = MAX_LABEL - 4;
        while !label.is_char_boundary(cut) {
            cut -= 1;
        }
        label.truncate(cut);
        label.push_str("...)");
    }
    label
}

fn render(arg: &Arg) -> String {
    match arg {
        Arg::Leaf(value) => value.to_string(),
        Arg::Node(node) => format!("#{}", node.hash().short()),
        Arg::List(items) => {
            let items: Vec<_> = items.iter().map(render).collect();
            format!("[{}]", items.join(", "))
        }
        Arg::Map(map) => {
            let items: Vec<_> = map
                .iter()
                .map(|(k, v)| format!("{k:?}: {}", render(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.0.hash == other.0.hash
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(&self.0.hash, state);
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({}, {})", self.0.label, self.0.hash.short())
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    fn add() -> Rule {
        Rule::from_fn("add", |inputs| Ok(inputs.int(0)? + inputs.int(1)?))
    }

    #[test]
    fn test_equal_definitions_hash_equal() {
        let a = add().task(args![1, 2]).unwrap();
        let b = add().task(args![1, 2]).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);

        let c = add().task(args![2, 1]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_rule_name_and_version_are_identity() {
        let plain = add().task(args![1, 2]).unwrap();

        let renamed = Rule::from_fn("sum", |inputs| Ok(inputs.int(0)? + inputs.int(1)?));
        assert_ne!(plain, renamed.task(args![1, 2]).unwrap());

        let versioned = Rule::builder("add")
            .version("2")
            .func(|inputs| Ok(inputs.int(0)? + inputs.int(1)?));
        assert_ne!(plain, versioned.task(args![1, 2]).unwrap());
    }

    #[test]
    fn test_label_and_priority_are_not_identity() {
        let plain = add().task(args![1, 2]).unwrap();
        let labelled = Rule::builder("add")
            .label("the sum")
            .priority(10)
            .limit(1)
            .func(|inputs| Ok(inputs.int(0)? + inputs.int(1)?));

        let task = labelled.task(args![1, 2]).unwrap();
        assert_eq!(plain, task);
        assert_eq!(task.label(), "the sum");
        assert_eq!(plain.label(), "add(1, 2)");
    }

    #[test]
    fn test_kwargs_are_identity() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("scale".to_string(), Arg::from(2i64));
        let with = add().task_with(args![1, 2], kwargs).unwrap();
        let without = add().task(args![1, 2]).unwrap();
        assert_ne!(with, without);
        assert_eq!(with.label(), "add(1, 2, scale=2)");
    }

    #[test]
    fn test_required_is_deduplicated() {
        let a = add().task(args![1, 2]).unwrap();
        let b = add().task(args![&a, &a]).unwrap();
        assert_eq!(b.required().len(), 1);
        assert_eq!(b.required()[0].hash(), a.hash());
        assert!(b.label().starts_with("add(#"));
    }

    #[test]
    fn test_long_labels_are_truncated() {
        let long = "x".repeat(200);
        let task = add().task(args![long.as_str(), 1]).unwrap();
        assert!(task.label().len() <= MAX_LABEL);
        assert!(task.label().ends_with("...)"));
    }

    #[test]
    fn test_unhashable_argument() {
        let err = add().task(args![f64::NAN, 1]).unwrap_err();
        assert!(matches!(err, Error::UnhashableValue(_)));
    }
}
