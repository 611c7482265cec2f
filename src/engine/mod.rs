//! The graph model: tasks, their components, composites and futures.
//!
//! Everything here is immutable once built. A [`Task`] is just a definition,
//! identified by its content hash; its state lives in whichever
//! [`Session`](crate::Session) resolves it.

mod component;
mod composite;
mod future;
mod task;

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Debug, Formatter};

use crate::core::Hash32;
use crate::error::Error;
use crate::hash::{ContentHash, HashWriter, TAG_LIST, TAG_MAP, TAG_NODE};
use crate::value::Value;

pub use crate::engine::component::{Key, TaskComponent};
pub use crate::engine::composite::TaskComposite;
pub use crate::engine::future::Future;
pub(crate) use crate::engine::future::Resolution;
pub use crate::engine::task::Task;

/// A node that the scheduler can register and resolve.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Node {
    Task(Task),
    Component(TaskComponent),
}

impl Node {
    pub fn hash(&self) -> Hash32 {
        match self {
            Node::Task(task) => task.hash(),
            Node::Component(component) => component.hash(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Node::Task(task) => task.label().to_string(),
            Node::Component(component) => component.label(),
        }
    }

    /// The task that has to run for this node to resolve.
    pub fn task(&self) -> &Task {
        match self {
            Node::Task(task) => task,
            Node::Component(component) => component.task(),
        }
    }

    /// Direct dependencies of this node in the scheduler's graph.
    pub(crate) fn dependencies(&self) -> Vec<Node> {
        match self {
            Node::Task(task) => task.required().to_vec(),
            Node::Component(component) => vec![Node::Task(component.task().clone())],
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Task(task) => Debug::fmt(task, f),
            Node::Component(component) => Debug::fmt(component, f),
        }
    }
}

impl From<Task> for Node {
    fn from(value: Task) -> Self {
        Node::Task(value)
    }
}

impl From<&Task> for Node {
    fn from(value: &Task) -> Self {
        Node::Task(value.clone())
    }
}

impl From<TaskComponent> for Node {
    fn from(value: TaskComponent) -> Self {
        Node::Component(value)
    }
}

/// An argument, or a task result: plain data with graph nodes embedded at
/// arbitrary depth.
#[derive(Clone, Debug)]
pub enum Arg {
    Leaf(Value),
    Node(Node),
    List(Vec<Arg>),
    Map(BTreeMap<String, Arg>),
}

impl Arg {
    /// Wraps any serializable value as a leaf.
    pub fn value<T>(value: &T) -> Result<Arg, Error>
    where
        T: serde::Serialize + ?Sized,
    {
        Ok(Arg::Leaf(Value::from_serialize(value)?))
    }

    /// Replaces every embedded node with the value returned by `lookup`.
    ///
    /// This is the one traversal over the variant; collecting nodes and
    /// substituting results both go through it.
    pub fn substitute<E>(
        &self,
        lookup: &mut impl FnMut(&Node) -> Result<Value, E>,
    ) -> Result<Value, E> {
        Ok(match self {
            Arg::Leaf(value) => value.clone(),
            Arg::Node(node) => lookup(node)?,
            Arg::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| item.substitute(lookup))
                    .collect::<Result<_, _>>()?,
            ),
            Arg::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), item.substitute(lookup)?);
                }
                Value::Map(out)
            }
        })
    }

    /// Distinct embedded nodes, in order of first appearance.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        collect_nodes(std::slice::from_ref(self), &mut nodes);
        nodes
    }

    pub fn has_nodes(&self) -> bool {
        match self {
            Arg::Leaf(_) => false,
            Arg::Node(_) => true,
            Arg::List(items) => items.iter().any(Arg::has_nodes),
            Arg::Map(map) => map.values().any(Arg::has_nodes),
        }
    }

    /// The plain value, if nothing in this argument refers to the graph.
    pub fn into_value(self) -> Option<Value> {
        self.into_value_or_arg().ok()
    }

    pub(crate) fn into_value_or_arg(self) -> Result<Value, Arg> {
        if self.has_nodes() {
            return Err(self);
        }
        match self.substitute(&mut |_| Err(())) {
            Ok(value) => Ok(value),
            Err(()) => Err(self),
        }
    }

    pub(crate) fn write_hash(&self, writer: &mut HashWriter) -> Result<(), Error> {
        match self {
            Arg::Leaf(value) => writer.write_value(value)?,
            Arg::Node(node) => {
                writer.write_tag(TAG_NODE);
                writer.write_hash(&node.hash());
            }
            Arg::List(items) => {
                writer.write_tag(TAG_LIST);
                writer.write_len(items.len());
                for item in items {
                    item.write_hash(writer)?;
                }
            }
            Arg::Map(map) => {
                writer.write_tag(TAG_MAP);
                writer.write_len(map.len());
                for (key, item) in map {
                    writer.write_str(key);
                    item.write_hash(writer)?;
                }
            }
        }
        Ok(())
    }
}

/// Plain data hashes exactly like the equivalent [`Value`].
impl ContentHash for Arg {
    fn content_hash(&self) -> Result<Hash32, Error> {
        let mut writer = HashWriter::new("value");
        self.write_hash(&mut writer)?;
        Ok(writer.into())
    }
}

pub(crate) fn collect_nodes<'a>(args: impl IntoIterator<Item = &'a Arg>, into: &mut Vec<Node>) {
    let mut seen: HashSet<Hash32> = into.iter().map(Node::hash).collect();
    for arg in args {
        let _ = arg.substitute(&mut |node| {
            if seen.insert(node.hash()) {
                into.push(node.clone());
            }
            Ok::<_, ()>(Value::Null)
        });
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Leaf(value)
    }
}

impl From<Node> for Arg {
    fn from(value: Node) -> Self {
        Arg::Node(value)
    }
}

impl From<Task> for Arg {
    fn from(value: Task) -> Self {
        Arg::Node(Node::Task(value))
    }
}

impl From<&Task> for Arg {
    fn from(value: &Task) -> Self {
        Arg::Node(Node::Task(value.clone()))
    }
}

impl From<TaskComponent> for Arg {
    fn from(value: TaskComponent) -> Self {
        Arg::Node(Node::Component(value))
    }
}

impl From<Future> for Arg {
    fn from(value: Future) -> Self {
        Arg::Node(value.node().clone())
    }
}

impl From<TaskComposite> for Arg {
    fn from(value: TaskComposite) -> Self {
        value.into_arg()
    }
}

impl<A> From<Vec<A>> for Arg
where
    A: Into<Arg>,
{
    fn from(value: Vec<A>) -> Self {
        Arg::List(value.into_iter().map(Into::into).collect())
    }
}

impl<A> From<BTreeMap<String, A>> for Arg
where
    A: Into<Arg>,
{
    fn from(value: BTreeMap<String, A>) -> Self {
        Arg::Map(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

macro_rules! leaf_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Leaf(Value::from(value))
                }
            }
        )*
    };
}

leaf_from!(bool, i64, i32, u32, f64, &str, String, serde_json::Value);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Rule;

    fn identity() -> Rule {
        Rule::from_fn("identity", |inputs| Ok(inputs.arg(0)?.clone()))
    }

    #[test]
    fn test_leaf_list_hashes_like_list_of_leaves() {
        let leaf = Arg::Leaf(Value::from(vec![1i64, 2, 3]));
        let list = Arg::List(vec![Arg::from(1i64), Arg::from(2i64), Arg::from(3i64)]);
        assert_eq!(leaf.content_hash().unwrap(), list.content_hash().unwrap());
        assert_eq!(
            leaf.content_hash().unwrap(),
            Value::from(vec![1i64, 2, 3]).content_hash().unwrap()
        );
    }

    #[test]
    fn test_nodes_are_distinct_and_ordered() {
        let rule = identity();
        let a = rule.task(vec![Arg::from(1i64)]).unwrap();
        let b = rule.task(vec![Arg::from(2i64)]).unwrap();

        let arg = Arg::from(vec![
            Arg::from(&b),
            Arg::from(&a),
            Arg::from(vec![Arg::from(&b), Arg::from("x")]),
        ]);

        let nodes = arg.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].hash(), b.hash());
        assert_eq!(nodes[1].hash(), a.hash());
        assert!(arg.has_nodes());
        assert!(arg.clone().into_value().is_none());
    }

    #[test]
    fn test_substitute() {
        let rule = identity();
        let a = rule.task(vec![Arg::from(1i64)]).unwrap();

        let mut map = BTreeMap::new();
        map.insert("x".to_string(), Arg::from(&a));
        map.insert("y".to_string(), Arg::from(true));
        let arg = Arg::from(map);

        let value = arg
            .substitute(&mut |node| {
                assert_eq!(node.hash(), a.hash());
                Ok::<_, Error>(Value::from(42i64))
            })
            .unwrap();

        assert_eq!(value.field("x"), Some(&Value::Integer(42)));
        assert_eq!(value.field("y"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_node_changes_hash() {
        let rule = identity();
        let a = rule.task(vec![Arg::from(1i64)]).unwrap();
        let b = rule.task(vec![Arg::from(2i64)]).unwrap();

        let with_a = Arg::from(vec![Arg::from(&a)]).content_hash().unwrap();
        let with_b = Arg::from(vec![Arg::from(&b)]).content_hash().unwrap();
        assert_ne!(with_a, with_b);
    }
}
