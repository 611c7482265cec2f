use crate::core::Hash32;
use crate::engine::{Arg, Node};
use crate::error::Error;
use crate::hash::ContentHash;
use crate::value::Value;

/// A value assembled from plain data and graph nodes.
///
/// The composite depends on exactly the nodes it embeds; resolving it
/// substitutes each of them with its result.
#[derive(Clone, Debug)]
pub struct TaskComposite {
    arg: Arg,
    hash: Hash32,
    nodes: Vec<Node>,
}

impl TaskComposite {
    pub fn new(arg: impl Into<Arg>) -> Result<Self, Error> {
        let arg = arg.into();
        let hash = arg.content_hash()?;
        let nodes = arg.nodes();
        Ok(TaskComposite { arg, hash, nodes })
    }

    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn arg(&self) -> &Arg {
        &self.arg
    }

    pub fn into_arg(self) -> Arg {
        self.arg
    }

    /// The embedded nodes, without duplicates.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn label(&self) -> String {
        format!("composite#{}", self.hash.short())
    }

    pub fn resolve<E>(
        &self,
        mut lookup: impl FnMut(&Node) -> Result<Value, E>,
    ) -> Result<Value, E> {
        self.arg.substitute(&mut lookup)
    }
}
