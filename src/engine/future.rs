use std::fmt::{Debug, Formatter};

use tokio::sync::watch;

use crate::core::Hash32;
use crate::engine::Node;
use crate::error::Error;
use crate::value::Value;

/// Outcome of a node as published by the session.
#[derive(Clone, Debug, Default)]
pub(crate) enum Resolution {
    #[default]
    Pending,
    Done(Value),
    Failed(Error),
}

impl Resolution {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending)
    }

    fn to_result(&self, node: &Node) -> Result<Value, Error> {
        match self {
            Resolution::Pending => Err(Error::InvalidState(format!(
                "'{}' ({}) has not finished yet",
                node.label(),
                node.hash().short()
            ))),
            Resolution::Done(value) => Ok(value.clone()),
            Resolution::Failed(error) => Err(error.clone()),
        }
    }
}

/// Handle on the outcome of one node inside one session.
///
/// A future moves from pending to done or failed exactly once. It can also be
/// embedded into the arguments of another task, where it stands for its node.
#[derive(Clone)]
pub struct Future {
    node: Node,
    rx: watch::Receiver<Resolution>,
}

impl Future {
    pub(crate) fn new(node: Node, rx: watch::Receiver<Resolution>) -> Self {
        Future { node, rx }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn hash(&self) -> Hash32 {
        self.node.hash()
    }

    pub fn is_pending(&self) -> bool {
        self.rx.borrow().is_pending()
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.rx.borrow(), Resolution::Done(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.rx.borrow(), Resolution::Failed(_))
    }

    /// The result, without waiting. Pending futures fail with
    /// [`Error::InvalidState`].
    pub fn result(&self) -> Result<Value, Error> {
        self.rx.borrow().to_result(&self.node)
    }

    /// Waits until the node is resolved. Returns at once if it already is.
    ///
    /// Waiting does not drive the session; something else must be evaluating
    /// the graph, typically the scheduler that is polling the calling task.
    pub async fn wait(&self) -> Result<Value, Error> {
        let mut rx = self.rx.clone();
        let node = &self.node;
        match rx.wait_for(|resolution| !resolution.is_pending()).await {
            Ok(resolution) => resolution.to_result(node),
            Err(_) => Err(Error::InvalidState(format!(
                "session dropped before '{}' ({}) was resolved",
                node.label(),
                node.hash().short()
            ))),
        }
    }
}

impl Debug for Future {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("node", &self.node)
            .field("resolution", &*self.rx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::rule::Rule;

    fn node() -> Node {
        Rule::from_fn("one", |_| Ok(1i64))
            .task(args![])
            .unwrap()
            .into()
    }

    #[test]
    fn test_pending_result_is_invalid_state() {
        let (_tx, rx) = watch::channel(Resolution::Pending);
        let future = Future::new(node(), rx);

        assert!(future.is_pending());
        assert!(matches!(future.result(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_wait_sees_resolution() {
        let (tx, rx) = watch::channel(Resolution::Pending);
        let future = Future::new(node(), rx);

        let waiter = tokio::spawn({
            let future = future.clone();
            async move { future.wait().await }
        });
        tx.send_replace(Resolution::Done(Value::Integer(1)));

        assert_eq!(waiter.await.unwrap().unwrap(), Value::Integer(1));
        assert!(future.is_done());
        assert_eq!(future.result().unwrap(), Value::Integer(1));
    }

    #[tokio::test]
    async fn test_wait_on_dropped_session() {
        let (tx, rx) = watch::channel(Resolution::Pending);
        let future = Future::new(node(), rx);
        drop(tx);

        assert!(matches!(future.wait().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let (tx, rx) = watch::channel(Resolution::Pending);
        let future = Future::new(node(), rx);
        tx.send_replace(Resolution::Failed(Error::Internal("boom".into())));

        assert!(future.is_failed());
        assert!(matches!(future.wait().await, Err(Error::Internal(_))));
    }
}
