#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod context;
mod core;
mod engine;
mod error;
mod executor;
mod hash;
#[cfg(feature = "logging")]
pub mod logging;
mod rule;
mod session;
mod storage;
mod utils;
mod value;

pub use crate::context::TaskContext;
pub use crate::core::{Hash32, ParseHashError};
pub use crate::engine::{Arg, Future, Key, Node, Task, TaskComponent, TaskComposite};
pub use crate::error::{Error, ProcessError, RuntimeError, TaskResult};
pub use crate::executor::{Process, ProcessOutput, run_process, run_shell, run_thread};
pub use crate::hash::{ContentHash, hash};
pub use crate::rule::{Inputs, Rule, RuleBody, RuleBuilder, RuleConfig};
pub use crate::session::{
    EdgeInfo, GraphExport, NodeInfo, NodeKind, NodeState, Session, SessionBuilder, Stats,
};
pub use crate::storage::{FileStorage, MemoryStorage, Storage};
pub use crate::value::Value;

/// Builds a `Vec<Arg>` of positional arguments.
///
/// ```
/// use hashflow::{Rule, args};
///
/// let add = Rule::from_fn("add", |inputs| Ok(inputs.int(0)? + inputs.int(1)?));
/// let x = add.task(args![1, 2]).unwrap();
/// let y = add.task(args![&x, 3]).unwrap();
/// assert_eq!(y.required().len(), 1);
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::Arg::from($arg)),*]
    };
}
