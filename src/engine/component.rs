use std::fmt::{Debug, Display, Formatter};

use crate::core::Hash32;
use crate::engine::Task;
use crate::error::Error;
use crate::hash::HashWriter;
use crate::value::Value;

/// One step of a component path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Index(usize),
    Field(String),
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Index(index) => write!(f, "{index}"),
            Key::Field(field) => f.write_str(field),
        }
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Key::Index(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Field(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Field(value)
    }
}

/// A part of a task's eventual result, addressed by a path of keys.
///
/// A component depends on its task only, and is done as soon as the task is
/// done and the path exists in the result.
#[derive(Clone)]
pub struct TaskComponent {
    task: Task,
    path: Vec<Key>,
    hash: Hash32,
}

impl TaskComponent {
    pub(crate) fn new(task: Task, path: Vec<Key>) -> Self {
        let mut writer = HashWriter::new("component");
        writer.write_hash(&task.hash());
        writer.write_len(path.len());
        for key in &path {
            match key {
                Key::Index(index) => {
                    writer.write_tag(0);
                    writer.write_u64(*index as u64);
                }
                Key::Field(field) => {
                    writer.write_tag(1);
                    writer.write_str(field);
                }
            }
        }

        TaskComponent {
            task,
            path,
            hash: writer.into(),
        }
    }

    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn path(&self) -> &[Key] {
        &self.path
    }

    pub fn label(&self) -> String {
        let mut label = self.task.label().to_string();
        for key in &self.path {
            match key {
                Key::Index(index) => label.push_str(&format!("[{index}]")),
                Key::Field(field) => label.push_str(&format!("[{field:?}]")),
            }
        }
        label
    }

    /// A deeper view on the same task.
    pub fn get(&self, key: impl Into<Key>) -> TaskComponent {
        let mut path = self.path.clone();
        path.push(key.into());
        TaskComponent::new(self.task.clone(), path)
    }

    /// Extracts this component from the task's full result.
    pub fn resolve(&self, value: &Value) -> Result<Value, Error> {
        let mut current = value;
        for key in &self.path {
            let next = match key {
                Key::Index(index) => current.index(*index),
                Key::Field(field) => current.field(field),
            };
            current = next.ok_or_else(|| Error::ComponentIndex {
                component: self.label(),
                key: key.to_string(),
            })?;
        }
        Ok(current.clone())
    }
}

impl PartialEq for TaskComponent {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for TaskComponent {}

impl std::hash::Hash for TaskComponent {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(&self.hash, state);
    }
}

impl Debug for TaskComponent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskComponent({}, {})", self.label(), self.hash.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::rule::Rule;

    fn pair() -> Task {
        Rule::from_fn("pair", |_| Ok(serde_json::json!({"xs": [10, 20]})))
            .task(args![])
            .unwrap()
    }

    #[test]
    fn test_nested_path() {
        let task = pair();
        let component = task.field("xs").get(1usize);
        assert_eq!(component.path(), &[Key::from("xs"), Key::Index(1)]);
        assert_eq!(component.task(), &task);
        assert_eq!(component.label(), "pair()[\"xs\"][1]");

        let value = Value::from(serde_json::json!({"xs": [10, 20]}));
        assert_eq!(component.resolve(&value).unwrap(), Value::Integer(20));
    }

    #[test]
    fn test_missing_path() {
        let component = pair().field("xs").get(5usize);
        let value = Value::from(serde_json::json!({"xs": [10, 20]}));

        let err = component.resolve(&value).unwrap_err();
        match err {
            Error::ComponentIndex { key, .. } => assert_eq!(key, "5"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hash_depends_on_path() {
        let task = pair();
        assert_eq!(task.get(0usize), task.get(0usize));
        assert_ne!(task.get(0usize), task.get(1usize));
        assert_ne!(task.get("0").hash(), task.get(0usize).hash());
        assert_ne!(task.get(0usize).hash(), task.hash());
    }
}
