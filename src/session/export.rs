use std::fmt::{Display, Formatter};
use std::time::Duration;

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::Hash32;
use crate::engine::Node;
use crate::session::registry::{NodeState, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Task,
    Component,
}

/// A registered node, as seen at the time of the snapshot.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub hash: Hash32,
    pub label: String,
    pub kind: NodeKind,
    pub state: NodeState,
    /// Resolved from storage without running.
    pub cached: bool,
    /// Wall time of the body, for tasks that ran.
    pub duration: Option<Duration>,
}

impl Display for NodeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}\n", self.label, self.hash.short())?;
        match (self.cached, self.duration) {
            (true, _) => f.write_str("cached"),
            (false, Some(duration)) => write!(f, "{} {:.2?}", self.state, duration),
            (false, None) => write!(f, "{}", self.state),
        }
    }
}

/// `dependency -> dependent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeInfo;

impl Display for EdgeInfo {
    fn fmt(&self, _: &mut Formatter<'_>) -> std::fmt::Result {
        Ok(())
    }
}

/// Snapshot of a session's dependency graph, renderable as Graphviz DOT.
///
/// Edges point from a dependency to its dependent. Nodes are coloured by
/// state: cached results light blue, failures red, executed tasks on a
/// green to red scale of how long their body took.
#[derive(Debug, Clone)]
pub struct GraphExport {
    graph: DiGraph<NodeInfo, EdgeInfo>,
}

impl GraphExport {
    pub(crate) fn snapshot(registry: &Registry) -> Self {
        let graph = registry.graph.map(
            |_, hash| match registry.entries.get(hash) {
                Some(entry) => NodeInfo {
                    hash: *hash,
                    label: entry.node.label(),
                    kind: match entry.node {
                        Node::Task(_) => NodeKind::Task,
                        Node::Component(_) => NodeKind::Component,
                    },
                    state: entry.state,
                    cached: entry.cached,
                    duration: entry.duration,
                },
                None => NodeInfo {
                    hash: *hash,
                    label: hash.short(),
                    kind: NodeKind::Task,
                    state: NodeState::Pending,
                    cached: false,
                    duration: None,
                },
            },
            |_, _| EdgeInfo,
        );

        GraphExport { graph }
    }

    pub fn graph(&self) -> &DiGraph<NodeInfo, EdgeInfo> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, hash: &Hash32) -> Option<&NodeInfo> {
        self.graph.node_weights().find(|info| info.hash == *hash)
    }

    pub fn to_dot(&self) -> String {
        let (min, max) = self.duration_range();
        let edge_attrs = |_, _| String::new();
        let node_attrs = |_, (_, info): (NodeIndex, &NodeInfo)| {
            let shape = match info.kind {
                NodeKind::Task => "box",
                NodeKind::Component => "ellipse",
            };
            format!(
                "label = \"{}\" shape = {shape} style = filled fillcolor = \"{}\"",
                escape(&info.to_string()),
                fill(info, min, max),
            )
        };
        let dot = Dot::with_attr_getters(
            &self.graph,
            &[Config::EdgeNoLabel, Config::NodeNoLabel],
            &edge_attrs,
            &node_attrs,
        );
        dot.to_string()
    }

    fn duration_range(&self) -> (f64, f64) {
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for duration in self.graph.node_weights().filter_map(|info| info.duration) {
            let secs = duration.as_secs_f64();
            min = min.min(secs);
            max = max.max(secs);
        }
        if min > max {
            return (0.0, 1.0);
        }
        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }
        (min, max)
    }
}

impl Display for GraphExport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_dot())
    }
}

fn fill(info: &NodeInfo, min: f64, max: f64) -> String {
    if info.cached {
        return "#ADD8E6".into();
    }
    match (info.state, info.duration) {
        (NodeState::Failed, _) => "#F08080".into(),
        (NodeState::Running, _) => "#FFF59D".into(),
        (NodeState::Pending | NodeState::Ready, _) => "#FFFFFF".into(),
        (NodeState::Done, None) => "#E0E0E0".into(),
        (NodeState::Done, Some(duration)) => {
            // green -> yellow -> red
            let t = (duration.as_secs_f64() - min) / (max - min);
            let (r, g) = if t < 0.5 {
                ((255.0 * t * 2.0) as u8, 255)
            } else {
                (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
            };
            format!("#{r:02X}{g:02X}00")
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(label: &str, kind: NodeKind, cached: bool, millis: Option<u64>) -> NodeInfo {
        NodeInfo {
            hash: Hash32::hash(label),
            label: label.to_string(),
            kind,
            state: NodeState::Done,
            cached,
            duration: millis.map(Duration::from_millis),
        }
    }

    #[test]
    fn test_to_dot_shapes_and_escaping() {
        let mut graph = DiGraph::new();
        let fast = graph.add_node(info("say(\"hi\")", NodeKind::Task, false, Some(1)));
        let slow = graph.add_node(info("slow()", NodeKind::Task, false, Some(9)));
        let part = graph.add_node(info("slow()[0]", NodeKind::Component, true, None));
        graph.add_edge(fast, slow, EdgeInfo);
        graph.add_edge(slow, part, EdgeInfo);

        let export = GraphExport { graph };
        let dot = export.to_dot();
        assert!(dot.starts_with("digraph"));
        assert_eq!(dot.matches(" -> ").count(), 2);
        assert_eq!(dot.matches("shape = box").count(), 2);
        assert_eq!(dot.matches("shape = ellipse").count(), 1);
        assert!(dot.contains(r#"say(\"hi\")\n"#), "{dot}");
        // fastest green, slowest red, cached light blue
        assert!(dot.contains("#00FF00"), "{dot}");
        assert!(dot.contains("#FF0000"), "{dot}");
        assert!(dot.contains("#ADD8E6"), "{dot}");
        assert_eq!(export.to_string(), dot);
    }
}
