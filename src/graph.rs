//! Task dependency graph for visualization.
//!
//! Nodes are tasks, binder nodes and core frequency changes; edges are the
//! dependencies the tree links while replaying. Nothing here feeds back into
//! energy accounting.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::task::{TaskKind, TaskRef};

#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    Task { task: TaskRef, pid: u32, ts: u64 },
    Binder { task: TaskRef, pid: u32, ts: u64 },
    FreqChange { core: u32, ts: u64, freq: u64 },
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphNode::Task { task, pid, ts } => write!(f, "task {pid}#{} @{ts}", task.index),
            GraphNode::Binder { task, pid, ts } => {
                write!(f, "binder {pid}#{} @{ts}", task.index)
            }
            GraphNode::FreqChange { core, ts, freq } => {
                write!(f, "cpu{core} {} MHz @{ts}", freq / 1_000_000)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Successive tasks of one thread.
    Task,
    /// Binder node to the task it woke.
    Binder,
    /// Drawn only: caller task to the binder node serving it.
    Draw,
    /// Frequency change to the task it interrupted.
    Freq,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeKind::Task => "task",
            EdgeKind::Binder => "binder",
            EdgeKind::Draw => "draw",
            EdgeKind::Freq => "freq",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: DiGraph<GraphNode, EdgeKind>,
    tasks: HashMap<TaskRef, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `task`, added on first use.
    pub fn add_task(&mut self, task: TaskRef, pid: u32, ts: u64) -> NodeIndex {
        if let Some(idx) = self.tasks.get(&task) {
            return *idx;
        }
        let node = match task.kind {
            TaskKind::Task => GraphNode::Task { task, pid, ts },
            TaskKind::Binder => GraphNode::Binder { task, pid, ts },
        };
        let idx = self.graph.add_node(node);
        self.tasks.insert(task, idx);
        idx
    }

    /// Link two tasks that already have nodes. Returns false otherwise.
    pub fn link(&mut self, from: TaskRef, to: TaskRef, kind: EdgeKind) -> bool {
        match (self.tasks.get(&from), self.tasks.get(&to)) {
            (Some(a), Some(b)) => {
                self.graph.update_edge(*a, *b, kind);
                true
            }
            _ => false,
        }
    }

    /// Record a frequency change of `core` and the tasks it interrupted.
    pub fn add_freq_change(&mut self, core: u32, ts: u64, freq: u64, tasks: &[TaskRef]) {
        let idx = self.graph.add_node(GraphNode::FreqChange { core, ts, freq });
        for task in tasks {
            if let Some(task_idx) = self.tasks.get(task) {
                self.graph.add_edge(idx, *task_idx, EdgeKind::Freq);
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&GraphNode, &GraphNode, EdgeKind)> + '_ {
        self.graph.edge_indices().filter_map(move |edge| {
            let (a, b) = self.graph.edge_endpoints(edge)?;
            Some((&self.graph[a], &self.graph[b], self.graph[edge]))
        })
    }

    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.graph))
    }

    pub fn write_dot(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_dot())
            .with_context(|| format!("Failed to write graph to {}", path.display()))
    }
}
