//! Work descriptors and task graphs
//!
//! A [`WorkDescriptor`] is what a session hands to the orchestrator: the
//! control image and entry it was built from, the caller's argument list and
//! the task graph the entry produced. It is immutable once built.

use std::fmt;

use serde::Serialize;

use crate::error::{Result, RuntimeError};
use crate::handshake::CoreKind;

/// Kind of value carried by one entry argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgTag {
    /// Raw 64-bit value
    Scalar,
    /// Device address of a buffer staged through the host API
    Tensor,
}

impl ArgTag {
    /// Decode the integer tag used at the C boundary
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(ArgTag::Scalar),
            1 => Ok(ArgTag::Tensor),
            other => Err(RuntimeError::invalid_argument(format!("unknown argument tag {other}"))),
        }
    }
}

impl fmt::Display for ArgTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgTag::Scalar => write!(f, "scalar"),
            ArgTag::Tensor => write!(f, "tensor"),
        }
    }
}

/// One argument passed to a control entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArgValue {
    pub value: u64,
    pub tag: ArgTag,
    /// Size in bytes of the value, or of the buffer for tensors
    pub size: usize,
}

impl ArgValue {
    pub fn scalar(value: u64) -> Self {
        Self {
            value,
            tag: ArgTag::Scalar,
            size: 8,
        }
    }

    pub fn tensor(addr: u64, size: usize) -> Self {
        Self {
            value: addr,
            tag: ArgTag::Tensor,
            size,
        }
    }

    /// Reject tensors without a buffer
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.tag == ArgTag::Tensor && (self.value == 0 || self.size == 0) {
            return Err(RuntimeError::invalid_argument(format!(
                "argument {index} is a tensor without a device buffer"
            )));
        }
        Ok(())
    }
}

/// One kernel invocation in a task graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub func_id: u32,
    pub core: CoreKind,
    /// Argument words handed to the kernel, usually tensor descriptor addresses
    pub args: Vec<u64>,
    pub successors: Vec<u32>,
    /// Number of predecessors
    pub fanin: u32,
}

/// Dependency graph of kernel invocations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task and return its id
    pub fn add_task(&mut self, func_id: u32, core: CoreKind, args: &[u64]) -> u32 {
        let id = self.tasks.len() as u32;
        self.tasks.push(Task {
            func_id,
            core,
            args: args.to_vec(),
            successors: Vec::new(),
            fanin: 0,
        });
        id
    }

    /// Make `to` wait for `from`
    pub fn add_successor(&mut self, from: u32, to: u32) -> Result<()> {
        let count = self.tasks.len() as u32;
        if from >= count || to >= count {
            return Err(RuntimeError::invalid_argument(format!(
                "edge {from} -> {to} references a task outside 0..{count}"
            )));
        }
        if from == to {
            return Err(RuntimeError::invalid_argument(format!("task {from} cannot depend on itself")));
        }
        let edges = &mut self.tasks[from as usize].successors;
        if edges.contains(&to) {
            return Ok(());
        }
        edges.push(to);
        self.tasks[to as usize].fanin += 1;
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: u32) -> Option<&Task> {
        self.tasks.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks per core kind
    pub fn kind_counts(&self) -> (usize, usize) {
        let matrix = self.tasks.iter().filter(|t| t.core == CoreKind::Matrix).count();
        (matrix, self.tasks.len() - matrix)
    }

    /// Fail if the dependency edges contain a cycle
    pub fn check_acyclic(&self) -> Result<()> {
        let mut fanin: Vec<u32> = self.tasks.iter().map(|t| t.fanin).collect();
        let mut ready: Vec<usize> = (0..self.tasks.len()).filter(|i| fanin[*i] == 0).collect();
        let mut visited = 0;
        while let Some(task) = ready.pop() {
            visited += 1;
            for succ in &self.tasks[task].successors {
                let remaining = &mut fanin[*succ as usize];
                *remaining -= 1;
                if *remaining == 0 {
                    ready.push(*succ as usize);
                }
            }
        }
        if visited != self.tasks.len() {
            return Err(RuntimeError::invalid_argument(format!(
                "task graph has a cycle through {} tasks",
                self.tasks.len() - visited
            )));
        }
        Ok(())
    }
}

/// Everything needed to run one unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkDescriptor {
    #[serde(skip)]
    image: Vec<u8>,
    entry: String,
    args: Vec<ArgValue>,
    graph: TaskGraph,
}

impl WorkDescriptor {
    pub fn new(image: &[u8], entry: &str, args: Vec<ArgValue>, graph: TaskGraph) -> Self {
        Self {
            image: image.to_vec(),
            entry: entry.to_string(),
            args,
            graph,
        }
    }

    /// Control image the descriptor was built from
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn task_count(&self) -> usize {
        self.graph.len()
    }
}
