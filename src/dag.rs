use camino::{Utf8Path, Utf8PathBuf};

use crate::error::PipelineError;
use crate::script::OutputScript;

/// What a node does when its turn comes. Roots wrap a concrete input file
/// and execute as no-ops.
#[derive(Debug, Clone)]
pub enum NodeTask {
    Root(Utf8PathBuf),
    Script(OutputScript),
}

/// One node in the per-source processing graph. Parents are indices into the
/// owning arena and always point at earlier nodes.
#[derive(Debug, Clone)]
pub struct Node {
    pub index: usize,
    pub parents: Vec<usize>,
    pub task: NodeTask,
}

impl Node {
    pub fn output(&self) -> &Utf8Path {
        match &self.task {
            NodeTask::Root(path) => path,
            NodeTask::Script(script) => script.output.path(),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.task, NodeTask::Root(_))
    }
}

/// Flat-arena DAG: one root per registered download file, script nodes
/// chained below. Child nodes hold parent indices, so traversal never
/// follows owning pointers.
#[derive(Debug, Clone, Default)]
pub struct ProcessingDag {
    nodes: Vec<Node>,
    tails: Vec<usize>,
}

impl ProcessingDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Result<&Node, PipelineError> {
        self.nodes.get(index).ok_or(PipelineError::UnknownNode(index))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tails(&self) -> &[usize] {
        &self.tails
    }

    /// Outputs of a node's parents, in parent order. This is the input list
    /// handed to the node's script.
    pub fn parent_outputs(&self, index: usize) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        let node = self.node(index)?;
        node.parents
            .iter()
            .map(|&parent| Ok(self.node(parent)?.output().to_path_buf()))
            .collect()
    }

    fn push(&mut self, parents: Vec<usize>, task: NodeTask) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            index,
            parents,
            task,
        });
        index
    }

    /// Register a download file with its linear chain of per-file steps.
    /// Returns the index of the chain's tail.
    pub fn register_file(&mut self, file: Utf8PathBuf, steps: Vec<OutputScript>) -> usize {
        let mut tail = self.push(Vec::new(), NodeTask::Root(file));
        for step in steps {
            tail = self.push(vec![tail], NodeTask::Script(step));
        }
        self.tails.push(tail);
        tail
    }

    /// Append a chain of steps to every current tail. The builder receives
    /// the tail it extends, so outputs can be derived per branch.
    pub fn add_all_processing<F>(&mut self, mut build: F) -> Result<(), PipelineError>
    where
        F: FnMut(&Node) -> Result<Vec<OutputScript>, PipelineError>,
    {
        let current = std::mem::take(&mut self.tails);
        for tail_index in current {
            let steps = {
                let tail = self.node(tail_index)?;
                build(tail)?
            };
            let mut tail = tail_index;
            for step in steps {
                tail = self.push(vec![tail], NodeTask::Script(step));
            }
            self.tails.push(tail);
        }
        Ok(())
    }

    /// Join every current tail into the first final step, which therefore
    /// takes all current outputs as inputs, then linearize the rest.
    pub fn add_final_processing(&mut self, steps: Vec<OutputScript>) {
        let mut steps = steps.into_iter();
        let Some(join) = steps.next() else {
            return;
        };
        let parents = std::mem::take(&mut self.tails);
        let mut tail = self.push(parents, NodeTask::Script(join));
        for step in steps {
            tail = self.push(vec![tail], NodeTask::Script(step));
        }
        self.tails = vec![tail];
    }

    /// Topological execution order: depth-first from each leaf with parents
    /// emitted before their children, de-duplicated in first-seen order.
    pub fn task_queue(&self) -> Result<Vec<usize>, PipelineError> {
        let mut has_child = vec![false; self.nodes.len()];
        for node in &self.nodes {
            for &parent in &node.parents {
                if parent >= node.index {
                    return Err(PipelineError::GraphCycle(node.index));
                }
                has_child[parent] = true;
            }
        }

        let mut queue = Vec::with_capacity(self.nodes.len());
        let mut seen = vec![false; self.nodes.len()];
        for leaf in (0..self.nodes.len()).filter(|&i| !has_child[i]) {
            self.visit(leaf, &mut seen, &mut queue)?;
        }
        Ok(queue)
    }

    fn visit(
        &self,
        index: usize,
        seen: &mut [bool],
        queue: &mut Vec<usize>,
    ) -> Result<(), PipelineError> {
        if seen[index] {
            return Ok(());
        }
        seen[index] = true;
        for &parent in &self.node(index)?.parents {
            self.visit(parent, seen, queue)?;
        }
        queue.push(index);
        Ok(())
    }
}
