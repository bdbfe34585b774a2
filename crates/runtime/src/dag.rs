//! Step dependency graph
//!
//! Steps are ordered so that a step writing a path runs before every step
//! reading an overlapping path (one path a prefix of the other). Self-edges
//! are ignored: a step may read what it writes. The graph is leveled with
//! Kahn's algorithm; ties within a level are broken by path.

use indexmap::IndexMap;

use crate::error::Error;
use crate::path::Path;

/// A step with the tree paths it touches.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: Path,
    pub reads: Vec<Path>,
    pub writes: Vec<Path>,
}

impl StepNode {
    fn feeds(&self, other: &StepNode) -> bool {
        self.id != other.id
            && self
                .writes
                .iter()
                .any(|w| other.reads.iter().any(|r| w.overlaps(r)))
    }
}

/// A topological level: steps with no dependencies between them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Level {
    pub steps: Vec<Path>,
}

/// Leveled execution order of all steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepGraph {
    pub levels: Vec<Level>,
}

impl StepGraph {
    pub fn build(nodes: &[StepNode]) -> Result<StepGraph, CycleError> {
        Ok(StepGraph {
            levels: topological_levels(nodes)?,
        })
    }

    /// Steps flattened in execution order.
    pub fn order(&self) -> Vec<Path> {
        self.levels
            .iter()
            .flat_map(|level| level.steps.iter().cloned())
            .collect()
    }

    pub fn step_count(&self) -> usize {
        self.levels.iter().map(|l| l.steps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Error when a cycle is detected
#[derive(Debug)]
pub struct CycleError {
    pub involved: Vec<Path>,
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::CyclicStepGraph { steps: err.involved }
    }
}

/// Compute topological levels using Kahn's algorithm
fn topological_levels(nodes: &[StepNode]) -> Result<Vec<Level>, CycleError> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut in_degree: IndexMap<&Path, usize> = nodes.iter().map(|n| (&n.id, 0)).collect();
    let mut dependents: IndexMap<&Path, Vec<&StepNode>> = IndexMap::new();

    for writer in nodes {
        for reader in nodes {
            if writer.feeds(reader) {
                dependents.entry(&writer.id).or_default().push(reader);
                if let Some(degree) = in_degree.get_mut(&reader.id) {
                    *degree += 1;
                }
            }
        }
    }

    let mut levels = Vec::new();
    let mut current_level: Vec<&StepNode> = nodes
        .iter()
        .filter(|n| in_degree[&n.id] == 0)
        .collect();

    let mut processed = 0;

    while !current_level.is_empty() {
        // Sort for determinism
        current_level.sort_by(|a, b| a.id.cmp(&b.id));
        processed += current_level.len();

        let mut next_level = Vec::new();
        for node in &current_level {
            if let Some(deps) = dependents.get(&node.id) {
                for dep in deps {
                    if let Some(degree) = in_degree.get_mut(&dep.id) {
                        *degree -= 1;
                        if *degree == 0 {
                            next_level.push(*dep);
                        }
                    }
                }
            }
        }

        levels.push(Level {
            steps: current_level.iter().map(|n| n.id.clone()).collect(),
        });
        current_level = next_level;
    }

    if processed != nodes.len() {
        let mut involved: Vec<Path> = nodes
            .iter()
            .filter(|n| in_degree[&n.id] > 0)
            .map(|n| n.id.clone())
            .collect();
        involved.sort();
        return Err(CycleError { involved });
    }

    Ok(levels)
}
