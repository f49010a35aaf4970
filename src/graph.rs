//! Glue-graph analysis: cycle detection, cycle validation and forward order.
//!
//! Layers are nodes and glues are edges, both referenced by index. A cycle
//! is stored as `[head, g1, …, gm]`: the head closes the cycle (it runs
//! from the last layer of the cycle back to its first), and `g1..gm` is the
//! forward path. Heads read the previous step's activation of their source,
//! so removing every head must leave a DAG.

use crate::error::{LmError, Result};
use std::collections::VecDeque;

/// A glue edge: `(src layer, dst layer)`.
pub type Edge = (usize, usize);

/// Finds cycles with a depth-first search from `start`.
///
/// Every edge that reaches a layer still on the DFS stack closes a cycle;
/// that edge becomes the head and the stack path from the reached layer
/// forms the rest.
pub fn find_cycles(num_layers: usize, edges: &[Edge], start: usize) -> Vec<Vec<usize>> {
    let mut outgoing = vec![Vec::new(); num_layers];
    for (g, &(src, _)) in edges.iter().enumerate() {
        outgoing[src].push(g);
    }

    let mut dfs = CycleSearch {
        edges,
        outgoing,
        visited: vec![false; num_layers],
        on_stack: vec![false; num_layers],
        node_stack: Vec::new(),
        glue_stack: Vec::new(),
        cycles: Vec::new(),
    };
    if start < num_layers {
        dfs.visit(start);
    }
    dfs.cycles
}

struct CycleSearch<'a> {
    edges: &'a [Edge],
    outgoing: Vec<Vec<usize>>,
    visited: Vec<bool>,
    on_stack: Vec<bool>,
    node_stack: Vec<usize>,
    /// `glue_stack[i]` leads from `node_stack[i]` to `node_stack[i + 1]`.
    glue_stack: Vec<usize>,
    cycles: Vec<Vec<usize>>,
}

impl CycleSearch<'_> {
    fn visit(&mut self, node: usize) {
        self.visited[node] = true;
        self.on_stack[node] = true;
        self.node_stack.push(node);

        for i in 0..self.outgoing[node].len() {
            let g = self.outgoing[node][i];
            let next = self.edges[g].1;
            if self.on_stack[next] {
                let pos = self
                    .node_stack
                    .iter()
                    .position(|&n| n == next)
                    .unwrap_or(self.node_stack.len());
                let mut cycle = vec![g];
                cycle.extend_from_slice(&self.glue_stack[pos..]);
                self.cycles.push(cycle);
            } else if !self.visited[next] {
                self.glue_stack.push(g);
                self.visit(next);
                self.glue_stack.pop();
            }
        }

        self.node_stack.pop();
        self.on_stack[node] = false;
    }
}

/// Checks that `cycles` are closed walks and that removing their heads
/// leaves the glue graph acyclic.
pub fn check_glue_cycles(
    component: &str,
    num_layers: usize,
    edges: &[Edge],
    cycles: &[Vec<usize>],
) -> Result<()> {
    for cycle in cycles {
        let (&head, path) = cycle
            .split_first()
            .ok_or_else(|| LmError::cycle(component, "empty cycle"))?;
        if let Some(&g) = cycle.iter().find(|&&g| g >= edges.len()) {
            return Err(LmError::cycle(component, format!("unknown glue index {}", g)));
        }

        let (head_src, head_dst) = edges[head];
        let mut at = head_dst;
        for &g in path {
            if edges[g].0 != at {
                return Err(LmError::cycle(
                    component,
                    format!("glue {} does not continue the cycle from layer {}", g, at),
                ));
            }
            at = edges[g].1;
        }
        if at != head_src {
            return Err(LmError::cycle(
                component,
                format!("cycle headed by glue {} is not closed", head),
            ));
        }
    }

    let heads = head_mask(edges.len(), cycles);
    let mut indegree = vec![0usize; num_layers];
    for (g, &(_, dst)) in edges.iter().enumerate() {
        if !heads[g] {
            indegree[dst] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..num_layers).filter(|&l| indegree[l] == 0).collect();
    let mut seen = 0;
    while let Some(layer) = queue.pop_front() {
        seen += 1;
        for (g, &(src, dst)) in edges.iter().enumerate() {
            if src == layer && !heads[g] {
                indegree[dst] -= 1;
                if indegree[dst] == 0 {
                    queue.push_back(dst);
                }
            }
        }
    }

    if seen != num_layers {
        return Err(LmError::cycle(
            component,
            "graph is still cyclic after removing every cycle head",
        ));
    }
    Ok(())
}

/// Marks the head glue of every cycle.
pub fn head_mask(num_glues: usize, cycles: &[Vec<usize>]) -> Vec<bool> {
    let mut heads = vec![false; num_glues];
    for cycle in cycles {
        if let Some(&head) = cycle.first() {
            if head < num_glues {
                heads[head] = true;
            }
        }
    }
    heads
}

/// Orders glues so every glue comes after all glues writing into its
/// source layer (Kahn's algorithm).
///
/// Heads have no same-step dependencies and are ranked as soon as
/// possible; they still count as writers of their destination.
pub fn sort_glues(
    component: &str,
    num_layers: usize,
    edges: &[Edge],
    cycles: &[Vec<usize>],
) -> Result<Vec<usize>> {
    let heads = head_mask(edges.len(), cycles);

    let mut writers = vec![0usize; num_layers];
    for &(_, dst) in edges {
        writers[dst] += 1;
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    let mut queued = vec![false; edges.len()];
    for g in (0..edges.len()).filter(|&g| heads[g]) {
        queue.push_back(g);
        queued[g] = true;
    }
    for layer in (0..num_layers).filter(|&l| writers[l] == 0) {
        for (g, &(src, _)) in edges.iter().enumerate() {
            if src == layer && !queued[g] {
                queue.push_back(g);
                queued[g] = true;
            }
        }
    }

    let mut order = Vec::with_capacity(edges.len());
    while let Some(g) = queue.pop_front() {
        order.push(g);
        let dst = edges[g].1;
        writers[dst] -= 1;
        if writers[dst] == 0 {
            for (next, &(src, _)) in edges.iter().enumerate() {
                if src == dst && !queued[next] {
                    queue.push_back(next);
                    queued[next] = true;
                }
            }
        }
    }

    if order.len() != edges.len() {
        let missing: Vec<usize> = (0..edges.len()).filter(|&g| !queued[g]).collect();
        return Err(LmError::cycle(
            component,
            format!("glues {:?} could not be ordered", missing),
        ));
    }
    Ok(order)
}
