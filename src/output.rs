//! Output tree and per-thread output state.
//!
//! Words are leaves of a tree. Predicting a word is a chain of softmax
//! decisions, one per internal node on the root→leaf path, each over that
//! node's children. Node ids are assigned breadth-first so the children of
//! every internal node occupy a contiguous id range, which is also the row
//! range of every output glue's weight.
//!
//! With `max_branch ≥ vocabulary size` the tree is a single root over all
//! words, i.e. a flat softmax.

use crate::error::{LmError, Result};
use crate::utils::activations::softmax_inplace;
use crate::vocab::WordId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;

/// Construction parameters, stored in model images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub num_words: usize,
    pub max_branch: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    first_child: usize,
    num_children: usize,
}

/// Balanced output tree with contiguous children.
#[derive(Debug, Clone)]
pub struct OutputTree {
    spec: OutputSpec,
    nodes: Vec<Node>,
    /// Node ids from the root to each word's leaf.
    paths: Vec<Vec<usize>>,
}

impl OutputTree {
    /// Builds a tree where each internal node splits its word range into at
    /// most `max_branch` equal parts.
    pub fn balanced(num_words: usize, max_branch: usize) -> Result<Self> {
        if num_words == 0 {
            return Err(LmError::topology("output tree needs at least one word"));
        }
        if max_branch < 2 {
            return Err(LmError::invalid_option("max_branch must be at least 2"));
        }

        let mut nodes = vec![Node::default()];
        let mut parent = vec![usize::MAX];
        let mut leaf_of_word = vec![0usize; num_words];

        let mut queue = VecDeque::from([(0usize, 0usize, num_words)]);
        while let Some((id, lo, hi)) = queue.pop_front() {
            let n = hi - lo;
            if n == 1 && id != 0 {
                leaf_of_word[lo] = id;
                continue;
            }
            let k = n.min(max_branch);
            let first = nodes.len();
            nodes[id] = Node {
                first_child: first,
                num_children: k,
            };
            for j in 0..k {
                nodes.push(Node::default());
                parent.push(id);
                queue.push_back((first + j, lo + j * n / k, lo + (j + 1) * n / k));
            }
        }

        let paths = leaf_of_word
            .iter()
            .map(|&leaf| {
                let mut path = vec![leaf];
                let mut at = leaf;
                while parent[at] != usize::MAX {
                    at = parent[at];
                    path.push(at);
                }
                path.reverse();
                path
            })
            .collect();

        Ok(Self {
            spec: OutputSpec {
                num_words,
                max_branch,
            },
            nodes,
            paths,
        })
    }

    /// Rebuilds a tree from stored parameters.
    pub fn from_spec(spec: OutputSpec) -> Result<Self> {
        Self::balanced(spec.num_words, spec.max_branch)
    }

    pub fn spec(&self) -> OutputSpec {
        self.spec
    }

    /// Total node count; the row count of every output glue weight.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_words(&self) -> usize {
        self.spec.num_words
    }

    /// Node ids from the root to `word`'s leaf.
    pub fn path(&self, word: WordId) -> &[usize] {
        &self.paths[word as usize]
    }

    /// Contiguous id range of `node`'s children.
    pub fn children(&self, node: usize) -> Range<usize> {
        let n = self.nodes[node];
        n.first_child..n.first_child + n.num_children
    }

    /// Largest number of softmax decisions for any word.
    pub fn max_depth(&self) -> usize {
        self.paths.iter().map(|p| p.len() - 1).max().unwrap_or(0)
    }

    /// Largest fan-out of any node.
    pub fn max_children(&self) -> usize {
        self.nodes.iter().map(|n| n.num_children).max().unwrap_or(0)
    }
}

/// One softmax decision on the target's path.
#[derive(Debug, Clone, Default)]
pub struct Level {
    /// Rows of the children in every output weight.
    pub rows: Range<usize>,
    /// Index of the on-path child within `rows`.
    pub target: usize,
    /// Logits, then probabilities after [`OutputState::finish_level`].
    pub probs: Vec<f32>,
    /// `1[child on path] − p`.
    pub errors: Vec<f32>,
}

/// Per-thread output buffers for the current target word.
#[derive(Debug, Clone)]
pub struct OutputState {
    levels: Vec<Level>,
    depth: usize,
}

impl OutputState {
    /// Allocates buffers large enough for any path of `tree`.
    pub fn new(tree: &OutputTree) -> Self {
        let width = tree.max_children();
        let levels = (0..tree.max_depth())
            .map(|_| Level {
                rows: 0..0,
                target: 0,
                probs: Vec::with_capacity(width),
                errors: Vec::with_capacity(width),
            })
            .collect();
        Self { levels, depth: 0 }
    }

    /// Prepares zeroed logits for every decision on `word`'s path.
    pub fn start(&mut self, tree: &OutputTree, word: WordId) {
        let path = tree.path(word);
        self.depth = path.len() - 1;
        for (level, pair) in self.levels.iter_mut().zip(path.windows(2)) {
            let rows = tree.children(pair[0]);
            level.target = pair[1] - rows.start;
            level.probs.clear();
            level.probs.resize(rows.len(), 0.0);
            level.errors.clear();
            level.rows = rows;
        }
    }

    /// Decisions on the current path.
    pub fn levels(&self) -> &[Level] {
        &self.levels[..self.depth]
    }

    pub fn levels_mut(&mut self) -> &mut [Level] {
        &mut self.levels[..self.depth]
    }

    /// Turns accumulated logits into probabilities and errors.
    pub fn finish(&mut self) {
        for level in &mut self.levels[..self.depth] {
            softmax_inplace(&mut level.probs);
            level.errors.clear();
            level
                .errors
                .extend(level.probs.iter().enumerate().map(|(i, &p)| {
                    if i == level.target {
                        1.0 - p
                    } else {
                        -p
                    }
                }));
        }
    }

    /// Natural-log probability of the current target.
    pub fn logprob(&self) -> f64 {
        self.levels()
            .iter()
            .map(|level| (level.probs[level.target] as f64).ln())
            .sum()
    }
}
