//! Multi-similarity hard-pair mining.

use burn::prelude::*;
use vision_core::{Error, Result};

use crate::model::l2_normalize;

/// Anchor-positive and anchor-negative index pairs within one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinedPairs {
    pub positives: Vec<(usize, usize)>,
    pub negatives: Vec<(usize, usize)>,
}

impl MinedPairs {
    pub fn is_empty(&self) -> bool {
        self.positives.is_empty() && self.negatives.is_empty()
    }

    /// Dense `[n, n]` positive and negative masks, plus a `[n]` mask of the
    /// anchors that have at least one pair of each kind.
    pub(crate) fn masks(&self, n: usize) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let mut positive = vec![0.0; n * n];
        let mut negative = vec![0.0; n * n];
        for &(a, p) in &self.positives {
            positive[a * n + p] = 1.0;
        }
        for &(a, q) in &self.negatives {
            negative[a * n + q] = 1.0;
        }

        let anchors = (0..n)
            .map(|a| {
                let row = a * n..(a + 1) * n;
                let has_pos = positive[row.clone()].iter().any(|&v| v > 0.0);
                let has_neg = negative[row].iter().any(|&v| v > 0.0);
                if has_pos && has_neg {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        (positive, negative, anchors)
    }
}

/// Keeps positives that are less similar than the hardest negative and
/// negatives that are more similar than the hardest positive, each with an
/// `epsilon` margin.
#[derive(Debug, Clone, Copy)]
pub struct MultiSimilarityMiner {
    pub epsilon: f32,
}

impl Default for MultiSimilarityMiner {
    fn default() -> Self {
        Self { epsilon: 0.1 }
    }
}

impl MultiSimilarityMiner {
    /// Mines a batch of embeddings; similarity is cosine
    pub fn mine<B: Backend>(&self, embeddings: &Tensor<B, 2>, labels: &[usize]) -> Result<MinedPairs> {
        let [n, _] = embeddings.dims();
        if n != labels.len() {
            return Err(Error::InvalidArgument(format!(
                "{n} embeddings but {} labels",
                labels.len()
            )));
        }

        let normalized = l2_normalize(embeddings.clone().detach());
        let similarity: Vec<f32> = normalized
            .clone()
            .matmul(normalized.transpose())
            .into_data()
            .to_vec()
            .map_err(|e| Error::Training(format!("{e:?}")))?;

        self.mine_similarity(&similarity, labels)
    }

    /// Mines a row-major `[n, n]` similarity matrix, `n = labels.len()`
    pub fn mine_similarity(&self, similarity: &[f32], labels: &[usize]) -> Result<MinedPairs> {
        let n = labels.len();
        if similarity.len() != n * n {
            return Err(Error::InvalidArgument(format!(
                "similarity matrix holds {} values, expected {n}x{n}",
                similarity.len()
            )));
        }
        let mut pairs = MinedPairs::default();

        for a in 0..n {
            let row = &similarity[a * n..(a + 1) * n];
            let mut hardest_pos = f32::INFINITY;
            let mut hardest_neg = f32::NEG_INFINITY;
            for (j, &s) in row.iter().enumerate() {
                if j == a {
                    continue;
                }
                if labels[j] == labels[a] {
                    hardest_pos = hardest_pos.min(s);
                } else {
                    hardest_neg = hardest_neg.max(s);
                }
            }

            for (j, &s) in row.iter().enumerate() {
                if j == a {
                    continue;
                }
                if labels[j] == labels[a] {
                    if s - self.epsilon < hardest_neg {
                        pairs.positives.push((a, j));
                    }
                } else if s + self.epsilon > hardest_pos {
                    pairs.negatives.push((a, j));
                }
            }
        }

        Ok(pairs)
    }
}
