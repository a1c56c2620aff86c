//! Confusion matrix and the classification metrics derived from it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Precision, recall and F1 of one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_id: usize,
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of samples whose true label is this class
    pub support: usize,
}

/// Count table of true (rows) against predicted (columns) labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    matrix: Vec<Vec<usize>>,
    class_names: Vec<String>,
}

impl ConfusionMatrix {
    /// Creates an empty matrix keyed by `num_classes` labels
    pub fn new(num_classes: usize) -> Self {
        Self {
            matrix: vec![vec![0; num_classes]; num_classes],
            class_names: (0..num_classes).map(|i| i.to_string()).collect(),
        }
    }

    /// Creates a matrix from precomputed counts; rows must be square
    pub fn from_counts(matrix: Vec<Vec<usize>>) -> Result<Self> {
        let n = matrix.len();
        if matrix.iter().any(|row| row.len() != n) {
            return Err(Error::InvalidArgument(format!(
                "confusion matrix must be {n}x{n}"
            )));
        }
        Ok(Self {
            matrix,
            class_names: (0..n).map(|i| i.to_string()).collect(),
        })
    }

    /// Records one prediction. Returns false when either label is out of range.
    pub fn update(&mut self, actual: usize, predicted: usize) -> bool {
        let n = self.num_classes();
        if actual < n && predicted < n {
            self.matrix[actual][predicted] += 1;
            true
        } else {
            false
        }
    }

    /// Replaces the index labels with human-readable names
    pub fn relabel(&mut self, names: &[String]) -> Result<()> {
        if names.len() != self.num_classes() {
            return Err(Error::InvalidArgument(format!(
                "expected {} class names, got {}",
                self.num_classes(),
                names.len()
            )));
        }
        self.class_names = names.to_vec();
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.matrix.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn counts(&self) -> &[Vec<usize>] {
        &self.matrix
    }

    /// Total number of recorded predictions
    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    /// Sum of the diagonal
    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.matrix[i][i]).sum()
    }

    /// Overall accuracy, 0.0 for an empty matrix
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.correct() as f64 / total as f64
    }

    /// Row-normalized matrix; rows without samples stay zero
    pub fn normalized(&self) -> Vec<Vec<f64>> {
        self.matrix
            .iter()
            .map(|row| {
                let sum: usize = row.iter().sum();
                row.iter()
                    .map(|&c| if sum > 0 { c as f64 / sum as f64 } else { 0.0 })
                    .collect()
            })
            .collect()
    }

    /// Per-class precision, recall and F1
    pub fn class_metrics(&self) -> Vec<ClassMetrics> {
        let n = self.num_classes();
        (0..n)
            .map(|class_id| {
                let true_positives = self.matrix[class_id][class_id] as f64;
                let false_positives: f64 = (0..n)
                    .filter(|&i| i != class_id)
                    .map(|i| self.matrix[i][class_id] as f64)
                    .sum();
                let false_negatives: f64 = (0..n)
                    .filter(|&i| i != class_id)
                    .map(|i| self.matrix[class_id][i] as f64)
                    .sum();

                let precision = if true_positives + false_positives > 0.0 {
                    true_positives / (true_positives + false_positives)
                } else {
                    0.0
                };
                let recall = if true_positives + false_negatives > 0.0 {
                    true_positives / (true_positives + false_negatives)
                } else {
                    0.0
                };
                let f1 = if precision + recall > 0.0 {
                    2.0 * (precision * recall) / (precision + recall)
                } else {
                    0.0
                };

                ClassMetrics {
                    class_id,
                    name: self.class_names[class_id].clone(),
                    precision,
                    recall,
                    f1,
                    support: self.matrix[class_id].iter().sum(),
                }
            })
            .collect()
    }

    /// Macro-averaged F1 score
    pub fn macro_f1(&self) -> f64 {
        let metrics = self.class_metrics();
        if metrics.is_empty() {
            return 0.0;
        }
        metrics.iter().map(|m| m.f1).sum::<f64>() / metrics.len() as f64
    }

    /// CSV rendering with a header row of class names
    pub fn to_csv(&self) -> String {
        let mut csv = String::from("actual\\predicted");
        for name in &self.class_names {
            csv.push(',');
            csv.push_str(name);
        }
        csv.push('\n');
        for (name, row) in self.class_names.iter().zip(&self.matrix) {
            csv.push_str(name);
            for count in row {
                csv.push_str(&format!(",{count}"));
            }
            csv.push('\n');
        }
        csv
    }
}
