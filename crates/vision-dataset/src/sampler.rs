//! Per-epoch sample ordering.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use vision_core::SamplerKind;

/// Produces the sample indices visited in one epoch
#[derive(Debug, Clone)]
pub enum Sampler {
    /// Dataset order, used for evaluation
    Sequential { len: usize },
    /// Seeded permutation, reshuffled every epoch
    Shuffled { len: usize, seed: u64 },
    /// Uniform over classes, then uniform within the class, with replacement
    Balanced {
        by_class: Vec<Vec<usize>>,
        len: usize,
        seed: u64,
    },
}

impl Sampler {
    /// Training sampler for the configured kind
    pub fn for_training(kind: SamplerKind, labels: &[usize], seed: u64) -> Self {
        match kind {
            SamplerKind::Normal => Sampler::Shuffled {
                len: labels.len(),
                seed,
            },
            SamplerKind::Balance => {
                let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                for (index, &label) in labels.iter().enumerate() {
                    groups.entry(label).or_default().push(index);
                }
                Sampler::Balanced {
                    by_class: groups.into_values().collect(),
                    len: labels.len(),
                    seed,
                }
            }
        }
    }

    pub fn sequential(len: usize) -> Self {
        Sampler::Sequential { len }
    }

    /// Number of indices produced per epoch
    pub fn len(&self) -> usize {
        match self {
            Sampler::Sequential { len }
            | Sampler::Shuffled { len, .. }
            | Sampler::Balanced { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices for `epoch`; identical for the same seed and epoch
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        match self {
            Sampler::Sequential { len } => (0..*len).collect(),
            Sampler::Shuffled { len, seed } => {
                let mut rng = epoch_rng(*seed, epoch);
                let mut indices: Vec<usize> = (0..*len).collect();
                indices.shuffle(&mut rng);
                indices
            }
            Sampler::Balanced {
                by_class,
                len,
                seed,
            } => {
                if by_class.is_empty() {
                    return Vec::new();
                }
                let mut rng = epoch_rng(*seed, epoch);
                (0..*len)
                    .map(|_| {
                        let class = &by_class[rng.gen_range(0..by_class.len())];
                        class[rng.gen_range(0..class.len())]
                    })
                    .collect()
            }
        }
    }
}

fn epoch_rng(seed: u64, epoch: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential() {
        assert_eq!(Sampler::sequential(4).indices(3), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_shuffled_is_permutation_and_reproducible() {
        let labels = vec![0; 50];
        let sampler = Sampler::for_training(SamplerKind::Normal, &labels, 42);

        let epoch0 = sampler.indices(0);
        let mut sorted = epoch0.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());

        assert_eq!(epoch0, sampler.indices(0));
        assert_ne!(epoch0, sampler.indices(1));
    }

    #[test]
    fn test_balanced_draws_minority_class() {
        // 95 samples of class 0, 5 of class 1
        let labels: Vec<usize> = (0..100).map(|i| usize::from(i >= 95)).collect();
        let sampler = Sampler::for_training(SamplerKind::Balance, &labels, 7);

        let indices = sampler.indices(0);
        assert_eq!(indices.len(), 100);
        let minority = indices.iter().filter(|&&i| labels[i] == 1).count();
        assert!(minority > 25, "minority drawn {minority} times");
    }

    #[test]
    fn test_balanced_empty() {
        let sampler = Sampler::for_training(SamplerKind::Balance, &[], 1);
        assert!(sampler.is_empty());
        assert!(sampler.indices(0).is_empty());
    }
}
