use std::collections::BTreeMap;

use ndarray::ArrayView1;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectionError};

/// Shape and seed of a repeated k-fold scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Folds per repeat.
    pub folds: usize,
    /// Number of independently shuffled repeats.
    pub repeats: usize,
    /// Base seed; repeat `r` shuffles with `seed + r`.
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            repeats: 20,
            seed: 0,
        }
    }
}

/// One train/test partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldPartition {
    /// Zero-based repeat index.
    pub repeat: usize,
    /// Zero-based fold index within the repeat.
    pub fold: usize,
    /// Training row indices, ascending.
    pub train: Vec<usize>,
    /// Test row indices, ascending.
    pub test: Vec<usize>,
}

#[derive(Debug, Clone)]
enum FoldPlan {
    Unstratified { samples: usize },
    Stratified { classes: Vec<Vec<usize>> },
}

/// Repeated k-fold splitter.
#[derive(Debug, Clone, Copy)]
pub struct CrossValidator {
    config: SplitConfig,
}

impl CrossValidator {
    /// Validates the scheme shape.
    pub fn new(config: SplitConfig) -> Result<Self> {
        if config.folds < 2 {
            return Err(SelectionError::Split(format!(
                "folds must be at least 2, got {}",
                config.folds
            )));
        }
        if config.repeats == 0 {
            return Err(SelectionError::Split("repeats must be at least 1".into()));
        }
        Ok(Self { config })
    }

    /// Scheme shape and seed.
    #[must_use]
    pub const fn config(&self) -> SplitConfig {
        self.config
    }

    /// Plans unstratified partitions of `samples` rows.
    pub fn unstratified(&self, samples: usize) -> Result<RepeatedFolds> {
        if samples < self.config.folds {
            return Err(SelectionError::Split(format!(
                "{samples} samples cannot fill {} folds",
                self.config.folds
            )));
        }
        Ok(RepeatedFolds {
            plan: FoldPlan::Unstratified { samples },
            config: self.config,
        })
    }

    /// Plans partitions that preserve the class proportions of `labels`.
    ///
    /// Every class must have at least `folds` members so that each test set
    /// receives at least one member and every training set keeps the class.
    pub fn stratified(&self, labels: ArrayView1<'_, f64>) -> Result<RepeatedFolds> {
        let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (idx, &label) in labels.iter().enumerate() {
            if (label - label.round()).abs() > 1e-9 {
                return Err(SelectionError::Split(format!(
                    "stratification needs integral class labels, row {idx} has {label}"
                )));
            }
            #[allow(clippy::cast_possible_truncation)]
            by_class.entry(label.round() as i64).or_default().push(idx);
        }
        if by_class.len() < 2 {
            return Err(SelectionError::Split(format!(
                "stratification needs at least two classes, found {}",
                by_class.len()
            )));
        }
        if let Some((class, members)) = by_class
            .iter()
            .find(|(_, members)| members.len() < self.config.folds)
        {
            return Err(SelectionError::Split(format!(
                "class {class} has {} members, fewer than {} folds",
                members.len(),
                self.config.folds
            )));
        }
        Ok(RepeatedFolds {
            plan: FoldPlan::Stratified {
                classes: by_class.into_values().collect(),
            },
            config: self.config,
        })
    }

    /// Plans stratified partitions when `stratify` is set, unstratified otherwise.
    pub fn partitions(&self, targets: ArrayView1<'_, f64>, stratify: bool) -> Result<RepeatedFolds> {
        if stratify {
            self.stratified(targets)
        } else {
            self.unstratified(targets.len())
        }
    }
}

/// Planned `repeats x folds` partitions, generated lazily.
///
/// Iterating twice yields identical partitions: each repeat's permutation is
/// derived only from the base seed and the repeat index.
#[derive(Debug, Clone)]
pub struct RepeatedFolds {
    plan: FoldPlan,
    config: SplitConfig,
}

impl RepeatedFolds {
    /// Total number of partitions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.config.folds * self.config.repeats
    }

    /// Always false; a plan holds at least two folds.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a fresh pass over all partitions.
    #[must_use]
    pub fn iter(&self) -> Partitions<'_> {
        Partitions {
            plan: self,
            repeat: 0,
            fold: 0,
            assignment: Vec::new(),
        }
    }

    fn samples(&self) -> usize {
        match &self.plan {
            FoldPlan::Unstratified { samples } => *samples,
            FoldPlan::Stratified { classes } => classes.iter().map(Vec::len).sum(),
        }
    }

    /// Fold index of every row for one repeat.
    fn assign(&self, repeat: usize) -> Vec<usize> {
        let folds = self.config.folds;
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(repeat as u64));
        let mut fold_of = vec![0; self.samples()];
        match &self.plan {
            FoldPlan::Unstratified { samples } => {
                let mut order: Vec<usize> = (0..*samples).collect();
                order.shuffle(&mut rng);
                let base = samples / folds;
                let remainder = samples % folds;
                let mut cursor = 0;
                for fold in 0..folds {
                    let size = if fold < remainder { base + 1 } else { base };
                    for &idx in &order[cursor..cursor + size] {
                        fold_of[idx] = fold;
                    }
                    cursor += size;
                }
            }
            FoldPlan::Stratified { classes } => {
                // Dealing continues where the previous class stopped, so fold
                // totals stay within one sample of each other.
                let mut offset = 0;
                for members in classes {
                    let mut shuffled = members.clone();
                    shuffled.shuffle(&mut rng);
                    for (pos, &idx) in shuffled.iter().enumerate() {
                        fold_of[idx] = (offset + pos) % folds;
                    }
                    offset = (offset + shuffled.len()) % folds;
                }
            }
        }
        fold_of
    }
}

impl<'a> IntoIterator for &'a RepeatedFolds {
    type Item = FoldPartition;
    type IntoIter = Partitions<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Single pass over a [`RepeatedFolds`] plan.
#[derive(Debug)]
pub struct Partitions<'a> {
    plan: &'a RepeatedFolds,
    repeat: usize,
    fold: usize,
    assignment: Vec<usize>,
}

impl Iterator for Partitions<'_> {
    type Item = FoldPartition;

    fn next(&mut self) -> Option<Self::Item> {
        let SplitConfig { folds, repeats, .. } = self.plan.config;
        if self.repeat >= repeats {
            return None;
        }
        if self.fold == 0 {
            self.assignment = self.plan.assign(self.repeat);
        }
        let (test, train): (Vec<usize>, Vec<usize>) =
            (0..self.assignment.len()).partition(|&idx| self.assignment[idx] == self.fold);
        let partition = FoldPartition {
            repeat: self.repeat,
            fold: self.fold,
            train,
            test,
        };
        self.fold += 1;
        if self.fold == folds {
            self.fold = 0;
            self.repeat += 1;
        }
        Some(partition)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let SplitConfig { folds, repeats, .. } = self.plan.config;
        let remaining = (repeats - self.repeat.min(repeats)) * folds - self.fold;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Partitions<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn validator(folds: usize, repeats: usize, seed: u64) -> CrossValidator {
        CrossValidator::new(SplitConfig {
            folds,
            repeats,
            seed,
        })
        .unwrap()
    }

    #[test]
    fn unstratified_folds_cover_every_index_once_per_repeat() {
        let plan = validator(5, 20, 11).unstratified(100).unwrap();
        let partitions: Vec<_> = plan.iter().collect();
        assert_eq!(partitions.len(), 100);
        for repeat in partitions.chunks(5) {
            let mut seen = vec![0usize; 100];
            for part in repeat {
                assert_eq!(part.test.len(), 20);
                assert_eq!(part.train.len() + part.test.len(), 100);
                assert!(part.test.iter().all(|idx| !part.train.contains(idx)));
                for &idx in &part.test {
                    seen[idx] += 1;
                }
            }
            assert!(seen.iter().all(|&count| count == 1));
        }
    }

    #[test]
    fn stratified_preserves_class_proportions() {
        let labels = Array1::from_iter((0..100).map(|idx| if idx < 60 { 0.0 } else { 1.0 }));
        let plan = validator(5, 20, 3).stratified(labels.view()).unwrap();
        for part in &plan {
            let ones = part.test.iter().filter(|&&idx| labels[idx] == 1.0).count();
            let zeros = part.test.len() - ones;
            assert!((11..=13).contains(&zeros), "fold had {zeros} of class 0");
            assert!((7..=9).contains(&ones), "fold had {ones} of class 1");
        }
    }

    #[test]
    fn stratified_totals_stay_balanced_for_odd_class_sizes() {
        let labels = Array1::from_iter((0..23).map(|idx| if idx < 13 { 0.0 } else { 1.0 }));
        let plan = validator(5, 3, 5).stratified(labels.view()).unwrap();
        for part in &plan {
            assert!((4..=5).contains(&part.test.len()));
        }
    }

    #[test]
    fn iteration_is_restartable() {
        let plan = validator(5, 4, 42).unstratified(37).unwrap();
        let first: Vec<_> = plan.iter().collect();
        let second: Vec<_> = plan.iter().collect();
        assert_eq!(first, second);
        assert_eq!(plan.iter().len(), 20);
    }

    #[test]
    fn repeats_use_different_permutations() {
        let plan = validator(5, 2, 9).unstratified(50).unwrap();
        let parts: Vec<_> = plan.iter().collect();
        assert_ne!(parts[0].test, parts[5].test);
    }

    #[test]
    fn small_class_is_a_configuration_error() {
        let labels = Array1::from_vec(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let err = validator(5, 1, 0).stratified(labels.view()).unwrap_err();
        assert!(matches!(err, SelectionError::Split(_)));
    }

    #[test]
    fn rejects_degenerate_shapes() {
        assert!(CrossValidator::new(SplitConfig {
            folds: 1,
            repeats: 1,
            seed: 0
        })
        .is_err());
        assert!(validator(5, 1, 0).unstratified(4).is_err());
    }
}
