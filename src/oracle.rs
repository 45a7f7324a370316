//! Brute-force reference for the CRF ops, computed on the host with explicit loops.

use crate::Transitions;
use candle_core::{DType, Result, Tensor};
use itertools::Itertools;

pub(crate) struct Oracle {
    inputs: Vec<Vec<f64>>,
    transitions: Vec<Vec<f64>>,
    start: Option<Vec<f64>>,
    end: Option<Vec<f64>>,
}

impl Oracle {
    /// `inputs` is a single unbatched `[max_seq_len, num_tags]` sequence.
    pub(crate) fn new(inputs: &Tensor, transitions: &Transitions) -> Result<Self> {
        let host1 = |t: &Tensor| t.to_dtype(DType::F64)?.to_vec1::<f64>();
        Ok(Self {
            inputs: inputs.to_dtype(DType::F64)?.to_vec2::<f64>()?,
            transitions: transitions.inner().to_dtype(DType::F64)?.to_vec2::<f64>()?,
            start: transitions.start().map(host1).transpose()?,
            end: transitions.end().map(host1).transpose()?,
        })
    }

    pub(crate) fn num_tags(&self) -> usize {
        self.transitions.len()
    }

    pub(crate) fn max_seq_len(&self) -> usize {
        self.inputs.len()
    }

    pub(crate) fn unary_score(&self, tag_indices: &[i64], sequence_length: usize) -> f64 {
        (0..sequence_length)
            .map(|i| self.inputs[i][tag_indices[i] as usize])
            .sum()
    }

    pub(crate) fn binary_score(&self, tag_indices: &[i64], sequence_length: usize) -> f64 {
        (0..sequence_length.saturating_sub(1))
            .map(|i| self.transitions[tag_indices[i] as usize][tag_indices[i + 1] as usize])
            .sum()
    }

    pub(crate) fn boundary_score(&self, tag_indices: &[i64], sequence_length: usize) -> f64 {
        if sequence_length == 0 {
            return 0.0;
        }

        let start = self
            .start
            .as_ref()
            .map_or(0.0, |start| start[tag_indices[0] as usize]);
        let end = self
            .end
            .as_ref()
            .map_or(0.0, |end| end[tag_indices[sequence_length - 1] as usize]);
        start + end
    }

    pub(crate) fn sequence_score(&self, tag_indices: &[i64], sequence_length: usize) -> f64 {
        self.unary_score(tag_indices, sequence_length)
            + self.binary_score(tag_indices, sequence_length)
    }

    /// Sequence score, plus the boundary score when `with_boundaries` is set.
    pub(crate) fn path_score(
        &self,
        tag_indices: &[i64],
        sequence_length: usize,
        with_boundaries: bool,
    ) -> f64 {
        let score = self.sequence_score(tag_indices, sequence_length);
        if with_boundaries {
            score + self.boundary_score(tag_indices, sequence_length)
        } else {
            score
        }
    }

    /// Every tag assignment of `sequence_length` positions, padded with tag 0 to the full length.
    pub(crate) fn all_tag_indices(&self, sequence_length: usize) -> Vec<Vec<i64>> {
        let padding = self.max_seq_len() - sequence_length;
        if sequence_length == 0 {
            return vec![vec![0; padding]];
        }

        (0..sequence_length)
            .map(|_| 0..self.num_tags() as i64)
            .multi_cartesian_product()
            .map(|mut tags| {
                tags.extend(std::iter::repeat(0).take(padding));
                tags
            })
            .collect()
    }

    pub(crate) fn log_norm(&self, sequence_length: usize, with_boundaries: bool) -> f64 {
        let all_sequence_scores = self
            .all_tag_indices(sequence_length)
            .iter()
            .map(|tags| self.path_score(tags, sequence_length, with_boundaries))
            .collect_vec();
        log_sum_exp(&all_sequence_scores)
    }

    /// Highest scoring assignment, trimmed to `sequence_length`, and its score.
    pub(crate) fn best_path(
        &self,
        sequence_length: usize,
        with_boundaries: bool,
    ) -> (Vec<u32>, f64) {
        let mut best: Option<(Vec<i64>, f64)> = None;
        for tags in self.all_tag_indices(sequence_length) {
            let score = self.path_score(&tags, sequence_length, with_boundaries);
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((tags, score));
            }
        }

        match best {
            Some((tags, score)) => (
                tags[..sequence_length].iter().map(|&t| t as u32).collect(),
                score,
            ),
            None => (vec![], 0.0),
        }
    }
}

pub(crate) fn log_sum_exp(scores: &[f64]) -> f64 {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    max + scores.iter().map(|s| (s - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use anyhow::Result;

    #[test]
    fn test_log_sum_exp_is_stable() {
        assert_close(log_sum_exp(&[1000.0, 1000.0]), 1000.0 + 2_f64.ln(), 1e-12);
        assert_close(log_sum_exp(&[-1000.0]), -1000.0, 1e-12);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_enumerates_every_assignment() -> Result<()> {
        let device = test_device()?;
        let oracle = Oracle::new(
            &fixture_inputs(DType::F32, &device)?,
            &Transitions::with_boundaries(&fixture_transitions(DType::F32, &device)?)?,
        )?;

        let all = oracle.all_tag_indices(3);
        assert_eq!(all.len(), 27);
        assert!(all.iter().all(|tags| tags.len() == 4 && tags[3] == 0));
        assert_eq!(all.iter().unique().count(), 27);

        assert_eq!(oracle.all_tag_indices(0), vec![vec![0, 0, 0, 0]]);
        assert_close(oracle.log_norm(0, false), 0.0, 0.0);
        assert_close(oracle.log_norm(0, true), 0.0, 0.0);
        Ok(())
    }
}
