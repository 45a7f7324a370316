use crate::score::non_empty_mask;
use crate::{
    check_dtype, check_inputs, check_lengths, crf_boundary_score, crf_sequence_score, Transitions,
};
use candle_core::{IndexOp, Result, Tensor};
use tracing::debug;

/// Log-partition function of the CRF, computed with the forward algorithm.
///
/// * `inputs`: `[batch, max_seq_len, num_tags]` emission potentials.
/// * `sequence_lengths`: `[batch]`, `i64`.
///
/// Returns `[batch]`; empty sequences normalize to zero. Only tag-to-tag transitions are
/// summed over, start and end potentials are ignored.
pub fn crf_log_norm(
    inputs: &Tensor,
    sequence_lengths: &Tensor,
    transitions: &Transitions,
) -> Result<Tensor> {
    log_norm(inputs, sequence_lengths, transitions, false)
}

/// Log-likelihood of `tag_indices` under the CRF, `[batch]`.
pub fn crf_log_likelihood(
    inputs: &Tensor,
    tag_indices: &Tensor,
    sequence_lengths: &Tensor,
    transitions: &Transitions,
) -> Result<Tensor> {
    log_likelihood(inputs, tag_indices, sequence_lengths, transitions, false)
}

/// Forward algorithm. With `with_boundaries` set, the start and end potentials of a boundary
/// layout are added to every path.
pub(crate) fn log_norm(
    inputs: &Tensor,
    sequence_lengths: &Tensor,
    transitions: &Transitions,
    with_boundaries: bool,
) -> Result<Tensor> {
    let (batch_size, max_seq_len, num_tags) = check_inputs(inputs, Some(transitions.num_tags()))?;
    check_dtype(inputs, transitions)?;
    let lengths = check_lengths(sequence_lengths, batch_size, max_seq_len)?;
    debug!(batch_size, max_seq_len, num_tags, with_boundaries, "crf_log_norm");

    if max_seq_len == 0 {
        return Tensor::zeros(batch_size, inputs.dtype(), inputs.device());
    }

    let (start, end) = if with_boundaries {
        (transitions.start(), transitions.end())
    } else {
        (None, None)
    };

    let mut alphas = inputs.i((.., 0))?;
    if let Some(start) = start {
        alphas = alphas.broadcast_add(start)?;
    }

    for i in 1..max_seq_len {
        // [batch, from, to]
        let broadcast_alphas = alphas.unsqueeze(2)?;
        let broadcast_inputs = inputs.i((.., i))?.unsqueeze(1)?;
        let next_alphas = broadcast_alphas
            .broadcast_add(transitions.inner())?
            .broadcast_add(&broadcast_inputs)?
            .log_sum_exp(1)?;

        let active: Vec<u8> = lengths.iter().map(|&len| u8::from(i < len)).collect();
        let active = Tensor::from_vec(active, (batch_size, 1), inputs.device())?
            .broadcast_as(next_alphas.shape())?;
        alphas = active.where_cond(&next_alphas, &alphas)?;
    }

    if let Some(end) = end {
        alphas = alphas.broadcast_add(end)?;
    }

    let log_norm = alphas.log_sum_exp(1)?;
    let non_empty = non_empty_mask(&lengths, inputs.device())?;
    non_empty.where_cond(&log_norm, &log_norm.zeros_like()?)
}

pub(crate) fn log_likelihood(
    inputs: &Tensor,
    tag_indices: &Tensor,
    sequence_lengths: &Tensor,
    transitions: &Transitions,
    with_boundaries: bool,
) -> Result<Tensor> {
    let mut sequence_scores =
        crf_sequence_score(inputs, tag_indices, sequence_lengths, transitions)?;
    if with_boundaries {
        let boundary_scores = crf_boundary_score(tag_indices, sequence_lengths, transitions)?;
        sequence_scores = sequence_scores.broadcast_add(&boundary_scores)?;
    }
    let log_norms = log_norm(inputs, sequence_lengths, transitions, with_boundaries)?;
    sequence_scores.broadcast_sub(&log_norms)
}
