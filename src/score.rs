use crate::{check_dtype, check_inputs, check_lengths, check_tags, sequence_mask, Transitions};
use candle_core::{Device, Error, Result, Tensor, D};
use tracing::debug;

/// Score of a tag sequence under the CRF: unary plus binary potentials.
///
/// * `inputs`: `[batch, max_seq_len, num_tags]` emission potentials.
/// * `tag_indices`: `[batch, max_seq_len]`, `i64`.
/// * `sequence_lengths`: `[batch]`, `i64`.
///
/// Returns `[batch]`. Start and end potentials are not part of it, see [`crf_boundary_score`].
pub fn crf_sequence_score(
    inputs: &Tensor,
    tag_indices: &Tensor,
    sequence_lengths: &Tensor,
    transitions: &Transitions,
) -> Result<Tensor> {
    check_dtype(inputs, transitions)?;
    check_inputs(inputs, Some(transitions.num_tags()))?;
    let unary_scores = crf_unary_score(tag_indices, sequence_lengths, inputs)?;
    let binary_scores = crf_binary_score(tag_indices, sequence_lengths, transitions)?;
    unary_scores.broadcast_add(&binary_scores)
}

/// Sum of the emission potentials of the chosen tags over the real positions.
pub fn crf_unary_score(
    tag_indices: &Tensor,
    sequence_lengths: &Tensor,
    inputs: &Tensor,
) -> Result<Tensor> {
    let (batch_size, max_seq_len, num_tags) = check_inputs(inputs, None)?;
    check_tags(tag_indices, batch_size, max_seq_len, num_tags)?;
    let lengths = check_lengths(sequence_lengths, batch_size, max_seq_len)?;
    debug!(batch_size, max_seq_len, num_tags, "crf_unary_score");

    let unary_scores = inputs
        .gather(&tag_indices.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;

    let masks = sequence_mask(&lengths, max_seq_len, inputs.device())?;
    masked_sum(&masks, &unary_scores)
}

/// Sum of the tag-to-tag transition potentials between consecutive chosen tags over the real
/// positions. Zero for sequences of length 0 or 1.
///
/// Only [`Transitions::inner`] is read, the start row and end column of a boundary layout are
/// left to [`crf_boundary_score`].
pub fn crf_binary_score(
    tag_indices: &Tensor,
    sequence_lengths: &Tensor,
    transitions: &Transitions,
) -> Result<Tensor> {
    let (batch_size, max_seq_len) = tags_dims(tag_indices)?;
    let num_tags = transitions.num_tags();
    check_tags(tag_indices, batch_size, max_seq_len, num_tags)?;
    let lengths = check_lengths(sequence_lengths, batch_size, max_seq_len)?;
    debug!(batch_size, max_seq_len, num_tags, "crf_binary_score");

    let device = tag_indices.device();
    if max_seq_len <= 1 {
        return Tensor::zeros(batch_size, transitions.dtype(), device);
    }

    let num_transitions = max_seq_len - 1;
    let start_tag_indices = tag_indices.narrow(1, 0, num_transitions)?;
    let end_tag_indices = tag_indices.narrow(1, 1, num_transitions)?;

    // row-major offsets into the flattened [num_tags, num_tags] block
    let flattened_transition_indices = start_tag_indices
        .broadcast_mul(&Tensor::new(num_tags as i64, device)?)?
        .broadcast_add(&end_tag_indices)?
        .flatten_all()?;
    let flattened_transition_params = transitions.inner().flatten_all()?;

    let binary_scores = flattened_transition_params
        .index_select(&flattened_transition_indices, 0)?
        .reshape((batch_size, num_transitions))?;

    let masks = sequence_mask(&lengths, max_seq_len, device)?;
    let truncated_masks = masks.narrow(1, 1, num_transitions)?;
    masked_sum(&truncated_masks, &binary_scores)
}

/// Start and end potentials of the chosen tags: `start[first tag] + end[last real tag]` for
/// every non-empty sequence.
///
/// Zero for a plain layout, which has no start or end state.
pub fn crf_boundary_score(
    tag_indices: &Tensor,
    sequence_lengths: &Tensor,
    transitions: &Transitions,
) -> Result<Tensor> {
    let (batch_size, max_seq_len) = tags_dims(tag_indices)?;
    let num_tags = transitions.num_tags();
    let tags = check_tags(tag_indices, batch_size, max_seq_len, num_tags)?;
    let lengths = check_lengths(sequence_lengths, batch_size, max_seq_len)?;
    debug!(batch_size, max_seq_len, num_tags, "crf_boundary_score");

    let device = tag_indices.device();
    let boundary_scores = Tensor::zeros(batch_size, transitions.dtype(), device)?;
    let (start, end) = match (transitions.start(), transitions.end()) {
        (Some(start), Some(end)) if max_seq_len > 0 => (start, end),
        _ => return Ok(boundary_scores),
    };

    let (first_tags, last_tags): (Vec<i64>, Vec<i64>) = lengths
        .iter()
        .enumerate()
        .map(|(b, &len)| {
            let row = &tags[b * max_seq_len..(b + 1) * max_seq_len];
            (row[0], row[len.saturating_sub(1)])
        })
        .unzip();
    let first_tags = Tensor::from_vec(first_tags, batch_size, device)?;
    let last_tags = Tensor::from_vec(last_tags, batch_size, device)?;

    let start_scores = start.index_select(&first_tags, 0)?;
    let end_scores = end.index_select(&last_tags, 0)?;
    let scores = start_scores.broadcast_add(&end_scores)?;

    let non_empty = non_empty_mask(&lengths, device)?;
    non_empty.where_cond(&scores, &boundary_scores)
}

fn tags_dims(tag_indices: &Tensor) -> Result<(usize, usize)> {
    let dims = tag_indices.dims().len();
    if dims != 2 {
        return Err(Error::Msg(format!(
            "tag_indices must have 2 dimensions, got {}",
            dims
        )));
    }
    tag_indices.dims2()
}

/// Sums `scores` over dim 1 where the u8 `masks` are on. Masked-off entries are selected away,
/// not multiplied, so infinite potentials at padded positions do not leak in.
fn masked_sum(masks: &Tensor, scores: &Tensor) -> Result<Tensor> {
    masks
        .where_cond(scores, &scores.zeros_like()?)?
        .sum(1)
}

/// `[batch]` u8 mask, on for sequences holding at least one position.
pub(crate) fn non_empty_mask(lengths: &[usize], device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = lengths.iter().map(|&len| u8::from(len > 0)).collect();
    Tensor::from_vec(mask, lengths.len(), device)
}
