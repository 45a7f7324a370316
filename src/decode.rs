use crate::score::non_empty_mask;
use crate::{check_dtype, check_inputs, check_lengths, max_indices, Transitions};
use candle_core::{DType, Error, IndexOp, Result, Tensor};
use tracing::{debug, trace};

/// Best tag path of a single unbatched `[seq_len, num_tags]` sequence and its score.
pub fn viterbi_decode(score: &Tensor, transitions: &Transitions) -> Result<(Vec<u32>, f64)> {
    let dims = score.dims().len();
    if dims != 2 {
        return Err(Error::Msg(format!(
            "score must have 2 dimensions, got {}",
            dims
        )));
    }

    let (seq_len, _) = score.dims2()?;
    let sequence_lengths = Tensor::new(&[seq_len as i64], score.device())?;
    let (mut best_paths, best_scores) =
        crf_decode(&score.unsqueeze(0)?, transitions, &sequence_lengths)?;

    let viterbi = best_paths.pop().unwrap_or_default();
    let viterbi_score = best_scores.i(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    Ok((viterbi, viterbi_score))
}

/// Batched viterbi decoding.
///
/// * `inputs`: `[batch, max_seq_len, num_tags]` emission potentials.
/// * `sequence_lengths`: `[batch]`, `i64`.
///
/// Returns the best tag path of every sequence, trimmed to its length, and the `[batch]`
/// scores of those paths. Empty sequences decode to an empty path scoring zero. Start and end
/// potentials are ignored, as in [`crf_sequence_score`](crate::crf_sequence_score).
pub fn crf_decode(
    inputs: &Tensor,
    transitions: &Transitions,
    sequence_lengths: &Tensor,
) -> Result<(Vec<Vec<u32>>, Tensor)> {
    decode(inputs, transitions, sequence_lengths, false)
}

/// Viterbi over the tag-to-tag transitions, plus the start and end potentials of a boundary
/// layout when `with_boundaries` is set.
pub(crate) fn decode(
    inputs: &Tensor,
    transitions: &Transitions,
    sequence_lengths: &Tensor,
    with_boundaries: bool,
) -> Result<(Vec<Vec<u32>>, Tensor)> {
    let (batch_size, max_seq_len, num_tags) = check_inputs(inputs, Some(transitions.num_tags()))?;
    check_dtype(inputs, transitions)?;
    let lengths = check_lengths(sequence_lengths, batch_size, max_seq_len)?;
    debug!(batch_size, max_seq_len, num_tags, with_boundaries, "crf_decode");

    if max_seq_len == 0 {
        let best_scores = Tensor::zeros(batch_size, inputs.dtype(), inputs.device())?;
        return Ok((vec![vec![]; batch_size], best_scores));
    }

    let (start, end) = if with_boundaries {
        (transitions.start(), transitions.end())
    } else {
        (None, None)
    };

    let mut score = inputs.i((.., 0))?;
    if let Some(start) = start {
        score = score.broadcast_add(start)?;
    }

    let mut history = Vec::with_capacity(max_seq_len - 1);
    for i in 1..max_seq_len {
        // [batch, from, to]
        let broadcast_score = score.unsqueeze(2)?;
        let broadcast_inputs = inputs.i((.., i))?.unsqueeze(1)?;
        let next_score = broadcast_score
            .broadcast_add(transitions.inner())?
            .broadcast_add(&broadcast_inputs)?;

        let (next_score, indices) = max_indices(&next_score, 1)?;

        let active: Vec<u8> = lengths.iter().map(|&len| u8::from(i < len)).collect();
        let active = Tensor::from_vec(active, (batch_size, 1), inputs.device())?
            .broadcast_as(next_score.shape())?;
        score = active.where_cond(&next_score, &score)?;
        history.push(indices.to_vec2::<u32>()?);
        trace!(step = i, "viterbi forward step");
    }

    if let Some(end) = end {
        score = score.broadcast_add(end)?;
    }

    let (best_scores, best_last_tags) = max_indices(&score, 1)?;
    let best_last_tags = best_last_tags.to_vec1::<u32>()?;

    let mut best_tags_list = Vec::with_capacity(batch_size);
    for (idx, &len) in lengths.iter().enumerate() {
        if len == 0 {
            best_tags_list.push(vec![]);
            continue;
        }

        let mut last_tag = best_last_tags[idx];
        let mut best_tags = vec![last_tag];
        for hist in history[..len - 1].iter().rev() {
            last_tag = hist[idx][last_tag as usize];
            best_tags.push(last_tag);
        }

        best_tags.reverse();
        best_tags_list.push(best_tags);
    }

    let non_empty = non_empty_mask(&lengths, inputs.device())?;
    let best_scores = non_empty.where_cond(&best_scores, &best_scores.zeros_like()?)?;
    Ok((best_tags_list, best_scores))
}
