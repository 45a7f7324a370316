//! Linear-chain CRF ops on candle tensors.
//!
//! Batch-first scoring of tag sequences ([`crf_unary_score`], [`crf_binary_score`],
//! [`crf_sequence_score`]), the log-partition function through the forward algorithm
//! ([`crf_log_norm`]), the log-likelihood built on both ([`crf_log_likelihood`]) and viterbi
//! decoding ([`viterbi_decode`], [`crf_decode`]). These ops read the tag-to-tag block of the
//! transitions only; start and end potentials are scored by [`crf_boundary_score`]. [`Crf`]
//! wraps them as a layer owning its transition parameters, adding the boundary terms when
//! built with them.

use candle_core::{shape::Dim, DType, Device, Error, Result, Tensor};

mod crf;
mod decode;
mod norm;
mod score;
mod transitions;

pub use crf::{Crf, Reduction};
pub use decode::{crf_decode, viterbi_decode};
pub use norm::{crf_log_likelihood, crf_log_norm};
pub use score::{crf_binary_score, crf_boundary_score, crf_sequence_score, crf_unary_score};
pub use transitions::Transitions;

#[cfg(test)]
mod oracle;
#[cfg(test)]
mod testing;

// -----------------------------------------------------------------------------

/// Checks `inputs` is a float `[batch, max_seq_len, num_tags]` tensor and returns its dims.
pub(crate) fn check_inputs(
    inputs: &Tensor,
    num_tags: Option<usize>,
) -> Result<(usize, usize, usize)> {
    let dims = inputs.dims().len();
    if dims != 3 {
        return Err(Error::Msg(format!(
            "inputs must have 3 dimensions, got {}",
            dims
        )));
    }

    if !inputs.dtype().is_float() {
        return Err(Error::UnsupportedDTypeForOp(inputs.dtype(), "inputs"));
    }

    let (batch_size, max_seq_len, d3) = inputs.dims3()?;
    if let Some(num_tags) = num_tags {
        if d3 != num_tags {
            return Err(Error::Msg(format!(
                "expected last dimension of inputs is {}, got {}",
                num_tags, d3
            )));
        }
    }

    Ok((batch_size, max_seq_len, d3))
}

pub(crate) fn check_dtype(inputs: &Tensor, transitions: &Transitions) -> Result<()> {
    if inputs.dtype() != transitions.dtype() {
        return Err(Error::Msg(format!(
            "inputs and transition_params must have the same dtype, expected {:?}, got {:?}",
            transitions.dtype(),
            inputs.dtype()
        )));
    }
    Ok(())
}

/// Checks `tag_indices` is an i64 `[batch_size, max_seq_len]` tensor of tags below `num_tags`
/// and returns the tags on the host, row-major.
///
/// Padded positions are checked too, they are still gathered before masking.
pub(crate) fn check_tags(
    tag_indices: &Tensor,
    batch_size: usize,
    max_seq_len: usize,
    num_tags: usize,
) -> Result<Vec<i64>> {
    if tag_indices.dtype() != DType::I64 {
        return Err(Error::Msg("tag_indices must be of type i64".to_string()));
    }

    let dims = tag_indices.dims().len();
    if dims != 2 {
        return Err(Error::Msg(format!(
            "tag_indices must have 2 dimensions, got {}",
            dims
        )));
    }

    let (d1, d2) = tag_indices.dims2()?;
    if (d1, d2) != (batch_size, max_seq_len) {
        return Err(Error::Msg(format!(
            "tag_indices must have shape ({}, {}), got ({}, {})",
            batch_size, max_seq_len, d1, d2
        )));
    }

    let tags = tag_indices.flatten_all()?.to_vec1::<i64>()?;
    if let Some(&tag) = tags.iter().find(|&&tag| tag < 0 || tag as usize >= num_tags) {
        return Err(Error::Msg(format!(
            "tag index {} out of range for {} tags",
            tag, num_tags
        )));
    }

    Ok(tags)
}

/// Checks `sequence_lengths` is an i64 `[batch_size]` tensor within `0..=max_seq_len` and
/// returns the lengths on the host.
pub(crate) fn check_lengths(
    sequence_lengths: &Tensor,
    batch_size: usize,
    max_seq_len: usize,
) -> Result<Vec<usize>> {
    if sequence_lengths.dtype() != DType::I64 {
        return Err(Error::Msg(
            "sequence_lengths must be of type i64".to_string(),
        ));
    }

    let dims = sequence_lengths.dims().len();
    if dims != 1 {
        return Err(Error::Msg(format!(
            "sequence_lengths must have 1 dimension, got {}",
            dims
        )));
    }

    let d1 = sequence_lengths.dims1()?;
    if d1 != batch_size {
        return Err(Error::Msg(format!(
            "expected {} sequence lengths, got {}",
            batch_size, d1
        )));
    }

    sequence_lengths
        .to_vec1::<i64>()?
        .into_iter()
        .enumerate()
        .map(|(b, len)| {
            if len < 0 {
                Err(Error::Msg(format!(
                    "sequence length {} at batch {} is negative",
                    len, b
                )))
            } else if len as usize > max_seq_len {
                Err(Error::Msg(format!(
                    "sequence length {} at batch {} exceeds the padded length {}",
                    len, b, max_seq_len
                )))
            } else {
                Ok(len as usize)
            }
        })
        .collect()
}

// -----------------------------------------------------------------------------

/// `[batch, max_seq_len]` u8 mask, on for positions before each sequence length.
pub(crate) fn sequence_mask(
    lengths: &[usize],
    max_seq_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let mask: Vec<u8> = lengths
        .iter()
        .flat_map(|&len| (0..max_seq_len).map(move |t| u8::from(t < len)))
        .collect();
    Tensor::from_vec(mask, (lengths.len(), max_seq_len), device)
}

// -----------------------------------------------------------------------------

pub(crate) fn max_indices<D: Dim + Copy>(x: &Tensor, dim: D) -> Result<(Tensor, Tensor)> {
    let max = x.max(dim)?;
    let idx = x.argmax(dim)?;
    Ok((max, idx))
}
