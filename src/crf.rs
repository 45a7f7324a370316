use crate::decode::decode;
use crate::norm::log_likelihood;
use crate::{check_inputs, check_lengths, Transitions};
use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::{Init, VarBuilder};
use std::fmt::Display;
use tracing::debug;

/// How per-sequence log-likelihoods are combined.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    None,
    #[default]
    Sum,
    Mean,
    /// Sum divided by the total number of real positions.
    TokenMean,
}

// -----------------------------------------------------------------------------

/// Linear-chain CRF layer owning its transition parameters.
///
/// Unlike the free ops, a layer built with boundaries scores the start and end potentials of
/// every sequence too.
pub struct Crf {
    pub(crate) num_tags: usize,
    pub(crate) with_boundaries: bool,
    pub(crate) transitions: Transitions,
}

impl Display for Crf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Crf(num_tags: {}, with_boundaries: {})",
            self.num_tags, self.with_boundaries
        )
    }
}

fn transition_dims(num_tags: usize, with_boundaries: bool) -> (usize, usize) {
    if with_boundaries {
        (num_tags + 1, num_tags + 1)
    } else {
        (num_tags, num_tags)
    }
}

fn transitions_from(transition_params: &Tensor, with_boundaries: bool) -> Result<Transitions> {
    if with_boundaries {
        Transitions::with_boundaries(transition_params)
    } else {
        Transitions::new(transition_params)
    }
}

impl Crf {
    /// Create a new CRF with uniformly initialized transitions.
    pub fn new(num_tags: usize, with_boundaries: bool, device: &Device) -> Result<Self> {
        Self::new_with_dtype(num_tags, with_boundaries, DType::F32, device)
    }

    pub fn new_with_dtype(
        num_tags: usize,
        with_boundaries: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        {
            use DType::*;
            match dtype {
                #[cfg(any(feature = "cuda", feature = "metal"))]
                F32 | F64 => {}
                #[cfg(not(any(feature = "cuda", feature = "metal")))]
                BF16 | F16 | F32 | F64 => {}
                _ => return Err(Error::UnsupportedDTypeForOp(dtype, "unsupported dtype")),
            }
        }

        if num_tags == 0 {
            return Err(Error::Msg("num_tags must be greater than 0".to_string()));
        }

        let shape = transition_dims(num_tags, with_boundaries);
        let transition_params = Tensor::zeros(shape, dtype, device)?.rand_like(-0.1, 1.0)?;
        debug!(num_tags, with_boundaries, ?dtype, "created crf");

        Ok(Self {
            num_tags,
            with_boundaries,
            transitions: transitions_from(&transition_params, with_boundaries)?,
        })
    }

    /// Build a CRF from existing transition parameters.
    pub fn from_transitions(transitions: Transitions) -> Self {
        Self {
            num_tags: transitions.num_tags(),
            with_boundaries: transitions.has_boundaries(),
            transitions,
        }
    }

    /// Load the `transitions` tensor from `vb`, uniformly initialized when missing.
    pub fn load(num_tags: usize, with_boundaries: bool, vb: VarBuilder) -> Result<Self> {
        if num_tags == 0 {
            return Err(Error::Msg("num_tags must be greater than 0".to_string()));
        }

        let transition_params = vb.get_with_hints(
            transition_dims(num_tags, with_boundaries),
            "transitions",
            Init::Uniform {
                lo: -0.1_f64,
                up: 1.0_f64,
            },
        )?;

        Ok(Self {
            num_tags,
            with_boundaries,
            transitions: transitions_from(&transition_params, with_boundaries)?,
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    /// Returns `(batch_size, max_seq_len)`.
    fn validate(&self, inputs: &Tensor, tags: Option<&Tensor>) -> Result<(usize, usize)> {
        let dtype_transitions = self.transitions.dtype();
        let dtype_inputs = inputs.dtype();
        if dtype_transitions != dtype_inputs {
            return Err(Error::Msg(format!(
                "inputs and CRF must have the same dtype, expected {:?}, got {:?}",
                dtype_transitions, dtype_inputs
            )));
        }

        let (batch_size, max_seq_len, _) = check_inputs(inputs, Some(self.num_tags))?;

        if let Some(tags) = tags {
            let dims = tags.dims().len();
            if dims != 2 {
                return Err(Error::Msg(format!(
                    "tags must have 2 dimensions, got {}",
                    dims
                )));
            }

            let (tag_d1, tag_d2) = tags.dims2()?;
            if (batch_size, max_seq_len) != (tag_d1, tag_d2) {
                return Err(Error::Msg(format!(
                    "the first two dimensions of inputs and tags must match, \
                     got ({}, {}) and ({}, {})",
                    batch_size, max_seq_len, tag_d1, tag_d2
                )));
            }
        }

        Ok((batch_size, max_seq_len))
    }

    fn lengths_or_full(
        &self,
        inputs: &Tensor,
        tags: Option<&Tensor>,
        sequence_lengths: Option<&Tensor>,
    ) -> Result<(Tensor, Vec<usize>)> {
        let (batch_size, max_seq_len) = self.validate(inputs, tags)?;
        match sequence_lengths {
            Some(sequence_lengths) => {
                let lengths = check_lengths(sequence_lengths, batch_size, max_seq_len)?;
                Ok((sequence_lengths.clone(), lengths))
            }
            None => {
                let full = vec![max_seq_len as i64; batch_size];
                let sequence_lengths = Tensor::from_vec(full, batch_size, inputs.device())?;
                Ok((sequence_lengths, vec![max_seq_len; batch_size]))
            }
        }
    }

    /// Log-likelihood of `tags`, reduced with `reduction`.
    ///
    /// Without `sequence_lengths` every sequence spans the full padded length.
    pub fn log_likelihood(
        &self,
        inputs: &Tensor,
        tags: &Tensor,
        sequence_lengths: Option<&Tensor>,
        reduction: Reduction,
    ) -> Result<Tensor> {
        let (sequence_lengths, lengths) =
            self.lengths_or_full(inputs, Some(tags), sequence_lengths)?;
        let llh = log_likelihood(
            inputs,
            tags,
            &sequence_lengths,
            &self.transitions,
            self.with_boundaries,
        )?;

        match reduction {
            Reduction::Sum => llh.sum_all(),
            Reduction::Mean => llh.mean_all(),
            Reduction::TokenMean => {
                let total: usize = lengths.iter().sum();
                if total == 0 {
                    return Err(Error::Msg(
                        "token mean needs at least one real position".to_string(),
                    ));
                }
                let z = Tensor::new(total as f64, inputs.device())?.to_dtype(llh.dtype())?;
                llh.sum_all()?.broadcast_div(&z)
            }
            Reduction::None => Ok(llh),
        }
    }

    /// Best tag path of every sequence, trimmed to its length.
    pub fn decode(
        &self,
        inputs: &Tensor,
        sequence_lengths: Option<&Tensor>,
    ) -> Result<Vec<Vec<u32>>> {
        let (sequence_lengths, _) = self.lengths_or_full(inputs, None, sequence_lengths)?;
        let (best_tags, _) = decode(
            inputs,
            &self.transitions,
            &sequence_lengths,
            self.with_boundaries,
        )?;
        Ok(best_tags)
    }
}

// -----------------------------------------------------------------------------
