use candle_core::{DType, Error, IndexOp, Result, Tensor};

/// Transition potentials of a linear-chain CRF.
///
/// Two layouts are supported:
///
/// * plain, `[num_tags, num_tags]`, where `m[i, j]` scores tag `i` followed by tag `j`;
/// * with boundaries, `[num_tags + 1, num_tags + 1]`, where the tag-to-tag block is
///   `m[1.., ..num_tags]`, the first row `m[0, ..num_tags]` scores leaving the start
///   state and the last column `m[1.., num_tags]` scores entering the end state.
#[derive(Debug, Clone)]
pub struct Transitions {
    num_tags: usize,
    inner: Tensor,
    start: Option<Tensor>,
    end: Option<Tensor>,
}

impl Transitions {
    /// Plain `[num_tags, num_tags]` transitions, no start or end state.
    pub fn new(transition_params: &Tensor) -> Result<Self> {
        let num_tags = square_dim(transition_params)?;
        if num_tags == 0 {
            return Err(Error::Msg(
                "transition_params must cover at least one tag".to_string(),
            ));
        }

        Ok(Self {
            num_tags,
            inner: transition_params.clone(),
            start: None,
            end: None,
        })
    }

    /// `[num_tags + 1, num_tags + 1]` transitions carrying a start row and an end column.
    pub fn with_boundaries(transition_params: &Tensor) -> Result<Self> {
        let dim = square_dim(transition_params)?;
        if dim < 2 {
            return Err(Error::Msg(format!(
                "transition_params with boundaries must be at least 2x2, got {}x{}",
                dim, dim
            )));
        }
        let num_tags = dim - 1;

        let inner = transition_params.i((1.., ..num_tags))?.contiguous()?;
        let start = transition_params.i((0, ..num_tags))?.contiguous()?;
        let end = transition_params.i((1.., num_tags))?.contiguous()?;

        Ok(Self {
            num_tags,
            inner,
            start: Some(start),
            end: Some(end),
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn has_boundaries(&self) -> bool {
        self.start.is_some()
    }

    /// Tag-to-tag block, `[num_tags, num_tags]`.
    pub fn inner(&self) -> &Tensor {
        &self.inner
    }

    /// Start state to first tag, `[num_tags]`.
    pub fn start(&self) -> Option<&Tensor> {
        self.start.as_ref()
    }

    /// Last tag to end state, `[num_tags]`.
    pub fn end(&self) -> Option<&Tensor> {
        self.end.as_ref()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype()
    }
}

fn square_dim(transition_params: &Tensor) -> Result<usize> {
    let dims = transition_params.dims().len();
    if dims != 2 {
        return Err(Error::Msg(format!(
            "transition_params must have 2 dimensions, got {}",
            dims
        )));
    }

    let (rows, cols) = transition_params.dims2()?;
    if rows != cols {
        return Err(Error::Msg(format!(
            "transition_params must be square, got {}x{}",
            rows, cols
        )));
    }

    if !transition_params.dtype().is_float() {
        return Err(Error::UnsupportedDTypeForOp(
            transition_params.dtype(),
            "transition_params",
        ));
    }

    Ok(rows)
}
