use crate::Transitions;
use candle_core::{utils, DType, Device, Result, Tensor};

#[cfg(any(feature = "cuda", feature = "metal"))]
pub(crate) const OK_TYPES: [DType; 2] = [DType::F32, DType::F64];
#[cfg(not(any(feature = "cuda", feature = "metal")))]
pub(crate) const OK_TYPES: [DType; 4] = [DType::F32, DType::F64, DType::F16, DType::BF16];

#[cfg(any(feature = "cuda", feature = "metal"))]
pub(crate) const FAIL_TYPES: [DType; 5] =
    [DType::U8, DType::U32, DType::I64, DType::F16, DType::BF16];
#[cfg(not(any(feature = "cuda", feature = "metal")))]
pub(crate) const FAIL_TYPES: [DType; 3] = [DType::U8, DType::U32, DType::I64];

/// Dtypes the numeric comparisons against the oracle run under.
pub(crate) const SCORE_TYPES: [DType; 2] = [DType::F32, DType::F64];

pub(crate) const FIXTURE_LENGTH: i64 = 3;

pub(crate) fn epsilon(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => 1e-6,
        DType::F32 => 1e-5,
        DType::F16 => 1e-2,
        DType::BF16 => 1e-1,
        _ => panic!("dtype not supported"),
    }
}

/// `|actual - expected| <= epsilon * (1 + |expected|)`
pub(crate) fn assert_close(actual: f64, expected: f64, epsilon: f64) {
    let tolerance = epsilon * (1.0 + expected.abs());
    assert!(
        (actual - expected).abs() <= tolerance,
        "{} is not close to {} (tolerance {})",
        actual,
        expected,
        tolerance
    );
}

pub(crate) fn scalar(x: &Tensor) -> Result<f64> {
    x.to_dtype(DType::F64)?.to_scalar::<f64>()
}

pub(crate) fn to_host1(x: &Tensor) -> Result<Vec<f64>> {
    x.to_dtype(DType::F64)?.to_vec1::<f64>()
}

pub(crate) fn to_host2(x: &Tensor) -> Result<Vec<Vec<f64>>> {
    x.to_dtype(DType::F64)?.to_vec2::<f64>()
}

fn use_gpu(gpu: bool) -> Result<Device> {
    if gpu {
        if utils::cuda_is_available() {
            println!("CUDA is available");
            Device::new_cuda(0)
        } else if utils::metal_is_available() {
            println!("Metal is available");
            Device::new_metal(0)
        } else {
            println!("CUDA and Metal are not available, using CPU");
            Ok(Device::Cpu)
        }
    } else {
        println!("Using CPU");
        Ok(Device::Cpu)
    }
}

pub(crate) fn test_device() -> Result<Device> {
    use_gpu(cfg!(any(feature = "cuda", feature = "metal")))
}

/// `[4, 3]` emission potentials.
pub(crate) fn fixture_inputs(dtype: DType, device: &Device) -> Result<Tensor> {
    Tensor::new(
        &[[4_f32, 5., -3.], [3., -1., 3.], [-1., 2., 1.], [0., 0., 0.]],
        device,
    )?
    .to_dtype(dtype)
}

/// `[4]` tags, the last position is padding.
pub(crate) fn fixture_tags(device: &Device) -> Result<Tensor> {
    Tensor::new(&[1_i64, 2, 1, 0], device)
}

/// `[4, 4]` transitions in the boundary layout, with zero start row and end column.
pub(crate) fn fixture_transitions(dtype: DType, device: &Device) -> Result<Tensor> {
    Tensor::new(
        &[
            [0_f32, 0., 0., 0.],
            [-3., 5., -2., 0.],
            [3., 4., 1., 0.],
            [1., 2., 1., 0.],
        ],
        device,
    )?
    .to_dtype(dtype)
}

pub(crate) fn random_transitions(
    num_tags: usize,
    with_boundaries: bool,
    dtype: DType,
    device: &Device,
) -> Result<Transitions> {
    if with_boundaries {
        let m = Tensor::randn(0.0_f32, 1., (num_tags + 1, num_tags + 1), device)?.to_dtype(dtype)?;
        Transitions::with_boundaries(&m)
    } else {
        let m = Tensor::randn(0.0_f32, 1., (num_tags, num_tags), device)?.to_dtype(dtype)?;
        Transitions::new(&m)
    }
}

#[test]
fn test_fixture_shapes() -> anyhow::Result<()> {
    let device = test_device()?;
    assert_eq!(fixture_inputs(DType::F32, &device)?.dims2()?, (4, 3));
    assert_eq!(fixture_tags(&device)?.dims1()?, 4);
    assert_eq!(fixture_transitions(DType::F32, &device)?.dims2()?, (4, 4));
    Ok(())
}
