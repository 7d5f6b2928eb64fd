// Shape and sanity helpers shared by the transforms, plus a wrapper around
// File::open adding details about the problematic file.
use crate::error::{FlowError, Result};
use rand::Rng;
use rand_distr::StandardNormal;
use std::path::Path;
use tch::{Device, Kind, Tensor};

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

/// Returns the (batch, height, width, channel) dimensions of an NHWC tensor.
pub fn dims4(xs: &Tensor) -> Result<(i64, i64, i64, i64)> {
    match xs.size().as_slice() {
        &[n, h, w, c] => Ok((n, h, w, c)),
        size => Err(FlowError::Shape(format!("expected a rank 4 NHWC tensor, got {size:?}"))),
    }
}

/// Fails with a shape error unless the channel count is even.
pub(crate) fn check_even_channels(xs: &Tensor) -> Result<i64> {
    let (_, _, _, c) = dims4(xs)?;
    if c % 2 != 0 {
        return Err(FlowError::Shape(format!("cannot split {c} channels in two halves")));
    }
    Ok(c)
}

pub(crate) fn is_finite(xs: &Tensor) -> bool {
    xs.isfinite().all().int64_value(&[]) != 0
}

/// Fails with a numerical divergence error if `xs` holds NaN or infinite values.
pub(crate) fn check_finite(xs: &Tensor, what: &str) -> Result<()> {
    if is_finite(xs) {
        Ok(())
    } else {
        Err(FlowError::NumericalDivergence(what.to_string()))
    }
}

/// Broadcasts a scalar tensor to one value per batch element.
pub(crate) fn per_example(value: &Tensor, batch: i64) -> Tensor {
    value.expand([batch], false)
}

/// Draws a standard normal tensor from a caller supplied random number generator
/// rather than from the libtorch global generator.
pub fn randn<R: Rng + ?Sized>(size: &[i64], device: Device, rng: &mut R) -> Tensor {
    let numel: i64 = size.iter().product();
    let values: Vec<f32> = (0..numel).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Tensor::from_slice(&values).reshape(size).to_kind(Kind::Float).to_device(device)
}

/// Draws values uniformly in `[low, high)` from a caller supplied generator.
pub fn rand_uniform<R: Rng + ?Sized>(
    size: &[i64],
    low: f64,
    high: f64,
    device: Device,
    rng: &mut R,
) -> Tensor {
    let numel: i64 = size.iter().product();
    let values: Vec<f32> = (0..numel).map(|_| rng.gen_range(low as f32..high as f32)).collect();
    Tensor::from_slice(&values).reshape(size).to_device(device)
}
