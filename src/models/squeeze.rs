//! # Squeeze and Unsqueeze
//!
//! Lossless reshapes trading spatial resolution for channel depth. Each 2x2
//! spatial block is moved to the channel axis, ordered row-major within the
//! block: the output channel `(2 * dy + dx) * C + c` holds the input value at
//! `(2 * h + dy, 2 * w + dx, c)`.
//!
//! These are permutations of the input values so they do not contribute to the
//! log-determinant.
use crate::error::{FlowError, Result};
use crate::utils::dims4;
use tch::Tensor;

/// Maps a `(N, H, W, C)` tensor to `(N, H/2, W/2, 4C)`.
pub fn squeeze(xs: &Tensor) -> Result<Tensor> {
    let (n, h, w, c) = dims4(xs)?;
    if h % 2 != 0 || w % 2 != 0 {
        return Err(FlowError::Shape(format!("cannot squeeze odd spatial size {h}x{w}")));
    }
    let xs = xs.reshape([n, h / 2, 2, w / 2, 2, c]).permute([0, 1, 3, 2, 4, 5]);
    Ok(xs.reshape([n, h / 2, w / 2, 4 * c]))
}

/// Maps a `(N, H, W, C)` tensor to `(N, 2H, 2W, C/4)`, the exact inverse of [`squeeze`].
pub fn unsqueeze(xs: &Tensor) -> Result<Tensor> {
    let (n, h, w, c) = dims4(xs)?;
    if c % 4 != 0 {
        return Err(FlowError::Shape(format!("cannot unsqueeze {c} channels")));
    }
    let xs = xs.reshape([n, h, w, 2, 2, c / 4]).permute([0, 1, 3, 2, 4, 5]);
    Ok(xs.reshape([n, 2 * h, 2 * w, c / 4]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn squeeze_block_ordering() -> Result<()> {
        let xs = Tensor::arange(16, (Kind::Float, Device::Cpu)).reshape([1, 4, 4, 1]);
        let ys = squeeze(&xs)?;
        assert_eq!(ys.size(), [1, 2, 2, 4]);
        let top_left = Vec::<f32>::try_from(ys.get(0).get(0).get(0))?;
        assert_eq!(top_left, [0., 1., 4., 5.]);
        let bottom_right = Vec::<f32>::try_from(ys.get(0).get(1).get(1))?;
        assert_eq!(bottom_right, [10., 11., 14., 15.]);
        Ok(())
    }

    #[test]
    fn squeeze_unsqueeze_exact() -> Result<()> {
        let xs = Tensor::arange(2 * 6 * 4 * 3, (Kind::Float, Device::Cpu)).reshape([2, 6, 4, 3]);
        let ys = squeeze(&xs)?;
        assert_eq!(ys.size(), [2, 3, 2, 12]);
        assert!(unsqueeze(&ys)?.equal(&xs));

        let zs = Tensor::arange(2 * 3 * 3 * 8, (Kind::Float, Device::Cpu)).reshape([2, 3, 3, 8]);
        let us = unsqueeze(&zs)?;
        assert_eq!(us.size(), [2, 6, 6, 2]);
        assert!(squeeze(&us)?.equal(&zs));
        Ok(())
    }

    #[test]
    fn shape_errors() {
        let odd = Tensor::zeros([1, 3, 4, 2], (Kind::Float, Device::Cpu));
        assert!(matches!(squeeze(&odd), Err(FlowError::Shape(_))));
        let channels = Tensor::zeros([1, 2, 2, 6], (Kind::Float, Device::Cpu));
        assert!(matches!(unsqueeze(&channels), Err(FlowError::Shape(_))));
        let rank3 = Tensor::zeros([2, 2, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(squeeze(&rank3), Err(FlowError::Shape(_))));
    }
}
