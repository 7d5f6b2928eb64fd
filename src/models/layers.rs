//! Convolutions over NHWC tensors.
//!
//! The flow transforms keep the channels last, `tch::nn::Conv2D` expects them
//! first, so these wrappers permute around the convolution.
use tch::{nn, nn::Module, Tensor};

pub(crate) fn to_nchw(xs: &Tensor) -> Tensor {
    xs.permute([0, 3, 1, 2])
}

pub(crate) fn to_nhwc(xs: &Tensor) -> Tensor {
    xs.permute([0, 2, 3, 1])
}

#[derive(Debug)]
pub struct Conv2dNhwc {
    conv: nn::Conv2D,
}

impl Conv2dNhwc {
    /// A "same" padded convolution with the default tch initialization.
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, ksize: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: ksize / 2, ..Default::default() };
        Self { conv: nn::conv2d(vs, in_channels, out_channels, ksize, conv_cfg) }
    }

    /// A "same" padded convolution whose weights and bias all start at zero, so
    /// its output is zero until training moves it.
    pub fn zeros(vs: nn::Path, in_channels: i64, out_channels: i64, ksize: i64) -> Self {
        let conv_cfg = nn::ConvConfig {
            padding: ksize / 2,
            ws_init: nn::Init::Const(0.),
            bs_init: nn::Init::Const(0.),
            ..Default::default()
        };
        Self { conv: nn::conv2d(vs, in_channels, out_channels, ksize, conv_cfg) }
    }
}

impl Module for Conv2dNhwc {
    fn forward(&self, xs: &Tensor) -> Tensor {
        to_nhwc(&to_nchw(xs).apply(&self.conv))
    }
}

/// The sub-network of an affine coupling: two ReLU convolutions followed by a
/// zero initialized one, so the coupling starts as the identity.
#[derive(Debug)]
pub struct CouplingNetwork {
    conv1: Conv2dNhwc,
    conv2: Conv2dNhwc,
    conv_out: Conv2dNhwc,
}

impl CouplingNetwork {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, width: i64) -> Self {
        let conv1 = Conv2dNhwc::new(&vs / "conv1", in_channels, width, 3);
        let conv2 = Conv2dNhwc::new(&vs / "conv2", width, width, 1);
        let conv_out = Conv2dNhwc::zeros(&vs / "conv_out", width, out_channels, 3);
        Self { conv1, conv2, conv_out }
    }
}

impl Module for CouplingNetwork {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv1).relu().apply(&self.conv2).relu().apply(&self.conv_out)
    }
}
