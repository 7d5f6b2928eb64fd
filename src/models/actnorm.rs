//! # Activation Normalization
//!
//! A per-channel affine transform `y = x * scale + bias` whose parameters are
//! set from the statistics of the first batch it sees, so that this batch comes
//! out with zero mean and unit variance on every channel.
use crate::error::{FlowError, Result};
use crate::utils::{dims4, per_example};
use tch::{nn, Kind, Tensor};

/// The data-dependent initialization goes through these two states exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActNormState {
    Uninitialized,
    Initialized,
}

/// `ActNorm` is `Send` but not `Sync`, as `tch::Tensor` is, so the first
/// forward pass, which writes the parameters, can never race with another
/// call. Sharing a model between threads requires wrapping it in a `Mutex`,
/// and the first caller to take the lock initializes it.
///
/// ```compile_fail
/// fn shared<T: Sync>() {}
/// shared::<glow::models::actnorm::ActNorm>();
/// ```
#[derive(Debug)]
pub struct ActNorm {
    scale: Tensor,
    bias: Tensor,
    // Stored in the var-store so that restored weights are not re-initialized.
    initialized: Tensor,
    num_channels: i64,
}

impl ActNorm {
    pub fn new(vs: nn::Path, num_channels: i64) -> Self {
        let scale = vs.ones("scale", &[num_channels]);
        let bias = vs.zeros("bias", &[num_channels]);
        let initialized = vs.zeros_no_train("initialized", &[]);
        Self { scale, bias, initialized, num_channels }
    }

    pub fn state(&self) -> ActNormState {
        if self.initialized.double_value(&[]) != 0. {
            ActNormState::Initialized
        } else {
            ActNormState::Uninitialized
        }
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    fn check_channels(&self, xs: &Tensor) -> Result<(i64, i64, i64)> {
        let (n, h, w, c) = dims4(xs)?;
        if c != self.num_channels {
            return Err(FlowError::Shape(format!(
                "actnorm expects {} channels, got {c}",
                self.num_channels
            )));
        }
        Ok((n, h, w))
    }

    /// Sets `scale = 1 / std` and `bias = -mean / std` from the per-channel
    /// statistics of `xs`. Does nothing if the layer is already initialized.
    pub fn initialize(&self, xs: &Tensor) -> Result<()> {
        self.check_channels(xs)?;
        if self.state() == ActNormState::Initialized {
            return Ok(());
        }
        tch::no_grad(|| -> Result<()> {
            let xs = xs.detach().to_kind(Kind::Float);
            let mean = xs.mean_dim(Some([0, 1, 2].as_slice()), false, Kind::Float);
            let var =
                (&xs - &mean).square().mean_dim(Some([0, 1, 2].as_slice()), false, Kind::Float);
            let std = var.sqrt();
            let stds = Vec::<f64>::try_from(std.to_kind(Kind::Double))?;
            if let Some(channel) = stds.iter().position(|&s| !(s > 0.)) {
                return Err(FlowError::DegenerateInput { channel });
            }
            tracing::debug!(
                channels = self.num_channels,
                min_std = stds.iter().cloned().fold(f64::INFINITY, f64::min),
                max_std = stds.iter().cloned().fold(0., f64::max),
                "actnorm data-dependent initialization"
            );
            self.scale.shallow_clone().f_copy_(&std.reciprocal())?;
            self.bias.shallow_clone().f_copy_(&(-mean / &std))?;
            self.initialized.shallow_clone().f_fill_(1.)?;
            Ok(())
        })
    }

    pub(crate) fn logdet(&self, n: i64, h: i64, w: i64) -> Tensor {
        let logdet = self.scale.abs().log().sum(Kind::Float) * (h * w) as f64;
        per_example(&logdet, n)
    }

    /// Returns `(x * scale + bias, logdet)`, initializing the layer from `xs`
    /// on its first call.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (n, h, w) = self.check_channels(xs)?;
        if self.state() == ActNormState::Uninitialized {
            self.initialize(xs)?;
        }
        let ys = xs * &self.scale + &self.bias;
        Ok((ys, self.logdet(n, h, w)))
    }

    /// Returns `(y - bias) / scale`.
    pub fn inverse(&self, ys: &Tensor) -> Result<Tensor> {
        self.check_channels(ys)?;
        if self.state() == ActNormState::Uninitialized {
            tracing::warn!("inverse pass through an uninitialized actnorm layer");
        }
        Ok((ys - &self.bias) / &self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn initialization_normalizes_first_batch() -> Result<()> {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm::new(vs.root(), 3);
        assert_eq!(actnorm.state(), ActNormState::Uninitialized);
        let xs = Tensor::randn([4, 5, 5, 3], (Kind::Float, Device::Cpu)) * 3. + 1.5;
        let (ys, _) = actnorm.forward(&xs)?;
        assert_eq!(actnorm.state(), ActNormState::Initialized);

        let mean = ys.mean_dim(Some([0, 1, 2].as_slice()), false, Kind::Float);
        let var = (&ys - &mean).square().mean_dim(Some([0, 1, 2].as_slice()), false, Kind::Float);
        assert!(mean.abs().max().double_value(&[]) < 1e-5);
        assert!((var.sqrt() - 1.).abs().max().double_value(&[]) < 1e-5);
        Ok(())
    }

    #[test]
    fn parameters_frozen_after_first_batch() -> Result<()> {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm::new(vs.root(), 2);
        let xs = Tensor::randn([8, 2, 2, 2], (Kind::Float, Device::Cpu));
        actnorm.forward(&xs)?;
        let scale = actnorm.scale().copy();
        let other = Tensor::randn([8, 2, 2, 2], (Kind::Float, Device::Cpu)) * 10.;
        actnorm.forward(&other)?;
        actnorm.inverse(&other)?;
        assert!(actnorm.scale().equal(&scale));
        Ok(())
    }

    #[test]
    fn round_trip_and_logdet() -> Result<()> {
        tch::manual_seed(2);
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm::new(vs.root(), 4);
        let xs = Tensor::randn([3, 4, 6, 4], (Kind::Float, Device::Cpu)) * 0.5;
        let (ys, logdet) = actnorm.forward(&xs)?;
        assert!(max_abs_diff(&actnorm.inverse(&ys)?, &xs) < 1e-4);
        assert_eq!(logdet.size(), [3]);
        let expected = actnorm.scale().abs().log().sum(Kind::Float).double_value(&[]) * 24.;
        assert!((logdet.double_value(&[0]) - expected).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn zero_variance_channel_is_degenerate() {
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm::new(vs.root(), 2);
        let xs = Tensor::randn([2, 3, 3, 2], (Kind::Float, Device::Cpu));
        let constant = Tensor::ones([2, 3, 3, 1], (Kind::Float, Device::Cpu));
        let xs = Tensor::cat(&[xs.narrow(3, 0, 1), constant], 3);
        match actnorm.forward(&xs) {
            Err(FlowError::DegenerateInput { channel }) => assert_eq!(channel, 1),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(actnorm.state(), ActNormState::Uninitialized);
    }

    #[test]
    fn first_caller_initializes_shared_layer() -> Result<()> {
        fn sendable<T: Send>() {}
        sendable::<ActNorm>();

        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = std::sync::Mutex::new(ActNorm::new(vs.root(), 2));
        let first = Tensor::randn([4, 3, 3, 2], (Kind::Float, Device::Cpu));
        let second = Tensor::randn([4, 3, 3, 2], (Kind::Float, Device::Cpu)) * 5. + 2.;
        let shared = &actnorm;
        std::thread::scope(|s| -> Result<()> {
            let handles: Vec<_> = [first.shallow_clone(), second.shallow_clone()]
                .into_iter()
                .map(|xs| s.spawn(move || shared.lock().unwrap().forward(&xs).map(|_| ())))
                .collect();
            for handle in handles {
                handle.join().unwrap()?;
            }
            Ok(())
        })?;

        let actnorm = actnorm.into_inner().unwrap();
        assert_eq!(actnorm.state(), ActNormState::Initialized);
        let inv_std = |xs: &Tensor| {
            let mean = xs.mean_dim(Some([0, 1, 2].as_slice()), false, Kind::Float);
            let var =
                (xs - &mean).square().mean_dim(Some([0, 1, 2].as_slice()), false, Kind::Float);
            var.sqrt().reciprocal()
        };
        let from_first = max_abs_diff(actnorm.scale(), &inv_std(&first)) < 1e-5;
        let from_second = max_abs_diff(actnorm.scale(), &inv_std(&second)) < 1e-5;
        assert!(from_first != from_second);
        Ok(())
    }

    #[test]
    fn channel_mismatch() {
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm::new(vs.root(), 2);
        let xs = Tensor::zeros([1, 2, 2, 3], (Kind::Float, Device::Cpu));
        assert!(matches!(actnorm.inverse(&xs), Err(FlowError::Shape(_))));
    }
}
