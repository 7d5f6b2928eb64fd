//! # Flow Step
//!
//! ActNorm, then an invertible 1x1 convolution, then an affine coupling. The
//! inverse runs the inverse of each transform in the opposite order.
use crate::error::Result;
use crate::models::actnorm::ActNorm;
use crate::models::coupling::AffineCoupling;
use crate::models::invertible_linear::InvertibleLinear;
use rand::Rng;
use tch::{nn, Tensor};

#[derive(Debug)]
pub struct FlowStep {
    pub actnorm: ActNorm,
    pub linear: InvertibleLinear,
    pub coupling: AffineCoupling,
}

impl FlowStep {
    pub fn new<R: Rng + ?Sized>(
        vs: nn::Path,
        num_channels: i64,
        nn_width: i64,
        rng: &mut R,
    ) -> Result<Self> {
        let actnorm = ActNorm::new(&vs / "actnorm", num_channels);
        let linear = InvertibleLinear::new(&vs / "linear", num_channels, rng)?;
        let coupling = AffineCoupling::new(&vs / "coupling", num_channels, nn_width)?;
        Ok(Self { actnorm, linear, coupling })
    }

    /// Returns the transformed tensor and the summed log-determinant of the
    /// three transforms, one value per batch element.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (xs, logdet_actnorm) = self.actnorm.forward(xs)?;
        let (xs, logdet_linear) = self.linear.forward(&xs)?;
        let (xs, logdet_coupling) = self.coupling.forward(&xs)?;
        Ok((xs, logdet_actnorm + logdet_linear + logdet_coupling))
    }

    pub fn inverse(&self, ys: &Tensor) -> Result<Tensor> {
        let xs = self.coupling.inverse(ys)?;
        let xs = self.linear.inverse(&xs)?;
        self.actnorm.inverse(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use tch::{Device, Kind};

    fn build(vs: &nn::VarStore, seed: u64) -> Result<FlowStep> {
        let mut rng = StdRng::seed_from_u64(seed);
        let step = FlowStep::new(vs.root(), 4, 8, &mut rng)?;
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                if name.contains("conv_out") || name.ends_with("lower") {
                    let noise = var.randn_like() * 0.1;
                    var.copy_(&noise);
                }
            }
        });
        Ok(step)
    }

    #[test]
    fn logdet_is_sum_of_components() -> Result<()> {
        tch::manual_seed(9);
        let vs = nn::VarStore::new(Device::Cpu);
        let step = build(&vs, 9)?;
        let xs = Tensor::randn([2, 4, 4, 4], (Kind::Float, Device::Cpu)) * 2. + 0.5;
        let (_, total) = step.forward(&xs)?;

        let (h1, l1) = step.actnorm.forward(&xs)?;
        let (h2, l2) = step.linear.forward(&h1)?;
        let (_, l3) = step.coupling.forward(&h2)?;
        let diff = (total - (l1 + l2 + l3)).abs().max().double_value(&[]);
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn round_trip() -> Result<()> {
        tch::manual_seed(10);
        let vs = nn::VarStore::new(Device::Cpu);
        let step = build(&vs, 10)?;
        let xs = Tensor::randn([3, 2, 6, 4], (Kind::Float, Device::Cpu));
        let (ys, logdet) = step.forward(&xs)?;
        assert_eq!(logdet.size(), [3]);
        let diff = (step.inverse(&ys)? - &xs).abs().mean(Kind::Float).double_value(&[]);
        assert!(diff < 1e-4);
        Ok(())
    }
}
