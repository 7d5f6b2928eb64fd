//! # Quantization
//!
//! Tensor level conversions between `[0, 255]` pixel values and the `[-0.5, 0.5]`
//! range the flow is trained on. Decoding and resizing images is left to the
//! caller.
use crate::utils::rand_uniform;
use rand::RngCore;
use tch::{Kind, Tensor};

/// Reduces `[0, 255]` pixel values to `num_bits` bits and maps them to
/// `[-0.5, 0.5)`. When `noise` is given, uniform noise in `[0, 1 / 2^num_bits)`
/// is added to dequantize the values.
pub fn dequantize(image: &Tensor, num_bits: u32, noise: Option<&mut dyn RngCore>) -> Tensor {
    let image = image.to_kind(Kind::Float).clamp(0., 255.);
    let image = if num_bits < 8 { (image / 2f64.powi(8 - num_bits as i32)).floor() } else { image };
    let num_bins = 2f64.powi(num_bits as i32);
    let image = image / num_bins - 0.5;
    match noise {
        None => image,
        Some(rng) => {
            let noise = rand_uniform(&image.size(), 0., 1. / num_bins, image.device(), rng);
            image + noise
        }
    }
}

/// Maps values in `[-0.5, 0.5]` back to `uint8` pixel values.
pub fn postprocess(xs: &Tensor, num_bits: u32) -> Tensor {
    let num_bins = 2f64.powi(num_bits as i32);
    let xs = ((xs + 0.5) * num_bins).floor() * (256. / num_bins);
    xs.clamp(0., 255.).to_kind(Kind::Uint8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use tch::Device;

    #[test]
    fn quantization_round_trip() {
        let pixels = Tensor::from_slice(&[0f32, 8., 100., 255.]).reshape([1, 2, 2, 1]);
        let xs = dequantize(&pixels, 5, None);
        let values = Vec::<f32>::try_from(xs.reshape([-1])).unwrap();
        assert_eq!(values, [-0.5, -0.46875, -0.125, 0.46875]);
        let back = Vec::<u8>::try_from(postprocess(&xs, 5).reshape([-1])).unwrap();
        assert_eq!(back, [0, 8, 96, 248]);
    }

    #[test]
    fn dequantization_noise_stays_in_bin() {
        let mut rng = StdRng::seed_from_u64(1);
        let pixels = Tensor::full([2, 4, 4, 3], 128., (Kind::Float, Device::Cpu));
        let xs = dequantize(&pixels, 8, Some(&mut rng as &mut dyn RngCore));
        let low = 128. / 256. - 0.5;
        assert!(xs.min().double_value(&[]) >= low);
        assert!(xs.max().double_value(&[]) < low + 1. / 256.);
        assert!(postprocess(&xs, 8).equal(&pixels.to_kind(Kind::Uint8)));
    }
}
