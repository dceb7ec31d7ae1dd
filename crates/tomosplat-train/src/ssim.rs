use burn::tensor::{Tensor, TensorData, backend::Backend, module::conv2d, ops::ConvOptions};

const C1: f32 = 0.01 * 0.01;
const C2: f32 = 0.03 * 0.03;

/// Single-channel structural similarity with a Gaussian window.
#[derive(Debug, Clone)]
pub struct Ssim<B: Backend> {
    window: Tensor<B, 4>,
    window_size: usize,
}

impl<B: Backend> Ssim<B> {
    pub fn new(window_size: usize, device: &B::Device) -> Self {
        let sigma = 1.5f32;
        let half = (window_size / 2) as f32;
        let gauss: Vec<f32> = (0..window_size)
            .map(|i| (-((i as f32 - half).powi(2)) / (2.0 * sigma * sigma)).exp())
            .collect();
        let norm: f32 = gauss.iter().sum();
        let gauss: Vec<f32> = gauss.iter().map(|g| g / norm).collect();

        let window_2d: Vec<f32> = gauss
            .iter()
            .flat_map(|a| gauss.iter().map(move |b| a * b))
            .collect();
        let window = Tensor::from_data(
            TensorData::new(window_2d, [1, 1, window_size, window_size]),
            device,
        );
        Self {
            window,
            window_size,
        }
    }

    fn filter(&self, img: Tensor<B, 4>) -> Tensor<B, 4> {
        let pad = self.window_size / 2;
        conv2d(
            img,
            self.window.clone(),
            None,
            ConvOptions::new([1, 1], [pad, pad], [1, 1], 1),
        )
    }

    /// Mean SSIM between two `[H, W]` images.
    pub fn ssim(&self, a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
        let [h, w] = a.dims();
        let a = a.reshape([1, 1, h, w]);
        let b = b.reshape([1, 1, h, w]);

        let mu_a = self.filter(a.clone());
        let mu_b = self.filter(b.clone());
        let mu_aa = mu_a.clone() * mu_a.clone();
        let mu_bb = mu_b.clone() * mu_b.clone();
        let mu_ab = mu_a * mu_b;

        let sigma_aa = self.filter(a.clone() * a.clone()) - mu_aa.clone();
        let sigma_bb = self.filter(b.clone() * b.clone()) - mu_bb.clone();
        let sigma_ab = self.filter(a * b) - mu_ab.clone();

        let num = (mu_ab * 2.0 + C1) * (sigma_ab * 2.0 + C2);
        let den = (mu_aa + mu_bb + C1) * (sigma_aa + sigma_bb + C2);
        (num / den).mean()
    }

    /// Structural dissimilarity, `(1 - ssim) / 2`, as a loss term.
    pub fn dssim(&self, a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
        (-self.ssim(a, b) + 1.0) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    #[test]
    fn identical_images_score_one() {
        let device = Default::default();
        let ssim = Ssim::<B>::new(11, &device);
        let img = Tensor::random([24, 24], Distribution::Uniform(0.0, 1.0), &device);
        let score: f32 = ssim.ssim(img.clone(), img).into_scalar();
        assert!((score - 1.0).abs() < 1e-4, "got {score}");
    }

    #[test]
    fn different_images_score_lower() {
        let device = Default::default();
        let ssim = Ssim::<B>::new(11, &device);
        let a = Tensor::random([24, 24], Distribution::Uniform(0.0, 1.0), &device);
        let b = Tensor::random([24, 24], Distribution::Uniform(0.0, 1.0), &device);
        let score: f32 = ssim.ssim(a.clone(), b.clone()).into_scalar();
        assert!(score < 0.99);
        let loss: f32 = ssim.dssim(a, b).into_scalar();
        assert!(loss > 0.0);
    }
}
