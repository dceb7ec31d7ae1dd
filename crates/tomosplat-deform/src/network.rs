use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    tensor::{Tensor, activation, backend::Backend},
};

#[derive(Config, Debug)]
pub struct DeformNetworkConfig {
    /// Width of the grid feature vector fed into the network.
    pub feature_dim: usize,
    #[config(default = 64)]
    pub width: usize,
    #[config(default = 1)]
    pub depth: usize,
}

impl DeformNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeformNetwork<B> {
        let mut hidden = Vec::with_capacity(self.depth);
        let mut input = self.feature_dim;
        for _ in 0..self.depth {
            hidden.push(LinearConfig::new(input, self.width).init(device));
            input = self.width;
        }
        DeformNetwork {
            hidden,
            pos_head: LinearConfig::new(input, 3).init(device),
            scale_head: LinearConfig::new(input, 3).init(device),
            rot_head: LinearConfig::new(input, 4).init(device),
            density_head: LinearConfig::new(input, 1).init(device),
        }
    }
}

/// Decodes hexplane features into per-Gaussian parameter offsets. The heads
/// emit raw offsets; the caller adds them to pre-activation parameters.
#[derive(Module, Debug)]
pub struct DeformNetwork<B: Backend> {
    hidden: Vec<Linear<B>>,
    pos_head: Linear<B>,
    scale_head: Linear<B>,
    rot_head: Linear<B>,
    density_head: Linear<B>,
}

/// Offsets for one evaluation: `[N, 3]` position, `[N, 3]` log-scale,
/// `[N, 4]` quaternion and `[N, 1]` raw-density deltas.
#[derive(Debug, Clone)]
pub struct DeformOffsets<B: Backend> {
    pub position: Tensor<B, 2>,
    pub log_scale: Tensor<B, 2>,
    pub rotation: Tensor<B, 2>,
    pub density: Tensor<B, 2>,
}

impl<B: Backend> DeformNetwork<B> {
    pub fn forward(&self, features: Tensor<B, 2>) -> DeformOffsets<B> {
        let mut h = features;
        for layer in &self.hidden {
            h = activation::relu(layer.forward(h));
        }
        DeformOffsets {
            position: self.pos_head.forward(h.clone()),
            log_scale: self.scale_head.forward(h.clone()),
            rotation: self.rot_head.forward(h.clone()),
            density: self.density_head.forward(h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    #[test]
    fn head_shapes() {
        let device = Default::default();
        let net = DeformNetworkConfig::new(16).init::<B>(&device);
        let feat = Tensor::random([5, 16], Distribution::Default, &device);
        let out = net.forward(feat);
        assert_eq!(out.position.dims(), [5, 3]);
        assert_eq!(out.log_scale.dims(), [5, 3]);
        assert_eq!(out.rotation.dims(), [5, 4]);
        assert_eq!(out.density.dims(), [5, 1]);
    }
}
