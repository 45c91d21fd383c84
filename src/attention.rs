use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::activation::{relu, softmax},
};

#[derive(Config, Debug)]
pub struct SoftAttentionConfig {
    /// Width of each image region vector.
    pub encoder_dim: usize,
    /// Width of the LSTM hidden state.
    pub hidden_dim: usize,
    /// Width of the shared space both are projected into.
    pub attention_dim: usize,
}

impl SoftAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SoftAttention<B> {
        SoftAttention {
            region_projection: LinearConfig::new(self.encoder_dim, self.attention_dim)
                .init(device),
            hidden_projection: LinearConfig::new(self.hidden_dim, self.attention_dim)
                .init(device),
            score: LinearConfig::new(self.attention_dim, 1).init(device),
        }
    }
}

/// Additive (Bahdanau) attention over image regions.
///
/// Stateless: the output depends only on the regions and the hidden state
/// passed to [`SoftAttention::forward`].
#[derive(Module, Debug)]
pub struct SoftAttention<B: Backend> {
    region_projection: Linear<B>,
    hidden_projection: Linear<B>,
    score: Linear<B>,
}

impl<B: Backend> SoftAttention<B> {
    /// `regions: [N, R, De]`, `hidden: [N, Dh]` -> `(context [N, De], weights [N, R])`
    pub fn forward(
        &self,
        regions: Tensor<B, 3>,
        hidden: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [batch, num_regions, encoder_dim] = regions.dims();

        let projected_regions = self.region_projection.forward(regions.clone());
        let projected_hidden = self.hidden_projection.forward(hidden).unsqueeze_dim::<3>(1);

        // [N, R, Da] + [N, 1, Da] broadcasts over the regions.
        let scores = self
            .score
            .forward(relu(projected_regions + projected_hidden))
            .reshape([batch, num_regions]);

        // burn's softmax subtracts the row maximum before exponentiating.
        let weights = softmax(scores, 1);

        let context = (regions * weights.clone().unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .reshape([batch, encoder_dim]);

        (context, weights)
    }
}
