//! Graph encoder: node attention over the K-neighbor window, then an edge update made
//! of an outer product of node embeddings and a K x K self-attention per residue.
use super::configs::TMPNNConfig;
use super::utilities::{cat_neighbors_nodes, gather_nodes, masked_softmax};
use candle_core::{Module, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, VarBuilder};

#[derive(Clone, Debug)]
pub struct PositionWiseFeedForward {
    w_in: Linear,
    w_out: Linear,
}

impl PositionWiseFeedForward {
    pub fn new(vb: VarBuilder, dim_input: usize, dim_feedforward: usize) -> Result<Self> {
        let w_in = linear::linear(dim_input, dim_feedforward, vb.pp("W_in"))?;
        let w_out = linear::linear(dim_feedforward, dim_input, vb.pp("W_out"))?;
        Ok(Self { w_in, w_out })
    }
}

impl Module for PositionWiseFeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.w_in.forward(x)?.gelu_erf()?;
        self.w_out.forward(&x)
    }
}

/// Multi-head attention of each residue over its K neighbors.
///
/// Queries come from the node embedding, keys and values from the neighbor view
/// (`num_in` channels, e.g. `[h_E, h_V[j]]`).
#[derive(Clone, Debug)]
pub struct NeighborAttention {
    num_hidden: usize,
    num_heads: usize,
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
}

impl NeighborAttention {
    pub fn new(vb: VarBuilder, num_hidden: usize, num_in: usize, num_heads: usize) -> Result<Self> {
        Ok(Self {
            num_hidden,
            num_heads,
            w_q: linear::linear_no_bias(num_hidden, num_hidden, vb.pp("W_Q"))?,
            w_k: linear::linear_no_bias(num_in, num_hidden, vb.pp("W_K"))?,
            w_v: linear::linear_no_bias(num_in, num_hidden, vb.pp("W_V"))?,
            w_o: linear::linear_no_bias(num_hidden, num_hidden, vb.pp("W_O"))?,
        })
    }

    /// `h_v` `[B, M, H]`, `h_e` `[B, M, K, num_in]`, `mask_attend` `[B, M, K]`.
    pub fn forward(&self, h_v: &Tensor, h_e: &Tensor, mask_attend: Option<&Tensor>) -> Result<Tensor> {
        let (b, m, k, _) = h_e.dims4()?;
        let n_heads = self.num_heads;
        let d = self.num_hidden / n_heads;

        // [B * M, heads, 1, d]
        let q = self
            .w_q
            .forward(h_v)?
            .reshape((b * m, n_heads, 1, d))?;
        // [B * M, heads, d, K]
        let keys = self
            .w_k
            .forward(h_e)?
            .reshape((b * m, k, n_heads, d))?
            .permute((0, 2, 3, 1))?
            .contiguous()?;
        // [B * M, heads, K, d]
        let values = self
            .w_v
            .forward(h_e)?
            .reshape((b * m, k, n_heads, d))?
            .transpose(1, 2)?
            .contiguous()?;

        let logits = (q.matmul(&keys)? / (d as f64).sqrt())?.reshape((b, m, n_heads, k))?;
        let attend = match mask_attend {
            Some(mask) => {
                let mask = mask.unsqueeze(2)?.broadcast_as(logits.shape())?;
                masked_softmax(&logits, &mask)?
            }
            None => softmax_last_dim(&logits)?,
        };

        let update = attend
            .reshape((b * m, n_heads, 1, k))?
            .matmul(&values)?
            .reshape((b, m, self.num_hidden))?;
        self.w_o.forward(&update)
    }
}

/// K x K self-attention among the edges of each residue.
#[derive(Clone, Debug)]
pub struct EdgeSelfAttention {
    num_hidden: usize,
    num_heads: usize,
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
}

impl EdgeSelfAttention {
    pub fn new(vb: VarBuilder, num_hidden: usize, num_heads: usize) -> Result<Self> {
        Ok(Self {
            num_hidden,
            num_heads,
            w_q: linear::linear_no_bias(num_hidden, num_hidden, vb.pp("W_Q"))?,
            w_k: linear::linear_no_bias(num_hidden, num_hidden, vb.pp("W_K"))?,
            w_v: linear::linear_no_bias(num_hidden, num_hidden, vb.pp("W_V"))?,
            w_o: linear::linear_no_bias(num_hidden, num_hidden, vb.pp("W_O"))?,
        })
    }

    /// `h_e` `[B, L, K, H]`, `mask_attend` `[B, L, K]`.
    pub fn forward(&self, h_e: &Tensor, mask_attend: Option<&Tensor>) -> Result<Tensor> {
        let (b, l, k, _) = h_e.dims4()?;
        let n_heads = self.num_heads;
        let d = self.num_hidden / n_heads;

        // [B * L, heads, K, d]
        let split = |xs: Tensor| -> Result<Tensor> {
            xs.reshape((b * l, k, n_heads, d))?.transpose(1, 2)?.contiguous()
        };
        let q = split(self.w_q.forward(h_e)?)?;
        let keys = split(self.w_k.forward(h_e)?)?;
        let values = split(self.w_v.forward(h_e)?)?;

        let logits = (q.matmul(&keys.transpose(2, 3)?.contiguous()?)? / (d as f64).sqrt())?;
        let attend = match mask_attend {
            Some(mask) => {
                // an edge pair counts only when both neighbors are valid
                let mask = mask.reshape((b * l, 1, k))?;
                let mask_2d = mask.unsqueeze(D::Minus1)?.broadcast_mul(&mask.unsqueeze(2)?)?;
                masked_softmax(&logits, &mask_2d.broadcast_as(logits.shape())?)?
            }
            None => softmax_last_dim(&logits)?,
        };

        let update = attend
            .matmul(&values)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, l, k, self.num_hidden))?;
        self.w_o.forward(&update)
    }
}

/// Pairwise product of node embeddings for every (residue, neighbor) edge.
#[derive(Clone, Debug)]
pub struct OuterProduct {
    norm: LayerNorm,
    linear1: Linear,
    linear2: Linear,
}

impl OuterProduct {
    pub fn new(vb: VarBuilder, num_hidden: usize, num_outer: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            norm: layer_norm(num_hidden, eps, vb.pp("norm"))?,
            linear1: linear::linear(num_hidden, num_outer, vb.pp("linear1"))?,
            linear2: linear::linear(num_outer, num_hidden, vb.pp("linear2"))?,
        })
    }

    /// `[B, L, H]` nodes and `[B, L, K]` neighbor index into `[B, L, K, H]`.
    pub fn forward(&self, h_v: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
        let h = self.linear1.forward(&self.norm.forward(h_v)?)?;
        let outer = h.unsqueeze(2)?.broadcast_mul(&gather_nodes(&h, e_idx)?)?;
        self.linear2.forward(&outer)
    }
}

#[derive(Clone, Debug)]
pub struct EncLayer {
    dropout: Dropout,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    norm4: LayerNorm,
    node_attention: NeighborAttention,
    edge_attention: EdgeSelfAttention,
    dense1: PositionWiseFeedForward,
    dense2: PositionWiseFeedForward,
    outer_product: OuterProduct,
}

impl EncLayer {
    pub fn load(vb: VarBuilder, config: &TMPNNConfig, layer: usize) -> Result<Self> {
        let vb = vb.pp(layer);
        let num_hidden = config.hidden_dim;
        let num_in = num_hidden * 2;
        let eps = config.layer_norm_eps;

        Ok(Self {
            dropout: Dropout::new(config.dropout),
            norm1: layer_norm(num_hidden, eps, vb.pp("norm1"))?,
            norm2: layer_norm(num_hidden, eps, vb.pp("norm2"))?,
            norm3: layer_norm(num_hidden, eps, vb.pp("norm3"))?,
            norm4: layer_norm(num_hidden, eps, vb.pp("norm4"))?,
            node_attention: NeighborAttention::new(
                vb.pp("node_attention"),
                num_hidden,
                num_in,
                config.num_heads,
            )?,
            edge_attention: EdgeSelfAttention::new(vb.pp("edge_attention"), num_hidden, config.num_heads)?,
            dense1: PositionWiseFeedForward::new(vb.pp("dense1"), num_hidden, num_hidden * 4)?,
            dense2: PositionWiseFeedForward::new(vb.pp("dense2"), num_hidden, num_hidden * 4)?,
            outer_product: OuterProduct::new(vb.pp("outer_product"), num_hidden, num_hidden, eps)?,
        })
    }

    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        e_idx: &Tensor,
        mask_v: Option<&Tensor>,
        mask_attend: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        // node update
        let h_ev = cat_neighbors_nodes(h_v, h_e, e_idx)?;
        let dh = self.node_attention.forward(h_v, &h_ev, mask_attend)?.gelu_erf()?;
        let h_v = self.norm1.forward(&(h_v + self.dropout.forward(&dh, train)?)?)?;

        let dh = self.dense1.forward(&h_v)?.gelu_erf()?;
        let h_v = self.norm2.forward(&(&h_v + self.dropout.forward(&dh, train)?)?)?;
        let h_v = match mask_v {
            Some(mask) => h_v.broadcast_mul(&mask.unsqueeze(D::Minus1)?)?,
            None => h_v,
        };

        // edge update
        let h_e = (h_e + self.outer_product.forward(&h_v, e_idx)?)?;
        let dh_e = self.edge_attention.forward(&h_e, mask_attend)?.gelu_erf()?;
        let h_e = self.norm3.forward(&(&h_e + self.dropout.forward(&dh_e, train)?)?)?;

        let dh_e = self.dense2.forward(&h_e)?.gelu_erf()?;
        let h_e = self.norm4.forward(&(&h_e + self.dropout.forward(&dh_e, train)?)?)?;

        Ok((h_v, h_e))
    }
}
