//! Invariant point attention over the whole chain.
//!
//! Scalar queries/keys/values are mixed with 3D points generated in each residue's local
//! frame and moved into the global frame before residues are compared. The pair bias
//! comes from the K-neighbor edge embeddings scattered into a dense `[B, L, L, C]`
//! tensor; non-neighbor pairs carry a zero pair feature. Scores only depend on
//! distances between global points, so the update is invariant to a rigid motion of the
//! whole structure.
use super::configs::{IpaConfig, TMPNNConfig};
use super::rigid::Rigid;
use super::utilities::softplus;
use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{layer_norm, linear, Dropout, Init, LayerNorm, Linear, VarBuilder};

/// softplus(x) == 1
const HEAD_WEIGHT_INIT: f64 = 0.541324854612918;

/// Dense pair representation from per-neighbor edges.
///
/// Rows of `e_idx` never repeat an index, so the summed scatter is a plain placement;
/// colliding writes would add up.
pub fn scatter_pair(h_e: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
    let (b, l, k, c) = h_e.dims4()?;
    let index = e_idx.unsqueeze(D::Minus1)?.broadcast_as((b, l, k, c))?.contiguous()?;
    Tensor::zeros((b, l, l, c), h_e.dtype(), h_e.device())?.scatter_add(&index, &h_e.contiguous()?, 2)
}

#[derive(Clone, Debug)]
pub struct InvariantPointAttention {
    c_hidden: usize,
    num_heads: usize,
    num_qk_points: usize,
    num_v_points: usize,
    inf: f64,
    eps: f64,
    offload_pair: bool,
    linear_q: Linear,
    linear_kv: Linear,
    linear_q_points: Linear,
    linear_kv_points: Linear,
    linear_b: Linear,
    head_weights: Tensor,
    linear_out: Linear,
}

impl InvariantPointAttention {
    pub fn new(vb: VarBuilder, c_s: usize, c_z: usize, config: &IpaConfig, offload_pair: bool) -> Result<Self> {
        let IpaConfig {
            c_hidden,
            num_heads,
            num_qk_points,
            num_v_points,
            inf,
            eps,
        } = *config;
        let hc = c_hidden * num_heads;
        let hpq = num_heads * num_qk_points * 3;
        let hpkv = num_heads * (num_qk_points + num_v_points) * 3;
        let concat_out_dim = num_heads * (c_z + c_hidden + num_v_points * 4);

        Ok(Self {
            c_hidden,
            num_heads,
            num_qk_points,
            num_v_points,
            inf,
            eps,
            offload_pair,
            linear_q: linear::linear(c_s, hc, vb.pp("linear_q"))?,
            linear_kv: linear::linear(c_s, 2 * hc, vb.pp("linear_kv"))?,
            linear_q_points: linear::linear(c_s, hpq, vb.pp("linear_q_points"))?,
            linear_kv_points: linear::linear(c_s, hpkv, vb.pp("linear_kv_points"))?,
            linear_b: linear::linear(c_z, num_heads, vb.pp("linear_b"))?,
            head_weights: vb.get_with_hints(num_heads, "head_weights", Init::Const(HEAD_WEIGHT_INIT))?,
            linear_out: linear::linear(concat_out_dim, c_s, vb.pp("linear_out"))?,
        })
    }

    /// `[B, L, H * P * 3]` projection into global points `[B, L, H * P, 3]`.
    ///
    /// The projection is laid out as all x components, then all y, then all z.
    fn global_points(&self, projected: &Tensor, frames: &Rigid) -> Result<Tensor> {
        let (b, l, width) = projected.dims3()?;
        let local = projected
            .reshape((b, l, 3, width / 3))?
            .transpose(2, 3)?
            .contiguous()?;
        frames.apply(&local)
    }

    /// `s` `[B, L, C_s]`, `z` `[B, L, K, C_z]`, `mask` `[B, L]`, `e_idx` `[B, L, K]`.
    pub fn forward(&self, s: &Tensor, z: &Tensor, frames: &Rigid, mask: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
        let (b, l, _) = s.dims3()?;
        let (h, c) = (self.num_heads, self.c_hidden);
        let (pq, pv) = (self.num_qk_points, self.num_v_points);

        let z = scatter_pair(z, e_idx)?;

        // scalar activations, [B, H, L, C]
        let q = self
            .linear_q
            .forward(s)?
            .reshape((b, l, h, c))?
            .transpose(1, 2)?
            .contiguous()?;
        let kv = self.linear_kv.forward(s)?.reshape((b, l, h, 2 * c))?;
        let k = kv.narrow(D::Minus1, 0, c)?.transpose(1, 2)?.contiguous()?;
        let v = kv.narrow(D::Minus1, c, c)?.transpose(1, 2)?.contiguous()?;

        // point activations in the global frame
        let q_pts = self
            .global_points(&self.linear_q_points.forward(s)?, frames)?
            .reshape((b, l, h, pq * 3))?;
        let kv_pts = self
            .global_points(&self.linear_kv_points.forward(s)?, frames)?
            .reshape((b, l, h, pq + pv, 3))?;
        let k_pts = kv_pts.narrow(3, 0, pq)?.reshape((b, l, h, pq * 3))?;
        let v_pts = kv_pts.narrow(3, pq, pv)?;

        // pair bias, [B, H, L, L]
        let bias = self.linear_b.forward(&z)?.permute((0, 3, 1, 2))?;
        let z = if self.offload_pair {
            z.to_device(&Device::Cpu)?
        } else {
            z
        };

        let a = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * (1.0 / (3.0 * c as f64)).sqrt())?;
        let a = (a + (bias * (1.0f64 / 3.0).sqrt())?)?;

        // squared distances between query and key points, [B, H, L, L]
        let q_pts = q_pts.transpose(1, 2)?.unsqueeze(3)?;
        let k_pts = k_pts.transpose(1, 2)?.unsqueeze(2)?;
        let pt_dist = q_pts.broadcast_sub(&k_pts)?.sqr()?.sum(D::Minus1)?;
        let point_scale = (1.0 / (3.0 * (pq as f64 * 9.0 / 2.0))).sqrt();
        let head_weights = (softplus(&self.head_weights)? * (point_scale * -0.5))?.reshape((1, h, 1, 1))?;
        let pt_att = pt_dist.broadcast_mul(&head_weights)?;

        let square_mask = mask.unsqueeze(D::Minus1)?.broadcast_mul(&mask.unsqueeze(1)?)?;
        let square_mask = ((square_mask - 1.0)? * self.inf)?.unsqueeze(1)?;

        let a = a.add(&pt_att)?.broadcast_add(&square_mask)?;
        let a = softmax_last_dim(&a)?;

        // scalar output, [B, L, H * C]
        let o = a.matmul(&v)?.transpose(1, 2)?.reshape((b, l, h * c))?;

        // point output back in the local frame, [B, L, H * P_v, 3]
        let v_pts = v_pts.transpose(1, 2)?.reshape((b, h, l, pv * 3))?;
        let o_pt = a
            .matmul(&v_pts)?
            .reshape((b, h, l, pv, 3))?
            .transpose(1, 2)?
            .reshape((b, l, h * pv, 3))?;
        let o_pt = frames.invert_apply(&o_pt)?;
        let o_pt_norm = (o_pt.sqr()?.sum(D::Minus1)? + self.eps)?.sqrt()?;

        // pair output, [B, L, H * C_z]
        let z = z.to_device(a.device())?;
        let c_z = z.dim(D::Minus1)?;
        let o_pair = a
            .transpose(1, 2)?
            .contiguous()?
            .matmul(&z)?
            .reshape((b, l, h * c_z))?;

        let o_pt_x = o_pt.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
        let o_pt_y = o_pt.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;
        let o_pt_z = o_pt.narrow(D::Minus1, 2, 1)?.squeeze(D::Minus1)?;
        let out = Tensor::cat(&[&o, &o_pt_x, &o_pt_y, &o_pt_z, &o_pt_norm, &o_pair], D::Minus1)?;
        self.linear_out.forward(&out)
    }
}

/// Three linear layers with ReLU in between and a residual skip.
#[derive(Clone, Debug)]
pub struct StructureModuleTransitionLayer {
    linear_1: Linear,
    linear_2: Linear,
    linear_3: Linear,
}

impl StructureModuleTransitionLayer {
    pub fn new(vb: VarBuilder, c: usize) -> Result<Self> {
        Ok(Self {
            linear_1: linear::linear(c, c, vb.pp("linear_1"))?,
            linear_2: linear::linear(c, c, vb.pp("linear_2"))?,
            linear_3: linear::linear(c, c, vb.pp("linear_3"))?,
        })
    }
}

impl Module for StructureModuleTransitionLayer {
    fn forward(&self, s: &Tensor) -> Result<Tensor> {
        let update = s
            .apply(&self.linear_1)?
            .relu()?
            .apply(&self.linear_2)?
            .relu()?
            .apply(&self.linear_3)?;
        update + s
    }
}

/// One IPA block applied `num_ipa_layers` times with shared weights.
#[derive(Clone, Debug)]
pub struct IpaStack {
    num_layers: usize,
    ipa: InvariantPointAttention,
    dropout: Dropout,
    layer_norm_ipa: LayerNorm,
    transition: StructureModuleTransitionLayer,
}

impl IpaStack {
    pub fn load(vb: VarBuilder, config: &TMPNNConfig) -> Result<Self> {
        let hidden = config.hidden_dim;
        Ok(Self {
            num_layers: config.num_ipa_layers,
            ipa: InvariantPointAttention::new(vb.pp("ipa"), hidden, hidden, &config.ipa, config.offload_pair)?,
            dropout: Dropout::new(config.dropout),
            layer_norm_ipa: layer_norm(hidden, config.layer_norm_eps, vb.pp("layer_norm_ipa"))?,
            transition: StructureModuleTransitionLayer::new(vb.pp("transition"), hidden)?,
        })
    }

    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        frames: &Rigid,
        mask: &Tensor,
        e_idx: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mut h_v = h_v.clone();
        for _ in 0..self.num_layers {
            let update = self.ipa.forward(&h_v, h_e, frames, mask, e_idx)?;
            h_v = self.dropout.forward(&(h_v + update)?, train)?;
            h_v = self.layer_norm_ipa.forward(&h_v)?;
            h_v = self.transition.forward(&h_v)?;
        }
        Ok(h_v)
    }
}
