//! Autoregressive sequence decoder.
//!
//! Residue `i` sees the amino acid of neighbor `j` only when `j < i` (the "backward"
//! view); every other neighbor contributes its encoder embedding with a zeroed amino-acid
//! slot (the "forward" view). The parallel pass and the step-by-step pass share the
//! same layers and produce the same hidden states.
use super::configs::TMPNNConfig;
use super::encoder::{NeighborAttention, PositionWiseFeedForward};
use super::utilities::cat_neighbors_nodes;
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{layer_norm, Dropout, LayerNorm, VarBuilder};

#[derive(Clone, Debug)]
pub struct DecLayer {
    dropout: Dropout,
    norm1: LayerNorm,
    norm2: LayerNorm,
    attention: NeighborAttention,
    dense: PositionWiseFeedForward,
}

impl DecLayer {
    pub fn load(vb: VarBuilder, config: &TMPNNConfig, layer: usize) -> Result<Self> {
        let vb = vb.pp(layer);
        let num_hidden = config.hidden_dim;
        let num_in = num_hidden * 3;
        Ok(Self {
            dropout: Dropout::new(config.dropout),
            norm1: layer_norm(num_hidden, config.layer_norm_eps, vb.pp("norm1"))?,
            norm2: layer_norm(num_hidden, config.layer_norm_eps, vb.pp("norm2"))?,
            attention: NeighborAttention::new(vb.pp("attention"), num_hidden, num_in, config.num_heads)?,
            dense: PositionWiseFeedForward::new(vb.pp("dense"), num_hidden, num_hidden * 4)?,
        })
    }

    /// `h_v` `[B, M, H]`, `h_e` `[B, M, K, 3H]`; any `M`, including a single position.
    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        mask_v: Option<&Tensor>,
        mask_attend: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let dh = self.attention.forward(h_v, h_e, mask_attend)?;
        let h_v = self.norm1.forward(&(h_v + self.dropout.forward(&dh, train)?)?)?;

        let dh = self.dense.forward(&h_v)?;
        let h_v = self.norm2.forward(&(&h_v + self.dropout.forward(&dh, train)?)?)?;
        match mask_v {
            Some(mask) => h_v.broadcast_mul(&mask.unsqueeze(D::Minus1)?),
            None => Ok(h_v),
        }
    }
}

/// `[B, L, K]` float, 1.0 where the neighbor precedes the residue.
pub fn autoregressive_mask(e_idx: &Tensor) -> Result<Tensor> {
    let l = e_idx.dim(1)?;
    let ii = Tensor::arange(0u32, l as u32, e_idx.device())?
        .to_dtype(DType::F32)?
        .reshape((1, l, 1))?;
    e_idx
        .to_dtype(DType::F32)?
        .broadcast_sub(&ii)?
        .lt(0f64)?
        .to_dtype(DType::F32)
}

/// Backward/forward split of every edge, `[B, L, K, 1]` each.
#[derive(Clone, Debug)]
pub struct DirectionMasks {
    pub backward: Tensor,
    pub forward: Tensor,
}

impl DirectionMasks {
    pub fn new(e_idx: &Tensor, mask: &Tensor) -> Result<Self> {
        let (b, l) = mask.dims2()?;
        let ar = autoregressive_mask(e_idx)?.to_dtype(mask.dtype())?.unsqueeze(D::Minus1)?;
        let mask_1d = mask.reshape((b, l, 1, 1))?;
        Ok(Self {
            backward: ar.broadcast_mul(&mask_1d)?,
            forward: (ar.ones_like()? - &ar)?.broadcast_mul(&mask_1d)?,
        })
    }
}

/// Neighbor view with the amino-acid slot left empty, restricted to forward edges.
fn encoder_forward_view(h_v: &Tensor, h_e: &Tensor, e_idx: &Tensor, masks: &DirectionMasks) -> Result<Tensor> {
    let h_es_encoder = cat_neighbors_nodes(&h_v.zeros_like()?, h_e, e_idx)?;
    let h_esv_encoder = cat_neighbors_nodes(h_v, &h_es_encoder, e_idx)?;
    h_esv_encoder.broadcast_mul(&masks.forward)
}

#[derive(Clone, Debug)]
pub struct Decoder {
    layers: Vec<DecLayer>,
}

impl Decoder {
    pub fn load(vb: VarBuilder, config: &TMPNNConfig) -> Result<Self> {
        let layers = (0..config.num_decoder_layers)
            .map(|i| DecLayer::load(vb.clone(), config, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Parallel pass; `h_s` holds the embedded true sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        h_s: &Tensor,
        e_idx: &Tensor,
        mask: &Tensor,
        mask_attend: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let masks = DirectionMasks::new(e_idx, mask)?;
        let h_es = cat_neighbors_nodes(h_s, h_e, e_idx)?;
        let h_esv_encoder_fw = encoder_forward_view(h_v, h_e, e_idx, &masks)?;

        let mut h_v = h_v.clone();
        for layer in &self.layers {
            let h_esv = cat_neighbors_nodes(&h_v, &h_es, e_idx)?
                .broadcast_mul(&masks.backward)?
                .add(&h_esv_encoder_fw)?;
            h_v = layer.forward(&h_v, &h_esv, Some(mask), Some(mask_attend), train)?;
        }
        Ok(h_v)
    }

    pub fn init_state(&self, h_v: &Tensor, h_e: &Tensor, e_idx: &Tensor, mask: &Tensor) -> Result<DecoderState> {
        let masks = DirectionMasks::new(e_idx, mask)?;
        let h_esv_encoder_fw = encoder_forward_view(h_v, h_e, e_idx, &masks)?;
        let mut h_v_stack = Vec::with_capacity(self.layers.len() + 1);
        h_v_stack.push(h_v.clone());
        for _ in 0..self.layers.len() {
            h_v_stack.push(Tensor::zeros(h_v.shape(), h_v.dtype(), h_v.device())?);
        }
        Ok(DecoderState {
            h_v_stack,
            h_s: Tensor::zeros(h_v.shape(), h_v.dtype(), h_v.device())?,
            h_esv_encoder_fw,
            mask_bw: masks.backward,
            position: 0,
        })
    }

    /// Recomputes position `t` in every layer; returns the last layer's `[B, H]` slice.
    ///
    /// Positions must be visited in increasing order, with the sampled token of every
    /// earlier position already written through [`DecoderState::set_token_embedding`].
    pub fn step(
        &self,
        state: &mut DecoderState,
        t: usize,
        h_e: &Tensor,
        e_idx: &Tensor,
        mask: &Tensor,
        mask_attend: &Tensor,
    ) -> Result<Tensor> {
        let e_idx_t = e_idx.narrow(1, t, 1)?.contiguous()?;
        let h_e_t = h_e.narrow(1, t, 1)?;
        let mask_t = mask.narrow(1, t, 1)?;
        let mask_attend_t = mask_attend.narrow(1, t, 1)?;
        let mask_bw_t = state.mask_bw.narrow(1, t, 1)?;
        let h_esv_encoder_t = state.h_esv_encoder_fw.narrow(1, t, 1)?;

        let h_es_t = cat_neighbors_nodes(&state.h_s, &h_e_t, &e_idx_t)?;
        for (l, layer) in self.layers.iter().enumerate() {
            let h_esv_decoder_t = cat_neighbors_nodes(&state.h_v_stack[l], &h_es_t, &e_idx_t)?;
            let h_v_t = state.h_v_stack[l].narrow(1, t, 1)?;
            let h_esv_t = h_esv_decoder_t.broadcast_mul(&mask_bw_t)?.add(&h_esv_encoder_t)?;
            let h_v_next = layer.forward(&h_v_t, &h_esv_t, Some(&mask_t), Some(&mask_attend_t), false)?;
            state.h_v_stack[l + 1].slice_set(&h_v_next.contiguous()?, 1, t)?;
        }
        state.position = t + 1;
        state.last_layer().narrow(1, t, 1)?.squeeze(1)
    }
}

/// Per-call buffers for sequential decoding.
///
/// `h_v_stack[0]` is the encoder output, `h_v_stack[l + 1]` the output of decoder
/// layer `l`, each `[B, L, H]` and filled one position per step.
#[derive(Debug)]
pub struct DecoderState {
    h_v_stack: Vec<Tensor>,
    h_s: Tensor,
    h_esv_encoder_fw: Tensor,
    mask_bw: Tensor,
    position: usize,
}

impl DecoderState {
    /// Writes the `[B, H]` embedding of the token chosen at position `t`.
    pub fn set_token_embedding(&mut self, t: usize, h_s_t: &Tensor) -> Result<()> {
        self.h_s.slice_set(&h_s_t.unsqueeze(1)?.contiguous()?, 1, t)
    }

    pub fn last_layer(&self) -> &Tensor {
        // the stack always holds the encoder output
        &self.h_v_stack[self.h_v_stack.len() - 1]
    }

    pub fn h_s(&self) -> &Tensor {
        &self.h_s
    }

    /// Number of positions decoded so far.
    pub fn position(&self) -> usize {
        self.position
    }
}
