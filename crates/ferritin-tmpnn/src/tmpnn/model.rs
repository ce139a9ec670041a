//! TMPNN: structure-conditioned sequence design with a topology-label head.
//!
//! coordinates -> [`ProteinFeaturesModel`] -> graph encoder -> invariant point attention
//! -> (label head, autoregressive decoder).
//!
//! Sequence information enters in three places: the partially masked sequence is merged
//! into the initial node embedding, the true (or sampled) sequence feeds the label head
//! and the decoder's backward view.
use super::configs::{SampleConfig, TMPNNConfig};
use super::crf::Crf;
use super::decoder::Decoder;
use super::encoder::EncLayer;
use super::error::TmpnnError;
use super::featurizer::ProteinBatch;
use super::ipa::IpaStack;
use super::proteinfeatures::ProteinFeaturesModel;
use super::rigid::Rigid;
use super::utilities::{MASK_TOKEN, NUM_AMINO_ACIDS, PAD_TOKEN};
use crate::ExecutionContext;
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::{embedding, layer_norm, linear, Embedding, Init, LayerNorm, Linear, VarBuilder};
use candle_transformers::generation::LogitsProcessor;

/// Outputs of the parallel pass over the true sequence.
#[derive(Clone, Debug)]
pub struct TMPNNOutput {
    /// `[B, L, vocab]`
    pub log_probs: Tensor,
    /// `[B, L, num_tags]`
    pub label_logits: Tensor,
    /// `[B, L]` effective mask; losses and metrics should use this one.
    pub mask: Tensor,
}

#[derive(Clone, Debug)]
pub struct SampleOutput {
    /// `[B, L]` u32; padded positions hold [`PAD_TOKEN`].
    pub s: Tensor,
    /// `[B, L, vocab]` untempered log-probabilities at each decoding step.
    pub log_probs: Tensor,
    /// `[B, L, num_tags]` label logits given the sampled sequence.
    pub label_logits: Tensor,
    /// `[B, L]` effective mask after the degenerate-frame policy.
    pub mask: Tensor,
}

/// Structure embeddings shared by the label head and the decoder.
#[derive(Clone, Debug)]
pub struct EncodedStructure {
    /// `[B, L, H]` after the invariant point attention stack.
    pub h_v: Tensor,
    /// `[B, L, H]` graph encoder output.
    pub h_v_encoder: Tensor,
    /// `[B, L, K, H]`
    pub h_e: Tensor,
    pub e_idx: Tensor,
    pub frames: Rigid,
    /// `[B, L]` residue mask after the degenerate-frame policy.
    pub mask: Tensor,
    pub mask_attend: Tensor,
}

/// Output projection tied to the sequence embedding matrix.
#[derive(Clone, Debug)]
pub struct RobertaLMHead {
    dense: Linear,
    layer_norm: LayerNorm,
    weight: Tensor,
    bias: Tensor,
}

impl RobertaLMHead {
    pub fn load(vb: VarBuilder, embed_dim: usize, output_dim: usize, weight: Tensor, eps: f64) -> Result<Self> {
        Ok(Self {
            dense: linear::linear(embed_dim, embed_dim, vb.pp("dense"))?,
            layer_norm: layer_norm(embed_dim, eps, vb.pp("layer_norm"))?,
            weight,
            bias: vb.get_with_hints(output_dim, "bias", Init::Const(0.))?,
        })
    }
}

impl Module for RobertaLMHead {
    fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let x = self.dense.forward(features)?.gelu_erf()?;
        let x = self.layer_norm.forward(&x)?;
        x.broadcast_matmul(&self.weight.t()?)?.broadcast_add(&self.bias)
    }
}

pub struct TMPNN {
    config: TMPNNConfig,
    device: Device,
    dtype: DType,
    features: ProteinFeaturesModel,
    w_v: Linear,
    w_e: Linear,
    w_seq: Embedding,
    merge_seq_1: Linear,
    merge_seq_2: Linear,
    encoder_layers: Vec<EncLayer>,
    ipa: IpaStack,
    w_cv: Linear,
    layer_norm_cctop1: LayerNorm,
    w_out_cctop: Linear,
    decoder: Decoder,
    w_out_seq: RobertaLMHead,
    crf: Crf,
}

impl TMPNN {
    pub fn load(vb: VarBuilder, config: &TMPNNConfig, ctx: &ExecutionContext) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_dim;
        let eps = config.layer_norm_eps;

        let features = ProteinFeaturesModel::load(vb.pp("features"), config)?;
        let w_v = linear::linear(config.node_features, hidden, vb.pp("W_v"))?;
        let w_e = linear::linear(config.edge_features, hidden, vb.pp("W_e"))?;
        let w_seq = embedding(config.vocab, hidden, vb.pp("W_seq"))?;
        let merge_seq_1 = linear::linear(hidden, hidden, vb.pp("merge_seq_1"))?;
        let merge_seq_2 = linear::linear(hidden, hidden, vb.pp("merge_seq_2"))?;

        let mut encoder_layers = Vec::with_capacity(config.num_encoder_layers);
        for i in 0..config.num_encoder_layers {
            encoder_layers.push(EncLayer::load(vb.pp("encoder_layers"), config, i)?);
        }
        let ipa = IpaStack::load(vb.pp("ipa_stack"), config)?;

        let w_cv = linear::linear(hidden, hidden, vb.pp("W_cv"))?;
        let layer_norm_cctop1 = layer_norm(hidden, eps, vb.pp("layer_norm_cctop1"))?;
        let w_out_cctop = linear::linear_no_bias(hidden, config.num_tags, vb.pp("W_out_cctop"))?;

        let decoder = Decoder::load(vb.pp("decoder_layers"), config)?;
        let w_out_seq = RobertaLMHead::load(
            vb.pp("W_out_seq"),
            hidden,
            config.vocab,
            w_seq.embeddings().clone(),
            eps,
        )?;
        let crf = Crf::load(vb.pp("crf"), config.num_tags)?;

        tracing::debug!(
            hidden,
            encoder_layers = config.num_encoder_layers,
            decoder_layers = config.num_decoder_layers,
            ipa_layers = config.num_ipa_layers,
            "loaded TMPNN"
        );
        Ok(Self {
            config: config.clone(),
            device: ctx.device.clone(),
            dtype: ctx.dtype,
            features,
            w_v,
            w_e,
            w_seq,
            merge_seq_1,
            merge_seq_2,
            encoder_layers,
            ipa,
            w_cv,
            layer_norm_cctop1,
            w_out_cctop,
            decoder,
            w_out_seq,
            crf,
        })
    }

    pub fn config(&self) -> &TMPNNConfig {
        &self.config
    }

    pub fn crf(&self) -> &Crf {
        &self.crf
    }

    /// Sequence embedding with the padding token mapped to zeros.
    pub fn embed_sequence(&self, s: &Tensor) -> Result<Tensor> {
        let s = s.to_dtype(DType::U32)?;
        let not_pad = s.ne(PAD_TOKEN)?.to_dtype(self.dtype)?.unsqueeze(D::Minus1)?;
        self.w_seq.forward(&s)?.broadcast_mul(&not_pad)
    }

    pub fn encode(&self, batch: &ProteinBatch, train: bool) -> Result<EncodedStructure> {
        batch.validate()?;
        let batch = batch.to_device(&self.device)?;
        let (b, l) = batch.dims()?;

        let feats = self.features.forward(&batch.x, &batch.mask.to_dtype(self.dtype)?, train)?;
        let mask = feats.mask;
        let mask_attend = feats.mask_attend;
        let mut h_v = self.w_v.forward(&feats.v)?;
        let mut h_e = self.w_e.forward(&feats.e)?;

        let s_mask = match &batch.s_mask {
            Some(s_mask) => s_mask.clone(),
            None => Tensor::full(MASK_TOKEN, (b, l), &self.device)?,
        };
        let h_s_mask = self.embed_sequence(&s_mask)?;
        let merged = self
            .merge_seq_1
            .forward(&(&h_v + h_s_mask)?)?
            .gelu_erf()?
            .apply(&self.merge_seq_2)?;
        h_v = (h_v + merged)?;

        for layer in &self.encoder_layers {
            let (new_h_v, new_h_e) = layer.forward(
                &h_v,
                &h_e,
                &feats.e_idx,
                Some(&mask),
                Some(&mask_attend),
                train,
            )?;
            h_v = new_h_v;
            h_e = new_h_e;
        }
        let h_v_encoder = h_v;
        let h_v = self
            .ipa
            .forward(&h_v_encoder, &h_e, &feats.frames, &mask, &feats.e_idx, train)?;
        tracing::debug!(batch = b, length = l, neighbors = feats.e_idx.dim(2)?, "encoded structure");

        Ok(EncodedStructure {
            h_v,
            h_v_encoder,
            h_e,
            e_idx: feats.e_idx,
            frames: feats.frames,
            mask,
            mask_attend,
        })
    }

    /// Per-residue topology logits from structure and sequence embeddings.
    fn label_logits(&self, encoded: &EncodedStructure, h_s: &Tensor) -> Result<Tensor> {
        let h = (&encoded.h_v_encoder + &encoded.h_v)?.add(h_s)?.gelu_erf()?;
        let h = self.layer_norm_cctop1.forward(&(self.w_cv.forward(&h)? + &h)?)?;
        self.w_out_cctop.forward(&h)
    }

    /// Parallel pass conditioned on the true sequence `batch.s`.
    pub fn forward(&self, batch: &ProteinBatch, train: bool) -> Result<TMPNNOutput> {
        let encoded = self.encode(batch, train)?;
        let h_s = self.embed_sequence(&batch.s.to_device(&self.device)?)?;
        let label_logits = self.label_logits(&encoded, &h_s)?;

        let h_v = self.decoder.forward(
            &encoded.h_v,
            &encoded.h_e,
            &h_s,
            &encoded.e_idx,
            &encoded.mask,
            &encoded.mask_attend,
            train,
        )?;
        let logits = self.w_out_seq.forward(&h_v)?;
        let log_probs = log_softmax(&logits, D::Minus1)?;
        Ok(TMPNNOutput {
            log_probs,
            label_logits,
            mask: encoded.mask,
        })
    }

    /// Sequential decoding from position 0 to L - 1.
    ///
    /// Only the 20 standard amino acids are drawn; padded positions get [`PAD_TOKEN`].
    pub fn sample(&self, batch: &ProteinBatch, config: &SampleConfig) -> Result<SampleOutput> {
        if !config.temperature.is_finite() || config.temperature < 0.0 {
            return Err(TmpnnError::config(format!("temperature {} must be >= 0", config.temperature)).into());
        }
        let encoded = self.encode(batch, false)?;
        let (b, l) = encoded.mask.dims2()?;
        let seed = config.seed.unwrap_or_else(rand::random);
        tracing::info!(batch = b, length = l, temperature = config.temperature, seed, "sampling sequences");

        let mut processor = LogitsProcessor::new(seed, Some(config.temperature), None);
        let mask_host = encoded.mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut state = self
            .decoder
            .init_state(&encoded.h_v, &encoded.h_e, &encoded.e_idx, &encoded.mask)?;
        let all_log_probs = Tensor::zeros((b, l, self.config.vocab), self.dtype, &self.device)?;
        let mut s_host = vec![PAD_TOKEN; b * l];

        for t in 0..l {
            let h_v_t = self.decoder.step(
                &mut state,
                t,
                &encoded.h_e,
                &encoded.e_idx,
                &encoded.mask,
                &encoded.mask_attend,
            )?;
            let logits = self.w_out_seq.forward(&h_v_t)?;
            let log_probs = log_softmax(&logits, D::Minus1)?;
            all_log_probs.slice_set(&log_probs.unsqueeze(1)?.contiguous()?, 1, t)?;

            let mut s_t = vec![PAD_TOKEN; b];
            for (row, token) in s_t.iter_mut().enumerate() {
                if mask_host[row][t] > 0.0 {
                    *token = processor.sample(&logits.get(row)?.narrow(0, 0, NUM_AMINO_ACIDS)?)?;
                    s_host[row * l + t] = *token;
                }
            }
            let s_t = Tensor::from_vec(s_t, b, &self.device)?;
            state.set_token_embedding(t, &self.embed_sequence(&s_t)?)?;
            tracing::trace!(position = t, "decoded position");
        }

        let s = Tensor::from_vec(s_host, (b, l), &self.device)?;
        let label_logits = self.label_logits(&encoded, state.h_s())?;
        Ok(SampleOutput {
            s,
            log_probs: all_log_probs,
            label_logits,
            mask: encoded.mask,
        })
    }

    /// Token-mean negative CRF log-likelihood of `tags` given label `emission`s.
    pub fn neg_loss_crf(&self, emission: &Tensor, tags: &Tensor, mask: &Tensor) -> Result<Tensor> {
        self.crf.neg_log_likelihood(emission, tags, mask)
    }

    /// `[B, L]` best label paths; positions outside the mask are 0.
    pub fn decode_crf(&self, emission: &Tensor, mask: &Tensor) -> Result<Tensor> {
        self.crf.decode(emission, mask)
    }
}
