//! Training objectives and metrics over padded batches.
//!
//! Every reduction is weighted by the residue mask and divided by the number of valid
//! tokens, so padded positions never contribute.
use super::crf::Crf;
use candle_core::{DType, Result, Tensor, D};
use candle_nn::encoding::one_hot;

fn valid_tokens(mask: &Tensor) -> Result<Tensor> {
    mask.sum_all()?.maximum(1f64)
}

fn masked_mean(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    (values * mask)?.sum_all()?.div(&valid_tokens(mask)?)
}

/// Negative log-likelihood of `s` `[B, L]` under `log_probs` `[B, L, V]`.
///
/// Returns the per-token loss `[B, L]` and its masked mean.
pub fn loss_nll(s: &Tensor, log_probs: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let mask = mask.to_dtype(log_probs.dtype())?;
    let idx = s.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?.contiguous()?;
    let loss = log_probs.gather(&idx, D::Minus1)?.squeeze(D::Minus1)?.neg()?;
    let loss_av = masked_mean(&loss, &mask)?;
    Ok((loss, loss_av))
}

/// Label-smoothed negative log-likelihood.
pub fn loss_smoothed(s: &Tensor, log_probs: &Tensor, mask: &Tensor, weight: f64) -> Result<(Tensor, Tensor)> {
    let vocab = log_probs.dim(D::Minus1)?;
    let mask = mask.to_dtype(log_probs.dtype())?;
    let s_onehot = one_hot(s.to_dtype(DType::U32)?, vocab, 1f32, 0f32)?.to_dtype(log_probs.dtype())?;
    let s_onehot = (s_onehot + weight / vocab as f64)?;
    let s_onehot = s_onehot.broadcast_div(&s_onehot.sum_keepdim(D::Minus1)?)?;
    let loss = (s_onehot * log_probs)?.sum(D::Minus1)?.neg()?;
    let loss_av = masked_mean(&loss, &mask)?;
    Ok((loss, loss_av))
}

/// Fraction of valid positions where the most likely residue is the true one.
pub fn sequence_recovery(s: &Tensor, log_probs: &Tensor, mask: &Tensor) -> Result<f32> {
    let predicted = log_probs.argmax(D::Minus1)?;
    agreement(&predicted, s, mask)
}

/// Fraction of valid positions where the decoded label matches.
pub fn label_accuracy(decoded: &Tensor, labels: &Tensor, mask: &Tensor) -> Result<f32> {
    agreement(decoded, labels, mask)
}

fn agreement(a: &Tensor, b: &Tensor, mask: &Tensor) -> Result<f32> {
    let mask = mask.to_dtype(DType::F32)?;
    let hits = a
        .to_dtype(DType::U32)?
        .eq(&b.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?;
    masked_mean(&hits, &mask)?.to_scalar::<f32>()
}

/// All components of one training objective evaluation.
#[derive(Clone, Debug)]
pub struct LossOutput {
    /// `crf_weight * crf + smoothed`, the value to minimise.
    pub total: Tensor,
    pub crf: Tensor,
    pub smoothed: Tensor,
    /// Unsmoothed sequence NLL; `exp` of it is the perplexity.
    pub nll: Tensor,
}

impl LossOutput {
    pub fn perplexity(&self) -> Result<f32> {
        Ok(self.nll.to_dtype(DType::F32)?.to_scalar::<f32>()?.exp())
    }
}

#[derive(Clone, Debug)]
pub struct TMPNNLoss {
    pub crf_weight: f64,
    pub smoothing: f64,
}

impl Default for TMPNNLoss {
    fn default() -> Self {
        Self {
            crf_weight: 0.2,
            smoothing: 0.05,
        }
    }
}

impl TMPNNLoss {
    pub fn compute(
        &self,
        crf: &Crf,
        s: &Tensor,
        log_probs: &Tensor,
        labels: &Tensor,
        label_logits: &Tensor,
        mask: &Tensor,
    ) -> Result<LossOutput> {
        let (_, smoothed) = loss_smoothed(s, log_probs, mask, self.smoothing)?;
        let (_, nll) = loss_nll(s, log_probs, mask)?;
        let crf_loss = crf.neg_log_likelihood(label_logits, labels, mask)?;
        let total = ((&crf_loss * self.crf_weight)? + &smoothed)?;
        tracing::debug!(crf_weight = self.crf_weight, smoothing = self.smoothing, "computed training loss");
        Ok(LossOutput {
            total,
            crf: crf_loss,
            smoothed,
            nll,
        })
    }
}
