//! Linear-chain conditional random field over topology labels.
//!
//! Only positions with `mask > 0` take part in a chain; masked positions are skipped,
//! so holes in the mask behave like the same chain with the holes cut out. A chain
//! with no valid position has log-likelihood 0 and decodes to all zeros.
use super::error::TmpnnError;
use super::utilities::{blend, logsumexp};
use candle_core::{DType, Result, Tensor};
use candle_nn::encoding::one_hot;
use candle_nn::{Init, VarBuilder};

#[derive(Clone, Debug)]
pub struct Crf {
    num_tags: usize,
    start_transitions: Tensor,
    end_transitions: Tensor,
    /// `[from, to]`
    transitions: Tensor,
}

impl Crf {
    pub fn load(vb: VarBuilder, num_tags: usize) -> Result<Self> {
        let init = Init::Uniform { lo: -0.1, up: 0.1 };
        Self::new(
            vb.get_with_hints(num_tags, "start_transitions", init)?,
            vb.get_with_hints(num_tags, "end_transitions", init)?,
            vb.get_with_hints((num_tags, num_tags), "transitions", init)?,
        )
    }

    pub fn new(start_transitions: Tensor, end_transitions: Tensor, transitions: Tensor) -> Result<Self> {
        let num_tags = start_transitions.dim(0)?;
        if end_transitions.dims() != [num_tags] {
            return Err(TmpnnError::shape("end_transitions", format!("[{num_tags}]"), end_transitions.dims()).into());
        }
        if transitions.dims() != [num_tags, num_tags] {
            return Err(TmpnnError::shape("transitions", format!("[{num_tags}, {num_tags}]"), transitions.dims()).into());
        }
        Ok(Self {
            num_tags,
            start_transitions,
            end_transitions,
            transitions,
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn transitions(&self) -> &Tensor {
        &self.transitions
    }

    pub fn start_transitions(&self) -> &Tensor {
        &self.start_transitions
    }

    pub fn end_transitions(&self) -> &Tensor {
        &self.end_transitions
    }

    fn check(&self, emissions: &Tensor, mask: &Tensor) -> Result<(usize, usize)> {
        let (b, l, t) = emissions.dims3()?;
        if t != self.num_tags {
            return Err(TmpnnError::shape("emissions", format!("[B, L, {}]", self.num_tags), emissions.dims()).into());
        }
        if mask.dims() != [b, l] {
            return Err(TmpnnError::shape("mask", format!("[{b}, {l}]"), mask.dims()).into());
        }
        Ok((b, l))
    }

    /// Per-chain log-likelihood of `tags` `[B, L]`, shape `[B]`.
    pub fn log_likelihood(&self, emissions: &Tensor, tags: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, l) = self.check(emissions, mask)?;
        if tags.dims() != [b, l] {
            return Err(TmpnnError::shape("tags", format!("[{b}, {l}]"), tags.dims()).into());
        }
        let dtype = emissions.dtype();
        let mask = mask.to_dtype(dtype)?;
        let tags_onehot = one_hot(tags.to_dtype(DType::U32)?, self.num_tags, 1f32, 0f32)?.to_dtype(dtype)?;
        let start = self.start_transitions.unsqueeze(0)?;
        let end = self.end_transitions.unsqueeze(0)?;

        let mut numerator = Tensor::zeros(b, dtype, emissions.device())?;
        let mut prev = Tensor::zeros((b, self.num_tags), dtype, emissions.device())?;
        let mut alpha = Tensor::zeros((b, self.num_tags), dtype, emissions.device())?;
        // [B, 1], 1.0 once a chain has seen its first valid position
        let mut started = Tensor::zeros((b, 1), dtype, emissions.device())?;

        for t in 0..l {
            let m_t = mask.narrow(1, t, 1)?;
            let emit_t = emissions.narrow(1, t, 1)?.squeeze(1)?;
            let cur = tags_onehot.narrow(1, t, 1)?.squeeze(1)?;

            // gold path score
            let emit_score = (&emit_t * &cur)?.sum_keepdim(1)?;
            let trans_score = (prev.matmul(&self.transitions)? * &cur)?.sum_keepdim(1)?;
            let start_score = cur.broadcast_mul(&start)?.sum_keepdim(1)?;
            let step = (blend(&started, &trans_score, &start_score)? + emit_score)?;
            numerator = (numerator + (step * &m_t)?.squeeze(1)?)?;
            prev = blend(&m_t, &cur, &prev)?;

            // forward algorithm
            let first = emit_t.broadcast_add(&start)?;
            let next = logsumexp(
                &alpha
                    .unsqueeze(2)?
                    .broadcast_add(&self.transitions.unsqueeze(0)?)?
                    .broadcast_add(&emit_t.unsqueeze(1)?)?,
                1,
            )?;
            let candidate = blend(&started, &next, &first)?;
            alpha = blend(&m_t, &candidate, &alpha)?;
            started = started.maximum(&m_t)?;
        }

        let numerator = (numerator + (prev.broadcast_mul(&end)?.sum(1)? * started.squeeze(1)?)?)?;
        let denominator = (logsumexp(&alpha.broadcast_add(&end)?, 1)? * started.squeeze(1)?)?;
        numerator - denominator
    }

    /// Negative log-likelihood summed over chains and divided by the valid token count.
    pub fn neg_log_likelihood(&self, emissions: &Tensor, tags: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let llh = self.log_likelihood(emissions, tags, mask)?;
        let tokens = mask.to_dtype(llh.dtype())?.sum_all()?.maximum(1f64)?;
        llh.sum_all()?.neg()?.div(&tokens)
    }

    /// Best tag path of every chain, over its valid positions only.
    pub fn decode_paths(&self, emissions: &Tensor, mask: &Tensor) -> Result<Vec<Vec<u32>>> {
        self.check(emissions, mask)?;
        let emissions = emissions.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let mask = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let start = self.start_transitions.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let end = self.end_transitions.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let transitions = self.transitions.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        Ok(emissions
            .iter()
            .zip(mask.iter())
            .map(|(emit_b, mask_b)| {
                let steps: Vec<&Vec<f32>> = emit_b
                    .iter()
                    .zip(mask_b.iter())
                    .filter(|(_, m)| **m > 0.0)
                    .map(|(e, _)| e)
                    .collect();
                viterbi(&steps, &start, &end, &transitions)
            })
            .collect())
    }

    /// `[B, L]` u32 best paths written back at the valid positions, 0 elsewhere.
    pub fn decode(&self, emissions: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, l) = self.check(emissions, mask)?;
        let paths = self.decode_paths(emissions, mask)?;
        let mask_host = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut out = vec![0u32; b * l];
        for (row, (path, mask_b)) in paths.iter().zip(mask_host.iter()).enumerate() {
            let positions = mask_b.iter().enumerate().filter(|(_, m)| **m > 0.0).map(|(i, _)| i);
            for (i, tag) in positions.zip(path.iter()) {
                out[row * l + i] = *tag;
            }
        }
        Tensor::from_vec(out, (b, l), emissions.device())
    }
}

fn viterbi(steps: &[&Vec<f32>], start: &[f32], end: &[f32], transitions: &[Vec<f32>]) -> Vec<u32> {
    let Some((first, rest)) = steps.split_first() else {
        return Vec::new();
    };
    let num_tags = start.len();
    let mut score: Vec<f32> = start.iter().zip(first.iter()).map(|(s, e)| s + e).collect();
    let mut history: Vec<Vec<usize>> = Vec::with_capacity(rest.len());

    for emit in rest {
        let mut next = vec![f32::NEG_INFINITY; num_tags];
        let mut back = vec![0usize; num_tags];
        for (to, (next_to, back_to)) in next.iter_mut().zip(back.iter_mut()).enumerate() {
            for (from, score_from) in score.iter().enumerate() {
                let candidate = score_from + transitions[from][to];
                if candidate > *next_to {
                    *next_to = candidate;
                    *back_to = from;
                }
            }
            *next_to += emit[to];
        }
        score = next;
        history.push(back);
    }

    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (tag, (s, e)) in score.iter().zip(end.iter()).enumerate() {
        if s + e > best_score {
            best_score = s + e;
            best = tag;
        }
    }
    let mut path = vec![best as u32];
    for back in history.iter().rev() {
        best = back[best];
        path.push(best as u32);
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn crf(num_tags: usize, device: &Device) -> Result<Crf> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let crf = Crf::load(vb, num_tags)?;
        // spread the transitions so paths are well separated
        Crf::new(
            (crf.start_transitions() * 10.0)?,
            (crf.end_transitions() * 10.0)?,
            (crf.transitions() * 10.0)?,
        )
    }

    fn path_score(crf: &Crf, emissions: &[Vec<f32>], path: &[usize]) -> Result<f32> {
        let start = crf.start_transitions().to_vec1::<f32>()?;
        let end = crf.end_transitions().to_vec1::<f32>()?;
        let trans = crf.transitions().to_vec2::<f32>()?;
        let mut score = start[path[0]] + emissions[0][path[0]];
        for i in 1..path.len() {
            score += trans[path[i - 1]][path[i]] + emissions[i][path[i]];
        }
        Ok(score + end[path[path.len() - 1]])
    }

    fn all_paths(len: usize, num_tags: usize) -> Vec<Vec<usize>> {
        (0..num_tags.pow(len as u32))
            .map(|mut code| {
                (0..len)
                    .map(|_| {
                        let tag = code % num_tags;
                        code /= num_tags;
                        tag
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_likelihood_and_decode_match_brute_force() -> Result<()> {
        let device = Device::Cpu;
        let crf = crf(3, &device)?;
        let emissions = Tensor::randn(0f32, 1., (1, 4, 3), &device)?;
        let tags = Tensor::new(&[[0u32, 2, 1, 1]], &device)?;
        let mask = Tensor::ones((1, 4), DType::F32, &device)?;

        let host = emissions.squeeze(0)?.to_vec2::<f32>()?;
        let scores: Vec<f32> = all_paths(4, 3)
            .iter()
            .map(|p| path_score(&crf, &host, p))
            .collect::<Result<_>>()?;
        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let log_z = max + scores.iter().map(|s| (s - max).exp()).sum::<f32>().ln();
        let expected = path_score(&crf, &host, &[0, 2, 1, 1])? - log_z;

        let llh = crf.log_likelihood(&emissions, &tags, &mask)?.to_vec1::<f32>()?;
        assert!((llh[0] - expected).abs() < 1e-4, "{} vs {expected}", llh[0]);

        let nll = crf.neg_log_likelihood(&emissions, &tags, &mask)?.to_scalar::<f32>()?;
        assert!((nll + expected / 4.0).abs() < 1e-4);

        let best = all_paths(4, 3)
            .into_iter()
            .zip(scores.iter())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(p, _)| p.into_iter().map(|t| t as u32).collect::<Vec<_>>());
        let decoded = crf.decode(&emissions, &mask)?.to_vec2::<u32>()?;
        assert_eq!(Some(decoded[0].clone()), best);
        Ok(())
    }

    #[test]
    fn test_mask_holes_skip_positions() -> Result<()> {
        let device = Device::Cpu;
        let crf = crf(4, &device)?;
        let emissions = Tensor::randn(0f32, 1., (1, 5, 4), &device)?;
        let tags = Tensor::new(&[[1u32, 3, 0, 2, 2]], &device)?;
        let mask = Tensor::new(&[[0f32, 1., 0., 1., 1.]], &device)?;

        let compact_idx = Tensor::new(&[1u32, 3, 4], &device)?;
        let compact_emissions = emissions.index_select(&compact_idx, 1)?;
        let compact_tags = tags.index_select(&compact_idx, 1)?;
        let compact_mask = Tensor::ones((1, 3), DType::F32, &device)?;

        let llh = crf.log_likelihood(&emissions, &tags, &mask)?.to_vec1::<f32>()?;
        let compact = crf
            .log_likelihood(&compact_emissions, &compact_tags, &compact_mask)?
            .to_vec1::<f32>()?;
        assert!((llh[0] - compact[0]).abs() < 1e-4);

        let decoded = crf.decode(&emissions, &mask)?.to_vec2::<u32>()?;
        let compact_decoded = crf.decode(&compact_emissions, &compact_mask)?.to_vec2::<u32>()?;
        assert_eq!(decoded[0][0], 0);
        assert_eq!(decoded[0][2], 0);
        assert_eq!(
            vec![decoded[0][1], decoded[0][3], decoded[0][4]],
            compact_decoded[0]
        );
        Ok(())
    }

    #[test]
    fn test_fully_masked_chain() -> Result<()> {
        let device = Device::Cpu;
        let crf = crf(5, &device)?;
        let emissions = Tensor::randn(0f32, 1., (2, 6, 5), &device)?;
        let tags = Tensor::zeros((2, 6), DType::U32, &device)?;
        let mask = Tensor::new(&[[1f32, 1., 1., 0., 0., 0.], [0., 0., 0., 0., 0., 0.]], &device)?;

        let llh = crf.log_likelihood(&emissions, &tags, &mask)?.to_vec1::<f32>()?;
        assert_eq!(llh[1], 0.0);
        assert!(llh[0] < 0.0);

        let decoded = crf.decode(&emissions, &mask)?;
        assert_eq!(decoded.dims(), &[2, 6]);
        assert_eq!(decoded.to_vec2::<u32>()?[1], vec![0; 6]);
        assert!(crf.decode_paths(&emissions, &mask)?[1].is_empty());

        let nothing = mask.zeros_like()?;
        let nll = crf.neg_log_likelihood(&emissions, &tags, &nothing)?.to_scalar::<f32>()?;
        assert_eq!(nll, 0.0);
        Ok(())
    }

    #[test]
    fn test_shape_checks() -> Result<()> {
        let device = Device::Cpu;
        let crf = crf(5, &device)?;
        let emissions = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        let mask = Tensor::ones((1, 3), DType::F32, &device)?;
        assert!(crf.decode(&emissions, &mask).is_err());
        Ok(())
    }
}
