use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;

/// Standard amino acids in token order.
pub const ALPHABET: &str = "ACDEFGHIKLMNPQRSTVWY";
pub const NUM_AMINO_ACIDS: usize = 20;
pub const MASK_TOKEN: u32 = 20;
pub const PAD_TOKEN: u32 = 21;

#[rustfmt::skip]
pub fn aa1to_int(aa: char) -> u32 {
    match aa {
        'A' => 0, 'C' => 1, 'D' => 2,
        'E' => 3, 'F' => 4, 'G' => 5,
        'H' => 6, 'I' => 7, 'K' => 8,
        'L' => 9, 'M' => 10, 'N' => 11,
        'P' => 12, 'Q' => 13, 'R' => 14,
        'S' => 15, 'T' => 16, 'V' => 17,
        'W' => 18, 'Y' => 19, '-' => PAD_TOKEN,
        _   => MASK_TOKEN,
    }
}

pub fn int_to_aa1(token: u32) -> char {
    match token {
        t if (t as usize) < NUM_AMINO_ACIDS => ALPHABET.as_bytes()[t as usize] as char,
        MASK_TOKEN => 'X',
        _ => '-',
    }
}

pub fn encode_sequence(seq: &str) -> Vec<u32> {
    seq.chars().map(aa1to_int).collect()
}

pub fn decode_sequence(tokens: &[u32]) -> String {
    tokens.iter().copied().map(int_to_aa1).collect()
}

/// Gather_edges
/// Features [B,N,N,C] at Neighbor indices [B,N,K] => Neighbor features [B,N,K,C]
pub fn gather_edges(edges: &Tensor, neighbor_idx: &Tensor) -> Result<Tensor> {
    let (d1, d2, d3) = neighbor_idx.dims3()?;
    let neighbors = neighbor_idx
        .unsqueeze(D::Minus1)?
        .expand((d1, d2, d3, edges.dim(D::Minus1)?))?
        .contiguous()?;
    edges.contiguous()?.gather(&neighbors, 2)
}

/// Gather Nodes
///
/// Features [B,N,C] at Neighbor indices [B,M,K] => [B,M,K,C]
/// Flatten and expand indices per batch [B,M,K] => [B,MK] => [B,MK,C]
pub fn gather_nodes(nodes: &Tensor, neighbor_idx: &Tensor) -> Result<Tensor> {
    let (batch_size, _, n_features) = nodes.dims3()?;
    let (_, n_rows, k_neighbors) = neighbor_idx.dims3()?;

    let neighbors_flat = neighbor_idx
        .reshape((batch_size, n_rows * k_neighbors))?
        .unsqueeze(2)?
        .expand((batch_size, n_rows * k_neighbors, n_features))?
        .contiguous()?;
    let neighbor_features = nodes.contiguous()?.gather(&neighbors_flat, 1)?;
    neighbor_features.reshape((batch_size, n_rows, k_neighbors, n_features))
}

/// [h_neighbors, h_nodes gathered at neighbors] along the channel axis.
pub fn cat_neighbors_nodes(
    h_nodes: &Tensor,
    h_neighbors: &Tensor,
    e_idx: &Tensor,
) -> Result<Tensor> {
    let h_nodes_gathered = gather_nodes(h_nodes, e_idx)?;
    Tensor::cat(&[h_neighbors, &h_nodes_gathered], D::Minus1)
}

/// Retrieve the K nearest neighbors of every residue from CA coordinates.
///
/// Masked columns sort after every valid one and ties go to the lower residue index,
/// so the ordering is fully determined by the coordinates and the mask. Returns the
/// neighbor distances `[B, L, K]` and indices `[B, L, K]` (u32), with `K = min(k, L)`.
pub fn compute_nearest_neighbors(
    coords: &Tensor,
    mask: &Tensor,
    k: usize,
    eps: f64,
) -> Result<(Tensor, Tensor)> {
    let (batch_size, seq_len, _) = coords.dims3()?;
    let k = k.min(seq_len);

    let distances = (coords
        .unsqueeze(2)?
        .broadcast_sub(&coords.unsqueeze(1)?)?
        .sqr()?
        .sum(D::Minus1)?
        + eps)?
        .sqrt()?;

    let host_d = distances.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    let host_m = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;

    let mut indices = Vec::with_capacity(batch_size * seq_len * k);
    let mut row: Vec<(f32, usize)> = Vec::with_capacity(seq_len);
    for (d_b, m_b) in host_d.iter().zip(host_m.iter()) {
        for d_i in d_b.iter() {
            row.clear();
            row.extend(d_i.iter().zip(m_b.iter()).enumerate().map(|(j, (d, m))| {
                let d = if *m > 0.5 { *d } else { f32::INFINITY };
                (d, j)
            }));
            row.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            indices.extend(row.iter().take(k).map(|(_, j)| *j as u32));
        }
    }
    let e_idx = Tensor::from_vec(indices, (batch_size, seq_len, k), coords.device())?;
    let d_neighbors = gather_edges(&distances.unsqueeze(D::Minus1)?, &e_idx)?.squeeze(D::Minus1)?;
    Ok((d_neighbors, e_idx))
}

/// Softmax over the last axis in which masked logits get exactly zero weight.
///
/// Masked logits are replaced by `f32::MIN` (finite, so fully masked rows stay NaN free)
/// and the probabilities are multiplied by the mask afterwards.
pub fn masked_softmax(logits: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(logits.dtype())?.broadcast_as(logits.shape())?;
    let floor = Tensor::full(f32::MIN, logits.shape(), logits.device())?.to_dtype(logits.dtype())?;
    let logits = mask.gt(0f64)?.where_cond(logits, &floor)?;
    softmax_last_dim(&logits)? * mask
}

/// log(1 + exp(x)) without overflow for large x.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    xs.relu()? + tail
}

pub fn logsumexp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let shifted = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    (shifted + max)?.squeeze(dim)
}

/// `on * mask + off * (1 - mask)` with a float mask broadcast over trailing axes.
pub fn blend(mask: &Tensor, on: &Tensor, off: &Tensor) -> Result<Tensor> {
    let inverse = (mask.ones_like()? - mask)?;
    on.broadcast_mul(mask)?.add(&off.broadcast_mul(&inverse)?)
}

/// Custom Cross-Product Fn.
pub fn cross_product(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let last_dim = a.dims().len() - 1;

    let a0 = a.narrow(last_dim, 0, 1)?;
    let a1 = a.narrow(last_dim, 1, 1)?;
    let a2 = a.narrow(last_dim, 2, 1)?;

    let b0 = b.narrow(last_dim, 0, 1)?;
    let b1 = b.narrow(last_dim, 1, 1)?;
    let b2 = b.narrow(last_dim, 2, 1)?;

    let c0 = ((&a1 * &b2)? - (&a2 * &b1)?)?;
    let c1 = ((&a2 * &b0)? - (&a0 * &b2)?)?;
    let c2 = ((&a0 * &b1)? - (&a1 * &b0)?)?;

    Tensor::cat(&[&c0, &c1, &c2], last_dim)
}

/// Row-wise dot product over the last axis, keeping it as size 1.
pub fn dot_keepdim(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    (a * b)?.sum_keepdim(D::Minus1)
}

/// Unit vectors along the last axis; zero vectors stay (numerically) zero.
pub fn normalize(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(eps)?;
    xs.broadcast_div(&norm)
}

pub fn linspace(start: f64, stop: f64, steps: usize, device: &Device) -> Result<Tensor> {
    if steps == 0 {
        Tensor::from_vec(Vec::<f64>::new(), steps, device)
    } else if steps == 1 {
        Tensor::from_vec(vec![start], steps, device)
    } else {
        let delta = (stop - start) / (steps - 1) as f64;
        let vs = (0..steps)
            .map(|step| start + step as f64 * delta)
            .collect::<Vec<_>>();
        Tensor::from_vec(vs, steps, device)
    }
}
