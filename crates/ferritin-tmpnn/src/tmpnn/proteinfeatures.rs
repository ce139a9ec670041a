//! Geometric featurization of backbone coordinates.
//!
//! Produces node features (backbone dihedrals), edge features for the K nearest
//! neighbors (relative position + RBF-encoded inter-atomic distances), the neighbor
//! index and one rigid frame per residue.
use super::configs::{DegenerateFramePolicy, TMPNNConfig};
use super::error::TmpnnError;
use super::rigid::Rigid;
use super::utilities::{
    blend, compute_nearest_neighbors, cross_product, dot_keepdim, gather_nodes, linspace,
    normalize,
};
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::encoding::one_hot;
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

const D_MIN: f64 = 2.0;
const D_MAX: f64 = 22.0;
const NUM_DIHEDRAL_FEATURES: usize = 6;

/// Everything the encoder needs, derived fresh from coordinates on each call.
#[derive(Clone, Debug)]
pub struct FeatureOutput {
    /// `[B, L, node_features]`
    pub v: Tensor,
    /// `[B, L, K, edge_features]`
    pub e: Tensor,
    /// `[B, L, K]` neighbor indices sorted by distance (u32).
    pub e_idx: Tensor,
    pub frames: Rigid,
    /// `[B, L]` residue mask after the degenerate-frame policy was applied.
    pub mask: Tensor,
    /// `[B, L, K]` 1.0 where both the residue and its neighbor are valid.
    pub mask_attend: Tensor,
}

#[derive(Clone, Debug)]
pub struct PositionalEncodings {
    max_relative_feature: usize,
    linear: Linear,
}

impl PositionalEncodings {
    pub fn new(num_embeddings: usize, max_relative_feature: usize, vb: VarBuilder) -> Result<Self> {
        let linear = linear(
            2 * max_relative_feature + 2,
            num_embeddings,
            vb.pp("linear"),
        )?;
        Ok(Self {
            max_relative_feature,
            linear,
        })
    }

    /// `offset` and `mask` are float `[B, L, K]`; masked pairs use the extra class.
    pub fn forward(&self, offset: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let max_rel = self.max_relative_feature as f64;
        let d = (offset + max_rel)?.clamp(0f64, 2.0 * max_rel)?;
        let other = d.ones_like()?.affine(2.0 * max_rel + 1.0, 0.0)?;
        let d = blend(mask, &d, &other)?.to_dtype(DType::U32)?;

        let depth = 2 * self.max_relative_feature + 2;
        let d_onehot = one_hot(d, depth, 1f32, 0f32)?.to_dtype(self.linear.weight().dtype())?;
        self.linear.forward(&d_onehot)
    }
}

#[derive(Clone, Debug)]
pub struct ProteinFeaturesModel {
    top_k: usize,
    num_rbf: usize,
    noise_2d: f64,
    noise_3d: f64,
    policy: DegenerateFramePolicy,
    embeddings: PositionalEncodings,
    edge_embedding: Linear,
    norm_edges: LayerNorm,
    node_embedding: Linear,
    norm_nodes: LayerNorm,
}

impl ProteinFeaturesModel {
    pub fn load(vb: VarBuilder, config: &TMPNNConfig) -> Result<Self> {
        let num_rbf = config.num_rbf;
        let edge_in = config.num_positional_embeddings + num_rbf * 25;
        let embeddings = PositionalEncodings::new(
            config.num_positional_embeddings,
            config.max_relative_feature,
            vb.pp("embeddings"),
        )?;
        let edge_embedding =
            linear::linear_no_bias(edge_in, config.edge_features, vb.pp("edge_embedding"))?;
        let norm_edges = layer_norm(config.edge_features, config.layer_norm_eps, vb.pp("norm_edges"))?;
        let node_embedding = linear::linear(
            NUM_DIHEDRAL_FEATURES,
            config.node_features,
            vb.pp("node_embedding"),
        )?;
        let norm_nodes = layer_norm(config.node_features, config.layer_norm_eps, vb.pp("norm_nodes"))?;

        Ok(Self {
            top_k: config.k_neighbors,
            num_rbf,
            noise_2d: config.noise_2d,
            noise_3d: config.noise_3d,
            policy: config.degenerate_frames,
            embeddings,
            edge_embedding,
            norm_edges,
            node_embedding,
            norm_nodes,
        })
    }

    /// Gaussian radial basis over `D_MIN..D_MAX` Angstrom; `[..] -> [.., num_rbf]`.
    fn rbf(&self, d: &Tensor, train: bool) -> Result<Tensor> {
        let d = if train && self.noise_2d > 0.0 {
            (d + d.randn_like(0.0, self.noise_2d)?)?
        } else {
            d.clone()
        };
        let d_mu = linspace(D_MIN, D_MAX, self.num_rbf, d.device())?.to_dtype(d.dtype())?;
        let d_sigma = (D_MAX - D_MIN) / self.num_rbf as f64;
        let diff = (d.unsqueeze(D::Minus1)?.broadcast_sub(&d_mu)? / d_sigma)?;
        diff.sqr()?.neg()?.exp()
    }

    /// RBF of the distance between atom `a` of each residue and atom `b` of its neighbors.
    fn get_rbf(&self, a: &Tensor, b: &Tensor, e_idx: &Tensor, train: bool) -> Result<Tensor> {
        let b_neighbors = gather_nodes(b, e_idx)?;
        let d = (a.unsqueeze(2)?.broadcast_sub(&b_neighbors)?.sqr()?.sum(D::Minus1)? + 1e-6)?.sqrt()?;
        self.rbf(&d, train)
    }

    /// Backbone dihedrals (phi, psi, omega) as cos/sin, `[B, L, 6]`.
    ///
    /// Angles touching a masked residue (and the chain termini) are reported as 0.
    fn dihedrals(&self, n: &Tensor, ca: &Tensor, c: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, l, _) = ca.dims3()?;
        if l < 2 {
            let ones = Tensor::ones((b, l, 3), ca.dtype(), ca.device())?;
            return Tensor::cat(&[&ones, &ones.zeros_like()?], D::Minus1);
        }
        let eps = 1e-7;
        let atoms = Tensor::stack(&[n, ca, c], 2)?.reshape((b, 3 * l, 3))?;
        let n_atoms = 3 * l;

        let dx = (atoms.narrow(1, 1, n_atoms - 1)? - atoms.narrow(1, 0, n_atoms - 1)?)?;
        let u = normalize(&dx, eps)?;
        let n_dihedrals = n_atoms - 3;
        let u_2 = u.narrow(1, 0, n_dihedrals)?;
        let u_1 = u.narrow(1, 1, n_dihedrals)?;
        let u_0 = u.narrow(1, 2, n_dihedrals)?;
        let n_2 = normalize(&cross_product(&u_2, &u_1)?, eps)?;
        let n_1 = normalize(&cross_product(&u_1, &u_0)?, eps)?;

        let cos_d = dot_keepdim(&n_2, &n_1)?
            .squeeze(D::Minus1)?
            .clamp(-1.0 + eps, 1.0 - eps)?;
        let sign = dot_keepdim(&u_2, &n_1)?
            .squeeze(D::Minus1)?
            .ge(0f64)?
            .to_dtype(cos_d.dtype())?
            .affine(2.0, -1.0)?;
        let sin_d = ((cos_d.sqr()?.neg()? + 1.0)?.sqrt()? * sign)?;

        // an angle is defined only when all four of its atoms belong to valid residues
        let atom_mask = mask
            .unsqueeze(D::Minus1)?
            .broadcast_as((b, l, 3))?
            .reshape((b, n_atoms))?;
        let mut valid = atom_mask.narrow(1, 0, n_dihedrals)?;
        for shift in 1..4 {
            valid = (valid * atom_mask.narrow(1, shift, n_dihedrals)?)?;
        }

        let pad = |xs: &Tensor, value: f64| -> Result<Tensor> {
            let front = Tensor::full(value, (b, 1), xs.device())?.to_dtype(xs.dtype())?;
            let back = Tensor::full(value, (b, 2), xs.device())?.to_dtype(xs.dtype())?;
            Tensor::cat(&[&front, xs, &back], 1)?.reshape((b, l, 3))
        };
        let valid = pad(&valid, 0.0)?;
        let cos_d = pad(&cos_d, 1.0)?;
        let sin_d = pad(&sin_d, 0.0)?;
        let cos_d = blend(&valid, &cos_d, &valid.ones_like()?)?;
        let sin_d = (sin_d * &valid)?;
        Tensor::cat(&[&cos_d, &sin_d], D::Minus1)
    }

    fn frames(&self, n: &Tensor, ca: &Tensor, c: &Tensor, mask: &Tensor, train: bool) -> Result<(Rigid, Tensor)> {
        let (rigid, degenerate) = Rigid::from_3_points(n, ca, c)?;
        let flagged = (&degenerate * mask)?;
        let num_flagged = flagged.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        let mask = if num_flagged > 0.0 {
            match self.policy {
                DegenerateFramePolicy::IdentityFallback => {
                    tracing::warn!(residues = num_flagged, "degenerate backbone frames replaced by identity");
                    mask.clone()
                }
                DegenerateFramePolicy::MaskResidue => {
                    tracing::warn!(residues = num_flagged, "masking residues with degenerate backbone frames");
                    (mask - &flagged)?
                }
                DegenerateFramePolicy::Reject => {
                    let rows = flagged.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                    let (batch, residue) = rows
                        .iter()
                        .enumerate()
                        .find_map(|(bi, row)| row.iter().position(|v| *v > 0.5).map(|ri| (bi, ri)))
                        .unwrap_or((0, 0));
                    return Err(TmpnnError::DegenerateFrame { batch, residue }.into());
                }
            }
        } else {
            mask.clone()
        };
        // masked residues (zeroed coordinates) are always degenerate
        let rigid = rigid.with_identity_where(&degenerate)?;

        let rigid = if train && self.noise_3d > 0.0 {
            let (b, l) = mask.dims2()?;
            let noise = Rigid::random_perturbation(&[b, l], self.noise_3d, rigid.dtype(), mask.device())?;
            rigid.compose(&noise)?
        } else {
            rigid
        };
        Ok((rigid, mask))
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<FeatureOutput> {
        let (b, l, n_atoms, xyz) = x.dims4()?;
        if n_atoms < 4 || xyz != 3 {
            return Err(TmpnnError::shape("x", "[B, L, >=4, 3]", x.dims()).into());
        }
        let dtype = self.edge_embedding.weight().dtype();
        let mask = mask.to_dtype(dtype)?;

        // padded coordinates may hold anything, NaN included
        let x = x.narrow(2, 0, 4)?.to_dtype(dtype)?;
        let keep = mask
            .gt(0.5)?
            .reshape((b, l, 1, 1))?
            .broadcast_as(x.shape())?;
        let x = keep.where_cond(&x, &x.zeros_like()?)?;

        let n = x.narrow(2, 0, 1)?.squeeze(2)?.contiguous()?;
        let ca = x.narrow(2, 1, 1)?.squeeze(2)?.contiguous()?;
        let c = x.narrow(2, 2, 1)?.squeeze(2)?.contiguous()?;
        let o = x.narrow(2, 3, 1)?.squeeze(2)?.contiguous()?;

        let (frames, mask) = self.frames(&n, &ca, &c, &mask, train)?;

        // virtual C-beta
        let bv = (&ca - &n)?;
        let cv = (&c - &ca)?;
        let av = cross_product(&bv, &cv)?;
        let cb = ((((av * -0.58273431)? + (bv * 0.56802827)?)? - (cv * 0.54067466)?)? + &ca)?;

        let (d_neighbors, e_idx) = compute_nearest_neighbors(&ca, &mask, self.top_k, 1e-6)?;
        let k = e_idx.dim(2)?;
        tracing::debug!(batch = b, length = l, neighbors = k, "computed neighbor graph");

        let mask_attend = gather_nodes(&mask.unsqueeze(D::Minus1)?, &e_idx)?
            .squeeze(D::Minus1)?
            .broadcast_mul(&mask.unsqueeze(D::Minus1)?)?;

        let pairs: [(&Tensor, &Tensor); 24] = [
            (&n, &n),
            (&c, &c),
            (&o, &o),
            (&cb, &cb),
            (&ca, &n),
            (&ca, &c),
            (&ca, &o),
            (&ca, &cb),
            (&n, &c),
            (&n, &o),
            (&n, &cb),
            (&cb, &c),
            (&cb, &o),
            (&o, &c),
            (&n, &ca),
            (&c, &ca),
            (&o, &ca),
            (&cb, &ca),
            (&c, &n),
            (&o, &n),
            (&cb, &n),
            (&c, &cb),
            (&o, &cb),
            (&c, &o),
        ];
        let mut rbf_all = Vec::with_capacity(25);
        rbf_all.push(self.rbf(&d_neighbors, train)?);
        for (a, b_atom) in pairs {
            rbf_all.push(self.get_rbf(a, b_atom, &e_idx, train)?);
        }
        let rbf_all = Tensor::cat(&rbf_all, D::Minus1)?;

        let residue_idx = Tensor::arange(0u32, l as u32, x.device())?
            .to_dtype(dtype)?
            .reshape((1, l, 1))?;
        let offset = residue_idx.broadcast_sub(&e_idx.to_dtype(dtype)?)?;
        let e_positional = self.embeddings.forward(&offset, &mask_attend)?;

        let e = Tensor::cat(&[&e_positional, &rbf_all], D::Minus1)?;
        let e = self.norm_edges.forward(&self.edge_embedding.forward(&e)?)?;

        let v = self.dihedrals(&n, &ca, &c, &mask)?;
        let v = self.norm_nodes.forward(&self.node_embedding.forward(&v)?)?;

        Ok(FeatureOutput {
            v,
            e,
            e_idx,
            frames,
            mask,
            mask_attend,
        })
    }
}
