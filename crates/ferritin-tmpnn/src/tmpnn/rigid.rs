//! Per-residue rigid transforms.
//!
//! A [`Rigid`] holds a rotation `[.., 3, 3]` and a translation `[.., 3]` and maps points
//! from a residue's local frame into the global frame (`R p + t`).
use super::utilities::{cross_product, dot_keepdim};
use candle_core::{DType, Device, Result, Tensor, D};

/// Backbone vectors shorter than this (in Angstrom) cannot define a frame.
pub const DEGENERATE_NORM: f64 = 1e-4;

#[derive(Clone, Debug)]
pub struct Rigid {
    rots: Tensor,
    trans: Tensor,
}

impl Rigid {
    pub fn new(rots: Tensor, trans: Tensor) -> Result<Self> {
        let r_dims = rots.dims();
        let t_dims = trans.dims();
        let rank = r_dims.len();
        if rank < 2 || r_dims[rank - 1] != 3 || r_dims[rank - 2] != 3 {
            return Err(super::error::TmpnnError::shape("rots", "[.., 3, 3]", r_dims).into());
        }
        if t_dims.last() != Some(&3) || t_dims[..t_dims.len() - 1] != r_dims[..rank - 2] {
            return Err(super::error::TmpnnError::shape("trans", "[.., 3]", t_dims).into());
        }
        Ok(Self { rots, trans })
    }

    pub fn identity(shape: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        let mut r_shape = shape.to_vec();
        r_shape.extend([3, 3]);
        let rots = eye3(dtype, device)?.broadcast_as(r_shape)?.contiguous()?;
        let mut t_shape = shape.to_vec();
        t_shape.push(3);
        let trans = Tensor::zeros(t_shape, dtype, device)?;
        Ok(Self { rots, trans })
    }

    /// Frame from three backbone atoms with the origin on `origin` (CA).
    ///
    /// The x axis points from `p_neg_x_axis` (N) to the origin, `p_xy_plane` (C) lies in
    /// the xy plane. Also returns a float mask, 1.0 where the atoms are too close or
    /// collinear to span a frame.
    pub fn from_3_points(
        p_neg_x_axis: &Tensor,
        origin: &Tensor,
        p_xy_plane: &Tensor,
    ) -> Result<(Self, Tensor)> {
        let e0 = (origin - p_neg_x_axis)?;
        let e1 = (p_xy_plane - origin)?;
        let (rots, degenerate) = graham_schmidt(&e0, &e1, DEGENERATE_NORM)?;
        Ok((
            Self {
                rots,
                trans: origin.clone(),
            },
            degenerate,
        ))
    }

    pub fn rots(&self) -> &Tensor {
        &self.rots
    }

    pub fn trans(&self) -> &Tensor {
        &self.trans
    }

    pub fn dtype(&self) -> DType {
        self.rots.dtype()
    }

    /// Replace the rotation by the identity wherever `flag` (float, frame shape) is 1.
    pub fn with_identity_where(&self, flag: &Tensor) -> Result<Self> {
        let flag = flag.to_dtype(self.rots.dtype())?.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?;
        let eye = eye3(self.rots.dtype(), self.rots.device())?;
        let keep = (flag.ones_like()? - &flag)?;
        let rots = self
            .rots
            .broadcast_mul(&keep)?
            .add(&eye.broadcast_mul(&flag)?.broadcast_as(self.rots.shape())?)?;
        Ok(Self {
            rots,
            trans: self.trans.clone(),
        })
    }

    /// `self ∘ other`: apply `other` first.
    pub fn compose(&self, other: &Rigid) -> Result<Self> {
        let rots = self.rots.broadcast_matmul(&other.rots)?;
        let trans = self
            .rots
            .broadcast_matmul(&other.trans.unsqueeze(D::Minus1)?)?
            .squeeze(D::Minus1)?
            .broadcast_add(&self.trans)?;
        Ok(Self { rots, trans })
    }

    pub fn invert(&self) -> Result<Self> {
        let rots = self.rots.transpose(D::Minus1, D::Minus2)?.contiguous()?;
        let trans = rots
            .matmul(&self.trans.unsqueeze(D::Minus1)?)?
            .squeeze(D::Minus1)?
            .neg()?;
        Ok(Self { rots, trans })
    }

    /// Local -> global for points `[.., P, 3]` that carry one extra axis beyond the frame.
    pub fn apply(&self, points: &Tensor) -> Result<Tensor> {
        let rots_t = self.rots.transpose(D::Minus1, D::Minus2)?.contiguous()?;
        points
            .contiguous()?
            .matmul(&rots_t)?
            .broadcast_add(&self.trans.unsqueeze(D::Minus2)?)
    }

    /// Global -> local for points `[.., P, 3]`.
    pub fn invert_apply(&self, points: &Tensor) -> Result<Tensor> {
        points
            .broadcast_sub(&self.trans.unsqueeze(D::Minus2)?)?
            .contiguous()?
            .matmul(&self.rots.contiguous()?)
    }

    /// Small random rigid motions: axis-angle and translation drawn from N(0, sigma^2).
    pub fn random_perturbation(
        shape: &[usize],
        sigma: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut v_shape = shape.to_vec();
        v_shape.push(3);
        let axis_angle = Tensor::randn(0f32, sigma as f32, v_shape.as_slice(), device)?;
        let trans = Tensor::randn(0f32, sigma as f32, v_shape.as_slice(), device)?.to_dtype(dtype)?;

        let host = axis_angle.flatten_all()?.to_vec1::<f32>()?;
        let rots: Vec<f32> = host.chunks_exact(3).flat_map(rodrigues).collect();
        let mut r_shape = shape.to_vec();
        r_shape.extend([3, 3]);
        let rots = Tensor::from_vec(rots, r_shape, device)?.to_dtype(dtype)?;
        Ok(Self { rots, trans })
    }
}

pub fn eye3(dtype: DType, device: &Device) -> Result<Tensor> {
    Tensor::from_vec(vec![1f32, 0., 0., 0., 1., 0., 0., 0., 1.], (3, 3), device)?.to_dtype(dtype)
}

/// Rotation matrix (row major) for an axis-angle vector.
fn rodrigues(w: &[f32]) -> [f32; 9] {
    let theta = (w[0] * w[0] + w[1] * w[1] + w[2] * w[2]).sqrt();
    if theta < 1e-12 {
        return [1., 0., 0., 0., 1., 0., 0., 0., 1.];
    }
    let (x, y, z) = (w[0] / theta, w[1] / theta, w[2] / theta);
    let (s, c) = theta.sin_cos();
    let t = 1.0 - c;
    [
        c + x * x * t,
        x * y * t - z * s,
        x * z * t + y * s,
        y * x * t + z * s,
        c + y * y * t,
        y * z * t - x * s,
        z * x * t - y * s,
        z * y * t + x * s,
        c + z * z * t,
    ]
}

/// Orthonormal basis with `x_axis` as first column and `xy_plane` in the span of the first two.
///
/// Returns the `[.., 3, 3]` rotation (basis vectors as columns) and a float mask of
/// residues where either input vector (after projection) is shorter than `eps`.
fn graham_schmidt(x_axis: &Tensor, xy_plane: &Tensor, eps: f64) -> Result<(Tensor, Tensor)> {
    let x_norm = x_axis.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let e0 = x_axis.broadcast_div(&x_norm.maximum(eps)?)?;

    let e1 = (xy_plane - e0.broadcast_mul(&dot_keepdim(&e0, xy_plane)?)?)?;
    let e1_norm = e1.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let e1 = e1.broadcast_div(&e1_norm.maximum(eps)?)?;

    let e2 = cross_product(&e0, &e1)?;
    let rots = Tensor::stack(&[&e0, &e1, &e2], D::Minus1)?;

    let degenerate = x_norm
        .lt(eps)?
        .maximum(&e1_norm.lt(eps)?)?
        .squeeze(D::Minus1)?
        .to_dtype(x_axis.dtype())?;
    Ok((rots, degenerate))
}
