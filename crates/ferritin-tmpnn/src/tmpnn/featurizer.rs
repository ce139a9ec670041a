//! Batched model inputs.
//!
//! Chains of different lengths are padded to a common length `L`; padded positions
//! carry zero coordinates, [`PAD_TOKEN`] and a zero mask.
use super::error::TmpnnError;
use super::utilities::{encode_sequence, PAD_TOKEN};
use candle_core::{DType, Device, Result, Tensor};

/// Backbone atoms in the order they are stored along the atom axis.
pub const BACKBONE_ATOMS: [&str; 4] = ["N", "CA", "C", "O"];

/// One chain before padding.
#[derive(Clone, Debug, Default)]
pub struct ChainRecord {
    /// N/CA/C/O per residue.
    pub coords: Vec<[[f32; 3]; 4]>,
    pub sequence: String,
    pub labels: Option<Vec<u32>>,
}

/// Synthetic alpha-helix-like backbone (100 degrees and 1.5 A rise per residue).
///
/// Handy for smoke tests and demos when no structure file is at hand.
pub fn ideal_helix(len: usize) -> Vec<[[f32; 3]; 4]> {
    (0..len)
        .map(|i| {
            let atom = |radius: f32, phase: f32, rise: f32| {
                let t = (i as f32) * 100f32.to_radians() + phase;
                [radius * t.cos(), radius * t.sin(), 1.5 * i as f32 + rise]
            };
            [
                atom(1.55, -0.45, -0.6),
                atom(2.3, 0.0, 0.0),
                atom(1.65, 0.45, 0.55),
                atom(1.9, 0.75, 1.5),
            ]
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct ProteinBatch {
    /// `[B, L, 4, 3]` backbone coordinates (extra atoms past O are ignored).
    pub x: Tensor,
    /// `[B, L]` amino-acid tokens (u32).
    pub s: Tensor,
    /// `[B, L]` validity (f32).
    pub mask: Tensor,
    pub lengths: Vec<usize>,
    /// `[B, L]` topology labels (u32).
    pub labels: Option<Tensor>,
    /// `[B, L]` partially masked sequence used to condition the encoder.
    pub s_mask: Option<Tensor>,
}

impl ProteinBatch {
    pub fn new(x: Tensor, s: Tensor, mask: Tensor, lengths: Vec<usize>) -> Result<Self> {
        let batch = Self {
            x,
            s,
            mask,
            lengths,
            labels: None,
            s_mask: None,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Builds the mask from chain lengths (prefix of ones per row).
    pub fn from_lengths(x: Tensor, s: Tensor, lengths: Vec<usize>) -> Result<Self> {
        let (b, l) = s.dims2()?;
        if lengths.len() != b {
            return Err(TmpnnError::shape("lengths", format!("{b} entries"), &[lengths.len()]).into());
        }
        let mut mask = vec![0f32; b * l];
        for (row, &len) in lengths.iter().enumerate() {
            if len > l {
                return Err(TmpnnError::shape("lengths", format!("<= {l}"), &[len]).into());
            }
            mask[row * l..row * l + len].fill(1.0);
        }
        let mask = Tensor::from_vec(mask, (b, l), s.device())?;
        Self::new(x, s, mask, lengths)
    }

    /// Pads a list of chains into one batch.
    pub fn collate(chains: &[ChainRecord], device: &Device) -> Result<Self> {
        if chains.is_empty() {
            return Err(TmpnnError::EmptyBatch.into());
        }
        let b = chains.len();
        let l = chains.iter().map(|c| c.coords.len()).max().unwrap_or(0);
        let with_labels = chains.iter().filter(|c| c.labels.is_some()).count();
        if with_labels != 0 && with_labels != b {
            return Err(TmpnnError::shape("labels", format!("{b} labelled chains"), &[with_labels]).into());
        }

        let mut coords = vec![0f32; b * l * 4 * 3];
        let mut seq = vec![PAD_TOKEN; b * l];
        let mut labels = vec![0u32; b * l];
        let mut lengths = Vec::with_capacity(b);
        for (row, chain) in chains.iter().enumerate() {
            let len = chain.coords.len();
            let tokens = encode_sequence(&chain.sequence);
            if tokens.len() != len {
                return Err(TmpnnError::shape("sequence", format!("{len} residues"), &[tokens.len()]).into());
            }
            for (i, residue) in chain.coords.iter().enumerate() {
                let base = (row * l + i) * 12;
                for (a, atom) in residue.iter().enumerate() {
                    coords[base + a * 3..base + a * 3 + 3].copy_from_slice(atom);
                }
            }
            seq[row * l..row * l + len].copy_from_slice(&tokens);
            if let Some(chain_labels) = &chain.labels {
                if chain_labels.len() != len {
                    return Err(TmpnnError::shape("labels", format!("{len} residues"), &[chain_labels.len()]).into());
                }
                labels[row * l..row * l + len].copy_from_slice(chain_labels);
            }
            lengths.push(len);
        }

        let x = Tensor::from_vec(coords, (b, l, 4, 3), device)?;
        let s = Tensor::from_vec(seq, (b, l), device)?;
        let batch = Self::from_lengths(x, s, lengths)?;
        if with_labels == b {
            batch.with_labels(Tensor::from_vec(labels, (b, l), device)?)
        } else {
            Ok(batch)
        }
    }

    pub fn with_labels(mut self, labels: Tensor) -> Result<Self> {
        self.labels = Some(labels);
        self.validate()?;
        Ok(self)
    }

    pub fn with_s_mask(mut self, s_mask: Tensor) -> Result<Self> {
        self.s_mask = Some(s_mask);
        self.validate()?;
        Ok(self)
    }

    /// `(batch, padded length)`
    pub fn dims(&self) -> Result<(usize, usize)> {
        self.s.dims2()
    }

    pub fn device(&self) -> &Device {
        self.x.device()
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let move_opt = |t: &Option<Tensor>| t.as_ref().map(|t| t.to_device(device)).transpose();
        Ok(Self {
            x: self.x.to_device(device)?,
            s: self.s.to_device(device)?,
            mask: self.mask.to_device(device)?,
            lengths: self.lengths.clone(),
            labels: move_opt(&self.labels)?,
            s_mask: move_opt(&self.s_mask)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let x_dims = self.x.dims();
        if x_dims.len() != 4 || x_dims[2] < 4 || x_dims[3] != 3 {
            return Err(TmpnnError::shape("x", "[B, L, >=4, 3]", x_dims).into());
        }
        let (b, l) = (x_dims[0], x_dims[1]);
        if b == 0 || l == 0 {
            return Err(TmpnnError::EmptyBatch.into());
        }
        let expect_bl = |name: &'static str, t: &Tensor| -> Result<()> {
            if t.dims() != [b, l] {
                return Err(TmpnnError::shape(name, format!("[{b}, {l}]"), t.dims()).into());
            }
            Ok(())
        };
        expect_bl("s", &self.s)?;
        expect_bl("mask", &self.mask)?;
        if let Some(labels) = &self.labels {
            expect_bl("labels", labels)?;
        }
        if let Some(s_mask) = &self.s_mask {
            expect_bl("s_mask", s_mask)?;
        }
        if self.lengths.len() != b {
            return Err(TmpnnError::shape("lengths", format!("{b} entries"), &[self.lengths.len()]).into());
        }
        if let Some(&len) = self.lengths.iter().find(|&&len| len > l) {
            return Err(TmpnnError::shape("lengths", format!("<= {l}"), &[len]).into());
        }
        if self.mask.dtype() != DType::F32 && self.mask.dtype() != DType::F64 {
            return Err(TmpnnError::shape("mask", "float dtype", self.mask.dims()).into());
        }
        let row_sums = self.mask.to_dtype(DType::F32)?.sum(1)?.to_vec1::<f32>()?;
        for (row, (&sum, &len)) in row_sums.iter().zip(&self.lengths).enumerate() {
            if (sum - len as f32).abs() > 0.5 {
                return Err(TmpnnError::shape(
                    "mask",
                    format!("row {row} summing to length {len}"),
                    self.mask.dims(),
                )
                .into());
            }
        }
        Ok(())
    }
}
