use super::error::TmpnnError;
use candle_core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::{Display, EnumString};

/// What to do with a residue whose N/CA/C atoms cannot span a frame.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DegenerateFramePolicy {
    /// Substitute the identity rotation (origin stays on CA) and log a warning.
    #[default]
    IdentityFallback,
    /// Fail the forward call.
    Reject,
    /// Drop the residue from the validity mask.
    MaskResidue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpaConfig {
    pub c_hidden: usize,
    pub num_heads: usize,
    pub num_qk_points: usize,
    pub num_v_points: usize,
    pub inf: f64,
    pub eps: f64,
}

impl Default for IpaConfig {
    fn default() -> Self {
        Self {
            c_hidden: 16,
            num_heads: 8,
            num_qk_points: 4,
            num_v_points: 8,
            inf: 1e5,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TMPNNConfig {
    pub node_features: usize,
    pub edge_features: usize,
    pub hidden_dim: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub num_ipa_layers: usize,
    pub vocab: usize,
    pub num_tags: usize,
    pub k_neighbors: usize,
    pub num_rbf: usize,
    pub num_positional_embeddings: usize,
    pub max_relative_feature: usize,
    pub num_heads: usize,
    pub noise_2d: f64,
    pub noise_3d: f64,
    pub dropout: f32,
    pub layer_norm_eps: f64,
    pub ipa: IpaConfig,
    pub degenerate_frames: DegenerateFramePolicy,
    /// Park the dense pair tensor on the host between its two uses inside IPA.
    pub offload_pair: bool,
}

impl Default for TMPNNConfig {
    fn default() -> Self {
        Self::tmpnn()
    }
}

impl TMPNNConfig {
    pub fn tmpnn() -> Self {
        Self {
            node_features: 128,
            edge_features: 128,
            hidden_dim: 128,
            num_encoder_layers: 3,
            num_decoder_layers: 3,
            num_ipa_layers: 3,
            vocab: 22,
            num_tags: 5,
            k_neighbors: 30,
            num_rbf: 16,
            num_positional_embeddings: 16,
            max_relative_feature: 32,
            num_heads: 4,
            noise_2d: 0.0,
            noise_3d: 0.0,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
            ipa: IpaConfig::default(),
            degenerate_frames: DegenerateFramePolicy::default(),
            offload_pair: false,
        }
    }

    /// Same network with the structural noise used while training.
    pub fn tmpnn_training() -> Self {
        Self {
            noise_2d: 0.1,
            noise_3d: 0.02,
            ..Self::tmpnn()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(candle_core::Error::wrap)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).map_err(candle_core::Error::wrap)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("node_features", self.node_features),
            ("edge_features", self.edge_features),
            ("hidden_dim", self.hidden_dim),
            ("num_tags", self.num_tags),
            ("k_neighbors", self.k_neighbors),
            ("num_rbf", self.num_rbf),
            ("num_positional_embeddings", self.num_positional_embeddings),
            ("num_heads", self.num_heads),
            ("ipa.c_hidden", self.ipa.c_hidden),
            ("ipa.num_heads", self.ipa.num_heads),
            ("ipa.num_qk_points", self.ipa.num_qk_points),
            ("ipa.num_v_points", self.ipa.num_v_points),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(TmpnnError::config(format!("{name} must be > 0")).into());
            }
        }
        if self.hidden_dim % self.num_heads != 0 {
            return Err(TmpnnError::config(format!(
                "hidden_dim {} is not divisible by num_heads {}",
                self.hidden_dim, self.num_heads
            ))
            .into());
        }
        // 20 amino acids + mask + padding
        if self.vocab < 22 {
            return Err(TmpnnError::config(format!("vocab {} < 22", self.vocab)).into());
        }
        if self.noise_2d < 0.0 || self.noise_3d < 0.0 {
            return Err(TmpnnError::config("noise magnitudes must be non-negative").into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TmpnnError::config(format!("dropout {} not in [0, 1)", self.dropout)).into());
        }
        Ok(())
    }
}

/// Knobs for sequential decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    pub temperature: f64,
    /// Drawn from the thread rng when absent.
    pub seed: Option<u64>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            seed: None,
        }
    }
}
