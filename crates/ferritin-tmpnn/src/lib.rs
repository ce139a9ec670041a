//! ferritin-tmpnn
//!
//! Structure-conditioned protein sequence design with per-residue topology labels.
//!
//! - backbone featurization and rigid frames ([`ProteinFeaturesModel`], [`Rigid`])
//! - graph encoder, invariant point attention and an autoregressive decoder ([`TMPNN`])
//! - a linear-chain CRF over topology labels ([`Crf`])
//!
//! Parameters are read through a [`candle_nn::VarBuilder`], so any tensor map (a
//! safetensors checkpoint or a freshly initialised `VarMap`) can back the model.
//!
//! ```no_run
//! use candle_nn::{VarBuilder, VarMap};
//! use ferritin_tmpnn::{ChainRecord, ExecutionContext, ProteinBatch, SampleConfig, TMPNNConfig, TMPNN};
//!
//! # fn main() -> candle_core::Result<()> {
//! let ctx = ExecutionContext::new(true)?;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, ctx.dtype, &ctx.device);
//! let model = TMPNN::load(vb, &TMPNNConfig::tmpnn(), &ctx)?;
//!
//! let chain = ChainRecord {
//!     coords: ferritin_tmpnn::ideal_helix(12),
//!     sequence: "A".repeat(12),
//!     labels: None,
//! };
//! let batch = ProteinBatch::collate(&[chain], &ctx.device)?;
//! let sampled = model.sample(&batch, &SampleConfig::default())?;
//! println!("{:?}", sampled.s.to_vec2::<u32>()?);
//! # Ok(())
//! # }
//! ```
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result};

pub mod tmpnn;

pub use tmpnn::configs::{DegenerateFramePolicy, IpaConfig, SampleConfig, TMPNNConfig};
pub use tmpnn::crf::Crf;
pub use tmpnn::error::TmpnnError;
pub use tmpnn::featurizer::{ideal_helix, ChainRecord, ProteinBatch};
pub use tmpnn::loss::{LossOutput, TMPNNLoss};
pub use tmpnn::model::{EncodedStructure, SampleOutput, TMPNNOutput, TMPNN};
pub use tmpnn::proteinfeatures::{FeatureOutput, ProteinFeaturesModel};
pub use tmpnn::rigid::Rigid;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("running on CPU, build with `--features metal` to run on the GPU");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("running on CPU, build with `--features cuda` to run on the GPU");
        }
        Ok(Device::Cpu)
    }
}

/// Device and precision, chosen once and handed to model construction.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub device: Device,
    pub dtype: DType,
}

impl ExecutionContext {
    pub fn new(cpu: bool) -> Result<Self> {
        Ok(Self {
            device: device(cpu)?,
            dtype: DType::F32,
        })
    }

    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    pub fn with_dtype(self, dtype: DType) -> Self {
        Self { dtype, ..self }
    }
}
