use thiserror::Error;

#[derive(Debug, Error)]
pub enum TmpnnError {
    #[error("shape mismatch for `{name}`: expected {expected}, got {got:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        got: Vec<usize>,
    },
    #[error("degenerate backbone frame at batch {batch}, residue {residue}")]
    DegenerateFrame { batch: usize, residue: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("batch contains no chains")]
    EmptyBatch,
}

impl TmpnnError {
    pub fn shape(name: &'static str, expected: impl Into<String>, got: &[usize]) -> Self {
        Self::ShapeMismatch {
            name,
            expected: expected.into(),
            got: got.to_vec(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<TmpnnError> for candle_core::Error {
    fn from(err: TmpnnError) -> Self {
        candle_core::Error::wrap(err)
    }
}
