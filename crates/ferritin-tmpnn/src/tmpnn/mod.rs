pub mod configs;
pub mod crf;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod featurizer;
pub mod ipa;
pub mod loss;
pub mod model;
pub mod proteinfeatures;
pub mod rigid;
pub mod utilities;
