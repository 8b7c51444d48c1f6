pub mod backend;
pub mod checkpoint;

pub use backend::InferenceBackend;
pub use checkpoint::{load_checkpoint, InferenceSettings, LoadedCheckpoint};
