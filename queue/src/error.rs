#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] world_core::StorageError),
    #[error(transparent)]
    Runtime(#[from] world_runtime::RuntimeError),
    #[error("no runtime registered for world: {0}")]
    NoRuntime(String),
}
