#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("storage error: {0}")]
    Storage(#[from] world_core::StorageError),
    #[error("tool panicked: {0}")]
    ToolPanic(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("world not found: {0}")]
    WorldNotFound(String),
    #[error(transparent)]
    Storage(#[from] world_core::StorageError),
    #[error(transparent)]
    Responder(#[from] ResponderError),
}
