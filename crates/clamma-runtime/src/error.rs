use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("model error: {0}")]
    Model(#[from] clamma_model::ModelError),
    #[error("pool error: {0}")]
    Pool(#[from] clamma_pool::PoolError),
    #[error("kernel error: {0}")]
    Kernel(#[from] clamma_kernel::KernelError),
    #[error("model \"{0}\" not found")]
    ModelNotFound(String),
    #[error("model \"{name}\" has reached its session limit of {max_sessions}")]
    MaxSessionsReached { name: String, max_sessions: usize },
    #[error("no sessions are registered")]
    NoSessions,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
