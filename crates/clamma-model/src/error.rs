use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported checkpoint magic/version: {0:#x}")]
    BadMagic(u32),
    #[error("checkpoint header is truncated: needed {wanted} bytes, file has {got}")]
    ShortHeader { wanted: usize, got: u64 },
    #[error("invalid config: {0}")]
    BadConfig(String),
    #[error("tokenizer file is truncated or malformed: {0}")]
    BadTokenizer(String),
    #[error("kernel error: {0}")]
    Kernel(#[from] clamma_kernel::KernelError),
    #[error("pool error: {0}")]
    Pool(#[from] clamma_pool::PoolError),
    #[error("empty input text on encode")]
    EmptyInput,
    #[error("model file not found at {path} (default search path also failed: {fallback})")]
    NotFound { path: String, fallback: String },
}

pub type Result<T> = std::result::Result<T, ModelError>;
