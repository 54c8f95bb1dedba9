use thiserror::Error;

/// Errors raised while addressing weight storage or running a kernel.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("failed to open model file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to mmap model file {path}: {source}")]
    Mmap {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("allocation of {0} bytes failed")]
    Alloc(usize),

    #[error("weight region [{offset}, {offset}+{len}) is out of bounds for a {size}-byte model")]
    OutOfBounds {
        offset: u64,
        len: usize,
        size: u64,
    },

    #[error("quantized tensor length {len} is not a multiple of group size {group_size}")]
    BadGroupSize { len: usize, group_size: usize },

    #[error("dimension mismatch: {0}")]
    DimMismatch(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;
