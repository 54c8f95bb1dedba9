use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("job ring capacity {capacity} is insufficient for a dispatch of {n_threads} jobs with {queued} already queued")]
    RingOverflow {
        capacity: usize,
        n_threads: usize,
        queued: usize,
    },

    #[error("matmul kernel failed during dispatch: {0}")]
    Kernel(#[from] clamma_kernel::KernelError),

    #[error("worker pool requires at least one thread")]
    ZeroThreads,
}

pub type Result<T> = std::result::Result<T, PoolError>;
