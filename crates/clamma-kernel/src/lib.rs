//! `clamma-kernel` - weight addressing, group quantization, and the
//! single-threaded matmul kernels that the worker pool fans out across
//! threads.

pub mod access;
pub mod error;
pub mod matmul;
pub mod quant;

pub use access::{CacheSource, CacheStats, MemorySource, ModelAccess, MmapSource, WeightRef, WeightSource};
pub use error::{KernelError, Result};
pub use matmul::{matmul_qt_range, matmul_range};
pub use quant::{dequantize, quantize, quantize_into, QuantizedTensor};
