//! Model configuration, fixed at checkpoint load time.

use crate::error::{ModelError, Result};

/// Checkpoint wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersion {
    /// Raw float32 weights, legacy 7-`u32` header.
    FloatV1,
    /// Group-quantized int8 weights, magic-prefixed 256-byte header.
    Int8V2,
}

/// Immutable model hyperparameters, carried for the model's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    pub group_size: usize,
    pub shared_classifier: bool,
    pub version: ModelVersion,
}

impl ModelConfig {
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Validate the shape invariants spec.md §3 requires before the config
    /// is trusted by the rest of the crate.
    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.n_kv_heads == 0 {
            return Err(ModelError::BadConfig("head count must be nonzero".into()));
        }
        if self.dim % self.n_heads != 0 {
            return Err(ModelError::BadConfig(format!(
                "dim {} is not a multiple of n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ModelError::BadConfig(format!(
                "n_heads {} is not a multiple of n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.version == ModelVersion::Int8V2 {
            if self.group_size == 0 {
                return Err(ModelError::BadConfig("group_size must be nonzero for INT8_V2".into()));
            }
            for (name, n) in [
                ("dim", self.dim),
                ("hidden_dim", self.hidden_dim),
                ("kv_dim", self.kv_dim()),
            ] {
                if n % self.group_size != 0 {
                    return Err(ModelError::BadConfig(format!(
                        "{name} {n} is not a multiple of group_size {}",
                        self.group_size
                    )));
                }
            }
        }
        Ok(())
    }
}
