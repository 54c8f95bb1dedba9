//! Synthetic INT8_V2 checkpoint bytes for this crate's own quantized-path
//! tests (`weights::load_int8`, `forward::step_quant`). Not exposed outside
//! `#[cfg(test)]`.

use clamma_kernel::quantize;

use crate::config::{ModelConfig, ModelVersion};

const INT8_MAGIC: u32 = 0x616b_3432;
const INT8_VERSION: u32 = 2;
const INT8_HEADER_LEN: usize = 256;

/// Deterministic pseudo-random float in `[-0.3, 0.3]`, reproducible across
/// runs without pulling in a `rand` dev-dependency just for test fixtures.
fn pseudo(i: usize, salt: u32) -> f32 {
    let mut h = (i as u32)
        .wrapping_mul(2_654_435_761)
        .wrapping_add(salt.wrapping_mul(0x9E37_79B1));
    h ^= h >> 15;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    ((h as f32 / u32::MAX as f32) * 2.0 - 1.0) * 0.3
}

fn push_f32(n: usize, salt: u32, bytes: &mut Vec<u8>) {
    for i in 0..n {
        bytes.extend_from_slice(&pseudo(i, salt).to_le_bytes());
    }
}

/// Quantize `n` pseudo-random floats with `group_size` and append the
/// resulting `q` bytes then `s` scales, matching the checkpoint's
/// quantized-tensor-as-`(q, s)` layout (spec.md §6).
fn push_quantized(n: usize, salt: u32, group_size: usize, bytes: &mut Vec<u8>) {
    let floats: Vec<f32> = (0..n).map(|i| pseudo(i, salt)).collect();
    let qt = quantize(&floats, group_size).expect("fixture dims divide group_size");
    for &q in &qt.q {
        bytes.push(q as u8);
    }
    for &s in &qt.s {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
}

/// A small but architecturally nontrivial int8 config: two layers, every
/// dimension an exact multiple of `group_size` so `push_quantized` never
/// rejects a shape.
pub(crate) fn quant_config(shared_classifier: bool) -> ModelConfig {
    ModelConfig {
        dim: 8,
        hidden_dim: 16,
        n_layers: 2,
        n_heads: 2,
        n_kv_heads: 2,
        vocab_size: 4,
        seq_len: 8,
        group_size: 4,
        shared_classifier,
        version: ModelVersion::Int8V2,
    }
}

/// Build an INT8_V2 checkpoint's bytes for `c`, in exactly the order
/// `weights::Weights::load_int8` reads them: header, then per-layer-kind
/// grouped RMS weights, the quantized token embedding, and each quantized
/// matrix kind across all layers before moving to the next kind.
///
/// When `c.shared_classifier` is false, `wcls` is a byte-for-byte copy of
/// the token embedding's quantized region, so a test can build both a
/// shared and an unshared model from matching weights and compare their
/// forward-step output directly (spec.md §8's classifier-equivalence
/// scenario, exercised here for the int8 path).
pub(crate) fn build_int8_checkpoint_bytes(c: &ModelConfig) -> Vec<u8> {
    let mut bytes = Vec::new();

    bytes.extend_from_slice(&INT8_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&INT8_VERSION.to_le_bytes());
    for v in [
        c.dim,
        c.hidden_dim,
        c.n_layers,
        c.n_heads,
        c.n_kv_heads,
        c.vocab_size,
        c.seq_len,
    ] {
        bytes.extend_from_slice(&(v as u32).to_le_bytes());
    }
    bytes.push(if c.shared_classifier { 1 } else { 0 });
    bytes.extend_from_slice(&(c.group_size as u32).to_le_bytes());
    bytes.resize(INT8_HEADER_LEN, 0);

    let g = c.group_size;
    let kv_dim = c.kv_dim();

    push_f32(c.n_layers * c.dim, 20, &mut bytes); // rms_att, all layers
    push_f32(c.n_layers * c.dim, 21, &mut bytes); // rms_ffn, all layers
    push_f32(c.dim, 22, &mut bytes); // rms_final

    let embedding_start = bytes.len();
    push_quantized(c.vocab_size * c.dim, 1, g, &mut bytes); // token embedding
    let embedding_end = bytes.len();

    for l in 0..c.n_layers {
        push_quantized(c.dim * c.dim, 30 + l as u32, g, &mut bytes); // wq
    }
    for l in 0..c.n_layers {
        push_quantized(c.dim * kv_dim, 40 + l as u32, g, &mut bytes); // wk
    }
    for l in 0..c.n_layers {
        push_quantized(c.dim * kv_dim, 50 + l as u32, g, &mut bytes); // wv
    }
    for l in 0..c.n_layers {
        push_quantized(c.dim * c.dim, 60 + l as u32, g, &mut bytes); // wo
    }
    for l in 0..c.n_layers {
        push_quantized(c.dim * c.hidden_dim, 70 + l as u32, g, &mut bytes); // w1
    }
    for l in 0..c.n_layers {
        push_quantized(c.hidden_dim * c.dim, 80 + l as u32, g, &mut bytes); // w2
    }
    for l in 0..c.n_layers {
        push_quantized(c.dim * c.hidden_dim, 90 + l as u32, g, &mut bytes); // w3
    }

    if !c.shared_classifier {
        let embedding_bytes = bytes[embedding_start..embedding_end].to_vec();
        bytes.extend_from_slice(&embedding_bytes);
    }

    bytes
}
