//! Tiny synthetic FLOAT_V1 checkpoints + tokenizers for the runtime crate's
//! end-to-end scenario tests (spec.md §8). Not exposed outside `#[cfg(test)]`.

use std::io::Write;

use clamma_model::ModelConfig;

use crate::model::{Model, ModelInfo, ModelType};

/// Deterministic pseudo-random float in `[-0.3, 0.3]`, reproducible across
/// runs without pulling in a `rand` dependency just for test fixtures.
fn pseudo(i: usize, salt: u32) -> f32 {
    let mut h = (i as u32)
        .wrapping_mul(2_654_435_761)
        .wrapping_add(salt.wrapping_mul(0x9E37_79B1));
    h ^= h >> 15;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    ((h as f32 / u32::MAX as f32) * 2.0 - 1.0) * 0.3
}

fn push_pseudo(n: usize, salt: u32, bytes: &mut Vec<u8>) {
    for i in 0..n {
        bytes.extend_from_slice(&pseudo(i, salt).to_le_bytes());
    }
}

/// A small but architecturally nontrivial config: multi-query attention
/// (`n_kv_heads < n_heads`) over two layers.
pub(crate) fn small_config(shared_classifier: bool) -> ModelConfig {
    ModelConfig {
        dim: 8,
        hidden_dim: 16,
        n_layers: 2,
        n_heads: 2,
        n_kv_heads: 1,
        vocab_size: 8,
        seq_len: 16,
        group_size: 0,
        shared_classifier,
        version: clamma_model::ModelVersion::FloatV1,
    }
}

/// Build a FLOAT_V1 checkpoint file's bytes for `c`, with distinct pseudo-
/// random weights per tensor kind so different tensors are distinguishable.
pub(crate) fn build_float_checkpoint_bytes(c: &ModelConfig) -> Vec<u8> {
    let mut bytes = Vec::new();

    bytes.extend_from_slice(&(c.dim as u32).to_le_bytes());
    bytes.extend_from_slice(&(c.hidden_dim as u32).to_le_bytes());
    bytes.extend_from_slice(&(c.n_layers as u32).to_le_bytes());
    bytes.extend_from_slice(&(c.n_heads as u32).to_le_bytes());
    bytes.extend_from_slice(&(c.n_kv_heads as u32).to_le_bytes());
    let vocab_signed = if c.shared_classifier {
        c.vocab_size as i32
    } else {
        -(c.vocab_size as i32)
    };
    bytes.extend_from_slice(&vocab_signed.to_le_bytes());
    bytes.extend_from_slice(&(c.seq_len as u32).to_le_bytes());

    let kv_dim = c.kv_dim();
    let embedding_start = bytes.len();
    push_pseudo(c.vocab_size * c.dim, 1, &mut bytes); // token embedding
    let embedding_end = bytes.len();
    push_pseudo(c.n_layers * c.dim, 2, &mut bytes); // rms_att
    push_pseudo(c.n_layers * c.dim * c.dim, 3, &mut bytes); // wq
    push_pseudo(c.n_layers * c.dim * kv_dim, 4, &mut bytes); // wk
    push_pseudo(c.n_layers * c.dim * kv_dim, 5, &mut bytes); // wv
    push_pseudo(c.n_layers * c.dim * c.dim, 6, &mut bytes); // wo
    push_pseudo(c.n_layers * c.dim, 7, &mut bytes); // rms_ffn
    push_pseudo(c.n_layers * c.dim * c.hidden_dim, 8, &mut bytes); // w1
    push_pseudo(c.n_layers * c.dim * c.hidden_dim, 9, &mut bytes); // w2
    push_pseudo(c.n_layers * c.dim * c.hidden_dim, 10, &mut bytes); // w3
    push_pseudo(c.dim, 11, &mut bytes); // rms_final
    push_pseudo(c.seq_len * c.head_size() / 2, 12, &mut bytes); // freq real (skipped on load)
    push_pseudo(c.seq_len * c.head_size() / 2, 13, &mut bytes); // freq imag (skipped on load)
    if !c.shared_classifier {
        // Deliberately a byte-for-byte copy of the token embedding, so the
        // "shared classifier equivalence" scenario (spec.md §8) can compare
        // a `shared_classifier = true` model against this one and expect
        // bit-identical logits.
        let embedding = bytes[embedding_start..embedding_end].to_vec();
        bytes.extend_from_slice(&embedding);
    }

    bytes
}

/// Minimal 8-entry vocabulary: reserved ids 0-2, a space, and `a`/`b`/`c`/`d`
/// so prompts built from those letters never need byte fallback.
pub(crate) fn build_tokenizer_bytes() -> Vec<u8> {
    let entries: [(&str, f32); 8] = [
        ("<unk>", -1e9),
        ("<s>", -1e9),
        ("</s>", -1e9),
        (" ", 0.0),
        ("a", 0.0),
        ("b", 0.0),
        ("c", 0.0),
        ("d", 0.0),
    ];
    let mut bytes = Vec::new();
    let max_len = entries.iter().map(|(s, _)| s.len()).max().unwrap_or(0) as u32;
    bytes.extend_from_slice(&max_len.to_le_bytes());
    for (s, score) in entries {
        bytes.extend_from_slice(&score.to_le_bytes());
        bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
        bytes.extend_from_slice(s.as_bytes());
    }
    bytes
}

fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
    f
}

/// A loaded test model plus the backing temp files, which must outlive any
/// `Mmap`/`MallocCache` access built against them.
pub(crate) struct Fixture {
    pub model: std::sync::Arc<Model>,
    _checkpoint: tempfile::NamedTempFile,
    _vocab: tempfile::NamedTempFile,
}

pub(crate) fn build_model(
    shared_classifier: bool,
    access: clamma_kernel::ModelAccess,
    cache_limit: Option<u64>,
    max_sessions: usize,
) -> Fixture {
    let config = small_config(shared_classifier);
    let checkpoint = write_temp(&build_float_checkpoint_bytes(&config));
    let vocab = write_temp(&build_tokenizer_bytes());

    let info = ModelInfo {
        name: "fixture".to_string(),
        checkpoint_path: checkpoint.path().to_path_buf(),
        tokenizer_path: vocab.path().to_path_buf(),
        model_access: access,
        image: None,
        cache_limit,
        model_type: ModelType::Gen,
        max_sessions,
        tokenizer_search_path: None,
    };

    let model = std::sync::Arc::new(Model::construct(&info).unwrap());

    Fixture {
        model,
        _checkpoint: checkpoint,
        _vocab: vocab,
    }
}
