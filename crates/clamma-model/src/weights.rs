//! Weight layout and loading: materializes the small, always-needed tensors
//! (norms, token embedding) eagerly and records byte offsets for the large
//! per-layer projection/FFN matrices, which the forward engine fetches
//! on demand through the weight accessor (spec component A) at each step.

use std::sync::Arc;

use clamma_kernel::{QuantizedTensor, Result as KernelResult, WeightSource};

use crate::config::{ModelConfig, ModelVersion};

/// Reference to a float matrix, addressed by byte offset into the weight
/// data region. Shape is `[d, n]` row-major (`d` output rows of `n` inputs).
#[derive(Debug, Clone, Copy)]
pub struct FloatMatrixRef {
    pub offset: u64,
    pub n: usize,
    pub d: usize,
}

impl FloatMatrixRef {
    pub fn fetch(&self, src: &dyn WeightSource) -> KernelResult<clamma_kernel::WeightRef> {
        src.fetch(self.offset, self.n * self.d * std::mem::size_of::<f32>())
    }
}

/// Reference to a quantized matrix: `q` and `s` live at independent offsets
/// and are fetched separately (spec.md §9's resolved sizing question).
#[derive(Debug, Clone, Copy)]
pub struct QuantMatrixRef {
    pub q_offset: u64,
    pub s_offset: u64,
    pub n: usize,
    pub d: usize,
    pub group_size: usize,
}

impl QuantMatrixRef {
    pub fn fetch(
        &self,
        src: &dyn WeightSource,
    ) -> KernelResult<(clamma_kernel::WeightRef, clamma_kernel::WeightRef)> {
        let q = src.fetch(self.q_offset, self.n * self.d)?;
        let groups = (self.n * self.d) / self.group_size;
        let s = src.fetch(self.s_offset, groups * std::mem::size_of::<f32>())?;
        Ok((q, s))
    }
}

pub struct LayerWeights<M> {
    pub rms_att: Vec<f32>,
    pub wq: M,
    pub wk: M,
    pub wv: M,
    pub wo: M,
    pub rms_ffn: Vec<f32>,
    pub w1: M,
    pub w2: M,
    pub w3: M,
}

pub struct FloatWeights {
    pub token_embedding: Arc<Vec<f32>>,
    pub layers: Vec<LayerWeights<FloatMatrixRef>>,
    pub rms_final: Vec<f32>,
    pub wcls: Arc<Vec<f32>>,
}

pub struct QuantWeights {
    pub token_embedding: Vec<f32>,
    pub layers: Vec<LayerWeights<QuantMatrixRef>>,
    pub rms_final: Vec<f32>,
    pub wcls: Arc<QuantizedTensor>,
}

pub enum Weights {
    Float(FloatWeights),
    Quant(QuantWeights),
}

fn read_f32_vec(src: &dyn WeightSource, offset: u64, n: usize) -> KernelResult<Vec<f32>> {
    let r = src.fetch(offset, n * std::mem::size_of::<f32>())?;
    Ok(r.as_f32().to_vec())
}

impl Weights {
    /// Build a `Weights` value from a weight accessor, per the checkpoint
    /// layout spec.md §6 defines for each version.
    pub fn load(src: &dyn WeightSource, config: &ModelConfig) -> KernelResult<Weights> {
        match config.version {
            ModelVersion::FloatV1 => Self::load_float(src, config).map(Weights::Float),
            ModelVersion::Int8V2 => Self::load_int8(src, config).map(Weights::Quant),
        }
    }

    fn load_float(src: &dyn WeightSource, c: &ModelConfig) -> KernelResult<FloatWeights> {
        let mut off = 0u64;
        let take = |off: &mut u64, n: usize| {
            let o = *off;
            *off += (n * std::mem::size_of::<f32>()) as u64;
            o
        };

        let embedding_offset = take(&mut off, c.vocab_size * c.dim);
        let token_embedding = Arc::new(read_f32_vec(src, embedding_offset, c.vocab_size * c.dim)?);

        let rms_att_offset = take(&mut off, c.n_layers * c.dim);
        let wq_offset = take(&mut off, c.n_layers * c.dim * c.dim);
        let wk_offset = take(&mut off, c.n_layers * c.dim * c.kv_dim());
        let wv_offset = take(&mut off, c.n_layers * c.dim * c.kv_dim());
        let wo_offset = take(&mut off, c.n_layers * c.dim * c.dim);
        let rms_ffn_offset = take(&mut off, c.n_layers * c.dim);
        let w1_offset = take(&mut off, c.n_layers * c.dim * c.hidden_dim);
        let w2_offset = take(&mut off, c.n_layers * c.dim * c.hidden_dim);
        let w3_offset = take(&mut off, c.n_layers * c.dim * c.hidden_dim);
        let rms_final_offset = take(&mut off, c.dim);
        // Two freq_cis tables follow; skipped, RoPE angles are recomputed.
        take(&mut off, c.seq_len * c.head_size() / 2);
        take(&mut off, c.seq_len * c.head_size() / 2);
        let wcls_offset = take(&mut off, c.vocab_size * c.dim);

        let rms_final = read_f32_vec(src, rms_final_offset, c.dim)?;

        let mut layers = Vec::with_capacity(c.n_layers);
        for l in 0..c.n_layers {
            let rms_att = read_f32_vec(src, rms_att_offset + (l * c.dim * 4) as u64, c.dim)?;
            let rms_ffn = read_f32_vec(src, rms_ffn_offset + (l * c.dim * 4) as u64, c.dim)?;
            layers.push(LayerWeights {
                rms_att,
                wq: FloatMatrixRef {
                    offset: wq_offset + (l * c.dim * c.dim * 4) as u64,
                    n: c.dim,
                    d: c.dim,
                },
                wk: FloatMatrixRef {
                    offset: wk_offset + (l * c.dim * c.kv_dim() * 4) as u64,
                    n: c.dim,
                    d: c.kv_dim(),
                },
                wv: FloatMatrixRef {
                    offset: wv_offset + (l * c.dim * c.kv_dim() * 4) as u64,
                    n: c.dim,
                    d: c.kv_dim(),
                },
                wo: FloatMatrixRef {
                    offset: wo_offset + (l * c.dim * c.dim * 4) as u64,
                    n: c.dim,
                    d: c.dim,
                },
                rms_ffn,
                w1: FloatMatrixRef {
                    offset: w1_offset + (l * c.dim * c.hidden_dim * 4) as u64,
                    n: c.dim,
                    d: c.hidden_dim,
                },
                w2: FloatMatrixRef {
                    offset: w2_offset + (l * c.dim * c.hidden_dim * 4) as u64,
                    n: c.hidden_dim,
                    d: c.dim,
                },
                w3: FloatMatrixRef {
                    offset: w3_offset + (l * c.dim * c.hidden_dim * 4) as u64,
                    n: c.dim,
                    d: c.hidden_dim,
                },
            });
        }

        let wcls = if c.shared_classifier {
            token_embedding.clone()
        } else {
            Arc::new(read_f32_vec(src, wcls_offset, c.vocab_size * c.dim)?)
        };

        Ok(FloatWeights {
            token_embedding,
            layers,
            rms_final,
            wcls,
        })
    }

    fn load_int8(src: &dyn WeightSource, c: &ModelConfig) -> KernelResult<QuantWeights> {
        let g = c.group_size;
        let mut off = 0u64;
        let take_f32 = |off: &mut u64, n: usize| {
            let o = *off;
            *off += (n * std::mem::size_of::<f32>()) as u64;
            o
        };

        let rms_att_offset = take_f32(&mut off, c.n_layers * c.dim);
        let rms_ffn_offset = take_f32(&mut off, c.n_layers * c.dim);
        let rms_final_offset = take_f32(&mut off, c.dim);
        let rms_final = read_f32_vec(src, rms_final_offset, c.dim)?;

        // quantized tensors are stored as q (i8 bytes) then s (f32 scales)
        let mut take_qt = |off: &mut u64, n: usize| -> QuantMatrixRef {
            let q_offset = *off;
            *off += n as u64;
            let s_offset = *off;
            *off += ((n / g) * std::mem::size_of::<f32>()) as u64;
            QuantMatrixRef {
                q_offset,
                s_offset,
                n: 0,
                d: 0,
                group_size: g,
            }
        };

        let emb_ref = take_qt(&mut off, c.vocab_size * c.dim);
        let emb_ref = QuantMatrixRef {
            n: c.dim,
            d: c.vocab_size,
            ..emb_ref
        };
        let emb_q = src.fetch(emb_ref.q_offset, c.vocab_size * c.dim)?;
        let emb_s = src.fetch(
            emb_ref.s_offset,
            (c.vocab_size * c.dim / g) * std::mem::size_of::<f32>(),
        )?;
        let embedding_qt = QuantizedTensor {
            q: emb_q.as_i8().to_vec(),
            s: emb_s.as_f32().to_vec(),
            group_size: g,
        };
        let token_embedding = clamma_kernel::dequantize(&embedding_qt);

        let mut wq_refs = Vec::with_capacity(c.n_layers);
        let mut wk_refs = Vec::with_capacity(c.n_layers);
        let mut wv_refs = Vec::with_capacity(c.n_layers);
        let mut wo_refs = Vec::with_capacity(c.n_layers);
        for _ in 0..c.n_layers {
            wq_refs.push(QuantMatrixRef {
                n: c.dim,
                d: c.dim,
                ..take_qt(&mut off, c.dim * c.dim)
            });
        }
        for _ in 0..c.n_layers {
            wk_refs.push(QuantMatrixRef {
                n: c.dim,
                d: c.kv_dim(),
                ..take_qt(&mut off, c.dim * c.kv_dim())
            });
        }
        for _ in 0..c.n_layers {
            wv_refs.push(QuantMatrixRef {
                n: c.dim,
                d: c.kv_dim(),
                ..take_qt(&mut off, c.dim * c.kv_dim())
            });
        }
        for _ in 0..c.n_layers {
            wo_refs.push(QuantMatrixRef {
                n: c.dim,
                d: c.dim,
                ..take_qt(&mut off, c.dim * c.dim)
            });
        }
        let mut w1_refs = Vec::with_capacity(c.n_layers);
        let mut w2_refs = Vec::with_capacity(c.n_layers);
        let mut w3_refs = Vec::with_capacity(c.n_layers);
        for _ in 0..c.n_layers {
            w1_refs.push(QuantMatrixRef {
                n: c.dim,
                d: c.hidden_dim,
                ..take_qt(&mut off, c.dim * c.hidden_dim)
            });
        }
        for _ in 0..c.n_layers {
            w2_refs.push(QuantMatrixRef {
                n: c.hidden_dim,
                d: c.dim,
                ..take_qt(&mut off, c.hidden_dim * c.dim)
            });
        }
        for _ in 0..c.n_layers {
            w3_refs.push(QuantMatrixRef {
                n: c.dim,
                d: c.hidden_dim,
                ..take_qt(&mut off, c.dim * c.hidden_dim)
            });
        }

        let wcls_ref = QuantMatrixRef {
            n: c.dim,
            d: c.vocab_size,
            ..take_qt(&mut off, c.vocab_size * c.dim)
        };

        let mut layers = Vec::with_capacity(c.n_layers);
        for l in 0..c.n_layers {
            let rms_att = read_f32_vec(src, rms_att_offset + (l * c.dim * 4) as u64, c.dim)?;
            let rms_ffn = read_f32_vec(src, rms_ffn_offset + (l * c.dim * 4) as u64, c.dim)?;
            layers.push(LayerWeights {
                rms_att,
                wq: wq_refs[l],
                wk: wk_refs[l],
                wv: wv_refs[l],
                wo: wo_refs[l],
                rms_ffn,
                w1: w1_refs[l],
                w2: w2_refs[l],
                w3: w3_refs[l],
            });
        }

        let wcls = if c.shared_classifier {
            Arc::new(embedding_qt)
        } else {
            let (q, s) = wcls_ref.fetch(src)?;
            Arc::new(QuantizedTensor {
                q: q.as_i8().to_vec(),
                s: s.as_f32().to_vec(),
                group_size: g,
            })
        };

        Ok(QuantWeights {
            token_embedding,
            layers,
            rms_final,
            wcls,
        })
    }
}
