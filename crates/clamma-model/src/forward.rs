//! The transformer forward engine (spec component E): one call evaluates
//! every layer for one token at one position, producing logits.
//!
//! Grounded on `original_source/session.c`'s `clamma_session_forward` and
//! its helpers (`session_rmsnorm`, `_session_matmul[_qt]`, `session_softmax`),
//! restructured around [`clamma_pool::WorkerPool`] dispatch/sync instead of
//! the source's raw semaphore pair, and matching on [`Weights`] once per
//! step rather than `switch (t->c.version)` at every matmul call site.

use clamma_kernel::{quantize_into, WeightSource};
use clamma_pool::WorkerPool;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::weights::Weights;

/// Preallocated per-quantized-vector scratch (`xq`/`hq` in spec.md §3).
pub struct QuantScratch {
    pub q: Vec<i8>,
    pub s: Vec<f32>,
}

impl QuantScratch {
    fn new(len: usize, group_size: usize) -> Self {
        let groups = if group_size == 0 { 0 } else { len / group_size };
        Self {
            q: vec![0i8; len],
            s: vec![0f32; groups],
        }
    }

    fn fill(&mut self, x: &[f32], group_size: usize) -> Result<()> {
        quantize_into(x, group_size, &mut self.q, &mut self.s)?;
        Ok(())
    }
}

/// All scratch state needed to run one forward step for one session,
/// including its private KV cache (spec.md §3's per-session buffers).
pub struct SessionBuffers {
    pub x: Vec<f32>,
    pub xb: Vec<f32>,
    pub xb2: Vec<f32>,
    pub hb: Vec<f32>,
    pub hb2: Vec<f32>,
    pub q: Vec<f32>,
    pub att: Vec<f32>,
    pub xq: QuantScratch,
    pub hq: QuantScratch,
    pub logits: Vec<f32>,
    /// `[n_layers, seq_len, kv_dim]`, flattened.
    pub key_cache: Vec<f32>,
    pub value_cache: Vec<f32>,
}

impl SessionBuffers {
    pub fn new(c: &ModelConfig) -> Self {
        let group_size = c.group_size.max(1);
        let kv_cache_len = c.n_layers * c.seq_len * c.kv_dim();
        Self {
            x: vec![0f32; c.dim],
            xb: vec![0f32; c.dim],
            xb2: vec![0f32; c.dim],
            hb: vec![0f32; c.hidden_dim],
            hb2: vec![0f32; c.hidden_dim],
            q: vec![0f32; c.dim],
            att: vec![0f32; c.n_heads * c.seq_len],
            xq: QuantScratch::new(c.dim, group_size),
            hq: QuantScratch::new(c.hidden_dim, group_size),
            logits: vec![0f32; c.vocab_size],
            key_cache: vec![0f32; kv_cache_len],
            value_cache: vec![0f32; kv_cache_len],
        }
    }

    /// Bytes this buffer set occupies, mirroring
    /// `original_source/txf.c`'s `clamma_txf_session_size`.
    pub fn size_bytes(c: &ModelConfig) -> usize {
        let f32_sz = std::mem::size_of::<f32>();
        let kv_dim = c.kv_dim();
        let mut bytes = (c.dim * 2 + c.vocab_size + c.n_layers * c.seq_len * kv_dim * 2
            + c.n_layers * c.seq_len)
            * f32_sz;
        if c.group_size > 0 {
            bytes += c.vocab_size + c.dim + c.dim + c.hidden_dim;
        }
        bytes += f32_sz * (c.dim * 5 + c.hidden_dim * 4 + c.n_layers * c.seq_len)
            + (c.dim + c.hidden_dim);
        bytes
    }
}

fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32]) {
    let ss: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (ss + 1e-5).sqrt();
    for i in 0..x.len() {
        out[i] = weight[i] * (inv * x[i]);
    }
}

fn softmax(x: &mut [f32]) {
    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Pairwise RoPE rotation of `q` (always) and `k` (only while `i < kv_dim`).
fn rope(q: &mut [f32], k: &mut [f32], pos: usize, head_size: usize, kv_dim: usize, dim: usize) {
    let mut i = 0;
    while i < dim {
        let head_dim = (i % head_size) as f32;
        let freq = 1.0 / 10000f32.powf(head_dim / head_size as f32);
        let angle = pos as f32 * freq;
        let (sin, cos) = angle.sin_cos();

        let (q0, q1) = (q[i], q[i + 1]);
        q[i] = q0 * cos - q1 * sin;
        q[i + 1] = q0 * sin + q1 * cos;

        if i < kv_dim {
            let (k0, k1) = (k[i], k[i + 1]);
            k[i] = k0 * cos - k1 * sin;
            k[i + 1] = k0 * sin + k1 * cos;
        }
        i += 2;
    }
}

#[allow(clippy::too_many_arguments)]
fn attention(
    buf: &mut SessionBuffers,
    c: &ModelConfig,
    layer: usize,
    pos: usize,
) {
    let kv_dim = c.kv_dim();
    let head_size = c.head_size();
    let kv_mul = c.kv_mul();
    let layer_off = layer * c.seq_len * kv_dim;

    for h in 0..c.n_heads {
        let q_h = &buf.q[h * head_size..(h + 1) * head_size];
        let att = &mut buf.att[h * c.seq_len..h * c.seq_len + pos + 1];

        for (n, slot) in att.iter_mut().enumerate() {
            let k_off = layer_off + n * kv_dim + (h / kv_mul) * head_size;
            let k_n = &buf.key_cache[k_off..k_off + head_size];
            let score: f32 = q_h.iter().zip(k_n).map(|(a, b)| a * b).sum();
            *slot = score / (head_size as f32).sqrt();
        }

        softmax(att);

        let att = buf.att[h * c.seq_len..h * c.seq_len + pos + 1].to_vec();
        let xb_h = &mut buf.xb[h * head_size..(h + 1) * head_size];
        xb_h.fill(0.0);
        for (n, &a) in att.iter().enumerate() {
            let v_off = layer_off + n * kv_dim + (h / kv_mul) * head_size;
            let v_n = &buf.value_cache[v_off..v_off + head_size];
            for i in 0..head_size {
                xb_h[i] += a * v_n[i];
            }
        }
    }
}

fn swiglu(hb: &mut [f32], hb2: &[f32]) {
    for i in 0..hb.len() {
        let t = hb[i];
        hb[i] = t * (1.0 / (1.0 + (-t).exp())) * hb2[i];
    }
}

/// Run one transformer step at `(token, pos)`, leaving the result in
/// `buf.logits`. Failure of any weight fetch or matmul dispatch is fatal
/// for the step (spec.md §4.E).
pub fn step(
    c: &ModelConfig,
    weights: &Weights,
    src: &dyn WeightSource,
    pool: &WorkerPool,
    buf: &mut SessionBuffers,
    token: u32,
    pos: usize,
) -> Result<()> {
    match weights {
        Weights::Float(w) => step_float(c, w, src, pool, buf, token, pos),
        Weights::Quant(w) => step_quant(c, w, src, pool, buf, token, pos),
    }
}

fn step_float(
    c: &ModelConfig,
    w: &crate::weights::FloatWeights,
    src: &dyn WeightSource,
    pool: &WorkerPool,
    buf: &mut SessionBuffers,
    token: u32,
    pos: usize,
) -> Result<()> {
    let dim = c.dim;
    let kv_dim = c.kv_dim();

    let embed_off = token as usize * dim;
    buf.x
        .copy_from_slice(&w.token_embedding[embed_off..embed_off + dim]);

    for l in 0..c.n_layers {
        let layer = &w.layers[l];
        rmsnorm(&mut buf.xb, &buf.x, &layer.rms_att);

        let kv_off = l * c.seq_len * kv_dim + pos * kv_dim;

        let wq = layer.wq.fetch(src)?;
        let wk = layer.wk.fetch(src)?;
        let wv = layer.wv.fetch(src)?;
        let hq = pool.dispatch_float(&mut buf.q, &buf.xb, wq.as_f32(), dim, dim)?;
        let hk = pool.dispatch_float(
            &mut buf.key_cache[kv_off..kv_off + kv_dim],
            &buf.xb,
            wk.as_f32(),
            dim,
            kv_dim,
        )?;
        let hv = pool.dispatch_float(
            &mut buf.value_cache[kv_off..kv_off + kv_dim],
            &buf.xb,
            wv.as_f32(),
            dim,
            kv_dim,
        )?;
        hq.sync()?;
        hk.sync()?;
        hv.sync()?;

        {
            let (k_slice, v_slice) = (
                &mut buf.key_cache[kv_off..kv_off + kv_dim],
                &mut buf.value_cache[kv_off..kv_off + kv_dim],
            );
            let _ = v_slice;
            rope(&mut buf.q, k_slice, pos, c.head_size(), kv_dim, dim);
        }

        attention(buf, c, l, pos);

        let wo = layer.wo.fetch(src)?;
        let ho = pool.dispatch_float(&mut buf.xb2, &buf.xb, wo.as_f32(), dim, dim)?;
        ho.sync()?;

        for i in 0..dim {
            buf.x[i] += buf.xb2[i];
        }

        rmsnorm(&mut buf.xb, &buf.x, &layer.rms_ffn);

        let w1 = layer.w1.fetch(src)?;
        let w3 = layer.w3.fetch(src)?;
        let h1 = pool.dispatch_float(&mut buf.hb, &buf.xb, w1.as_f32(), dim, c.hidden_dim)?;
        let h3 = pool.dispatch_float(&mut buf.hb2, &buf.xb, w3.as_f32(), dim, c.hidden_dim)?;
        h1.sync()?;
        h3.sync()?;

        swiglu(&mut buf.hb, &buf.hb2);

        let w2 = layer.w2.fetch(src)?;
        let h2 = pool.dispatch_float(&mut buf.xb, &buf.hb, w2.as_f32(), c.hidden_dim, dim)?;
        h2.sync()?;

        for i in 0..dim {
            buf.x[i] += buf.xb[i];
        }
    }

    rmsnorm_in_place(&mut buf.x, &w.rms_final);

    let hc = pool.dispatch_float(&mut buf.logits, &buf.x, &w.wcls, dim, c.vocab_size)?;
    hc.sync()?;

    Ok(())
}

fn step_quant(
    c: &ModelConfig,
    w: &crate::weights::QuantWeights,
    src: &dyn WeightSource,
    pool: &WorkerPool,
    buf: &mut SessionBuffers,
    token: u32,
    pos: usize,
) -> Result<()> {
    let dim = c.dim;
    let kv_dim = c.kv_dim();
    let g = c.group_size;

    let embed_off = token as usize * dim;
    buf.x
        .copy_from_slice(&w.token_embedding[embed_off..embed_off + dim]);

    for l in 0..c.n_layers {
        let layer = &w.layers[l];
        rmsnorm(&mut buf.xb, &buf.x, &layer.rms_att);
        buf.xq.fill(&buf.xb, g)?;

        let kv_off = l * c.seq_len * kv_dim + pos * kv_dim;

        let (wq_q, wq_s) = layer.wq.fetch(src)?;
        let (wk_q, wk_s) = layer.wk.fetch(src)?;
        let (wv_q, wv_s) = layer.wv.fetch(src)?;
        let hq = pool.dispatch_qt(
            &mut buf.q,
            &buf.xq.q,
            &buf.xq.s,
            wq_q.as_i8(),
            wq_s.as_f32(),
            dim,
            dim,
            g,
        )?;
        let hk = pool.dispatch_qt(
            &mut buf.key_cache[kv_off..kv_off + kv_dim],
            &buf.xq.q,
            &buf.xq.s,
            wk_q.as_i8(),
            wk_s.as_f32(),
            dim,
            kv_dim,
            g,
        )?;
        let hv = pool.dispatch_qt(
            &mut buf.value_cache[kv_off..kv_off + kv_dim],
            &buf.xq.q,
            &buf.xq.s,
            wv_q.as_i8(),
            wv_s.as_f32(),
            dim,
            kv_dim,
            g,
        )?;
        hq.sync()?;
        hk.sync()?;
        hv.sync()?;

        {
            let k_slice = &mut buf.key_cache[kv_off..kv_off + kv_dim];
            rope(&mut buf.q, k_slice, pos, c.head_size(), kv_dim, dim);
        }

        attention(buf, c, l, pos);

        buf.xq.fill(&buf.xb, g)?;
        let (wo_q, wo_s) = layer.wo.fetch(src)?;
        let ho = pool.dispatch_qt(
            &mut buf.xb2,
            &buf.xq.q,
            &buf.xq.s,
            wo_q.as_i8(),
            wo_s.as_f32(),
            dim,
            dim,
            g,
        )?;
        ho.sync()?;

        for i in 0..dim {
            buf.x[i] += buf.xb2[i];
        }

        rmsnorm(&mut buf.xb, &buf.x, &layer.rms_ffn);
        buf.xq.fill(&buf.xb, g)?;

        let (w1_q, w1_s) = layer.w1.fetch(src)?;
        let (w3_q, w3_s) = layer.w3.fetch(src)?;
        let h1 = pool.dispatch_qt(
            &mut buf.hb,
            &buf.xq.q,
            &buf.xq.s,
            w1_q.as_i8(),
            w1_s.as_f32(),
            dim,
            c.hidden_dim,
            g,
        )?;
        let h3 = pool.dispatch_qt(
            &mut buf.hb2,
            &buf.xq.q,
            &buf.xq.s,
            w3_q.as_i8(),
            w3_s.as_f32(),
            dim,
            c.hidden_dim,
            g,
        )?;
        h1.sync()?;
        h3.sync()?;

        swiglu(&mut buf.hb, &buf.hb2);
        buf.hq.fill(&buf.hb, g)?;

        let (w2_q, w2_s) = layer.w2.fetch(src)?;
        let h2 = pool.dispatch_qt(
            &mut buf.xb,
            &buf.hq.q,
            &buf.hq.s,
            w2_q.as_i8(),
            w2_s.as_f32(),
            c.hidden_dim,
            dim,
            g,
        )?;
        h2.sync()?;

        for i in 0..dim {
            buf.x[i] += buf.xb[i];
        }
    }

    rmsnorm_in_place(&mut buf.x, &w.rms_final);
    buf.xq.fill(&buf.x, g)?;

    let hc = pool.dispatch_qt(
        &mut buf.logits,
        &buf.xq.q,
        &buf.xq.s,
        &w.wcls.q,
        &w.wcls.s,
        dim,
        c.vocab_size,
        g,
    )?;
    hc.sync()?;

    Ok(())
}

fn rmsnorm_in_place(x: &mut [f32], weight: &[f32]) {
    let ss: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (ss + 1e-5).sqrt();
    for i in 0..x.len() {
        x[i] = weight[i] * (inv * x[i]);
    }
}
