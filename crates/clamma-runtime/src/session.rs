//! Per-conversation session state and the step loop (spec component H),
//! grounded on `original_source/session.c`'s `clamma_session_construct`,
//! `clamma_session_query`, and the body of `clamma_sessions_step_next`.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clamma_model::{forward, SessionBuffers, TOK_BOS, TOK_EOS, TOK_UNK};
use clamma_pool::WorkerPool;
use clamma_sampler::{Sampler, SamplerParams};

use crate::error::Result;
use crate::model::{Model, ModelType};

/// Opaque handle identifying a session for `cancel`, distinct from the
/// round-robin queue position the registry keeps it at internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

/// Emits one decoded fragment of generated text, as raw bytes: a
/// byte-fallback/hex-escape fragment may not be valid UTF-8 on its own, and
/// the emission filter needs the raw byte to apply its printable/whitespace
/// test. Mirrors the source's `issue_cb_t`; the default implementation
/// writes to stdout.
pub type IssueCallback = Box<dyn FnMut(&[u8]) + Send>;

fn default_issue_callback() -> IssueCallback {
    Box::new(|piece: &[u8]| {
        use std::io::Write;
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(piece);
        let _ = stdout.flush();
    })
}

/// Query parameters for [`Session::query`]; unset fields take the defaults
/// spec.md §4.H describes.
#[derive(Default)]
pub struct QueryInfo {
    pub system: Option<String>,
    pub prompt: Option<String>,
    pub temperature: f32,
    pub topp: f32,
    pub rng_seed: u64,
    /// `0` means "use `seq_len`".
    pub limit: usize,
    pub issue_cb: Option<IssueCallback>,
}

/// One conversation's mutable state: scratch buffers, KV cache, prompt
/// tokens, and the sampler. Not `Sync`; callers serialize steps externally
/// (the registry drives exactly one stepping thread).
pub struct Session {
    id: SessionId,
    model: Arc<Model>,
    buf: SessionBuffers,
    sampler: Option<Sampler>,
    tokens: Vec<u32>,
    ct: usize,
    pos: usize,
    limit: usize,
    token: u32,
    token_count: u64,
    start: Instant,
    client_gone: bool,
    issue_cb: IssueCallback,
}

impl Session {
    /// Register a new session against `model`, rejecting construction once
    /// `model.max_sessions` (if nonzero) is already reached.
    pub fn construct(model: Arc<Model>, id: SessionId) -> Result<Session> {
        model.try_reserve_session()?;
        let buf = SessionBuffers::new(&model.config);
        Ok(Session {
            id,
            model,
            buf,
            sampler: None,
            tokens: Vec::new(),
            ct: 0,
            pos: 0,
            limit: 0,
            token: TOK_UNK,
            token_count: 0,
            start: Instant::now(),
            client_gone: false,
            issue_cb: default_issue_callback(),
        })
    }

    /// Prime the session: resolve sampler parameters, build the prompt
    /// string from `info.system`/`info.prompt` per the model's template,
    /// and encode it (`add_bos = true, add_eos = false`).
    pub fn query(&mut self, info: QueryInfo) -> Result<()> {
        let temperature = info.temperature.max(0.0);
        let topp = if (0.0..=1.0).contains(&info.topp) {
            info.topp
        } else {
            0.9
        };
        let seed = if info.rng_seed != 0 {
            info.rng_seed
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(1)
        };

        self.sampler = Some(Sampler::new(
            self.model.config.vocab_size,
            SamplerParams {
                temperature,
                topp,
                seed,
            },
        ));
        if let Some(cb) = info.issue_cb {
            self.issue_cb = cb;
        }

        let system = info.system.as_deref().unwrap_or("");
        let prompt = info.prompt.as_deref().unwrap_or("");
        let text = match self.model.model_type {
            ModelType::Gen => format!("{system}\n{prompt}\n"),
            ModelType::Chat => {
                if info.system.is_some() {
                    format!("[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{prompt} [/INST]\n")
                } else {
                    format!("[INST] {prompt} [/INST]\n")
                }
            }
        };

        let tokens = self.model.vocab.encode(&text, true, false)?;
        self.ct = tokens.len();
        self.tokens = tokens;

        let requested = if info.limit == 0 || info.limit > self.model.config.seq_len {
            self.model.config.seq_len
        } else {
            info.limit
        };
        self.limit = requested;
        self.token = self.tokens[0];
        self.pos = 0;
        self.start = Instant::now();
        self.token_count = 0;

        tracing::info!(
            model = %self.model.name,
            temperature,
            topp,
            seed,
            "session query"
        );

        Ok(())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Mark the session for teardown on its next step, without blocking.
    pub fn cancel(&mut self) {
        self.client_gone = true;
    }

    /// Run one forward step, decode and emit the resulting fragment, and
    /// report whether the session should continue (`false` means it has
    /// reached end-of-session and must be destroyed by the caller).
    pub fn step(&mut self, pool: &WorkerPool) -> Result<bool> {
        if self.client_gone || self.pos >= self.limit {
            self.issue_eos();
            return Ok(false);
        }

        let is_prompt = self.pos + 1 < self.ct;

        // A step failure (weight fetch or matmul dispatch) is fatal for the
        // session, not for the process: report it as an ordinary
        // end-of-session rather than propagating the error.
        if let Err(e) = forward::step(
            &self.model.config,
            &self.model.weights,
            self.model.source.as_ref(),
            pool,
            &mut self.buf,
            self.token,
            self.pos,
        ) {
            tracing::warn!(model = %self.model.name, error = %e, "forward step failed, terminating session");
            self.issue_eos();
            return Ok(false);
        }
        self.pos += 1;

        if self.pos >= self.limit {
            self.issue_eos();
            return Ok(false);
        }

        let tnext = if is_prompt {
            self.tokens[self.pos]
        } else {
            self.sampler
                .as_mut()
                .expect("session must be queried before stepping")
                .sample(&mut self.buf.logits)
        };

        if tnext == TOK_UNK || tnext == TOK_BOS {
            self.issue_eos();
            return Ok(false);
        }

        self.token_count += 1;

        if !is_prompt {
            let piece = self.model.vocab.decode(self.token, tnext);
            self.issue(&piece);
        }

        if self.pos > 5 && tnext == TOK_EOS {
            self.issue_eos();
            return Ok(false);
        }

        self.token = tnext;
        Ok(true)
    }

    fn issue_eos(&mut self) {
        self.issue(&[TOK_EOS as u8]);
    }

    /// `clamma_session_issue`'s emission filter: suppress single-byte
    /// fragments that are neither printable nor whitespace (EOS excluded
    /// from the filter so termination is always observable). Cancellation
    /// (`client_gone`) stops the session from taking further steps but must
    /// not swallow the final EOS fragment the teardown step delivers.
    fn issue(&mut self, piece: &[u8]) {
        if let [byte] = piece {
            let is_eos = *byte as u32 == TOK_EOS;
            if !is_eos && !(byte.is_ascii_graphic() || byte.is_ascii_whitespace()) {
                return;
            }
        }
        (self.issue_cb)(piece);
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    pub fn tokens_per_sec(&self) -> f32 {
        let ms = self.start.elapsed().as_millis().max(1) as f32;
        self.token_count as f32 * 1000.0 / ms
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::info!(
            model = %self.model.name,
            tokens = self.token_count,
            tokens_per_sec = self.tokens_per_sec(),
            "session finished"
        );
        self.model.release_session();
    }
}
