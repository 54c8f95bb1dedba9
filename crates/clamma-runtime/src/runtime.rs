//! The process-wide runtime: owns the worker pool and the model/session
//! registries explicitly, replacing `original_source/txf.c`'s file-scope
//! globals (`txf_head`, `sess_head`, `mut_sessions`) with a constructed
//! value the host holds for the engine's lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clamma_pool::WorkerPool;

use crate::error::{Result, RuntimeError};
use crate::model::{Model, ModelInfo};
use crate::registry::{ModelRegistry, SessionRegistry};
use crate::session::{QueryInfo, Session, SessionId};

/// The QKV projections are dispatched concurrently before their shared sync
/// point (`forward::step_float`/`step_quant`); the registry drives exactly
/// one session at a time, so three in-flight dispatches is the steady-state
/// high-water mark the job ring must absorb.
const DEFAULT_CONCURRENT_DISPATCHES: usize = 3;

pub struct Runtime {
    pool: WorkerPool,
    models: ModelRegistry,
    sessions: SessionRegistry,
    next_session_id: AtomicU64,
}

impl Runtime {
    /// Spawn `n_threads` worker threads (0 selects the source's default
    /// of 8) sharing a job ring sized for `n_threads` ×
    /// `DEFAULT_CONCURRENT_DISPATCHES` in-flight shards.
    pub fn new(n_threads: usize) -> Result<Runtime> {
        let n_threads = if n_threads == 0 { 8 } else { n_threads };
        let capacity = n_threads * DEFAULT_CONCURRENT_DISPATCHES;
        let pool = WorkerPool::new(n_threads, capacity)?;
        Ok(Runtime {
            pool,
            models: ModelRegistry::default(),
            sessions: SessionRegistry::default(),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn load_model(&self, info: &ModelInfo) -> Result<Arc<Model>> {
        let model = Arc::new(Model::construct(info)?);
        self.models.insert(model.clone());
        Ok(model)
    }

    pub fn unload_model(&self, name: &str) {
        self.models.remove(name);
    }

    pub fn lookup_model(&self, name: &str) -> Option<Arc<Model>> {
        self.models.lookup_by_name(name)
    }

    /// Running weight-cache totals for the named model, for host
    /// observability. `None` if the model isn't loaded or doesn't cache.
    pub fn cache_stats(&self, name: &str) -> Option<clamma_kernel::CacheStats> {
        self.models.lookup_by_name(name)?.cache_stats()
    }

    /// Construct and query a session against `model` in one call, matching
    /// the source's `clamma_session_construct` immediately followed by
    /// `clamma_session_query` in typical host usage. Returns a handle the
    /// caller can later pass to [`Self::cancel_session`].
    pub fn open_session(&self, model: Arc<Model>, query: QueryInfo) -> Result<SessionId> {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        let mut session = Session::construct(model, id)?;
        session.query(query)?;
        self.sessions.insert(session);
        Ok(id)
    }

    /// Flag `id` for teardown; observed by that session's next `step_next`
    /// turn, not synchronously. Returns whether `id` was a live session.
    pub fn cancel_session(&self, id: SessionId) -> bool {
        self.sessions.cancel(id)
    }

    /// Step one session (round-robin). Returns whether any session remains.
    pub fn step_next(&self) -> Result<bool> {
        if self.sessions.is_empty() {
            return Err(RuntimeError::NoSessions);
        }
        self.sessions.step_next(&self.pool)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
