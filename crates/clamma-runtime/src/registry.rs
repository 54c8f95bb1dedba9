//! Model lookup and the round-robin session step driver (spec component I),
//! grounded on `original_source/txf.c`'s `clamma_txf_by_name` and
//! `clamma_sessions_step_next`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use clamma_pool::WorkerPool;

use crate::error::{Result, RuntimeError};
use crate::model::Model;
use crate::session::{Session, SessionId};

/// Models registered with a [`crate::Runtime`], looked up by name.
#[derive(Default)]
pub struct ModelRegistry {
    models: Mutex<Vec<Arc<Model>>>,
}

impl ModelRegistry {
    pub fn insert(&self, model: Arc<Model>) {
        self.models.lock().unwrap().push(model);
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Model>> {
        self.models
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    pub fn remove(&self, name: &str) {
        self.models.lock().unwrap().retain(|m| m.name != name);
    }
}

/// Live sessions, processed one token at a time, round-robin.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<VecDeque<Session>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Session) {
        self.sessions.lock().unwrap().push_back(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flag the session with the given id for teardown at its next step.
    /// Returns whether a matching session was found. Does not remove the
    /// session immediately: the spec's contract is that cancellation is
    /// observed by the *next* `step_next` call for that session, not
    /// mid-step.
    pub fn cancel(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.iter_mut().find(|s| s.id() == id) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Step the session at the head of the queue. If it has more to do,
    /// requeue it at the tail (round-robin fairness); otherwise it is
    /// dropped here, which reports its throughput and releases its slot.
    ///
    /// Returns whether any session remains registered.
    pub fn step_next(&self, pool: &WorkerPool) -> Result<bool> {
        let mut session = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.pop_front() {
                Some(s) => s,
                None => return Err(RuntimeError::NoSessions),
            }
        };

        let more = session.step(pool)?;

        let mut sessions = self.sessions.lock().unwrap();
        if more {
            sessions.push_back(session);
        } else {
            drop(session);
        }
        Ok(!sessions.is_empty())
    }
}
