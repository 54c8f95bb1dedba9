use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{PoolError, Result};
use crate::job::{Job, JobKind, SessionSync};

/// Process-wide matmul worker pool (spec component D).
///
/// Cloning a `WorkerPool` is cheap and increments the underlying refcount;
/// the worker threads are joined when the last clone is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    ring: Mutex<VecDeque<Job>>,
    ring_cv: Condvar,
    capacity: usize,
    n_threads: usize,
    exiting: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `n_threads` workers sharing a job ring of the given capacity.
    ///
    /// `capacity` must exceed `n_threads` times the number of dispatches
    /// that may be in flight concurrently; callers size it from their own
    /// concurrency bounds (see `Runtime`'s construction parameters).
    pub fn new(n_threads: usize, capacity: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(PoolError::ZeroThreads);
        }

        let inner = Arc::new(PoolInner {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            ring_cv: Condvar::new(),
            capacity,
            n_threads,
            exiting: AtomicBool::new(false),
            handles: Mutex::new(Vec::with_capacity(n_threads)),
        });

        let mut handles = Vec::with_capacity(n_threads);
        for id in 0..n_threads {
            let inner = inner.clone();
            handles.push(std::thread::spawn(move || worker_loop(id, inner)));
        }
        *inner.handles.lock().unwrap() = handles;

        tracing::info!(n_threads, capacity, "worker pool started");

        Ok(Self { inner })
    }

    pub fn n_threads(&self) -> usize {
        self.inner.n_threads
    }

    /// Dispatch a float matmul across the pool, splitting `[0, d)` into
    /// `n_threads` contiguous row bands. Returns immediately; callers must
    /// call [`DispatchHandle::sync`] before touching `xout` again.
    pub fn dispatch_float<'a>(
        &self,
        xout: &'a mut [f32],
        x: &'a [f32],
        w: &'a [f32],
        n: usize,
        d: usize,
    ) -> Result<DispatchHandle<'a>> {
        let kind_for = |_row_lo: usize| JobKind::Float {
            x: x.as_ptr(),
            w: w.as_ptr(),
            n,
            d,
        };
        self.inner.dispatch(xout.as_mut_ptr(), d, kind_for)
    }

    /// Quantized counterpart of [`Self::dispatch_float`].
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_qt<'a>(
        &self,
        xout: &'a mut [f32],
        q_x: &'a [i8],
        s_x: &'a [f32],
        q_w: &'a [i8],
        s_w: &'a [f32],
        n: usize,
        d: usize,
        group_size: usize,
    ) -> Result<DispatchHandle<'a>> {
        let kind_for = |_row_lo: usize| JobKind::Int8 {
            q_x: q_x.as_ptr(),
            s_x: s_x.as_ptr(),
            q_w: q_w.as_ptr(),
            s_w: s_w.as_ptr(),
            n,
            d,
            group_size,
        };
        self.inner.dispatch(xout.as_mut_ptr(), d, kind_for)
    }
}

impl PoolInner {
    fn dispatch<'a, F: Fn(usize) -> JobKind>(
        &self,
        xout: *mut f32,
        d: usize,
        kind_for: F,
    ) -> Result<DispatchHandle<'a>> {
        let n_threads = self.n_threads;
        let sync = Arc::new(SessionSync::new(n_threads));
        let band = d.div_ceil(n_threads);

        let mut ring = self.ring.lock().unwrap();
        if ring.len() + n_threads > self.capacity {
            return Err(PoolError::RingOverflow {
                capacity: self.capacity,
                n_threads,
                queued: ring.len(),
            });
        }

        let mut row_lo = 0;
        for t in 0..n_threads {
            let row_hi = if t == n_threads - 1 { d } else { (row_lo + band).min(d) };
            ring.push_back(Job {
                kind: kind_for(row_lo),
                xout,
                row_lo,
                row_hi,
                sync: sync.clone(),
            });
            row_lo = row_hi;
        }
        drop(ring);
        self.ring_cv.notify_all();

        Ok(DispatchHandle {
            sync,
            _marker: PhantomData,
        })
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.ring_cv.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
        tracing::info!("worker pool stopped");
    }
}

fn worker_loop(_id: usize, inner: Arc<PoolInner>) {
    loop {
        let job = {
            let mut ring = inner.ring.lock().unwrap();
            loop {
                if let Some(job) = ring.pop_front() {
                    break Some(job);
                }
                if inner.exiting.load(Ordering::SeqCst) {
                    break None;
                }
                ring = inner.ring_cv.wait(ring).unwrap();
            }
        };

        let Some(job) = job else {
            return;
        };

        if job.run().is_err() {
            job.sync.failed.store(true, Ordering::SeqCst);
        }

        let mut queued = job.sync.queued.lock().unwrap();
        *queued -= 1;
        if *queued == 0 {
            job.sync.cond.notify_all();
        }
    }
}

/// A pending dispatch. Borrows the caller's buffers for its lifetime so they
/// cannot be touched again until [`Self::sync`] returns.
pub struct DispatchHandle<'a> {
    sync: Arc<SessionSync>,
    _marker: PhantomData<&'a mut ()>,
}

impl<'a> DispatchHandle<'a> {
    /// Block until every shard of this dispatch has completed.
    pub fn sync(self) -> Result<()> {
        let mut queued = self.sync.queued.lock().unwrap();
        while *queued > 0 {
            queued = self.sync.cond.wait(queued).unwrap();
        }
        if self.sync.failed.load(Ordering::SeqCst) {
            return Err(PoolError::Kernel(clamma_kernel::KernelError::DimMismatch(
                "matmul shard failed during dispatch".to_string(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_float_computes_correct_result() {
        let pool = WorkerPool::new(4, 64).unwrap();
        let n = 8;
        let d = 16;
        let w: Vec<f32> = (0..n * d).map(|i| (i % 5) as f32).collect();
        let x: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let mut xout = vec![0.0; d];

        let handle = pool.dispatch_float(&mut xout, &x, &w, n, d).unwrap();
        handle.sync().unwrap();

        let mut expected = vec![0.0; d];
        clamma_kernel::matmul_range(&mut expected, &x, &w, n, d, 0, d).unwrap();
        assert_eq!(xout, expected);
    }

    #[test]
    fn ring_overflow_is_reported() {
        let pool = WorkerPool::new(4, 4).unwrap();
        let n = 2;
        let d = 2;
        let w = vec![1.0; n * d];
        let x = vec![1.0; n];
        let mut xout1 = vec![0.0; d];
        let mut xout2 = vec![0.0; d];

        let h1 = pool.dispatch_float(&mut xout1, &x, &w, n, d).unwrap();
        let err = pool.dispatch_float(&mut xout2, &x, &w, n, d);
        assert!(err.is_err());
        h1.sync().unwrap();
    }

    #[test]
    fn many_dispatches_from_many_threads_complete() {
        let pool = WorkerPool::new(4, 256).unwrap();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = pool.clone();
                scope.spawn(move || {
                    let n = 16;
                    let d = 32;
                    let w = vec![1.0; n * d];
                    let x = vec![1.0; n];
                    let mut xout = vec![0.0; d];
                    let handle = pool.dispatch_float(&mut xout, &x, &w, n, d).unwrap();
                    handle.sync().unwrap();
                    assert_eq!(xout, vec![n as f32; d]);
                });
            }
        });
    }
}
