use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};

/// Per-dispatch completion tracking, shared between the calling (session)
/// thread and every worker executing a shard of that dispatch.
///
/// `queued` mutates only while the ring mutex is held; the calling thread
/// waits on `cond` until it observes `queued == 0`.
pub(crate) struct SessionSync {
    pub(crate) queued: Mutex<usize>,
    pub(crate) cond: Condvar,
    pub(crate) failed: AtomicBool,
}

impl SessionSync {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            queued: Mutex::new(n),
            cond: Condvar::new(),
            failed: AtomicBool::new(false),
        }
    }
}

pub(crate) enum JobKind {
    Float {
        x: *const f32,
        w: *const f32,
        n: usize,
        d: usize,
    },
    Int8 {
        q_x: *const i8,
        s_x: *const f32,
        q_w: *const i8,
        s_w: *const f32,
        n: usize,
        d: usize,
        group_size: usize,
    },
}

/// One row-band shard of a matmul dispatch.
///
/// Holds raw pointers into the caller's buffers rather than borrowed slices
/// so it can be sent to a persistent worker thread whose lifetime outlives
/// any single dispatch. Soundness rests on two things together:
/// `DispatchHandle`'s lifetime parameter (the public `dispatch_*` API
/// borrows the caller's `x`/`w`/`xout` for the handle's lifetime, so the
/// compiler prevents the caller from mutating or dropping them before
/// `sync()` returns) and `run` below only ever materializing a `&mut` over
/// this job's own `[row_lo, row_hi)` band — never the full output buffer —
/// so two jobs from the same dispatch never hold overlapping `&mut` views
/// at once, regardless of which worker runs first.
pub(crate) struct Job {
    pub(crate) kind: JobKind,
    pub(crate) xout: *mut f32,
    pub(crate) row_lo: usize,
    pub(crate) row_hi: usize,
    pub(crate) sync: Arc<SessionSync>,
}

unsafe impl Send for Job {}

impl Job {
    pub(crate) fn run(&self) -> clamma_kernel::Result<()> {
        let band_len = self.row_hi - self.row_lo;
        let xout = unsafe {
            std::slice::from_raw_parts_mut(self.xout.add(self.row_lo), band_len)
        };

        match &self.kind {
            JobKind::Float { x, w, n, d } => {
                let x = unsafe { std::slice::from_raw_parts(*x, *n) };
                let w = unsafe { std::slice::from_raw_parts(*w, n * d) };
                clamma_kernel::matmul_range(xout, x, w, *n, *d, self.row_lo, self.row_hi)
            }
            JobKind::Int8 {
                q_x,
                s_x,
                q_w,
                s_w,
                n,
                d,
                group_size,
            } => {
                let groups = n / group_size;
                let q_x = unsafe { std::slice::from_raw_parts(*q_x, *n) };
                let s_x = unsafe { std::slice::from_raw_parts(*s_x, groups) };
                let q_w = unsafe { std::slice::from_raw_parts(*q_w, n * d) };
                let s_w = unsafe { std::slice::from_raw_parts(*s_w, groups * d) };
                clamma_kernel::matmul_qt_range(
                    xout,
                    q_x,
                    s_x,
                    q_w,
                    s_w,
                    *n,
                    *d,
                    *group_size,
                    self.row_lo,
                    self.row_hi,
                )
            }
        }
    }
}
