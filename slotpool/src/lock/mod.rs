//! The process-shared mutex embedded in the segment header.
//!
//! A process that dies while holding the lock leaves it held for every other
//! process. The mutex is not robust, so nothing here can detect or recover
//! from that. See `signals` for how termination by signal is kept out of
//! critical sections.

use std::error::Error;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use tracing::debug;

use crate::errors::{PoolError, Result};
use crate::layout::LOCK_AREA_SIZE;

/// Longest single timed wait. Between slices the waiter checks whether it
/// should give up.
const WAIT_SLICE: Duration = Duration::from_millis(10);

pub(crate) struct SegmentLock {
    inner: Box<dyn LockImpl>,
    timeout: Option<Duration>,
}

// SAFETY: the boxed lock only wraps a pointer to a pthread mutex configured
// for cross-process use, which is also safe to use from any thread.
unsafe impl Send for SegmentLock {}
unsafe impl Sync for SegmentLock {}

impl SegmentLock {
    /// Initializes a fresh mutex in `area` with process-shared attributes.
    ///
    /// # Safety
    /// `area` must point at `LOCK_AREA_SIZE` writable bytes inside the mapped
    /// segment that no other process is using yet.
    pub(crate) unsafe fn initialize(
        area: *mut u8,
        data: *mut u8,
        timeout: Option<Duration>,
    ) -> Result<SegmentLock> {
        check_fits(area)?;
        let (inner, used) = Mutex::new(area, data).map_err(PoolError::lock)?;
        debug!(used, "initialized process-shared mutex");
        Ok(SegmentLock { inner, timeout })
    }

    /// Attaches to a mutex that a creator already initialized.
    ///
    /// # Safety
    /// `area` must point at the lock area of an initialized segment.
    pub(crate) unsafe fn attach(
        area: *mut u8,
        data: *mut u8,
        timeout: Option<Duration>,
    ) -> Result<SegmentLock> {
        check_fits(area)?;
        let (inner, _) = Mutex::from_existing(area, data).map_err(PoolError::lock)?;
        Ok(SegmentLock { inner, timeout })
    }

    /// Blocks until the lock is held, the configured timeout passes, or
    /// `cancelled` returns true. Waiters are woken in whatever order the
    /// scheduler picks.
    pub(crate) fn acquire<C>(&self, cancelled: C) -> Result<LockGuard<'_>>
    where
        C: Fn() -> bool,
    {
        let deadline = self.timeout.map(|wait| (Instant::now() + wait, wait));
        loop {
            let slice = match deadline {
                None => WAIT_SLICE,
                Some((at, wait)) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(PoolError::LockTimeout(wait));
                    }
                    left.min(WAIT_SLICE)
                }
            };
            match self.inner.try_lock(Timeout::Val(slice)) {
                Ok(guard) => return Ok(guard),
                Err(err) if is_timeout(&*err) => {}
                Err(err) => return Err(PoolError::lock(err)),
            }
            if cancelled() {
                return Err(PoolError::Terminating);
            }
        }
    }
}

/// raw_sync reports pthread failures as "Failed to acquire mutex : <errno>".
fn is_timeout(err: &dyn Error) -> bool {
    err.to_string()
        .rsplit(':')
        .next()
        .and_then(|code| code.trim().parse::<i32>().ok())
        == Some(libc::ETIMEDOUT)
}

fn check_fits(area: *mut u8) -> Result<()> {
    let needed = Mutex::size_of(Some(area));
    if needed > LOCK_AREA_SIZE {
        return Err(PoolError::Lock(format!(
            "mutex needs {} bytes but the header reserves {}",
            needed, LOCK_AREA_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[repr(C, align(64))]
    struct Shared {
        area: UnsafeCell<[u8; LOCK_AREA_SIZE]>,
        busy: AtomicBool,
    }

    unsafe impl Sync for Shared {}

    #[test]
    fn attached_lock_excludes_the_creator() {
        let shared = Arc::new(Shared {
            area: UnsafeCell::new([0; LOCK_AREA_SIZE]),
            busy: AtomicBool::new(false),
        });
        let area = shared.area.get() as *mut u8;
        let creator = Arc::new(unsafe { SegmentLock::initialize(area, area, None) }.unwrap());
        let attached = Arc::new(unsafe { SegmentLock::attach(area, area, None) }.unwrap());

        let guard = creator.acquire(|| false).unwrap();
        let area_addr = area as usize;
        let timed = thread::spawn(move || {
            let area = area_addr as *mut u8;
            let lock = unsafe { SegmentLock::attach(area, area, Some(Duration::from_millis(20))) }.unwrap();
            let timed_out = matches!(lock.acquire(|| false), Err(PoolError::LockTimeout(_)));
            timed_out
        });
        assert!(timed.join().unwrap());
        drop(guard);

        let mut workers = Vec::new();
        for lock in [creator, attached] {
            let shared = shared.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _guard = lock.acquire(|| false).unwrap();
                    assert!(!shared.busy.swap(true, Ordering::SeqCst));
                    shared.busy.store(false, Ordering::SeqCst);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn cancelled_waiter_gives_up_the_lock_wait() {
        let shared = Arc::new(Shared {
            area: UnsafeCell::new([0; LOCK_AREA_SIZE]),
            busy: AtomicBool::new(false),
        });
        let area = shared.area.get() as *mut u8;
        let holder = unsafe { SegmentLock::initialize(area, area, None) }.unwrap();
        let _held = holder.acquire(|| false).unwrap();

        let area_addr = area as usize;
        let waiter = thread::spawn(move || {
            let area = area_addr as *mut u8;
            let lock = unsafe { SegmentLock::attach(area, area, None) }.unwrap();
            let started = Instant::now();
            let given_up = matches!(
                lock.acquire(|| started.elapsed() > Duration::from_millis(30)),
                Err(PoolError::Terminating)
            );
            given_up
        });
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn only_timed_out_waits_are_timeouts() {
        let timed_out: Box<dyn Error> =
            From::from(format!("Failed to acquire mutex : {}", libc::ETIMEDOUT));
        let invalid: Box<dyn Error> =
            From::from(format!("Failed to acquire mutex : {}", libc::EINVAL));
        assert!(is_timeout(&*timed_out));
        assert!(!is_timeout(&*invalid));
        assert!(matches!(PoolError::lock(invalid), PoolError::Lock(_)));
    }
}
