//! Permit-based exclusive access to a connection's wire session.
//!
//! Exactly one [`AccessPermit`] exists per lock at a time. Blocking callers
//! use [`ExclusiveAccessLock::acquire`]; async callers use
//! [`ExclusiveAccessLock::acquire_async`], which never parks the runtime
//! thread.
//!
//! A permit taken with `releasable_from_any_thread = false` may only be
//! handed back through [`ExclusiveAccessLock::release`] on the thread that
//! acquired it. Dropping a permit always releases the lock.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

/// Errors from [`ExclusiveAccessLock`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LockError {
    /// The lock was not released within the timeout.
    #[error("timed out after {0:?} waiting for exclusive access")]
    Timeout(Duration),

    /// A thread-affine permit was released on another thread.
    #[error("permit owned by thread {owner:?} released on thread {current:?}")]
    ForeignThreadRelease {
        /// Thread that acquired the permit.
        owner: ThreadId,
        /// Thread that attempted the release.
        current: ThreadId,
    },

    /// The permit was issued by a different lock.
    #[error("permit does not belong to this lock")]
    ForeignPermit,
}

/// A release that was refused. The permit, and with it the lock, stays held.
#[derive(Debug)]
pub struct RejectedRelease {
    reason: LockError,
    permit: AccessPermit,
}

impl RejectedRelease {
    /// Why the release was refused.
    #[must_use]
    pub fn reason(&self) -> &LockError {
        &self.reason
    }

    /// Take back the still-held permit.
    #[must_use]
    pub fn into_permit(self) -> AccessPermit {
        self.permit
    }
}

impl std::fmt::Display for RejectedRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "release rejected: {}", self.reason)
    }
}

impl std::error::Error for RejectedRelease {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

impl From<RejectedRelease> for LockError {
    fn from(rejected: RejectedRelease) -> Self {
        rejected.reason
    }
}

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    close_owner: Option<ThreadId>,
}

/// Lock serializing writes to one connection.
#[derive(Debug, Default)]
pub struct ExclusiveAccessLock {
    state: Mutex<LockState>,
    available: Condvar,
    notify: Notify,
}

impl ExclusiveAccessLock {
    /// Create an unlocked lock.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block the current thread until the lock is free.
    pub fn acquire(self: &Arc<Self>, releasable_from_any_thread: bool) -> AccessPermit {
        let mut state = self.state.lock();
        while state.held {
            self.available.wait(&mut state);
        }
        state.held = true;
        drop(state);
        self.permit(releasable_from_any_thread)
    }

    /// Block the current thread until the lock is free or `timeout` passes.
    pub fn acquire_timeout(
        self: &Arc<Self>,
        releasable_from_any_thread: bool,
        timeout: Duration,
    ) -> Result<AccessPermit, LockError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.held {
            if self.available.wait_until(&mut state, deadline).timed_out() && state.held {
                return Err(LockError::Timeout(timeout));
            }
        }
        state.held = true;
        drop(state);
        Ok(self.permit(releasable_from_any_thread))
    }

    /// Take the lock if it is free.
    pub fn try_acquire(self: &Arc<Self>, releasable_from_any_thread: bool) -> Option<AccessPermit> {
        let mut state = self.state.lock();
        if state.held {
            return None;
        }
        state.held = true;
        drop(state);
        Some(self.permit(releasable_from_any_thread))
    }

    /// Wait asynchronously until the lock is free.
    pub async fn acquire_async(self: &Arc<Self>, releasable_from_any_thread: bool) -> AccessPermit {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire(releasable_from_any_thread) {
                return permit;
            }
            notified.await;
        }
    }

    /// Hand a permit back.
    ///
    /// # Errors
    ///
    /// Refuses, returning the permit, if the permit came from another lock
    /// or is thread-affine and this is not its acquiring thread.
    pub fn release(self: &Arc<Self>, mut permit: AccessPermit) -> Result<(), RejectedRelease> {
        if !Arc::ptr_eq(self, &permit.lock) {
            return Err(RejectedRelease {
                reason: LockError::ForeignPermit,
                permit,
            });
        }
        if let Some(owner) = permit.owner_thread {
            let current = thread::current().id();
            if owner != current {
                return Err(RejectedRelease {
                    reason: LockError::ForeignThreadRelease { owner, current },
                    permit,
                });
            }
        }
        permit.released = true;
        self.unlock();
        Ok(())
    }

    /// Whether the current thread holds the close right.
    #[must_use]
    pub fn owns_for_close(&self) -> bool {
        let state = self.state.lock();
        state.held && state.close_owner == Some(thread::current().id())
    }

    /// Move the close right to the current thread.
    ///
    /// Needed after a permit crosses to another execution context, since the
    /// close right reads true only on the thread that set it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::ForeignPermit`] if `permit` came from another lock.
    pub fn transfer_close_ownership(
        self: &Arc<Self>,
        permit: &AccessPermit,
    ) -> Result<(), LockError> {
        if !Arc::ptr_eq(self, &permit.lock) {
            return Err(LockError::ForeignPermit);
        }
        let mut state = self.state.lock();
        if state.close_owner.is_some() {
            state.close_owner = Some(thread::current().id());
        }
        Ok(())
    }

    /// Whether any permit is outstanding.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    fn permit(self: &Arc<Self>, releasable_from_any_thread: bool) -> AccessPermit {
        let owner_thread = (!releasable_from_any_thread).then(|| thread::current().id());
        tracing::trace!(?owner_thread, "exclusive access acquired");
        AccessPermit {
            lock: Arc::clone(self),
            owner_thread,
            released: false,
        }
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        state.held = false;
        state.close_owner = None;
        drop(state);
        self.available.notify_one();
        self.notify.notify_waiters();
        tracing::trace!("exclusive access released");
    }
}

/// Proof of exclusive access. Dropping it releases the lock.
#[derive(Debug)]
#[must_use = "dropping the permit releases the lock"]
pub struct AccessPermit {
    lock: Arc<ExclusiveAccessLock>,
    owner_thread: Option<ThreadId>,
    released: bool,
}

impl AccessPermit {
    /// Claim the close right for the current thread.
    pub fn set_owns_for_close(&self) {
        self.lock.state.lock().close_owner = Some(thread::current().id());
    }

    /// Whether the permit may be released on any thread.
    #[must_use]
    pub fn is_releasable_from_any_thread(&self) -> bool {
        self.owner_thread.is_none()
    }

    /// Whether this permit guards `lock`.
    #[must_use]
    pub fn belongs_to(&self, lock: &Arc<ExclusiveAccessLock>) -> bool {
        Arc::ptr_eq(&self.lock, lock)
    }
}

impl Drop for AccessPermit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.unlock();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_try_acquire_is_exclusive() {
        let lock = ExclusiveAccessLock::new();
        let permit = lock.try_acquire(true).unwrap();
        assert!(lock.is_held());
        assert!(lock.try_acquire(true).is_none());

        lock.release(permit).unwrap();
        assert!(!lock.is_held());
        assert!(lock.try_acquire(true).is_some());
    }

    #[test]
    fn test_drop_releases() {
        let lock = ExclusiveAccessLock::new();
        drop(lock.acquire(false));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_acquire_timeout() {
        let lock = ExclusiveAccessLock::new();
        let _permit = lock.acquire(true);
        let err = lock
            .acquire_timeout(true, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, LockError::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_blocking_waiter_wakes_on_release() {
        let lock = ExclusiveAccessLock::new();
        let permit = lock.acquire(true);

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let permit = lock.acquire_timeout(false, Duration::from_secs(5)).unwrap();
                lock.release(permit).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        lock.release(permit).unwrap();
        waiter.join().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_thread_affine_release_rejected_elsewhere() {
        let lock = ExclusiveAccessLock::new();
        let permit = lock.acquire(false);

        let rejected = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.release(permit).map_err(|r| r.into_permit()))
                .join()
                .unwrap()
        };

        let permit = rejected.unwrap_err();
        assert!(lock.is_held());
        lock.release(permit).unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_any_thread_release() {
        let lock = ExclusiveAccessLock::new();
        let permit = lock.acquire(true);

        let lock2 = Arc::clone(&lock);
        thread::spawn(move || lock2.release(permit).unwrap())
            .join()
            .unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_foreign_permit_rejected() {
        let a = ExclusiveAccessLock::new();
        let b = ExclusiveAccessLock::new();
        let permit = a.acquire(true);

        let rejected = b.release(permit).unwrap_err();
        assert_eq!(rejected.reason(), &LockError::ForeignPermit);
        assert!(a.is_held());
        drop(rejected);
        assert!(!a.is_held());
    }

    #[test]
    fn test_close_ownership_is_thread_affine() {
        let lock = ExclusiveAccessLock::new();
        let permit = lock.acquire(true);
        assert!(!lock.owns_for_close());

        permit.set_owns_for_close();
        assert!(lock.owns_for_close());

        let on_other_thread = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.owns_for_close()).join().unwrap()
        };
        assert!(!on_other_thread);

        let (lock, permit) = thread::spawn(move || {
            lock.transfer_close_ownership(&permit).unwrap();
            assert!(lock.owns_for_close());
            (lock, permit)
        })
        .join()
        .unwrap();
        assert!(!lock.owns_for_close());

        lock.release(permit).unwrap();
        assert!(!lock.owns_for_close());
    }

    #[tokio::test]
    async fn test_async_waiter_wakes_on_release() {
        let lock = ExclusiveAccessLock::new();
        let permit = lock.acquire_async(true).await;

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                let permit = lock.acquire_async(true).await;
                lock.release(permit).unwrap();
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        lock.release(permit).unwrap();
        waiter.await.unwrap();
        assert!(!lock.is_held());
    }
}
