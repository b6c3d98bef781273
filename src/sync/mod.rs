pub mod rma_mutex;

/// Mutual exclusion between the members of a group.
///
/// 1. Mutual Exclusion - at most one member is between `acquire()` returning and the matching `release()`.
/// 2. Hand-off - a member blocked in `acquire()` is granted the lock by a later `release()`, never by polling.
pub trait Mutex {
    type Output: Mutex;
    fn acquire(&self) -> MutexGuard<'_, Self::Output>;
    fn release(&self);
}

/// Releases the mutex when dropped.
pub struct MutexGuard<'a, M: Mutex + ?Sized> {
    mutex: &'a M,
}

impl<'a, M: Mutex + ?Sized> MutexGuard<'a, M> {
    pub(crate) fn new(mutex: &'a M) -> Self {
        Self { mutex }
    }
}

impl<M: Mutex + ?Sized> Drop for MutexGuard<'_, M> {
    fn drop(&mut self) {
        self.mutex.release()
    }
}
