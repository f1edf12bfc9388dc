use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Unwraps a lock result, keeping the guard of a poisoned lock.
///
/// Cache state is disposable; whatever the panicking writer left behind is
/// handed back as-is.
fn recover<G>(
    result: LockResult<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            op,
            target_module = target,
            lock_kind,
            result = "poisoned_recovered",
            "Recovered from poisoned cache lock"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), target, op, "mutex.lock")
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), target, op, "rwlock.read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), target, op, "rwlock.write")
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn poisoned_mutex_is_recovered_with_its_contents() {
        let lock = Mutex::new(vec![1_u8]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = lock.lock().expect("mutex should lock");
            guard.push(2);
            panic!("poison the mutex");
        }));

        assert!(lock.is_poisoned());
        let guard = mutex_lock(&lock, "cache::lock", "test");
        assert_eq!(*guard, vec![1, 2]);
    }

    #[test]
    fn poisoned_rwlock_allows_reads_and_writes() {
        let lock = RwLock::new(0_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("rwlock should lock");
            panic!("poison the rwlock");
        }));

        *rw_write(&lock, "cache::lock", "test.write") = 7;
        assert_eq!(*rw_read(&lock, "cache::lock", "test.read"), 7);
    }
}
