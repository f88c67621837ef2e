use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handle of a semaphore in the table.
pub type SemId = u32;

/// Key value requesting a private (unshared) semaphore.
pub const SM_NO_KEY: i32 = -1;

/// Queueing discipline requested at creation.
///
/// The discipline is recorded per semaphore; wakeup order among waiters of
/// equal standing is left to the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SemDiscipline {
    /// Wake waiters roughly in arrival order
    Fifo,
    /// Wake waiters by task priority
    Priority,
}

/// Outcome of a take operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SemTake {
    /// The semaphore was taken
    Taken,
    /// The semaphore has been ended; nothing was taken
    Ended,
    /// The timeout elapsed before the semaphore could be taken
    TimedOut,
}

struct SemState {
    count: i64,
    ended: bool,
}

struct SemInner {
    state: Mutex<SemState>,
    cond: Condvar,
    discipline: SemDiscipline,
}

/// A counting semaphore supporting the *ended* idiom: once ended, every
/// current and future taker returns [`SemTake::Ended`] until `unend`.
#[derive(Clone)]
pub struct Sem {
    inner: Arc<SemInner>,
    id: SemId,
}

impl std::fmt::Debug for Sem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        write!(
            f,
            "Sem#{}(count={}, ended={}, {:?})",
            self.id, state.count, state.ended, self.inner.discipline
        )
    }
}

impl Sem {
    /// Table id of this semaphore.
    pub fn id(&self) -> SemId {
        self.id
    }

    /// Take the semaphore, blocking indefinitely.
    pub fn take(&self) -> SemTake {
        let mut state = self.inner.state.lock();
        loop {
            if state.ended {
                return SemTake::Ended;
            }
            if state.count > 0 {
                state.count -= 1;
                return SemTake::Taken;
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Take the semaphore, giving up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> SemTake {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.ended {
                return SemTake::Ended;
            }
            if state.count > 0 {
                state.count -= 1;
                return SemTake::Taken;
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return SemTake::TimedOut;
            }
        }
    }

    /// Give the semaphore, waking one waiter.
    pub fn give(&self) {
        let mut state = self.inner.state.lock();
        state.count += 1;
        drop(state);
        self.inner.cond.notify_one();
    }

    /// End the semaphore: wake every current and future taker with the
    /// ended indication. The semaphore itself remains.
    pub fn end(&self) {
        let mut state = self.inner.state.lock();
        state.ended = true;
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Clear the ended state.
    pub fn unend(&self) {
        self.inner.state.lock().ended = false;
    }

    /// True if the semaphore has been ended.
    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().ended
    }

    /// Take with a timeout, then give: releases callers stuck behind a
    /// holder that crashed without giving.
    pub fn unwedge(&self, timeout: Duration) {
        match self.take_timeout(timeout) {
            SemTake::Taken | SemTake::TimedOut => self.give(),
            SemTake::Ended => {}
        }
    }
}

/// Table of named semaphores.
#[derive(Default)]
pub struct SemTable {
    sems: Mutex<HashMap<SemId, Sem>>,
    by_key: Mutex<HashMap<i32, SemId>>,
    next_id: AtomicU32,
}

impl std::fmt::Debug for SemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SemTable({} sems)", self.sems.lock().len())
    }
}

impl SemTable {
    /// Create a semaphore, or return the existing one registered under
    /// `key`. `SM_NO_KEY` always creates a fresh private semaphore.
    pub fn create(&self, key: i32, discipline: SemDiscipline) -> Sem {
        if key != SM_NO_KEY {
            let by_key = self.by_key.lock();
            if let Some(&id) = by_key.get(&key) {
                if let Some(sem) = self.sems.lock().get(&id) {
                    return sem.clone();
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let sem = Sem {
            inner: Arc::new(SemInner {
                state: Mutex::new(SemState {
                    count: 0,
                    ended: false,
                }),
                cond: Condvar::new(),
                discipline,
            }),
            id,
        };
        self.sems.lock().insert(id, sem.clone());
        if key != SM_NO_KEY {
            self.by_key.lock().insert(key, id);
        }
        sem
    }

    /// Look up a semaphore by table id.
    pub fn lookup(&self, id: SemId) -> Option<Sem> {
        self.sems.lock().get(&id).cloned()
    }

    /// Remove a semaphore from the table. Existing clones of the handle
    /// remain usable; the table slot is gone.
    pub fn delete(&self, id: SemId) {
        if let Some(sem) = self.sems.lock().remove(&id) {
            sem.end();
        }
        self.by_key.lock().retain(|_, v| *v != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_give_take() {
        let table = SemTable::default();
        let sem = table.create(SM_NO_KEY, SemDiscipline::Fifo);
        sem.give();
        assert_eq!(sem.take(), SemTake::Taken);
        assert_eq!(sem.take_timeout(Duration::from_millis(10)), SemTake::TimedOut);
    }

    #[test]
    fn test_key_rendezvous() {
        let table = SemTable::default();
        let a = table.create(42, SemDiscipline::Fifo);
        let b = table.create(42, SemDiscipline::Fifo);
        assert_eq!(a.id(), b.id());
        let c = table.create(SM_NO_KEY, SemDiscipline::Fifo);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_ended_wakes_taker() {
        let table = SemTable::default();
        let sem = table.create(SM_NO_KEY, SemDiscipline::Fifo);
        let taker = sem.clone();
        let handle = std::thread::spawn(move || taker.take());
        std::thread::sleep(Duration::from_millis(50));
        sem.end();
        assert_eq!(handle.join().unwrap(), SemTake::Ended);

        // Future takers observe the ended state too.
        assert_eq!(sem.take(), SemTake::Ended);
        sem.unend();
        sem.give();
        assert_eq!(sem.take(), SemTake::Taken);
    }

    #[test]
    fn test_lookup_and_delete() {
        let table = SemTable::default();
        let sem = table.create(SM_NO_KEY, SemDiscipline::Priority);
        assert!(table.lookup(sem.id()).is_some());
        table.delete(sem.id());
        assert!(table.lookup(sem.id()).is_none());
        // Existing handles observe the ended state after deletion.
        assert_eq!(sem.take(), SemTake::Ended);
    }

    #[test]
    fn test_unwedge() {
        let table = SemTable::default();
        let sem = table.create(SM_NO_KEY, SemDiscipline::Fifo);
        let start = Instant::now();
        sem.unwedge(Duration::from_millis(50));
        assert!(start.elapsed() >= Duration::from_millis(50));
        // The give left the semaphore takeable.
        assert_eq!(sem.take(), SemTake::Taken);
    }
}
