//! Upgradable read/write lock with scoped, per-thread holds.
//!
//! Holds are tracked per thread, which is what makes the upgrade path
//! possible: a thread that already holds a read hold may ask for a write hold
//! without releasing, and the lock recognises it as the only remaining reader.
//! Dropping the write hold afterwards downgrades the thread back to exactly
//! the read state it had before the upgrade.
//!
//! Two readers upgrading at the same time would wait on each other forever.
//! The lock refuses the second attempt instead: while one upgrade is pending
//! or held, any other reader asking for write gets
//! [`LockError::UpgradeContention`] immediately and must drop its read hold
//! before retrying.
//!
//! Waiting writers take priority over threads that do not hold the lock yet,
//! so a hold must not be kept across a fan-out whose tasks take the same lock.

use crate::concurrency::CancelToken;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// How often a cancellable waiter re-checks its token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock acquisition cancelled")]
    Cancelled,
    #[error("another reader is already upgrading; release the read hold and retry")]
    UpgradeContention,
}

#[derive(Debug, Default)]
struct Holders {
    readers: HashMap<ThreadId, usize>,
    writer: Option<ThreadId>,
    write_depth: usize,
    upgraded: bool,
    upgrader: Option<ThreadId>,
    waiting_writers: usize,
}

impl Holders {
    fn can_read(&self, me: ThreadId) -> bool {
        match self.writer {
            Some(owner) => owner == me,
            None => self.readers.contains_key(&me) || self.waiting_writers == 0,
        }
    }

    fn can_write(&self, me: ThreadId) -> bool {
        match self.writer {
            Some(owner) => owner == me,
            None => self.readers.keys().all(|reader| *reader == me),
        }
    }
}

/// Point-in-time view of who holds an [`UpgradableLock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockState {
    /// Distinct threads holding read.
    pub readers: usize,
    /// Read holds across all threads, counting nested acquisitions.
    pub read_holds: usize,
    pub writer: bool,
    pub write_depth: usize,
    /// The writer got its hold by upgrading and still retains its read hold.
    pub upgraded: bool,
    pub waiting_writers: usize,
}

impl LockState {
    pub fn is_free(&self) -> bool {
        self.read_holds == 0 && !self.writer
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "readers={} (holds={}) writer={} upgraded={} waiting_writers={}",
            self.readers,
            self.read_holds,
            if self.writer { "held" } else { "none" },
            self.upgraded,
            self.waiting_writers
        )
    }
}

#[derive(Default)]
pub struct UpgradableLock {
    holders: Mutex<Holders>,
    changed: Condvar,
}

impl fmt::Debug for UpgradableLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UpgradableLock").field(&self.state()).finish()
    }
}

impl UpgradableLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the calling thread may read.
    ///
    /// Always granted immediately when the thread already holds read or
    /// write.
    pub fn acquire_read(&self) -> ReadHold<'_> {
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        while !holders.can_read(me) {
            self.changed.wait(&mut holders);
        }
        self.grant_read(&mut holders, me)
    }

    /// Like [`acquire_read`](Self::acquire_read), giving up with
    /// [`LockError::Cancelled`] once `cancel` fires.
    pub fn acquire_read_with(&self, cancel: &CancelToken) -> Result<ReadHold<'_>, LockError> {
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        self.wait_cancellable(&mut holders, cancel, |h| h.can_read(me))?;
        Ok(self.grant_read(&mut holders, me))
    }

    pub fn try_acquire_read(&self) -> Option<ReadHold<'_>> {
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        if holders.can_read(me) {
            Some(self.grant_read(&mut holders, me))
        } else {
            None
        }
    }

    /// Block until the calling thread is the only holder, then take write.
    ///
    /// A thread holding read keeps that hold and upgrades; a thread already
    /// holding write nests.
    pub fn acquire_write(&self) -> Result<WriteHold<'_>, LockError> {
        self.write_inner(None)
    }

    pub fn acquire_write_with(&self, cancel: &CancelToken) -> Result<WriteHold<'_>, LockError> {
        self.write_inner(Some(cancel))
    }

    /// Non-blocking write. Returns `None` on contention, including when
    /// another reader's upgrade is in flight.
    pub fn try_acquire_write(&self) -> Option<WriteHold<'_>> {
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        if holders.writer == Some(me) {
            holders.write_depth += 1;
            return Some(WriteHold::new(self, me));
        }
        let upgrading = holders.readers.contains_key(&me);
        if (upgrading && holders.upgrader.is_some()) || !holders.can_write(me) {
            return None;
        }
        Some(self.grant_write(&mut holders, me, upgrading))
    }

    pub fn state(&self) -> LockState {
        let holders = self.holders.lock();
        LockState {
            readers: holders.readers.len(),
            read_holds: holders.readers.values().sum(),
            writer: holders.writer.is_some(),
            write_depth: holders.write_depth,
            upgraded: holders.upgraded,
            waiting_writers: holders.waiting_writers,
        }
    }

    pub fn holds_read(&self) -> bool {
        let me = thread::current().id();
        self.holders.lock().readers.contains_key(&me)
    }

    pub fn holds_write(&self) -> bool {
        let me = thread::current().id();
        self.holders.lock().writer == Some(me)
    }

    fn write_inner(&self, cancel: Option<&CancelToken>) -> Result<WriteHold<'_>, LockError> {
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(LockError::Cancelled);
        }
        if holders.writer == Some(me) {
            holders.write_depth += 1;
            return Ok(WriteHold::new(self, me));
        }

        let upgrading = holders.readers.contains_key(&me);
        if upgrading {
            if holders.upgrader.is_some() {
                trace!("upgrade refused: another upgrade in flight");
                return Err(LockError::UpgradeContention);
            }
            holders.upgrader = Some(me);
        }

        holders.waiting_writers += 1;
        let waited = match cancel {
            Some(token) => self.wait_cancellable(&mut holders, token, |h| h.can_write(me)),
            None => {
                while !holders.can_write(me) {
                    self.changed.wait(&mut holders);
                }
                Ok(())
            }
        };
        holders.waiting_writers -= 1;

        if let Err(err) = waited {
            if upgrading {
                holders.upgrader = None;
            }
            drop(holders);
            // Readers may have been held back by this waiter.
            self.changed.notify_all();
            return Err(err);
        }
        Ok(self.grant_write(&mut holders, me, upgrading))
    }

    fn wait_cancellable(
        &self,
        holders: &mut MutexGuard<'_, Holders>,
        cancel: &CancelToken,
        ready: impl Fn(&Holders) -> bool,
    ) -> Result<(), LockError> {
        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            if ready(&**holders) {
                return Ok(());
            }
            self.changed.wait_for(holders, CANCEL_POLL_INTERVAL);
        }
    }

    fn grant_read(&self, holders: &mut Holders, me: ThreadId) -> ReadHold<'_> {
        *holders.readers.entry(me).or_insert(0) += 1;
        trace!("read hold granted");
        ReadHold::new(self, me)
    }

    fn grant_write(&self, holders: &mut Holders, me: ThreadId, upgrading: bool) -> WriteHold<'_> {
        holders.writer = Some(me);
        holders.write_depth = 1;
        holders.upgraded = upgrading;
        if upgrading {
            holders.upgrader = Some(me);
        }
        trace!(upgraded = upgrading, "write hold granted");
        WriteHold::new(self, me)
    }

    fn release_read(&self, me: ThreadId) {
        let mut holders = self.holders.lock();
        if let Some(count) = holders.readers.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                holders.readers.remove(&me);
                if holders.writer == Some(me) {
                    holders.upgraded = false;
                }
            }
        }
        drop(holders);
        self.changed.notify_all();
    }

    fn release_write(&self, me: ThreadId) {
        let mut holders = self.holders.lock();
        if holders.writer == Some(me) {
            holders.write_depth -= 1;
            if holders.write_depth == 0 {
                holders.writer = None;
                holders.upgraded = false;
                if holders.upgrader == Some(me) {
                    holders.upgrader = None;
                }
            }
        }
        drop(holders);
        self.changed.notify_all();
    }
}

/// Scoped read hold. Released when dropped, on every exit path.
///
/// Not `Send`: a hold belongs to the thread that acquired it.
#[must_use = "the read hold is released as soon as it is dropped"]
pub struct ReadHold<'a> {
    lock: &'a UpgradableLock,
    owner: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadHold<'a> {
    fn new(lock: &'a UpgradableLock, owner: ThreadId) -> Self {
        Self {
            lock,
            owner,
            _not_send: PhantomData,
        }
    }

    /// Upgrade while keeping this read hold. Dropping the returned write
    /// hold downgrades back to read.
    pub fn upgrade(&self) -> Result<WriteHold<'a>, LockError> {
        self.lock.acquire_write()
    }

    pub fn upgrade_with(&self, cancel: &CancelToken) -> Result<WriteHold<'a>, LockError> {
        self.lock.acquire_write_with(cancel)
    }
}

impl Drop for ReadHold<'_> {
    fn drop(&mut self) {
        self.lock.release_read(self.owner);
    }
}

impl fmt::Debug for ReadHold<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHold").field("owner", &self.owner).finish()
    }
}

/// Scoped write hold. Released when dropped, on every exit path.
#[must_use = "the write hold is released as soon as it is dropped"]
pub struct WriteHold<'a> {
    lock: &'a UpgradableLock,
    owner: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteHold<'a> {
    fn new(lock: &'a UpgradableLock, owner: ThreadId) -> Self {
        Self {
            lock,
            owner,
            _not_send: PhantomData,
        }
    }
}

impl Drop for WriteHold<'_> {
    fn drop(&mut self) {
        self.lock.release_write(self.owner);
    }
}

impl fmt::Debug for WriteHold<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHold").field("owner", &self.owner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Barrier;

    fn wait_for_waiting_writer(lock: &UpgradableLock) {
        while lock.state().waiting_writers == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn nested_reads_are_counted() {
        let lock = UpgradableLock::new();
        let outer = lock.acquire_read();
        let inner = lock.acquire_read();
        let state = lock.state();
        assert_eq!(state.readers, 1);
        assert_eq!(state.read_holds, 2);

        drop(inner);
        assert_eq!(lock.state().read_holds, 1);
        drop(outer);
        assert!(lock.state().is_free());
    }

    #[test]
    fn upgrade_then_downgrade_restores_read_state() {
        let lock = UpgradableLock::new();
        let read = lock.acquire_read();
        let before = lock.state();

        let write = read.upgrade().unwrap();
        let during = lock.state();
        assert!(during.writer);
        assert!(during.upgraded);
        assert_eq!(during.readers, 1);
        assert_eq!(during.read_holds, 1);

        drop(write);
        assert_eq!(lock.state(), before);
        assert!(lock.holds_read());
        assert!(!lock.holds_write());

        drop(read);
        assert_eq!(lock.state(), LockState::default());
    }

    #[test]
    fn read_inside_write_is_granted_and_outlives_it() {
        let lock = UpgradableLock::new();
        let write = lock.acquire_write().unwrap();
        let read = lock.acquire_read();
        assert!(lock.state().writer);
        assert!(!lock.state().upgraded);

        drop(write);
        let state = lock.state();
        assert!(!state.writer);
        assert_eq!(state.read_holds, 1);

        drop(read);
        assert!(lock.state().is_free());
    }

    #[test]
    fn releasing_read_first_keeps_write_until_dropped() {
        let lock = UpgradableLock::new();
        let read = lock.acquire_read();
        let write = lock.acquire_write().unwrap();

        drop(read);
        let state = lock.state();
        assert!(state.writer);
        assert_eq!(state.readers, 0);
        assert!(!state.upgraded);

        drop(write);
        assert!(lock.state().is_free());
    }

    #[test]
    fn write_holds_nest() {
        let lock = UpgradableLock::new();
        let outer = lock.acquire_write().unwrap();
        let inner = lock.acquire_write().unwrap();
        assert_eq!(lock.state().write_depth, 2);

        drop(inner);
        assert!(lock.state().writer);
        drop(outer);
        assert!(lock.state().is_free());
    }

    #[test]
    fn try_acquire_fails_while_another_thread_writes() {
        let lock = UpgradableLock::new();
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|s| {
            let lock = &lock;
            s.spawn(move || {
                let _write = lock.acquire_write().unwrap();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });

            held_rx.recv().unwrap();
            assert!(lock.try_acquire_read().is_none());
            assert!(lock.try_acquire_write().is_none());
            release_tx.send(()).unwrap();
        });

        assert!(lock.try_acquire_read().is_some());
        assert!(lock.try_acquire_write().is_some());
        assert!(lock.state().is_free());
    }

    #[test]
    fn cancelled_token_fails_before_acquiring() {
        let lock = UpgradableLock::new();
        let token = CancelToken::new();
        token.cancel();

        assert_eq!(lock.acquire_read_with(&token).unwrap_err(), LockError::Cancelled);
        assert_eq!(lock.acquire_write_with(&token).unwrap_err(), LockError::Cancelled);
        assert!(lock.state().is_free());
    }

    #[test]
    fn cancelling_a_blocked_writer_leaves_no_trace() {
        let lock = UpgradableLock::new();
        let token = CancelToken::new();
        let read = lock.acquire_read();
        let before = lock.state();

        thread::scope(|s| {
            let writer = s.spawn(|| lock.acquire_write_with(&token).map(|_| ()));
            wait_for_waiting_writer(&lock);
            token.cancel();
            assert_eq!(writer.join().unwrap(), Err(LockError::Cancelled));
        });

        assert_eq!(lock.state(), before);
        drop(read);
        assert!(lock.state().is_free());
    }

    #[test]
    fn cancelling_a_blocked_reader_leaves_no_trace() {
        let lock = UpgradableLock::new();
        let token = CancelToken::new();
        let write = lock.acquire_write().unwrap();
        let before = lock.state();

        thread::scope(|s| {
            let reader = s.spawn(|| lock.acquire_read_with(&token).map(|_| ()));
            thread::sleep(Duration::from_millis(20));
            token.cancel();
            assert_eq!(reader.join().unwrap(), Err(LockError::Cancelled));
        });

        assert_eq!(lock.state(), before);
        drop(write);
        assert!(lock.state().is_free());
    }

    #[test]
    fn second_concurrent_upgrade_fails_fast() {
        let lock = UpgradableLock::new();
        let both_reading = Barrier::new(2);

        thread::scope(|s| {
            let first = s.spawn(|| {
                let read = lock.acquire_read();
                both_reading.wait();
                let write = read.upgrade()?;
                let upgraded = lock.state().upgraded;
                drop(write);
                Ok::<bool, LockError>(upgraded)
            });
            let second = s.spawn(|| {
                let read = lock.acquire_read();
                both_reading.wait();
                wait_for_waiting_writer(&lock);
                let contended = read.upgrade().map(|_| ());
                drop(read);
                contended
            });

            assert_eq!(second.join().unwrap(), Err(LockError::UpgradeContention));
            assert_eq!(first.join().unwrap(), Ok(true));
        });

        assert!(lock.state().is_free());
    }

    #[test]
    fn waiting_writer_holds_back_new_readers() {
        let lock = UpgradableLock::new();
        let read = lock.acquire_read();

        thread::scope(|s| {
            let writer = s.spawn(|| lock.acquire_write().map(|_| ()));
            wait_for_waiting_writer(&lock);

            let blocked = s.spawn(|| lock.try_acquire_read().is_some());
            assert!(!blocked.join().unwrap());

            // The existing reader still nests.
            let nested = lock.acquire_read();
            drop(nested);
            drop(read);
            assert!(writer.join().unwrap().is_ok());
        });

        assert!(lock.state().is_free());
    }

    #[test]
    fn state_display_is_readable() {
        let lock = UpgradableLock::new();
        let _read = lock.acquire_read();
        assert_eq!(
            lock.state().to_string(),
            "readers=1 (holds=1) writer=none upgraded=false waiting_writers=0"
        );
    }
}
