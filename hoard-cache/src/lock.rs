// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cache lock: at most one populator per key
//!
//! Unlike a lock readers wait on, a request that loses the race here is not queued. It goes to
//! the origin uncached and neither stores nor revalidates.

use crate::CacheKey;

use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::IntoStaticStr;

pub type CacheKeyLockImpl = (dyn CacheKeyLock + Send + Sync);

pub trait CacheKeyLock {
    /// Try to become the populator of the key
    ///
    /// Never blocks. The returned [Locked] tells the caller whether it may populate.
    fn lock(&self, key: &CacheKey) -> Locked;

    /// Release a lock for the given key
    ///
    /// When the write permit is dropped without being released, the lock is marked dangling so
    /// the next request can take it over.
    fn release(&self, key: &CacheKey, permit: WritePermit, reason: LockStatus);
}

const N_SHARDS: usize = 16;

// A hash table that shards to a constant number of tables to reduce lock contention
struct LockTable {
    shards: [RwLock<HashMap<u128, LockStub>>; N_SHARDS],
}

impl LockTable {
    fn new() -> Self {
        LockTable {
            shards: Default::default(),
        }
    }

    #[inline]
    fn shard(&self, key: u128) -> &RwLock<HashMap<u128, LockStub>> {
        &self.shards[(key % N_SHARDS as u128) as usize]
    }
}

/// The global cache locking manager
pub struct CacheLock {
    lock_table: LockTable,
    // a lock held longer than this is considered abandoned
    max_age: Duration,
}

/// The outcome of [CacheKeyLock::lock()]
#[derive(Debug)]
pub enum Locked {
    /// The caller is the populator
    Write(WritePermit),
    /// Another request is populating, it has held the lock for the given time
    Busy(Duration),
}

impl Locked {
    /// Is this a write lock
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

impl CacheLock {
    /// Create a new [CacheLock] with the given max lock age
    pub fn new_boxed(max_age: Duration) -> Box<Self> {
        Box::new(Self::new(max_age))
    }

    /// Create a new [CacheLock] with the given max lock age
    pub fn new(max_age: Duration) -> Self {
        CacheLock {
            lock_table: LockTable::new(),
            max_age,
        }
    }

    /// Number of keys with a lock entry, held or not
    pub fn len(&self) -> usize {
        self.lock_table.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheKeyLock for CacheLock {
    fn lock(&self, key: &CacheKey) -> Locked {
        let id = key.lock_id();
        let table = self.lock_table.shard(id);
        if let Some(lock) = table.read().get(&id) {
            if lock.0.is_held() {
                return Locked::Busy(lock.0.age());
            }
        }

        let mut table = table.write();
        // check again in case another request already added it
        if let Some(lock) = table.get(&id) {
            if lock.0.is_held() {
                return Locked::Busy(lock.0.age());
            }
            match lock.0.lock_status() {
                LockStatus::Waiting => {
                    warn!(
                        "taking over cache lock of {key} held for {:?}",
                        lock.0.age()
                    );
                    lock.0.set_status(LockStatus::Timeout);
                }
                status => {
                    let status: &'static str = status.into();
                    debug!("taking over {status} cache lock of {key}");
                }
            }
        }
        let (permit, stub) = WritePermit::new(self.max_age);
        table.insert(id, stub);
        Locked::Write(permit)
    }

    fn release(&self, key: &CacheKey, mut permit: WritePermit, reason: LockStatus) {
        let id = key.lock_id();
        let mut table = self.lock_table.shard(id).write();
        // only remove the entry if it is still ours, it may have been taken over
        if table
            .get(&id)
            .is_some_and(|stub| Arc::ptr_eq(&stub.0, &permit.lock))
        {
            table.remove(&id);
        }
        permit.unlock(reason);
    }
}

/// Status of a lock entry
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum LockStatus {
    /// The populator is still working
    Waiting,
    /// The populator committed or revalidated
    Done,
    /// The populator hit an error, such as a storage failure
    TransientError,
    /// The populator found the response uncacheable or the provider declined it
    GiveUp,
    /// The write permit is dropped without being released
    Dangling,
    /// The lock was held for too long and got taken over
    Timeout,
}

impl From<LockStatus> for u8 {
    fn from(l: LockStatus) -> u8 {
        match l {
            LockStatus::Waiting => 0,
            LockStatus::Done => 1,
            LockStatus::TransientError => 2,
            LockStatus::GiveUp => 3,
            LockStatus::Dangling => 4,
            LockStatus::Timeout => 5,
        }
    }
}

impl From<u8> for LockStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Waiting,
            1 => Self::Done,
            2 => Self::TransientError,
            3 => Self::GiveUp,
            4 => Self::Dangling,
            5 => Self::Timeout,
            _ => Self::GiveUp, // placeholder
        }
    }
}

#[derive(Debug)]
pub struct LockCore {
    pub lock_start: Instant,
    pub max_age: Duration,
    // use u8 for Atomic enum
    lock_status: AtomicU8,
}

impl LockCore {
    pub fn new_arc(max_age: Duration) -> Arc<Self> {
        Arc::new(LockCore {
            lock_start: Instant::now(),
            max_age,
            lock_status: AtomicU8::new(LockStatus::Waiting.into()),
        })
    }

    pub fn age(&self) -> Duration {
        self.lock_start.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.age() >= self.max_age
    }

    /// Whether a populator is still working under this lock
    pub fn is_held(&self) -> bool {
        self.lock_status() == LockStatus::Waiting && !self.expired()
    }

    fn set_status(&self, status: LockStatus) {
        self.lock_status.store(status.into(), Ordering::SeqCst);
    }

    pub fn lock_status(&self) -> LockStatus {
        self.lock_status.load(Ordering::SeqCst).into()
    }
}

/// WritePermit: whoever gets it populates the cache and then releases it
#[derive(Debug)]
pub struct WritePermit {
    lock: Arc<LockCore>,
    finished: bool,
}

impl WritePermit {
    pub fn new(max_age: Duration) -> (WritePermit, LockStub) {
        let lock = LockCore::new_arc(max_age);
        let stub = LockStub(lock.clone());
        (
            WritePermit {
                lock,
                finished: false,
            },
            stub,
        )
    }

    pub fn unlock(&mut self, reason: LockStatus) {
        self.finished = true;
        // a taken over lock keeps its Timeout status
        if self.lock.lock_status() != LockStatus::Timeout {
            self.lock.set_status(reason);
        }
    }

    pub fn lock_status(&self) -> LockStatus {
        self.lock.lock_status()
    }
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        // Populator exited without properly unlocking. The next request takes the lock over.
        if !self.finished {
            warn!("Dangling cache lock started!");
            self.unlock(LockStatus::Dangling);
        }
    }
}

#[derive(Debug)]
pub struct LockStub(pub Arc<LockCore>);
