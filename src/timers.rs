//! Keyed timer ownership.
//!
//! Every component owns exactly one [`TimerSet`]. A key identifies one
//! scheduled concern (refresh, heartbeat, poll, ...); scheduling a key that
//! is already live cancels the old timer first, so at most one timer per
//! concern exists at any time. Dropping the set cancels everything.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::clock::duration_ms;
use crate::lock;

const MIN_PERIOD: Duration = Duration::from_millis(1);

struct TimerTable<K> {
    next_id: u64,
    live: HashMap<K, (u64, JoinHandle<()>)>,
}

impl<K: Eq + Hash> TimerTable<K> {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn is_live(&self, key: &K, id: u64) -> bool {
        matches!(self.live.get(key), Some((live_id, _)) if *live_id == id)
    }
}

pub struct TimerSet<K> {
    owner: &'static str,
    table: Arc<Mutex<TimerTable<K>>>,
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
{
    pub fn new(owner: &'static str) -> Self {
        Self {
            owner,
            table: Arc::new(Mutex::new(TimerTable {
                next_id: 0,
                live: HashMap::new(),
            })),
        }
    }

    /// Run `f` once after `delay`.
    ///
    /// The timer detaches itself before running `f`, so `f` may reschedule
    /// the same key. A timer that was cancelled or replaced while sleeping
    /// never runs `f`.
    pub fn schedule_once<F, Fut>(&self, key: K, delay: Duration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut table = lock(&self.table);
        let id = table.allocate_id();
        let shared = Arc::clone(&self.table);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut table = lock(&shared);
                if !table.is_live(&task_key, id) {
                    return;
                }
                table.live.remove(&task_key);
            }
            f().await;
        });

        debug!(owner = self.owner, key = ?key, delay_ms = duration_ms(delay), "timer scheduled");
        if let Some((_, previous)) = table.live.insert(key, (id, handle)) {
            previous.abort();
        }
    }

    /// Run `f` every `period`, first after `first_delay`, until cancelled.
    pub fn schedule_repeating<F, Fut>(&self, key: K, first_delay: Duration, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut table = lock(&self.table);
        let id = table.allocate_id();
        let shared = Arc::clone(&self.table);
        let task_key = key.clone();
        let period = period.max(MIN_PERIOD);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !lock(&shared).is_live(&task_key, id) {
                    return;
                }
                f().await;
            }
        });

        debug!(owner = self.owner, key = ?key, period_ms = duration_ms(period), "repeating timer scheduled");
        if let Some((_, previous)) = table.live.insert(key, (id, handle)) {
            previous.abort();
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.table).live.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every live timer synchronously. Returns how many were live.
    pub fn cancel_all(&self) -> usize {
        let mut table = lock(&self.table);
        let count = table.live.len();
        for (_, (_, handle)) in table.live.drain() {
            handle.abort();
        }
        if count > 0 {
            debug!(owner = self.owner, count, "timers cancelled");
        }
        count
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        lock(&self.table).live.contains_key(key)
    }

    pub fn live_count(&self) -> usize {
        lock(&self.table).live.len()
    }
}

impl<K> Drop for TimerSet<K> {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        for (_, (_, handle)) in table.live.drain() {
            handle.abort();
        }
    }
}
