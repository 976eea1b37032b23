//! Per-key async mutex
//!
//! Mutations of one identity session or one channel are serialized; different
//! keys never contend. Waiters queue in arrival order (tokio's mutex is fair).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots<K> = Mutex<HashMap<K, Arc<AsyncMutex<()>>>>;

/// Map of key -> async lock
///
/// Slots are created on first use and dropped once nobody holds or awaits them.
pub struct KeyedMutex<K> {
    slots: Arc<Slots<K>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Ord + Clone + Unpin,
{
    /// Create an empty keyed mutex
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for `key`, waiting behind earlier callers
    ///
    /// Cancel-safe: a waiter dropped before it acquires leaves no slot behind.
    pub async fn lock(&self, key: &K) -> KeyedGuard<K> {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = Acquire {
            key: key.clone(),
            wait: Some(Box::pin(slot.lock_owned())),
            slots: Arc::clone(&self.slots),
        }
        .await;

        KeyedGuard {
            key: key.clone(),
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Acquire several keys in ascending order
    ///
    /// Every multi-key acquisition goes through here so two callers can never
    /// take the same pair of locks in opposite orders.
    pub async fn lock_many<I>(&self, keys: I) -> Vec<KeyedGuard<K>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Ord + Clone + Unpin,
{
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight acquisition of one slot
///
/// Dropping it before it completes releases the waiter's reference and removes
/// the slot when nobody else holds or awaits it.
struct Acquire<K>
where
    K: Eq + Hash,
{
    key: K,
    wait: Option<Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>>,
    slots: Arc<Slots<K>>,
}

impl<K> Future for Acquire<K>
where
    K: Eq + Hash + Unpin,
{
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(wait) = self.wait.as_mut() else {
            return Poll::Pending;
        };
        let guard = ready!(wait.as_mut().poll(cx));
        self.wait = None;
        Poll::Ready(guard)
    }
}

impl<K> Drop for Acquire<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if self.wait.take().is_some() {
            remove_if_idle(&self.slots, &self.key);
        }
    }
}

fn remove_if_idle<K>(slots: &Slots<K>, key: &K)
where
    K: Eq + Hash,
{
    let mut slots = slots.lock();
    let idle = slots
        .get(key)
        .map(|slot| Arc::strong_count(slot) == 1)
        .unwrap_or(false);
    if idle {
        slots.remove(key);
    }
}

/// Held lock for one key; released on drop
pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Slots<K>>,
}

impl<K> KeyedGuard<K>
where
    K: Eq + Hash,
{
    /// Key this guard protects
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> fmt::Debug for KeyedGuard<K>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard").field("key", &self.key).finish()
    }
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // Release first so the slot's refcount reflects only other holders/waiters.
        drop(self.guard.take());
        remove_if_idle(&self.slots, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedMutex::<String>::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&"s1".to_string()).await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedMutex::<String>::new();
        let _a = locks.lock(&"a".to_string()).await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&"b".to_string())).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let locks = Arc::new(KeyedMutex::<u32>::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = locks.lock(&7).await;
        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&7).await;
                order.lock().push(i);
            }));
            // let each waiter enqueue before spawning the next
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_waiter_wakes_when_guard_drops() {
        let locks = KeyedMutex::<u32>::new();
        let held = tokio_test::block_on(locks.lock(&1));

        let mut waiter = tokio_test::task::spawn(locks.lock(&1));
        tokio_test::assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let guard = tokio_test::assert_ready!(waiter.poll());
        assert_eq!(*guard.key(), 1);
    }

    #[test]
    fn test_abandoned_waiter_leaves_no_slot() {
        let locks = KeyedMutex::<u32>::new();
        let held = tokio_test::block_on(locks.lock(&1));

        let mut waiter = tokio_test::task::spawn(locks.lock(&1));
        tokio_test::assert_pending!(waiter.poll());

        // the holder leaves first, then the waiter gives up without polling again
        drop(held);
        assert_eq!(locks.active_keys(), 1);
        drop(waiter);

        assert_eq!(locks.active_keys(), 0);
    }

    #[test]
    fn test_waiter_cancelled_while_lock_is_held() {
        let locks = KeyedMutex::<u32>::new();
        let held = tokio_test::block_on(locks.lock(&1));

        let mut waiter = tokio_test::task::spawn(locks.lock(&1));
        tokio_test::assert_pending!(waiter.poll());
        drop(waiter);
        assert_eq!(locks.active_keys(), 1);

        drop(held);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_lock_many_sorts_and_dedups() {
        let locks = KeyedMutex::<u32>::new();
        let guards = locks.lock_many(vec![3, 1, 2, 1]).await;
        let keys: Vec<u32> = guards.iter().map(|g| *g.key()).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        drop(guards);
        assert_eq!(locks.active_keys(), 0);
    }
}
