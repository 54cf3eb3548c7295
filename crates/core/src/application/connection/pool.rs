// Bounded resource pool
// A semaphore bounds outstanding slots; idle resources are reused when
// they still pass the pool's reuse check

use super::lock;
use crate::error::{BrokerError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct PoolInner<T: ?Sized> {
    name: &'static str,
    limit: Option<usize>,
    permits: Option<Arc<Semaphore>>,
    idle: Mutex<Vec<Arc<T>>>,
    members: Mutex<Vec<Arc<T>>>,
    reusable: fn(&T) -> bool,
}

impl<T: ?Sized> PoolInner<T> {
    fn forget(&self, item: &Arc<T>) {
        lock(&self.members).retain(|member| !same(member, item));
    }

    fn limit_exceeded(&self) -> BrokerError {
        BrokerError::LimitExceeded(format!(
            "{} pool limit of {} reached",
            self.name,
            self.limit.unwrap_or_default()
        ))
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Pool of shared resources handed out through `PoolSlot`s
pub struct ResourcePool<T: ?Sized> {
    inner: Arc<PoolInner<T>>,
}

impl<T: ?Sized> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync> ResourcePool<T> {
    /// # Arguments
    /// * `name` - Used in errors and logs
    /// * `limit` - Maximum outstanding slots (`None`: unbounded)
    /// * `reusable` - Idle resources failing this check are dropped on acquire
    pub fn new(name: &'static str, limit: Option<usize>, reusable: fn(&T) -> bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                limit,
                permits: limit.map(|n| Arc::new(Semaphore::new(n))),
                idle: Mutex::new(Vec::new()),
                members: Mutex::new(Vec::new()),
                reusable,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Take a slot, reusing an idle resource when one is available.
    ///
    /// Without `block`, an exhausted pool fails immediately; with `block`,
    /// it waits up to `timeout` (forever when `None`). Both surface
    /// `LimitExceeded`.
    pub async fn acquire(&self, block: bool, timeout: Option<Duration>) -> Result<PoolSlot<T>> {
        let permit = match &self.inner.permits {
            None => None,
            Some(permits) => Some(self.acquire_permit(permits.clone(), block, timeout).await?),
        };

        Ok(PoolSlot {
            item: self.take_idle(),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    async fn acquire_permit(
        &self,
        permits: Arc<Semaphore>,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<OwnedSemaphorePermit> {
        if !block {
            return permits
                .try_acquire_owned()
                .map_err(|_| self.inner.limit_exceeded());
        }

        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, permits.acquire_owned()).await {
                Ok(Ok(permit)) => Ok(permit),
                _ => Err(self.inner.limit_exceeded()),
            },
            None => permits
                .acquire_owned()
                .await
                .map_err(|_| self.inner.limit_exceeded()),
        }
    }

    fn take_idle(&self) -> Option<Arc<T>> {
        let mut idle = lock(&self.inner.idle);
        while let Some(item) = idle.pop() {
            if (self.inner.reusable)(&item) {
                return Some(item);
            }
            self.inner.forget(&item);
        }
        None
    }

    /// Every resource created through this pool and not discarded
    pub fn members(&self) -> Vec<Arc<T>> {
        lock(&self.inner.members).clone()
    }

    /// Drop idle resources, returning them to the caller for closing
    pub fn drain_idle(&self) -> Vec<Arc<T>> {
        let drained: Vec<Arc<T>> = lock(&self.inner.idle).drain(..).collect();
        for item in &drained {
            self.inner.forget(item);
        }
        drained
    }

    /// Slots currently handed out
    pub fn in_use(&self) -> usize {
        match (&self.inner.permits, self.inner.limit) {
            (Some(permits), Some(limit)) => limit - permits.available_permits(),
            _ => 0,
        }
    }
}

/// One acquired slot; returns its resource to the pool when dropped
pub struct PoolSlot<T: ?Sized> {
    item: Option<Arc<T>>,
    pool: Arc<PoolInner<T>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T: ?Sized> PoolSlot<T> {
    pub fn get(&self) -> Option<&Arc<T>> {
        self.item.as_ref()
    }

    pub fn fill(&mut self, item: Arc<T>) {
        lock(&self.pool.members).push(item.clone());
        if let Some(previous) = self.item.replace(item) {
            self.pool.forget(&previous);
        }
    }

    pub fn get_or_fill(&mut self, create: impl FnOnce() -> Arc<T>) -> Arc<T> {
        if let Some(item) = &self.item {
            return item.clone();
        }
        let item = create();
        self.fill(item.clone());
        item
    }

    /// Do not return the resource to the pool
    pub fn discard(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.forget(&item);
        }
    }
}

impl<T: ?Sized> Drop for PoolSlot<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            if (self.pool.reusable)(&item) {
                lock(&self.pool.idle).push(item);
            } else {
                self.pool.forget(&item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Resource {
        open: AtomicBool,
    }

    fn resource() -> Arc<Resource> {
        Arc::new(Resource {
            open: AtomicBool::new(true),
        })
    }

    fn pool(limit: Option<usize>) -> ResourcePool<Resource> {
        ResourcePool::new("test", limit, |r| r.open.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_released_resources_are_reused() {
        let pool = pool(Some(2));

        let mut slot = pool.acquire(false, None).await.unwrap();
        assert!(slot.get().is_none());
        let first = slot.get_or_fill(resource);
        drop(slot);

        let slot = pool.acquire(false, None).await.unwrap();
        assert!(same(slot.get().unwrap(), &first));
        assert_eq!(pool.members().len(), 1);
    }

    #[tokio::test]
    async fn test_non_blocking_exhaustion_is_limit_exceeded() {
        let pool = pool(Some(1));
        let _held = pool.acquire(false, None).await.unwrap();

        let err = pool.acquire(false, None).await.err().unwrap();
        assert!(matches!(err, BrokerError::LimitExceeded(_)));
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out_with_limit_exceeded() {
        let pool = pool(Some(1));
        let _held = pool.acquire(true, None).await.unwrap();

        let err = pool
            .acquire(true, Some(Duration::from_millis(50)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::LimitExceeded(_)));
    }

    #[tokio::test]
    async fn test_closed_resources_are_not_reused() {
        let pool = pool(None);

        let mut slot = pool.acquire(false, None).await.unwrap();
        let item = slot.get_or_fill(resource);
        item.open.store(false, Ordering::SeqCst);
        drop(slot);

        let slot = pool.acquire(false, None).await.unwrap();
        assert!(slot.get().is_none());
        assert!(pool.members().is_empty());
    }

    #[tokio::test]
    async fn test_discarded_slot_frees_capacity() {
        let pool = pool(Some(1));

        let mut slot = pool.acquire(false, None).await.unwrap();
        slot.get_or_fill(resource);
        slot.discard();
        drop(slot);

        assert_eq!(pool.in_use(), 0);
        assert!(pool.members().is_empty());
        assert!(pool.acquire(false, None).await.is_ok());
    }
}
