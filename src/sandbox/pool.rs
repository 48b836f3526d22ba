//! Round-robin sandbox slot pool.
//!
//! A fixed number of slots bound how many sandboxes exist at once. Slots
//! are handed out round-robin and held exclusively; the sandbox itself is
//! built fresh from the shared snapshot on every acquisition and discarded
//! on release, so a slot never carries state between runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{SandboxError, SandboxSnapshot};

pub struct SandboxPool {
    snapshot: Arc<SandboxSnapshot>,
    slots: Vec<Arc<Semaphore>>,
    cursor: AtomicUsize,
    closed: AtomicBool,
}

impl SandboxPool {
    pub fn new(snapshot: Arc<SandboxSnapshot>, size: usize) -> Self {
        let size = size.max(1);
        info!(size, digest = %snapshot.digest(), "sandbox pool ready");
        Self {
            snapshot,
            slots: (0..size).map(|_| Arc::new(Semaphore::new(1))).collect(),
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Exclusive hold on the next slot, round-robin. Waits if that slot is
    /// in use; in practice the pipeline's group concurrency is sized so
    /// acquisitions rarely block.
    pub async fn acquire(&self) -> Result<SlotPermit, SandboxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::PoolClosed);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let permit = Arc::clone(&self.slots[index])
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::PoolClosed)?;
        debug!(slot = index, "sandbox slot acquired");
        Ok(SlotPermit {
            index,
            snapshot: Arc::clone(&self.snapshot),
            _permit: permit,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn snapshot(&self) -> &Arc<SandboxSnapshot> {
        &self.snapshot
    }

    /// Tear the pool down. Pending and future acquisitions fail with
    /// [`SandboxError::PoolClosed`]; outstanding permits stay valid until
    /// their holders release them.
    pub fn destroy(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for slot in &self.slots {
                slot.close();
            }
            info!("sandbox pool destroyed");
        }
    }
}

/// Exclusive hold on one pool slot. Dropping it releases the slot.
pub struct SlotPermit {
    index: usize,
    snapshot: Arc<SandboxSnapshot>,
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    pub fn slot(&self) -> usize {
        self.index
    }

    pub fn snapshot(&self) -> &Arc<SandboxSnapshot> {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivityDefaults;
    use crate::sandbox::{BundleOptions, SandboxBundler};
    use std::collections::BTreeMap;
    use std::io::Write;

    fn test_snapshot() -> Arc<SandboxSnapshot> {
        let dir = tempfile::tempdir().unwrap();
        let mut file =
            std::fs::File::create(dir.path().join("workflow-interface.wat")).unwrap();
        writeln!(file, "(module)").unwrap();
        let bundle = SandboxBundler::new(BundleOptions {
            workflows_path: dir.path().to_path_buf(),
            dependency_roots: vec![],
            activity_stubs: BTreeMap::new(),
            interceptor_modules: vec![],
            interface_module: "workflow-interface".to_string(),
            activity_defaults: ActivityDefaults::default(),
        })
        .build()
        .unwrap();
        SandboxSnapshot::compile(&bundle).unwrap()
    }

    #[tokio::test]
    async fn slots_hand_out_round_robin() {
        let pool = SandboxPool::new(test_snapshot(), 3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!((a.slot(), b.slot(), c.slot()), (0, 1, 2));
        drop((a, b, c));
        let d = pool.acquire().await.unwrap();
        assert_eq!(d.slot(), 0);
    }

    #[tokio::test]
    async fn busy_slot_blocks_until_released() {
        let pool = Arc::new(SandboxPool::new(test_snapshot(), 1));
        let held = pool.acquire().await.unwrap();
        let contender = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|p| p.slot()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(held);
        assert_eq!(contender.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn destroy_fails_pending_acquisitions() {
        let pool = SandboxPool::new(test_snapshot(), 2);
        let _held = pool.acquire().await.unwrap();
        pool.destroy();
        assert!(matches!(
            pool.acquire().await,
            Err(SandboxError::PoolClosed)
        ));
    }
}
