//! Per-organization mutual exclusion.
//!
//! Rebuilds and merges touching the same organization must not interleave.
//! Readers never take these locks.

use std::{
  collections::{BTreeSet, HashMap},
  sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// A lazily populated map of named async locks, one per organization id.
#[derive(Debug, Clone, Default)]
pub struct OrganizationLocks {
  inner: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl OrganizationLocks {
  pub fn new() -> Self { Self::default() }

  /// The lock for `id`. Entries nobody holds or waits on are pruned first,
  /// so the map only ever covers organizations currently in use.
  fn slot(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
    let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    map.retain(|_, slot| Arc::strong_count(slot) > 1);
    map.entry(id).or_default().clone()
  }

  #[cfg(test)]
  fn tracked(&self) -> usize {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// Wait for exclusive access to one organization.
  pub async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
    self.slot(id).lock_owned().await
  }

  /// Wait for exclusive access to several organizations at once.
  ///
  /// Locks are taken in id order so two callers with overlapping sets can
  /// never deadlock.
  pub async fn lock_many(
    &self,
    ids: impl IntoIterator<Item = Uuid>,
  ) -> Vec<OwnedMutexGuard<()>> {
    let ordered: BTreeSet<Uuid> = ids.into_iter().collect();
    let mut guards = Vec::with_capacity(ordered.len());
    for id in ordered {
      guards.push(self.lock(id).await);
    }
    guards
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[tokio::test]
  async fn same_organization_is_exclusive() {
    let locks = OrganizationLocks::new();
    let id = Uuid::new_v4();
    let guard = locks.lock(id).await;

    let other = locks.clone();
    let waiter = tokio::spawn(async move { other.lock(id).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(guard);
    let _second = tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("lock released")
      .unwrap();
  }

  #[tokio::test]
  async fn different_organizations_do_not_block() {
    let locks = OrganizationLocks::new();
    let _a = locks.lock(Uuid::new_v4()).await;
    let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock(Uuid::new_v4()))
      .await
      .expect("independent lock");
  }

  #[tokio::test]
  async fn released_locks_are_forgotten() {
    let locks = OrganizationLocks::new();
    let held = locks.lock(Uuid::new_v4()).await;
    for _ in 0..10 {
      drop(locks.lock(Uuid::new_v4()).await);
    }
    let _last = locks.lock(Uuid::new_v4()).await;
    assert_eq!(locks.tracked(), 2);
    drop(held);
  }

  #[tokio::test]
  async fn lock_many_deduplicates() {
    let locks = OrganizationLocks::new();
    let id = Uuid::new_v4();
    let guards = locks.lock_many([id, id, Uuid::new_v4()]).await;
    assert_eq!(guards.len(), 2);
  }
}
