//! Partitioned rebuild pool.
//!
//! Each worker owns one partition of the organization id space and drains
//! its own queue in order, so jobs for one organization never run in
//! parallel with each other. The organization lock is still taken for every
//! job because API handlers and merges may touch the same organization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use posture_core::{
  builder::{self, RebuildRequest},
  locks::OrganizationLocks,
  store::RatingStore,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const QUEUE_DEPTH: usize = 64;

/// What one worker did before its queue closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerTally {
  pub rebuilt:                usize,
  pub failed:                 usize,
  pub organization_snapshots: usize,
}

impl std::ops::Add for WorkerTally {
  type Output = Self;

  fn add(self, rhs: Self) -> Self {
    Self {
      rebuilt:                self.rebuilt + rhs.rebuilt,
      failed:                 self.failed + rhs.failed,
      organization_snapshots: self.organization_snapshots + rhs.organization_snapshots,
    }
  }
}

pub struct RebuildPool {
  queues:  Vec<mpsc::Sender<RebuildRequest>>,
  workers: Vec<JoinHandle<WorkerTally>>,
}

impl RebuildPool {
  /// Start `workers` workers (at least one) on the current runtime.
  pub fn spawn<S>(store: Arc<S>, locks: OrganizationLocks, workers: usize) -> Self
  where
    S: RatingStore + 'static,
  {
    let (queues, workers) = (0..workers.max(1))
      .map(|partition| {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = tokio::spawn(run(partition, store.clone(), locks.clone(), rx));
        (tx, handle)
      })
      .unzip();
    Self { queues, workers }
  }

  pub fn partitions(&self) -> usize { self.queues.len() }

  /// The partition responsible for `organization_id`.
  pub fn partition_of(&self, organization_id: Uuid) -> usize {
    (organization_id.as_u128() % self.queues.len() as u128) as usize
  }

  /// Queue a rebuild, waiting if the partition's queue is full.
  pub async fn submit(&self, request: RebuildRequest) -> Result<()> {
    let partition = self.partition_of(request.organization_id);
    self.queues[partition].send(request).await.map_err(|_| Error::PoolClosed)
  }

  /// Queue a rebuild of every organization alive at `as_of`.
  pub async fn submit_all<S: RatingStore>(
    &self,
    store: &S,
    as_of: DateTime<Utc>,
    create_history: bool,
  ) -> Result<usize> {
    let organizations = store
      .list_organizations()
      .await
      .map_err(|e| Error::Store(Box::new(e)))?;
    let mut queued = 0;
    for organization in organizations.iter().filter(|o| o.lifecycle.alive_at(as_of)) {
      self
        .submit(RebuildRequest {
          organization_id: organization.organization_id,
          create_history,
          as_of,
        })
        .await?;
      queued += 1;
    }
    info!(queued, partitions = self.partitions(), "rebuilds queued");
    Ok(queued)
  }

  /// Close every queue and wait for the workers to drain them.
  pub async fn shutdown(self) -> Result<WorkerTally> {
    drop(self.queues);
    let mut total = WorkerTally::default();
    for worker in self.workers {
      total = total + worker.await?;
    }
    Ok(total)
  }
}

async fn run<S: RatingStore>(
  partition: usize,
  store: Arc<S>,
  locks: OrganizationLocks,
  mut queue: mpsc::Receiver<RebuildRequest>,
) -> WorkerTally {
  let mut tally = WorkerTally::default();
  while let Some(request) = queue.recv().await {
    let _guard = locks.lock(request.organization_id).await;
    match builder::rebuild(store.as_ref(), request).await {
      Ok(report) => {
        tally.rebuilt += 1;
        tally.organization_snapshots += report.organization_snapshots;
      }
      Err(e) => {
        tally.failed += 1;
        warn!(partition, organization = %request.organization_id, error = %e, "rebuild failed");
      }
    }
  }
  tally
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use posture_core::{
    entity::{IpVersion, NewEndpoint, NewOrganization, NewUrl},
    finding::{FindingType, NewFinding, Severity},
  };
  use posture_store_sqlite::SqliteStore;

  use super::*;

  fn t(day: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2021, 6, day, 0, 0, 0).unwrap() }

  #[tokio::test]
  async fn partition_is_stable() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let pool = RebuildPool::spawn(store, OrganizationLocks::new(), 4);
    let id = Uuid::new_v4();
    assert_eq!(pool.partition_of(id), pool.partition_of(id));
    assert!(pool.partition_of(id) < 4);
    pool.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn drains_every_queue_on_shutdown() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    for i in 0..6 {
      let organization = store
        .add_organization(NewOrganization {
          name:           format!("org-{i}"),
          country:        "NL".into(),
          kind:           "municipality".into(),
          twitter_handle: None,
          created_on:     t(1),
        })
        .await
        .unwrap();
      let url = store
        .add_url(NewUrl {
          url:           format!("org-{i}.example"),
          created_on:    t(1),
          organizations: vec![organization.organization_id],
        })
        .await
        .unwrap();
      let endpoint = store
        .add_endpoint(NewEndpoint {
          url_id:     url.url_id,
          protocol:   "https".into(),
          port:       443,
          ip_version: IpVersion::V6,
          created_on: t(1),
        })
        .await
        .unwrap();
      store
        .submit_finding(NewFinding::new(
          endpoint.endpoint_id,
          FindingType::StrictTransportSecurity,
          Severity::new(0, 1, 0),
          "missing",
          t(2),
        ))
        .await
        .unwrap();
    }

    let pool = RebuildPool::spawn(store.clone(), OrganizationLocks::new(), 3);
    let queued = pool.submit_all(store.as_ref(), t(5), true).await.unwrap();
    assert_eq!(queued, 6);

    let tally = pool.shutdown().await.unwrap();
    assert_eq!(tally.rebuilt, 6);
    assert_eq!(tally.failed, 0);
    assert_eq!(store.stacked_organizations(t(5)).await.unwrap().len(), 6);
  }

  #[tokio::test]
  async fn unknown_organization_counts_as_failure() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let pool = RebuildPool::spawn(store, OrganizationLocks::new(), 2);
    pool
      .submit(RebuildRequest {
        organization_id: Uuid::new_v4(),
        create_history:  false,
        as_of:           t(1),
      })
      .await
      .unwrap();
    let tally = pool.shutdown().await.unwrap();
    assert_eq!(tally.failed, 1);
  }
}
