//! Bounded worker pools with per-repository serialization
//!
//! A [`WorkerPool`] owns a bounded job queue and a fixed set of worker
//! tasks. Before a job runs, its worker takes the job's repository lock from
//! the shared [`RepoLocks`], so clone, fetch, rescan and head-count work on
//! one repository never overlaps while different repositories proceed in
//! parallel. [`InFlight`] lets producers skip enqueuing a repository that
//! already has a job queued or running.

use crate::core::shutdown::ShutdownCoordinator;
use crate::core::sync::recover_poison;
use crate::store::RepoId;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool '{pool}' queue is full")]
    Full { pool: String },

    #[error("Worker pool '{pool}' is shut down")]
    Closed { pool: String },
}

pub type PoolResult<T> = Result<T, PoolError>;

/// One async mutex per repository, shared by every component that touches
/// a working tree
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<RepoId, Arc<AsyncMutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: RepoId) -> Arc<AsyncMutex<()>> {
        recover_poison(self.locks.lock())
            .entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to a repository
    pub async fn lock(&self, id: RepoId) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }
}

/// Set of keys with queued or running work
#[derive(Debug)]
pub struct InFlight<K: Eq + Hash> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Clone for InFlight<K> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
        }
    }
}

impl<K: Eq + Hash> Default for InFlight<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` when it is already claimed. The claim is
    /// released when the guard drops.
    pub fn try_claim(&self, key: K) -> Option<InFlightGuard<K>> {
        let mut keys = recover_poison(self.keys.lock());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key,
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        recover_poison(self.keys.lock()).contains(key)
    }

    pub fn len(&self) -> usize {
        recover_poison(self.keys.lock()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct InFlightGuard<K: Eq + Hash> {
    keys: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        recover_poison(self.keys.lock()).remove(&self.key);
    }
}

/// Work bound to one repository
pub trait RepoJob: Send + 'static {
    fn repository_id(&self) -> RepoId;
}

pub struct WorkerPool<J: RepoJob> {
    name: String,
    sender: mpsc::Sender<J>,
    workers: Vec<JoinHandle<()>>,
}

impl<J: RepoJob> WorkerPool<J> {
    /// Spawn `workers` tasks reading from a queue of `depth` jobs.
    ///
    /// On shutdown each worker finishes the job in hand and exits; queued
    /// jobs are dropped.
    pub fn start<H, Fut>(
        name: &str,
        workers: usize,
        depth: usize,
        locks: Arc<RepoLocks>,
        shutdown: &ShutdownCoordinator,
        handler: H,
    ) -> Self
    where
        H: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<J>(depth.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let handler = Arc::new(handler);

        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let locks = locks.clone();
                let mut shutdown = shutdown.subscribe();
                let worker_name = format!("{}-{}", name, index);

                tokio::spawn(async move {
                    log::debug!("Worker {} started", worker_name);
                    loop {
                        let job = {
                            let mut receiver = receiver.lock().await;
                            tokio::select! {
                                biased;
                                _ = shutdown.recv() => None,
                                job = receiver.recv() => job,
                            }
                        };
                        let Some(job) = job else {
                            break;
                        };
                        let _repo_guard = locks.lock(job.repository_id()).await;
                        handler(job).await;
                    }
                    log::debug!("Worker {} stopped", worker_name);
                })
            })
            .collect();

        Self {
            name: name.to_string(),
            sender,
            workers,
        }
    }

    /// Handle for producers on other tasks
    pub fn submitter(&self) -> Submitter<J> {
        Submitter {
            name: self.name.clone(),
            sender: self.sender.clone(),
        }
    }

    /// Close the queue and wait for every worker to exit
    pub async fn join(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                log::error!("Worker in pool '{}' panicked: {}", self.name, e);
            }
        }
    }
}

/// Cloneable enqueue side of a [`WorkerPool`]
pub struct Submitter<J> {
    name: String,
    sender: mpsc::Sender<J>,
}

impl<J> Clone for Submitter<J> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<J> Submitter<J> {
    /// Enqueue without waiting
    pub fn try_submit(&self, job: J) -> PoolResult<()> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PoolError::Full {
                pool: self.name.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed {
                pool: self.name.clone(),
            },
        })
    }
}

/// Outcome of asking for work on a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    /// Work for this repository is already pending; this request is served by it
    Coalesced,
    Rejected(String),
}

/// Producer handle that enqueues at most one pending job per repository
pub struct Requests<J> {
    submitter: Submitter<J>,
    pending: InFlight<RepoId>,
}

impl<J> Clone for Requests<J> {
    fn clone(&self) -> Self {
        Self {
            submitter: self.submitter.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<J> Requests<J> {
    pub fn new(submitter: Submitter<J>) -> Self {
        Self {
            submitter,
            pending: InFlight::new(),
        }
    }

    /// Build and enqueue a job carrying the repository's claim. The job
    /// decides when to release it by dropping the guard.
    pub fn request<F>(&self, id: RepoId, make_job: F) -> RequestStatus
    where
        F: FnOnce(InFlightGuard<RepoId>) -> J,
    {
        let Some(claim) = self.pending.try_claim(id) else {
            return RequestStatus::Coalesced;
        };
        match self.submitter.try_submit(make_job(claim)) {
            Ok(()) => RequestStatus::Queued,
            Err(e) => RequestStatus::Rejected(e.to_string()),
        }
    }

    pub fn is_pending(&self, id: RepoId) -> bool {
        self.pending.contains(&id)
    }
}
