use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{BackfillError, LexiconError, PoolError};
use crate::lexicon;
use crate::ratelimit::{OpClass, RateLimiter};
use crate::traits::{IdentityResolver, RecordStore, SnapshotDecoder, SnapshotFetcher};
use crate::types::{RepoJob, RepoRecord};

/// Terminal outcome of one record's ingest, observed by the backfill driver
/// for in-flight accounting.
pub type ResultSignal = Result<()>;

/// Bounded two-stage pipeline: W fetch workers pull repo jobs and emit
/// classified records, W ingest workers push records into the store. All
/// hand-offs are bounded queues; cancellation is observed between queue
/// operations.
pub struct WorkerPool {
    resolver: Arc<dyn IdentityResolver>,
    snapshots: Arc<dyn SnapshotFetcher>,
    decoder: Arc<dyn SnapshotDecoder>,
    store: Arc<dyn RecordStore>,
    rate_limiter: RateLimiter,
    worker_count: usize,

    jobs_tx: mpsc::Sender<RepoJob>,
    jobs_rx: Arc<Mutex<mpsc::Receiver<RepoJob>>>,
    records_tx: mpsc::Sender<RepoRecord>,
    records_rx: Arc<Mutex<mpsc::Receiver<RepoRecord>>>,
    results_tx: mpsc::Sender<ResultSignal>,
    results_rx: Arc<Mutex<mpsc::Receiver<ResultSignal>>>,

    pool_ready_tx: watch::Sender<bool>,
    ingest_ready_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: &Config,
        resolver: Arc<dyn IdentityResolver>,
        snapshots: Arc<dyn SnapshotFetcher>,
        decoder: Arc<dyn SnapshotDecoder>,
        store: Arc<dyn RecordStore>,
        rate_limiter: RateLimiter,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        let record_buffer = config.record_buffer.max(1);

        let (jobs_tx, jobs_rx) = mpsc::channel(worker_count * 2);
        let (records_tx, records_rx) = mpsc::channel(record_buffer);
        let (results_tx, results_rx) = mpsc::channel(worker_count * 2);
        let (pool_ready_tx, _) = watch::channel(false);
        let (ingest_ready_tx, _) = watch::channel(false);

        Self {
            resolver,
            snapshots,
            decoder,
            store,
            rate_limiter,
            worker_count,
            jobs_tx,
            jobs_rx: Arc::new(Mutex::new(jobs_rx)),
            records_tx,
            records_rx: Arc::new(Mutex::new(records_rx)),
            results_tx,
            results_rx: Arc::new(Mutex::new(results_rx)),
            pool_ready_tx,
            ingest_ready_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Resolves once the fetch and ingest workers have been dispatched.
    pub async fn pool_ready(&self) {
        let mut rx = self.pool_ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Resolves once the ingest workers are listening.
    pub async fn ingest_ready(&self) {
        let mut rx = self.ingest_ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Result-signal queue, one terminal outcome per ingested record. The
    /// driver is the sole consumer.
    pub fn results(&self) -> Arc<Mutex<mpsc::Receiver<ResultSignal>>> {
        Arc::clone(&self.results_rx)
    }

    /// Start the pool and block until every worker has exited. Workers exit
    /// promptly on cancellation; queued work is abandoned, not drained.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(worker_count = self.worker_count, "starting worker pool");

        let mut handles = Vec::with_capacity(self.worker_count * 2);
        for i in 0..self.worker_count {
            let worker = Arc::clone(&self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker.fetch_worker(i + 1, token).await
            }));
        }
        for i in 0..self.worker_count {
            let worker = Arc::clone(&self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker.ingest_worker(i + 1, token).await
            }));
        }

        // Fold the governing token into the pool's own shutdown signal so
        // submitters see a distinguishable "shutting down" error.
        let shutdown = self.shutdown.clone();
        let watcher = cancel.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            shutdown.cancel();
        });

        self.pool_ready_tx.send_replace(true);
        self.ingest_ready_tx.send_replace(true);

        let joined = join_all(handles).await;
        // No worker is listening anymore; make that visible to submitters
        // even if the watcher task has not been scheduled yet.
        self.shutdown.cancel();
        for worker in joined {
            worker??;
        }
        Ok(())
    }

    /// Queue one repo job, blocking while the job queue is full.
    pub async fn submit(&self, cancel: &CancellationToken, job: RepoJob) -> Result<(), PoolError> {
        if job.did.trim().is_empty() {
            return Err(PoolError::EmptyJob);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            _ = self.shutdown.cancelled() => Err(PoolError::ShuttingDown),
            sent = self.jobs_tx.send(job) => sent.map_err(|_| PoolError::ShuttingDown),
        }
    }

    /// Periodically log queue depths while the crawl runs.
    pub fn start_monitor(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(
                            jobs_queued = self.jobs_tx.max_capacity() - self.jobs_tx.capacity(),
                            records_queued = self.records_tx.max_capacity() - self.records_tx.capacity(),
                            results_queued = self.results_tx.max_capacity() - self.results_tx.capacity(),
                            "worker pool queue depth"
                        );
                    }
                }
            }
        })
    }

    async fn fetch_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) -> Result<()> {
        info!(stage = "fetch", worker_id, "worker started");

        loop {
            let job = {
                let mut jobs = self.jobs_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(stage = "fetch", worker_id, "worker cancelled");
                        return Ok(());
                    }
                    job = jobs.recv() => job,
                }
            };
            let Some(job) = job else {
                info!(stage = "fetch", worker_id, "job queue closed");
                return Ok(());
            };

            debug!(stage = "fetch", worker_id, did = %job.did, "processing job");

            let emitted = Arc::new(AtomicUsize::new(0));
            let outcome = self
                .rate_limiter
                .with_retry(&cancel, OpClass::Read, "get-repo", || {
                    self.fetch_repo(&cancel, &job, Arc::clone(&emitted))
                })
                .await;

            if let Err(err) = outcome {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                warn!(stage = "fetch", worker_id, did = %job.did, error = %err, "repo fetch failed");
                // One repo's failure must not halt the pool, but the job has
                // to resolve the driver's in-flight accounting. Records
                // already emitted carry that signal through ingest instead.
                if emitted.load(Ordering::SeqCst) == 0 {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        sent = self.results_tx.send(Err(err)) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// One job's fetch stage: resolve the actor, download and decode its
    /// snapshot, classify every record and emit the keepers.
    async fn fetch_repo(
        &self,
        cancel: &CancellationToken,
        job: &RepoJob,
        emitted: Arc<AtomicUsize>,
    ) -> Result<()> {
        let identity = self.resolver.resolve(&job.did).await?;
        let endpoint = identity
            .pds_endpoint
            .clone()
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or_else(|| anyhow!("no pds endpoint for identity: {}", job.did))?;

        let bytes = self.snapshots.fetch_snapshot(&endpoint, &identity.did).await?;
        let mut snapshot = self.decoder.decode(bytes)?;
        let commit = snapshot.commit().clone();
        let identity = Arc::new(identity);

        let mut skipped = 0usize;
        for entry in snapshot.records() {
            let (path, data) = entry?;
            let kind = match lexicon::classify(&path, &data) {
                Ok(kind) => kind,
                Err(err @ (LexiconError::UnknownNsid { .. } | LexiconError::NotEnabled { .. })) => {
                    debug!(did = %commit.did, path = %path, reason = %err, "skipping record");
                    skipped += 1;
                    continue;
                }
                Err(err @ LexiconError::WrongType { .. }) => return Err(err.into()),
            };

            let record = RepoRecord {
                data,
                did: commit.did.clone(),
                identity: Arc::clone(&identity),
                rev: commit.rev.clone(),
                sig: commit.sig.clone(),
                kind,
                version: commit.version,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled.into()),
                sent = self.records_tx.send(record) => {
                    sent.map_err(|_| anyhow!("record queue closed"))?;
                }
            }
            emitted.fetch_add(1, Ordering::SeqCst);
        }

        if skipped > 0 {
            debug!(did = %commit.did, skipped, "records skipped by classifier");
        }
        Ok(())
    }

    async fn ingest_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) -> Result<()> {
        info!(stage = "ingest", worker_id, "worker started");

        loop {
            let record = {
                let mut records = self.records_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(stage = "ingest", worker_id, "worker cancelled");
                        return Ok(());
                    }
                    record = records.recv() => record,
                }
            };
            let Some(record) = record else {
                info!(stage = "ingest", worker_id, "record queue closed");
                return Ok(());
            };

            debug!(
                stage = "ingest",
                worker_id,
                did = %record.did,
                record_kind = %record.kind,
                "processing record"
            );

            let outcome = self
                .rate_limiter
                .with_retry(&cancel, OpClass::Write, "ingest", || {
                    self.store.ingest(&cancel, worker_id, &record)
                })
                .await;

            if let Err(err) = &outcome {
                warn!(
                    stage = "ingest",
                    worker_id,
                    did = %record.did,
                    error = %err,
                    "retries exhausted"
                );
            }

            // Exactly one signal per record, success or failure.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = self.results_tx.send(outcome) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::traits::RepoSnapshot;
    use crate::types::Identity;
    use async_trait::async_trait;

    struct NoopResolver;

    #[async_trait]
    impl IdentityResolver for NoopResolver {
        async fn resolve(&self, did: &str) -> Result<Identity, ApiError> {
            Ok(Identity {
                did: did.to_string(),
                handle: "noop.test".into(),
                pds_endpoint: Some("https://pds.test".into()),
            })
        }
    }

    struct NoopFetcher;

    #[async_trait]
    impl SnapshotFetcher for NoopFetcher {
        async fn fetch_snapshot(&self, _endpoint: &str, _did: &str) -> Result<Vec<u8>, ApiError> {
            Ok(Vec::new())
        }
    }

    struct NoopDecoder;

    impl SnapshotDecoder for NoopDecoder {
        fn decode(&self, _bytes: Vec<u8>) -> Result<Box<dyn RepoSnapshot>> {
            Err(anyhow!("no snapshots in this test"))
        }
    }

    struct NoopStore;

    #[async_trait]
    impl RecordStore for NoopStore {
        async fn ingest(
            &self,
            _cancel: &CancellationToken,
            _worker_id: usize,
            _record: &RepoRecord,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn pool() -> Arc<WorkerPool> {
        let config = Config {
            worker_count: 2,
            ..Config::default()
        };
        Arc::new(WorkerPool::new(
            &config,
            Arc::new(NoopResolver),
            Arc::new(NoopFetcher),
            Arc::new(NoopDecoder),
            Arc::new(NoopStore),
            RateLimiter::new(3),
        ))
    }

    #[tokio::test]
    async fn submit_rejects_empty_did() {
        let pool = pool();
        let err = pool
            .submit(
                &CancellationToken::new(),
                RepoJob {
                    did: "".into(),
                    rev: "rev".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::EmptyJob));
    }

    #[tokio::test]
    async fn submit_fails_once_pool_is_shutting_down() {
        let pool = pool();
        let cancel = CancellationToken::new();

        let runner = tokio::spawn(Arc::clone(&pool).start(cancel.clone()));
        pool.pool_ready().await;

        cancel.cancel();
        runner.await.unwrap().unwrap();

        // A fresh caller token isolates the shutdown branch.
        let err = pool
            .submit(
                &CancellationToken::new(),
                RepoJob {
                    did: "did:plc:abc".into(),
                    rev: "rev".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ShuttingDown));
    }

    #[tokio::test]
    async fn submit_observes_caller_cancellation() {
        let pool = pool();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Pool never started; only the caller token can fire.
        let err = pool
            .submit(
                &cancel,
                RepoJob {
                    did: "did:plc:abc".into(),
                    rev: "rev".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
    }

    #[tokio::test]
    async fn readiness_latches_fire_after_start() {
        let pool = pool();
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&pool).start(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(1), async {
            pool.pool_ready().await;
            pool.ingest_ready().await;
        })
        .await
        .expect("pool readiness timed out");

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }
}
