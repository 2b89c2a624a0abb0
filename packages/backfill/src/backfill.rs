use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::BackfillError;
use crate::traits::RepoListing;
use crate::types::RepoJob;
use crate::worker::WorkerPool;

/// Drives one full crawl: pages through the repository listing, submits
/// every active repository to the pool, and watches the result-signal queue
/// to know when the crawl has drained.
pub struct Backfill {
    listing: Arc<dyn RepoListing>,
    page_size: u32,
    /// Jobs submitted but not yet resolved by a result signal. Scoped to one
    /// crawl; completion is `counter == 0` once pagination has finished.
    inflight: Arc<AtomicI64>,
}

impl Backfill {
    pub fn new(listing: Arc<dyn RepoListing>, config: &Config) -> Self {
        Self {
            listing,
            page_size: config.page_size,
            inflight: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn jobs_inflight(&self) -> i64 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Crawl every repository the listing returns. Resolves once pagination
    /// has ended and every submitted job has produced its terminal signal.
    pub async fn backfill_repos(
        &self,
        cancel: &CancellationToken,
        pool: Arc<WorkerPool>,
    ) -> Result<()> {
        pool.pool_ready().await;

        let pages_done = AtomicBool::new(false);
        let crawl_done = CancellationToken::new();

        tokio::try_join!(
            self.consume_results(cancel, &pool, &pages_done, &crawl_done),
            self.fetch_pages(cancel, &pool, &pages_done, &crawl_done),
        )?;
        Ok(())
    }

    /// Drain the result-signal queue, resolving one in-flight job per
    /// signal. Failed jobs are surfaced in the log and counted as resolved;
    /// there is no driver-level redelivery.
    async fn consume_results(
        &self,
        cancel: &CancellationToken,
        pool: &Arc<WorkerPool>,
        pages_done: &AtomicBool,
        crawl_done: &CancellationToken,
    ) -> Result<()> {
        let results = pool.results();
        let mut results = results.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled.into()),
                _ = crawl_done.cancelled() => return Ok(()),
                signal = results.recv() => {
                    let Some(signal) = signal else {
                        // Pool torn down; nothing more will resolve.
                        return Ok(());
                    };
                    if let Err(err) = signal {
                        warn!(error = %err, "backfill job failed");
                    }
                    let remaining = self.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
                    debug!(remaining, "job resolved");
                    if remaining == 0 && pages_done.load(Ordering::SeqCst) {
                        info!("backfill complete");
                        crawl_done.cancel();
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Page through the listing. The cursor is owned here: the next page is
    /// requested only after the previous response's cursor is captured,
    /// while that page's submissions overlap in bounded background tasks.
    async fn fetch_pages(
        &self,
        cancel: &CancellationToken,
        pool: &Arc<WorkerPool>,
        pages_done: &AtomicBool,
        crawl_done: &CancellationToken,
    ) -> Result<()> {
        let submit_limit = Arc::new(Semaphore::new(pool.worker_count()));
        let mut submits: JoinSet<()> = JoinSet::new();
        let mut cursor: Option<String> = None;
        let mut page: u64 = 0;

        let page_err: Option<anyhow::Error> = 'pages: loop {
            page += 1;
            let listed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'pages Some(BackfillError::Cancelled.into()),
                listed = self.listing.list_repos(cursor.as_deref(), self.page_size) => listed,
            };
            let repo_page = match listed {
                Ok(repo_page) => repo_page,
                Err(err) => {
                    break 'pages Some(
                        anyhow::Error::new(err).context("error fetching repo listing page"),
                    );
                }
            };

            info!(
                page,
                cursor = ?cursor,
                page_size = self.page_size,
                repos = repo_page.repos.len(),
                "fetched repo listing page"
            );

            let next = repo_page.cursor.clone().filter(|next| !next.is_empty());
            if next.is_some() && next == cursor {
                // Re-fetching this page would loop forever on the same data.
                break 'pages Some(
                    BackfillError::CursorNotAdvancing {
                        cursor: next.unwrap_or_default(),
                    }
                    .into(),
                );
            }

            for entry in repo_page.repos {
                if !entry.active.unwrap_or(false) {
                    debug!(did = %entry.did, "skipping inactive repo");
                    continue;
                }

                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'pages Some(BackfillError::Cancelled.into()),
                    permit = Arc::clone(&submit_limit).acquire_owned() => {
                        permit.expect("submit semaphore closed")
                    }
                };

                // Count the job before it can possibly resolve, so a fast
                // worker cannot expose a phantom zero.
                self.inflight.fetch_add(1, Ordering::SeqCst);

                let pool = Arc::clone(pool);
                let token = cancel.clone();
                let inflight = Arc::clone(&self.inflight);
                submits.spawn(async move {
                    let _permit = permit;
                    let did = entry.did.clone();
                    let job = RepoJob {
                        did: entry.did,
                        rev: entry.rev,
                    };
                    if let Err(err) = pool.submit(&token, job).await {
                        inflight.fetch_sub(1, Ordering::SeqCst);
                        warn!(did = %did, error = %err, "error submitting repo job");
                    }
                });
            }

            match next {
                Some(next) => cursor = Some(next),
                None => break 'pages None,
            }
        };

        // Let submissions from already-fetched pages land before deciding
        // anything else.
        while submits.join_next().await.is_some() {}

        if let Some(err) = page_err {
            return Err(err);
        }

        pages_done.store(true, Ordering::SeqCst);
        if self.inflight.load(Ordering::SeqCst) == 0 {
            // Every job already resolved (or none existed); wake the
            // consumer rather than leaving it waiting on a signal that will
            // never come.
            crawl_done.cancel();
        }
        Ok(())
    }
}
