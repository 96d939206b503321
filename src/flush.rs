use std::{sync::Arc, time::Duration};

use chrono::Utc;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{BackoffConfig, PollBackoff},
    batch::{BatchDocument, BatchResult},
    batcher::{Batcher, Pending},
    config::Config,
    record::{CompletionError, CompletionSender, LogRecord},
    store::{BlobStatus, Identity, RemoteStore, StoreError},
};

#[derive(Debug, Clone)]
pub struct FlushOptions {
    pub flush_interval: Duration,
    pub max_buffer_size: usize,
    pub submit_timeout: Duration,
    /// Failed submits tolerated per record before it is dropped. `None`
    /// retries forever.
    pub max_retries: Option<u32>,
    /// Resolve completions only once the store reports the batch confirmed.
    pub wait_for_confirmation: bool,
    pub confirmation_backoff: BackoffConfig,
    pub confirmation_timeout: Duration,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            max_buffer_size: 1000,
            submit_timeout: Duration::from_secs(10),
            max_retries: None,
            wait_for_confirmation: false,
            confirmation_backoff: BackoffConfig {
                base: Duration::from_secs(2),
                cap: Duration::from_secs(30),
                jitter_divisor: 4,
            },
            confirmation_timeout: Duration::from_secs(600),
        }
    }
}

impl FlushOptions {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            max_buffer_size: usize::try_from(config.max_buffer_size).unwrap_or(usize::MAX),
            submit_timeout: Duration::from_millis(config.submit_timeout_ms),
            max_retries: config.max_retries,
            wait_for_confirmation: config.wait_for_confirmation,
            confirmation_backoff: BackoffConfig {
                base: Duration::from_millis(config.confirmation_poll_interval_ms),
                ..defaults.confirmation_backoff
            },
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
        }
    }
}

#[derive(Debug)]
pub enum FlushError {
    Encode(serde_json::Error),
    Submit(StoreError),
}

impl std::fmt::Display for FlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode batch: {e}"),
            Self::Submit(e) => write!(f, "submit batch: {e}"),
        }
    }
}

impl std::error::Error for FlushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            Self::Submit(e) => Some(e),
        }
    }
}

/// The final flush during shutdown failed; `undelivered` lists the local ids
/// of records that never reached the store.
#[derive(Debug)]
pub struct ShutdownFlushError {
    pub undelivered: Vec<String>,
    pub source: FlushError,
}

impl std::fmt::Display for ShutdownFlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "final flush failed, {} records undelivered: {}",
            self.undelivered.len(),
            self.source
        )
    }
}

impl std::error::Error for ShutdownFlushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub submitted_batches: u64,
    pub delivered_records: u64,
    pub failed_submissions: u64,
    pub dead_lettered: u64,
    pub buffered: usize,
}

pub(crate) enum Control {
    Flush {
        reply: oneshot::Sender<Result<usize, FlushError>>,
    },
    Shutdown,
}

pub(crate) struct FlushTaskHandle {
    pub records: mpsc::UnboundedSender<Pending>,
    pub control: mpsc::UnboundedSender<Control>,
    pub stats: watch::Receiver<FlushStats>,
    pub task: JoinHandle<Result<(), ShutdownFlushError>>,
}

pub(crate) fn spawn_flush_task(
    store: Arc<dyn RemoteStore>,
    identity: Identity,
    options: FlushOptions,
) -> FlushTaskHandle {
    let (records_tx, records_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (stats_tx, stats_rx) = watch::channel(FlushStats::default());

    let task = FlushTask {
        batcher: Batcher::new(options.max_buffer_size),
        store,
        identity,
        options,
        retry_wait: false,
        stats: stats_tx,
        confirmations: JoinSet::new(),
    };

    FlushTaskHandle {
        records: records_tx,
        control: control_tx,
        stats: stats_rx,
        task: tokio::spawn(task.run(records_rx, control_rx)),
    }
}

struct FlushTask {
    store: Arc<dyn RemoteStore>,
    identity: Identity,
    options: FlushOptions,
    batcher: Batcher,
    /// Set after a failed submit; cleared by the next timer tick. While set,
    /// reaching the threshold does not trigger a flush and a full buffer
    /// stops accepting records.
    retry_wait: bool,
    stats: watch::Sender<FlushStats>,
    confirmations: JoinSet<()>,
}

impl FlushTask {
    async fn run(
        mut self,
        mut records_rx: mpsc::UnboundedReceiver<Pending>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> Result<(), ShutdownFlushError> {
        let period = self.options.flush_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let accepting = !(self.retry_wait && self.batcher.is_full());

            tokio::select! {
                biased;
                ctl = control_rx.recv() => {
                    match ctl {
                        Some(Control::Flush { reply }) => {
                            let result = self.flush_queued(&mut records_rx).await;
                            interval.reset();
                            let _ = reply.send(result);
                        }
                        Some(Control::Shutdown) | None => break,
                    }
                }
                _ = interval.tick() => {
                    self.retry_wait = false;
                    if !self.batcher.is_empty() {
                        debug!(
                            buffered = self.batcher.len(),
                            oldest = ?self.batcher.oldest_enqueued_at(),
                            "timer flush"
                        );
                        let _ = self.flush().await;
                    }
                }
                maybe = records_rx.recv(), if accepting => {
                    let Some(pending) = maybe else { break };
                    let due = self.batcher.add(pending);
                    self.publish();
                    if due && !self.retry_wait {
                        debug!(buffered = self.batcher.len(), "threshold flush");
                        let _ = self.flush().await;
                        // Coalesce: the next tick is a full period away.
                        interval.reset();
                    }
                }
                Some(joined) = self.confirmations.join_next(), if !self.confirmations.is_empty() => {
                    if let Err(err) = joined {
                        warn!(%err, "confirmation task ended abnormally");
                    }
                }
            }
        }

        self.shutdown(records_rx).await
    }

    /// Moves records already sent to the task into the buffer, stopping at
    /// the threshold. Returns true if it stopped because the buffer is full.
    fn absorb_queued(&mut self, records_rx: &mut mpsc::UnboundedReceiver<Pending>) -> bool {
        let mut full = self.batcher.is_full();
        while !full {
            let Ok(pending) = records_rx.try_recv() else {
                break;
            };
            full = self.batcher.add(pending);
        }
        self.publish();
        full
    }

    /// Flushes everything logged so far, one threshold-sized batch at a time.
    async fn flush_queued(
        &mut self,
        records_rx: &mut mpsc::UnboundedReceiver<Pending>,
    ) -> Result<usize, FlushError> {
        let mut total = 0;
        loop {
            let more = self.absorb_queued(records_rx);
            total += self.flush().await?;
            if !more {
                return Ok(total);
            }
        }
    }

    fn publish(&self) {
        let buffered = self.batcher.len();
        self.stats.send_modify(|s| s.buffered = buffered);
    }

    async fn flush(&mut self) -> Result<usize, FlushError> {
        let drained = self.batcher.drain();
        if drained.is_empty() {
            return Ok(0);
        }

        match self.submit(drained).await {
            Ok(n) => {
                self.retry_wait = false;
                Ok(n)
            }
            Err((drained, err)) => {
                warn!(
                    %err,
                    records = drained.len(),
                    "flush failed; records requeued for next interval"
                );
                self.requeue_failed(drained);
                self.retry_wait = true;
                Err(err)
            }
        }
    }

    /// Submits one batch. On success the completions are resolved (or handed
    /// to a confirmation poller); on failure the entries are handed back.
    async fn submit(&mut self, drained: Vec<Pending>) -> Result<usize, (Vec<Pending>, FlushError)> {
        let records: Vec<LogRecord> = drained.iter().map(|p| p.record.clone()).collect();
        let encoded = BatchDocument::new(self.identity.clone(), records)
            .and_then(|doc| doc.encode().map(|payload| (doc, payload)));
        let (doc, payload) = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                self.stats.send_modify(|s| s.failed_submissions += 1);
                return Err((drained, FlushError::Encode(err)));
            }
        };

        let timeout = self.options.submit_timeout;
        let handle = match tokio::time::timeout(timeout, self.store.submit(payload)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                self.stats.send_modify(|s| s.failed_submissions += 1);
                return Err((drained, FlushError::Submit(err)));
            }
            Err(_) => {
                self.stats.send_modify(|s| s.failed_submissions += 1);
                return Err((drained, FlushError::Submit(StoreError::Timeout(timeout))));
            }
        };

        let n = drained.len();
        info!(handle = %handle, records = n, "batch submitted");
        self.stats.send_modify(|s| {
            s.submitted_batches += 1;
            s.delivered_records += n as u64;
        });
        self.publish();

        let batch = BatchResult::accepted(handle, doc.records);
        let completions: Vec<CompletionSender> = drained.into_iter().map(|p| p.completion).collect();
        if self.options.wait_for_confirmation {
            self.spawn_confirmation(batch, completions);
        } else {
            for (entry, tx) in batch.into_entries(Utc::now()).zip(completions) {
                let _ = tx.send(Ok(entry));
            }
        }
        Ok(n)
    }

    fn requeue_failed(&mut self, drained: Vec<Pending>) {
        let mut retry = Vec::with_capacity(drained.len());
        let mut dead = 0u64;
        for mut pending in drained {
            pending.attempts = pending.attempts.saturating_add(1);
            match self.options.max_retries {
                Some(max) if pending.attempts > max => {
                    error!(
                        record_id = %pending.record.id,
                        attempts = pending.attempts,
                        "record dropped after exhausting retries"
                    );
                    let _ = pending.completion.send(Err(CompletionError::Undeliverable {
                        attempts: pending.attempts,
                    }));
                    dead += 1;
                }
                _ => retry.push(pending),
            }
        }
        if dead > 0 {
            self.stats.send_modify(|s| s.dead_lettered += dead);
        }
        self.batcher.requeue_front(retry);
        self.publish();
    }

    fn spawn_confirmation(&mut self, batch: BatchResult, completions: Vec<CompletionSender>) {
        let poller = PollBackoff::new(
            self.options.confirmation_backoff.clone(),
            StdRng::from_entropy(),
        );
        self.confirmations.spawn(await_confirmation(
            self.store.clone(),
            batch,
            completions,
            poller,
            self.options.confirmation_timeout,
        ));
    }

    async fn shutdown(
        mut self,
        mut records_rx: mpsc::UnboundedReceiver<Pending>,
    ) -> Result<(), ShutdownFlushError> {
        records_rx.close();

        let mut failure = None;
        loop {
            let more = self.absorb_queued(&mut records_rx);
            let drained = self.batcher.drain();
            if drained.is_empty() {
                break;
            }
            info!(records = drained.len(), "final flush");
            match self.submit(drained).await {
                Ok(_) if more => {}
                Ok(_) => break,
                Err(failed) => {
                    failure = Some(failed);
                    break;
                }
            }
        }

        let result = match failure {
            None => Ok(()),
            Some((mut undelivered, err)) => {
                undelivered.extend(self.batcher.drain());
                while let Ok(pending) = records_rx.try_recv() {
                    undelivered.push(pending);
                }
                error!(%err, records = undelivered.len(), "final flush failed");
                let ids = undelivered.iter().map(|p| p.record.id.clone()).collect();
                for pending in undelivered {
                    let _ = pending
                        .completion
                        .send(Err(CompletionError::ShutdownFlushFailed));
                }
                Err(ShutdownFlushError {
                    undelivered: ids,
                    source: err,
                })
            }
        };
        self.publish();

        while let Some(joined) = self.confirmations.join_next().await {
            if let Err(err) = joined {
                warn!(%err, "confirmation task ended abnormally");
            }
        }
        result
    }
}

async fn await_confirmation(
    store: Arc<dyn RemoteStore>,
    mut batch: BatchResult,
    completions: Vec<CompletionSender>,
    mut poller: PollBackoff<StdRng>,
    timeout: Duration,
) {
    let handle = batch.handle.clone();
    let settled = tokio::time::timeout(timeout, async {
        loop {
            match store.get_status(&handle).await {
                Ok(BlobStatus::Pending) => {}
                Ok(status) => return status,
                Err(err) => debug!(%err, handle = %handle, "status poll failed"),
            }
            tokio::time::sleep(poller.next_delay()).await;
        }
    })
    .await;

    match settled {
        Ok(BlobStatus::Confirmed) => {
            debug!(handle = %handle, polls = poller.polls(), "batch confirmed");
            batch.status = BlobStatus::Confirmed;
            for (entry, tx) in batch.into_entries(Utc::now()).zip(completions) {
                let _ = tx.send(Ok(entry));
            }
        }
        Ok(_) => {
            warn!(handle = %handle, "batch reported failed after submit");
            for tx in completions {
                let _ = tx.send(Err(CompletionError::BatchFailed {
                    handle: handle.clone(),
                }));
            }
        }
        Err(_) => {
            warn!(handle = %handle, polls = poller.polls(), "batch not confirmed before timeout");
            for tx in completions {
                let _ = tx.send(Err(CompletionError::ConfirmationTimeout {
                    handle: handle.clone(),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::{LogCompletion, LogOptions},
        store::{BatchHandle, MemoryStore},
    };
    use pretty_assertions::assert_eq;

    fn options() -> FlushOptions {
        FlushOptions {
            flush_interval: Duration::from_millis(100),
            max_buffer_size: 10,
            submit_timeout: Duration::from_secs(1),
            confirmation_backoff: BackoffConfig {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                jitter_divisor: 0,
            },
            confirmation_timeout: Duration::from_secs(5),
            ..FlushOptions::default()
        }
    }

    fn enqueue(handle: &FlushTaskHandle, content: &str) -> LogCompletion {
        let record = LogRecord::new(content.into(), LogOptions::default());
        let (tx, completion) = LogCompletion::channel(record.id.clone());
        handle.records.send(Pending::new(record, tx)).unwrap();
        completion
    }

    fn spawn(store: &Arc<MemoryStore>, options: FlushOptions) -> FlushTaskHandle {
        spawn_flush_task(store.clone(), Identity::new("test"), options)
    }

    #[tokio::test(start_paused = true)]
    async fn submit_timeout_is_treated_as_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set_submit_delay(Some(Duration::from_secs(5))).await;
        let handle = spawn(&store, options());

        let completion = enqueue(&handle, "slow");
        tokio::time::sleep(Duration::from_millis(1_150)).await;
        assert!(store.submit_attempts().await.is_empty());
        assert_eq!(handle.stats.borrow().failed_submissions, 1);
        assert_eq!(handle.stats.borrow().buffered, 1);

        store.set_submit_delay(None).await;
        let entry = completion.await.unwrap();
        assert_eq!(entry.content, "slow");
        assert_eq!(store.submit_attempts().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_during_a_slow_threshold_flush_are_coalesced() {
        let store = Arc::new(MemoryStore::new());
        store.set_submit_delay(Some(Duration::from_millis(250))).await;
        let handle = spawn(
            &store,
            FlushOptions {
                max_buffer_size: 2,
                ..options()
            },
        );

        // Threshold flush runs from 0ms to 250ms, across two timer periods.
        let a = enqueue(&handle, "a");
        let b = enqueue(&handle, "b");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let c = enqueue(&handle, "c");

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(store.submit_attempts().await.len(), 1);
        assert_eq!(handle.stats.borrow().buffered, 1);
        assert_eq!(a.await.unwrap().id, b.await.unwrap().id);
        store.set_submit_delay(None).await;

        // The missed ticks do not fire on return; the next one is a full
        // period after the flush finished.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.submit_attempts().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let attempts = store.submit_attempts().await;
        assert_eq!(attempts.len(), 2);
        let second = BatchDocument::decode(&attempts[1].payload).unwrap();
        assert_eq!(
            second.records.iter().map(|r| r.content.clone()).collect::<Vec<_>>(),
            vec![serde_json::json!("c")]
        );
        assert_eq!(c.await.unwrap().content, "c");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.submit_attempts().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_dead_lettered_after_max_retries() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_submits(u32::MAX).await;
        let handle = spawn(
            &store,
            FlushOptions {
                max_retries: Some(1),
                ..options()
            },
        );

        let completion = enqueue(&handle, "doomed");
        assert_eq!(
            completion.await,
            Err(CompletionError::Undeliverable { attempts: 2 })
        );
        assert_eq!(store.submit_attempts().await.len(), 2);
        assert_eq!(handle.stats.borrow().dead_lettered, 1);
        assert_eq!(handle.stats.borrow().buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_reports_count_and_error() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(&store, options());

        let _a = enqueue(&handle, "a");
        let _b = enqueue(&handle, "b");
        let (reply, rx) = oneshot::channel();
        handle.control.send(Control::Flush { reply }).unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), 2);

        store.fail_next_submits(1).await;
        let _c = enqueue(&handle, "c");
        let (reply, rx) = oneshot::channel();
        handle.control.send(Control::Flush { reply }).unwrap();
        assert!(matches!(rx.await.unwrap(), Err(FlushError::Submit(_))));
        assert_eq!(handle.stats.borrow().buffered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_mode_waits_for_confirmed_status() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(
            &store,
            FlushOptions {
                max_buffer_size: 1,
                wait_for_confirmation: true,
                ..options()
            },
        );

        let mut completion = enqueue(&handle, "c");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.submit_attempts().await.len(), 1);
        assert_eq!(completion.try_result(), None);

        let submitted = store.handles().await;
        store.set_status(&submitted[0], BlobStatus::Confirmed).await;
        let entry = completion.await.unwrap();
        assert_eq!(entry.status.kind, BlobStatus::Confirmed);
        assert_eq!(entry.id, submitted[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_mode_reports_failed_batches() {
        let store = Arc::new(MemoryStore::new());
        store.set_initial_status(BlobStatus::Failed).await;
        let handle = spawn(
            &store,
            FlushOptions {
                max_buffer_size: 1,
                wait_for_confirmation: true,
                ..options()
            },
        );

        let completion = enqueue(&handle, "c");
        assert_eq!(
            completion.await,
            Err(CompletionError::BatchFailed {
                handle: BatchHandle::new("job-1")
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_mode_times_out() {
        let store = Arc::new(MemoryStore::new());
        let handle = spawn(
            &store,
            FlushOptions {
                max_buffer_size: 1,
                wait_for_confirmation: true,
                confirmation_timeout: Duration::from_millis(200),
                ..options()
            },
        );

        let completion = enqueue(&handle, "c");
        assert!(matches!(
            completion.await,
            Err(CompletionError::ConfirmationTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_sender_flushes_what_is_buffered() {
        let store = Arc::new(MemoryStore::new());
        let FlushTaskHandle {
            records,
            control,
            task,
            ..
        } = spawn(&store, options());

        let record = LogRecord::new("last".into(), LogOptions::default());
        let (tx, completion) = LogCompletion::channel(record.id.clone());
        records.send(Pending::new(record, tx)).unwrap();
        drop(records);
        drop(control);

        task.await.unwrap().unwrap();
        assert_eq!(completion.await.unwrap().content, "last");
    }
}
