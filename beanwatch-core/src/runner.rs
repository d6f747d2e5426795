//! Per-stream poll loop.
//!
//! One runner task per stream, fully isolated from the others: a stream's
//! failure, backoff, or slow cycle never delays another stream. Within a
//! cycle the steps (fetch, classify, reconcile, dispatch, commit) run
//! sequentially because intra-stream ordering must be preserved.
//! State is committed only after dispatch accounting completes, so a
//! crash or shutdown mid-cycle replays the batch from the old cursor
//! (at-least-once delivery, never silent loss).

use crate::classify::StreamClassifier;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::reconcile::reconcile;
use crate::source::{DataSource, SourceError};
use crate::store::{StateStore, StateStoreError};
use crate::stream::{RawRecord, RecordData, StreamConfig, StreamState};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Failure that aborts one cycle without touching persisted state.
#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// Drives one stream: fetch on an interval, detect new events, dispatch
/// them, commit state.
pub struct StreamRunner {
    config: StreamConfig,
    source: Box<dyn DataSource>,
    classifier: StreamClassifier,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn StateStore>,
    /// Previous record context for transition classifiers (peg cross).
    /// Runtime-only: after a restart the first record re-establishes it.
    baseline: Option<RawRecord>,
}

impl StreamRunner {
    pub fn new(
        config: StreamConfig,
        source: Box<dyn DataSource>,
        classifier: StreamClassifier,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            source,
            classifier,
            dispatcher,
            store,
            baseline: None,
        }
    }

    /// Run until shutdown is signaled. The runner owns its stream's state
    /// exclusively (single writer), so it caches the committed copy and
    /// only reads the store on startup.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let stream = self.config.name.clone();
        info!(%stream, "Stream runner started");

        let mut state: Option<StreamState> = None;
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(%stream, "Stream runner received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let current = match &state {
                        Some(s) => s.clone(),
                        None => match self.store.load(stream.as_str()).await {
                            Ok(loaded) => {
                                let s = loaded.unwrap_or_default();
                                info!(%stream, cursor = %s.cursor, "Loaded stream state");
                                state = Some(s.clone());
                                s
                            }
                            Err(e) => {
                                error!(%stream, error = %e, "Failed to load stream state, retrying next cycle");
                                continue;
                            }
                        },
                    };

                    // Race the cycle against shutdown so a cycle stuck in
                    // fetch backoff or channel retries cannot stall
                    // termination. Nothing is committed until the cycle
                    // ends, so dropping it mid-flight just replays the
                    // batch on the next start.
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                info!(%stream, "Shutdown during cycle, discarding uncommitted work");
                                break;
                            }
                        }

                        result = self.run_cycle(&current) => match result {
                            Ok(new_state) => state = Some(new_state),
                            Err(e) => {
                                // State untouched; next cycle retries from
                                // the same cursor. Fetch is idempotent
                                // for it.
                                error!(%stream, error = %e, "Cycle aborted");
                            }
                        }
                    }
                }
            }
        }

        info!(%stream, "Stream runner shutdown complete");
    }

    /// One full cycle. Returns the committed state on success.
    async fn run_cycle(&mut self, state: &StreamState) -> Result<StreamState, CycleError> {
        let stream = self.config.name.clone();

        let records = self.fetch_with_retry(state).await?;
        if records.is_empty() {
            debug!(%stream, cursor = %state.cursor, "No new records");
            return Ok(state.clone());
        }

        let observed_max = records.iter().map(|r| r.key).max();
        let mut candidates = Vec::new();
        let mut next_baseline = self.baseline.clone();
        for record in &records {
            if let Some(event) = self.classifier.classify(next_baseline.as_ref(), record) {
                candidates.push(event);
            }
            if matches!(record.data, RecordData::PriceTick { .. }) {
                next_baseline = Some(record.clone());
            }
        }

        let outcome = reconcile(
            state,
            observed_max,
            candidates,
            self.config.seen_retention,
        );
        debug!(
            %stream,
            fetched = records.len(),
            new_events = outcome.events.len(),
            cursor = %outcome.state.cursor,
            "Reconciled batch"
        );

        // Dispatch in ordering-key order. Failures are recorded per
        // channel and never block the rest of the batch.
        for event in &outcome.events {
            let results = self.dispatcher.dispatch(event).await;
            for result in results {
                if let DispatchOutcome::Failed(reason) = &result.outcome {
                    warn!(
                        %stream,
                        channel = %result.channel,
                        record = %event.source_record_id,
                        attempts = result.attempts,
                        reason = %reason,
                        "Delivery failed"
                    );
                }
            }
        }

        // Commit only after dispatch accounting. A failure here leaves
        // the old state committed and the batch eligible for replay.
        self.store.commit(stream.as_str(), &outcome.state).await?;

        // Advance the classifier baseline only once the cycle is durable,
        // so a replayed batch classifies against the same context.
        self.baseline = next_baseline;

        Ok(outcome.state)
    }

    /// Fetch with a bounded in-cycle retry budget. Only `Unavailable` is
    /// retried; malformed batches abort the cycle immediately.
    async fn fetch_with_retry(&self, state: &StreamState) -> Result<Vec<RawRecord>, CycleError> {
        let stream = &self.config.name;
        let mut attempt = 0u32;
        loop {
            match self.source.fetch(state.cursor).await {
                Ok(records) => return Ok(records),
                Err(SourceError::Unavailable(reason)) => {
                    attempt += 1;
                    if attempt >= self.config.fetch_retry_budget {
                        return Err(SourceError::Unavailable(reason).into());
                    }
                    let delay = self
                        .config
                        .fetch_backoff_base
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        %stream,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Fetch failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e @ SourceError::Data(_)) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::classify::{PegCrossClassifier, SeasonClassifier};
    use crate::dispatch::{ChannelError, NotifyChannel, RetryPolicy};
    use crate::store::MemoryStateStore;
    use crate::stream::{EventKind, OrderingKey};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Source double returning scripted batches, then empty forever.
    struct ScriptedSource {
        batches: Mutex<Vec<Result<Vec<RawRecord>, SourceError>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Result<Vec<RawRecord>, SourceError>>) -> Self {
            Self {
                batches: Mutex::new(batches),
            }
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn fetch(&self, since: OrderingKey) -> Result<Vec<RawRecord>, SourceError> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return Ok(Vec::new());
            }
            // Honor the cursor contract the way a real adapter would.
            batches.remove(0).map(|records| {
                records.into_iter().filter(|r| r.key > since).collect()
            })
        }
    }

    /// Source double that is never reachable.
    struct DownSource;

    #[async_trait]
    impl DataSource for DownSource {
        async fn fetch(&self, _since: OrderingKey) -> Result<Vec<RawRecord>, SourceError> {
            Err(SourceError::Unavailable("graph down".into()))
        }
    }

    /// Store double whose first commit fails, like a dropped connection.
    struct FailingCommitStore {
        inner: MemoryStateStore,
        fail_next: AtomicBool,
    }

    impl FailingCommitStore {
        fn failing_once() -> Self {
            Self {
                inner: MemoryStateStore::new(),
                fail_next: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl StateStore for FailingCommitStore {
        async fn load(&self, stream: &str) -> Result<Option<StreamState>, StateStoreError> {
            self.inner.load(stream).await
        }

        async fn commit(&self, stream: &str, state: &StreamState) -> Result<(), StateStoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StateStoreError::Database(sqlx::Error::PoolClosed));
            }
            self.inner.commit(stream, state).await
        }
    }

    /// Channel double recording delivered messages.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        fail_once: AtomicBool,
    }

    #[async_trait]
    impl NotifyChannel for RecordingChannel {
        fn id(&self) -> &str {
            "recording"
        }

        fn accepts(&self, _kind: EventKind) -> bool {
            true
        }

        async fn send(&self, text: &str) -> Result<(), ChannelError> {
            if self.fail_once.swap(false, Ordering::SeqCst) {
                return Err(ChannelError::Retriable("flaky".into()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn tick(id: &str, seq: u64, price: &str) -> RawRecord {
        RawRecord {
            id: id.into(),
            key: OrderingKey::sequence(seq),
            data: RecordData::PriceTick {
                price: Decimal::from_str(price).unwrap(),
            },
        }
    }

    fn config() -> StreamConfig {
        StreamConfig {
            name: "peg-cross".into(),
            poll_interval: Duration::from_secs(1),
            fetch_retry_budget: 2,
            fetch_backoff_base: Duration::ZERO,
            seen_retention: 1000,
        }
    }

    fn runner_parts() -> (Arc<RecordingChannel>, Arc<Dispatcher>, Arc<MemoryStateStore>) {
        let channel = Arc::new(RecordingChannel::default());
        let dispatcher = Arc::new(Dispatcher::new(
            vec![channel.clone() as Arc<dyn NotifyChannel>],
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        ));
        let store = Arc::new(MemoryStateStore::new());
        (channel, dispatcher, store)
    }

    fn peg_runner(
        source: ScriptedSource,
        dispatcher: Arc<Dispatcher>,
        store: Arc<MemoryStateStore>,
    ) -> StreamRunner {
        StreamRunner::new(
            config(),
            Box::new(source),
            StreamClassifier::PegCross(PegCrossClassifier { peg: Decimal::ONE }),
            dispatcher,
            store,
        )
    }

    #[tokio::test]
    async fn cycle_dispatches_cross_and_commits_state() {
        let (channel, dispatcher, store) = runner_parts();
        let source = ScriptedSource::new(vec![Ok(vec![
            tick("t1", 1, "1.02"),
            tick("t2", 2, "1.00"),
            tick("t3", 3, "0.98"),
        ])]);
        let mut runner = peg_runner(source, dispatcher, store.clone());

        let state = runner.run_cycle(&StreamState::default()).await.unwrap();

        // Exactly one cross: the 1.00 -> 0.98 transition.
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("below"));
        drop(sent);

        assert_eq!(state.cursor, OrderingKey::sequence(3));
        assert!(state.seen.contains("t3"));
        // Commit reached the store with the same state.
        let committed = store.load("peg-cross").await.unwrap().unwrap();
        assert_eq!(committed, state);
    }

    #[tokio::test]
    async fn cursor_advances_without_events() {
        let (channel, dispatcher, store) = runner_parts();
        // Prices hover above peg: records observed, nothing notifiable.
        let source = ScriptedSource::new(vec![Ok(vec![
            tick("t1", 10, "1.01"),
            tick("t2", 11, "1.02"),
        ])]);
        let mut runner = peg_runner(source, dispatcher, store.clone());

        let state = runner.run_cycle(&StreamState::default()).await.unwrap();

        assert!(channel.sent.lock().unwrap().is_empty());
        assert_eq!(state.cursor, OrderingKey::sequence(11));
        assert_eq!(
            store.load("peg-cross").await.unwrap().unwrap().cursor,
            OrderingKey::sequence(11)
        );
    }

    #[tokio::test]
    async fn replayed_batch_is_not_redispatched() {
        let (channel, dispatcher, store) = runner_parts();
        let batch = vec![tick("t1", 1, "1.02"), tick("t2", 2, "0.98")];
        let source = ScriptedSource::new(vec![Ok(batch.clone()), Ok(batch)]);
        let mut runner = peg_runner(source, dispatcher, store.clone());

        let state = runner.run_cycle(&StreamState::default()).await.unwrap();
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        // Second cycle replays the same upstream batch; the cursor filter
        // drops every record before classification.
        let state = runner.run_cycle(&state).await.unwrap();
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
        assert_eq!(state.cursor, OrderingKey::sequence(2));
    }

    #[tokio::test]
    async fn unavailable_source_aborts_cycle_without_state_change() {
        let (channel, dispatcher, store) = runner_parts();
        let source = ScriptedSource::new(vec![
            Err(SourceError::Unavailable("graph down".into())),
            Err(SourceError::Unavailable("graph down".into())),
        ]);
        let mut runner = peg_runner(source, dispatcher, store.clone());

        let before = StreamState {
            cursor: OrderingKey::sequence(50),
            ..Default::default()
        };
        let result = runner.run_cycle(&before).await;

        assert!(result.is_err());
        assert!(channel.sent.lock().unwrap().is_empty());
        // Nothing was committed.
        assert!(store.load("peg-cross").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_fetch_failure_recovers_within_budget() {
        let (channel, dispatcher, store) = runner_parts();
        let source = ScriptedSource::new(vec![
            Err(SourceError::Unavailable("blip".into())),
            Ok(vec![tick("t1", 1, "0.99"), tick("t2", 2, "1.01")]),
        ]);
        let mut runner = peg_runner(source, dispatcher, store);

        let state = runner.run_cycle(&StreamState::default()).await.unwrap();
        assert_eq!(state.cursor, OrderingKey::sequence(2));
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn channel_failure_never_blocks_commit() {
        let (channel, dispatcher, store) = runner_parts();
        channel.fail_once.store(true, Ordering::SeqCst);
        let source = ScriptedSource::new(vec![Ok(vec![
            tick("t1", 1, "1.01"),
            tick("t2", 2, "0.97"),
        ])]);
        let mut runner = peg_runner(source, dispatcher, store.clone());

        let state = runner.run_cycle(&StreamState::default()).await.unwrap();

        // Retried past the transient failure, then committed.
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
        assert_eq!(
            store.load("peg-cross").await.unwrap().unwrap().cursor,
            state.cursor
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_cycle_stuck_in_fetch_backoff() {
        let (channel, dispatcher, store) = runner_parts();
        let runner = StreamRunner::new(
            StreamConfig {
                name: "peg-cross".into(),
                poll_interval: Duration::from_millis(10),
                fetch_retry_budget: 100,
                fetch_backoff_base: Duration::from_secs(60),
                seen_retention: 1000,
            },
            Box::new(DownSource),
            StreamClassifier::PegCross(PegCrossClassifier { peg: Decimal::ONE }),
            dispatcher,
            store.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));

        // Let a cycle start and park in its 60 s backoff sleep.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        // The runner must return promptly, not after the backoff.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(channel.sent.lock().unwrap().is_empty());
        assert!(store.load("peg-cross").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_failure_aborts_cycle_and_replays_from_old_cursor() {
        let (channel, dispatcher, _) = runner_parts();
        let store = Arc::new(FailingCommitStore::failing_once());
        let batch = vec![tick("t1", 1, "1.02"), tick("t2", 2, "0.98")];
        let source = ScriptedSource::new(vec![Ok(batch.clone()), Ok(batch)]);
        let mut runner = StreamRunner::new(
            config(),
            Box::new(source),
            StreamClassifier::PegCross(PegCrossClassifier { peg: Decimal::ONE }),
            dispatcher,
            store.clone(),
        );

        let before = StreamState::default();
        let result = runner.run_cycle(&before).await;

        // Dispatch ran, then the commit failed and aborted the cycle.
        assert!(result.is_err());
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
        assert!(store.load("peg-cross").await.unwrap().is_none());

        // Retry from the untouched state: the batch replays, classifies
        // the same cross again (baseline was not advanced), and commits.
        let state = runner.run_cycle(&before).await.unwrap();
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("below"));
        drop(sent);

        assert_eq!(state.cursor, OrderingKey::sequence(2));
        assert_eq!(store.load("peg-cross").await.unwrap().unwrap(), state);
    }

    #[tokio::test]
    async fn season_stream_emits_every_snapshot_in_order() {
        let (channel, dispatcher, store) = runner_parts();
        let season = |id: &str, n: u64| RawRecord {
            id: id.into(),
            key: OrderingKey::sequence(n),
            data: RecordData::Season {
                season: n,
                minted_beans: Decimal::from(25_000),
                sown_beans: Decimal::from(1_200),
                soil: Decimal::from(300),
                temperature: Decimal::from(18),
            },
        };
        let source = ScriptedSource::new(vec![Ok(vec![season("s2", 2), season("s1", 1)])]);
        let mut runner = StreamRunner::new(
            StreamConfig {
                name: "season".into(),
                ..config()
            },
            Box::new(source),
            StreamClassifier::Season(SeasonClassifier),
            dispatcher,
            store,
        );

        runner.run_cycle(&StreamState::default()).await.unwrap();

        // Out-of-order fetch still dispatches ascending.
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("Season 1"));
        assert!(sent[1].contains("Season 2"));
    }
}
