//! The trickle engine.
//!
//! Two cooperating loops share one mutex-guarded queue pair. The main loop
//! releases scheduled votes on their offsets; the retry loop re-attempts
//! transiently failed votes with jittered exponential backoff. Either loop
//! can discover the run-terminal condition (the server reporting that the
//! voting window has closed) first, so each owns a one-shot latch telling
//! the other to stop: collapsing them into a single signal would deadlock
//! the survivor.
//!
//! A ticket lives in at most one queue at any instant, so its submissions
//! are strictly serialized; across tickets no ordering is promised. Every
//! attempt lands in the journal before the next step of work, which is what
//! makes a crashed run reconcilable afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Local;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::api::{CastBallot, CastVote, CastVoteReply, VoteError};
use crate::client::{BallotSubmitter, ClientError, RetryError};
use crate::journal::Journal;
use crate::schedule::VoteInterval;

/// Backoff doubling stops after this many attempts.
const BACKOFF_EXPONENT_CAP: u32 = 6;

/// Engine errors. Transport-class failures are handled inside the engine via
/// the retry queue; everything here ends the run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine was started with an empty schedule.
    #[error("no scheduled votes to cast")]
    NoWork,

    /// A journal write failed. Partial records may remain on disk.
    #[error(transparent)]
    Journal(#[from] crate::journal::JournalError),

    /// A submission failed in a way that retrying cannot fix.
    #[error("unrecoverable ballot error: {0}")]
    Ballot(#[source] ClientError),

    /// The retry worker panicked or was aborted.
    #[error("retry worker died")]
    RetryTask,
}

/// A vote whose last attempt failed retryably.
#[derive(Debug, Clone)]
pub struct RetryItem {
    /// The signed vote.
    pub vote: CastVote,
    /// Completed retry attempts. Never exceeds the engine's attempt cap
    /// while the item is queued.
    pub attempts: u32,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Proposal token the run is voting on.
    pub token: String,
    /// Base interval of the retry backoff.
    pub retry_interval: Duration,
    /// Retry attempts per vote before it is abandoned.
    pub max_attempts: u32,
}

/// Point-in-time view of engine progress.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    /// Receipts collected so far.
    pub completed: usize,
    /// Scheduled votes not yet dispatched.
    pub queued: usize,
    /// Votes waiting in the retry queue.
    pub retrying: usize,
}

/// What a finished run produced.
#[derive(Debug)]
pub struct TrickleOutcome {
    /// Receipts in completion order.
    pub results: Vec<CastVoteReply>,
    /// Votes left in either queue when the run ended.
    pub not_cast: u64,
}

struct EngineState {
    interval_q: VecDeque<VoteInterval>,
    retry_q: VecDeque<RetryItem>,
    results: Vec<CastVoteReply>,
}

struct Inner {
    token: String,
    submitter: Arc<dyn BallotSubmitter>,
    journal: Journal,
    retry_interval: Duration,
    max_attempts: u32,
    cancel: CancellationToken,
    state: RwLock<EngineState>,
    main_done: CancellationToken,
    main_force_exit: CancellationToken,
    retry_force_exit: CancellationToken,
}

/// The trickle engine. Cheap to clone; all clones drive the same run.
#[derive(Clone)]
pub struct Trickler {
    inner: Arc<Inner>,
}

impl Trickler {
    /// Build an engine for one run. `cancel` is the root cancellation token;
    /// it interrupts every timed wait and in-flight submission.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        submitter: Arc<dyn BallotSubmitter>,
        journal: Journal,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: config.token,
                submitter,
                journal,
                retry_interval: config.retry_interval,
                max_attempts: config.max_attempts.max(1),
                cancel,
                state: RwLock::new(EngineState {
                    interval_q: VecDeque::new(),
                    retry_q: VecDeque::new(),
                    results: Vec::new(),
                }),
                main_done: CancellationToken::new(),
                main_force_exit: CancellationToken::new(),
                retry_force_exit: CancellationToken::new(),
            }),
        }
    }

    /// Journal the schedule, then trickle it out. Runs until the schedule
    /// and retry queue drain, cancellation fires, or the server reports the
    /// voting window closed.
    ///
    /// One run per engine: the termination latches are single-use.
    ///
    /// # Errors
    ///
    /// [`EngineError`] on journal failures and non-retryable submission
    /// errors. Cancellation is not an error; the outcome's `not_cast` count
    /// reflects the votes that never went out.
    pub async fn run(&self, schedule: Vec<VoteInterval>) -> Result<TrickleOutcome, EngineError> {
        let total = schedule.len();
        if total == 0 {
            return Err(EngineError::NoWork);
        }

        self.inner
            .journal
            .append_work(&self.inner.token, &schedule)?;
        {
            let mut state = self.inner.state.write().expect("lock poisoned");
            state.interval_q = schedule.into();
            state.results = Vec::with_capacity(total);
        }

        let retry_worker = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move { inner.retry_loop().await }
        });

        let main_result = self.inner.main_loop(total).await;
        if main_result.is_err() {
            // Unblock the retry loop before surfacing the error.
            self.inner.main_force_exit.cancel();
        }
        let retry_result = retry_worker.await.map_err(|_| EngineError::RetryTask)?;

        main_result?;
        retry_result?;

        let state = self.inner.state.read().expect("lock poisoned");
        Ok(TrickleOutcome {
            results: state.results.clone(),
            not_cast: (state.interval_q.len() + state.retry_q.len()) as u64,
        })
    }

    /// Snapshot the engine's progress.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let state = self.inner.state.read().expect("lock poisoned");
        EngineStats {
            completed: state.results.len(),
            queued: state.interval_q.len(),
            retrying: state.retry_q.len(),
        }
    }

    /// Print the receipts collected so far.
    pub fn dump_complete(&self) {
        let state = self.inner.state.read().expect("lock poisoned");
        println!("Completed votes ({}):", state.results.len());
        for reply in &state.results {
            println!("  {}", crate::client::receipt_line(reply));
        }
    }

    /// Print the votes still queued for dispatch.
    pub fn dump_togo(&self) {
        let state = self.inner.state.read().expect("lock poisoned");
        println!("Votes queued ({}):", state.interval_q.len());
        for interval in &state.interval_q {
            println!(
                "  {} {}",
                interval.vote.ticket,
                humantime::format_duration(interval.at)
            );
        }
    }
}

impl Inner {
    fn interval_pop(&self) -> Option<VoteInterval> {
        self.state
            .write()
            .expect("lock poisoned")
            .interval_q
            .pop_front()
    }

    fn interval_push_front(&self, interval: VoteInterval) {
        self.state
            .write()
            .expect("lock poisoned")
            .interval_q
            .push_front(interval);
    }

    fn retry_pop(&self) -> Option<RetryItem> {
        self.state
            .write()
            .expect("lock poisoned")
            .retry_q
            .pop_front()
    }

    fn retry_push(&self, item: RetryItem) {
        self.state
            .write()
            .expect("lock poisoned")
            .retry_q
            .push_back(item);
    }

    fn retry_len(&self) -> usize {
        self.state.read().expect("lock poisoned").retry_q.len()
    }

    fn record_result(&self, reply: CastVoteReply) {
        self.state
            .write()
            .expect("lock poisoned")
            .results
            .push(reply);
    }

    async fn main_loop(&self, total: usize) -> Result<(), EngineError> {
        let mut dispatched = 0usize;
        loop {
            let Some(interval) = self.interval_pop() else {
                break;
            };

            // The first vote goes out immediately; the schedule's offsets
            // only separate subsequent dispatches.
            if dispatched > 0 {
                println!(
                    "Next vote at {} (delay {})",
                    (Local::now() + chrono::Duration::from_std(interval.at).unwrap_or_default())
                        .format("%b %e %H:%M:%S"),
                    humantime::format_duration(interval.at)
                );

                tokio::select! {
                    () = self.cancel.cancelled() => {
                        // Put the vote back so summary statistics stay right.
                        self.interval_push_front(interval);
                        return Ok(());
                    }
                    () = self.retry_force_exit.cancelled() => {
                        self.interval_push_front(interval);
                        println!("Forced exit main vote queue.");
                        return Ok(());
                    }
                    () = tokio::time::sleep(interval.at) => {}
                }
            }

            dispatched += 1;
            println!("Voting: {dispatched}/{total} {}", interval.vote.ticket);

            let ballot = CastBallot {
                votes: vec![interval.vote.clone()],
            };
            match self.submitter.cast_ballot(&ballot).await {
                Err(ClientError::Retry(retry)) => {
                    println!("Vote rescheduled: {}", interval.vote.ticket);
                    self.journal.append_failed(&self.token, &ballot, &retry)?;
                    self.retry_push(RetryItem {
                        vote: interval.vote,
                        attempts: 0,
                    });
                }
                Err(err) => return Err(EngineError::Ballot(err)),
                Ok(reply) => {
                    self.record_result(reply.clone());
                    if reply.error_code == VoteError::StatusInvalid {
                        self.journal.append_failed(
                            &self.token,
                            &ballot,
                            &RetryError::from_reply(&reply),
                        )?;
                        println!("Vote has ended; forced exit main vote queue.");
                        println!("Awaiting retry vote queue to exit.");
                        self.main_force_exit.cancel();
                        return Ok(());
                    }
                    self.journal.append_success(&self.token, &reply)?;
                }
            }
        }

        debug!("main loop drained");
        println!("Awaiting retry vote queue to complete.");
        self.main_done.cancel();
        Ok(())
    }

    async fn retry_loop(&self) -> Result<(), EngineError> {
        let result = self.retry_loop_inner().await;
        if result.is_err() {
            // Terminal condition discovered on this side; the main loop may
            // be mid-sleep and has to be told to drain.
            self.retry_force_exit.cancel();
        }
        result
    }

    async fn retry_loop_inner(&self) -> Result<(), EngineError> {
        loop {
            let Some(mut item) = self.retry_pop() else {
                tokio::select! {
                    () = self.cancel.cancelled() => return Ok(()),
                    () = self.main_force_exit.cancelled() => return Ok(()),
                    () = self.main_done.cancelled() => {
                        if self.retry_len() == 0 {
                            return Ok(());
                        }
                        continue;
                    }
                }
            };

            let delay = self.backoff(item.attempts);
            debug!(
                ticket = %item.vote.ticket,
                attempts = item.attempts,
                delay = %humantime::format_duration(delay),
                "retry backoff"
            );
            tokio::select! {
                // A canceled run drops the in-flight item: its last attempt
                // is already in the failed journal.
                () = self.cancel.cancelled() => return Ok(()),
                () = self.main_force_exit.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }

            let ballot = CastBallot {
                votes: vec![item.vote.clone()],
            };
            match self.submitter.cast_ballot(&ballot).await {
                Err(ClientError::Retry(retry)) => {
                    self.journal.append_failed(&self.token, &ballot, &retry)?;
                    item.attempts += 1;
                    if item.attempts >= self.max_attempts {
                        error!(ticket = %item.vote.ticket, "retries exhausted");
                        println!(
                            "Vote abandoned after {} attempts: {}",
                            item.attempts + 1,
                            item.vote.ticket
                        );
                        self.journal.append_failed(
                            &self.token,
                            &ballot,
                            &RetryError::exhausted(item.attempts),
                        )?;
                    } else {
                        println!("Vote rescheduled: {}", item.vote.ticket);
                        self.retry_push(item);
                    }
                }
                Err(err) => return Err(EngineError::Ballot(err)),
                Ok(reply) => {
                    self.record_result(reply.clone());
                    if reply.error_code == VoteError::StatusInvalid {
                        self.journal.append_failed(
                            &self.token,
                            &ballot,
                            &RetryError::from_reply(&reply),
                        )?;
                        println!("Vote has ended; forced exit retry vote queue.");
                        self.retry_force_exit.cancel();
                        return Ok(());
                    }
                    self.journal.append_success(&self.token, &reply)?;
                }
            }
        }
    }

    /// Jittered exponential backoff: `base * 2^min(attempts, 6)` plus a
    /// uniform draw from `[0, base)`.
    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.retry_interval;
        let scaled = base * 2u32.pow(attempts.min(BACKOFF_EXPONENT_CAP));
        if base.is_zero() {
            return scaled;
        }
        scaled + rand::thread_rng().gen_range(Duration::ZERO..base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_for_backoff(retry_interval: Duration) -> Inner {
        Inner {
            token: String::new(),
            submitter: Arc::new(NoopSubmitter),
            journal: Journal::with_stamp(std::env::temp_dir(), 0),
            retry_interval,
            max_attempts: 3,
            cancel: CancellationToken::new(),
            state: RwLock::new(EngineState {
                interval_q: VecDeque::new(),
                retry_q: VecDeque::new(),
                results: Vec::new(),
            }),
            main_done: CancellationToken::new(),
            main_force_exit: CancellationToken::new(),
            retry_force_exit: CancellationToken::new(),
        }
    }

    struct NoopSubmitter;

    #[async_trait::async_trait]
    impl BallotSubmitter for NoopSubmitter {
        async fn cast_ballot(&self, _ballot: &CastBallot) -> Result<CastVoteReply, ClientError> {
            Ok(CastVoteReply::default())
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(10);
        let inner = inner_for_backoff(base);

        for attempts in 0..12u32 {
            let delay = inner.backoff(attempts);
            let scale = 2u32.pow(attempts.min(BACKOFF_EXPONENT_CAP));
            assert!(delay >= base * scale);
            assert!(delay < base * scale + base);
        }
    }

    #[test]
    fn zero_base_backoff_carries_no_jitter() {
        let inner = inner_for_backoff(Duration::ZERO);
        assert_eq!(inner.backoff(4), Duration::ZERO);
    }
}
