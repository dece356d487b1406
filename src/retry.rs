//! Retry policy for calls against the remote portal.
//!
//! One [`RetryPolicy`] drives attempts against a lazily built client held in
//! a caller-owned [`RetryState`]:
//!
//! - every attempt is preceded by a pacing pause of `call_delay` plus up to
//!   a third of it as jitter, so bursts never hit the origin;
//! - a failed attempt discards the client, so the next attempt builds a
//!   fresh one (new connection, new proxy);
//! - terminal errors ([`FetchError::is_terminal`]) end the chain at once
//!   without consuming an attempt;
//! - otherwise the backoff delay grows by up to a sixth of itself
//!   (capped at `max_delay`) and the loop sleeps before trying again;
//! - after `max_attempts` failures the last error comes back wrapped in
//!   [`FetchError::Exhausted`].
//!
//! The attempt counter is back at zero whenever `run` returns, whatever the
//! outcome, so every top-level call starts with the full budget. The grown
//! backoff delay is kept in the state and carries over to later calls.
//!
//! Sleeping and jitter are injected ([`Sleeper`], [`Jitter`]) so tests run
//! without wall-clock delays, and every pause races a [`CancelToken`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;

use crate::config::HttpConfig;
use crate::error::FetchError;

// ============ Injected time ============

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeps on the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested pause.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Source of random extra delay.
pub trait Jitter: Send + Sync {
    /// A duration in `[0, max]`.
    fn up_to(&self, max: Duration) -> Duration;
}

/// Uniform millisecond jitter from the thread-local RNG.
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn up_to(&self, max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// No jitter at all.
pub struct NoJitter;

impl Jitter for NoJitter {
    fn up_to(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

/// Always the largest allowed jitter.
pub struct MaxJitter;

impl Jitter for MaxJitter {
    fn up_to(&self, max: Duration) -> Duration {
        max
    }
}

// ============ Cancellation ============

/// Cloneable cancellation signal observed between attempts and during sleeps.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

// ============ Policy ============

/// Mutable retry bookkeeping for one client.
///
/// Owned by whoever owns the client; never shared between concurrent calls.
pub struct RetryState<C> {
    /// Failed attempts in the running chain; zero between calls.
    pub attempt: u32,
    /// Current backoff delay. Grows across retries, capped by the policy.
    pub delay: Duration,
    client: Option<C>,
}

impl<C> RetryState<C> {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            attempt: 0,
            delay: initial_delay,
            client: None,
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn Jitter>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        call_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            call_delay,
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn from_config(config: &HttpConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_delay(),
            config.max_retry_delay(),
            config.call_delay(),
        )
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Fresh state starting at the base delay.
    pub fn new_state<C>(&self) -> RetryState<C> {
        RetryState::new(self.base_delay)
    }

    /// Run `op` against the client in `state` until it succeeds, fails
    /// terminally, is cancelled, or the attempt budget is spent.
    ///
    /// `build` creates the client whenever the state holds none.
    pub async fn run<C, T, B, BFut, Op, OFut>(
        &self,
        state: &mut RetryState<C>,
        cancel: &CancelToken,
        build: B,
        op: Op,
    ) -> Result<T, FetchError>
    where
        C: Clone,
        B: FnMut() -> BFut,
        BFut: Future<Output = Result<C, FetchError>>,
        Op: FnMut(C) -> OFut,
        OFut: Future<Output = Result<T, FetchError>>,
    {
        let result = self.run_chain(state, cancel, build, op).await;
        state.attempt = 0;
        result
    }

    async fn run_chain<C, T, B, BFut, Op, OFut>(
        &self,
        state: &mut RetryState<C>,
        cancel: &CancelToken,
        mut build: B,
        mut op: Op,
    ) -> Result<T, FetchError>
    where
        C: Clone,
        B: FnMut() -> BFut,
        BFut: Future<Output = Result<C, FetchError>>,
        Op: FnMut(C) -> OFut,
        OFut: Future<Output = Result<T, FetchError>>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let pace = self.call_delay + self.jitter.up_to(self.call_delay / 3);
            self.pause(pace, cancel).await?;

            let client = match &state.client {
                Some(client) => Ok(client.clone()),
                None => build().await,
            };
            let outcome = match client {
                Ok(client) => {
                    state.client = Some(client.clone());
                    op(client).await
                }
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            state.client = None;

            if err.is_terminal() {
                tracing::warn!(error = %err, "Terminal failure, not retrying");
                return Err(err);
            }

            state.attempt += 1;
            if state.attempt >= self.max_attempts {
                let attempts = state.attempt;
                tracing::error!(attempts, error = %err, "Retry budget exhausted");
                return Err(FetchError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            state.delay = (state.delay + self.jitter.up_to(state.delay / 6)).min(self.max_delay);
            tracing::warn!(
                attempts_left = self.max_attempts - state.attempt,
                delay = ?state.delay,
                error = %err,
                "Attempt failed, retrying"
            );
            self.pause(state.delay, cancel).await?;
        }
    }

    async fn pause(&self, duration: Duration, cancel: &CancelToken) -> Result<(), FetchError> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = self.sleeper.sleep(duration) => Ok(()),
        }
    }
}
