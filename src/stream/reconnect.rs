use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::engine::StreamEngine;
use super::{Registrant, StreamError, StreamState};

/// Reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Fraction of each interval used as +/- random jitter.
    pub randomization: f64,
    /// Cap for a single interval. There is no cap on total elapsed time.
    pub max_interval: Duration,
    /// A session must stay registered longer than this to reset the backoff.
    pub min_stream_duration: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization: 0.5,
            max_interval: Duration::from_secs(60),
            min_stream_duration: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff without an elapsed-time limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: ReconnectOptions,
    attempt: u32,
}

impl Backoff {
    pub fn new(options: ReconnectOptions) -> Self {
        Self {
            options,
            attempt: 0,
        }
    }

    /// Interval before the next attempt, before jitter.
    pub fn current_interval(&self) -> Duration {
        let multiplier = self.options.multiplier.powi(self.attempt.min(64) as i32);
        self.options
            .initial_interval
            .mul_f64(multiplier)
            .min(self.options.max_interval)
    }

    pub fn next(&mut self) -> Duration {
        let base = self.current_interval();
        self.attempt = self.attempt.saturating_add(1);
        let spread = self.options.randomization.clamp(0.0, 1.0);
        if spread == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Keeps a [`StreamEngine`] connected until stopped.
///
/// # Behavior
/// * Waits for the current session to end, then retries `connect` after each
///   backoff interval, forever.
/// * Resets the backoff only after a session that stayed registered longer than
///   [`ReconnectOptions::min_stream_duration`], so a server that fails fast is not
///   hammered.
/// * Stops when [`ReconnectSupervisor::stop`] is called or the engine is closing.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReconnectSupervisor {
    /// Starts supervising an engine whose first `connect` already succeeded.
    pub fn spawn<H: Registrant>(engine: Arc<StreamEngine<H>>, options: ReconnectOptions) -> Self {
        let stop = CancellationToken::new();
        let span = info_span!("reconnect", uid = %engine.uid());
        let task = tokio::spawn(supervise(engine, Backoff::new(options), stop.clone()).instrument(span));
        Self {
            stop,
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn supervise<H: Registrant>(
    engine: Arc<StreamEngine<H>>,
    mut backoff: Backoff,
    stop: CancellationToken,
) {
    let mut states = engine.state_changes();
    loop {
        let registered_at = Instant::now();
        let ended = async {
            loop {
                if *states.borrow_and_update() != StreamState::Registered {
                    return;
                }
                if states.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ended => {}
        }
        if engine.is_closing() || stop.is_cancelled() {
            return;
        }

        let lived = registered_at.elapsed();
        if lived > backoff.options.min_stream_duration {
            backoff.reset();
        }
        debug!(lived_ms = lived.as_millis() as u64, "stream ended, reconnecting");

        loop {
            let delay = backoff.next();
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
            if engine.is_closing() {
                return;
            }
            match engine.connect().await {
                Ok(()) => {
                    info!(attempts = backoff.attempts(), "reconnected");
                    break;
                }
                Err(StreamError::AlreadyConnected) => break,
                Err(err) => {
                    warn!(error = %err, retry_in_ms = backoff.current_interval().as_millis() as u64, "reconnect failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectOptions {
        ReconnectOptions {
            randomization: 0.0,
            max_interval: Duration::from_secs(4),
            ..ReconnectOptions::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps_per_interval() {
        let mut backoff = Backoff::new(no_jitter());
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(750));
        assert_eq!(backoff.next(), Duration::from_millis(1125));
        for _ in 0..20 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(4));
        assert!(backoff.attempts() > 20);
    }

    #[test]
    fn reset_returns_to_initial_interval() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_randomization_window() {
        let mut backoff = Backoff::new(ReconnectOptions::default());
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next();
            assert!(delay >= Duration::from_millis(250) && delay <= Duration::from_millis(750));
        }
    }
}
