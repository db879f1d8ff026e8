use crate::config::FetchFailurePolicy;
use crate::error::{FetchError, PublishError};
use crate::inverter_accessory::AccessoryPublisher;
use crate::solarman_client::TelemetryClient;
use crate::value_mapper::{self, DerivedMetrics, ReadingSnapshot};
use std::time::Duration;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an in-flight poll cycle may keep running once shutdown is requested
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bounded retry for transient fetch errors within a single cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Polling,
    Mapping,
    Publishing,
    Sleeping,
}

/// Polls the telemetry provider on a fixed interval and publishes the mapped metrics
pub struct SyncEngine<C, P> {
    client: C,
    publisher: P,
    device_sn: String,
    poll_interval: Duration,
    retry: RetryPolicy,
    failure_policy: FetchFailurePolicy,
    shutdown_grace: Duration,
    state: EngineState,
}

impl<C, P> SyncEngine<C, P>
where
    C: TelemetryClient,
    P: AccessoryPublisher,
{
    pub fn new(
        client: C,
        publisher: P,
        device_sn: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            publisher,
            device_sn: device_sn.into(),
            poll_interval,
            retry: RetryPolicy::default(),
            failure_policy: FetchFailurePolicy::default(),
            shutdown_grace: SHUTDOWN_GRACE,
            state: EngineState::Idle,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FetchFailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Runs poll cycles until `cancel` fires.
    ///
    /// The first cycle runs immediately. Later cycles start on interval ticks;
    /// ticks missed while a cycle was running are skipped rather than queued,
    /// so at most one cycle is ever in flight.
    /// Returns an error only when a fetch fails under [`FetchFailurePolicy::Exit`].
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), FetchError> {
        info!(
            device_sn = %self.device_sn,
            interval_secs = self.poll_interval.as_secs(),
            "starting sync engine"
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let grace = self.shutdown_grace;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = self.run_cycle();
            tokio::pin!(cycle);
            let outcome = tokio::select! {
                outcome = &mut cycle => outcome,
                () = cancel.cancelled() => {
                    info!("shutdown requested during poll cycle, allowing {grace:?} to finish");
                    match timeout(grace, &mut cycle).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!("poll cycle abandoned after shutdown grace period");
                            break;
                        }
                    }
                }
            };
            if let Err(e) = outcome {
                error!("stopping sync engine: {e}");
                return Err(e);
            }
        }

        info!("sync engine stopped");
        Ok(())
    }

    /// One fetch, map and publish pass.
    /// A failed fetch leaves the published values untouched.
    pub async fn run_cycle(&mut self) -> Result<(), FetchError> {
        self.state = EngineState::Polling;
        let snapshot = match self.fetch_with_retry().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.state = EngineState::Sleeping;
                return match self.failure_policy {
                    FetchFailurePolicy::SkipCycle => {
                        warn!("poll cycle skipped, keeping previous values: {e}");
                        Ok(())
                    }
                    FetchFailurePolicy::Exit => Err(e),
                };
            }
        };

        self.state = EngineState::Mapping;
        let metrics = value_mapper::map(&snapshot);
        debug!(?metrics, "mapped {} readings", snapshot.len());

        self.state = EngineState::Publishing;
        let failed = self.publish(&metrics);

        self.state = EngineState::Sleeping;
        if failed == 0 {
            info!(
                temperature_c = metrics.temperature_c,
                output_power = metrics.output_power,
                rated_power = metrics.rated_power,
                battery_level_pct = metrics.battery_level_pct,
                "accessory updated"
            );
        } else {
            warn!(
                failed,
                temperature_c = metrics.temperature_c,
                output_power = metrics.output_power,
                rated_power = metrics.rated_power,
                battery_level_pct = metrics.battery_level_pct,
                "accessory partially updated"
            );
        }
        Ok(())
    }

    async fn fetch_with_retry(&mut self) -> Result<ReadingSnapshot, FetchError> {
        let mut attempt = 1;
        loop {
            match self.client.current_data(&self.device_sn).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "fetch attempt {attempt}/{} failed: {e}. Retrying in {delay:?}",
                        self.retry.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sets every characteristic. Failures are logged and do not stop the others.
    /// Returns how many characteristics could not be set.
    fn publish(&mut self, metrics: &DerivedMetrics) -> usize {
        let results: [(&str, Result<(), PublishError>); 5] = [
            (
                "temperature",
                self.publisher.set_temperature(metrics.temperature_c),
            ),
            (
                "charging state",
                self.publisher.set_charging_state(metrics.charging_state),
            ),
            (
                "battery level",
                self.publisher.set_battery_level(metrics.battery_level_pct),
            ),
            ("light max", self.publisher.set_light_max(metrics.light_max)),
            (
                "light level",
                self.publisher.set_light_level(metrics.light_level),
            ),
        ];
        let mut failed = 0;
        for (characteristic, result) in results {
            if let Err(e) = result {
                warn!("failed to set {characteristic}: {e}");
                failed += 1;
            }
        }
        failed
    }
}
