//! Consumer-side reconciliation of deployment messages against the cluster watermark.
//!
//! The queue is at-least-once and unordered, so every message is judged on its
//! own: its identifier is compared with the watermark recorded in the cluster
//! and the bundle is applied when it is not older. Equal identifiers are
//! re-applied. A crash after the bundle (and with it the watermark) landed but
//! before the delete leaves the message queued, and the redelivery must still
//! go through. This relies on equal identifiers carrying identical bundles.

use crate::applier::{ApplyError, Applier};
use crate::config::ListenerConfig;
use crate::message::{BuildIdentifier, DeploymentMessage};
use crate::queue::{QueueError, QueueMessage, QueuePort};
use crate::watermark::WatermarkStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of comparing one message with the current watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationDecision {
    Apply,
    Skip,
    DeferUnparseable,
}

impl ReconciliationDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationDecision::Apply => "apply",
            ReconciliationDecision::Skip => "skip",
            ReconciliationDecision::DeferUnparseable => "defer-unparseable",
        }
    }
}

impl fmt::Display for ReconciliationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies when the message is at least as new as the watermark.
pub fn decide(identifier: BuildIdentifier, watermark: BuildIdentifier) -> ReconciliationDecision {
    if identifier >= watermark {
        ReconciliationDecision::Apply
    } else {
        ReconciliationDecision::Skip
    }
}

/// What happens to a message whose apply failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyFailurePolicy {
    /// Delete the message anyway; the failed deployment is only visible in the log.
    #[default]
    Drop,
    /// Leave the message on the queue so the broker redelivers or dead-letters it.
    Redeliver,
}

/// Throttles the "still waiting" log line to one per `interval` consecutive empty polls.
///
/// Only polls that returned no messages count as idle; failed receives leave
/// the counter alone.
#[derive(Debug, Clone)]
pub struct IdleThrottle {
    interval: u64,
    idle_polls: u64,
    logged_at: Option<u64>,
}

impl IdleThrottle {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            idle_polls: 0,
            logged_at: None,
        }
    }

    /// Called before every poll. Returns the idle count when a log line is due.
    pub fn before_poll(&mut self) -> Option<u64> {
        let idle = self.idle_polls;
        if idle % self.interval != 0 || self.logged_at == Some(idle) {
            return None;
        }
        self.logged_at = Some(idle);
        Some(idle)
    }

    /// Called when a poll returned no messages.
    pub fn record_empty(&mut self) {
        self.idle_polls = self.idle_polls.saturating_add(1);
    }

    /// Called when a poll delivered at least one message.
    pub fn reset(&mut self) {
        self.idle_polls = 0;
        self.logged_at = None;
    }

    pub fn idle_polls(&self) -> u64 {
        self.idle_polls
    }
}

/// Exponential delay between failed receives, capped at `max`.
#[derive(Debug, Clone)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            Some(current) => current.saturating_mul(2).min(self.max),
            None => self.base,
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Record of how a single delivered message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOutcome {
    pub message_id: String,
    pub identifier: Option<BuildIdentifier>,
    pub config_map: Option<String>,
    pub watermark: Option<BuildIdentifier>,
    pub decision: ReconciliationDecision,
    pub apply_error: Option<ApplyError>,
    pub acknowledged: bool,
}

/// Result of one poll iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub outcomes: Vec<MessageOutcome>,
    pub receive_error: Option<QueueError>,
    pub backoff: Option<Duration>,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.outcomes.is_empty() && self.receive_error.is_none()
    }

    pub fn decisions(&self) -> Vec<ReconciliationDecision> {
        self.outcomes.iter().map(|outcome| outcome.decision).collect()
    }
}

/// Running counters since the loop started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub polls: u64,
    pub empty_polls: u64,
    pub receive_failures: u64,
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub discarded: u64,
    pub apply_failures: u64,
    pub watermark_fallbacks: u64,
    pub acknowledged: u64,
    pub ack_failures: u64,
}

/// Polls the deploy queue and applies bundles that are not older than the watermark.
pub struct ReconciliationLoop<Q, W, A> {
    queue: Q,
    watermarks: W,
    applier: A,
    config: ListenerConfig,
    idle: IdleThrottle,
    backoff: Backoff,
    stats: ReconcileStats,
}

impl<Q, W, A> ReconciliationLoop<Q, W, A>
where
    Q: QueuePort,
    W: WatermarkStore,
    A: Applier,
{
    pub fn new(queue: Q, watermarks: W, applier: A, config: ListenerConfig) -> Self {
        let idle = IdleThrottle::new(config.idle_log_interval);
        let backoff = Backoff::new(config.receive_backoff, config.receive_backoff_max);
        Self {
            queue,
            watermarks,
            applier,
            config,
            idle,
            backoff,
            stats: ReconcileStats::default(),
        }
    }

    /// Polls forever. Only terminating the process stops the loop.
    pub fn run(&mut self) -> ! {
        info!(
            queue = %self.config.queue_name,
            namespace = %self.config.namespace,
            identifier_key = %self.config.identifier_key,
            policy = ?self.config.apply_failure_policy,
            "reconciliation loop started"
        );
        loop {
            self.poll_once();
        }
    }

    /// Runs a single poll and processes the delivered batch in queue order.
    pub fn poll_once(&mut self) -> PollReport {
        if let Some(idle_polls) = self.idle.before_poll() {
            info!(
                queue = %self.config.queue_name,
                idle_polls,
                "waiting for deployment messages"
            );
        }
        self.stats.polls += 1;

        let batch = match self
            .queue
            .receive(self.config.wait, self.config.max_messages)
        {
            Ok(batch) => {
                self.backoff.reset();
                batch
            }
            Err(err) => {
                self.stats.receive_failures += 1;
                let delay = self.backoff.next_delay();
                warn!(
                    queue = %self.config.queue_name,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "receive failed"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                return PollReport {
                    outcomes: Vec::new(),
                    receive_error: Some(err),
                    backoff: Some(delay),
                };
            }
        };

        if batch.is_empty() {
            self.stats.empty_polls += 1;
            self.idle.record_empty();
            return PollReport::default();
        }
        self.idle.reset();

        let mut outcomes = Vec::with_capacity(batch.len());
        for message in &batch {
            outcomes.push(self.process_message(message));
        }
        PollReport {
            outcomes,
            receive_error: None,
            backoff: None,
        }
    }

    /// Decides, applies and acknowledges one delivered message.
    pub fn process_message(&mut self, message: &QueueMessage) -> MessageOutcome {
        self.stats.received += 1;
        let mut outcome = MessageOutcome {
            message_id: message.message_id.clone(),
            identifier: None,
            config_map: None,
            watermark: None,
            decision: ReconciliationDecision::DeferUnparseable,
            apply_error: None,
            acknowledged: false,
        };

        match DeploymentMessage::parse(&message.body, &self.config.identifier_key) {
            Err(err) => {
                self.stats.discarded += 1;
                warn!(
                    message_id = %message.message_id,
                    error = %err,
                    "discarding malformed deployment message"
                );
            }
            Ok(deployment) => {
                let config_map = deployment
                    .config_map_name()
                    .unwrap_or(&self.config.default_config_map)
                    .to_string();
                let watermark = self.read_watermark(&config_map);
                let decision = decide(deployment.identifier, watermark);
                outcome.identifier = Some(deployment.identifier);
                outcome.config_map = Some(config_map.clone());
                outcome.watermark = Some(watermark);
                outcome.decision = decision;

                match decision {
                    ReconciliationDecision::Apply => {
                        info!(
                            identifier = deployment.identifier,
                            watermark,
                            config_map = %config_map,
                            "applying manifests"
                        );
                        match self.applier.apply(&deployment.manifest_bundle) {
                            Ok(()) => self.stats.applied += 1,
                            Err(err) => {
                                self.stats.apply_failures += 1;
                                error!(
                                    identifier = deployment.identifier,
                                    watermark,
                                    config_map = %config_map,
                                    error = %err,
                                    "apply failed"
                                );
                                outcome.apply_error = Some(err);
                            }
                        }
                    }
                    ReconciliationDecision::Skip => {
                        self.stats.skipped += 1;
                        info!(
                            identifier = deployment.identifier,
                            watermark,
                            config_map = %config_map,
                            "skipping build older than watermark"
                        );
                    }
                    ReconciliationDecision::DeferUnparseable => {}
                }
            }
        }

        let retain = outcome.apply_error.is_some()
            && self.config.apply_failure_policy == ApplyFailurePolicy::Redeliver;
        if retain {
            warn!(
                message_id = %message.message_id,
                identifier = outcome.identifier,
                "leaving message on queue for redelivery"
            );
        } else {
            match self.queue.delete(message) {
                Ok(()) => {
                    self.stats.acknowledged += 1;
                    outcome.acknowledged = true;
                }
                Err(err) => {
                    self.stats.ack_failures += 1;
                    warn!(
                        message_id = %message.message_id,
                        error = %err,
                        "delete failed, message will be redelivered"
                    );
                }
            }
        }

        info!(
            message_id = %message.message_id,
            identifier = outcome.identifier,
            decision = %outcome.decision,
            acknowledged = outcome.acknowledged,
            "processed deployment message"
        );
        outcome
    }

    fn read_watermark(&mut self, config_map: &str) -> BuildIdentifier {
        match self.watermarks.read(config_map) {
            Ok(watermark) => watermark,
            Err(err) => {
                self.stats.watermark_fallbacks += 1;
                warn!(
                    config_map,
                    namespace = %self.config.namespace,
                    error = %err,
                    "failed to read watermark, assuming nothing applied"
                );
                0
            }
        }
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn idle_polls(&self) -> u64 {
        self.idle.idle_polls()
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn watermarks_mut(&mut self) -> &mut W {
        &mut self.watermarks
    }

    pub fn applier(&self) -> &A {
        &self.applier
    }
}
