//! Activity consensus polling.
//!
//! When an operation needs additional approvers, the submitting request only
//! yields an activity id. [`ActivityPoller`] re-queries that activity at a
//! fixed interval until a terminal status is observed, distinguishing "still
//! waiting for approvals" from hard failure:
//!
//! * terminal success resolves with the activity (result populated);
//! * terminal failure, or an error message on any status, rejects
//!   immediately;
//! * transport errors are logged and retried: transient faults must not
//!   abort a poll that out-of-band approvers may take minutes to satisfy;
//! * a configured overall timeout bounds the wait.
//!
//! The transition logic lives in [`ActivityPoller::tick`], a pure function
//! of the fetch outcome and the elapsed wait, so it tests without timers or
//! HTTP. [`ActivityPoller::run`] is the thin timer loop around it; its
//! interval is dropped on every exit path.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::activity::{Activity, ActivityStatus};
use crate::error::CustodyKitError;

/// Capability to fetch the current state of an activity.
#[async_trait]
pub trait ActivityFetcher: Send + Sync {
    /// Queries `{organization_id, activity_id}` on the custody API.
    ///
    /// # Errors
    /// Returns transport or decoding errors; the poller treats them as
    /// transient.
    async fn fetch_activity(
        &self,
        organization_id: &str,
        activity_id: &str,
    ) -> Result<Activity, CustodyKitError>;
}

/// Polling cadence and bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Delay between consecutive status queries.
    pub interval: Duration,
    /// Overall bound; reaching it without a terminal status rejects.
    pub timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(300),
        }
    }
}

/// What the state machine decided after one fetch outcome.
#[derive(Debug)]
pub enum Tick {
    /// Keep polling.
    Continue,
    /// Terminal success: stop and hand the activity to the caller.
    Done(Activity),
    /// Terminal failure or timeout: stop and reject.
    Fail(CustodyKitError),
}

/// Poll progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Still querying.
    Running,
    /// A terminal transition was emitted; no further queries may be issued.
    Finished,
}

/// The consensus polling state machine.
#[derive(Debug)]
pub struct ActivityPoller {
    organization_id: String,
    activity_id: String,
    config: PollerConfig,
    state: PollState,
    last_activity: Option<Activity>,
}

impl ActivityPoller {
    /// Creates a poller for one activity.
    pub fn new<O: Into<String>, A: Into<String>>(
        organization_id: O,
        activity_id: A,
        config: PollerConfig,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            activity_id: activity_id.into(),
            config,
            state: PollState::Running,
            last_activity: None,
        }
    }

    /// Current progress.
    #[must_use]
    pub const fn state(&self) -> PollState {
        self.state
    }

    /// The most recent activity observed, terminal or not.
    #[must_use]
    pub const fn last_activity(&self) -> Option<&Activity> {
        self.last_activity.as_ref()
    }

    /// Advances the state machine with one fetch outcome.
    ///
    /// `elapsed` is the time since polling started; the deadline is
    /// `config.timeout`. Calling `tick` after it emitted a terminal
    /// transition is a caller bug and fails with an internal error.
    pub fn tick(
        &mut self,
        outcome: Result<Activity, CustodyKitError>,
        elapsed: Duration,
    ) -> Tick {
        if self.state == PollState::Finished {
            return Tick::Fail(CustodyKitError::internal(
                "activity poller ticked after finishing",
            ));
        }

        match outcome {
            Err(e) => {
                // Transient transport fault: stay on the poll loop unless the
                // deadline has passed.
                warn!(
                    activity_id = %self.activity_id,
                    error = %e,
                    "activity status query failed; retrying"
                );
                if elapsed >= self.config.timeout {
                    self.finish_timeout(elapsed)
                } else {
                    Tick::Continue
                }
            }
            Ok(mut activity) => {
                debug!(
                    activity_id = %activity.id,
                    status = %activity.status,
                    "activity status observed"
                );
                self.last_activity = Some(activity.clone());

                // Error presence wins over the status value.
                if let Some(message) = activity.error.take() {
                    self.state = PollState::Finished;
                    return Tick::Fail(CustodyKitError::ActivityFailed {
                        activity_id: activity.id,
                        status: activity.status,
                        message,
                    });
                }

                if activity.status.is_success() {
                    self.state = PollState::Finished;
                    return Tick::Done(activity);
                }
                if activity.status.is_terminal() {
                    self.state = PollState::Finished;
                    return Tick::Fail(CustodyKitError::ActivityFailed {
                        activity_id: activity.id,
                        status: activity.status,
                        message: "activity ended without a result".to_string(),
                    });
                }

                if elapsed >= self.config.timeout {
                    self.finish_timeout(elapsed)
                } else {
                    Tick::Continue
                }
            }
        }
    }

    fn finish_timeout(&mut self, elapsed: Duration) -> Tick {
        self.state = PollState::Finished;
        Tick::Fail(CustodyKitError::PollingTimeout {
            activity_id: self.activity_id.clone(),
            waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Drives the state machine at the configured interval until a terminal
    /// transition.
    ///
    /// The first query is issued immediately, subsequent ones one interval
    /// apart.
    ///
    /// # Errors
    /// Propagates the terminal [`Tick::Fail`] error: activity failure,
    /// polling timeout, or an internal invariant violation.
    pub async fn run(mut self, fetcher: &dyn ActivityFetcher) -> Result<Activity, CustodyKitError> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = tokio::time::Instant::now();

        loop {
            ticker.tick().await;
            let outcome = fetcher
                .fetch_activity(&self.organization_id, &self.activity_id)
                .await;
            match self.tick(outcome, started.elapsed()) {
                Tick::Continue => {}
                Tick::Done(activity) => return Ok(activity),
                Tick::Fail(e) => return Err(e),
            }
        }
    }
}
