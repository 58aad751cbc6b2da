use std::thread;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::cmgroup::{CmGroup, UpdateOutcome};
use crate::domain::MaterialId;
use crate::error::CmgError;
use crate::pubchem::{PropertyClient, SearchClient};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Pause inserted between groups to stay within the remote rate limit.
pub trait Throttle: Send + Sync {
    fn pause(&self, wait: Duration);
}

/// Sleeps for the full wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedDelay;

impl Throttle for FixedDelay {
    fn pause(&self, wait: Duration) {
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
}

/// Never pauses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl Throttle for NoDelay {
    fn pause(&self, _wait: Duration) {}
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub wait: Duration,
    pub result_limit: Option<usize>,
    /// Skip searching and only continue updates from saved search results.
    pub resume: bool,
}

#[derive(Debug, Serialize)]
pub struct GroupFailure {
    pub materialid: MaterialId,
    #[serde(serialize_with = "serialize_display")]
    pub error: CmgError,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub updated: Vec<UpdateOutcome>,
    pub failures: Vec<GroupFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives groups one after another. Groups are never processed concurrently;
/// the configured wait is the only pacing.
pub struct BatchScheduler<T: Throttle> {
    throttle: T,
}

impl<T: Throttle> BatchScheduler<T> {
    pub fn new(throttle: T) -> Self {
        Self { throttle }
    }

    /// Searches and updates every group in order. A group that fails is
    /// recorded in the report and the batch moves on to the next one.
    pub fn run(
        &self,
        groups: &mut [CmGroup],
        search: &dyn SearchClient,
        properties: &dyn PropertyClient,
        options: &BatchOptions,
        sink: &dyn ProgressSink,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let total = groups.len();

        for (idx, group) in groups.iter_mut().enumerate() {
            if idx > 0 {
                info!(wait_secs = options.wait.as_secs_f64(), "waiting before next group");
                self.throttle.pause(options.wait);
            }

            sink.event(ProgressEvent {
                message: format!("group {}/{}: {}", idx + 1, total, group.materialid()),
                elapsed: None,
            });
            let start = Instant::now();
            let result = if options.resume {
                group.update_from_identifiers(properties)
            } else {
                group.pubchem_update(search, properties, options.result_limit)
            };

            match result {
                Ok(outcome) => {
                    sink.event(ProgressEvent {
                        message: format!(
                            "{}: {} compounds ({} new, {} failed lookups)",
                            group.materialid(),
                            outcome.record_count,
                            outcome.fetched,
                            outcome.failures.len()
                        ),
                        elapsed: Some(start.elapsed()),
                    });
                    report.updated.push(outcome);
                }
                Err(error) => {
                    warn!(materialid = %group.materialid(), %error, "group update failed");
                    sink.event(ProgressEvent {
                        message: format!("{}: failed: {error}", group.materialid()),
                        elapsed: Some(start.elapsed()),
                    });
                    report.failures.push(GroupFailure {
                        materialid: group.materialid().clone(),
                        error,
                    });
                }
            }
        }

        info!(
            updated = report.updated.len(),
            failed = report.failures.len(),
            "completed batch"
        );
        report
    }
}

fn serialize_display<S: Serializer>(error: &CmgError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}
