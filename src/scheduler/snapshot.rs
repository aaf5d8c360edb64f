//! Diagnostic dump of scheduler state, for tooling.

use crate::types::Priority;
use core::fmt;
use serde::Serialize;

/// One pending job, as seen by the dump.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    /// Public job id.
    pub id: u32,
    /// Job name supplied at scheduling time.
    pub name: String,
    /// Lifecycle state name.
    pub state: &'static str,
    /// Current priority.
    pub priority: Priority,
}

/// Queued jobs of one priority band, head first.
#[derive(Debug, Clone, Serialize)]
pub struct BandSnapshot {
    /// Band priority.
    pub priority: Priority,
    /// Jobs in execution order.
    pub jobs: Vec<JobSnapshot>,
}

/// One outstanding drain request.
#[derive(Debug, Clone, Serialize)]
pub struct DrainSnapshot {
    /// Drain threshold.
    pub threshold: Priority,
    /// Request name.
    pub name: String,
}

/// Full dump of pending work and drain requests.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    /// Priority of the currently executing context, if any.
    pub current_priority: Option<Priority>,
    /// Highest priority that may have pending work, if any.
    pub high_water: Option<Priority>,
    /// Populated bands, highest priority first.
    pub bands: Vec<BandSnapshot>,
    /// Jobs alive but not queued (paused or blocked).
    pub detached: Vec<JobSnapshot>,
    /// Outstanding drain requests, FIFO.
    pub drains: Vec<DrainSnapshot>,
}

impl fmt::Display for SchedulerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scheduler: current={} high-water={}",
            opt(self.current_priority),
            opt(self.high_water)
        )?;
        for band in &self.bands {
            writeln!(f, "  band {}:", band.priority)?;
            for job in &band.jobs {
                writeln!(f, "    J{} {:?} [{}] {}", job.id, job.name, job.state, job.priority)?;
            }
        }
        if !self.detached.is_empty() {
            writeln!(f, "  detached:")?;
            for job in &self.detached {
                writeln!(f, "    J{} {:?} [{}] {}", job.id, job.name, job.state, job.priority)?;
            }
        }
        for drain in &self.drains {
            writeln!(f, "  drain {:?} at {}", drain.name, drain.threshold)?;
        }
        Ok(())
    }
}

fn opt(priority: Option<Priority>) -> String {
    priority.map_or_else(|| "-".to_string(), |p| p.to_string())
}
