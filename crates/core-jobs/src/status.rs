//! Critical-path progress estimation.
//!
//! Each job carries a `pathtime`: the longest remaining path through the
//! build graph that passes through it. The snapshot tracks the estimated
//! total, what remains, and the runtime of the job currently on the
//! critical path; consumers read it for progress display, we log it.

use std::time::Instant;

/// Strictly-below-one factor used when retiring the critical job, so a
/// job whose successors have the same pathtime is not re-selected.
pub const ALMOST_ONE: f64 = 1.0 - 2.0 * f64::EPSILON;

#[derive(Debug, Clone, Copy)]
pub struct CriticalJob {
    pub pathtime: f64,
    pub runtime: f64,
}

#[derive(Debug, Clone)]
pub struct StatusState {
    pub total: f64,
    pub remain: f64,
    pub current: f64,
    pub wall: Instant,
}

impl Default for StatusState {
    fn default() -> Self {
        Self {
            total: 0.0,
            remain: 0.0,
            current: 0.0,
            wall: Instant::now(),
        }
    }
}

impl StatusState {
    /// A new job entered the graph: stretch the estimate if it extends the
    /// critical path.
    pub fn admit(&mut self, pathtime: f64, runtime: f64) {
        if pathtime > self.remain {
            self.total += pathtime - self.remain;
            self.remain = pathtime;
            self.current = runtime;
        }
    }

    /// The job on the critical path finished; `crit` is the next-longest
    /// path through pending and running work.
    pub fn retire(&mut self, crit: CriticalJob) {
        self.remain = crit.pathtime;
        self.current = crit.runtime;
        if crit.runtime == 0.0 {
            self.wall = Instant::now();
        }
    }

    /// Fallback for when the expected next critical job never got
    /// scheduled: after idling five times longer than the remaining
    /// estimate, rebase onto whatever is actually in flight.
    pub fn rebase_if_stale(&mut self, crit: CriticalJob) -> bool {
        let dwall = self.wall.elapsed().as_secs_f64();
        if self.current == 0.0 && dwall * 5.0 > self.remain && crit.runtime != 0.0 {
            self.total = crit.pathtime + (self.total - self.remain);
            self.remain = crit.pathtime;
            self.current = crit.runtime;
            true
        } else {
            false
        }
    }
}
