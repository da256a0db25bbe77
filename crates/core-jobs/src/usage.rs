//! Resource usage of an external job: predicted before launch, measured
//! after, reported to the program.

/// Memory provisioned for a job whose history is unknown (2 MiB).
pub const DEFAULT_PHYS_USAGE: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub found: bool,
    pub status: i32,
    pub runtime: f64,
    pub cputime: f64,
    pub membytes: u64,
    pub ibytes: u64,
    pub obytes: u64,
}

impl Usage {
    /// Memory to budget for a job predicted to use this much.
    pub fn memory(&self) -> u64 {
        if self.membytes == 0 {
            DEFAULT_PHYS_USAGE
        } else {
            self.membytes
        }
    }

    /// Thread slots to budget. Damped: multi-threaded estimates grow 1.3x
    /// to prevent runaway rescheduling, apparently-idle jobs are doubled
    /// (capped at one thread), and remote execution never drops a job
    /// below a hundredth of a slot.
    pub fn threads(&self) -> f64 {
        let mut estimate = if self.runtime == 0.0 {
            self.cputime
        } else {
            self.cputime / self.runtime
        };

        if estimate > 1.0 {
            return estimate * 1.3;
        }

        estimate *= 2.0;
        if estimate > 1.0 {
            estimate = 1.0;
        }
        if estimate < 0.01 {
            estimate = 0.01;
        }
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_memory_gets_default_provision() {
        let u = Usage::default();
        assert_eq!(u.memory(), DEFAULT_PHYS_USAGE);
        let v = Usage {
            membytes: 123,
            ..Usage::default()
        };
        assert_eq!(v.memory(), 123);
    }

    #[test]
    fn multithreaded_jobs_overprovision() {
        let u = Usage {
            runtime: 1.0,
            cputime: 4.0,
            ..Usage::default()
        };
        assert!((u.threads() - 5.2).abs() < 1e-9);
    }

    #[test]
    fn singlethreaded_jobs_are_pessimized_but_capped() {
        let u = Usage {
            runtime: 2.0,
            cputime: 1.5,
            ..Usage::default()
        };
        assert_eq!(u.threads(), 1.0); // 0.75 * 2 capped at 1
        let io_bound = Usage {
            runtime: 10.0,
            cputime: 1.0,
            ..Usage::default()
        };
        assert!((io_bound.threads() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn remote_jobs_keep_a_floor() {
        let u = Usage {
            runtime: 100.0,
            cputime: 0.0001,
            ..Usage::default()
        };
        assert_eq!(u.threads(), 0.01);
    }
}
