use std::fmt;

/// Where the worker-pool size came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSource {
    /// `RUNWAY_CPU_LIMIT` env var (k8s downward API or Dockerfile).
    Override,
    CgroupV2,
    CgroupV1,
    /// Host parallelism — no container quota found.
    Host,
}

impl fmt::Display for WorkerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerSource::Override => write!(f, "env_override"),
            WorkerSource::CgroupV2 => write!(f, "cgroup_v2"),
            WorkerSource::CgroupV1 => write!(f, "cgroup_v1"),
            WorkerSource::Host => write!(f, "host"),
        }
    }
}

/// Sizing decision for the tokio worker pool.
///
/// A containerized gateway is usually capped to a fraction of the host's
/// cores; sizing the pool by host CPU count over-provisions threads and the
/// extra workers just contend on the listener. The plan resolves the CPU
/// quota (env override, then cgroup v2, then cgroup v1, else host), rounds
/// fractional quotas up — a 2.5-core cap gets 3 workers so the budget is
/// usable — and never exceeds the host parallelism.
///
/// Detection runs before the runtime exists, so the plan carries its
/// provenance and is reported through tracing/metrics once bootstrap has
/// them up.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPlan {
    pub threads: usize,
    pub source: WorkerSource,
}

impl WorkerPlan {
    pub fn detect() -> Self {
        let host = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        let override_spec = std::env::var("RUNWAY_CPU_LIMIT").ok();
        let v2 = std::fs::read_to_string("/sys/fs/cgroup/cpu.max").ok();
        let v1 = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
            .ok()
            .zip(std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok());

        Self::resolve(
            override_spec.as_deref(),
            v2.as_deref(),
            v1.as_ref().map(|(q, p)| (q.as_str(), p.as_str())),
            host,
        )
    }

    /// Pure resolution over already-read inputs.
    fn resolve(
        override_spec: Option<&str>,
        cgroup_v2: Option<&str>,
        cgroup_v1: Option<(&str, &str)>,
        host: usize,
    ) -> Self {
        if let Some(cores) = override_spec.and_then(parse_cores) {
            return Self {
                threads: clamp_threads(cores, host),
                source: WorkerSource::Override,
            };
        }
        if let Some(cores) = cgroup_v2.and_then(cgroup_v2_cores) {
            return Self {
                threads: clamp_threads(cores, host),
                source: WorkerSource::CgroupV2,
            };
        }
        if let Some(cores) = cgroup_v1.and_then(|(quota, period)| cgroup_v1_cores(quota, period)) {
            return Self {
                threads: clamp_threads(cores, host),
                source: WorkerSource::CgroupV1,
            };
        }
        Self {
            threads: host.max(1),
            source: WorkerSource::Host,
        }
    }

    /// Report the sizing decision once tracing and the metrics recorder are
    /// installed.
    pub fn record(&self) {
        tracing::info!(
            "runtime: worker pool sized, threads={}, source={}",
            self.threads,
            self.source
        );
        metrics::gauge!("gateway_worker_threads").set(self.threads as f64);
    }
}

/// CPU quota spec: whole or fractional cores ("4", "2.5") or millicores
/// ("2500m").
fn parse_cores(value: &str) -> Option<f64> {
    let value = value.trim();
    let cores = if let Some(millis) = value.strip_suffix('m') {
        millis.parse::<f64>().ok()? / 1000.0
    } else {
        value.parse::<f64>().ok()?
    };
    (cores > 0.0 && cores.is_finite()).then_some(cores)
}

/// cgroup v2 `cpu.max`: "quota period" in microseconds, or "max period" for
/// unlimited.
fn cgroup_v2_cores(content: &str) -> Option<f64> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    quota_ratio(quota, period)
}

/// cgroup v1 `cpu.cfs_quota_us` / `cpu.cfs_period_us`; a quota of -1 means
/// unlimited.
fn cgroup_v1_cores(quota: &str, period: &str) -> Option<f64> {
    quota_ratio(quota.trim(), period.trim())
}

fn quota_ratio(quota: &str, period: &str) -> Option<f64> {
    let quota: f64 = quota.parse().ok()?;
    let period: f64 = period.parse().ok()?;
    (quota > 0.0 && period > 0.0).then(|| quota / period)
}

/// Round a fractional quota up, keep at least one worker, and never spawn
/// more threads than the host can actually run.
fn clamp_threads(cores: f64, host: usize) -> usize {
    (cores.ceil() as usize).clamp(1, host.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cores_formats() {
        assert_eq!(parse_cores("4"), Some(4.0));
        assert_eq!(parse_cores("  2.5  "), Some(2.5));
        assert_eq!(parse_cores("2500m"), Some(2.5));
        assert_eq!(parse_cores("500m"), Some(0.5));
        assert_eq!(parse_cores("0"), None);
        assert_eq!(parse_cores("-2"), None);
        assert_eq!(parse_cores("lots"), None);
    }

    #[test]
    fn test_cgroup_v2_cores() {
        assert_eq!(cgroup_v2_cores("400000 100000"), Some(4.0));
        assert_eq!(cgroup_v2_cores("150000 100000"), Some(1.5));
        assert_eq!(cgroup_v2_cores("max 100000"), None);
        assert_eq!(cgroup_v2_cores(""), None);
    }

    #[test]
    fn test_cgroup_v1_cores() {
        assert_eq!(cgroup_v1_cores("250000\n", "100000\n"), Some(2.5));
        assert_eq!(cgroup_v1_cores("-1", "100000"), None);
        assert_eq!(cgroup_v1_cores("0", "100000"), None);
    }

    #[test]
    fn test_fractional_quota_rounds_up() {
        assert_eq!(clamp_threads(2.5, 64), 3);
        assert_eq!(clamp_threads(0.5, 64), 1);
        assert_eq!(clamp_threads(4.0, 64), 4);
    }

    #[test]
    fn test_threads_never_exceed_host() {
        assert_eq!(clamp_threads(128.0, 8), 8);
        // A bogus override cannot zero the pool either.
        assert_eq!(clamp_threads(0.1, 0), 1);
    }

    #[test]
    fn test_override_wins_over_cgroups() {
        let plan = WorkerPlan::resolve(Some("2"), Some("800000 100000"), None, 16);
        assert_eq!(plan.threads, 2);
        assert_eq!(plan.source, WorkerSource::Override);
    }

    #[test]
    fn test_unparsable_override_falls_through() {
        let plan = WorkerPlan::resolve(Some("???"), Some("300000 100000"), None, 16);
        assert_eq!(plan.threads, 3);
        assert_eq!(plan.source, WorkerSource::CgroupV2);
    }

    #[test]
    fn test_v1_used_when_v2_unlimited() {
        let plan = WorkerPlan::resolve(None, Some("max 100000"), Some(("200000", "100000")), 16);
        assert_eq!(plan.threads, 2);
        assert_eq!(plan.source, WorkerSource::CgroupV1);
    }

    #[test]
    fn test_host_fallback() {
        let plan = WorkerPlan::resolve(None, None, None, 12);
        assert_eq!(plan.threads, 12);
        assert_eq!(plan.source, WorkerSource::Host);
    }
}
