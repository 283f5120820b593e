//! Resource usage snapshots.

use chrono::{DateTime, Utc};
use harbord_common::error::{HarbordError, Result};
use harbord_common::types::ContainerId;
use serde::{Deserialize, Serialize};

/// Raw counters sampled from a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Total CPU time consumed by the task, in nanoseconds.
    pub cpu_total_ns: u64,
    /// Host CPU time at the moment of sampling, in nanoseconds.
    pub system_cpu_ns: u64,
    /// CPUs available to the task.
    pub online_cpus: u32,
    /// Current memory usage in bytes.
    pub memory_usage: u64,
    /// Memory limit in bytes; 0 when unlimited.
    pub memory_limit: u64,
    /// Number of processes in the task.
    pub pids: u64,
    /// Bytes read from block devices.
    pub io_read_bytes: u64,
    /// Bytes written to block devices.
    pub io_write_bytes: u64,
}

/// CPU counters of one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Total CPU time consumed by the task, in nanoseconds.
    pub total_usage_ns: u64,
    /// Host CPU time, in nanoseconds.
    pub system_usage_ns: u64,
    /// CPUs available to the task.
    pub online_cpus: u32,
}

impl From<&ResourceUsage> for CpuStats {
    fn from(usage: &ResourceUsage) -> Self {
        Self {
            total_usage_ns: usage.cpu_total_ns,
            system_usage_ns: usage.system_cpu_ns,
            online_cpus: usage.online_cpus,
        }
    }
}

/// One published stats frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Container ID.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Time of this sample; `None` for an empty snapshot.
    pub read: Option<DateTime<Utc>>,
    /// Time of the previous sample.
    pub preread: Option<DateTime<Utc>>,
    /// CPU counters of this sample.
    pub cpu_stats: CpuStats,
    /// CPU counters of the previous sample.
    pub precpu_stats: CpuStats,
    /// Memory usage in bytes.
    pub memory_usage: u64,
    /// Memory limit in bytes.
    pub memory_limit: u64,
    /// Number of processes.
    pub pids: u64,
    /// Bytes read from block devices.
    pub io_read_bytes: u64,
    /// Bytes written to block devices.
    pub io_write_bytes: u64,
}

impl ContainerStats {
    /// Snapshot carrying only identity, used for containers without a task.
    #[must_use]
    pub fn empty(id: &ContainerId, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Builds a frame from a sample, chaining the previous frame's CPU data.
    #[must_use]
    pub fn from_sample(
        id: &ContainerId,
        name: &str,
        usage: &ResourceUsage,
        read: DateTime<Utc>,
        previous: Option<&Self>,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            read: Some(read),
            preread: previous.and_then(|p| p.read),
            cpu_stats: CpuStats::from(usage),
            precpu_stats: previous.map(|p| p.cpu_stats).unwrap_or_default(),
            memory_usage: usage.memory_usage,
            memory_limit: usage.memory_limit,
            pids: usage.pids,
            io_read_bytes: usage.io_read_bytes,
            io_write_bytes: usage.io_write_bytes,
        }
    }

    /// CPU utilisation between this frame and the previous one, in percent
    /// of one CPU times the online CPU count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self
            .cpu_stats
            .total_usage_ns
            .saturating_sub(self.precpu_stats.total_usage_ns);
        let system_delta = self
            .cpu_stats
            .system_usage_ns
            .saturating_sub(self.precpu_stats.system_usage_ns);
        if cpu_delta == 0 || system_delta == 0 {
            return 0.0;
        }
        let cpus = f64::from(self.cpu_stats.online_cpus.max(1));
        (cpu_delta as f64 / system_delta as f64) * cpus * 100.0
    }
}

/// How stats are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsOptions {
    /// Keep publishing samples until the caller goes away.
    pub stream: bool,
    /// Return a single sample without priming CPU counters.
    pub one_shot: bool,
}

impl StatsOptions {
    /// Checks for contradictory options.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if both `stream` and `one_shot` are set.
    pub fn validate(&self) -> Result<()> {
        if self.stream && self.one_shot {
            return Err(HarbordError::invalid(
                "cannot have stream=true and one-shot=true",
            ));
        }
        Ok(())
    }
}
