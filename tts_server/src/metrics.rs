// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Latency distribution over the most recent samples
#[derive(Debug, Clone)]
pub struct LatencyMetrics {
    pub count: Arc<AtomicU64>,
    pub total_ms: Arc<AtomicU64>,
    pub max_ms: Arc<AtomicU64>,
    pub samples: Arc<std::sync::Mutex<Vec<u64>>>,
}

impl LatencyMetrics {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            total_ms: Arc::new(AtomicU64::new(0)),
            max_ms: Arc::new(AtomicU64::new(0)),
            samples: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, latency_ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(latency_ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.samples.lock() {
            samples.push(latency_ms);
            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn avg_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn percentile(&self, p: u8) -> u64 {
        if let Ok(samples) = self.samples.lock() {
            if samples.is_empty() {
                return 0;
            }
            let mut sorted = samples.clone();
            sorted.sort_unstable();
            let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
            sorted[index]
        } else {
            0
        }
    }

    pub fn stats(&self) -> LatencyStats {
        LatencyStats {
            count: self.count.load(Ordering::Relaxed),
            avg_ms: self.avg_ms(),
            max_ms: self.max_ms.load(Ordering::Relaxed),
            p50_ms: self.percentile(50),
            p95_ms: self.percentile(95),
            p99_ms: self.percentile(99),
        }
    }
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for sessions, commands, synthesis runs and delivered audio
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    started: Instant,
    pub sessions_opened: Arc<AtomicU64>,
    pub sessions_preempted: Arc<AtomicU64>,
    pub commands: Arc<AtomicU64>,
    pub protocol_errors: Arc<AtomicU64>,
    pub runs_started: Arc<AtomicU64>,
    pub runs_completed: Arc<AtomicU64>,
    pub runs_cancelled: Arc<AtomicU64>,
    pub runs_failed: Arc<AtomicU64>,
    pub runs_detached: Arc<AtomicU64>,
    pub chunks_published: Arc<AtomicU64>,
    pub bytes_published: Arc<AtomicU64>,
    pub first_chunk_latency: LatencyMetrics,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            sessions_opened: Arc::new(AtomicU64::new(0)),
            sessions_preempted: Arc::new(AtomicU64::new(0)),
            commands: Arc::new(AtomicU64::new(0)),
            protocol_errors: Arc::new(AtomicU64::new(0)),
            runs_started: Arc::new(AtomicU64::new(0)),
            runs_completed: Arc::new(AtomicU64::new(0)),
            runs_cancelled: Arc::new(AtomicU64::new(0)),
            runs_failed: Arc::new(AtomicU64::new(0)),
            runs_detached: Arc::new(AtomicU64::new(0)),
            chunks_published: Arc::new(AtomicU64::new(0)),
            bytes_published: Arc::new(AtomicU64::new(0)),
            first_chunk_latency: LatencyMetrics::new(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, bytes: usize) {
        self.chunks_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn counters(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            sessions_opened: load(&self.sessions_opened),
            sessions_preempted: load(&self.sessions_preempted),
            commands: load(&self.commands),
            protocol_errors: load(&self.protocol_errors),
            runs_started: load(&self.runs_started),
            runs_completed: load(&self.runs_completed),
            runs_cancelled: load(&self.runs_cancelled),
            runs_failed: load(&self.runs_failed),
            runs_detached: load(&self.runs_detached),
            chunks_published: load(&self.chunks_published),
            bytes_published: load(&self.bytes_published),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub streaming: CounterSnapshot,
    pub first_chunk_latency: LatencyStats,
    pub audio_subscribers: usize,
    pub subscribers_lagged: u64,
    pub worker_state: String,
}

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct CounterSnapshot {
    pub sessions_opened: u64,
    pub sessions_preempted: u64,
    pub commands: u64,
    pub protocol_errors: u64,
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_cancelled: u64,
    pub runs_failed: u64,
    pub runs_detached: u64,
    pub chunks_published: u64,
    pub bytes_published: u64,
}

#[derive(Debug, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Sample host CPU, memory and load average.
pub fn system_metrics(uptime_seconds: u64) -> SystemMetrics {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpu_usage = system.global_cpu_info().cpu_usage();
    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|loadavg| loadavg.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        memory_usage_percent,
        uptime_seconds,
        system_load,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_recorded_samples() {
        let latency = LatencyMetrics::new();
        for ms in 1..=100 {
            latency.record(ms);
        }
        let stats = latency.stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.max_ms, 100);
        assert_eq!(stats.p50_ms, 51);
        assert_eq!(stats.p99_ms, 100);
        assert!((stats.avg_ms - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_latency_is_zero() {
        let stats = LatencyMetrics::new().stats();
        assert_eq!(stats.p95_ms, 0);
        assert_eq!(stats.avg_ms, 0.0);
    }

    #[test]
    fn counters_snapshot() {
        let metrics = ServerMetrics::new();
        ServerMetrics::incr(&metrics.runs_started);
        metrics.record_chunk(480);
        metrics.record_chunk(20);
        let snapshot = metrics.counters();
        assert_eq!(snapshot.runs_started, 1);
        assert_eq!(snapshot.chunks_published, 2);
        assert_eq!(snapshot.bytes_published, 500);
    }
}
