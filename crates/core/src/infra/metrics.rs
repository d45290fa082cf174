use parking_lot::Mutex;
use serde::Serialize;

/// 保持するレイテンシ記録の上限
const MAX_LATENCY_RECORDS: usize = 1000;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    polls_issued: u64,
    read_failures: u64,
    severity_escalations: u64,
    auto_resets: u64,
    manual_resets: u64,
    reset_failures: u64,
    confirm_mismatches: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    watches_expired: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub phase: String,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー（UIに返す用）
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub polls_issued: u64,
    pub read_failures: u64,
    pub severity_escalations: u64,
    pub resets: ResetCounts,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub watches_expired: u64,
    pub avg_latency_ms: AvgLatency,
    pub recent_latencies: Vec<LatencyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetCounts {
    pub automatic: u64,
    pub manual: u64,
    pub failed: u64,
    pub unconfirmed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvgLatency {
    pub read: Option<f64>,
    pub reset: Option<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_polls_issued(&self) {
        self.counters.lock().polls_issued += 1;
    }

    pub fn inc_read_failures(&self) {
        self.counters.lock().read_failures += 1;
    }

    pub fn inc_severity_escalations(&self) {
        self.counters.lock().severity_escalations += 1;
    }

    pub fn inc_resets(&self, automatic: bool) {
        let mut c = self.counters.lock();
        if automatic {
            c.auto_resets += 1;
        } else {
            c.manual_resets += 1;
        }
    }

    pub fn inc_reset_failures(&self) {
        self.counters.lock().reset_failures += 1;
    }

    pub fn inc_confirm_mismatches(&self) {
        self.counters.lock().confirm_mismatches += 1;
    }

    pub fn inc_jobs_completed(&self) {
        self.counters.lock().jobs_completed += 1;
    }

    pub fn inc_jobs_failed(&self) {
        self.counters.lock().jobs_failed += 1;
    }

    pub fn inc_watches_expired(&self) {
        self.counters.lock().watches_expired += 1;
    }

    pub fn record_latency(&self, phase: &str, duration_ms: u64) {
        let record = LatencyRecord {
            phase: phase.to_string(),
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push(record);
        if latencies.len() > MAX_LATENCY_RECORDS {
            let excess = latencies.len() - MAX_LATENCY_RECORDS;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let avg = |phase: &str| -> Option<f64> {
            let vals: Vec<f64> = latencies
                .iter()
                .filter(|r| r.phase == phase)
                .map(|r| r.duration_ms as f64)
                .collect();
            if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<f64>() / vals.len() as f64)
            }
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            polls_issued: c.polls_issued,
            read_failures: c.read_failures,
            severity_escalations: c.severity_escalations,
            resets: ResetCounts {
                automatic: c.auto_resets,
                manual: c.manual_resets,
                failed: c.reset_failures,
                unconfirmed: c.confirm_mismatches,
            },
            jobs_completed: c.jobs_completed,
            jobs_failed: c.jobs_failed,
            watches_expired: c.watches_expired,
            avg_latency_ms: AvgLatency {
                read: avg("read"),
                reset: avg("reset"),
            },
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
