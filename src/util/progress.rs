//! Progress lines and per-stage timings for long migration runs.
use std::cmp::Reverse;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::util::env::env_parse;

/// Progress logging interval (rows). Override with env PROGRESS_INTERVAL.
pub fn progress_interval() -> usize {
    env_parse("PROGRESS_INTERVAL", 1000usize).max(1)
}

#[derive(Clone)]
pub struct Progress {
    label: String,
    total: Option<usize>,
    every: usize,
    start: Instant,
    last_log: Instant,
    processed: usize,
    next_log_at: usize,
}

impl Progress {
    pub fn new<L: Into<String>>(label: L, total: Option<usize>) -> Self {
        Self::with_interval(label, total, progress_interval())
    }

    pub fn with_interval<L: Into<String>>(label: L, total: Option<usize>, every: usize) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            total,
            every: every.max(1),
            start: now,
            last_log: now,
            processed: 0,
            next_log_at: 0,
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn tick(&mut self, n: usize) {
        self.processed += n;
        // Pages advance by more than one row, so crossing the mark counts.
        if self.processed >= self.next_log_at {
            self.next_log_at = self.processed + self.every;
            self.log(false);
        }
    }

    pub fn finish(&mut self) {
        self.log(true);
    }

    fn log(&mut self, done: bool) {
        let now = Instant::now();
        if !done && self.processed > 0 && now.duration_since(self.last_log) < Duration::from_millis(200) {
            return;
        }
        self.last_log = now;

        let elapsed = now.duration_since(self.start).as_secs_f64().max(0.001);
        let rate = (self.processed as f64) / elapsed;
        match self.total {
            Some(t) if t > 0 => {
                let pct = (100.0 * (self.processed as f64)) / (t as f64);
                let remaining = t.saturating_sub(self.processed);
                let eta = if self.processed > 0 {
                    (remaining as f64) * elapsed / (self.processed as f64)
                } else {
                    0.0
                };
                if done {
                    info!(target: "progress", label = %self.label, processed = self.processed, total = t, pct = %format!("{pct:.1}"), rate = %format!("{rate:.1}/s"), took = %format!("{elapsed:.1}s"), "done");
                } else {
                    info!(target: "progress", label = %self.label, processed = self.processed, remaining, total = t, pct = %format!("{pct:.1}"), rate = %format!("{rate:.1}/s"), eta = %format!("{eta:.1}s"), "progress");
                }
            }
            _ if done => {
                info!(target: "progress", label = %self.label, processed = self.processed, rate = %format!("{rate:.1}/s"), took = %format!("{elapsed:.1}s"), "done");
            }
            _ => {
                info!(target: "progress", label = %self.label, processed = self.processed, rate = %format!("{rate:.1}/s"), "progress");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub name: String,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_ms")]
    pub elapsed: Duration,
    pub success: bool,
}

impl StageTiming {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((d.as_secs_f64() * 1000.0 * 100.0).round() / 100.0)
}

/// Ordered record of stage timings for one run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct StageTimings(Vec<StageTiming>);

impl StageTimings {
    pub fn record(&mut self, name: &str, elapsed: Duration, success: bool) {
        info!(
            target: "metrics",
            stage = name,
            took_ms = format!("{:.2}", elapsed.as_secs_f64() * 1000.0),
            success,
            "stage timing"
        );
        self.0.push(StageTiming {
            name: name.to_string(),
            elapsed,
            success,
        });
    }

    pub fn as_slice(&self) -> &[StageTiming] {
        &self.0
    }

    pub fn total(&self) -> Duration {
        self.0.iter().fold(Duration::ZERO, |acc, t| acc + t.elapsed)
    }

    /// Slowest stages first, each with its share of the total.
    pub fn emit_summary(&self) {
        if self.0.is_empty() {
            return;
        }
        let mut timings = self.0.clone();
        timings.sort_by_key(|t| Reverse(t.elapsed));
        let total = self.total();
        info!(
            target: "metrics",
            stages = timings.len(),
            total_ms = format!("{:.2}", total.as_secs_f64() * 1000.0),
            "migration stage timing summary"
        );
        for timing in timings {
            let pct = if total.as_nanos() == 0 {
                0.0
            } else {
                (timing.elapsed.as_secs_f64() / total.as_secs_f64()) * 100.0
            };
            info!(
                target: "metrics",
                stage = %timing.name,
                took_ms = format!("{:.2}", timing.elapsed_ms()),
                pct = format!("{:.1}", pct),
                success = timing.success,
                "stage timing detail"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_ticks() {
        let mut p = Progress::with_interval("articles", Some(10), 3);
        p.tick(2);
        p.tick(5);
        p.finish();
        assert_eq!(p.processed(), 7);
    }

    #[test]
    fn timings_sum_and_serialize() {
        let mut t = StageTimings::default();
        t.record("users", Duration::from_millis(20), true);
        t.record("articles", Duration::from_millis(30), false);
        assert_eq!(t.total(), Duration::from_millis(50));
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json[0]["name"], "users");
        assert_eq!(json[1]["elapsed_ms"], 30.0);
        assert_eq!(json[1]["success"], false);
    }
}
