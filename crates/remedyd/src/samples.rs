//! Bounded per-target sample series.
//!
//! Each target keeps samples for `retention`, which callers size to the
//! longest window any rule needs. Writes come from the monitor loop only.

use chrono::{DateTime, Utc};
use remedy_common::{Sample, Target};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::evaluator::to_chrono;

pub struct SampleWindows {
    retention: Duration,
    series: RwLock<HashMap<Target, VecDeque<Sample>>>,
}

impl SampleWindows {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Append samples, keeping each series ordered by timestamp
    pub async fn ingest(&self, samples: Vec<Sample>) -> usize {
        let count = samples.len();
        let mut series = self.series.write().await;
        for sample in samples {
            let window = series.entry(sample.target()).or_default();
            match window.back() {
                Some(last) if last.timestamp > sample.timestamp => {
                    let pos = window.partition_point(|s| s.timestamp <= sample.timestamp);
                    window.insert(pos, sample);
                }
                _ => window.push_back(sample),
            }
        }
        count
    }

    /// Drop samples older than the retention window and forget empty targets
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(self.retention);
        let mut dropped = 0;
        let mut series = self.series.write().await;
        series.retain(|target, window| {
            while window.front().map_or(false, |s| s.timestamp < cutoff) {
                window.pop_front();
                dropped += 1;
            }
            if window.is_empty() {
                debug!(target = %target, "no samples left in retention window");
            }
            !window.is_empty()
        });
        dropped
    }

    pub async fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self.series.read().await.keys().cloned().collect();
        targets.sort();
        targets
    }

    pub async fn window(&self, target: &Target) -> Vec<Sample> {
        self.series
            .read()
            .await
            .get(target)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent `limit` samples for a target, oldest first
    pub async fn recent(&self, target: &Target, limit: usize) -> Vec<Sample> {
        let series = self.series.read().await;
        match series.get(target) {
            Some(window) => {
                let skip = window.len().saturating_sub(limit);
                window.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn len(&self, target: &Target) -> usize {
        self.series.read().await.get(target).map_or(0, |w| w.len())
    }
}
