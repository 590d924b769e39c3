//! Docker container metrics through the docker CLI.
//!
//! Per poll: `docker ps` lists containers, `docker stats` gives cpu and
//! memory percentages for running ones, `docker inspect` gives state,
//! health and the restart count. Restart counts are turned into deltas
//! against the previous poll.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remedy_common::{metrics, Result, Sample, Target};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::command_output;
use crate::ports::MetricsSource;

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
}

#[derive(Debug, Deserialize)]
struct InspectHealth {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "Health", default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "RestartCount", default)]
    restart_count: u64,
    #[serde(rename = "State")]
    state: InspectState,
}

/// Container state as reported by `docker inspect`
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContainerState {
    pub name: String,
    pub running: bool,
    pub health: Option<String>,
    pub restart_count: u64,
}

fn percent(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('%').trim().parse::<f64>().ok()
}

/// Parse `docker stats --format {{json .}}` output into (name, cpu%, mem%)
pub(crate) fn parse_stats(output: &str) -> Vec<(String, Option<f64>, Option<f64>)> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<StatsLine>(line) {
            Ok(stats) => Some((stats.name, percent(&stats.cpu_perc), percent(&stats.mem_perc))),
            Err(e) => {
                debug!("Skipping unparsable stats line: {}", e);
                None
            }
        })
        .collect()
}

pub(crate) fn parse_inspect(output: &str) -> Result<Vec<ContainerState>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(output)?;
    Ok(entries
        .into_iter()
        .map(|entry| ContainerState {
            name: entry.name.trim_start_matches('/').to_string(),
            running: entry.state.running,
            health: entry
                .state
                .health
                .map(|h| h.status)
                .filter(|s| !s.is_empty()),
            restart_count: entry.restart_count,
        })
        .collect())
}

pub struct DockerSource {
    docker_bin: String,
    /// Restart count seen on the previous poll, per container
    restart_counts: Mutex<HashMap<String, u64>>,
}

impl DockerSource {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            restart_counts: Mutex::new(HashMap::new()),
        }
    }

    /// New restarts since the last poll. The first sighting only sets a baseline.
    fn restart_delta(&self, name: &str, count: u64) -> Option<u64> {
        let mut counts = self.restart_counts.lock().unwrap_or_else(|e| e.into_inner());
        match counts.insert(name.to_string(), count) {
            Some(previous) if count > previous => Some(count - previous),
            _ => None,
        }
    }

    /// Forget containers that disappeared
    fn retain_known(&self, names: &[String]) {
        let mut counts = self.restart_counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.retain(|name, _| names.contains(name));
    }

    pub(crate) fn state_samples(&self, states: &[ContainerState], now: DateTime<Utc>) -> Vec<Sample> {
        let mut samples = Vec::new();
        for state in states {
            let target = Target::container(state.name.clone());
            samples.push(Sample::new(
                &target,
                metrics::RUNNING,
                if state.running { 1.0 } else { 0.0 },
                now,
            ));
            if let Some(health) = &state.health {
                let failing = if health == "unhealthy" { 1.0 } else { 0.0 };
                samples.push(Sample::new(&target, metrics::HEALTH_FAILING, failing, now));
            }
            if let Some(delta) = self.restart_delta(&state.name, state.restart_count) {
                debug!(container = %state.name, delta, "Container restarted");
                samples.push(Sample::new(&target, metrics::RESTARTS, delta as f64, now));
            }
        }
        samples
    }
}

#[async_trait]
impl MetricsSource for DockerSource {
    async fn poll(&self) -> Result<Vec<Sample>> {
        let now = Utc::now();
        let listing = command_output(
            &self.docker_bin,
            &["ps", "--all", "--format", "{{.Names}}"],
            false,
        )
        .await?;
        let names: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        self.retain_known(&names);
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut samples = Vec::new();

        match command_output(
            &self.docker_bin,
            &["stats", "--no-stream", "--format", "{{json .}}"],
            false,
        )
        .await
        {
            Ok(output) => {
                for (name, cpu, mem) in parse_stats(&output) {
                    let target = Target::container(name);
                    if let Some(cpu) = cpu {
                        samples.push(Sample::new(&target, metrics::CPU_PERCENT, cpu, now));
                    }
                    if let Some(mem) = mem {
                        samples.push(Sample::new(&target, metrics::MEMORY_PERCENT, mem, now));
                    }
                }
            }
            Err(e) => warn!("docker stats failed: {}", e),
        }

        let mut args = vec!["inspect"];
        args.extend(names.iter().map(String::as_str));
        match command_output(&self.docker_bin, &args, false).await {
            Ok(output) => match parse_inspect(&output) {
                Ok(states) => samples.extend(self.state_samples(&states, now)),
                Err(e) => warn!("docker inspect output unreadable: {}", e),
            },
            // Stats samples are still worth keeping
            Err(e) => warn!("docker inspect failed: {}", e),
        }

        Ok(samples)
    }

    fn name(&self) -> &str {
        "docker"
    }
}
