//! systemd unit status

use async_trait::async_trait;
use chrono::Utc;
use remedy_common::{metrics, RemedyError, Result, Sample, Target};
use tracing::warn;

use super::command_output;
use crate::ports::MetricsSource;

pub struct SystemdSource {
    units: Vec<String>,
}

impl SystemdSource {
    pub fn new(units: Vec<String>) -> Self {
        Self { units }
    }
}

/// `systemctl is-active` prints the state and exits non-zero for anything but active
fn is_active(output: &str) -> bool {
    output.trim() == "active"
}

#[async_trait]
impl MetricsSource for SystemdSource {
    async fn poll(&self) -> Result<Vec<Sample>> {
        let now = Utc::now();
        let mut samples = Vec::new();
        let mut last_error = None;

        for unit in &self.units {
            match command_output("systemctl", &["is-active", unit], true).await {
                Ok(output) => {
                    let value = if is_active(&output) { 1.0 } else { 0.0 };
                    samples.push(Sample::new(&Target::service(unit.clone()), metrics::ACTIVE, value, now));
                }
                Err(e) => {
                    warn!(unit = %unit, "Could not query unit: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if samples.is_empty() => Err(RemedyError::Unavailable(format!(
                "systemctl unavailable: {}",
                e
            ))),
            _ => Ok(samples),
        }
    }

    fn name(&self) -> &str {
        "systemd"
    }
}
