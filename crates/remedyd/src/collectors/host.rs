//! Host metrics through sysinfo

use async_trait::async_trait;
use chrono::Utc;
use remedy_common::{metrics, Result, Sample, Target};
use std::path::Path;
use std::sync::Mutex;
use sysinfo::{Disks, System};

use crate::ports::MetricsSource;

pub struct HostSource {
    host: Target,
    /// Kept between polls so cpu usage is measured over the poll interval
    system: Mutex<System>,
}

impl HostSource {
    pub fn new() -> Self {
        let hostname = System::host_name().unwrap_or_else(|| "localhost".to_string());
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            host: Target::host(hostname),
            system: Mutex::new(system),
        }
    }

    pub fn target(&self) -> &Target {
        &self.host
    }
}

impl Default for HostSource {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(used: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| used as f64 / total as f64 * 100.0)
}

#[async_trait]
impl MetricsSource for HostSource {
    async fn poll(&self) -> Result<Vec<Sample>> {
        let now = Utc::now();
        let mut samples = Vec::new();

        {
            let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
            sys.refresh_cpu();
            sys.refresh_memory();

            samples.push(Sample::new(
                &self.host,
                metrics::CPU_PERCENT,
                f64::from(sys.global_cpu_info().cpu_usage()),
                now,
            ));
            if let Some(mem) = ratio(sys.used_memory(), sys.total_memory()) {
                samples.push(Sample::new(&self.host, metrics::MEMORY_PERCENT, mem, now));
            }
            if let Some(swap) = ratio(sys.used_swap(), sys.total_swap()) {
                samples.push(Sample::new(&self.host, metrics::SWAP_PERCENT, swap, now));
            }
        }

        let disks = Disks::new_with_refreshed_list();
        if let Some(root) = disks.iter().find(|d| d.mount_point() == Path::new("/")) {
            let used = root.total_space().saturating_sub(root.available_space());
            if let Some(disk) = ratio(used, root.total_space()) {
                samples.push(Sample::new(&self.host, metrics::DISK_PERCENT, disk, now));
            }
        }

        samples.push(Sample::new(
            &self.host,
            metrics::LOAD_1M,
            System::load_average().one,
            now,
        ));

        Ok(samples)
    }

    fn name(&self) -> &str {
        "host"
    }
}
