//! Resource monitor: periodic CPU/RAM/GPU/disk sampling with an advisory
//! throttle signal and a recommended instance count.
//!
//! Runs as an in-process task publishing on a watch channel; worker loops
//! read the latest snapshot at item boundaries only, so in-flight items
//! always complete.

use std::time::Duration;

use sysinfo::{Disks, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub gpu_percent: Option<f32>,
    pub min_free_disk_gib: Option<f64>,
    pub throttled: bool,
    pub throttle_reason: Option<String>,
    pub recommended_instances: usize,
}

pub struct ResourceMonitor {
    cfg: MonitorConfig,
    sys: System,
    tx: watch::Sender<ResourceSnapshot>,
}

impl ResourceMonitor {
    /// Spawn the sampling loop; returns the receiver workers subscribe to.
    pub fn spawn(
        cfg: MonitorConfig,
        shutdown: CancellationToken,
    ) -> watch::Receiver<ResourceSnapshot> {
        let (tx, rx) = watch::channel(ResourceSnapshot::default());
        let mut monitor = ResourceMonitor {
            cfg,
            sys: System::new(),
            tx,
        };
        tokio::spawn(async move {
            let interval = Duration::from_secs(monitor.cfg.interval_secs.max(1));
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = monitor.sample().await;
                        if monitor.tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        rx
    }

    async fn sample(&mut self) -> ResourceSnapshot {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpu_percent = self.sys.global_cpu_usage();
        let total_mem = self.sys.total_memory().max(1);
        let ram_percent = (self.sys.used_memory() as f32 / total_mem as f32) * 100.0;
        let ram_gib = total_mem as f64 / f64::from(1 << 30);
        let gpu_percent = gpu_utilization().await;
        let min_free_disk_gib = self.min_free_disk();

        let cores = self.sys.cpus().len().max(1);
        let snapshot = evaluate(
            &self.cfg,
            cores,
            ram_gib,
            cpu_percent,
            ram_percent,
            gpu_percent,
            min_free_disk_gib,
        );
        if snapshot.throttled {
            tracing::warn!(
                reason = snapshot.throttle_reason.as_deref().unwrap_or(""),
                "throttle raised"
            );
        }
        snapshot
    }

    fn min_free_disk(&self) -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        let mut min: Option<f64> = None;
        for disk in disks.list() {
            let relevant = self.cfg.disk_paths.is_empty()
                || self
                    .cfg
                    .disk_paths
                    .iter()
                    .any(|p| p.starts_with(disk.mount_point()));
            if relevant {
                let free = disk.available_space() as f64 / f64::from(1 << 30);
                min = Some(min.map_or(free, |m: f64| m.min(free)));
            }
        }
        min
    }
}

/// Pure throttle/recommendation policy, separated from sampling so it is
/// directly testable.
fn evaluate(
    cfg: &MonitorConfig,
    cores: usize,
    ram_gib: f64,
    cpu_percent: f32,
    ram_percent: f32,
    gpu_percent: Option<f32>,
    min_free_disk_gib: Option<f64>,
) -> ResourceSnapshot {
    let mut reason = None;
    if cpu_percent > cfg.max_cpu_percent {
        reason = Some(format!("CPU {cpu_percent:.0}% > {:.0}%", cfg.max_cpu_percent));
    } else if ram_percent > cfg.max_ram_percent {
        reason = Some(format!("RAM {ram_percent:.0}% > {:.0}%", cfg.max_ram_percent));
    } else if let Some(gpu) = gpu_percent {
        if gpu > cfg.max_gpu_percent {
            reason = Some(format!("GPU {gpu:.0}% > {:.0}%", cfg.max_gpu_percent));
        }
    }
    if reason.is_none() {
        if let Some(free) = min_free_disk_gib {
            if free < cfg.min_free_disk_gib {
                reason = Some(format!(
                    "free disk {free:.1} GiB < {:.1} GiB",
                    cfg.min_free_disk_gib
                ));
            }
        }
    }

    ResourceSnapshot {
        cpu_percent,
        ram_percent,
        gpu_percent,
        min_free_disk_gib,
        throttled: reason.is_some(),
        throttle_reason: reason,
        recommended_instances: recommend(cores, ram_gib, cpu_percent, ram_percent, gpu_percent, cfg),
    }
}

/// `min(cores/2, ram_gib/4)` scaled by current headroom, halved again when
/// the GPU is the binding resource.
fn recommend(
    cores: usize,
    ram_gib: f64,
    cpu_percent: f32,
    ram_percent: f32,
    gpu_percent: Option<f32>,
    cfg: &MonitorConfig,
) -> usize {
    let ceiling = (cores / 2).min((ram_gib / 4.0) as usize).max(1);
    let usage = cpu_percent.max(ram_percent).clamp(0.0, 100.0);
    let headroom = (100.0 - usage) / 100.0;
    let mut recommended = ((ceiling as f32) * headroom).floor() as usize;
    if gpu_percent.is_some_and(|g| g > cfg.max_gpu_percent) {
        recommended /= 2;
    }
    recommended.max(1)
}

/// GPU utilization via nvidia-smi when an accelerator is present.
async fn gpu_utilization() -> Option<f32> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse::<f32>().ok())
        .reduce(f32::max)
}

pub fn format_snapshot(s: &ResourceSnapshot) -> String {
    let gpu = s
        .gpu_percent
        .map(|g| format!("{g:.0}%"))
        .unwrap_or_else(|| "n/a".to_string());
    let disk = s
        .min_free_disk_gib
        .map(|d| format!("{d:.1} GiB"))
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "CPU {:.0}% | RAM {:.0}% | GPU {} | free disk {} | throttled: {} | recommended instances: {}",
        s.cpu_percent,
        s.ram_percent,
        gpu,
        disk,
        if s.throttled { "yes" } else { "no" },
        s.recommended_instances,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MonitorConfig {
        MonitorConfig::default()
    }

    #[test]
    fn idle_host_is_not_throttled() {
        let s = evaluate(&cfg(), 16, 64.0, 20.0, 30.0, None, Some(100.0));
        assert!(!s.throttled);
        assert!(s.throttle_reason.is_none());
    }

    #[test]
    fn each_signal_can_raise_the_throttle() {
        let c = cfg();
        assert!(evaluate(&c, 16, 64.0, 90.0, 30.0, None, None).throttled);
        assert!(evaluate(&c, 16, 64.0, 20.0, 92.0, None, None).throttled);
        assert!(evaluate(&c, 16, 64.0, 20.0, 30.0, Some(95.0), None).throttled);
        assert!(evaluate(&c, 16, 64.0, 20.0, 30.0, None, Some(2.0)).throttled);
    }

    #[test]
    fn recommendation_scales_with_headroom() {
        let c = cfg();
        // 16 cores, 64 GiB: ceiling = min(8, 16) = 8.
        assert_eq!(recommend(16, 64.0, 0.0, 0.0, None, &c), 8);
        assert_eq!(recommend(16, 64.0, 50.0, 0.0, None, &c), 4);
        // RAM is the larger usage signal here.
        assert_eq!(recommend(16, 64.0, 10.0, 75.0, None, &c), 2);
    }

    #[test]
    fn ram_bounds_the_ceiling() {
        let c = cfg();
        // 20 cores but only 8 GiB: ceiling = min(10, 2) = 2.
        assert_eq!(recommend(20, 8.0, 0.0, 0.0, None, &c), 2);
    }

    #[test]
    fn gpu_pressure_halves_the_recommendation() {
        let c = cfg();
        let unbound = recommend(16, 64.0, 0.0, 0.0, Some(50.0), &c);
        let bound = recommend(16, 64.0, 0.0, 0.0, Some(95.0), &c);
        assert_eq!(unbound, 8);
        assert_eq!(bound, 4);
    }

    #[test]
    fn recommendation_never_drops_to_zero() {
        let c = cfg();
        assert_eq!(recommend(2, 2.0, 99.0, 99.0, Some(99.0), &c), 1);
    }
}
