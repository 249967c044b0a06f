//! Per-host launcher: partitions the input, spawns worker instances with
//! disjoint index ranges, and stops them again.
//!
//! The launcher is the only component that decides instance counts; it caps
//! the configured count with the resource monitor's recommendation.

use std::{fs, path::PathBuf, process::Command, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::monitor::ResourceMonitor;
use crate::store::scan::{enumerate_inputs, partition};
use crate::store::WorkStore;

/// Grace window between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(30);

pub async fn launch(cfg: &PipelineConfig, phase: u8, machine: &str) -> PipelineResult<i32> {
    if !(1..=4).contains(&phase) {
        return Err(PipelineError::Config(format!("phase {phase} out of range")));
    }
    let machine_cfg = cfg.machine(machine)?;
    let store = WorkStore::new(&cfg.store.output_root);
    store.ensure_layout()?;

    // Size the work list for this phase.
    let total = match phase {
        1 => {
            let items = enumerate_inputs(&cfg.store.input_root)?;
            match machine_cfg.range {
                Some([start, end]) => end.min(items.len()).saturating_sub(start),
                None => items.len(),
            }
        }
        n => {
            let count = store.failure_count(n - 1);
            // The previous stream is about to be fully consumed by this
            // launch; record that for the fleet.
            store.write_phase_done_marker(n - 1)?;
            count
        }
    };
    if total == 0 {
        tracing::info!("phase {phase}: nothing to do");
        return Ok(0);
    }

    let configured = machine_cfg.instances_for(phase);
    let recommended = sample_recommendation(cfg).await;
    let instances = configured.min(recommended).max(1);
    if instances < configured {
        tracing::info!(
            "resource monitor capped instances: {configured} configured, {instances} launched"
        );
    }

    let offset = machine_cfg.range.map(|[start, _]| start).unwrap_or(0);
    let ranges = partition(total, instances);
    let exe = std::env::current_exe()?;
    let run_dir = store.run_dir(machine);
    fs::create_dir_all(&run_dir)?;

    for (instance, range) in ranges.iter().enumerate() {
        if range.is_empty() {
            continue;
        }
        let child = Command::new(&exe)
            .arg("worker")
            .arg(phase.to_string())
            .arg("--machine")
            .arg(machine)
            .arg("--instance")
            .arg(instance.to_string())
            .arg("--start")
            .arg((offset + range.start).to_string())
            .arg("--end")
            .arg((offset + range.end).to_string())
            .spawn()?;
        let pidfile = run_dir.join(format!("phase{phase}-{instance}.pid"));
        fs::write(&pidfile, child.id().to_string())?;
        tracing::info!(
            "spawned phase {phase} instance {instance} (pid {}) for [{}, {})",
            child.id(),
            offset + range.start,
            offset + range.end,
        );
    }

    Ok(0)
}

/// One monitor sample for the launch decision; falls back to "no cap" when
/// the first sample does not arrive promptly.
async fn sample_recommendation(cfg: &PipelineConfig) -> usize {
    let shutdown = CancellationToken::new();
    let mut rx = ResourceMonitor::spawn(cfg.monitor.clone(), shutdown.clone());
    let wait = Duration::from_secs(cfg.monitor.interval_secs.max(1) * 2);
    let recommended = match tokio::time::timeout(wait, rx.changed()).await {
        Ok(Ok(())) => rx.borrow().recommended_instances,
        _ => usize::MAX,
    };
    shutdown.cancel();
    recommended.max(1)
}

fn pidfiles(store: &WorkStore, machine: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(store.run_dir(machine)) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "pid"))
        .collect()
}

fn machines_with_pidfiles(store: &WorkStore) -> Vec<String> {
    let Ok(entries) = fs::read_dir(store.root().join("run")) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .collect()
}

fn signal(pid: u32, sig: &str) -> bool {
    Command::new("kill")
        .arg(sig)
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn alive(pid: u32) -> bool {
    signal(pid, "-0")
}

/// SIGTERM every instance of the machine (or all machines), escalate to
/// SIGKILL after the grace window.
pub async fn stop(cfg: &PipelineConfig, machine: Option<&str>) -> PipelineResult<i32> {
    let store = WorkStore::new(&cfg.store.output_root);
    let machines: Vec<String> = match machine {
        Some(m) => vec![m.to_string()],
        None => machines_with_pidfiles(&store),
    };

    let mut pids: Vec<(PathBuf, u32)> = Vec::new();
    for machine in &machines {
        for pidfile in pidfiles(&store, machine) {
            if let Some(pid) = fs::read_to_string(&pidfile)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                pids.push((pidfile, pid));
            }
        }
    }

    if pids.is_empty() {
        tracing::info!("no running instances");
        return Ok(0);
    }

    for (_, pid) in &pids {
        if signal(*pid, "-TERM") {
            tracing::info!("sent SIGTERM to {pid}");
        }
    }

    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    loop {
        let survivors: Vec<u32> = pids.iter().map(|(_, p)| *p).filter(|p| alive(*p)).collect();
        if survivors.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            for pid in survivors {
                tracing::warn!("SIGKILL {pid} after grace window");
                signal(pid, "-KILL");
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    for (pidfile, _) in &pids {
        let _ = fs::remove_file(pidfile);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_store_has_no_pidfiles() {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        assert!(pidfiles(&store, "mac-mini").is_empty());
        assert!(machines_with_pidfiles(&store).is_empty());

        store.ensure_layout().unwrap();
        let run_dir = store.run_dir("mac-mini");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("phase1-0.pid"), "12345").unwrap();
        fs::write(run_dir.join("phase1-0.stats.json"), "{}").unwrap();

        assert_eq!(pidfiles(&store, "mac-mini").len(), 1);
        assert_eq!(machines_with_pidfiles(&store), vec!["mac-mini".to_string()]);
    }
}
