//! `status` command: per-phase progress counters from the shared store.

use std::fs;

use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::launcher;
use crate::store::{WorkStore, PHASES};
use crate::util::banner;

pub fn print_status(cfg: &PipelineConfig) -> PipelineResult<i32> {
    let store = WorkStore::new(&cfg.store.output_root);

    println!("{}", banner("MAILSIFT STATUS"));
    println!(
        "{:<8} {:>10} {:>10} {:>10} {:>6}",
        "phase", "completed", "failed", "deferred", "done"
    );
    for phase in PHASES {
        let deferred = if phase == 3 {
            store.deferred_count().to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<8} {:>10} {:>10} {:>10} {:>6}",
            format!("phase{phase}"),
            store.artifact_count(phase),
            store.failure_count(phase),
            deferred,
            if store.phase_done(phase) { "yes" } else { "no" },
        );
    }

    let running = running_instances(&store);
    println!();
    println!("running instances: {running}");
    println!("{}", banner(""));
    Ok(0)
}

fn running_instances(store: &WorkStore) -> usize {
    let Ok(machines) = fs::read_dir(store.root().join("run")) else {
        return 0;
    };
    machines
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .flat_map(|machine| {
            fs::read_dir(machine.path())
                .into_iter()
                .flatten()
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "pid"))
        })
        .filter(|pidfile| {
            fs::read_to_string(pidfile)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .is_some_and(launcher::alive)
        })
        .count()
}
