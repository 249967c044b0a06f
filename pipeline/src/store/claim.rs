//! Claim protocol: exclusive-create lock files with stale-lock recovery.
//!
//! Exclusive-create on the shared filesystem is the only admissible
//! acquisition; it gives at-most-one processing without any coordinator. A
//! lock whose mtime is older than the TTL is treated as abandoned, deleted,
//! and the claim re-attempted exactly once.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::PathBuf,
    time::{Duration, SystemTime},
};

use super::WorkStore;

#[derive(Debug)]
pub enum ClaimOutcome {
    /// The lock is held; the guard removes it on release.
    Claimed(ClaimGuard),
    /// Another live worker holds the lock. Not a failure.
    Contended,
    /// An artifact already exists from this or an earlier phase.
    AlreadyDone,
}

/// Holder of a claim lock. `release` removes the lock after the artifact or
/// failure record has been written; dropping without release also removes it
/// so a panicking worker does not leave the item locked for a full TTL.
#[derive(Debug)]
pub struct ClaimGuard {
    path: PathBuf,
    released: bool,
}

impl ClaimGuard {
    pub fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn claim(
    store: &WorkStore,
    phase: u8,
    item_id: &str,
    owner: &str,
    stale_ttl: Duration,
) -> std::io::Result<ClaimOutcome> {
    if store.has_artifact_up_to(phase, item_id) {
        return Ok(ClaimOutcome::AlreadyDone);
    }

    let path = store.locks_dir(phase).join(item_id);
    match try_create(&path, owner)? {
        true => Ok(ClaimOutcome::Claimed(ClaimGuard {
            path,
            released: false,
        })),
        false => {
            if !lock_is_stale(&path, stale_ttl) {
                return Ok(ClaimOutcome::Contended);
            }
            // Abandoned by a crashed worker; reclaim with a single retry.
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            if try_create(&path, owner)? {
                Ok(ClaimOutcome::Claimed(ClaimGuard {
                    path,
                    released: false,
                }))
            } else {
                Ok(ClaimOutcome::Contended)
            }
        }
    }
}

fn try_create(path: &PathBuf, owner: &str) -> std::io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(owner.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

fn lock_is_stale(path: &PathBuf, ttl: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        // Raced with the owner's release; treat as stale so the retry runs.
        return true;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(mtime)
        .map(|age| age > ttl)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::classify::DocumentKind;
    use crate::store::Artifact;
    use chrono::Utc;
    use lib_field_extract::FieldSet;

    const TTL: Duration = Duration::from_secs(600);

    fn store() -> (tempfile::TempDir, WorkStore) {
        let dir = tempdir().unwrap();
        let store = WorkStore::new(dir.path());
        store.ensure_layout().unwrap();
        (dir, store)
    }

    #[test]
    fn claim_then_release_removes_lock() {
        let (_dir, store) = store();

        let outcome = claim(&store, 1, "item-1", "host-a", TTL).unwrap();
        let guard = match outcome {
            ClaimOutcome::Claimed(g) => g,
            other => panic!("expected claim, got {other:?}"),
        };
        let lock_path = store.locks_dir(1).join("item-1");
        assert!(lock_path.exists());
        assert_eq!(fs::read_to_string(&lock_path).unwrap(), "host-a");

        guard.release().unwrap();
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_claim_is_contended() {
        let (_dir, store) = store();

        let first = claim(&store, 1, "item-1", "host-a", TTL).unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));
        let second = claim(&store, 1, "item-1", "host-b", TTL).unwrap();
        assert!(matches!(second, ClaimOutcome::Contended));
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let (_dir, store) = store();

        let lock_path = store.locks_dir(1).join("item-42");
        fs::write(&lock_path, "crashed-host").unwrap();

        // TTL of zero makes any existing lock stale.
        let outcome = claim(&store, 1, "item-42", "host-b", Duration::ZERO).unwrap();
        let guard = match outcome {
            ClaimOutcome::Claimed(g) => g,
            other => panic!("expected reclaim, got {other:?}"),
        };
        assert_eq!(fs::read_to_string(&lock_path).unwrap(), "host-b");
        guard.release().unwrap();
    }

    #[test]
    fn fresh_lock_is_not_reclaimed() {
        let (_dir, store) = store();

        let lock_path = store.locks_dir(1).join("item-1");
        fs::write(&lock_path, "other-host").unwrap();

        let outcome = claim(&store, 1, "item-1", "host-b", TTL).unwrap();
        assert!(matches!(outcome, ClaimOutcome::Contended));
        assert_eq!(fs::read_to_string(&lock_path).unwrap(), "other-host");
    }

    #[test]
    fn existing_artifact_short_circuits() {
        let (_dir, store) = store();

        store
            .write_artifact(&Artifact {
                item_id: "item-1".to_string(),
                phase: 1,
                doc_kind: DocumentKind::Invoice,
                fields: FieldSet::default(),
                raw_text_sha256: String::new(),
                content_md5: String::new(),
                confidence: 1.0,
                escalation_trace: None,
                timestamp: Utc::now(),
            })
            .unwrap();

        let outcome = claim(&store, 2, "item-1", "host-a", TTL).unwrap();
        assert!(matches!(outcome, ClaimOutcome::AlreadyDone));
        // No lock file was created for a skipped item.
        assert!(!store.locks_dir(2).join("item-1").exists());
    }

    #[test]
    fn racing_workers_claim_each_item_exactly_once() {
        let (_dir, store) = store();
        let items: Vec<String> = (0..20).map(|i| format!("item-{i:02}")).collect();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            let items = items.clone();
            handles.push(std::thread::spawn(move || {
                let mut won = Vec::new();
                for item_id in &items {
                    if let ClaimOutcome::Claimed(guard) =
                        claim(&store, 1, item_id, &format!("host-{worker}"), TTL).unwrap()
                    {
                        // Hold the claim; never release within the race.
                        std::mem::forget(guard);
                        won.push(item_id.clone());
                    }
                }
                won
            }));
        }

        let mut all_wins: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all_wins.sort();

        // Every item claimed by exactly one worker.
        assert_eq!(all_wins, items);
    }

    #[test]
    fn dropped_guard_cleans_up() {
        let (_dir, store) = store();

        {
            let _guard = match claim(&store, 1, "item-1", "host-a", TTL).unwrap() {
                ClaimOutcome::Claimed(g) => g,
                other => panic!("expected claim, got {other:?}"),
            };
            // Worker dies here without releasing.
        }
        assert!(!store.locks_dir(1).join("item-1").exists());

        // The item is claimable again immediately.
        let outcome = claim(&store, 1, "item-1", "host-b", TTL).unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
    }
}
