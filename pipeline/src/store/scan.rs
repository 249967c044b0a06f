//! Input enumeration and index-range partitioning.
//!
//! Every host enumerates the same input tree into the same ordered list, so
//! an item's slot is stable everywhere and ranges can be assigned without
//! negotiation.

use std::{
    fs,
    ops::Range,
    path::{Path, PathBuf},
};

use crate::error::PipelineResult;

/// One discovered work item: a directory holding `message.eml` plus
/// attachments. The directory name is the item id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputItem {
    pub item_id: String,
    pub slot: usize,
    pub dir: PathBuf,
}

impl InputItem {
    pub fn eml_path(&self) -> Option<PathBuf> {
        let canonical = self.dir.join("message.eml");
        if canonical.exists() {
            return Some(canonical);
        }
        // Fall back to any .eml in the item directory.
        let mut emls: Vec<PathBuf> = fs::read_dir(&self.dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "eml"))
            .collect();
        emls.sort();
        emls.into_iter().next()
    }

    /// First PDF attachment, used as the primary blob for the content hash
    /// and the delivery upload.
    pub fn primary_blob(&self) -> Option<PathBuf> {
        let mut pdfs: Vec<PathBuf> = fs::read_dir(&self.dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
            })
            .collect();
        pdfs.sort();
        pdfs.into_iter().next().or_else(|| self.eml_path())
    }
}

/// Enumerate item directories in stable lexicographic order and assign
/// slots. Hidden directories are skipped.
pub fn enumerate_inputs(input_root: &Path) -> PipelineResult<Vec<InputItem>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(input_root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && !p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'))
        })
        .collect();
    dirs.sort();

    Ok(dirs
        .into_iter()
        .enumerate()
        .filter_map(|(slot, dir)| {
            let item_id = dir.file_name()?.to_str()?.to_string();
            Some(InputItem { item_id, slot, dir })
        })
        .collect())
}

/// Split `[0, total)` into `instances` disjoint half-open ranges that cover
/// the input, sized within one of each other.
pub fn partition(total: usize, instances: usize) -> Vec<Range<usize>> {
    if instances == 0 {
        return Vec::new();
    }
    let base = total / instances;
    let remainder = total % instances;
    let mut ranges = Vec::with_capacity(instances);
    let mut start = 0;
    for i in 0..instances {
        let len = base + usize::from(i < remainder);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn enumeration_is_stable_and_ordered() {
        let dir = tempdir().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("loose-file"), b"x").unwrap();

        let items = enumerate_inputs(dir.path()).unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["alpha", "mid", "zeta"]);
        assert_eq!(items[0].slot, 0);
        assert_eq!(items[2].slot, 2);

        // Re-running yields the identical enumeration.
        let again = enumerate_inputs(dir.path()).unwrap();
        assert_eq!(items, again);
    }

    #[test]
    fn empty_input_yields_no_items() {
        let dir = tempdir().unwrap();
        assert!(enumerate_inputs(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn partitions_are_disjoint_and_cover() {
        for (total, instances) in [(0, 3), (1, 1), (10, 3), (100, 7), (5, 8)] {
            let ranges = partition(total, instances);
            assert_eq!(ranges.len(), instances);

            let mut covered = vec![false; total];
            for range in &ranges {
                for i in range.clone() {
                    assert!(!covered[i], "index {i} assigned twice");
                    covered[i] = true;
                }
            }
            assert!(covered.iter().all(|c| *c), "{total}/{instances} not covered");

            let max = ranges.iter().map(|r| r.len()).max().unwrap_or(0);
            let min = ranges.iter().map(|r| r.len()).min().unwrap_or(0);
            assert!(max - min <= 1);
        }
    }

    #[test]
    fn primary_blob_prefers_pdf_over_eml() {
        let dir = tempdir().unwrap();
        let item_dir = dir.path().join("item-1");
        fs::create_dir(&item_dir).unwrap();
        fs::write(item_dir.join("message.eml"), b"eml").unwrap();

        let items = enumerate_inputs(dir.path()).unwrap();
        assert_eq!(
            items[0].primary_blob().unwrap(),
            item_dir.join("message.eml")
        );

        fs::write(item_dir.join("invoice.pdf"), b"pdf").unwrap();
        assert_eq!(
            items[0].primary_blob().unwrap(),
            item_dir.join("invoice.pdf")
        );
    }
}
