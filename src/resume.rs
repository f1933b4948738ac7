//! Seed directory scanning and resume-state discovery (§6).
//!
//! A fresh run just loads every regular file under the input directory as a
//! root test case. Resuming an existing output directory additionally
//! recognizes the `id:NNNNNN,src:MMMMMM,...` naming scheme the queue itself
//! uses, so a seed that's really a previous session's queue entry picks up
//! its original depth and deterministic-stage progress instead of being
//! treated as a brand-new root seed.

use std::path::{Path, PathBuf};

use crate::error::{FuzzError, Result};

/// Fields recovered from a queue filename, when it parses as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueName {
    pub id: u32,
    pub src: Option<u32>,
}

/// Parses `id:NNNNNN[,src:MMMMMM][,op:...]...`. Returns `None` for plain
/// seed filenames that don't follow the queue naming scheme.
pub fn parse_queue_name(name: &str) -> Option<QueueName> {
    let mut id = None;
    let mut src = None;
    for field in name.split(',') {
        let (key, value) = field.split_once(':')?;
        match key {
            "id" => id = value.parse().ok(),
            "src" => src = value.parse().ok(),
            _ => {}
        }
    }
    Some(QueueName { id: id?, src })
}

/// A seed discovered on disk, with whatever resume metadata could be
/// recovered from its filename and the `.state/` sidecar directory.
pub struct DiscoveredSeed {
    pub path: PathBuf,
    pub depth: u32,
    pub src: Option<u32>,
    pub passed_det: bool,
}

/// Scans `input_dir` for regular files, building a [`DiscoveredSeed`] for
/// each. A file whose name parses as a queue name and whose id is exactly
/// `next_id` is treated as resumed: its `src` becomes its parent depth
/// marker, and `.state/deterministic_done/<name>` marks `passed_det`.
/// Everything else is a fresh root seed (depth 1).
pub fn scan_seed_dir(input_dir: &Path, next_id: u32) -> Result<Vec<DiscoveredSeed>> {
    let det_done_dir = input_dir.join(".state").join("deterministic_done");

    let mut seeds = Vec::new();
    let entries = std::fs::read_dir(input_dir).map_err(|e| FuzzError::io(input_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FuzzError::io(input_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let parsed = parse_queue_name(&name);
        let resumed = matches!(parsed, Some(q) if q.id == next_id);

        let (depth, src, passed_det) = if resumed {
            let q = parsed.unwrap();
            let passed_det = det_done_dir.join(&name).exists();
            (1, q.src, passed_det)
        } else {
            (1, None, false)
        };

        seeds.push(DiscoveredSeed {
            path,
            depth,
            src,
            passed_det,
        });
    }

    seeds.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(seeds)
}

/// Marks `name` as having completed its deterministic stages, for a future
/// resume to pick up.
pub fn mark_deterministic_done(queue_dir: &Path, name: &str) -> Result<()> {
    let dir = queue_dir.join(".state").join("deterministic_done");
    std::fs::create_dir_all(&dir).map_err(|e| FuzzError::io(&dir, e))?;
    let marker = dir.join(name);
    std::fs::write(&marker, b"").map_err(|e| FuzzError::io(marker, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_id_and_src_fields() {
        let q = parse_queue_name("id:000042,src:000007,op:havoc").unwrap();
        assert_eq!(q.id, 42);
        assert_eq!(q.src, Some(7));
    }

    #[test]
    fn plain_filename_does_not_parse() {
        assert!(parse_queue_name("seed1.bin").is_none());
    }

    #[test]
    fn scan_seed_dir_treats_plain_files_as_fresh_roots() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("seed1"), b"hello").unwrap();
        let seeds = scan_seed_dir(dir.path(), 0).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].depth, 1);
        assert!(seeds[0].src.is_none());
        assert!(!seeds[0].passed_det);
    }

    #[test]
    fn scan_seed_dir_recognizes_resumed_queue_entries() {
        let dir = tempdir().unwrap();
        let name = "id:000000,src:000003,op:havoc";
        std::fs::write(dir.path().join(name), b"hello").unwrap();
        mark_deterministic_done(dir.path(), name).unwrap();

        let seeds = scan_seed_dir(dir.path(), 0).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].src, Some(3));
        assert!(seeds[0].passed_det);
    }
}
