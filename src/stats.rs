//! `fuzzer_stats` and `plot_data` output (§9 ambient stack). Ambient
//! reporting surfaces only; nothing here feeds back into scheduling or
//! feedback decisions.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{FuzzError, Result};

/// How often `fuzzer_stats` is rewritten and `plot_data` gets a new row.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// The global counters `fuzzer_stats`/`plot_data` summarise. Plain data;
/// the fuzzer loop owns and updates it each iteration.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub execs_done: u64,
    pub execs_per_sec: f64,
    pub paths_total: u64,
    pub paths_favored: u64,
    pub pending_favored: u64,
    pub pending_total: u64,
    pub crashes: u64,
    pub hangs: u64,
    pub cycles_done: u64,
    pub bitmap_cvg: f64,
    pub stability: f64,
    pub max_depth: u32,
    pub queued_discovered: u64,
    pub queued_with_cov: u64,
}

/// Rewrites `<out>/fuzzer_stats` from scratch in AFL's `key : value`
/// one-per-line text format.
pub fn write_fuzzer_stats(out_dir: &Path, start: Instant, counters: &Counters) -> Result<()> {
    let path = out_dir.join("fuzzer_stats");
    let run_time = start.elapsed().as_secs();
    let body = format!(
        "{banner}\n\
         run_time          : {run_time}\n\
         execs_done        : {execs_done}\n\
         execs_per_sec     : {execs_per_sec:.2}\n\
         paths_total       : {paths_total}\n\
         paths_favored     : {paths_favored}\n\
         pending_favored   : {pending_favored}\n\
         pending_total     : {pending_total}\n\
         cycles_done       : {cycles_done}\n\
         bitmap_cvg        : {bitmap_cvg:.2}%\n\
         stability         : {stability:.2}%\n\
         unique_crashes    : {crashes}\n\
         unique_hangs      : {hangs}\n\
         max_depth         : {max_depth}\n\
         queued_discovered : {queued_discovered}\n\
         queued_with_cov   : {queued_with_cov}\n",
        banner = crate::config::FUZZER_STATS_BANNER,
        run_time = run_time,
        execs_done = counters.execs_done,
        execs_per_sec = counters.execs_per_sec,
        paths_total = counters.paths_total,
        paths_favored = counters.paths_favored,
        pending_favored = counters.pending_favored,
        pending_total = counters.pending_total,
        cycles_done = counters.cycles_done,
        bitmap_cvg = counters.bitmap_cvg,
        stability = counters.stability,
        crashes = counters.crashes,
        hangs = counters.hangs,
        max_depth = counters.max_depth,
        queued_discovered = counters.queued_discovered,
        queued_with_cov = counters.queued_with_cov,
    );
    std::fs::write(&path, body).map_err(|e| FuzzError::io(path, e))
}

/// Appends one CSV row to `<out>/plot_data`, writing the header first if the
/// file is new.
pub fn append_plot_data_row(out_dir: &Path, start: Instant, counters: &Counters) -> Result<()> {
    let path = out_dir.join("plot_data");
    let is_new = !path.exists();

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| FuzzError::io(&path, e))?;

    if is_new {
        writeln!(
            file,
            "# relative_time, cycles_done, execs_done, paths_total, pending_total, pending_favored, unique_crashes, unique_hangs, bitmap_cvg"
        )
        .map_err(|e| FuzzError::io(&path, e))?;
    }

    writeln!(
        file,
        "{}, {}, {}, {}, {}, {}, {}, {}, {:.2}",
        start.elapsed().as_secs(),
        counters.cycles_done,
        counters.execs_done,
        counters.paths_total,
        counters.pending_total,
        counters.pending_favored,
        counters.crashes,
        counters.hangs,
        counters.bitmap_cvg,
    )
    .map_err(|e| FuzzError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fuzzer_stats_file_contains_banner_and_counts() {
        let dir = tempdir().unwrap();
        let counters = Counters {
            execs_done: 42,
            paths_total: 3,
            ..Default::default()
        };
        write_fuzzer_stats(dir.path(), Instant::now(), &counters).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("fuzzer_stats")).unwrap();
        assert!(contents.starts_with(crate::config::FUZZER_STATS_BANNER));
        assert!(contents.contains("execs_done        : 42"));
    }

    #[test]
    fn plot_data_appends_rows_with_a_single_header() {
        let dir = tempdir().unwrap();
        let counters = Counters::default();
        append_plot_data_row(dir.path(), Instant::now(), &counters).unwrap();
        append_plot_data_row(dir.path(), Instant::now(), &counters).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("plot_data")).unwrap();
        assert_eq!(contents.lines().filter(|l| l.starts_with('#')).count(), 1);
        assert_eq!(contents.lines().count(), 3);
    }
}
