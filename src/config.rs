//! CLI surface and startup validation (§6/§9).

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::{FuzzError, Result};
use crate::executor::forkserver::validate_target_binary;
use crate::scheduler::energy::PowerSchedule;
use crate::scheduler::SchedulerPolicy;

/// Coverage-guided greybox fuzzer.
#[derive(Debug, Parser)]
#[command(name = "greyfuzz", version, about)]
pub struct Cli {
    /// Input seed directory.
    #[arg(short = 'i', long = "input")]
    pub input_dir: PathBuf,

    /// Output directory (queue/crashes/hangs/stats).
    #[arg(short = 'o', long = "output")]
    pub output_dir: PathBuf,

    /// Per-run timeout in milliseconds.
    #[arg(short = 't', long = "timeout", default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Target memory limit in MB (0 disables the limit).
    #[arg(short = 'm', long = "memory-limit", default_value_t = 0)]
    pub memory_limit_mb: u64,

    /// Deterministic RNG seed; omit for a random one.
    #[arg(short = 's', long = "seed")]
    pub seed: Option<u64>,

    /// Primary parallel-mode instance id.
    #[arg(short = 'M', long = "main-instance")]
    pub main_instance: Option<String>,

    /// Secondary parallel-mode instance id.
    #[arg(short = 'S', long = "secondary-instance")]
    pub secondary_instance: Option<String>,

    /// Power schedule: fast, coe, explore, lin, quad, exploit. Governs only
    /// the havoc iteration budget; independent of which entry gets picked.
    #[arg(short = 'p', long = "power-schedule", default_value = "explore")]
    pub power_schedule: String,

    /// Seed-selection policy: fifo (classical AFL) or alias (AFL++/Rezzuf
    /// weighted sampling, the default).
    #[arg(short = 'c', long = "scheduler", default_value = "alias")]
    pub scheduler_policy: String,

    /// Dictionary file (AFL `-x` format).
    #[arg(short = 'x', long = "dictionary")]
    pub dictionary: Option<PathBuf>,

    /// Target binary and its arguments, after `--`.
    #[arg(trailing_var_arg = true, required = true)]
    pub target_argv: Vec<String>,
}

/// Validated configuration the fuzzer actually runs with, separate from the
/// raw CLI struct so parsing and validation stay two distinct failure
/// points (§7: configuration errors are reported before the loop starts).
pub struct Config {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub timeout: std::time::Duration,
    pub memory_limit_mb: u64,
    pub seed: Option<u64>,
    pub parallel_main: Option<String>,
    pub parallel_secondary: Option<String>,
    pub power_schedule: PowerSchedule,
    pub scheduler_policy: SchedulerPolicy,
    pub dictionary_path: Option<PathBuf>,
    pub target_argv: Vec<String>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        validate_input_dir(&cli.input_dir)?;
        validate_target_binary(Path::new(&cli.target_argv[0]))?;

        let power_schedule: PowerSchedule = cli
            .power_schedule
            .parse()
            .map_err(|e| FuzzError::Config(format!("invalid power schedule: {e}")))?;

        let scheduler_policy: SchedulerPolicy = cli
            .scheduler_policy
            .parse()
            .map_err(|e| FuzzError::Config(format!("invalid scheduler policy: {e}")))?;

        if let Some(path) = &cli.dictionary {
            if !path.is_file() {
                return Err(FuzzError::Config(format!(
                    "dictionary file {path:?} does not exist"
                )));
            }
        }

        Ok(Self {
            input_dir: cli.input_dir,
            output_dir: cli.output_dir,
            timeout: std::time::Duration::from_millis(cli.timeout_ms),
            memory_limit_mb: cli.memory_limit_mb,
            seed: cli.seed,
            parallel_main: cli.main_instance,
            parallel_secondary: cli.secondary_instance,
            power_schedule,
            scheduler_policy,
            dictionary_path: cli.dictionary,
            target_argv: cli.target_argv,
        })
    }
}

fn validate_input_dir(dir: &Path) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| FuzzError::Config(format!("input dir {dir:?}: {e}")))?;
    let has_file = entries
        .filter_map(|e| e.ok())
        .any(|e| e.path().is_file());
    if !has_file {
        return Err(FuzzError::Config(format!(
            "input dir {dir:?} contains no seed files"
        )));
    }
    Ok(())
}

/// Marker file written into a completed output directory; its presence
/// (with an incompatible banner) blocks overwriting unresumed state.
pub const FUZZER_STATS_BANNER: &str = "# greyfuzz fuzzer_stats";

/// Creates `<out>/queue`, `<out>/queue/.state`, `<out>/crashes`,
/// `<out>/hangs` if absent, and writes `crashes/README.txt` once. Refuses to
/// run on a non-empty, non-fuzzer output directory unless `resume` is set.
pub fn setup_output_dir(out: &Path, resume: bool) -> Result<()> {
    let stats_path = out.join("fuzzer_stats");
    if out.exists() && !resume {
        let has_entries = std::fs::read_dir(out)
            .map_err(|e| FuzzError::io(out, e))?
            .next()
            .is_some();
        if has_entries && !stats_path.exists() {
            return Err(FuzzError::Config(format!(
                "output dir {out:?} is non-empty and not a prior fuzzer output"
            )));
        }
    }

    for sub in ["queue", "queue/.state", "crashes", "hangs"] {
        std::fs::create_dir_all(out.join(sub)).map_err(|e| FuzzError::io(out.join(sub), e))?;
    }

    let readme = out.join("crashes").join("README.txt");
    if !readme.exists() {
        std::fs::write(
            &readme,
            "Crashes found by this fuzzer session are stored in this directory as\nid:NNNNNN,sig:SS,<op> files.\n",
        )
        .map_err(|e| FuzzError::io(readme, e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn setup_output_dir_creates_expected_tree() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        setup_output_dir(&out, false).unwrap();
        assert!(out.join("queue").is_dir());
        assert!(out.join("queue/.state").is_dir());
        assert!(out.join("crashes").is_dir());
        assert!(out.join("hangs").is_dir());
        assert!(out.join("crashes/README.txt").is_file());
    }

    #[test]
    fn setup_output_dir_refuses_foreign_nonempty_dir() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("unrelated.txt"), "hi").unwrap();
        let err = setup_output_dir(&out, false).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn setup_output_dir_allows_resume_on_nonempty_dir() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("unrelated.txt"), "hi").unwrap();
        setup_output_dir(&out, true).unwrap();
        assert!(out.join("queue").is_dir());
    }

    #[test]
    fn validate_input_dir_rejects_empty_directory() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("seeds");
        std::fs::create_dir_all(&empty).unwrap();
        let err = validate_input_dir(&empty).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
