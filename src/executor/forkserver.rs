//! A forkserver-protocol [`Executor`](super::Executor) implementation.
//!
//! This talks the classic AFL forkserver handshake: the target is expected
//! to have been compiled with an instrumentation pass that, on startup,
//! writes a 4-byte hello on `FORKSRV_FD + 1` and then loops forking a fresh
//! child per run, each time reading a 4-byte "go" token from `FORKSRV_FD`
//! and reporting the child's pid and exit status back over the same pipe
//! pair. Building that instrumentation pass is explicitly out of scope
//! (§1 Non-goals); this module only speaks the protocol on the fuzzer side.
//!
//! Coverage is exchanged through a `MAP_SIZE`-byte SysV shared memory
//! segment the parent creates before the target's first invocation and
//! advertises via `__AFL_SHM_ID` as the numeric shm id an instrumented
//! target `shmget`/`shmat`s post-`exec` (an anonymous `mmap` would not
//! survive the target's `execve`, and a pointer value is meaningless across
//! address spaces regardless), mirroring `libaflstar`'s own forkserver
//! executor (`executor/forkserver.rs` in the teacher crate, which gets the
//! same cross-process segment from `libafl_bolts::ShMemProvider`), minus the
//! socket-input and request/response-recording extensions that crate adds
//! for stateful protocol targets.

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use super::{ExecOutcome, ExecResult, Executor};
use crate::error::FuzzError;

/// Matches the well-known fd AFL-instrumented binaries expect the control
/// pipe's read end to be duped onto.
pub const FORKSRV_FD: RawFd = 198;

/// How the target receives the current input.
#[derive(Debug, Clone)]
pub enum InputMode {
    /// Argv contains a literal `@@`, replaced with this path before each
    /// run.
    File(PathBuf),
    /// No `@@` in argv: the input is written to the child's stdin.
    Stdin,
}

struct SharedTrace {
    shm_id: i32,
    ptr: *mut u8,
    len: usize,
}

// Safety: the pointer is a SysV shared-memory attachment the parent owns
// exclusively for the lifetime of `ForkserverExecutor`; only the target
// child (a separate process, not a Rust-visible alias) writes through it.
unsafe impl Send for SharedTrace {}

impl SharedTrace {
    /// Creates a SysV shared-memory segment sized `len`, marks it for
    /// removal once every attached process (us and the forkserver children)
    /// detaches, and attaches it into our own address space. Mirrors AFL's
    /// own `forkserver.c` sequence: `shmget` → `shmctl(IPC_RMID)` →
    /// `shmat`, so the segment can't leak if the fuzzer is killed before
    /// `Drop` runs, while staying valid for every child that `shmat`s the
    /// same id before we exit.
    fn new(len: usize) -> Result<Self, FuzzError> {
        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            return Err(FuzzError::Executor(format!(
                "shmget of trace map failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        unsafe {
            libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut());
        }

        let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(FuzzError::Executor(format!(
                "shmat of trace map failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            shm_id,
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// The numeric id a freshly-`exec`'d target attaches with, exported via
    /// `__AFL_SHM_ID`.
    fn shm_id(&self) -> i32 {
        self.shm_id
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn clear(&mut self) {
        unsafe { std::ptr::write_bytes(self.ptr, 0, self.len) };
    }
}

impl Drop for SharedTrace {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.ptr as *const libc::c_void);
        }
    }
}

/// Owns the long-lived forkserver child and the pipes/shared memory used to
/// drive it.
pub struct ForkserverExecutor {
    map_size: usize,
    trace: SharedTrace,
    child: Child,
    ctl_write: std::fs::File,
    st_read: std::fs::File,
    input_mode: InputMode,
    consecutive_zero_maps: u32,
}

const NOBITS_THRESHOLD: u32 = 20;

impl ForkserverExecutor {
    /// Spawns the target and performs the startup handshake. `argv[0]` is
    /// the target binary; a literal `"@@"` element elsewhere in `argv`
    /// selects file-input mode.
    pub fn spawn(argv: Vec<String>, map_size: usize, cur_input_path: PathBuf) -> Result<Self, FuzzError> {
        let trace = SharedTrace::new(map_size)?;

        let input_mode = if argv.iter().any(|a| a == "@@") {
            InputMode::File(cur_input_path)
        } else {
            InputMode::Stdin
        };

        let (ctl_read, ctl_write) = pipe_pair()?;
        let (st_read, st_write) = pipe_pair()?;

        let rendered_argv = render_argv(&argv, &input_mode);
        let mut cmd = Command::new(&rendered_argv[0]);
        cmd.args(&rendered_argv[1..]);
        cmd.env("__AFL_SHM_ID", trace.shm_id().to_string());
        cmd.env("__AFL_SHM_SIZE", map_size.to_string());
        if matches!(input_mode, InputMode::Stdin) {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let ctl_read_fd = ctl_read.as_raw_fd();
        let st_write_fd = st_write.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(ctl_read_fd, FORKSRV_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(st_write_fd, FORKSRV_FD + 1) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| FuzzError::Executor(format!("failed to spawn target: {e}")))?;

        drop(ctl_read);
        drop(st_write);

        let mut exec = Self {
            map_size,
            trace,
            child,
            ctl_write,
            st_read,
            input_mode,
            consecutive_zero_maps: 0,
        };

        exec.handshake()?;
        Ok(exec)
    }

    fn handshake(&mut self) -> Result<(), FuzzError> {
        let mut hello = [0u8; 4];
        self.st_read
            .read_exact(&mut hello)
            .map_err(|e| FuzzError::Executor(format!("forkserver handshake failed: {e}")))?;
        Ok(())
    }

    fn write_input(&mut self, input: &[u8]) -> Result<(), FuzzError> {
        match &self.input_mode {
            InputMode::File(path) => {
                std::fs::write(path, input).map_err(|e| FuzzError::io(path.clone(), e))?;
            }
            InputMode::Stdin => {
                if let Some(stdin) = self.child.stdin.as_mut() {
                    let _ = stdin.write_all(input);
                }
            }
        }
        Ok(())
    }
}

impl Executor for ForkserverExecutor {
    fn map_size(&self) -> usize {
        self.map_size
    }

    fn run(&mut self, input: &[u8], timeout: Duration) -> Result<ExecResult, FuzzError> {
        self.trace.clear();
        self.write_input(input)?;

        self.ctl_write
            .write_all(&0u32.to_ne_bytes())
            .map_err(|e| FuzzError::Executor(format!("forkserver control write failed: {e}")))?;

        let mut pid_buf = [0u8; 4];
        self.st_read
            .read_exact(&mut pid_buf)
            .map_err(|e| FuzzError::Executor(format!("forkserver did not report a pid: {e}")))?;
        let child_pid = Pid::from_raw(i32::from_ne_bytes(pid_buf));

        let start = Instant::now();
        let timed_out = !wait_with_timeout(&self.st_read, timeout);

        let exec_us = start.elapsed().as_micros() as u64;

        let outcome = if timed_out {
            let _ = signal::kill(child_pid, Signal::SIGKILL);
            let _ = waitpid(child_pid, None);
            ExecOutcome::Timeout
        } else {
            let mut status_buf = [0u8; 4];
            self.st_read
                .read_exact(&mut status_buf)
                .map_err(|e| FuzzError::Executor(format!("forkserver status read failed: {e}")))?;
            let status = i32::from_ne_bytes(status_buf);
            classify_status(status)
        };

        let trace = self.trace.as_slice().to_vec();
        let outcome = if outcome == ExecOutcome::Normal && trace.iter().all(|&b| b == 0) {
            self.consecutive_zero_maps += 1;
            if self.consecutive_zero_maps >= NOBITS_THRESHOLD {
                ExecOutcome::NoBits
            } else {
                ExecOutcome::Normal
            }
        } else {
            self.consecutive_zero_maps = 0;
            outcome
        };

        Ok(ExecResult {
            outcome,
            trace,
            exec_us,
        })
    }
}

impl Drop for ForkserverExecutor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn classify_status(status: i32) -> ExecOutcome {
    if libc::WIFSIGNALED(status) {
        ExecOutcome::Crash(libc::WTERMSIG(status))
    } else {
        ExecOutcome::Normal
    }
}

/// Blocks on the status pipe becoming readable, bounded by `timeout`.
/// Returns `false` on timeout. This is the one suspension point in the
/// control loop (§5): the per-run timeout is enforced here, not with
/// SIGALRM, since `select` on the status pipe gives the same bound without
/// needing a process-wide interval timer.
fn wait_with_timeout(st_read: &std::fs::File, timeout: Duration) -> bool {
    use nix::sys::select::{select, FdSet};
    use nix::sys::time::{TimeVal, TimeValLike};

    let fd = st_read.as_raw_fd();
    let mut set = FdSet::new();
    set.insert(st_read);
    let mut tv = TimeVal::seconds(timeout.as_secs() as i64) + TimeVal::microseconds(timeout.subsec_micros() as i64);

    matches!(select(fd + 1, &mut set, None, None, &mut tv), Ok(n) if n > 0)
}

fn pipe_pair() -> Result<(std::fs::File, std::fs::File), FuzzError> {
    use std::os::unix::io::FromRawFd;
    let (read_fd, write_fd) =
        nix::unistd::pipe().map_err(|e| FuzzError::Executor(format!("pipe() failed: {e}")))?;
    Ok(unsafe {
        (
            std::fs::File::from_raw_fd(read_fd),
            std::fs::File::from_raw_fd(write_fd),
        )
    })
}

fn render_argv(argv: &[String], mode: &InputMode) -> Vec<String> {
    match mode {
        InputMode::File(path) => argv
            .iter()
            .map(|a| {
                if a == "@@" {
                    path.to_string_lossy().into_owned()
                } else {
                    a.clone()
                }
            })
            .collect(),
        InputMode::Stdin => argv.to_vec(),
    }
}

/// Checks that `path` names an executable regular file, the configuration
/// check run before the loop starts (§7 Configuration errors).
pub fn validate_target_binary(path: &Path) -> Result<(), FuzzError> {
    let meta =
        std::fs::metadata(path).map_err(|e| FuzzError::Config(format!("target binary {path:?}: {e}")))?;
    if !meta.is_file() {
        return Err(FuzzError::Config(format!(
            "target binary {path:?} is not a regular file"
        )));
    }
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(FuzzError::Config(format!(
            "target binary {path:?} is not executable"
        )));
    }
    let _ = CString::new(path.as_os_str().to_string_lossy().into_owned());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_argv_substitutes_at_at_marker() {
        let argv = vec!["target".to_string(), "@@".to_string()];
        let rendered = render_argv(&argv, &InputMode::File(PathBuf::from("/tmp/.cur_input")));
        assert_eq!(rendered[1], "/tmp/.cur_input");
    }

    #[test]
    fn render_argv_leaves_stdin_mode_untouched() {
        let argv = vec!["target".to_string(), "-x".to_string()];
        let rendered = render_argv(&argv, &InputMode::Stdin);
        assert_eq!(rendered, argv);
    }

    #[test]
    fn validate_target_binary_rejects_missing_file() {
        let err = validate_target_binary(Path::new("/nonexistent/binary")).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
