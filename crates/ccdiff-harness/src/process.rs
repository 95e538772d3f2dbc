//! External command execution with wall-clock and memory limits.
//!
//! Every child runs in its own process group so a timeout can take down the
//! whole tree a compiler driver or `make` spawned. CPU time is read from the
//! child's own resource usage when it is reaped, so concurrent workers do not
//! see each other's usage.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ccdiff_error::{CcdiffError, Result};
use tracing::{debug, warn};

/// Time between SIGTERM and SIGKILL for a timed-out process group.
const TERM_GRACE: Duration = Duration::from_secs(2);

const POLL_MIN: Duration = Duration::from_millis(2);
const POLL_MAX: Duration = Duration::from_millis(50);

// ── Command description ─────────────────────────────────────────────────

/// A fully expanded command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Shell-like rendering for logs. Environment overrides come first.
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Resource bounds for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunLimits {
    pub timeout: Option<Duration>,
    /// Address-space ceiling in KiB.
    pub memory_kib: Option<u64>,
}

impl RunLimits {
    pub const fn unlimited() -> Self {
        Self {
            timeout: None,
            memory_kib: None,
        }
    }

    pub const fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            memory_kib: None,
        }
    }
}

// ── Output ──────────────────────────────────────────────────────────────

/// Everything observed about a finished (or killed) command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub cpu_time: Duration,
    pub wall_time: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exit code for narratives: the signal number is reported negated.
    pub fn display_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => -sig,
            (None, None) => -1,
        }
    }
}

// ── Runner ──────────────────────────────────────────────────────────────

/// Run `spec` to completion or until `limits.timeout` elapses.
///
/// A nonzero exit or a timeout is a normal [`ProcessOutput`]. Output written
/// before a timeout is kept.
///
/// # Errors
///
/// [`CcdiffError::Spawn`] if the program cannot be started and
/// [`CcdiffError::ProcessFailure`] if waiting on it fails for any other
/// reason. In the latter case the process group has already been killed.
pub fn run(spec: &CommandSpec, limits: RunLimits) -> Result<ProcessOutput> {
    let rendered = spec.display();
    debug!(
        command = %rendered,
        cwd = ?spec.cwd,
        timeout_secs = limits.timeout.map(|t| t.as_secs()),
        memory_kib = limits.memory_kib,
        "running command"
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    if let Some(kib) = limits.memory_kib {
        let bytes = kib.saturating_mul(1024);
        // SAFETY: the closure only calls `setrlimit`, which is
        // async-signal-safe, and touches no memory shared with the parent.
        unsafe {
            cmd.pre_exec(move || {
                #[allow(clippy::useless_conversion)]
                let limit = libc::rlimit {
                    rlim_cur: bytes.try_into().unwrap_or(libc::RLIM_INFINITY),
                    rlim_max: bytes.try_into().unwrap_or(libc::RLIM_INFINITY),
                };
                if libc::setrlimit(libc::RLIMIT_AS, &raw const limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| CcdiffError::Spawn {
        command: rendered.clone(),
        source,
    })?;
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| CcdiffError::process(&rendered, "pid out of range"))?;

    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = limits.timeout.map(|t| started + t);
    let mut timed_out = false;
    let reaped = loop {
        match try_reap(pid) {
            Ok(Some(reaped)) => break reaped,
            Ok(None) => {}
            Err(err) => {
                signal_group(pid, libc::SIGKILL);
                let _ = reap_blocking(pid);
                return Err(CcdiffError::process(&rendered, err.to_string()));
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out = true;
            debug!(command = %rendered, "timeout expired, terminating process group");
            match terminate_group(pid) {
                Ok(reaped) => break reaped,
                Err(err) => return Err(CcdiffError::process(&rendered, err.to_string())),
            }
        }
        sleep_backoff(started);
    };

    // Stragglers left in the group would hold the pipes open.
    signal_group(pid, libc::SIGKILL);

    let stdout = join_reader(stdout_reader, &rendered);
    let stderr = join_reader(stderr_reader, &rendered);

    Ok(ProcessOutput {
        exit_code: reaped.exit_code,
        signal: reaped.signal,
        stdout,
        stderr,
        timed_out,
        cpu_time: reaped.cpu_time,
        wall_time: started.elapsed(),
    })
}

struct Reaped {
    exit_code: Option<i32>,
    signal: Option<i32>,
    cpu_time: Duration,
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn join_reader(reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>, command: &str) -> Vec<u8> {
    let Some(handle) = reader else {
        return Vec::new();
    };
    match handle.join() {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            warn!(command, error = %err, "failed to read child output");
            Vec::new()
        }
        Err(_) => {
            warn!(command, "output reader thread panicked");
            Vec::new()
        }
    }
}

fn sleep_backoff(started: Instant) {
    let elapsed = started.elapsed();
    let pause = if elapsed < Duration::from_millis(100) {
        POLL_MIN
    } else {
        POLL_MAX.min(elapsed / 20)
    };
    std::thread::sleep(pause);
}

/// Non-blocking reap of `pid` with its resource usage.
fn try_reap(pid: libc::pid_t) -> std::io::Result<Option<Reaped>> {
    wait_for(pid, libc::WNOHANG)
}

fn reap_blocking(pid: libc::pid_t) -> std::io::Result<Option<Reaped>> {
    wait_for(pid, 0)
}

fn wait_for(pid: libc::pid_t, flags: libc::c_int) -> std::io::Result<Option<Reaped>> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `rusage` is plain old data and fully written by `wait4`.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: both out-pointers are valid for the duration of the call.
        let rc = unsafe { libc::wait4(pid, &raw mut status, flags, &raw mut usage) };
        if rc == 0 {
            return Ok(None);
        }
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let (exit_code, signal) = if libc::WIFEXITED(status) {
            (Some(libc::WEXITSTATUS(status)), None)
        } else if libc::WIFSIGNALED(status) {
            (None, Some(libc::WTERMSIG(status)))
        } else {
            (None, None)
        };
        let cpu_time = timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime);
        return Ok(Some(Reaped {
            exit_code,
            signal,
            cpu_time,
        }));
    }
}

/// SIGTERM the group, give it [`TERM_GRACE`], then SIGKILL and reap.
fn terminate_group(pid: libc::pid_t) -> std::io::Result<Reaped> {
    signal_group(pid, libc::SIGTERM);
    let grace_end = Instant::now() + TERM_GRACE;
    while Instant::now() < grace_end {
        if let Some(reaped) = try_reap(pid)? {
            return Ok(reaped);
        }
        std::thread::sleep(POLL_MIN);
    }
    signal_group(pid, libc::SIGKILL);
    reap_blocking(pid)?.ok_or_else(|| std::io::Error::other("child vanished after SIGKILL"))
}

fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: `killpg` has no memory-safety preconditions. ESRCH (group
    // already gone) is expected and ignored.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

#[allow(clippy::cast_sign_loss)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}
