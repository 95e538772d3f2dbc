//! Background statistics reporter.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::{StatsSnapshot, Statistics};

/// Command run periodically to sweep temporary files left by tools.
#[derive(Debug, Clone)]
pub struct CleanupCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub interval: Duration,
    /// Rewritten with the verbose breakdown on every tick.
    pub stat_log_file: Option<PathBuf>,
    /// Print the rolling line to stdout.
    pub print_line: bool,
    pub cleanup: Option<CleanupCommand>,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            stat_log_file: None,
            print_line: true,
            cleanup: None,
        }
    }
}

/// Handle to the reporter thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct StatsReporter {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Statistics>,
    active: Arc<AtomicUsize>,
    config: ReporterConfig,
}

impl StatsReporter {
    /// Spawn the reporter. `active` is the live worker count.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn(
        stats: Arc<Statistics>,
        active: Arc<AtomicUsize>,
        config: ReporterConfig,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let thread_stats = Arc::clone(&stats);
        let thread_active = Arc::clone(&active);
        let thread_config = config.clone();
        let handle = std::thread::Builder::new()
            .name("ccdiff-stats".to_owned())
            .spawn(move || {
                let mut prev_len = 0usize;
                let mut last_cleanup = Instant::now();
                loop {
                    let snapshot = thread_stats.snapshot();
                    prev_len = emit(
                        &snapshot,
                        thread_active.load(Ordering::Relaxed),
                        prev_len,
                        &thread_config,
                    );
                    if let Some(cleanup) = &thread_config.cleanup {
                        if last_cleanup.elapsed() >= cleanup.interval {
                            run_cleanup(cleanup);
                            last_cleanup = Instant::now();
                        }
                    }
                    match stop_rx.recv_timeout(thread_config.interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
            stats,
            active,
            config,
        })
    }

    /// Stop the thread and emit the final verbose snapshot.
    pub fn stop(mut self) -> StatsSnapshot {
        self.shutdown();
        let snapshot = self.stats.snapshot();
        emit(
            &snapshot,
            self.active.load(Ordering::Relaxed),
            0,
            &self.config,
        );
        if self.config.print_line {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out);
            let _ = write!(out, "{}", snapshot.render_verbose());
            let _ = out.flush();
        }
        info!(
            seeds = snapshot.generator.total,
            cpu_secs = snapshot.cpu_time().as_secs(),
            "statistics reporter stopped"
        );
        snapshot
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop_tx.try_send(());
            if handle.join().is_err() {
                warn!("statistics reporter thread panicked");
            }
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Render one tick. Returns the printed line length for padding.
fn emit(snapshot: &StatsSnapshot, active: usize, prev_len: usize, config: &ReporterConfig) -> usize {
    let mut line = snapshot.render_line(active);
    let len = line.len();
    if len < prev_len {
        line.push_str(&" ".repeat(prev_len - len));
    }
    if config.print_line {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r{line}");
        let _ = out.flush();
    }
    if let Some(path) = &config.stat_log_file {
        if let Err(err) = std::fs::write(path, snapshot.render_verbose()) {
            warn!(path = %path.display(), error = %err, "failed to write stat log");
        }
    }
    len
}

fn run_cleanup(cleanup: &CleanupCommand) {
    debug!(program = %cleanup.program.display(), "running temporary file cleanup");
    match Command::new(&cleanup.program)
        .args(&cleanup.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if !status.success() => {
            warn!(program = %cleanup.program.display(), %status, "cleanup command failed");
        }
        Ok(_) => {}
        Err(err) => {
            warn!(program = %cleanup.program.display(), error = %err, "cannot run cleanup command");
        }
    }
}
