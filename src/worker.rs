// Worker process isolation. The scanner runs in its own OS process so
// native capture/match cost never touches the UI shell; the shell and
// worker speak JSON lines over the child's stdio:
//
//   shell → worker stdin:  one ScannerCommand per line
//   worker stdout → shell: one StatusEvent per line
//
// Closing the worker's stdin is the shutdown signal. The host-side
// supervisor respawns a dead worker with 1→2→4→8 s backoff and gives
// up (sticky) after the fault budget is exhausted, mirroring the
// scanner's own fault policy.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::scanner::{CancelToken, Scanner, ScannerCommand};
use crate::status::{status_channel, StatusEvent};

/// Argument that routes a shell binary into `worker_main`.
pub const WORKER_FLAG: &str = "--scanner-worker";

/// Worker exits within this grace period after stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Respawn backoff ladder (seconds), capped at the last entry.
const RESPAWN_BACKOFF_S: [u64; 4] = [1, 2, 4, 8];

/// Worker deaths within this window count toward the budget.
const RESPAWN_WINDOW: Duration = Duration::from_secs(60);
const RESPAWN_BUDGET: usize = 5;

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// Entry point for the worker process. Blocks until stdin closes or
/// the scanner cannot start. The caller's `main` should invoke this
/// when `WORKER_FLAG` is present and exit with its result.
pub fn worker_main(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let _log_guard = crate::logging::init(config.log_file.as_deref());

    let (status_tx, status_rx) = status_channel();
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<ScannerCommand>();
    let cancel = CancelToken::new();

    let mut scanner = Scanner::new(config, status_tx.clone())
        .context("scanner refused to start")?;

    let scanner_cancel = cancel.clone();
    let scanner_thread = std::thread::Builder::new()
        .name("scanner".into())
        .spawn(move || scanner.run(&cmd_rx, &scanner_cancel))
        .context("spawn scanner thread")?;

    // stdin reader: commands in, EOF = shutdown. The thread parks on a
    // blocking read; it dies with the process after main returns.
    let stdin_cancel = cancel.clone();
    std::thread::Builder::new()
        .name("worker-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ScannerCommand>(line) {
                    Ok(cmd) => {
                        if cmd_tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line, "unparseable command"),
                }
            }
            stdin_cancel.cancel();
        })
        .context("spawn stdin thread")?;

    info!("worker up, streaming status events");
    let mut stdout = std::io::stdout();
    while !cancel.is_cancelled() {
        if let Some(event) = status_rx.recv_timeout(Duration::from_millis(200)) {
            write_event(&mut stdout, &event)?;
        }
    }

    // Final drain so the shell sees terminal events.
    drop(status_tx);
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Some(event) = status_rx.try_recv() {
        write_event(&mut stdout, &event)?;
        if Instant::now() > deadline {
            break;
        }
    }

    let _ = scanner_thread.join();
    info!("worker shut down");
    Ok(())
}

fn write_event(out: &mut impl Write, event: &StatusEvent) -> Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// A running worker child with its event stream.
pub struct WorkerHandle {
    child: Child,
    stdin: std::process::ChildStdin,
    pub events: Receiver<StatusEvent>,
}

impl WorkerHandle {
    /// Spawn a worker reusing the current executable.
    pub fn spawn(config_path: &Path) -> Result<Self> {
        let exe = std::env::current_exe().context("current_exe")?;
        let mut child = Command::new(exe)
            .arg(WORKER_FLAG)
            .arg(config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .context("spawn worker process")?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let (event_tx, events): (Sender<StatusEvent>, Receiver<StatusEvent>) =
            crossbeam_channel::unbounded();
        std::thread::Builder::new()
            .name("worker-events".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    match serde_json::from_str::<StatusEvent>(&line) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, line, "unparseable status event"),
                    }
                }
            })
            .context("spawn event reader thread")?;

        Ok(Self {
            child,
            stdin,
            events,
        })
    }

    pub fn send(&mut self, cmd: ScannerCommand) -> Result<()> {
        serde_json::to_writer(&mut self.stdin, &cmd)?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close stdin (the shutdown signal) and wait briefly; kill if the
    /// worker does not exit.
    pub fn shutdown(mut self) {
        drop(self.stdin);
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50))
                }
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    return;
                }
            }
        }
    }
}

/// Keeps a worker alive: respawns on death with backoff, forwards its
/// events, and goes sticky-faulted when the respawn budget is
/// exhausted.
pub struct Supervisor {
    config_path: PathBuf,
    deaths: std::collections::VecDeque<Instant>,
}

impl Supervisor {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            deaths: std::collections::VecDeque::new(),
        }
    }

    /// Supervise until cancelled. Events from every worker incarnation
    /// are forwarded to `events_out`.
    pub fn run(&mut self, events_out: &Sender<StatusEvent>, cancel: &CancelToken) {
        let mut respawns = 0usize;

        while !cancel.is_cancelled() {
            let mut worker = match WorkerHandle::spawn(&self.config_path) {
                Ok(w) => w,
                Err(e) => {
                    error!(error = %e, "worker spawn failed");
                    if self.note_death() {
                        break;
                    }
                    respawns += 1;
                    cancel.sleep(backoff(respawns));
                    continue;
                }
            };
            let _ = worker.send(ScannerCommand::Start);
            info!("worker spawned");

            // Pump events while the child lives.
            loop {
                if cancel.is_cancelled() {
                    worker.shutdown();
                    return;
                }
                match worker.events.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => {
                        let _ = events_out.send(event);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if !worker.is_alive() {
                            break;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }

            warn!("worker exited");
            if self.note_death() {
                let _ = events_out.send(StatusEvent::Error {
                    error_kind: "worker_fault".into(),
                    detail: "respawn budget exhausted; user action required".into(),
                });
                break;
            }
            respawns += 1;
            cancel.sleep(backoff(respawns));
        }
    }

    /// Record a worker death; true when the budget is exhausted.
    fn note_death(&mut self) -> bool {
        let now = Instant::now();
        self.deaths.push_back(now);
        while let Some(&front) = self.deaths.front() {
            if now.duration_since(front) > RESPAWN_WINDOW {
                self.deaths.pop_front();
            } else {
                break;
            }
        }
        self.deaths.len() >= RESPAWN_BUDGET
    }
}

fn backoff(respawns: usize) -> Duration {
    let idx = respawns
        .saturating_sub(1)
        .min(RESPAWN_BACKOFF_S.len() - 1);
    Duration::from_secs(RESPAWN_BACKOFF_S[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_ladder_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(40), Duration::from_secs(8));
    }

    #[test]
    fn test_death_budget() {
        let mut sup = Supervisor::new(PathBuf::from("config.json"));
        for _ in 0..RESPAWN_BUDGET - 1 {
            assert!(!sup.note_death());
        }
        assert!(sup.note_death());
    }

    #[test]
    fn test_command_lines_round_trip() {
        for cmd in [
            ScannerCommand::Start,
            ScannerCommand::Stop,
            ScannerCommand::Pause,
            ScannerCommand::Resume,
        ] {
            let line = serde_json::to_string(&cmd).unwrap();
            let back: ScannerCommand = serde_json::from_str(&line).unwrap();
            assert_eq!(cmd, back);
        }
    }
}
