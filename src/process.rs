use crate::{EngineError, Result};
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const OUTPUT_POLL_INTERVAL_MS: u64 = 200;
const CHUNK_BUFFER_BYTES: usize = 8192;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// How process output is cut into lines before it reaches the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Read newline-terminated lines.
    Lines,
    /// Read raw buffers and split on `\n` and `\r` ourselves.
    Chunks,
}

/// Shared flag that kills running children when raised. Once raised it stays
/// raised, so every later run on the same flag fails fast as well.
///
/// The engine never raises it itself; whoever builds the
/// [`SystemProcessRunner`] keeps a clone and raises it to abort downloads
/// (the runner binary does so when a `--once` pass exceeds its timeout).
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Spawns an external command and streams its combined stdout/stderr.
pub trait ProcessRunner: Send + Sync {
    /// Runs `program args...` in `working_dir`, handing every output line to
    /// `on_line` as it arrives, and returns the exit code.
    fn run(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        mode: OutputMode,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32>;

    fn run_captured(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<CapturedOutput> {
        let mut lines = Vec::new();
        let exit_code = self.run(program, args, working_dir, OutputMode::Lines, &mut |line| {
            lines.push(line.to_string())
        })?;
        Ok(CapturedOutput { exit_code, lines })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemProcessRunner {
    interrupt: Interrupt,
}

impl SystemProcessRunner {
    pub fn new(interrupt: Interrupt) -> Self {
        Self { interrupt }
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        mode: OutputMode,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let tool = program.to_string_lossy().to_string();
        if self.interrupt.is_raised() {
            return Err(EngineError::Interrupted(tool));
        }

        let mut cmd = command(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::ExternalToolMissing { tool: tool.clone() }
            } else {
                EngineError::Io(e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr pipe missing"))?;

        let (tx, rx) = mpsc::channel::<String>();
        let readers = [
            spawn_reader(stdout, mode, tx.clone()),
            spawn_reader(stderr, mode, tx),
        ];

        loop {
            if self.interrupt.is_raised() {
                // Readers are left detached: a grandchild such as ffmpeg may
                // keep the pipes open after the child is gone.
                kill_child(&mut child);
                return Err(EngineError::Interrupted(tool));
            }
            match rx.recv_timeout(Duration::from_millis(OUTPUT_POLL_INTERVAL_MS)) {
                Ok(line) => on_line(&line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        join_readers(readers);
        let status = child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn kill_child(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

fn join_readers(readers: [JoinHandle<()>; 2]) {
    for handle in readers {
        let _ = handle.join();
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    mode: OutputMode,
    tx: Sender<String>,
) -> JoinHandle<()> {
    thread::spawn(move || match mode {
        OutputMode::Lines => read_lines(reader, &tx),
        OutputMode::Chunks => read_chunks(reader, &tx),
    })
}

fn read_lines<R: Read>(reader: R, tx: &Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
        }
    }
}

fn read_chunks<R: Read>(mut reader: R, tx: &Sender<String>) {
    let mut splitter = LineSplitter::default();
    let mut buf = [0_u8; CHUNK_BUFFER_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(rest) = splitter.finish() {
        let _ = tx.send(rest);
    }
}

/// Cuts a byte stream into lines on `\n`, `\r` or `\r\n`, holding back a
/// partial trailing line until more bytes arrive.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if !self.pending.is_empty() {
                    out.push(String::from_utf8_lossy(&self.pending).to_string());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        out
    }

    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_carriage_returns_and_partial_lines() {
        let mut splitter = LineSplitter::default();
        assert_eq!(
            splitter.push(b"[download]  1.0%\r[download]  2.0%\r[dow"),
            vec!["[download]  1.0%".to_string(), "[download]  2.0%".to_string()]
        );
        assert_eq!(
            splitter.push(b"nload] Destination: a.mp4\r\nlast"),
            vec!["[download] Destination: a.mp4".to_string()]
        );
        assert_eq!(splitter.finish().as_deref(), Some("last"));
    }

    #[test]
    fn splitter_finish_is_empty_after_terminated_input() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push(b"one\n\ntwo\n").len(), 2);
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn interrupt_stays_raised() {
        let interrupt = Interrupt::new();
        let shared = interrupt.clone();
        assert!(!shared.is_raised());
        interrupt.raise();
        assert!(shared.is_raised());
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_streams_stdout_and_stderr_and_reports_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = SystemProcessRunner::default();
        let args = vec![
            "-c".to_string(),
            "echo out-line; echo err-line 1>&2; pwd; exit 3".to_string(),
        ];
        let mut seen = Vec::new();
        let code = runner
            .run(Path::new("sh"), &args, dir.path(), OutputMode::Lines, &mut |l| {
                seen.push(l.to_string())
            })
            .expect("run");
        assert_eq!(code, 3);
        assert!(seen.contains(&"out-line".to_string()));
        assert!(seen.contains(&"err-line".to_string()));
        let cwd = std::fs::canonicalize(dir.path()).expect("canonicalize");
        assert!(seen
            .iter()
            .any(|l| std::fs::canonicalize(l).map(|p| p == cwd).unwrap_or(false)));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_chunk_mode_splits_carriage_returns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = SystemProcessRunner::default();
        let args = vec!["-c".to_string(), r"printf 'a\rb\nc'".to_string()];
        let mut seen = Vec::new();
        let code = runner
            .run(Path::new("sh"), &args, dir.path(), OutputMode::Chunks, &mut |l| {
                seen.push(l.to_string())
            })
            .expect("run");
        assert_eq!(code, 0);
        assert_eq!(seen, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn missing_binary_is_reported_as_missing_tool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = SystemProcessRunner::default();
        let err = runner
            .run(
                Path::new("definitely-not-a-real-binary-ytdl-engine"),
                &[],
                dir.path(),
                OutputMode::Lines,
                &mut |_| {},
            )
            .expect_err("should fail");
        assert!(matches!(err, EngineError::ExternalToolMissing { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn raising_interrupt_kills_a_running_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let interrupt = Interrupt::new();
        let runner = SystemProcessRunner::new(interrupt.clone());
        let args = vec!["-c".to_string(), "echo started; sleep 30 & wait".to_string()];
        let started = std::time::Instant::now();
        let err = runner
            .run(Path::new("sh"), &args, dir.path(), OutputMode::Lines, &mut |line| {
                if line == "started" {
                    interrupt.raise();
                }
            })
            .expect_err("interrupted");
        assert!(matches!(err, EngineError::Interrupted(_)));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn raised_interrupt_fails_before_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let interrupt = Interrupt::new();
        interrupt.raise();
        let runner = SystemProcessRunner::new(interrupt);
        let err = runner
            .run(Path::new("sh"), &[], dir.path(), OutputMode::Lines, &mut |_| {})
            .expect_err("interrupted");
        assert!(matches!(err, EngineError::Interrupted(_)));
    }
}
