//! Principal launcher that prefers a real PTY and degrades to pipes, never to failure.

use crate::lock_or_recover;
use crate::log_debug;
use crossbeam_channel::{unbounded, Receiver, Sender};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize};
use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;
const WAIT_POLL_MS: u64 = 50;

/// Command the supervisor runs as the Principal.
#[derive(Debug, Clone)]
pub struct PrincipalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl PrincipalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
        }
    }
}

/// The Principal could not be spawned at all (distinct from PTY-unavailable,
/// which silently falls back to pipes).
#[derive(Debug, Error)]
#[error("failed to spawn principal `{command}`: {message}")]
pub struct SpawnError {
    pub command: String,
    pub message: String,
}

/// Running Principal child with its combined output reader.
///
/// The PTY path makes the child believe it is on an interactive terminal;
/// ANSI/color bytes reach the reader unmodified. When PTY allocation fails
/// (headless CI, restricted containers), output degrades to plain
/// stdout+stderr pipes and [`PtyExec::is_fallback`] reports true.
pub struct PtyExec {
    child: Mutex<Box<dyn Child + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    fallback: bool,
    command_line: String,
    child_pid: Option<u32>,
}

impl PtyExec {
    /// Launch the Principal, transparently falling back to pipes when the
    /// pseudo-terminal cannot be allocated.
    pub fn start(command: &PrincipalCommand) -> Result<Self, SpawnError> {
        match Self::start_pty(command) {
            Ok(exec) => Ok(exec),
            Err(reason) => {
                log_debug(&format!(
                    "PTY unavailable ({reason}); falling back to pipe capture"
                ));
                Self::start_pipes(command)
            }
        }
    }

    fn start_pty(command: &PrincipalCommand) -> Result<Self, String> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("openpty: {e}"))?;

        let mut builder = CommandBuilder::new(&command.program);
        builder.args(&command.args);
        builder.cwd(&command.cwd);

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| format!("spawn: {e}"))?;
        // Slave side must close in the parent so reads see EOF when the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| format!("clone reader: {e}"))?;
        let killer = child.clone_killer();
        let child_pid = child.process_id();

        Ok(Self {
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            reader: Mutex::new(Some(reader)),
            master: Mutex::new(Some(pair.master)),
            fallback: false,
            command_line: pseudo_console_command_line(&command.program, &command.args),
            child_pid,
        })
    }

    fn start_pipes(command: &PrincipalCommand) -> Result<Self, SpawnError> {
        let command_line = pseudo_console_command_line(&command.program, &command.args);
        let mut child = std::process::Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SpawnError {
                command: command_line.clone(),
                message: e.to_string(),
            })?;

        let (tx, rx) = unbounded::<Vec<u8>>();
        if let Some(stdout) = child.stdout.take() {
            spawn_pump_thread("kickoff-stdout-pump", stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_pump_thread("kickoff-stderr-pump", stderr, tx);
        }

        let child_pid = Some(child.id());
        let killer = ChildKiller::clone_killer(&child);
        Ok(Self {
            child: Mutex::new(Box::new(child)),
            killer: Mutex::new(killer),
            reader: Mutex::new(Some(Box::new(ChannelReader::new(rx)))),
            master: Mutex::new(None),
            fallback: true,
            command_line,
            child_pid,
        })
    }

    /// Take the combined output reader. Yields bytes as the child produces
    /// them; returns `None` once taken.
    pub fn take_output_reader(&self) -> Option<Box<dyn Read + Send>> {
        lock_or_recover(&self.reader, "pty_exec::take_output_reader").take()
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// The single-string command line recorded for the spawn, with
    /// pseudo-console quoting applied.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child_pid
    }

    /// Non-blocking exit probe.
    pub fn try_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        lock_or_recover(&self.child, "pty_exec::try_wait").try_wait()
    }

    /// Block until the child exits.
    pub fn wait(&self) -> std::io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(WAIT_POLL_MS));
        }
    }

    /// Wait for exit, giving up after `deadline`. Polls rather than blocking
    /// so [`PtyExec::kill`] stays callable from another thread.
    pub fn wait_with_deadline(&self, deadline: Duration) -> std::io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(WAIT_POLL_MS));
        }
    }

    /// Forcefully terminate the child and anything in its process group.
    pub fn kill(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            let _ = crate::process_signal::signal_process_group_or_pid(
                pid as i32,
                libc::SIGKILL,
                true,
            );
        }
        lock_or_recover(&self.killer, "pty_exec::kill").kill()
    }

    /// Release OS resources (PTY master, readers) regardless of wait status.
    pub fn close(&self) {
        lock_or_recover(&self.reader, "pty_exec::close").take();
        lock_or_recover(&self.master, "pty_exec::close").take();
    }
}

fn spawn_pump_thread<R: Read + Send + 'static>(name: &str, mut source: R, tx: Sender<Vec<u8>>) {
    let builder = thread::Builder::new().name(name.to_string());
    let spawned = builder.spawn(move || {
        let mut buffer = [0u8; 4096];
        loop {
            match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    break;
                }
            }
        }
    });
    if let Err(err) = spawned {
        log_debug(&format!("failed to spawn pipe pump thread: {err}"));
    }
}

/// Blocking reader over chunks produced by the pipe pump threads. Reports EOF
/// once both pumps have exited and the channel drains.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let available = &self.pending[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Join program and arguments into the single command-line string used by the
/// pseudo-console host: anything containing whitespace, a tab, or a double
/// quote is wrapped in double quotes with internal quotes escaped.
pub fn pseudo_console_command_line(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(quote_console_arg(program));
    for arg in args {
        parts.push(quote_console_arg(arg));
    }
    parts.join(" ")
}

fn quote_console_arg(arg: &str) -> String {
    let needs_quoting =
        arg.is_empty() || arg.contains(' ') || arg.contains('\t') || arg.contains('"');
    if !needs_quoting {
        return arg.to_string();
    }
    let escaped = arg.replace('"', "\\\"");
    format!("\"{escaped}\"")
}
