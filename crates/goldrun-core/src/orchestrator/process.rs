use crate::domain::{HarnessError, HarnessResult};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the child was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

/// Runs an external program to completion with its output captured.
pub trait ProcessRunner {
    fn run(&self, command: &CommandSpec) -> HarnessResult<ProcessOutput>;
}

impl<T: ProcessRunner + ?Sized> ProcessRunner for &T {
    fn run(&self, command: &CommandSpec) -> HarnessResult<ProcessOutput> {
        (**self).run(command)
    }
}

#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    poll_interval: Duration,
    /// How long output readers may keep running once the child has exited.
    drain_grace: Duration,
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            drain_grace: Duration::from_secs(2),
        }
    }
}

impl SystemProcessRunner {
    pub fn new(poll_interval: Duration, drain_grace: Duration) -> Self {
        Self {
            poll_interval,
            drain_grace,
        }
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, command: &CommandSpec) -> HarnessResult<ProcessOutput> {
        tracing::debug!(command = %command.display_line(), cwd = %command.current_dir.display(), "spawning process");
        let start = Instant::now();
        let mut builder = Command::new(&command.program);
        builder
            .args(&command.args)
            .current_dir(&command.current_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut builder);
        let mut child = builder.spawn().map_err(|source| HarnessError::ProcessSpawn {
            program: command.program.clone(),
            source,
        })?;

        // Drained on their own threads so a chatty child never blocks on a full pipe.
        let (done, finished) = mpsc::channel();
        let stdout = child.stdout.take().map(|stdout| spawn_reader(stdout, done.clone()));
        let stderr = child.stderr.take().map(|stderr| spawn_reader(stderr, done.clone()));
        drop(done);

        let mut timed_out = false;
        let status = loop {
            let polled = match child.try_wait() {
                Ok(polled) => polled,
                Err(source) => {
                    terminate(&mut child, &command.program);
                    let _ = child.wait();
                    return Err(HarnessError::io(
                        "failed to poll child process",
                        &command.program,
                        source,
                    ));
                }
            };
            if let Some(status) = polled {
                break Some(status);
            }
            if command
                .timeout
                .is_some_and(|timeout| start.elapsed() >= timeout)
            {
                timed_out = true;
                terminate(&mut child, &command.program);
                break child.wait().ok();
            }
            thread::sleep(self.poll_interval);
        };

        let readers = usize::from(stdout.is_some()) + usize::from(stderr.is_some());
        wait_for_readers(&finished, readers, self.drain_grace);
        Ok(ProcessOutput {
            status: status.and_then(|status| status.code()),
            stdout: captured(stdout.as_ref()),
            stderr: captured(stderr.as_ref()),
            duration: start.elapsed(),
            timed_out,
        })
    }
}

type Capture = Arc<Mutex<Vec<u8>>>;

fn spawn_reader(mut reader: impl Read + Send + 'static, done: Sender<()>) -> Capture {
    let capture = Capture::default();
    let sink = Arc::clone(&capture);
    thread::spawn(move || {
        let mut chunk = [0_u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    tracing::warn!(%error, "failed to drain child output");
                    break;
                }
            }
        }
        let _ = done.send(());
    });
    capture
}

/// Waits at most `grace` for the readers to hit end of stream. A descendant that
/// outlives the child can hold a pipe open indefinitely; its reader is abandoned.
fn wait_for_readers(finished: &Receiver<()>, readers: usize, grace: Duration) {
    let deadline = Instant::now() + grace;
    for _ in 0..readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if finished.recv_timeout(remaining).is_err() {
            tracing::warn!("child output still open after exit; keeping what was read");
            return;
        }
    }
}

fn captured(capture: Option<&Capture>) -> String {
    capture
        .map(|capture| {
            String::from_utf8_lossy(&capture.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
        })
        .unwrap_or_default()
}

/// The child leads its own process group so a kill reaches wrapper-launched descendants.
#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

fn terminate(child: &mut Child, program: &Path) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => return,
                Err(error) => {
                    tracing::debug!(program = %program.display(), %error, "process group kill failed");
                }
            }
        }
    }
    if let Err(error) = child.kill() {
        tracing::warn!(program = %program.display(), %error, "failed to kill process");
    }
}

/// Last `lines` lines of `text`, for error payloads.
pub fn tail_lines(text: &str, lines: usize) -> String {
    let collected = text.lines().collect::<Vec<_>>();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}
