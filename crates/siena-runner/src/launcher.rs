use crate::command::CommandLine;
use crate::error::GearError;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long output readers may keep going once the process group is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// What a finished (or abandoned) child left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the child was killed by a signal or by the timeout.
    pub code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }
}

/// Runs one command line to completion.
pub trait ProcessLauncher {
    fn launch(
        &self,
        command: &CommandLine,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, GearError>;
}

impl<L: ProcessLauncher + ?Sized> ProcessLauncher for &L {
    fn launch(
        &self,
        command: &CommandLine,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, GearError> {
        (**self).launch(command, timeout)
    }
}

/// Spawns the command as a real child process.
///
/// Both output streams are drained on their own threads and relayed to the log
/// line by line while being captured in full. On unix the child leads a new
/// process group, and a timeout kills that whole group.
#[derive(Debug, Clone, Default)]
pub struct SystemLauncher {
    working_dir: Option<PathBuf>,
}

impl SystemLauncher {
    /// Start children in `dir` instead of the caller's working directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

impl ProcessLauncher for SystemLauncher {
    fn launch(
        &self,
        command: &CommandLine,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, GearError> {
        let mut cmd = Command::new(command.program());
        cmd.args(command.args());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| GearError::Launch {
            program: command.program().to_string(),
            source,
        })?;
        let stdout = child.stdout.take().map(|s| Relay::start(s, "stdout"));
        let stderr = child.stderr.take().map(|s| Relay::start(s, "stderr"));

        let waited = wait_with_deadline(&mut child, timeout);
        let grace = match &waited {
            Ok((_, false)) => None,
            Ok((_, true)) => Some(DRAIN_GRACE),
            Err(e) => {
                tracing::error!(pid = child.id(), error = %e, "waiting for child failed");
                terminate(&mut child);
                Some(DRAIN_GRACE)
            }
        };
        let stdout = stdout.map(|r| r.finish(grace)).unwrap_or_default();
        let stderr = stderr.map(|r| r.finish(grace)).unwrap_or_default();

        let (code, timed_out) = waited?;
        Ok(ProcessOutput {
            code,
            timed_out,
            stdout,
            stderr,
        })
    }
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> io::Result<(Option<i32>, bool)> {
    let Some(limit) = timeout else {
        let status = child.wait()?;
        return Ok((status.code(), false));
    };
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status.code(), false));
        }
        if Instant::now() >= deadline {
            tracing::warn!(pid = child.id(), "deadline reached; killing process group");
            terminate(child);
            return Ok((None, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Kill the child together with everything it started, then reap it.
fn terminate(child: &mut Child) {
    match kill_group(child) {
        Ok(()) => {}
        Err(e) if already_gone(&e) => {
            tracing::debug!(pid = child.id(), "child exited before it could be killed");
        }
        Err(e) => tracing::warn!(pid = child.id(), error = %e, "failed to kill child"),
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = child.id(), error = %e, "failed to reap killed child");
    }
}

#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    // Spawned with process_group(0): the group id is the child's pid, and the
    // pid cannot be reused until the child is reaped.
    let pgid = child.id() as libc::pid_t;
    // Safety: killpg takes no pointers; an unknown group only yields ESRCH.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn already_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(not(unix))]
fn already_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput
}

/// One output stream being drained on its own thread.
struct Relay {
    name: &'static str,
    captured: Arc<Mutex<String>>,
    done: Receiver<()>,
}

impl Relay {
    fn start<R: Read + Send + 'static>(stream: R, name: &'static str) -> Self {
        let captured = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&captured);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        tracing::info!(target: "siena::tool", stream = name, "{}", strip_line_ending(&text));
                        if let Ok(mut buf) = sink.lock() {
                            buf.push_str(&text);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(stream = name, error = %e, "stopped reading tool output");
                        break;
                    }
                }
            }
            let _ = tx.send(());
        });
        Self {
            name,
            captured,
            done,
        }
    }

    /// Everything read so far. Waits for end of stream, for at most `grace`
    /// when one is given.
    fn finish(self, grace: Option<Duration>) -> String {
        let drained = match grace {
            None => self.done.recv().is_ok(),
            Some(limit) => self.done.recv_timeout(limit).is_ok(),
        };
        if !drained {
            tracing::warn!(stream = self.name, "tool output still open; keeping partial capture");
        }
        match self.captured.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Drop the `\n` or `\r\n` terminator and nothing else.
fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
