use multiboot_core::{CommandError, CommandOutput, CommandRequest};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const SUDO: &str = "/usr/bin/sudo";

/// Runs one external tool to completion. A non-zero exit is an error.
pub trait CommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        (**self).run(request)
    }
}

/// Runs each tool in its own process group, so a Ctrl-C aimed at the CLI
/// never reaches a half-finished `createinstallmedia`, and a timeout can
/// take down everything the tool spawned.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL once a command has timed out.
    kill_grace: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// SIGTERM first, which sudo relays to its root child, then SIGKILL.
    /// Returns once the whole group is gone, or after a second grace period
    /// if something in it cannot be killed from here.
    #[cfg(unix)]
    fn terminate(&self, child: &mut Child, rendered: &str) {
        let pgid = child.id() as libc::pid_t;
        signal_group(pgid, libc::SIGTERM, rendered);

        let escalate_at = Instant::now() + self.kill_grace;
        let give_up_at = escalate_at + self.kill_grace;
        let mut killed = false;
        let mut leader_reaped = false;
        loop {
            if !leader_reaped {
                leader_reaped = matches!(child.try_wait(), Ok(Some(_)));
            }
            if leader_reaped && !group_alive(pgid) {
                return;
            }
            let now = Instant::now();
            if !killed && now >= escalate_at {
                warn!(command = %rendered, pgid, "process group ignored SIGTERM; sending SIGKILL");
                signal_group(pgid, libc::SIGKILL, rendered);
                if !leader_reaped {
                    if let Err(err) = child.kill() {
                        warn!(command = %rendered, error = %err, "could not kill command");
                    }
                }
                killed = true;
            }
            if killed && now >= give_up_at {
                warn!(command = %rendered, pgid, "process group still running after SIGKILL");
                return;
            }
            thread::sleep(self.poll_interval);
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, child: &mut Child, rendered: &str) {
        if let Err(err) = child.kill() {
            warn!(command = %rendered, error = %err, "could not kill command");
        }
        if let Err(err) = child.wait() {
            warn!(command = %rendered, error = %err, "could not reap command");
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int, rendered: &str) {
    // SAFETY: killpg has no memory effects.
    if unsafe { libc::killpg(pgid, signal) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(command = %rendered, pgid, signal, error = %err, "could not signal process group");
        }
    }
}

/// EPERM still means a member exists, typically the root child of sudo.
#[cfg(unix)]
fn group_alive(pgid: libc::pid_t) -> bool {
    // SAFETY: signal 0 only checks for existence.
    if unsafe { libc::killpg(pgid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Program and argv actually executed. Privileged requests go through
/// non-interactive sudo unless we already are root.
pub fn command_line(request: &CommandRequest, as_root: bool) -> (String, Vec<String>) {
    if request.privileged && !as_root {
        let mut args = vec!["-n".to_string(), request.program.clone()];
        args.extend(request.args.iter().cloned());
        (SUDO.to_string(), args)
    } else {
        (request.program.clone(), request.args.clone())
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn drain<R: Read + Send + 'static>(mut pipe: R, buffer: SharedBuffer) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn snapshot(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

impl CommandRunner for SystemRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let (program, args) = command_line(request, is_root());
        debug!(command = %request.rendered(), privileged = request.privileged, "running");

        let started = Instant::now();
        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: request.program.clone(),
                source,
            })?;

        let stdout: SharedBuffer = Arc::default();
        let stderr: SharedBuffer = Arc::default();
        let mut readers = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            readers.push(drain(pipe, Arc::clone(&stdout)));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(drain(pipe, Arc::clone(&stderr)));
        }

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= request.timeout => {
                    let rendered = request.rendered();
                    warn!(command = %rendered, timeout = ?request.timeout, "command timed out");
                    self.terminate(&mut child, &rendered);
                    let mut partial_output = snapshot(&stdout);
                    partial_output.push_str(&snapshot(&stderr));
                    return Err(CommandError::TimedOut {
                        program: request.program.clone(),
                        timeout: request.timeout,
                        partial_output,
                    });
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(source) => {
                    return Err(CommandError::Spawn {
                        program: request.program.clone(),
                        source,
                    })
                }
            }
        };
        for reader in readers {
            let _ = reader.join();
        }

        let output = CommandOutput {
            program: request.program.clone(),
            args: request.args.clone(),
            status: status.code().unwrap_or(-1),
            stdout: snapshot(&stdout),
            stderr: snapshot(&stderr),
            duration: started.elapsed(),
        };
        debug!(
            program = %output.program,
            status = output.status,
            duration_ms = output.duration.as_millis() as u64,
            "command finished"
        );
        if status.success() {
            Ok(output)
        } else {
            Err(CommandError::failed(output))
        }
    }
}
