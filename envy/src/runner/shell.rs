use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{Span, debug, debug_span, warn};

use crate::core::errors::EnvyError;
use crate::script::ShellKind;
use crate::shutdown;

use super::{RunOutput, RunRequest, ShellRunner};

/// How often the child is polled for exit and the shutdown flag observed.
const WAIT_TICK: Duration = Duration::from_millis(25);
/// Polls granted per signal before escalating (roughly one second).
const GRACE_TICKS: u32 = 40;

/// Shell runner backed by the system shell via [`std::process::Command`].
///
/// Non-interactive runs pipe both streams and forward them line-by-line to
/// the log; interactive runs inherit the parent's stdio. The wait is a
/// cancellation point: on process-wide shutdown the child is sent SIGINT,
/// then SIGTERM, each with a short grace window, and abandoned if it
/// survives both.
#[derive(Debug, Default)]
pub struct SystemShell;

impl ShellRunner for SystemShell {
    #[tracing::instrument(level = "trace", skip_all, fields(cwd = %request.cwd))]
    fn run(&self, request: &RunRequest) -> Result<RunOutput> {
        let mut cmd = match request.shell {
            ShellKind::Posix => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c");
                cmd
            }
            ShellKind::Bash => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c");
                cmd
            }
        };
        cmd.arg(&request.script);
        cmd.current_dir(&request.cwd);
        cmd.envs(&request.env);

        let cmd_str = shell_words::join(
            std::iter::once(cmd.get_program())
                .chain(cmd.get_args())
                .map(std::ffi::OsStr::to_string_lossy),
        );
        debug!("running {cmd_str}");

        if request.interactive {
            let mut proc = cmd
                .spawn()
                .with_context(|| anyhow!("could not execute process: {cmd_str}"))?;
            let status = wait_with_cancel(&mut proc, &cmd_str)?;
            return Ok(RunOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: None,
            });
        }

        let mut proc = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| anyhow!("could not execute process: {cmd_str}"))?;

        let quiet = request.quiet;
        let capture = request.capture;

        let stdout = proc.stdout.take().expect("we asked Rust to pipe stdout");
        let out_thread = thread::spawn({
            let span = debug_span!("out");
            move || {
                let mut collected = capture.then(String::new);
                pipe(&span, stdout, |line| {
                    if !quiet {
                        debug!("{line}");
                    }
                    if let Some(buf) = collected.as_mut() {
                        buf.push_str(line);
                        buf.push('\n');
                    }
                });
                collected
            }
        });

        let stderr = proc.stderr.take().expect("we asked Rust to pipe stderr");
        let err_thread = thread::spawn({
            let span = debug_span!("err");
            move || {
                pipe(&span, stderr, |line| {
                    if !quiet {
                        debug!("{line}");
                    }
                });
            }
        });

        // On cancellation the reader threads are abandoned with the child;
        // they exit on their own once its pipes close.
        let status = wait_with_cancel(&mut proc, &cmd_str)?;

        let stdout = out_thread.join().expect("stdout reader thread panicked");
        let _ = err_thread.join();

        Ok(RunOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
        })
    }
}

/// Waits for the child while polling the shutdown flag.
///
/// On shutdown the child gets SIGINT, then SIGTERM, each with a grace window
/// of [`GRACE_TICKS`]; a child surviving both is abandoned. Always returns
/// `Cancelled` once shutdown was observed, whether or not the child died.
fn wait_with_cancel(proc: &mut Child, cmd_str: &str) -> Result<ExitStatus> {
    loop {
        if let Some(status) = try_wait(proc, cmd_str)? {
            return Ok(status);
        }
        if shutdown::is_requested() {
            break;
        }
        thread::sleep(WAIT_TICK);
    }

    debug!("cancelling {cmd_str}");
    for deliver in [interrupt, terminate] {
        deliver(proc);
        for _ in 0..GRACE_TICKS {
            if try_wait(proc, cmd_str)?.is_some() {
                return Err(EnvyError::Cancelled.into());
            }
            thread::sleep(WAIT_TICK);
        }
    }
    warn!("process unresponsive to signals, abandoning: {cmd_str}");
    Err(EnvyError::Cancelled.into())
}

fn try_wait(proc: &mut Child, cmd_str: &str) -> Result<Option<ExitStatus>> {
    proc.try_wait()
        .with_context(|| anyhow!("could not wait for process termination: {cmd_str}"))
}

fn interrupt(proc: &mut Child) {
    #[cfg(unix)]
    unsafe {
        libc::kill(proc.id() as libc::pid_t, libc::SIGINT);
    }
    #[cfg(not(unix))]
    {
        let _ = proc.kill();
    }
}

fn terminate(proc: &mut Child) {
    #[cfg(unix)]
    unsafe {
        libc::kill(proc.id() as libc::pid_t, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = proc.kill();
    }
}

fn pipe(span: &Span, stream: impl Read, mut callback: impl FnMut(&str)) {
    let _enter = span.enter();
    let stream = BufReader::with_capacity(128, stream);
    for line in stream.lines() {
        match line {
            Ok(line) => callback(line.as_str()),
            Err(err) => warn!("{err:?}"),
        }
    }
}
