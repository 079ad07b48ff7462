//! Pseudo-terminal plumbing for host-side interactive sessions.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::process::Stdio;

use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::termios::Termios;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::warn;

use crate::error::ExecutorError;
use crate::executor::TtySession;
use crate::executor::shell::READER_GRACE;

pub(crate) struct Pty {
    pub master: File,
    slave: OwnedFd,
}

impl Pty {
    pub fn open() -> std::io::Result<Self> {
        let OpenptyResult { master, slave } = openpty(None::<&Winsize>, None::<&Termios>).map_err(std::io::Error::from)?;
        Ok(Self {
            master: File::from(master),
            slave,
        })
    }

    /// Wires the slave side as stdio of `command` and makes it the controlling terminal.
    pub fn attach(self, command: &mut Command) -> std::io::Result<File> {
        command
            .stdin(Stdio::from(self.slave.try_clone()?))
            .stdout(Stdio::from(self.slave.try_clone()?))
            .stderr(Stdio::from(self.slave));
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(self.master)
    }
}

/// Runs `command` under a fresh PTY and bridges it to `session` until either side ends.
///
/// `preamble` is written before the session is reported as started.
pub(crate) async fn run_session(mut command: Command, mut session: TtySession, preamble: Option<&str>) -> Result<(), ExecutorError> {
    let master = Pty::open()?.attach(&mut command)?;
    let mut child = command
        .spawn()
        .map_err(|error| ExecutorError::backend(format!("failed to start tty process: {error}")))?;
    // the parent's copies of the slave side must close so reads see EOF
    drop(command);

    let mut reader = tokio::fs::File::from_std(master.try_clone()?);
    let mut writer = tokio::fs::File::from_std(master);
    if let Some(preamble) = preamble {
        writer.write_all(preamble.as_bytes()).await?;
        writer.flush().await?;
    }
    session.started();

    let output = session.output_sender();
    let pump = tokio::spawn(async move {
        let mut buffer = [0u8; 4096];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if !output.send(&buffer[..read]).await {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            line = session.input.recv() => {
                let Some(line) = line else { break };
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            _ = child.wait() => break,
            _ = session.token.cancelled() => break,
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    let abort = pump.abort_handle();
    if tokio::time::timeout(READER_GRACE, pump).await.is_err() {
        warn!("tty output pump did not finish");
        abort.abort();
    }
    Ok(())
}
