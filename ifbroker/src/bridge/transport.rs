//! Byte channel to the privileged helper process.
//!
//! The helper is spawned through a minimal-privilege launcher that execs the
//! real binary with elevated capability; its stdin/stdout are fully redirected
//! and form the only IPC path. The channel is exclusively owned by one worker.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command as ProcessCommand};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{CommandCodec, FrameCodec, InboundFrame};
use super::protocol::Command;

/// How long the helper gets between SIGTERM and SIGKILL on shutdown.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) type FrameReader = FramedRead<BoxedRead, FrameCodec>;
pub(crate) type CommandWriter = FramedWrite<BoxedWrite, CommandCodec>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn helper: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("helper {0} not captured")]
    Stdio(&'static str),
}

/// Extension point for different helper launch strategies.
///
/// Implementations must pipe stdin and stdout; those streams become the
/// byte channel.
pub trait HelperSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawner that goes through the restricted-privilege launcher executable,
/// which execs the real helper binary with elevated capability as needed.
pub struct LauncherSpawner {
    launcher: PathBuf,
    helper: PathBuf,
}

impl LauncherSpawner {
    pub fn new(launcher: impl Into<PathBuf>, helper: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
            helper: helper.into(),
        }
    }
}

impl HelperSpawner for LauncherSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        tracing::debug!(
            launcher = %self.launcher.display(),
            helper = %self.helper.display(),
            "spawning helper"
        );
        let child = ProcessCommand::new(&self.launcher)
            .arg(&self.helper)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Exclusive handle on the helper byte channel.
pub struct Channel {
    pub(crate) reader: FrameReader,
    pub(crate) writer: CommandWriter,
    pub(crate) child: Option<Child>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Spawn the helper and wire its stdio as the channel.
    pub fn open(spawner: &dyn HelperSpawner) -> Result<Self, SpawnError> {
        let mut child = spawner.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::Stdio("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Stdio("stdout"))?;
        Ok(Self::from_parts(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
        ))
    }

    /// Build a channel over arbitrary streams, with no child process
    /// attached. Used by tests and in-process fakes.
    pub fn from_stream(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::from_parts(Box::new(reader), Box::new(writer), None)
    }

    fn from_parts(reader: BoxedRead, writer: BoxedWrite, child: Option<Child>) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::new()),
            writer: FramedWrite::new(writer, CommandCodec::new()),
            child,
        }
    }

    /// Send one encoded command frame.
    pub async fn send(&mut self, command: Command) -> std::io::Result<()> {
        self.writer.send(command).await
    }

    /// Next framed packet; `None` when the helper closed its end.
    pub async fn next_frame(&mut self) -> Option<std::io::Result<InboundFrame>> {
        self.reader.next().await
    }
}

/// Wait for the attached child to exit. Pends forever when no child is
/// attached. Cancel safe.
pub(crate) async fn child_exited(
    child: &mut Option<Child>,
) -> std::io::Result<std::process::ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// Terminate the helper: SIGTERM, then SIGKILL after a grace period.
///
/// Callers close the helper's stdin first (dropping the writer), which is the
/// helper's normal exit signal; the signals cover helpers stuck mid-syscall.
pub(crate) async fn terminate_child(child: Option<Child>) {
    let Some(mut child) = child else {
        return;
    };

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(%status, "helper exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "failed to reap helper"),
        Err(_) => {
            tracing::warn!("helper did not exit after SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

/// Spawner that runs a shell snippet instead of the real launcher. Shared
/// by transport and worker tests.
#[cfg(test)]
pub(crate) struct ShellSpawner(pub &'static str);

#[cfg(test)]
impl HelperSpawner for ShellSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = ProcessCommand::new("sh")
            .args(["-c", self.0])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Response;

    #[tokio::test]
    async fn open_fails_for_missing_launcher() {
        let spawner = LauncherSpawner::new("/nonexistent/launcher", "/nonexistent/helper");
        let err = Channel::open(&spawner).unwrap_err();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[tokio::test]
    async fn child_exit_is_observable() {
        let mut channel = Channel::open(&ShellSpawner("exit 3")).unwrap();
        let status = child_exited(&mut channel.child).await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn channel_without_child_never_reports_exit() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(ours);
        let mut channel = Channel::from_stream(r, w);

        let exited = tokio::time::timeout(
            Duration::from_millis(20),
            child_exited(&mut channel.child),
        )
        .await;
        assert!(exited.is_err());
    }

    #[tokio::test]
    async fn send_and_receive_over_in_memory_stream() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(ours);
        let mut channel = Channel::from_stream(r, w);

        let (helper_r, helper_w) = tokio::io::split(theirs);
        let mut helper_reader = FramedRead::new(helper_r, CommandCodec::new());
        let mut helper_writer = FramedWrite::new(helper_w, FrameCodec::new());

        channel.send(Command::Interfaces).await.unwrap();
        let cmd = helper_reader.next().await.unwrap().unwrap();
        assert_eq!(cmd, Command::Interfaces);

        helper_writer
            .send(InboundFrame::Response(Response::Interfaces {
                interfaces: vec!["eth0".to_string()],
            }))
            .await
            .unwrap();
        let frame = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(
            frame,
            InboundFrame::Response(Response::Interfaces {
                interfaces: vec!["eth0".to_string()],
            })
        );
    }

    #[tokio::test]
    async fn terminate_child_reaps_a_live_helper() {
        let mut channel = Channel::open(&ShellSpawner("read _line")).unwrap();
        let child = channel.child.take();
        drop(channel);
        terminate_child(child).await;
    }
}
