//! Worker lifecycle and request/response correlation.
//!
//! One worker exclusively owns the helper channel. Calls queue on an mpsc
//! and are served strictly in arrival order with a single command in
//! flight, so response frames need no request IDs: a response always
//! belongs to the most recent outstanding command. Do not introduce
//! concurrent in-flight requests without adding correlation IDs to the
//! frame format.
//!
//! A response timeout, channel EOF, or unexpected helper exit is fatal to
//! the worker; netlink and helper-process state cannot be safely resumed
//! mid-operation, so recovery is left entirely to external supervision.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::bridge::codec::InboundFrame;
use crate::bridge::protocol::{Command, Options, Response, Settings, Status};
use crate::bridge::transport::{
    self, Channel, CommandWriter, FrameReader, SpawnError,
};
use crate::config::{ManagedInterfaces, WorkerConfig};
use crate::registry::{Subscription, SubscriptionRegistry};

/// Queued calls beyond this block the caller until the worker drains.
const REQUEST_QUEUE_DEPTH: usize = 32;

/// Why a worker instance stopped. `Stopped` is the only clean variant;
/// everything else is an abnormal termination for external supervision to
/// act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Explicit `stop()`, or every handle dropped.
    Stopped,
    /// Helper process exited while the worker was running.
    HelperExited(Option<i32>),
    /// Helper closed its end of the byte channel.
    ChannelClosed,
    /// A call outlived the response timeout. The channel can no longer be
    /// correlated and is abandoned rather than retried.
    CallTimeout,
}

impl Termination {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The helper rejected the command (e.g. unknown interface, invalid
    /// option value).
    #[error("helper error: {0}")]
    Helper(String),
    /// The worker terminated before or while serving the call.
    #[error("worker terminated")]
    Terminated,
    /// The helper answered with a payload that does not match the command.
    #[error("unexpected response to {command}")]
    UnexpectedResponse { command: &'static str },
}

struct CallRequest {
    command: Command,
    reply: oneshot::Sender<Result<Response, CallError>>,
}

enum WorkerRequest {
    Call(CallRequest),
    Stop,
}

/// Handle to a running worker.
///
/// Cloneable; every clone talks to the same worker, so the single-writer
/// discipline on the channel is preserved no matter how many callers
/// issue commands concurrently.
#[derive(Clone)]
pub struct WorkerHandle {
    request_tx: mpsc::Sender<WorkerRequest>,
    registry: Arc<SubscriptionRegistry>,
    termination_rx: watch::Receiver<Option<Termination>>,
    managed: ManagedInterfaces,
}

/// Spawn the helper and start the worker event loop.
///
/// Spawn failure is fatal: the worker never comes up and no handle is
/// returned. Must be called within a Tokio runtime.
pub fn start(config: WorkerConfig) -> Result<WorkerHandle, SpawnError> {
    let channel = Channel::open(config.spawner.as_ref())?;
    Ok(start_with_channel(config, channel))
}

/// Start the worker over a pre-built channel.
///
/// Used by tests and in-process fakes; `start` is the production path.
pub fn start_with_channel(config: WorkerConfig, channel: Channel) -> WorkerHandle {
    let registry = SubscriptionRegistry::new();
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (termination_tx, termination_rx) = watch::channel(None);

    let Channel {
        reader,
        writer,
        child,
    } = channel;
    let worker = Worker {
        reader,
        writer,
        child,
        request_rx,
        registry: Arc::clone(&registry),
        call_timeout: config.call_timeout,
    };

    tokio::spawn(async move {
        let termination = worker.run().await;
        tracing::info!(?termination, clean = termination.is_clean(), "worker terminated");
        let _ = termination_tx.send(Some(termination));
    });

    WorkerHandle {
        request_tx,
        registry,
        termination_rx,
        managed: config.managed,
    }
}

impl WorkerHandle {
    /// Names the helper reports, intersected with the managed allow-list.
    pub async fn interfaces(&self) -> Result<Vec<String>, CallError> {
        match self.call(Command::Interfaces).await? {
            Response::Interfaces { interfaces } => Ok(self.managed.filter(interfaces)),
            other => Err(unexpected("interfaces", other)),
        }
    }

    pub async fn status(&self, ifname: &str) -> Result<Status, CallError> {
        match self
            .call(Command::Status {
                ifname: ifname.to_string(),
            })
            .await?
        {
            Response::Status { status } => Ok(status),
            other => Err(unexpected("status", other)),
        }
    }

    pub async fn settings(&self, ifname: &str) -> Result<Settings, CallError> {
        match self
            .call(Command::Settings {
                ifname: ifname.to_string(),
            })
            .await?
        {
            Response::Settings { settings } => Ok(settings),
            other => Err(unexpected("settings", other)),
        }
    }

    pub async fn ifup(&self, ifname: &str) -> Result<(), CallError> {
        self.expect_ok(
            Command::Ifup {
                ifname: ifname.to_string(),
            },
            "ifup",
        )
        .await
    }

    pub async fn ifdown(&self, ifname: &str) -> Result<(), CallError> {
        self.expect_ok(
            Command::Ifdown {
                ifname: ifname.to_string(),
            },
            "ifdown",
        )
        .await
    }

    pub async fn setup(&self, ifname: &str, options: Options) -> Result<(), CallError> {
        self.expect_ok(
            Command::Setup {
                ifname: ifname.to_string(),
                options,
            },
            "setup",
        )
        .await
    }

    /// Register interest in events for one interface name.
    pub fn subscribe(&self, ifname: &str) -> Subscription {
        self.registry.subscribe(ifname)
    }

    /// Clean shutdown. Resolves once the worker has terminated the helper
    /// and released the channel.
    pub async fn stop(&self) -> Termination {
        let _ = self.request_tx.send(WorkerRequest::Stop).await;
        self.terminated().await
    }

    /// Wait until the worker terminates, for whatever reason.
    pub async fn terminated(&self) -> Termination {
        let mut rx = self.termination_rx.clone();
        loop {
            if let Some(termination) = rx.borrow_and_update().clone() {
                return termination;
            }
            if rx.changed().await.is_err() {
                return Termination::Stopped;
            }
        }
    }

    /// Current termination state, `None` while running.
    pub fn termination(&self) -> Option<Termination> {
        self.termination_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.termination().is_none()
    }

    async fn call(&self, command: Command) -> Result<Response, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(WorkerRequest::Call(CallRequest {
                command,
                reply: reply_tx,
            }))
            .await
            .map_err(|_| CallError::Terminated)?;
        reply_rx.await.map_err(|_| CallError::Terminated)?
    }

    async fn expect_ok(&self, command: Command, tag: &'static str) -> Result<(), CallError> {
        match self.call(command).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(tag, other)),
        }
    }
}

fn unexpected(command: &'static str, response: Response) -> CallError {
    match response {
        Response::Error { message } => CallError::Helper(message),
        other => {
            tracing::warn!(command, response = ?other, "response does not match command");
            CallError::UnexpectedResponse { command }
        }
    }
}

struct Worker {
    reader: FrameReader,
    writer: CommandWriter,
    child: Option<Child>,
    request_rx: mpsc::Receiver<WorkerRequest>,
    registry: Arc<SubscriptionRegistry>,
    call_timeout: Duration,
}

impl Worker {
    async fn run(mut self) -> Termination {
        let termination = self.event_loop().await;

        // Closing the helper's stdin is its normal exit signal.
        drop(self.writer);
        match &termination {
            Termination::HelperExited(_) => {} // already gone, nothing to terminate
            _ => transport::terminate_child(self.child.take()).await,
        }
        termination
    }

    /// Idle loop: waits for the next call, inbound frame, or helper exit.
    async fn event_loop(&mut self) -> Termination {
        loop {
            tokio::select! {
                biased;

                status = transport::child_exited(&mut self.child) => {
                    return helper_exit(status);
                }

                frame = self.reader.next() => {
                    match frame {
                        Some(Ok(InboundFrame::Notification(notification))) => {
                            self.registry.dispatch(&notification);
                        }
                        Some(Ok(InboundFrame::Response(_))) => {
                            tracing::warn!("response frame with no call in flight, dropping");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "malformed frame, dropping");
                        }
                        None => {
                            tracing::error!("helper closed the channel");
                            return Termination::ChannelClosed;
                        }
                    }
                }

                request = self.request_rx.recv() => {
                    match request {
                        Some(WorkerRequest::Call(call)) => {
                            if let Some(termination) = self.serve_call(call).await {
                                return termination;
                            }
                        }
                        Some(WorkerRequest::Stop) => {
                            tracing::info!("stop requested");
                            return Termination::Stopped;
                        }
                        None => {
                            tracing::info!("all handles dropped, stopping");
                            return Termination::Stopped;
                        }
                    }
                }
            }
        }
    }

    /// Serve one round-trip. Returns a termination when the worker must
    /// die; `None` means the call completed (successfully or with a
    /// caller-visible error) and the worker keeps running.
    ///
    /// The request queue is not polled here, which is what enforces the
    /// single-in-flight invariant.
    async fn serve_call(&mut self, call: CallRequest) -> Option<Termination> {
        let CallRequest { command, reply } = call;
        let tag = command.tag();

        tracing::debug!(command = tag, "sending command");
        if let Err(e) = self.writer.send(command).await {
            tracing::error!(command = tag, error = %e, "failed to send command");
            let _ = reply.send(Err(CallError::Terminated));
            return Some(Termination::ChannelClosed);
        }

        let deadline = Instant::now() + self.call_timeout;
        loop {
            tokio::select! {
                biased;

                status = transport::child_exited(&mut self.child) => {
                    let _ = reply.send(Err(CallError::Terminated));
                    return Some(helper_exit(status));
                }

                _ = tokio::time::sleep_until(deadline) => {
                    tracing::error!(
                        command = tag,
                        timeout_ms = self.call_timeout.as_millis() as u64,
                        "response timeout, terminating worker"
                    );
                    let _ = reply.send(Err(CallError::Terminated));
                    return Some(Termination::CallTimeout);
                }

                frame = self.reader.next() => {
                    match frame {
                        Some(Ok(InboundFrame::Response(response))) => {
                            let _ = reply.send(Ok(response));
                            return None;
                        }
                        Some(Ok(InboundFrame::Notification(notification))) => {
                            self.registry.dispatch(&notification);
                        }
                        Some(Err(e)) => {
                            // Non-fatal: the in-flight call keeps waiting
                            // and times out if its response was the frame
                            // that was lost.
                            tracing::warn!(command = tag, error = %e, "malformed frame, dropping");
                        }
                        None => {
                            tracing::error!(command = tag, "helper closed the channel mid-call");
                            let _ = reply.send(Err(CallError::Terminated));
                            return Some(Termination::ChannelClosed);
                        }
                    }
                }
            }
        }
    }
}

fn helper_exit(status: std::io::Result<std::process::ExitStatus>) -> Termination {
    match status {
        Ok(status) => {
            tracing::error!(%status, "helper exited unexpectedly");
            Termination::HelperExited(status.code())
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to wait on helper");
            Termination::HelperExited(None)
        }
    }
}
