//! Connection driver
//!
//! One task per websocket owns the transport, the request queue, the session crypto
//! and every timer of the connection. The [`Connection`](super::connection::Connection)
//! handle talks to it through [`DriverCommand`]s, so protocol state is only ever
//! touched from this task.
//!
//! ## Timers
//! - **Socket timeout**: armed on every send and every announced payload; expiry
//!   closes the connection with `Timeout`
//! - **Keepalive**: once authenticated (not on download connections) a `keepalive`
//!   is sent every interval unless a payload is on its way; an unanswered keepalive
//!   closes with `Timeout`
//! - **Idle close**: download connections close when nothing was sent for a while
//! - **Progress**: download connections report the estimated progress of a payload

use crate::config::{DebugConfig, TimingConfig};
use crate::core::commands::{self, EncryptionMode};
use crate::core::event::decode_events;
use crate::core::header::EventType;
use crate::core::response::{codes, parse_blocked_remaining, LxResponse};
use crate::error::ProtocolError;
use crate::protocol::session::SessionCrypto;
use crate::service::connection::{ConnectionState, ConnectionStatus};
use crate::service::delegate::ConnectionDelegate;
use crate::service::queue::{FileContent, PendingRequest, Reply, RequestQueue};
use crate::transport::framing::{Frame, FrameAssembler, FrameOutcome};
use crate::transport::{Transport, TransportEvent, CLOSE_NORMAL};
use crate::utils::metrics::ConnectionMetrics;
use crate::utils::throughput::ThroughputEstimator;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Requests from the connection handle
#[derive(Debug)]
pub(crate) enum DriverCommand {
    Send(PendingRequest),
    /// Session established by the key exchange
    InstallSession(SessionCrypto),
    /// Authentication succeeded
    Authenticated,
    Close(ProtocolError),
}

/// Settings fixed for the lifetime of a driver
#[derive(Debug, Clone)]
pub(crate) struct DriverSettings {
    pub download: bool,
    pub timing: TimingConfig,
    pub debug: DebugConfig,
}

/// Collaborators shared with the connection handle
pub(crate) struct DriverContext {
    pub status: Arc<watch::Sender<ConnectionStatus>>,
    pub delegate: Arc<dyn ConnectionDelegate>,
    pub metrics: Arc<ConnectionMetrics>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timers {
    socket: Option<Instant>,
    keepalive_due: Option<Instant>,
    keepalive_answer: Option<Instant>,
    idle_close: Option<Instant>,
    progress: Option<Instant>,
}

enum Step {
    Command(Option<DriverCommand>),
    Transport(Option<TransportEvent>),
    SocketTimeout,
    KeepaliveDue,
    KeepaliveMissed,
    IdleClose,
    Progress,
}

pub(crate) struct Driver {
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    context: DriverContext,
    settings: DriverSettings,
    queue: RequestQueue,
    frames: FrameAssembler,
    estimator: ThroughputEstimator,
    session: Option<SessionCrypto>,
    authenticated: bool,
    timers: Timers,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Close reason for a close initiated by the Miniserver
pub(crate) fn remote_close_reason(code: Option<u16>, reason: String) -> ProtocolError {
    if code == Some(codes::WS_CLOSE_BLOCKED) {
        ProtocolError::TemporarilyBlocked {
            remaining_seconds: parse_blocked_remaining(&reason),
        }
    } else {
        ProtocolError::ConnectionClosed { code, reason }
    }
}

impl Driver {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        commands: mpsc::UnboundedReceiver<DriverCommand>,
        context: DriverContext,
        settings: DriverSettings,
    ) -> Self {
        let verbose = settings.debug.socket_detailed;
        let estimator = ThroughputEstimator::with_timeouts(
            settings.download,
            settings.timing.open_timeout,
            settings.timing.socket_timeout,
        );
        Self {
            transport,
            events,
            commands,
            context,
            settings,
            queue: RequestQueue::new(),
            frames: FrameAssembler::new(verbose),
            estimator,
            session: None,
            authenticated: false,
            timers: Timers::default(),
        }
    }

    /// Run until the connection goes down
    pub(crate) async fn run(mut self) {
        let reason = loop {
            let timers = self.timers;
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                event = self.events.recv() => Step::Transport(event),
                _ = sleep_until_opt(timers.socket) => Step::SocketTimeout,
                _ = sleep_until_opt(timers.keepalive_answer) => Step::KeepaliveMissed,
                _ = sleep_until_opt(timers.keepalive_due) => Step::KeepaliveDue,
                _ = sleep_until_opt(timers.idle_close) => Step::IdleClose,
                _ = sleep_until_opt(timers.progress) => Step::Progress,
            };

            if let ControlFlow::Break(reason) = self.step(step).await {
                break reason;
            }
        };

        self.shutdown(reason).await;
    }

    async fn step(&mut self, step: Step) -> ControlFlow<(ProtocolError, bool)> {
        match step {
            Step::Command(None) => ControlFlow::Break((ProtocolError::ManualClose, true)),
            Step::Command(Some(command)) => self.handle_command(command).await,
            Step::Transport(None) => ControlFlow::Break((
                ProtocolError::ConnectionClosed {
                    code: None,
                    reason: "transport ended".into(),
                },
                false,
            )),
            Step::Transport(Some(event)) => self.handle_event(event).await,
            Step::SocketTimeout => {
                warn!(timeout = ?self.estimator.current_timeout(), "Socket timeout, closing");
                self.context.metrics.timeout();
                ControlFlow::Break((ProtocolError::Timeout, true))
            }
            Step::KeepaliveMissed => {
                warn!("Keepalive not answered, closing");
                self.context.metrics.timeout();
                ControlFlow::Break((ProtocolError::Timeout, true))
            }
            Step::KeepaliveDue => self.send_keepalive().await,
            Step::IdleClose => {
                info!(
                    idle = ?self.settings.timing.download_idle_timeout,
                    "Download connection idle, closing"
                );
                ControlFlow::Break((ProtocolError::ManualClose, true))
            }
            Step::Progress => {
                self.report_progress();
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: DriverCommand,
    ) -> ControlFlow<(ProtocolError, bool)> {
        match command {
            DriverCommand::Send(request) => self.handle_send(request).await,
            DriverCommand::InstallSession(session) => {
                if self.settings.debug.encryption {
                    debug!(session = ?session, "Session installed");
                }
                self.session = Some(session);
                ControlFlow::Continue(())
            }
            DriverCommand::Authenticated => {
                self.authenticated = true;
                self.schedule_keepalive();
                if self.settings.download {
                    let released = self.queue.release_waiting();
                    if released > 0 && self.settings.debug.download_socket {
                        debug!(released, "Releasing parked download requests");
                    }
                }
                self.pump().await
            }
            DriverCommand::Close(reason) => ControlFlow::Break((reason, true)),
        }
    }

    fn ready_for(&self, cmd: &str) -> bool {
        !self.settings.download || self.authenticated || commands::is_auth_command(cmd)
    }

    async fn handle_send(&mut self, request: PendingRequest) -> ControlFlow<(ProtocolError, bool)> {
        if self.settings.download {
            self.timers.idle_close = None;
        }

        if !self.ready_for(&request.command) {
            if self.settings.download {
                if self.settings.debug.download_socket {
                    debug!(
                        command = %request.command,
                        "Download connection not authenticated yet, parking request"
                    );
                }
                self.queue.push_waiting(request);
            } else {
                request.reject(ProtocolError::NotReady);
            }
            return ControlFlow::Continue(());
        }

        self.queue.push(request);
        self.pump().await
    }

    /// Dispatch queued requests while nothing is in flight
    async fn pump(&mut self) -> ControlFlow<(ProtocolError, bool)> {
        while let Some(request) = self.queue.next() {
            self.dispatch(request).await?;
        }

        if self.settings.download && self.authenticated && self.queue.is_idle() {
            self.timers.idle_close =
                Some(Instant::now() + self.settings.timing.download_idle_timeout);
        }
        ControlFlow::Continue(())
    }

    async fn dispatch(&mut self, request: PendingRequest) -> ControlFlow<(ProtocolError, bool)> {
        let wire = if request.mode.encrypts_request() {
            let Some(session) = self.session.as_mut() else {
                warn!(
                    command = %request.command,
                    "Encryption requested, but the connection is not secured"
                );
                request.reject(ProtocolError::NotSecured);
                return ControlFlow::Continue(());
            };
            match session.encrypt_command(&request.command, request.mode, Instant::now()) {
                Ok(wire) => {
                    self.context.metrics.command_encrypted();
                    wire
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        command = %request.command,
                        "Encrypting the command failed"
                    );
                    request.reject(err);
                    return ControlFlow::Continue(());
                }
            }
        } else {
            request.command.clone()
        };

        if self.settings.debug.socket_detailed {
            debug!(command = %request.command, mode = ?request.mode, "Sending command");
        }

        if let Err(err) = self.transport.send_text(&wire).await {
            error!(error = %err, "Sending failed");
            request.reject(err.clone());
            return ControlFlow::Break((err, false));
        }

        self.context.metrics.message_sent(wire.len() as u64);
        self.arm_socket_timeout(0, false);
        self.queue.set_in_flight(request);
        ControlFlow::Continue(())
    }

    fn arm_socket_timeout(&mut self, bytes: u64, estimated: bool) {
        let now = Instant::now();
        let timeout = self.estimator.start(bytes, estimated, now);
        self.timers.socket = Some(now + timeout);

        if self.settings.download && bytes > 0 {
            self.timers.progress = Some(now + self.settings.timing.progress_interval);
        }
    }

    fn schedule_keepalive(&mut self) {
        if self.authenticated && !self.settings.download {
            self.timers.keepalive_due =
                Some(Instant::now() + self.settings.timing.keepalive_interval);
        }
    }

    async fn send_keepalive(&mut self) -> ControlFlow<(ProtocolError, bool)> {
        self.timers.keepalive_due = None;

        // a payload on its way proves the connection is alive
        if self.frames.expects_payload() || self.estimator.expects_payload() {
            self.schedule_keepalive();
            return ControlFlow::Continue(());
        }

        if let Err(err) = self.transport.send_text(commands::KEEPALIVE).await {
            return ControlFlow::Break((err, false));
        }
        self.context.metrics.keepalive_sent();
        self.arm_socket_timeout(0, false);
        self.timers.keepalive_answer =
            Some(Instant::now() + self.settings.timing.keepalive_timeout);
        ControlFlow::Continue(())
    }

    fn report_progress(&mut self) {
        let now = Instant::now();
        let progress = self.estimator.progress(now);
        if self.settings.debug.download_socket {
            debug!(progress = ?progress, "Download progress");
        }
        self.context.delegate.data_progress(progress.as_ref());
        self.timers.progress = self
            .estimator
            .expects_payload()
            .then(|| now + self.settings.timing.progress_interval);
    }

    async fn handle_event(&mut self, event: TransportEvent) -> ControlFlow<(ProtocolError, bool)> {
        match event {
            TransportEvent::Text(text) => self.handle_frame(Frame::Text(text)).await,
            TransportEvent::Binary(bytes) => self.handle_frame(Frame::Binary(bytes)).await,
            TransportEvent::Closed { code, reason } => {
                info!(code = ?code, reason = %reason, "Websocket closed by remote");
                ControlFlow::Break((remote_close_reason(code, reason), false))
            }
            TransportEvent::Error(message) => {
                error!(error = %message, "Websocket error");
                ControlFlow::Break((ProtocolError::Transport(message), true))
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> ControlFlow<(ProtocolError, bool)> {
        self.context.metrics.message_received(frame.len() as u64);
        let outcome = self.frames.push(frame);

        if outcome.completes_transfer() {
            self.estimator.complete(Instant::now());
            self.timers.socket = None;
            self.timers.progress = None;
        }

        match outcome {
            FrameOutcome::HeaderReceived(header) => {
                self.arm_socket_timeout(u64::from(header.length), header.estimated);
            }
            FrameOutcome::KeepaliveConfirmed => {
                self.timers.keepalive_answer = None;
                self.schedule_keepalive();
            }
            FrameOutcome::OutOfService => {
                return ControlFlow::Break((ProtocolError::OutOfService, true));
            }
            FrameOutcome::EmptyPayload(_) => self.resolve(Reply::File(FileContent::Empty)),
            FrameOutcome::Text { text, event_type } => match event_type {
                EventType::Text => self.handle_response(text),
                EventType::File => self.resolve(Reply::File(FileContent::Text(text))),
                other => warn!(event_type = %other, "Unexpected text payload type"),
            },
            FrameOutcome::Binary {
                payload,
                event_type,
            } => match event_type {
                EventType::File => self.resolve(Reply::File(FileContent::Binary(payload))),
                EventType::Text => {
                    error!(
                        text = %String::from_utf8_lossy(&payload),
                        "Received text as binary payload"
                    );
                }
                event_type if event_type.is_event_table() => {
                    self.handle_events(&payload, event_type)
                }
                other => warn!(event_type = %other, "Unknown binary payload type"),
            },
            FrameOutcome::Failed(err) => {
                self.context.metrics.protocol_error();
                match self.queue.take_in_flight() {
                    Some(request) => request.reject(err),
                    None => warn!(error = %err, "Frame error without request"),
                }
            }
            FrameOutcome::Ignored => {}
        }

        self.pump().await
    }

    fn resolve(&mut self, reply: Reply) {
        match self.queue.take_in_flight() {
            Some(request) => request.resolve(reply),
            None => info!("Received file without request, dropping it"),
        }
    }

    fn handle_response(&mut self, text: String) {
        let Some(request) = self.queue.take_in_flight() else {
            info!(response = %text, "Received response without request, dropping it");
            return;
        };

        let text = if request.mode == EncryptionMode::RequestAndResponse {
            match self.session.as_ref().map(|session| session.decrypt(&text)) {
                Some(Ok(plain)) => plain,
                Some(Err(err)) => {
                    warn!(
                        error = %err,
                        command = %request.command,
                        "Decrypting the response failed"
                    );
                    request.reject(ProtocolError::DecryptionFailed);
                    return;
                }
                None => {
                    request.reject(ProtocolError::DecryptionFailed);
                    return;
                }
            }
        } else {
            text
        };

        if self.settings.debug.socket_basic {
            debug!(command = %request.command, response = %text, "Miniserver -> client");
        }

        let outcome = LxResponse::parse(&text)
            .and_then(LxResponse::into_result)
            .map(Reply::Response);
        if let Err(err) = &outcome {
            debug!(error = %err, command = %request.command, "Request failed");
        }
        request.complete(outcome);
    }

    fn handle_events(&self, payload: &[u8], event_type: EventType) {
        match decode_events(event_type, payload) {
            Ok(events) => {
                self.context.metrics.events_received(events.len() as u64);
                if self.settings.debug.binary_events {
                    for event in &events {
                        debug!(%event, "Event received");
                    }
                }
                self.context.delegate.event_received(&events, event_type);
            }
            Err(err) => {
                self.context.metrics.protocol_error();
                warn!(error = %err, %event_type, "Could not decode event table");
            }
        }
    }

    /// Reject everything and publish the close
    async fn shutdown(&mut self, (reason, close_transport): (ProtocolError, bool)) {
        self.timers = Timers::default();
        self.estimator.cancel();
        self.frames.reset();

        self.context.status.send_modify(|status| {
            status.state = ConnectionState::Closed;
            status.close_reason = Some(reason.clone());
        });

        let mut rejected = self.queue.drain(&reason);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let DriverCommand::Send(request) = command {
                request.reject(reason.clone());
                rejected += 1;
            }
        }
        self.context.metrics.requests_rejected(rejected as u64);

        if close_transport {
            self.transport.close(CLOSE_NORMAL).await;
        }
        self.context.metrics.connection_closed();

        info!(reason = %reason, rejected, "Connection closed");
        if self.authenticated && !self.settings.download {
            self.context.delegate.connection_closed(&reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_close_reason() {
        assert_eq!(
            remote_close_reason(Some(4003), "blocked (120)".into()),
            ProtocolError::TemporarilyBlocked {
                remaining_seconds: Some(120)
            }
        );
        assert!(matches!(
            remote_close_reason(Some(1006), "gone".into()),
            ProtocolError::ConnectionClosed { code: Some(1006), .. }
        ));
    }
}
