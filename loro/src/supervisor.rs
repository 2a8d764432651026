// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use codec::{
    AuthPacket, BinaryData, BoolData, ConnectAckPacket, ConnectPacket, DisconnectPacket, Packet,
    Properties, Property, ReasonCode, StringData, U16Data, U32Data,
};

use crate::commands::{ClientCmd, PipelineEvent, WriterCmd};
use crate::connect_options::ConnectOptions;
use crate::context::{ClientContext, Negotiated};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind};
use crate::events::{ClientEvent, EventKind};
use crate::reader::Reader;
use crate::stream::Stream;
use crate::types::ConnectResult;
use crate::writer::Writer;

/// Connection phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Handles of the pipeline tasks serving one network connection.
struct Connection {
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Connection {
    fn stop(self) {
        let _ = self.shutdown.send(true);
        // The tasks observe the shutdown signal at their next suspension
        // point; dropping the halves closes the socket.
        self.reader.abort();
        self.writer.abort();
        self.dispatcher.abort();
    }
}

/// Orchestrates the session lifecycle: connect, keep alive, reconnect
/// with backoff, disconnect.
///
/// The supervisor exclusively owns the live transport and the pipeline
/// tasks. Everything else reaches it through the command channel or the
/// pipeline event channel.
pub struct Supervisor {
    options: ConnectOptions,
    ctx: Arc<ClientContext>,
    cmd_rx: mpsc::Receiver<ClientCmd>,
    event_rx: mpsc::Receiver<PipelineEvent>,

    phase: Phase,
    connection: Option<Connection>,

    /// A session was established at least once; reconnects then never
    /// request a clean start, so the server can resume.
    session_started: bool,

    /// The user asked for the disconnect; suppresses automatic reconnect.
    user_disconnect: bool,

    /// Deadline for the outstanding PINGREQ, when one is in flight.
    pingresp_deadline: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        options: ConnectOptions,
        ctx: Arc<ClientContext>,
        cmd_rx: mpsc::Receiver<ClientCmd>,
        event_rx: mpsc::Receiver<PipelineEvent>,
    ) -> Self {
        Self {
            options,
            ctx,
            cmd_rx,
            event_rx,
            phase: Phase::Disconnected,
            connection: None,
            session_started: false,
            user_disconnect: false,
            pingresp_deadline: None,
        }
    }

    pub async fn run(mut self) {
        log::debug!("supervisor: task started");
        loop {
            let keepalive_wake = self.keepalive_wake();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Every client handle is gone.
                        self.teardown();
                        break;
                    };
                    match cmd {
                        ClientCmd::Connect { tx } => self.handle_connect(tx).await,
                        ClientCmd::Disconnect { tx } => self.handle_disconnect(tx).await,
                    }
                }
                event = self.event_rx.recv(), if self.connection.is_some() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                () = tokio::time::sleep_until(
                    tokio::time::Instant::from_std(
                        keepalive_wake.unwrap_or_else(Instant::now),
                    )
                ), if keepalive_wake.is_some() => {
                    self.on_keepalive_timer().await;
                }
            }
        }
        log::debug!("supervisor: task finished");
    }

    /// Next instant the keep alive machinery wants to run, when armed.
    fn keepalive_wake(&self) -> Option<Instant> {
        if self.phase != Phase::Connected {
            return None;
        }
        if let Some(deadline) = self.pingresp_deadline {
            return Some(deadline);
        }
        let keep_alive = self.ctx.negotiated.lock().unwrap().keep_alive;
        if keep_alive == 0 {
            return None;
        }
        let last_write = *self.ctx.last_write.lock().unwrap();
        Some(last_write + Duration::from_secs(u64::from(keep_alive)))
    }

    async fn on_keepalive_timer(&mut self) {
        if self.phase != Phase::Connected {
            return;
        }
        let now = Instant::now();

        if let Some(deadline) = self.pingresp_deadline {
            if now >= deadline {
                log::warn!("supervisor: no PINGRESP within the keep alive window");
                self.connection_lost(Error::new(
                    ErrorKind::OperationTimedOut,
                    "Server did not answer PINGREQ",
                ))
                .await;
            }
            return;
        }

        let keep_alive = self.ctx.negotiated.lock().unwrap().keep_alive;
        if keep_alive == 0 {
            return;
        }
        let idle_deadline =
            *self.ctx.last_write.lock().unwrap() + Duration::from_secs(u64::from(keep_alive));
        if now < idle_deadline {
            // A write happened since the timer was armed.
            return;
        }

        log::debug!("supervisor: keep alive expired, sending PINGREQ");
        self.ctx.queue.push_priority(WriterCmd::Packet(Packet::PingRequest(
            codec::PingRequestPacket::new(),
        )));
        self.pingresp_deadline = Some(now + Duration::from_secs(u64::from(keep_alive)));
    }

    async fn handle_connect(&mut self, tx: oneshot::Sender<Result<ConnectResult, Error>>) {
        if self.phase != Phase::Disconnected {
            let _ = tx.send(Err(Error::new(
                ErrorKind::ConfigError,
                "Client is already connected or connecting",
            )));
            return;
        }
        self.user_disconnect = false;
        self.ctx
            .events
            .emit_with(EventKind::BeforeConnect, || ClientEvent::BeforeConnect);

        let result = self.connect_with_backoff().await;
        match &result {
            Ok(connect_result) => {
                let session_present = connect_result.session_present;
                let reason_code = connect_result.reason_code;
                self.ctx.events.emit_with(EventKind::AfterConnect, || {
                    ClientEvent::AfterConnect {
                        session_present,
                        reason_code,
                    }
                });
            }
            Err(err) => {
                log::error!("supervisor: connect failed: {err}");
            }
        }
        let _ = tx.send(result);
    }

    /// Attempt to establish the session, backing off between transport
    /// failures while automatic reconnect is enabled. A CONNACK carrying
    /// an error reason code always ends the attempts.
    async fn connect_with_backoff(&mut self) -> Result<ConnectResult, Error> {
        let mut delay = self.options.reconnect().base_delay;
        loop {
            match self.establish().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let retryable = !matches!(
                        err.kind(),
                        ErrorKind::BrokerRejected | ErrorKind::ConfigError
                    );
                    if !(self.options.reconnect().enabled && retryable) {
                        self.phase = Phase::Disconnected;
                        return Err(err);
                    }
                    log::warn!("supervisor: connect attempt failed: {err}, retrying");
                    delay = self.backoff_sleep(delay).await;
                }
            }
        }
    }

    /// Sleep the backoff `delay` with jitter and return the doubled delay,
    /// capped at the configured maximum.
    async fn backoff_sleep(&mut self, delay: Duration) -> Duration {
        let jitter = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(0..=delay.as_millis().max(1) as u64 / 4))
        };
        tokio::time::sleep(delay + jitter).await;
        let doubled = delay.saturating_mul(2);
        doubled.min(self.options.reconnect().max_delay)
    }

    /// One full connect attempt: transport, pipelines, CONNECT, CONNACK,
    /// negotiation and session resumption.
    async fn establish(&mut self) -> Result<ConnectResult, Error> {
        self.phase = Phase::Connecting;
        self.ctx.reset_connection_state();

        // Events of a previous connection must not be mistaken for
        // answers of this attempt.
        while self.event_rx.try_recv().is_ok() {}

        let stream = match Stream::connect(&self.options).await {
            Ok(stream) => stream,
            Err(err) => {
                self.phase = Phase::Disconnected;
                return Err(err);
            }
        };
        self.spawn_pipelines(stream);

        let clean_start = if self.session_started {
            false
        } else {
            self.options.clean_start()
        };
        let connect_packet = match self.build_connect_packet(clean_start) {
            Ok(packet) => packet,
            Err(err) => {
                self.teardown();
                return Err(err);
            }
        };
        self.ctx
            .queue
            .push_priority(WriterCmd::Packet(Packet::Connect(connect_packet)));

        let ack = match self.wait_for_connack().await {
            Ok(ack) => ack,
            Err(err) => {
                self.teardown();
                return Err(err);
            }
        };

        if ack.reason_code().is_error() {
            self.teardown();
            return Err(Error::broker_rejected(ack.reason_code(), "CONNECT"));
        }

        let result = self.apply_connack(&ack);
        self.phase = Phase::Connected;
        self.ctx.set_connected(true);
        self.session_started = true;
        self.pingresp_deadline = None;

        if ack.session_present() {
            self.resume_session();
        } else {
            self.ctx.clear_session();
        }
        Ok(result)
    }

    /// Wait for the CONNACK of the freshly sent CONNECT, handling the
    /// failure events that may arrive instead.
    async fn wait_for_connack(&mut self) -> Result<ConnectAckPacket, Error> {
        let event = timeout(self.options.response_timeout(), self.event_rx.recv())
            .await
            .map_err(Error::from)?;
        match event {
            Some(PipelineEvent::ConnectAckReceived(ack)) => Ok(*ack),
            Some(PipelineEvent::TransportClosed(err)) => Err(err),
            Some(PipelineEvent::ProtocolViolation { message, .. }) => {
                Err(Error::from_string(ErrorKind::ProtocolError, message))
            }
            // No other packet may precede CONNACK [MQTT-3.2.0-1].
            Some(other) => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("Unexpected event before CONNACK: {other:?}"),
            )),
            None => Err(Error::new(
                ErrorKind::ChannelError,
                "Pipeline event channel closed",
            )),
        }
    }

    fn spawn_pipelines(&mut self, stream: Stream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (packet_tx, packet_rx) = mpsc::channel(64);

        let reader = Reader::new(
            read_half,
            packet_tx,
            Arc::clone(&self.ctx),
            shutdown_rx.clone(),
        );
        let writer = Writer::new(write_half, Arc::clone(&self.ctx), shutdown_rx.clone());
        let dispatcher = Dispatcher::new(packet_rx, Arc::clone(&self.ctx), shutdown_rx);

        self.connection = Some(Connection {
            shutdown: shutdown_tx,
            reader: tokio::spawn(reader.run()),
            writer: tokio::spawn(writer.run()),
            dispatcher: tokio::spawn(dispatcher.run()),
        });
    }

    fn build_connect_packet(&self, clean_start: bool) -> Result<ConnectPacket, Error> {
        let mut packet = ConnectPacket::new(self.options.client_id())?;
        packet.set_clean_start(clean_start);
        packet.set_keep_alive(self.options.keep_alive());

        let properties = packet.mut_properties();
        Self::fill_connect_properties(&self.options, properties)?;

        packet.set_will(self.options.will().cloned());
        packet.set_username(self.options.username())?;
        let password = self.options.password().map(|p| p.expose().to_vec());
        packet.set_password(password.as_deref())?;
        Ok(packet)
    }

    fn fill_connect_properties(
        options: &ConnectOptions,
        properties: &mut Properties,
    ) -> Result<(), Error> {
        if options.session_expiry_interval() > 0 {
            properties.push(Property::SessionExpiryInterval(U32Data::new(
                options.session_expiry_interval(),
            )));
        }
        if options.receive_maximum() != u16::MAX {
            properties.push(Property::ReceiveMaximum(U16Data::new(
                options.receive_maximum(),
            )));
        }
        if let Some(maximum_packet_size) = options.maximum_packet_size() {
            properties.push(Property::MaximumPacketSize(U32Data::new(
                maximum_packet_size,
            )));
        }
        if options.topic_alias_maximum() > 0 {
            properties.push(Property::TopicAliasMaximum(U16Data::new(
                options.topic_alias_maximum(),
            )));
        }
        if options.request_response_information() {
            properties.push(Property::RequestResponseInformation(BoolData::new(true)));
        }
        if !options.request_problem_information() {
            properties.push(Property::RequestProblemInformation(BoolData::new(false)));
        }
        for (key, value) in options.user_properties() {
            properties
                .add_user_property(key, value)
                .map_err(|err| Error::from_string(ErrorKind::ConfigError, format!("{err:?}")))?;
        }
        if let Some(method) = options.authentication_method() {
            properties.push(Property::AuthenticationMethod(
                StringData::from(method)
                    .map_err(|err| Error::from_string(ErrorKind::ConfigError, format!("{err:?}")))?,
            ));
        }
        if let Some(data) = options.authentication_data() {
            properties.push(Property::AuthenticationData(
                BinaryData::from_slice(data).map_err(Error::from)?,
            ));
        }
        Ok(())
    }

    /// Record the negotiated session parameters out of the CONNACK.
    fn apply_connack(&mut self, ack: &ConnectAckPacket) -> ConnectResult {
        let properties = ack.properties();
        let keep_alive = properties
            .server_keep_alive()
            .map_or(self.options.keep_alive(), |server_keep_alive| {
                server_keep_alive.max(self.options.keep_alive())
            });
        let server_receive_maximum = properties.receive_maximum().unwrap_or(u16::MAX);
        let negotiated = Negotiated {
            keep_alive,
            server_receive_maximum,
            server_maximum_packet_size: properties.maximum_packet_size(),
            server_topic_alias_maximum: properties.topic_alias_maximum().unwrap_or(0),
            maximum_qos: properties.maximum_qos().unwrap_or(codec::QoS::ExactOnce),
            retain_available: properties.retain_available().unwrap_or(true),
            session_expiry_interval: properties
                .session_expiry_interval()
                .unwrap_or_else(|| self.options.session_expiry_interval()),
            assigned_client_id: properties
                .assigned_client_identifier()
                .map(ToString::to_string),
            wildcard_subscription_available: properties
                .wildcard_subscription_available()
                .unwrap_or(true),
            subscription_identifier_available: properties
                .subscription_identifier_available()
                .unwrap_or(true),
            shared_subscription_available: properties
                .shared_subscription_available()
                .unwrap_or(true),
        };

        // Flow control window is the smaller of both receive maxima.
        let capacity = usize::from(self.options.receive_maximum().min(server_receive_maximum));
        self.ctx.inflight.set_capacity(capacity);
        self.ctx
            .outbound_aliases
            .lock()
            .unwrap()
            .reset(negotiated.server_topic_alias_maximum);

        let result = ConnectResult {
            reason_code: ack.reason_code(),
            session_present: ack.session_present(),
            assigned_client_identifier: negotiated.assigned_client_id.clone(),
            reason_string: properties.reason_string().map(ToString::to_string),
            response_information: properties.response_information().map(ToString::to_string),
            keep_alive,
            session_expiry_interval: negotiated.session_expiry_interval,
            server_receive_maximum,
            server_maximum_packet_size: negotiated.server_maximum_packet_size,
            server_topic_alias_maximum: negotiated.server_topic_alias_maximum,
            maximum_qos: negotiated.maximum_qos,
            retain_available: negotiated.retain_available,
            wildcard_subscription_available: negotiated.wildcard_subscription_available,
            subscription_identifier_available: negotiated.subscription_identifier_available,
            shared_subscription_available: negotiated.shared_subscription_available,
            user_properties: properties
                .user_properties()
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        };
        *self.ctx.negotiated.lock().unwrap() = negotiated;
        result
    }

    /// Re-send the unacknowledged flows the server kept across the
    /// reconnect: publishes with DUP set in original order, and PUBRELs
    /// for flows already past PUBREC.
    fn resume_session(&self) {
        let (publishes, releases) = self.ctx.resumption_packets();
        if publishes.is_empty() && releases.is_empty() {
            return;
        }
        log::info!(
            "supervisor: resuming session, {} publishes and {} releases pending",
            publishes.len(),
            releases.len()
        );
        for packet in releases {
            self.ctx.queue.push_priority(WriterCmd::Packet(packet));
        }
        for packet in publishes {
            self.ctx.queue.push_data(WriterCmd::Packet(packet));
        }
    }

    async fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::ConnectAckReceived(ack) => {
                log::warn!(
                    "supervisor: unexpected CONNACK while connected: {:?}",
                    ack.reason_code()
                );
            }
            PipelineEvent::PingResponseReceived => {
                self.pingresp_deadline = None;
            }
            PipelineEvent::DisconnectReceived(disconnect) => {
                log::warn!(
                    "supervisor: server disconnected with {:?}",
                    disconnect.reason_code()
                );
                self.connection_lost(Error::broker_rejected(
                    disconnect.reason_code(),
                    "Connection",
                ))
                .await;
            }
            PipelineEvent::AuthReceived(auth) => self.handle_auth(&auth).await,
            PipelineEvent::ProtocolViolation {
                reason_code,
                message,
            } => {
                log::error!("supervisor: protocol violation: {message}");
                // Tell the server why before dropping the connection.
                self.ctx
                    .queue
                    .push_priority(WriterCmd::Packet(Packet::Disconnect(
                        DisconnectPacket::with_reason(reason_code),
                    )));
                self.flush_priority(Duration::from_secs(1)).await;
                self.connection_lost(Error::from_string(ErrorKind::ProtocolError, message))
                    .await;
            }
            PipelineEvent::TransportClosed(err) => {
                self.connection_lost(err).await;
            }
        }
    }

    async fn handle_auth(&mut self, auth: &AuthPacket) {
        let handler = self.ctx.auth_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            if let Some(response) = handler(auth) {
                self.ctx
                    .queue
                    .push_priority(WriterCmd::Packet(Packet::Auth(response)));
            }
            return;
        }

        if auth.reason_code() == ReasonCode::ContinueAuthentication {
            // Nobody can answer the challenge.
            self.ctx
                .queue
                .push_priority(WriterCmd::Packet(Packet::Disconnect(
                    DisconnectPacket::with_reason(ReasonCode::ProtocolError),
                )));
            self.flush_priority(Duration::from_secs(1)).await;
            self.connection_lost(Error::new(
                ErrorKind::ProtocolError,
                "AUTH challenge without an authentication hook",
            ))
            .await;
        }
    }

    /// The connection is gone. Decide between reconnecting and giving up.
    async fn connection_lost(&mut self, err: Error) {
        log::warn!("supervisor: connection lost: {err}");
        self.teardown();
        self.ctx
            .events
            .emit_with(EventKind::AfterDisconnect, || ClientEvent::AfterDisconnect);

        if self.user_disconnect || !self.options.reconnect().enabled {
            self.ctx.cancel_all("Connection lost");
            return;
        }

        let mut delay = self.options.reconnect().base_delay;
        loop {
            log::info!("supervisor: reconnecting in {delay:?}");
            let aborted = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                cmd = self.cmd_rx.recv() => self.handle_cmd_while_reconnecting(cmd),
            };
            if aborted {
                self.ctx.cancel_all("Disconnected by user");
                return;
            }
            delay = delay.saturating_mul(2).min(self.options.reconnect().max_delay);

            match self.establish().await {
                Ok(result) => {
                    log::info!(
                        "supervisor: reconnected, session_present={}",
                        result.session_present
                    );
                    let session_present = result.session_present;
                    let reason_code = result.reason_code;
                    self.ctx.events.emit_with(EventKind::AfterConnect, || {
                        ClientEvent::AfterConnect {
                            session_present,
                            reason_code,
                        }
                    });
                    return;
                }
                Err(err) => {
                    if err.kind() == ErrorKind::BrokerRejected {
                        log::error!("supervisor: server refuses the session: {err}");
                        self.ctx.cancel_all("Server refused reconnect");
                        return;
                    }
                    log::warn!("supervisor: reconnect attempt failed: {err}");
                }
            }
        }
    }

    /// Commands arriving while the supervisor waits out a backoff delay.
    /// Returns true when the reconnect loop must stop.
    fn handle_cmd_while_reconnecting(&mut self, cmd: Option<ClientCmd>) -> bool {
        match cmd {
            Some(ClientCmd::Disconnect { tx }) => {
                self.user_disconnect = true;
                let _ = tx.send(Ok(false));
                true
            }
            Some(ClientCmd::Connect { tx }) => {
                let _ = tx.send(Err(Error::new(
                    ErrorKind::ConfigError,
                    "Client is reconnecting",
                )));
                false
            }
            None => true,
        }
    }

    async fn handle_disconnect(&mut self, tx: oneshot::Sender<Result<bool, Error>>) {
        if self.phase != Phase::Connected {
            let _ = tx.send(Ok(false));
            return;
        }
        self.user_disconnect = true;
        self.phase = Phase::Disconnecting;
        self.ctx.set_connected(false);
        self.ctx
            .events
            .emit_with(EventKind::BeforeDisconnect, || ClientEvent::BeforeDisconnect);

        // Drain queued application traffic, then say goodbye.
        self.flush_data(self.options.response_timeout()).await;
        self.ctx
            .queue
            .push_priority(WriterCmd::Packet(Packet::Disconnect(
                DisconnectPacket::new(),
            )));
        self.flush_priority(self.options.response_timeout()).await;

        self.teardown();
        self.ctx.cancel_all("Disconnected by user");
        self.ctx
            .events
            .emit_with(EventKind::AfterDisconnect, || ClientEvent::AfterDisconnect);
        let _ = tx.send(Ok(true));
    }

    async fn flush_data(&self, window: Duration) {
        let (flush_tx, flush_rx) = oneshot::channel();
        self.ctx.queue.push_data(WriterCmd::Flush(flush_tx));
        if timeout(window, flush_rx).await.is_err() {
            log::warn!("supervisor: send queue drain timed out");
        }
    }

    async fn flush_priority(&self, window: Duration) {
        let (flush_tx, flush_rx) = oneshot::channel();
        self.ctx.queue.push_priority(WriterCmd::Flush(flush_tx));
        if timeout(window, flush_rx).await.is_err() {
            log::warn!("supervisor: control queue drain timed out");
        }
    }

    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.stop();
        }
        self.phase = Phase::Disconnected;
        self.pingresp_deadline = None;
        self.ctx.set_connected(false);
    }
}
