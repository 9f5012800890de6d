//! The backend HTTP/2 session.
//!
//! One session per worker: a long-lived client-side HTTP/2 connection that
//! multiplexes every in-flight backend request for that worker. The session
//! owns the socket, the TLS state, the protocol engine, buffers, and timers;
//! downstream connections are registered into an arena and notified through
//! their [`Upstream`] capabilities.
//!
//! Control flow is event-driven: all externally visible work is kicked off
//! by `signal_write` and performed by the worker's pre-poll hook, socket
//! watchers, and timers.

use crate::buffer::ByteBuffer;
use crate::config::Config;
use crate::downstream::{self, Downstream, MAX_HEADERS_SUM, ResponseState};
use crate::metrics;
use crate::reactor::{Event, Reactor, TimerId};
use crate::transport::{Handshake, ReadMode, TlsContext, Transport, WriteMode};
use crate::tunnel::{ProxyTunnel, TunnelStatus};
use crate::upstream::Upstream;

use ahash::AHashMap;
use bytes::Bytes;
use http2::frame::{
    CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, ErrorCode, Priority, Setting, SettingId,
};
use http2::hpack::HeaderField;
use http2::session::{
    BodyProvider, CallbackError, CallbackResult, ClientSession, FrameEvent, HeadersCategory,
    SessionCore, SessionHandler, SessionOptions,
};
use slab::Slab;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Socket staging buffer capacity (each direction).
const BUF_SIZE: usize = 32_768;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    ProxyConnecting,
    ProxyConnected,
    ProxyFailed,
    Connecting,
    ConnectFailing,
    Connected,
}

/// PING-based liveness probe state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    None,
    Required,
    Started,
}

/// Handle to a registered downstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DconnId(usize);

/// Application-level read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppRead {
    Noop,
    /// Parse the proxy's CONNECT response.
    Tunnel,
    /// Feed the HTTP/2 engine.
    Http2,
}

/// Application-level write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppWrite {
    Noop,
    /// Emit the CONNECT request.
    TunnelConnect,
    /// Drain the HTTP/2 engine.
    Http2,
}

/// A request waiting for the session to be able to carry it.
struct QueuedRequest {
    priority: Option<Priority>,
    headers: Vec<HeaderField>,
    body: Option<Box<dyn BodyProvider>>,
}

/// One registered downstream connection.
struct DownstreamConn {
    downstream: Downstream,
    upstream: Box<dyn Upstream>,
    queued: Option<QueuedRequest>,
}

/// Engine-stream record; owned by the session's stream set.
struct StreamData {
    dconn: Option<usize>,
}

/// Downstream/stream bookkeeping plus the protocol callback surface.
///
/// Split from the session proper so the engine can borrow it mutably as
/// the [`SessionHandler`] while the session owns the engine.
#[derive(Default)]
struct AppState {
    dconns: Slab<DownstreamConn>,
    streams: AHashMap<u32, StreamData>,
    /// Timer commands recorded by callbacks; the session applies them
    /// once the engine call returns.
    start_settings_timer: bool,
    stop_settings_timer: bool,
}

impl AppState {
    /// Resolve a stream id to its downstream arena index, verifying the
    /// back-association both ways.
    fn dconn_of_stream(&self, stream_id: u32) -> Option<usize> {
        let sd = self.streams.get(&stream_id)?;
        let idx = sd.dconn?;
        let entry = self.dconns.get(idx)?;
        (entry.downstream.stream_id() == Some(stream_id)).then_some(idx)
    }

    /// Flush pending response state toward the client. The upstream may
    /// declare the client handler dead, which destroys the registration;
    /// callers must not touch the downstream afterwards.
    fn call_downstream_read(&mut self, idx: usize) {
        let Some(entry) = self.dconns.get_mut(idx) else {
            return;
        };
        if entry.upstream.on_downstream_read(&mut entry.downstream).is_err() {
            debug!("client handler gone; destroying downstream connection");
            if let Some(entry) = self.dconns.try_remove(idx) {
                if let Some(stream_id) = entry.downstream.stream_id() {
                    if let Some(sd) = self.streams.get_mut(&stream_id) {
                        sd.dconn = None;
                    }
                }
            }
        }
    }

    /// Deliver final response headers (or an interim 1xx) upstream.
    fn on_response_headers(
        &mut self,
        idx: usize,
        stream_id: u32,
        core: &mut SessionCore,
    ) -> CallbackResult {
        let Some(entry) = self.dconns.get_mut(idx) else {
            return Ok(());
        };

        entry.downstream.set_expect_final_response(false);

        let status = entry
            .downstream
            .response_headers()
            .iter()
            .find(|field| field.name == b":status")
            .and_then(|field| downstream::parse_status(&field.value));

        let Some(status) = status else {
            core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
            metrics::STREAMS_RESET.increment();
            entry.downstream.set_response_state(ResponseState::MsgReset);
            self.call_downstream_read(idx);
            return Ok(());
        };
        entry.downstream.set_status(status);

        if entry.downstream.non_final_response() {
            debug!(stream_id, status, "non-final response");
            entry.downstream.set_expect_final_response(true);
            if entry
                .upstream
                .on_downstream_header_complete(&mut entry.downstream)
                .is_err()
            {
                core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
                metrics::STREAMS_RESET.increment();
                entry.downstream.set_response_state(ResponseState::MsgReset);
            }
            // Interim headers are erased before the final block arrives.
            entry.downstream.clear_response_headers();
            return Ok(());
        }

        if entry.downstream.content_length().is_none()
            && entry.downstream.expect_response_body()
            && !entry.downstream.request_is_connect()
        {
            // Body with unknown length: the upstream side re-frames it
            // with chunked encoding toward HTTP/1 clients.
            entry.downstream.set_chunked(true);
        }

        entry
            .downstream
            .set_response_state(ResponseState::HeaderComplete);
        entry.downstream.check_upgrade_fulfilled();

        if entry
            .upstream
            .on_downstream_header_complete(&mut entry.downstream)
            .is_err()
        {
            core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
            metrics::STREAMS_RESET.increment();
            entry.downstream.set_response_state(ResponseState::MsgReset);
        }
        Ok(())
    }

    /// Shared END_STREAM bookkeeping for HEADERS and DATA frames.
    fn finish_response(&mut self, idx: usize) {
        let Some(entry) = self.dconns.get_mut(idx) else {
            return;
        };
        entry.downstream.disable_read_timer();
        if entry.downstream.response_state() == ResponseState::HeaderComplete {
            entry.downstream.set_response_state(ResponseState::MsgComplete);
            metrics::BACKEND_RESPONSES.increment();
            if entry
                .upstream
                .on_downstream_body_complete(&mut entry.downstream)
                .is_err()
            {
                entry.downstream.set_response_state(ResponseState::MsgReset);
            }
        }
    }
}

impl SessionHandler for AppState {
    fn on_begin_headers(
        &mut self,
        stream_id: u32,
        category: HeadersCategory,
        core: &mut SessionCore,
    ) -> CallbackResult {
        if category != HeadersCategory::Response {
            return Ok(());
        }
        if self.dconn_of_stream(stream_id).is_none() {
            core.submit_rst_stream(stream_id, ErrorCode::InternalError);
        }
        Ok(())
    }

    fn on_header(
        &mut self,
        stream_id: u32,
        category: HeadersCategory,
        field: &HeaderField,
        core: &mut SessionCore,
    ) -> CallbackResult {
        let Some(idx) = self.dconn_of_stream(stream_id) else {
            return Ok(());
        };
        let Some(entry) = self.dconns.get_mut(idx) else {
            return Ok(());
        };

        match category {
            HeadersCategory::Response => {}
            HeadersCategory::Trailers if entry.downstream.expect_final_response() => {}
            _ => return Ok(()),
        }

        if entry.downstream.response_headers_sum() > MAX_HEADERS_SUM {
            debug!(
                stream_id,
                sum = entry.downstream.response_headers_sum(),
                "too large header block"
            );
            return Err(CallbackError::Temporal);
        }

        if !downstream::valid_header_field(&field.name, &field.value) {
            return Ok(());
        }

        if field.name.first() == Some(&b':')
            && !downstream::response_pseudo_header_allowed(&field.name)
        {
            core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
            metrics::STREAMS_RESET.increment();
            return Err(CallbackError::Temporal);
        }

        if downstream::is_connection_specific(&field.name) {
            core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
            metrics::STREAMS_RESET.increment();
            return Err(CallbackError::Temporal);
        }

        if field.name == b"content-length" {
            let parsed = downstream::parse_content_length(&field.value);
            let duplicate = entry.downstream.content_length().is_some();
            match parsed {
                Some(len) if !duplicate => entry.downstream.set_content_length(len),
                _ => {
                    core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
                    metrics::STREAMS_RESET.increment();
                    entry
                        .downstream
                        .set_response_state(ResponseState::MsgBadHeader);
                    return Err(CallbackError::Temporal);
                }
            }
        }

        entry.downstream.add_response_header(field.clone());
        Ok(())
    }

    fn on_frame_recv(&mut self, event: &FrameEvent, core: &mut SessionCore) -> CallbackResult {
        match *event {
            FrameEvent::Data {
                stream_id,
                end_stream,
            } => {
                // Chunks were delivered by on_data_chunk.
                if !end_stream {
                    return Ok(());
                }
                let Some(idx) = self.dconn_of_stream(stream_id) else {
                    return Ok(());
                };
                self.finish_response(idx);
                self.call_downstream_read(idx);
            }
            FrameEvent::Headers {
                stream_id,
                category,
                end_stream,
            } => {
                let Some(idx) = self.dconn_of_stream(stream_id) else {
                    return Ok(());
                };
                match category {
                    HeadersCategory::Response => {
                        self.on_response_headers(idx, stream_id, core)?;
                    }
                    HeadersCategory::Trailers => {
                        let expecting = self
                            .dconns
                            .get(idx)
                            .is_some_and(|entry| entry.downstream.expect_final_response());
                        if expecting {
                            self.on_response_headers(idx, stream_id, core)?;
                        } else if !end_stream {
                            // Trailers must end the stream.
                            core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
                            metrics::STREAMS_RESET.increment();
                            return Ok(());
                        }
                    }
                    _ => {}
                }
                if end_stream {
                    self.finish_response(idx);
                } else if let Some(entry) = self.dconns.get_mut(idx) {
                    entry.downstream.reset_read_timer();
                }
                // May destroy the downstream connection.
                self.call_downstream_read(idx);
            }
            FrameEvent::RstStream {
                stream_id,
                error_code,
            } => {
                if let Some(idx) = self.dconn_of_stream(stream_id) {
                    if let Some(entry) = self.dconns.get_mut(idx) {
                        entry.downstream.set_peer_reset_code(error_code);
                    }
                    self.call_downstream_read(idx);
                }
            }
            FrameEvent::Settings { ack } => {
                if ack {
                    self.stop_settings_timer = true;
                }
            }
            FrameEvent::PushPromise {
                stream_id,
                promised_stream_id,
            } => {
                debug!(
                    stream_id,
                    promised_stream_id, "received downstream PUSH_PROMISE"
                );
                // We never enable push; refuse the promised stream.
                core.submit_rst_stream(promised_stream_id, ErrorCode::RefusedStream);
                metrics::STREAMS_RESET.increment();
            }
            FrameEvent::GoAway {
                last_stream_id,
                error_code,
            } => {
                debug!(last_stream_id, %error_code, "received GOAWAY");
            }
            _ => {}
        }
        Ok(())
    }

    fn on_data_chunk(
        &mut self,
        stream_id: u32,
        data: &[u8],
        end_stream: bool,
        core: &mut SessionCore,
    ) -> CallbackResult {
        let Some(idx) = self.dconn_of_stream(stream_id) else {
            core.submit_rst_stream(stream_id, ErrorCode::InternalError);
            core.consume(stream_id, data.len());
            return Ok(());
        };
        let Some(entry) = self.dconns.get_mut(idx) else {
            return Ok(());
        };

        if !entry.downstream.expect_response_body() {
            core.submit_rst_stream(stream_id, ErrorCode::InternalError);
            metrics::STREAMS_RESET.increment();
            core.consume(stream_id, data.len());
            return Ok(());
        }

        // DATA after a non-final response is illegal in HTTP.
        if entry.downstream.non_final_response() {
            core.submit_rst_stream(stream_id, ErrorCode::ProtocolError);
            metrics::STREAMS_RESET.increment();
            core.consume(stream_id, data.len());
            return Ok(());
        }

        entry.downstream.reset_read_timer();
        entry.downstream.add_response_body_len(data.len());

        if entry
            .upstream
            .on_downstream_body(&mut entry.downstream, data, end_stream)
            .is_err()
        {
            core.submit_rst_stream(stream_id, ErrorCode::InternalError);
            metrics::STREAMS_RESET.increment();
            core.consume(stream_id, data.len());
            entry.downstream.set_response_state(ResponseState::MsgReset);
        } else {
            core.consume(stream_id, data.len());
        }

        self.call_downstream_read(idx);
        Ok(())
    }

    fn on_frame_send(&mut self, event: &FrameEvent, _core: &mut SessionCore) -> CallbackResult {
        match *event {
            FrameEvent::Data {
                stream_id,
                end_stream: true,
            }
            | FrameEvent::Headers {
                stream_id,
                end_stream: true,
                ..
            } => {
                if let Some(idx) = self.dconn_of_stream(stream_id) {
                    if let Some(entry) = self.dconns.get_mut(idx) {
                        entry.downstream.reset_read_timer();
                    }
                }
            }
            FrameEvent::Settings { ack: false } => {
                self.start_settings_timer = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_frame_not_send(&mut self, event: &FrameEvent, _core: &mut SessionCore) -> CallbackResult {
        if let FrameEvent::Headers {
            stream_id,
            category: HeadersCategory::Request,
            ..
        } = *event
        {
            warn!(stream_id, "failed to send request HEADERS");
            // Flag the reset and drop the stream record so the request
            // cannot hang around.
            if let Some(idx) = self.dconn_of_stream(stream_id) {
                if let Some(entry) = self.dconns.get_mut(idx) {
                    entry.downstream.set_response_state(ResponseState::MsgReset);
                }
                self.call_downstream_read(idx);
            }
            self.streams.remove(&stream_id);
        }
        Ok(())
    }

    fn on_stream_close(
        &mut self,
        stream_id: u32,
        error_code: ErrorCode,
        _core: &mut SessionCore,
    ) -> CallbackResult {
        trace!(stream_id, %error_code, "stream is being closed");
        let Some(sd) = self.streams.get(&stream_id) else {
            // Closed before we ever tracked it (e.g. refused push).
            return Ok(());
        };

        if let Some(idx) = sd.dconn {
            if let Some(entry) = self.dconns.get_mut(idx) {
                if entry.downstream.stream_id() == Some(stream_id) {
                    if entry.downstream.upgraded()
                        && entry.downstream.response_state() == ResponseState::HeaderComplete
                    {
                        // Tunneled exchange: the body ends when the stream
                        // does; the upstream forwards the reset after it.
                        let _ = entry
                            .upstream
                            .on_downstream_body_complete(&mut entry.downstream);
                        entry
                            .downstream
                            .set_response_state(ResponseState::MsgComplete);
                    } else if error_code == ErrorCode::NoError {
                        match entry.downstream.response_state() {
                            ResponseState::MsgComplete | ResponseState::MsgBadHeader => {}
                            _ => entry
                                .downstream
                                .set_response_state(ResponseState::MsgReset),
                        }
                    } else if entry.downstream.response_state() != ResponseState::MsgBadHeader {
                        entry.downstream.set_response_state(ResponseState::MsgReset);
                    }
                    self.call_downstream_read(idx);
                    // The downstream connection may be gone here.
                }
            }
        }

        self.streams.remove(&stream_id);
        Ok(())
    }
}

/// The session.
pub struct Http2Session {
    config: Arc<Config>,
    tls_ctx: Option<TlsContext>,

    state: SessionState,
    health: HealthState,

    transport: Transport,
    read_mode: ReadMode,
    write_mode: WriteMode,
    app_read: AppRead,
    app_write: AppWrite,
    /// Read watcher wanted while the connection is up.
    watch_read: bool,

    engine: Option<ClientSession>,
    apps: AppState,

    rb: ByteBuffer,
    wb: ByteBuffer,
    /// Partial engine frame that did not fit the write buffer.
    pending: Option<(Bytes, usize)>,

    write_requested: bool,
    flow_control: bool,

    tunnel: Option<ProxyTunnel>,

    rt: TimerId,
    wt: TimerId,
    settings_timer: TimerId,
    connchk_timer: TimerId,
}

impl Http2Session {
    pub fn new(config: Arc<Config>, reactor: &mut Reactor) -> io::Result<Self> {
        let tls_ctx = TlsContext::new(&config.backend, config.sni_name())?;
        let rt = reactor.add_timer(config.read_timeout());
        let wt = reactor.add_timer(config.write_timeout());
        let settings_timer = reactor.add_timer(config.settings_timeout());
        let connchk_timer = reactor.add_timer(config.health_check_interval());

        Ok(Self {
            config,
            tls_ctx,
            state: SessionState::Disconnected,
            health: HealthState::None,
            transport: Transport::default(),
            read_mode: ReadMode::Noop,
            write_mode: WriteMode::Noop,
            app_read: AppRead::Noop,
            app_write: AppWrite::Noop,
            watch_read: false,
            engine: None,
            apps: AppState::default(),
            rb: ByteBuffer::new(BUF_SIZE),
            wb: ByteBuffer::new(BUF_SIZE),
            pending: None,
            write_requested: false,
            flow_control: false,
            tunnel: None,
            rt,
            wt,
            settings_timer,
            connchk_timer,
        })
    }

    // -- public surface --

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn health(&self) -> HealthState {
        self.health
    }

    /// Mark that the session has work to write; the worker's pre-poll
    /// hook performs exactly one dispatch per loop turn.
    pub fn signal_write(&mut self) {
        self.write_requested = true;
    }

    pub fn write_requested(&self) -> bool {
        self.write_requested
    }

    pub fn can_push_request(&self) -> bool {
        self.state == SessionState::Connected && self.health == HealthState::None
    }

    /// Flow control is enabled for the lifetime of the protocol engine.
    pub fn flow_control(&self) -> bool {
        self.flow_control
    }

    /// A failure in the current state means retrying on this session is
    /// pointless.
    pub fn should_hard_fail(&self) -> bool {
        matches!(
            self.state,
            SessionState::ProxyConnecting
                | SessionState::ProxyFailed
                | SessionState::Connecting
                | SessionState::ConnectFailing
        )
    }

    /// Register a downstream connection, initially pending.
    pub fn attach_downstream(&mut self, upstream: Box<dyn Upstream>) -> DconnId {
        DconnId(self.apps.dconns.insert(DownstreamConn {
            downstream: Downstream::new(),
            upstream,
            queued: None,
        }))
    }

    /// Unregister a downstream connection, detaching any stream record
    /// and resetting its stream on the wire.
    pub fn detach_downstream(&mut self, id: DconnId) {
        let Some(entry) = self.apps.dconns.try_remove(id.0) else {
            return;
        };
        if let Some(stream_id) = entry.downstream.stream_id() {
            self.apps.streams.remove(&stream_id);
            if self.state == SessionState::Connected {
                if let Some(engine) = self.engine.as_mut() {
                    engine.submit_rst_stream(stream_id, ErrorCode::Cancel);
                    metrics::STREAMS_RESET.increment();
                    self.signal_write();
                }
            }
        }
    }

    pub fn downstream(&self, id: DconnId) -> Option<&Downstream> {
        self.apps.dconns.get(id.0).map(|entry| &entry.downstream)
    }

    pub fn downstream_mut(&mut self, id: DconnId) -> Option<&mut Downstream> {
        self.apps
            .dconns
            .get_mut(id.0)
            .map(|entry| &mut entry.downstream)
    }

    /// Number of registered downstream connections.
    pub fn downstream_count(&self) -> usize {
        self.apps.dconns.len()
    }

    /// Number of live stream records.
    pub fn stream_count(&self) -> usize {
        self.apps.streams.len()
    }

    /// Queue a request on a registered downstream connection and push it
    /// onto the wire when the session can carry it.
    pub fn submit_request(
        &mut self,
        id: DconnId,
        priority: Option<Priority>,
        headers: Vec<HeaderField>,
        body: Option<Box<dyn BodyProvider>>,
    ) -> io::Result<()> {
        let Some(entry) = self.apps.dconns.get_mut(id.0) else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        if let Some(method) = headers.iter().find(|field| field.name == b":method") {
            entry.downstream.note_request_method(&method.value);
        }
        entry.queued = Some(QueuedRequest {
            priority,
            headers,
            body,
        });
        metrics::BACKEND_REQUESTS.increment();

        if self.state == SessionState::Connected {
            if self.can_push_request() {
                if let Err(e) = self.push_request(id.0) {
                    if let Some(entry) = self.apps.dconns.get_mut(id.0) {
                        entry
                            .upstream
                            .on_downstream_abort_request(&mut entry.downstream, 400);
                    }
                    self.signal_write();
                    return Err(e);
                }
            } else {
                self.start_checking_connection();
            }
        }

        self.signal_write();
        Ok(())
    }

    /// Best-effort stream reset.
    pub fn submit_rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> io::Result<()> {
        if self.state != SessionState::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let Some(engine) = self.engine.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        debug!(stream_id, %error_code, "RST_STREAM");
        engine.submit_rst_stream(stream_id, error_code);
        metrics::STREAMS_RESET.increment();
        self.signal_write();
        Ok(())
    }

    /// Reprioritize the stream carrying this downstream connection.
    pub fn submit_priority(&mut self, id: DconnId, priority: Priority) -> io::Result<()> {
        if self.state != SessionState::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let Some(stream_id) = self
            .apps
            .dconns
            .get(id.0)
            .and_then(|entry| entry.downstream.stream_id())
        else {
            return Ok(());
        };
        if let Some(engine) = self.engine.as_mut() {
            engine.submit_priority(stream_id, priority);
            self.signal_write();
        }
        Ok(())
    }

    /// Wake a deferred request body.
    pub fn resume_data(&mut self, id: DconnId) -> io::Result<()> {
        if self.state != SessionState::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let Some(stream_id) = self
            .apps
            .dconns
            .get(id.0)
            .and_then(|entry| entry.downstream.stream_id())
        else {
            return Ok(());
        };
        if let Some(engine) = self.engine.as_mut() {
            engine.resume_data(stream_id);
            self.signal_write();
        }
        Ok(())
    }

    /// Return receive flow-control credit after the upstream side has
    /// dealt with body bytes.
    pub fn consume(&mut self, stream_id: u32, len: usize) -> io::Result<()> {
        if let Some(engine) = self.engine.as_mut() {
            engine.consume(stream_id, len);
            self.signal_write();
        }
        Ok(())
    }

    /// Begin a graceful GOAWAY teardown.
    pub fn terminate_session(&mut self, error_code: ErrorCode) -> io::Result<()> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        engine.terminate(error_code);
        self.signal_write();
        Ok(())
    }

    /// Kick off a PING probe if one is required.
    pub fn start_checking_connection(&mut self) {
        if self.state != SessionState::Connected || self.health != HealthState::Required {
            return;
        }
        self.health = HealthState::Started;
        info!("start checking connection");
        if let Some(engine) = self.engine.as_mut() {
            engine.submit_ping();
        }
        metrics::HEALTH_CHECKS.increment();
        self.signal_write();
    }

    // -- worker entry points --

    /// Pre-poll write scheduler: exactly one dispatch per loop turn no
    /// matter how many `signal_write` calls occurred.
    pub fn prepare(&mut self, reactor: &mut Reactor) {
        if !self.write_requested {
            return;
        }
        self.write_requested = false;
        match self.state {
            SessionState::Disconnected => {
                info!("write scheduler starting connect");
                if let Err(e) = self.initiate_connection(reactor) {
                    error!(error = %e, "could not initiate backend connection");
                    self.disconnect(reactor, true);
                }
            }
            SessionState::Connected => {
                reactor.timer_again(self.connchk_timer);
                if let Err(e) = self.do_write(reactor) {
                    debug!(error = %e, "write failed");
                    self.disconnect(reactor, self.should_hard_fail());
                }
            }
            _ => {}
        }
    }

    /// Dispatch one reactor event.
    pub fn handle_event(&mut self, reactor: &mut Reactor, event: Event) {
        match event {
            Event::Readable => {
                self.connection_alive(reactor);
                if let Err(e) = self.do_read(reactor) {
                    debug!(error = %e, "read failed");
                    self.disconnect(reactor, self.should_hard_fail());
                }
            }
            Event::Writable => {
                self.write_requested = false;
                reactor.timer_again(self.connchk_timer);
                if let Err(e) = self.do_write(reactor) {
                    debug!(error = %e, "write failed");
                    self.disconnect(reactor, self.should_hard_fail());
                }
            }
            Event::Timer(id) => self.handle_timer(reactor, id),
        }
    }

    fn handle_timer(&mut self, reactor: &mut Reactor, id: TimerId) {
        if id == self.connchk_timer {
            info!("connection check required");
            reactor.timer_stop(self.connchk_timer);
            self.health = HealthState::Required;
        } else if id == self.settings_timer {
            reactor.timer_stop(self.settings_timer);
            info!("SETTINGS timeout");
            if self.terminate_session(ErrorCode::SettingsTimeout).is_err() {
                self.disconnect(reactor, self.should_hard_fail());
                return;
            }
            self.signal_write();
        } else if id == self.rt || id == self.wt {
            info!("timeout");
            self.disconnect(reactor, self.should_hard_fail());
        }
    }

    // -- connection lifecycle --

    /// Open the backend connection: directly, or through the configured
    /// HTTP proxy first.
    pub fn initiate_connection(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        if self.config.http_proxy.is_some() && self.state == SessionState::Disconnected {
            let addr = self.config.http_proxy.as_ref().map(|proxy| proxy.addr);
            let Some(addr) = addr else {
                return Err(io::ErrorKind::InvalidInput.into());
            };
            info!(%addr, "connecting to the proxy");
            let sock = Transport::connect(addr)?;
            self.transport.set_socket(sock);

            let sock = self
                .transport
                .socket_mut()
                .ok_or(io::ErrorKind::NotConnected)?;
            reactor.watch(sock, false, true)?;
            reactor.timer_again(self.wt);

            self.write_mode = WriteMode::Connecting;
            self.app_read = AppRead::Tunnel;
            self.app_write = AppWrite::TunnelConnect;
            self.tunnel = Some(ProxyTunnel::new());
            self.state = SessionState::ProxyConnecting;
            return Ok(());
        }

        if !matches!(
            self.state,
            SessionState::Disconnected | SessionState::ProxyConnected
        ) {
            return Err(io::Error::other("initiate_connection in invalid state"));
        }
        info!("connecting to downstream server");

        if self.state == SessionState::Disconnected {
            let sock = Transport::connect(self.config.backend_addr())?;
            self.transport.set_socket(sock);
        }

        if let Some(ctx) = self.tls_ctx.as_ref() {
            self.transport.start_tls(ctx)?;
        } else if self.state == SessionState::ProxyConnected {
            // Cleartext over an established tunnel: usable immediately.
            self.read_mode = ReadMode::Clear;
            self.write_mode = WriteMode::Clear;
            self.app_read = AppRead::Http2;
            self.app_write = AppWrite::Http2;
            if let Err(e) = self.on_connect(reactor) {
                self.state = SessionState::ConnectFailing;
                return Err(e);
            }
            self.watch_read = true;
            let sock = self
                .transport
                .socket_mut()
                .ok_or(io::ErrorKind::NotConnected)?;
            reactor.watch(sock, true, true)?;
            reactor.timer_again(self.rt);
            return Ok(());
        }

        self.app_read = AppRead::Http2;
        self.app_write = AppWrite::Http2;
        self.read_mode = ReadMode::Noop;
        self.write_mode = WriteMode::Connecting;
        self.state = SessionState::Connecting;

        let sock = self
            .transport
            .socket_mut()
            .ok_or(io::ErrorKind::NotConnected)?;
        reactor.watch(sock, self.watch_read, true)?;
        reactor.timer_again(self.wt);
        Ok(())
    }

    /// The non-blocking connect finished (socket became writable).
    fn connected(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        self.transport.check_connected()?;
        info!("connection established");

        self.watch_read = true;
        let sock = self
            .transport
            .socket_mut()
            .ok_or(io::ErrorKind::NotConnected)?;
        reactor.watch(sock, true, true)?;

        if self.transport.is_tls() {
            self.read_mode = ReadMode::TlsHandshake;
            self.write_mode = WriteMode::TlsHandshake;
            return self.do_write(reactor);
        }

        self.read_mode = ReadMode::Clear;
        self.write_mode = WriteMode::Clear;

        if self.state == SessionState::ProxyConnecting {
            // Emit the CONNECT request.
            return self.do_write(reactor);
        }

        if let Err(e) = self.on_connect(reactor) {
            self.state = SessionState::ConnectFailing;
            return Err(e);
        }
        Ok(())
    }

    /// Runs exactly once per CONNECTED entry: verify ALPN, build the
    /// protocol engine, advertise SETTINGS, write the preface, and flush
    /// pending requests.
    fn on_connect(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        self.state = SessionState::Connected;

        if self.transport.is_tls() {
            match self.transport.alpn() {
                Some(proto) if proto == b"h2" => {
                    debug!("negotiated next protocol: h2");
                }
                Some(proto) => {
                    error!(protocol = ?String::from_utf8_lossy(proto), "h2 is not negotiated");
                    return Err(io::Error::other("h2 is not negotiated"));
                }
                None => {
                    return Err(io::Error::other("no application protocol negotiated"));
                }
            }
        }

        let http2_config = &self.config.backend.http2;
        let mut engine = ClientSession::new(SessionOptions {
            padding: http2_config.padding,
        });

        self.flow_control = true;

        engine.submit_settings(&[
            Setting {
                id: SettingId::EnablePush,
                value: 0,
            },
            Setting {
                id: SettingId::MaxConcurrentStreams,
                value: http2_config.max_concurrent_streams,
            },
            Setting {
                id: SettingId::InitialWindowSize,
                value: (1u32 << http2_config.window_bits) - 1,
            },
        ]);

        if http2_config.connection_window_bits > 16 {
            let delta =
                (1u32 << http2_config.connection_window_bits) - 1 - DEFAULT_INITIAL_WINDOW_SIZE;
            engine.submit_window_update(0, delta);
        }

        let n = self.wb.write(CONNECTION_PREFACE);
        if n != CONNECTION_PREFACE.len() {
            error!("buffer is too small to send connection preface");
            return Err(io::Error::other("preface does not fit write buffer"));
        }

        let must_terminate = self.config.backend.tls && !self.transport.meets_http2_requirement();
        if must_terminate {
            warn!("negotiated TLS session does not satisfy the HTTP/2 requirement");
            engine.terminate(ErrorCode::InadequateSecurity);
            self.engine = Some(engine);
            self.signal_write();
            return Ok(());
        }

        self.engine = Some(engine);
        reactor.timer_again(self.connchk_timer);
        metrics::SESSIONS_CONNECTED.increment();

        // Submit requests queued while the session was down; failures
        // abort the corresponding client request.
        self.flush_queued_requests();
        self.signal_write();
        Ok(())
    }

    /// Submit the queued request of one downstream connection.
    fn push_request(&mut self, idx: usize) -> io::Result<()> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let Some(entry) = self.apps.dconns.get_mut(idx) else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        let Some(request) = entry.queued.take() else {
            return Ok(());
        };

        match engine.submit_request(request.priority, &request.headers, request.body) {
            Ok(stream_id) => {
                entry.downstream.set_stream_id(stream_id);
                self.apps
                    .streams
                    .insert(stream_id, StreamData { dconn: Some(idx) });
                trace!(stream_id, "request submitted");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "submit_request failed");
                Err(io::Error::other(e))
            }
        }
    }

    /// Push every queued request that is still waiting for the wire.
    fn flush_queued_requests(&mut self) {
        let waiting: Vec<usize> = self
            .apps
            .dconns
            .iter()
            .filter(|(_, entry)| {
                entry.queued.is_some()
                    && entry.downstream.response_state() == ResponseState::Initial
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in waiting {
            if self.push_request(idx).is_err() {
                info!("backend request failed");
                if let Some(entry) = self.apps.dconns.get_mut(idx) {
                    entry
                        .upstream
                        .on_downstream_abort_request(&mut entry.downstream, 400);
                }
            }
        }
    }

    /// Read or write activity: reset the health timer, and let received
    /// traffic resolve an outstanding health probe.
    fn connection_alive(&mut self, reactor: &mut Reactor) {
        reactor.timer_again(self.connchk_timer);
        if self.health == HealthState::None {
            return;
        }
        info!("connection alive");
        self.health = HealthState::None;
        self.flush_queued_requests();
    }

    // -- transport dispatch --

    fn do_read(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        match self.read_mode {
            ReadMode::Noop => Ok(()),
            ReadMode::TlsHandshake => self.tls_handshake(reactor),
            ReadMode::Clear => self.read_clear(reactor),
            ReadMode::Tls => self.read_tls(reactor),
        }
    }

    fn do_write(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        match self.write_mode {
            WriteMode::Noop => Ok(()),
            WriteMode::Connecting => self.connected(reactor),
            WriteMode::TlsHandshake => self.tls_handshake(reactor),
            WriteMode::Clear => self.write_clear(reactor),
            WriteMode::Tls => self.write_tls(reactor),
        }
    }

    fn on_read(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        match self.app_read {
            AppRead::Noop => Ok(()),
            AppRead::Tunnel => self.downstream_read_proxy(reactor),
            AppRead::Http2 => self.downstream_read(reactor),
        }
    }

    fn on_write(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        match self.app_write {
            AppWrite::Noop => Ok(()),
            AppWrite::TunnelConnect => self.downstream_connect_proxy(),
            AppWrite::Http2 => self.downstream_write(reactor),
        }
    }

    fn read_clear(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        reactor.timer_again(self.rt);
        loop {
            // Process buffered data before we can observe EOF.
            if self.rb.rleft() > 0 {
                self.on_read(reactor)?;
                if self.rb.rleft() > 0 {
                    return Ok(());
                }
            }
            self.rb.reset();
            match self.transport.recv_clear(&mut self.rb) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read_tls(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        reactor.timer_again(self.rt);
        loop {
            if self.rb.rleft() > 0 {
                self.on_read(reactor)?;
                if self.rb.rleft() > 0 {
                    return Ok(());
                }
            }
            self.rb.reset();
            match self.transport.recv_tls(&mut self.rb) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_clear(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        reactor.timer_again(self.rt);
        loop {
            if self.wb.rleft() > 0 {
                match self.transport.send_clear(&mut self.wb) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let sock = self
                            .transport
                            .socket_mut()
                            .ok_or(io::ErrorKind::NotConnected)?;
                        reactor.watch(sock, self.watch_read, true)?;
                        reactor.timer_again(self.wt);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            self.wb.reset();
            self.on_write(reactor)?;
            if self.wb.rleft() == 0 {
                break;
            }
        }

        let sock = self
            .transport
            .socket_mut()
            .ok_or(io::ErrorKind::NotConnected)?;
        reactor.watch(sock, self.watch_read, false)?;
        reactor.timer_stop(self.wt);
        Ok(())
    }

    fn write_tls(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        reactor.timer_again(self.rt);
        loop {
            if self.wb.rleft() > 0 {
                match self.transport.send_tls(&mut self.wb) {
                    Ok(()) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let sock = self
                            .transport
                            .socket_mut()
                            .ok_or(io::ErrorKind::NotConnected)?;
                        reactor.watch(sock, self.watch_read, true)?;
                        reactor.timer_again(self.wt);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            self.wb.reset();
            self.on_write(reactor)?;
            if self.wb.rleft() == 0 {
                break;
            }
        }

        let sock = self
            .transport
            .socket_mut()
            .ok_or(io::ErrorKind::NotConnected)?;
        reactor.watch(sock, self.watch_read, false)?;
        reactor.timer_stop(self.wt);
        Ok(())
    }

    fn tls_handshake(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        reactor.timer_again(self.rt);

        let progress = self.transport.handshake()?;
        let sock = self
            .transport
            .socket_mut()
            .ok_or(io::ErrorKind::NotConnected)?;
        match progress {
            Handshake::WantRead => {
                reactor.watch(sock, true, false)?;
                reactor.timer_stop(self.wt);
                Ok(())
            }
            Handshake::WantWrite => {
                reactor.watch(sock, true, true)?;
                reactor.timer_again(self.wt);
                Ok(())
            }
            Handshake::Done => {
                reactor.watch(sock, true, false)?;
                reactor.timer_stop(self.wt);
                info!("TLS handshake completed");

                self.read_mode = ReadMode::Tls;
                self.write_mode = WriteMode::Tls;

                if let Err(e) = self.on_connect(reactor) {
                    self.state = SessionState::ConnectFailing;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    // -- application read/write paths --

    /// Parse the proxy's CONNECT response.
    fn downstream_read_proxy(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        loop {
            let (status, n) = {
                let head = self.rb.head();
                if head.is_empty() {
                    break;
                }
                let Some(tunnel) = self.tunnel.as_mut() else {
                    return Err(io::ErrorKind::NotConnected.into());
                };
                (tunnel.feed(head)?, head.len())
            };
            self.rb.drain(n);

            match status {
                TunnelStatus::Pending => {}
                TunnelStatus::Established => {
                    info!("tunneling success");
                    self.state = SessionState::ProxyConnected;
                    // Re-enter connection setup over the tunnel.
                    self.initiate_connection(reactor)?;
                    break;
                }
                TunnelStatus::Refused(status) => {
                    warn!(status, "tunneling failed");
                    self.state = SessionState::ProxyFailed;
                    return Err(io::Error::other("proxy refused CONNECT"));
                }
            }
        }
        Ok(())
    }

    /// Write the CONNECT request toward the proxy.
    fn downstream_connect_proxy(&mut self) -> io::Result<()> {
        info!("connected to the proxy");
        let request = ProxyTunnel::connect_request(&self.config);
        debug!(request = %request, "HTTP proxy request headers");
        let n = self.wb.write(request.as_bytes());
        if n != request.len() {
            warn!("HTTP proxy request is too large");
            return Err(io::Error::other("CONNECT request does not fit buffer"));
        }
        self.app_write = AppWrite::Noop;
        self.signal_write();
        Ok(())
    }

    /// Feed buffered socket bytes to the protocol engine.
    fn downstream_read(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        loop {
            let n = {
                let head = self.rb.head();
                if head.is_empty() {
                    break;
                }
                let Some(engine) = self.engine.as_mut() else {
                    return Err(io::ErrorKind::NotConnected.into());
                };
                match engine.recv(head, &mut self.apps) {
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "http2 session receive failed");
                        return Err(io::Error::other(e));
                    }
                }
            };
            self.rb.drain(n);
        }

        self.apply_timer_commands(reactor);

        if self.session_drained() {
            info!("no more read/write for this HTTP2 session");
            return Err(io::Error::other("session drained"));
        }

        self.signal_write();
        Ok(())
    }

    /// Move engine frames into the write buffer, with partial-frame
    /// carryover when the buffer fills.
    fn downstream_write(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        if let Some((chunk, offset)) = self.pending.take() {
            let n = self.wb.write(&chunk[offset..]);
            if offset + n < chunk.len() {
                self.pending = Some((chunk, offset + n));
                return Ok(());
            }
        }

        loop {
            let chunk = {
                let Some(engine) = self.engine.as_mut() else {
                    return Err(io::ErrorKind::NotConnected.into());
                };
                match engine.send(&mut self.apps) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!(error = %e, "http2 session send failed");
                        return Err(io::Error::other(e));
                    }
                }
            };
            let Some(chunk) = chunk else {
                break;
            };
            let n = self.wb.write(&chunk);
            if n < chunk.len() {
                self.pending = Some((chunk, n));
                self.apply_timer_commands(reactor);
                return Ok(());
            }
        }

        self.apply_timer_commands(reactor);

        if self.session_drained() {
            info!("no more read/write for this session");
            return Err(io::Error::other("session drained"));
        }
        Ok(())
    }

    /// Settings-timer commands recorded by the protocol callbacks.
    fn apply_timer_commands(&mut self, reactor: &mut Reactor) {
        if self.apps.start_settings_timer {
            self.apps.start_settings_timer = false;
            reactor.timer_again(self.settings_timer);
        }
        if self.apps.stop_settings_timer {
            self.apps.stop_settings_timer = false;
            reactor.timer_stop(self.settings_timer);
        }
    }

    /// The engine neither wants reads nor has writes, and the write
    /// buffer is flushed: the session has run its course.
    fn session_drained(&self) -> bool {
        match self.engine.as_ref() {
            Some(engine) => {
                !engine.want_read() && !engine.want_write() && self.wb.rleft() == 0
            }
            None => false,
        }
    }

    /// Whether the SETTINGS timer is armed; true between SETTINGS send
    /// and SETTINGS ACK receipt.
    pub fn settings_timer_armed(&self, reactor: &Reactor) -> bool {
        reactor.timer_active(self.settings_timer)
    }

    // -- teardown --

    /// Idempotent teardown. Releases the engine, buffers, timers,
    /// watchers, TLS state, socket, and tunnel parser, then notifies
    /// every registered downstream with `on_downstream_reset(hard)`.
    pub fn disconnect(&mut self, reactor: &mut Reactor, hard: bool) {
        info!(hard, "disconnecting");
        if self.state == SessionState::Connected && self.engine.is_some() {
            metrics::SESSIONS_CONNECTED.decrement();
        }
        if self.transport.is_open() {
            metrics::SESSION_DISCONNECTS.increment();
        }

        self.engine = None;
        self.pending = None;

        let rb_len = self.rb.rleft();
        self.rb.drain(rb_len);
        self.rb.reset();
        let wb_len = self.wb.rleft();
        self.wb.drain(wb_len);
        self.wb.reset();

        reactor.timer_stop(self.settings_timer);
        reactor.timer_stop(self.connchk_timer);
        reactor.timer_stop(self.rt);
        reactor.timer_stop(self.wt);

        self.read_mode = ReadMode::Noop;
        self.write_mode = WriteMode::Noop;
        self.app_read = AppRead::Noop;
        self.app_write = AppWrite::Noop;
        self.watch_read = false;

        if let Some(sock) = self.transport.socket_mut() {
            reactor.forget(sock);
        }
        self.transport.close();
        self.tunnel = None;

        self.health = HealthState::None;
        self.state = SessionState::Disconnected;
        self.flow_control = false;
        self.write_requested = false;

        // Swap out both partitions before notifying: on_downstream_reset
        // may register new pending downstream connections against this
        // same session, which must land in fresh sets.
        let dconns = std::mem::take(&mut self.apps.dconns);
        let _streams = std::mem::take(&mut self.apps.streams);

        for (_, mut entry) in dconns {
            if entry
                .upstream
                .on_downstream_reset(&mut entry.downstream, hard)
                .is_err()
            {
                debug!("upstream cannot recover; client handler dropped");
            }
        }
    }
}
