//! WebSocket transport over embassy-net TCP
//!
//! `WsClient` is the telemetry transport: it owns one TCP socket for the life
//! of the firmware, performs the HTTP upgrade on `connect`, and turns frames
//! into `TransportEvent`s on `poll`. `WsServerConnection` is the accepting
//! side used by the snapshot service.

use core::fmt::Write;
use core::net::Ipv4Addr;

use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, IpEndpoint};
use embassy_time::{Duration, Instant, with_timeout};
use embedded_websocket::{
    self as ws, WebSocketClient, WebSocketCloseStatusCode, WebSocketOptions,
    WebSocketReceiveMessageType, WebSocketSendMessageType, WebSocketServer,
};
use heapless::{Deque, String};
use log::{debug, info, warn};
use rand_core::RngCore;

use crate::MonitorError;
use crate::config;
use crate::state_machine::TransportEvent;
use crate::telemetry::InboundText;
use crate::traits::{TextSink, Transport};

/// Receive staging buffer for the client
pub const CLIENT_RX_LEN: usize = 1024;
/// Encoded frame buffer for the client, fits the largest outbound message
pub const CLIENT_FRAME_LEN: usize = 512;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(3);
const READ_POLL: Duration = Duration::from_millis(1);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(10);
const MAX_CONTROL_PAYLOAD: usize = 125;

/// What the heartbeat wants done this poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Idle,
    SendPing,
    /// Too many pings went unanswered
    Expired,
}

/// Ping/pong liveness check for an open session
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    max_misses: u8,
    last_ping: Instant,
    awaiting_pong: bool,
    misses: u8,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration, max_misses: u8) -> Self {
        Self {
            interval,
            timeout,
            max_misses,
            last_ping: Instant::from_ticks(0),
            awaiting_pong: false,
            misses: 0,
        }
    }

    pub fn from_config() -> Self {
        Self::new(
            Duration::from_millis(config::HEARTBEAT_INTERVAL_MS),
            Duration::from_millis(config::HEARTBEAT_TIMEOUT_MS),
            config::HEARTBEAT_MAX_MISSES,
        )
    }

    /// Restart the schedule for a fresh session
    pub fn reset(&mut self, now: Instant) {
        self.last_ping = now;
        self.awaiting_pong = false;
        self.misses = 0;
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
        self.misses = 0;
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatStatus {
        let since_ping = now.saturating_duration_since(self.last_ping);

        if self.awaiting_pong && since_ping >= self.timeout {
            self.awaiting_pong = false;
            self.misses += 1;
            warn!("[WS] Pong missing ({}/{})", self.misses, self.max_misses);
            if self.misses >= self.max_misses {
                return HeartbeatStatus::Expired;
            }
        }

        if !self.awaiting_pong && since_ping >= self.interval {
            self.last_ping = now;
            self.awaiting_pong = true;
            return HeartbeatStatus::SendPing;
        }

        HeartbeatStatus::Idle
    }
}

/// Remote listener address
#[derive(Debug, Clone)]
pub struct WsEndpoint {
    pub address: Ipv4Addr,
    pub port: u16,
    pub path: &'static str,
    host: String<24>,
}

impl WsEndpoint {
    pub fn new(host: &str, port: u16, path: &'static str) -> Result<Self, MonitorError> {
        let address: Ipv4Addr = host.parse().map_err(|_| MonitorError::ConfigError)?;

        let mut header = String::new();
        write!(header, "{}:{}", address, port).map_err(|_| MonitorError::ConfigError)?;

        Ok(Self {
            address,
            port,
            path,
            host: header,
        })
    }

    pub fn from_config() -> Result<Self, MonitorError> {
        Self::new(config::WS_HOST, config::WS_PORT, config::WS_PATH)
    }

    /// Value of the `Host` header
    pub fn host(&self) -> &str {
        &self.host
    }

    fn remote(&self) -> IpEndpoint {
        let [a, b, c, d] = self.address.octets();
        IpEndpoint::new(IpAddress::v4(a, b, c, d), self.port)
    }
}

async fn write_all(socket: &mut TcpSocket<'_>, mut data: &[u8]) -> Result<(), MonitorError> {
    while !data.is_empty() {
        let written = socket.write(data).await.map_err(|e| {
            warn!("[WS] Write error: {:?}", e);
            MonitorError::TransportError
        })?;
        if written == 0 {
            return Err(MonitorError::TransportError);
        }
        data = &data[written..];
    }
    Ok(())
}

fn inbound_text(payload: &[u8]) -> Option<InboundText> {
    let text = match core::str::from_utf8(payload) {
        Ok(text) => text,
        Err(_) => {
            warn!("[WS] Dropping non-UTF-8 text frame");
            return None;
        }
    };

    let mut message = InboundText::new();
    match message.push_str(text) {
        Ok(()) => Some(message),
        Err(()) => {
            warn!("[WS] Dropping {} byte text frame", payload.len());
            None
        }
    }
}

/// Telemetry WebSocket client
pub struct WsClient<'a, R: RngCore + Clone> {
    socket: TcpSocket<'a>,
    rng: R,
    ws: WebSocketClient<R>,
    endpoint: WsEndpoint,
    heartbeat: Heartbeat,
    events: Deque<TransportEvent, 4>,
    rx: [u8; CLIENT_RX_LEN],
    rx_len: usize,
    frame: [u8; CLIENT_FRAME_LEN],
    open: bool,
}

impl<'a, R: RngCore + Clone> WsClient<'a, R> {
    pub fn new(mut socket: TcpSocket<'a>, rng: R, endpoint: WsEndpoint) -> Self {
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        socket.set_keep_alive(Some(KEEP_ALIVE));

        Self {
            socket,
            ws: WebSocketClient::new_client(rng.clone()),
            rng,
            endpoint,
            heartbeat: Heartbeat::from_config(),
            events: Deque::new(),
            rx: [0; CLIENT_RX_LEN],
            rx_len: 0,
            frame: [0; CLIENT_FRAME_LEN],
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn push_event(&mut self, event: TransportEvent) {
        if let Err(event) = self.events.push_back(event) {
            warn!("[WS] Event queue full, dropping {:?}", event);
        }
    }

    fn consume(&mut self, len: usize) {
        self.rx.copy_within(len..self.rx_len, 0);
        self.rx_len -= len;
    }

    /// Abort the session after a local failure
    fn fail(&mut self) {
        self.open = false;
        self.rx_len = 0;
        self.socket.abort();
        self.push_event(TransportEvent::Error);
    }

    fn closed_by_peer(&mut self) {
        self.open = false;
        self.rx_len = 0;
        self.socket.close();
        self.push_event(TransportEvent::Disconnected);
    }

    async fn reset_socket(&mut self) {
        self.open = false;
        self.rx_len = 0;
        self.socket.abort();
        let _ = with_timeout(CLOSE_FLUSH_TIMEOUT, self.socket.flush()).await;
    }

    async fn handshake(&mut self) -> Result<(), MonitorError> {
        self.socket
            .connect(self.endpoint.remote())
            .await
            .map_err(|e| {
                warn!("[WS] TCP connect failed: {:?}", e);
                MonitorError::TransportError
            })?;

        self.ws = WebSocketClient::new_client(self.rng.clone());
        let options = WebSocketOptions {
            path: self.endpoint.path,
            host: self.endpoint.host(),
            origin: "",
            sub_protocols: None,
            additional_headers: None,
        };
        let (len, key) = self.ws.client_connect(&options, &mut self.frame).map_err(|e| {
            warn!("[WS] Failed to build upgrade request: {:?}", e);
            MonitorError::ProtocolError
        })?;
        write_all(&mut self.socket, &self.frame[..len]).await?;

        loop {
            if self.rx_len == self.rx.len() {
                return Err(MonitorError::ProtocolError);
            }
            let read = self
                .socket
                .read(&mut self.rx[self.rx_len..])
                .await
                .map_err(|_| MonitorError::TransportError)?;
            if read == 0 {
                return Err(MonitorError::TransportError);
            }
            self.rx_len += read;

            match self.ws.client_accept(&key, &self.rx[..self.rx_len]) {
                Ok((used, _)) => {
                    self.consume(used);
                    return Ok(());
                }
                Err(ws::Error::HttpHeaderIncomplete) => continue,
                Err(e) => {
                    warn!("[WS] Upgrade rejected: {:?}", e);
                    return Err(MonitorError::ProtocolError);
                }
            }
        }
    }

    async fn send_frame(
        &mut self,
        kind: WebSocketSendMessageType,
        payload: &[u8],
    ) -> Result<(), MonitorError> {
        let len = self
            .ws
            .write(kind, true, payload, &mut self.frame)
            .map_err(|e| {
                warn!("[WS] Frame encoding failed: {:?}", e);
                MonitorError::ProtocolError
            })?;

        match with_timeout(SEND_TIMEOUT, write_all(&mut self.socket, &self.frame[..len])).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.fail();
                Err(e)
            }
            Err(_) => {
                warn!("[WS] Send timed out");
                self.fail();
                Err(MonitorError::TransportError)
            }
        }
    }

    /// Echo a control frame whose payload sits in `frame[..len]`
    async fn reply_control(&mut self, kind: WebSocketSendMessageType, len: usize) {
        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        let len = len.min(MAX_CONTROL_PAYLOAD);
        payload[..len].copy_from_slice(&self.frame[..len]);
        let _ = self.send_frame(kind, &payload[..len]).await;
    }

    async fn drain_frames(&mut self) {
        while self.open && self.rx_len > 0 {
            let result = match self.ws.read(&self.rx[..self.rx_len], &mut self.frame) {
                Ok(result) => result,
                Err(ws::Error::ReadFrameIncomplete) => break,
                Err(e) => {
                    warn!("[WS] Bad frame: {:?}", e);
                    self.fail();
                    break;
                }
            };
            self.consume(result.len_from);

            match result.message_type {
                WebSocketReceiveMessageType::Text => {
                    if !result.end_of_message {
                        warn!("[WS] Dropping fragmented text frame");
                    } else if let Some(text) = inbound_text(&self.frame[..result.len_to]) {
                        self.push_event(TransportEvent::TextReceived(text));
                    }
                }
                WebSocketReceiveMessageType::Binary => {
                    debug!("[WS] Ignoring {} binary bytes", result.len_to);
                }
                WebSocketReceiveMessageType::Ping => {
                    self.reply_control(WebSocketSendMessageType::Pong, result.len_to)
                        .await;
                }
                WebSocketReceiveMessageType::Pong => self.heartbeat.on_pong(),
                WebSocketReceiveMessageType::CloseMustReply => {
                    info!("[WS] Server closed the session");
                    self.reply_control(WebSocketSendMessageType::CloseReply, result.len_to)
                        .await;
                    self.closed_by_peer();
                }
                WebSocketReceiveMessageType::CloseCompleted => self.closed_by_peer(),
            }
        }
    }

    async fn service(&mut self) {
        match self.heartbeat.poll(Instant::now()) {
            HeartbeatStatus::Idle => {}
            HeartbeatStatus::SendPing => {
                let _ = self.send_frame(WebSocketSendMessageType::Ping, &[]).await;
            }
            HeartbeatStatus::Expired => {
                warn!("[WS] Heartbeat lost, dropping session");
                self.fail();
                return;
            }
        }

        if !self.open {
            return;
        }
        if self.rx_len == self.rx.len() {
            warn!("[WS] Receive buffer overflow");
            self.fail();
            return;
        }

        match with_timeout(READ_POLL, self.socket.read(&mut self.rx[self.rx_len..])).await {
            Err(_) => {}
            Ok(Ok(0)) => {
                info!("[WS] Connection closed by server");
                self.closed_by_peer();
            }
            Ok(Ok(read)) => {
                self.rx_len += read;
                self.drain_frames().await;
            }
            Ok(Err(e)) => {
                warn!("[WS] Read error: {:?}", e);
                self.fail();
            }
        }
    }
}

impl<R: RngCore + Clone> TextSink for WsClient<'_, R> {
    async fn send_text(&mut self, text: &str) -> Result<(), MonitorError> {
        if !self.open {
            return Err(MonitorError::TransportError);
        }
        self.send_frame(WebSocketSendMessageType::Text, text.as_bytes()).await
    }
}

impl<R: RngCore + Clone> Transport for WsClient<'_, R> {
    async fn connect(&mut self) -> Result<(), MonitorError> {
        self.reset_socket().await;
        info!(
            "[WS] Connecting to ws://{}{}",
            self.endpoint.host(),
            self.endpoint.path
        );

        let result = match with_timeout(CONNECT_TIMEOUT, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::TransportError),
        };

        match result {
            Ok(()) => {
                info!("[WS] Connected");
                self.open = true;
                self.heartbeat.reset(Instant::now());
                self.push_event(TransportEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.reset_socket().await;
                self.push_event(TransportEvent::Error);
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        if !self.open {
            self.reset_socket().await;
            return;
        }

        info!("[WS] Closing session");
        if let Ok(len) = self
            .ws
            .close(WebSocketCloseStatusCode::NormalClosure, None, &mut self.frame)
        {
            let _ = with_timeout(SEND_TIMEOUT, write_all(&mut self.socket, &self.frame[..len])).await;
        }
        self.reset_socket().await;
        self.push_event(TransportEvent::Disconnected);
    }

    async fn poll(&mut self) -> Option<TransportEvent> {
        if self.events.is_empty() && self.open {
            self.service().await;
        }
        self.events.pop_front()
    }
}

/// Headers kept while parsing an upgrade request
const MAX_REQUEST_HEADERS: usize = 24;

/// `Sec-WebSocket-Key` of an HTTP upgrade request, `None` while the request
/// head is still incomplete
fn upgrade_key(request: &[u8]) -> Result<Option<ws::WebSocketKey>, MonitorError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(request) {
        Ok(httparse::Status::Partial) => return Ok(None),
        Ok(httparse::Status::Complete(_)) => {}
        Err(e) => {
            warn!("[WS] Malformed HTTP request: {:?}", e);
            return Err(MonitorError::ProtocolError);
        }
    }

    match ws::read_http_header(parsed.headers.iter().map(|h| (h.name, h.value))) {
        Ok(Some(context)) => Ok(Some(context.sec_websocket_key)),
        Ok(None) => {
            warn!("[WS] Plain HTTP request rejected");
            Err(MonitorError::ProtocolError)
        }
        Err(e) => {
            warn!("[WS] Bad upgrade request: {:?}", e);
            Err(MonitorError::ProtocolError)
        }
    }
}

/// Server side of an accepted WebSocket session
pub struct WsServerConnection<'s, 'a> {
    socket: &'s mut TcpSocket<'a>,
    ws: WebSocketServer,
    rx: &'s mut [u8],
    rx_len: usize,
    frame: &'s mut [u8],
}

impl<'s, 'a> WsServerConnection<'s, 'a> {
    /// Complete the HTTP upgrade on a freshly accepted socket. `frame` bounds
    /// the largest message this session can send.
    pub async fn accept(
        socket: &'s mut TcpSocket<'a>,
        rx: &'s mut [u8],
        frame: &'s mut [u8],
    ) -> Result<Self, MonitorError> {
        let mut len = 0;
        let key = loop {
            if len == rx.len() {
                return Err(MonitorError::ProtocolError);
            }
            let read = socket
                .read(&mut rx[len..])
                .await
                .map_err(|_| MonitorError::TransportError)?;
            if read == 0 {
                return Err(MonitorError::TransportError);
            }
            len += read;

            if let Some(key) = upgrade_key(&rx[..len])? {
                break key;
            }
        };

        let mut ws = WebSocketServer::new_server();
        let written = ws.server_accept(&key, None, frame).map_err(|e| {
            warn!("[WS] Failed to build upgrade response: {:?}", e);
            MonitorError::ProtocolError
        })?;
        write_all(socket, &frame[..written]).await?;

        Ok(Self {
            socket,
            ws,
            rx,
            rx_len: 0,
            frame,
        })
    }

    /// Next complete text message, or `None` once the peer has closed
    pub async fn next_text(&mut self) -> Result<Option<InboundText>, MonitorError> {
        loop {
            while self.rx_len > 0 {
                let result = match self.ws.read(&self.rx[..self.rx_len], &mut self.frame[..]) {
                    Ok(result) => result,
                    Err(ws::Error::ReadFrameIncomplete) => break,
                    Err(e) => {
                        warn!("[WS] Bad frame: {:?}", e);
                        return Err(MonitorError::ProtocolError);
                    }
                };
                self.rx.copy_within(result.len_from..self.rx_len, 0);
                self.rx_len -= result.len_from;

                match result.message_type {
                    WebSocketReceiveMessageType::Text if result.end_of_message => {
                        if let Some(text) = inbound_text(&self.frame[..result.len_to]) {
                            return Ok(Some(text));
                        }
                    }
                    WebSocketReceiveMessageType::Ping => {
                        self.reply_control(WebSocketSendMessageType::Pong, result.len_to)
                            .await?;
                    }
                    WebSocketReceiveMessageType::CloseMustReply => {
                        self.reply_control(WebSocketSendMessageType::CloseReply, result.len_to)
                            .await?;
                        return Ok(None);
                    }
                    WebSocketReceiveMessageType::CloseCompleted => return Ok(None),
                    _ => {}
                }
            }

            if self.rx_len == self.rx.len() {
                return Err(MonitorError::ProtocolError);
            }
            let read = self
                .socket
                .read(&mut self.rx[self.rx_len..])
                .await
                .map_err(|_| MonitorError::TransportError)?;
            if read == 0 {
                return Ok(None);
            }
            self.rx_len += read;
        }
    }

    async fn send_frame(
        &mut self,
        kind: WebSocketSendMessageType,
        payload: &[u8],
    ) -> Result<(), MonitorError> {
        let len = self
            .ws
            .write(kind, true, payload, &mut self.frame[..])
            .map_err(|_| MonitorError::ProtocolError)?;
        write_all(&mut *self.socket, &self.frame[..len]).await
    }

    async fn reply_control(
        &mut self,
        kind: WebSocketSendMessageType,
        len: usize,
    ) -> Result<(), MonitorError> {
        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        let len = len.min(MAX_CONTROL_PAYLOAD);
        payload[..len].copy_from_slice(&self.frame[..len]);
        self.send_frame(kind, &payload[..len]).await
    }
}

impl TextSink for WsServerConnection<'_, '_> {
    async fn send_text(&mut self, text: &str) -> Result<(), MonitorError> {
        self.send_frame(WebSocketSendMessageType::Text, text.as_bytes())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn heartbeat() -> Heartbeat {
        let mut heartbeat = Heartbeat::from_config();
        heartbeat.reset(at(0));
        heartbeat
    }

    #[test]
    fn pings_on_interval_while_answered() {
        let mut heartbeat = heartbeat();

        assert_eq!(heartbeat.poll(at(14_999)), HeartbeatStatus::Idle);
        assert_eq!(heartbeat.poll(at(15_000)), HeartbeatStatus::SendPing);
        assert_eq!(heartbeat.poll(at(16_000)), HeartbeatStatus::Idle);

        heartbeat.on_pong();
        assert_eq!(heartbeat.poll(at(29_999)), HeartbeatStatus::Idle);
        assert_eq!(heartbeat.poll(at(30_000)), HeartbeatStatus::SendPing);
    }

    #[test]
    fn expires_after_two_missed_pongs() {
        let mut heartbeat = heartbeat();

        assert_eq!(heartbeat.poll(at(15_000)), HeartbeatStatus::SendPing);
        // First miss is tolerated
        assert_eq!(heartbeat.poll(at(20_000)), HeartbeatStatus::Idle);
        assert_eq!(heartbeat.poll(at(30_000)), HeartbeatStatus::SendPing);
        assert_eq!(heartbeat.poll(at(35_000)), HeartbeatStatus::Expired);
    }

    #[test]
    fn late_pong_resets_miss_count() {
        let mut heartbeat = heartbeat();

        heartbeat.poll(at(15_000));
        heartbeat.poll(at(20_000));
        heartbeat.on_pong();
        assert_eq!(heartbeat.poll(at(30_000)), HeartbeatStatus::SendPing);
        assert_eq!(heartbeat.poll(at(35_000)), HeartbeatStatus::Idle);
    }

    #[test]
    fn endpoint_formats_host_header() {
        let endpoint = WsEndpoint::new("192.168.1.10", 8380, "/env").unwrap();

        assert_eq!(endpoint.host(), "192.168.1.10:8380");
        assert_eq!(endpoint.address, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(endpoint.path, "/env");
    }

    #[test]
    fn endpoint_requires_ipv4_literal() {
        assert_eq!(
            WsEndpoint::new("example.com", 80, "/").err(),
            Some(MonitorError::ConfigError)
        );
        assert!(WsEndpoint::new("", 80, "/").is_err());
    }

    #[test]
    fn inbound_text_limits() {
        assert_eq!(
            inbound_text(br#"{"type":"command"}"#).as_deref(),
            Some(r#"{"type":"command"}"#)
        );
        assert!(inbound_text(&[0xFF, 0xFE]).is_none());
        assert!(inbound_text(&[b'a'; 300]).is_none());
    }

    const UPGRADE_REQUEST: &[u8] = b"GET /camera HTTP/1.1\r\n\
Host: 192.168.1.42:81\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn upgrade_request_yields_key() {
        let key = upgrade_key(UPGRADE_REQUEST).unwrap();
        assert_eq!(key.as_deref(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[test]
    fn partial_upgrade_request_waits_for_more() {
        let head = UPGRADE_REQUEST.len() - 2;
        assert_eq!(upgrade_key(&UPGRADE_REQUEST[..head]), Ok(None));
        assert_eq!(upgrade_key(&UPGRADE_REQUEST[..20]), Ok(None));
    }

    #[test]
    fn plain_or_malformed_requests_are_rejected() {
        assert_eq!(
            upgrade_key(b"GET / HTTP/1.1\r\nHost: 192.168.1.42\r\n\r\n"),
            Err(MonitorError::ProtocolError)
        );
        assert_eq!(
            upgrade_key(b"\x16\x03\x01 not http\r\n\r\n"),
            Err(MonitorError::ProtocolError)
        );
    }
}
