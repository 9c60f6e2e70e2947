//! Camera snapshot service
//!
//! A peer opens a WebSocket session and sends the text command `capture`.
//! The reply is a JSON document split over several text messages: a header
//! that opens a base64 data URI, the image as base64 chunks of at most
//! `CHUNK_CHARS` characters, and a footer that closes the string and object.
//! The peer concatenates messages until it sees the footer.

use core::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use embassy_net::Stack;
use embassy_net::tcp::TcpSocket;
use embassy_time::{Duration, with_timeout};
use heapless::String;
use log::{info, warn};

use crate::MonitorError;
use crate::config;
use crate::traits::{FrameSource, TextSink};
use crate::ws::WsServerConnection;

pub const CAPTURE_COMMAND: &str = "capture";
pub const CHUNK_CHARS: usize = config::SNAPSHOT_CHUNK_CHARS;
/// Raw bytes per chunk; a multiple of 3 so only the last chunk carries padding
pub const CHUNK_BYTES: usize = CHUNK_CHARS / 4 * 3;
pub const FOOTER: &str = "\"}";

/// Largest frame the server session encodes: one chunk plus frame header
pub const SESSION_FRAME_LEN: usize = CHUNK_CHARS + 16;

const HEADER_CAPACITY: usize = 192;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub type Header = String<HEADER_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u16,
    pub height: u16,
    /// Driver pixel format code
    pub format: u8,
    pub camera_type: &'static str,
    /// MIME type used in the data URI
    pub mime: &'static str,
}

/// A captured image borrowed from the driver's frame buffer
pub struct Frame<'a> {
    pub info: FrameInfo,
    pub data: &'a [u8],
}

/// Opening fragment, up to and including the data URI prefix
pub fn header(info: &FrameInfo) -> Result<Header, MonitorError> {
    let mut out = Header::new();
    write!(
        out,
        "{{\"type\":\"camera\",\"format\":\"{}\",\"width\":{},\"height\":{},\"camera_type\":\"{}\",\"imageData\":\"data:{};base64,",
        info.format, info.width, info.height, info.camera_type, info.mime
    )
    .map_err(|_| MonitorError::ProtocolError)?;
    Ok(out)
}

/// Number of body fragments for `len` raw bytes
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_BYTES)
}

/// Send one frame as header, body chunks and footer
pub async fn send_snapshot<S: TextSink>(sink: &mut S, frame: &Frame<'_>) -> Result<(), MonitorError> {
    sink.send_text(&header(&frame.info)?).await?;

    let mut encoded = [0u8; CHUNK_CHARS];
    for chunk in frame.data.chunks(CHUNK_BYTES) {
        let len = STANDARD
            .encode_slice(chunk, &mut encoded)
            .map_err(|_| MonitorError::ProtocolError)?;
        let text = core::str::from_utf8(&encoded[..len]).map_err(|_| MonitorError::ProtocolError)?;
        sink.send_text(text).await?;
    }

    sink.send_text(FOOTER).await
}

/// React to one inbound text message. Returns whether a snapshot was sent.
pub async fn handle_command<S, F>(sink: &mut S, source: &mut F, command: &str) -> Result<bool, MonitorError>
where
    S: TextSink,
    F: FrameSource,
{
    if command.trim() != CAPTURE_COMMAND {
        info!("[CAMERA] Ignoring command: {}", command);
        return Ok(false);
    }

    info!("[CAMERA] Capturing frame");
    let result = match source.capture() {
        Ok(frame) => {
            info!(
                "[CAMERA] Captured {}x{}, {} bytes in {} chunks",
                frame.info.width,
                frame.info.height,
                frame.data.len(),
                chunk_count(frame.data.len())
            );
            send_snapshot(sink, &frame).await
        }
        Err(e) => {
            warn!("[CAMERA] Capture failed: {:?}", e);
            return Err(e);
        }
    };
    source.release();

    match result {
        Ok(()) => {
            info!("[CAMERA] Snapshot sent");
            Ok(true)
        }
        Err(e) => {
            warn!("[CAMERA] Snapshot send failed: {:?}", e);
            Err(e)
        }
    }
}

async fn run_session<F: FrameSource>(
    session: &mut WsServerConnection<'_, '_>,
    source: &mut F,
) -> Result<(), MonitorError> {
    while let Some(text) = session.next_text().await? {
        match handle_command(session, source, &text).await {
            Ok(_) | Err(MonitorError::CameraError) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Accept snapshot sessions on `port`, one peer at a time
pub async fn serve<F: FrameSource>(stack: Stack<'_>, port: u16, source: &mut F) -> ! {
    let mut rx_buffer = [0u8; 1024];
    let mut tx_buffer = [0u8; 4096];
    let mut ws_rx = [0u8; 512];
    let mut ws_frame = [0u8; SESSION_FRAME_LEN];

    info!("[CAMERA] Snapshot server listening on port {}", port);

    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(SOCKET_TIMEOUT));

        if let Err(e) = socket.accept(port).await {
            warn!("[CAMERA] Accept failed: {:?}", e);
            continue;
        }
        info!("[CAMERA] Client connected: {:?}", socket.remote_endpoint());

        match WsServerConnection::accept(&mut socket, &mut ws_rx, &mut ws_frame).await {
            Ok(mut session) => {
                if let Err(e) = run_session(&mut session, source).await {
                    warn!("[CAMERA] Session ended with error: {:?}", e);
                }
            }
            Err(e) => warn!("[CAMERA] Handshake failed: {:?}", e),
        }

        socket.close();
        let _ = with_timeout(CLOSE_TIMEOUT, socket.flush()).await;
        socket.abort();
        info!("[CAMERA] Client disconnected");
    }
}

/// Synthetic grayscale gradient, for boards without a camera attached
pub struct TestPattern<const N: usize> {
    info: FrameInfo,
    buffer: [u8; N],
    frame_count: u8,
}

impl<const N: usize> TestPattern<N> {
    pub fn new(width: u16, height: u16) -> Result<Self, MonitorError> {
        if width as usize * height as usize != N {
            return Err(MonitorError::ConfigError);
        }
        Ok(Self {
            info: FrameInfo {
                width,
                height,
                format: 0,
                camera_type: "PATTERN",
                mime: "image/raw",
            },
            buffer: [0; N],
            frame_count: 0,
        })
    }
}

impl<const N: usize> FrameSource for TestPattern<N> {
    fn capture(&mut self) -> Result<Frame<'_>, MonitorError> {
        let width = self.info.width as usize;
        for (i, pixel) in self.buffer.iter_mut().enumerate() {
            let (x, y) = (i % width, i / width);
            *pixel = (x + y) as u8 ^ self.frame_count;
        }
        self.frame_count = self.frame_count.wrapping_add(1);

        Ok(Frame {
            info: self.info,
            data: &self.buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use std::string::{String as StdString, ToString};
    use std::vec::Vec;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<StdString>,
        fail_after: Option<usize>,
    }

    impl TextSink for RecordingSink {
        async fn send_text(&mut self, text: &str) -> Result<(), MonitorError> {
            if self.fail_after == Some(self.sent.len()) {
                return Err(MonitorError::TransportError);
            }
            self.sent.push(text.to_string());
            Ok(())
        }
    }

    const OV7670: FrameInfo = FrameInfo {
        width: 160,
        height: 120,
        format: 0,
        camera_type: "OV7670",
        mime: "image/raw",
    };

    struct FakeCamera {
        data: Vec<u8>,
        fail: bool,
        released: usize,
    }

    impl FakeCamera {
        fn with_len(len: usize) -> Self {
            Self {
                data: (0..len).map(|i| (i * 7) as u8).collect(),
                fail: false,
                released: 0,
            }
        }
    }

    impl FrameSource for FakeCamera {
        fn capture(&mut self) -> Result<Frame<'_>, MonitorError> {
            if self.fail {
                return Err(MonitorError::CameraError);
            }
            Ok(Frame {
                info: OV7670,
                data: &self.data,
            })
        }

        fn release(&mut self) {
            self.released += 1;
        }
    }

    #[test]
    fn header_opens_data_uri() {
        assert_eq!(
            header(&OV7670).unwrap().as_str(),
            r#"{"type":"camera","format":"0","width":160,"height":120,"camera_type":"OV7670","imageData":"data:image/raw;base64,"#
        );
    }

    #[test]
    fn chunk_sizes() {
        assert_eq!(CHUNK_BYTES, 3000);
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(3000), 1);
        assert_eq!(chunk_count(3001), 2);
        assert_eq!(chunk_count(7000), 3);
    }

    #[test]
    fn capture_sends_header_chunks_and_footer() {
        let mut sink = RecordingSink::default();
        let mut camera = FakeCamera::with_len(7000);

        let sent = block_on(handle_command(&mut sink, &mut camera, "capture")).unwrap();

        assert!(sent);
        assert_eq!(camera.released, 1);
        assert_eq!(sink.sent.len(), 5);
        assert!(sink.sent[0].starts_with(r#"{"type":"camera""#));
        assert_eq!(sink.sent[1].len(), 4000);
        assert_eq!(sink.sent[2].len(), 4000);
        assert_eq!(sink.sent[3].len(), 1336);
        assert_eq!(sink.sent[4], FOOTER);

        let body: StdString = sink.sent[1..4].concat();
        let mut decoded = std::vec![0u8; 7000];
        let len = STANDARD.decode_slice(body.as_bytes(), &mut decoded).unwrap();
        assert_eq!(&decoded[..len], camera.data.as_slice());
    }

    #[test]
    fn other_commands_are_ignored() {
        let mut sink = RecordingSink::default();
        let mut camera = FakeCamera::with_len(100);

        let sent = block_on(handle_command(&mut sink, &mut camera, "status")).unwrap();

        assert!(!sent);
        assert!(sink.sent.is_empty());
        assert_eq!(camera.released, 0);
    }

    #[test]
    fn capture_failure_sends_nothing() {
        let mut sink = RecordingSink::default();
        let mut camera = FakeCamera::with_len(100);
        camera.fail = true;

        let result = block_on(handle_command(&mut sink, &mut camera, "capture"));

        assert_eq!(result, Err(MonitorError::CameraError));
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn send_failure_still_releases_frame() {
        let mut sink = RecordingSink {
            fail_after: Some(2),
            ..Default::default()
        };
        let mut camera = FakeCamera::with_len(7000);

        let result = block_on(handle_command(&mut sink, &mut camera, "capture"));

        assert_eq!(result, Err(MonitorError::TransportError));
        assert_eq!(sink.sent.len(), 2);
        assert_eq!(camera.released, 1);
    }

    #[test]
    fn test_pattern_matches_its_geometry() {
        assert!(TestPattern::<100>::new(10, 9).is_err());

        let mut pattern = TestPattern::<4800>::new(80, 60).unwrap();
        let first = pattern.capture().unwrap().data[81];
        let frame = pattern.capture().unwrap();

        assert_eq!(frame.info.width, 80);
        assert_eq!(frame.data.len(), 4800);
        assert_eq!(first, 2);
        assert_eq!(frame.data[81], 2 ^ 1);
    }
}
