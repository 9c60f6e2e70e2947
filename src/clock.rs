//! Wall clock synchronised over SNTP
//!
//! The device has no RTC backup, so local time is an SNTP sample anchored to
//! the monotonic `Instant` at which it was taken. Until a sync succeeds,
//! `timestamp` returns `None` and telemetry goes out without one.

use core::fmt::Write;
use core::net::Ipv4Addr;

use chrono::{DateTime, Datelike, Timelike};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use embassy_time::{Duration, Instant, with_timeout};
use log::{info, warn};

use crate::MonitorError;
use crate::telemetry::Timestamp;

pub const NTP_PORT: u16 = 123;
pub const NTP_PACKET_LEN: usize = 48;

/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const LOCAL_PORT: u16 = 50_123;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const ATTEMPTS: usize = 3;

/// Client request: LI = 0, VN = 3, Mode = 3 (client)
pub fn sntp_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x1B;
    packet
}

/// Extract the transmit timestamp of a server reply as Unix seconds
pub fn parse_sntp_response(packet: &[u8]) -> Result<u64, MonitorError> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(MonitorError::ProtocolError);
    }

    // Mode 4 (server) or 5 (broadcast)
    let mode = packet[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(MonitorError::ProtocolError);
    }

    // Stratum 0 is a kiss-o'-death packet
    if packet[1] == 0 {
        return Err(MonitorError::ProtocolError);
    }

    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
    seconds
        .checked_sub(NTP_UNIX_OFFSET)
        .ok_or(MonitorError::ProtocolError)
}

pub struct WallClock {
    offset_secs: i64,
    anchor: Option<(u64, Instant)>,
}

impl WallClock {
    /// `offset_secs` is added to UTC for display and telemetry
    pub fn new(offset_secs: i64) -> Self {
        Self {
            offset_secs,
            anchor: None,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn synchronize(&mut self, unix_secs: u64, now: Instant) {
        self.anchor = Some((unix_secs, now));
    }

    pub fn unix_time(&self, now: Instant) -> Option<u64> {
        self.anchor
            .map(|(secs, at)| secs + now.saturating_duration_since(at).as_secs())
    }

    /// Local time as `YYYY-MM-DD HH:MM:SS`
    pub fn timestamp(&self, now: Instant) -> Option<Timestamp> {
        let local = self.unix_time(now)? as i64 + self.offset_secs;
        let time = DateTime::from_timestamp(local, 0)?;

        let mut out = Timestamp::new();
        write!(
            out,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            time.year(),
            time.month(),
            time.day(),
            time.hour(),
            time.minute(),
            time.second()
        )
        .ok()?;
        Some(out)
    }
}

/// Query `server` once per attempt until a valid reply arrives
pub async fn sync_via_sntp(stack: Stack<'_>, server: Ipv4Addr) -> Result<u64, MonitorError> {
    let mut rx_buffer = [0; 128];
    let mut tx_buffer = [0; 128];
    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );

    socket.bind(LOCAL_PORT).map_err(|e| {
        warn!("[NTP] Failed to bind socket: {:?}", e);
        MonitorError::TransportError
    })?;

    let [a, b, c, d] = server.octets();
    let endpoint = IpEndpoint::new(IpAddress::v4(a, b, c, d), NTP_PORT);
    let request = sntp_request();

    for attempt in 1..=ATTEMPTS {
        if let Err(e) = socket.send_to(&request, endpoint).await {
            warn!("[NTP] Request {} failed: {:?}", attempt, e);
            continue;
        }

        let mut reply = [0u8; NTP_PACKET_LEN];
        match with_timeout(RESPONSE_TIMEOUT, socket.recv_from(&mut reply)).await {
            Ok(Ok((len, _))) => match parse_sntp_response(&reply[..len]) {
                Ok(unix) => {
                    info!("[NTP] Time synchronized: {}", unix);
                    return Ok(unix);
                }
                Err(_) => warn!("[NTP] Invalid reply ({} bytes)", len),
            },
            Ok(Err(e)) => warn!("[NTP] Receive error: {:?}", e),
            Err(_) => warn!("[NTP] Attempt {} timed out", attempt),
        }
    }

    Err(MonitorError::TransportError)
}
