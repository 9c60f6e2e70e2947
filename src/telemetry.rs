//! JSON telemetry and command messages
//!
//! Outbound: periodic/forced readings (`"type":"emit"`) and threshold
//! acknowledgements (`"type":"response"`). Inbound: threshold commands
//! (`{"type":"command","setThreshold":<number>}`).

use heapless::String;
use serde::{Deserialize, Serialize};

use crate::MonitorError;
use crate::config;

/// Encoded telemetry buffer size
pub const TELEMETRY_CAPACITY: usize = 256;

/// Encoded acknowledgement buffer size
pub const RESPONSE_CAPACITY: usize = 128;

/// Largest inbound text message accepted from the transport
pub const INBOUND_TEXT_CAPACITY: usize = 256;

pub type InboundText = String<INBOUND_TEXT_CAPACITY>;

/// Local time formatted as `YYYY-MM-DD HH:MM:SS`
pub type Timestamp = String<19>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    /// °C
    pub temperature: f32,
    /// %RH
    pub humidity: f32,
}

/// One sampling pass. `None` marks a failed sensor read.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading {
    pub climate: Option<Climate>,
    /// Light level, 0-100
    pub light: Option<u8>,
}

impl Reading {
    pub fn sensor_error(&self) -> bool {
        self.climate.is_none() || self.light.is_none()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.climate.map(|c| c.temperature)
    }
}

#[derive(Serialize)]
struct TelemetryMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    light: Option<u8>,
    alarm: bool,
    threshold: f32,
    sensor_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<&'a str>,
    r#type: &'static str,
}

/// Encode a reading. Failed fields are omitted and `sensor_error` is set,
/// never zero-filled.
pub fn encode_telemetry(
    reading: &Reading,
    alarm: bool,
    threshold: f32,
    timestamp: Option<&str>,
) -> Result<String<TELEMETRY_CAPACITY>, MonitorError> {
    let message = TelemetryMessage {
        temperature: reading.climate.map(|c| c.temperature),
        humidity: reading.climate.map(|c| c.humidity),
        light: reading.light,
        alarm,
        threshold,
        sensor_error: reading.sensor_error(),
        timestamp,
        r#type: "emit",
    };

    serde_json_core::to_string(&message).map_err(|_| MonitorError::ProtocolError)
}

#[derive(Serialize)]
struct CommandResponse {
    r#type: &'static str,
    status: &'static str,
    message: &'static str,
    #[serde(rename = "newThreshold")]
    new_threshold: f32,
}

/// Acknowledgement of an accepted threshold change
pub fn encode_threshold_ack(new_threshold: f32) -> Result<String<RESPONSE_CAPACITY>, MonitorError> {
    let response = CommandResponse {
        r#type: "response",
        status: "success",
        message: "Temperature threshold updated",
        new_threshold,
    };

    serde_json_core::to_string(&response).map_err(|_| MonitorError::ProtocolError)
}

#[derive(Deserialize)]
struct InboundMessage<'a> {
    #[serde(borrow)]
    r#type: Option<&'a str>,
    #[serde(rename = "setThreshold")]
    set_threshold: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetThreshold(f32),
}

/// Parse an inbound text message.
///
/// Returns `Ok(None)` for well-formed messages that carry no command this
/// device acts on, and `ProtocolError` for malformed JSON or a non-numeric
/// `setThreshold`.
pub fn parse_command(text: &str) -> Result<Option<Command>, MonitorError> {
    let (message, _) = serde_json_core::from_str::<InboundMessage<'_>>(text)
        .map_err(|_| MonitorError::ProtocolError)?;

    if message.r#type != Some("command") {
        return Ok(None);
    }

    Ok(message.set_threshold.map(Command::SetThreshold))
}

/// Map a raw 12-bit ADC sample onto 0-100, clamping out-of-range input
pub fn light_percent(raw: u16) -> u8 {
    let max = config::LIGHT_ADC_MAX as u32;
    let raw = (raw as u32).min(max);
    (raw * 100 / max) as u8
}
