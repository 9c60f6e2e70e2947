//! Hardware and transport abstraction traits

use embassy_time::Instant;

use crate::MonitorError;
use crate::display::StatusScreen;
use crate::snapshot::Frame;
use crate::state_machine::TransportEvent;
use crate::telemetry::Climate;

/// Trait for temperature/humidity sensors
pub trait EnvironmentSensor {
    fn read_climate(&mut self) -> Result<Climate, MonitorError>;
}

/// Trait for ambient light sensors
pub trait LightSensor {
    /// Light level mapped onto 0-100
    fn read_percent(&mut self) -> Result<u8, MonitorError>;
}

/// Trait for the alarm actuator
pub trait Alarm {
    fn set_alarm(&mut self, on: bool);

    fn is_on(&self) -> bool;
}

/// Trait for status displays
pub trait StatusDisplay {
    /// Redraw the full status screen
    fn render(&mut self, screen: &StatusScreen, now: Instant) -> Result<(), MonitorError>;

    /// Replace the screen with plain text lines (boot progress, fatal errors)
    fn show_message(&mut self, lines: &[&str]) -> Result<(), MonitorError>;
}

/// Trait for the underlying network association
pub trait NetworkLink {
    /// Associated and holding an address
    fn is_up(&mut self) -> bool;

    fn ip_address(&self) -> Option<[u8; 4]>;
}

/// Anything that accepts outbound text messages
#[allow(async_fn_in_trait)]
pub trait TextSink {
    async fn send_text(&mut self, text: &str) -> Result<(), MonitorError>;
}

/// Trait for the telemetry transport.
///
/// `connect` only starts a session; the outcome is reported later through
/// `poll` as a `Connected`, `Error` or `Disconnected` event.
#[allow(async_fn_in_trait)]
pub trait Transport: TextSink {
    async fn connect(&mut self) -> Result<(), MonitorError>;

    async fn disconnect(&mut self);

    /// Service the connection and return the next pending event, if any
    async fn poll(&mut self) -> Option<TransportEvent>;
}

/// Trait for camera frame grabbers
pub trait FrameSource {
    fn capture(&mut self) -> Result<Frame<'_>, MonitorError>;

    /// Hand the last frame buffer back to the driver
    fn release(&mut self) {}
}
