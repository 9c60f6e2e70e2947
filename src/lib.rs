#![cfg_attr(not(test), no_std)]

//! ESP32-C3 Environmental Monitor Library
//!
//! This library provides the session controller, telemetry codec and device
//! drivers for a WiFi-connected monitor that samples a DHT11 and a light
//! sensor, drives a buzzer alarm and an SSD1306 status display, and streams
//! readings to a remote WebSocket listener.

extern crate alloc;

pub mod clock;
pub mod debounce;
pub mod dht;
pub mod display;
pub mod hardware;
pub mod monitor;
pub mod snapshot;
pub mod state_machine;
pub mod telemetry;
pub mod traits;
#[cfg(target_os = "none")]
pub mod wifi;
pub mod ws;

/// Project version information
pub const VERSION: &str = "0.1.0-dev";

/// Default configuration constants
pub mod config {
    /// WiFi configuration
    /// Read from environment variables at compile time
    pub const WIFI_SSID: &str = env!("WIFI_SSID");
    pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");

    /// Telemetry listener, IPv4 literal
    pub const WS_HOST: &str = env!("WS_HOST");
    pub const WS_PORT: u16 = parse_port(env!("WS_PORT"));
    pub const WS_PATH: &str = env!("WS_PATH");

    /// SNTP server, IPv4 literal
    pub const NTP_SERVER: &str = env!("NTP_SERVER");

    /// Port served by the camera snapshot service
    pub const CAMERA_PORT: u16 = parse_port(env!("CAMERA_PORT"));

    /// Boot-time WiFi association timeout in milliseconds
    pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 20_000;

    /// WiFi re-association interval in milliseconds
    pub const WIFI_RECONNECT_INTERVAL_MS: u64 = 5_000;

    /// Transport reconnect interval in milliseconds
    pub const RECONNECT_INTERVAL_MS: u64 = 5_000;

    /// Periodic telemetry interval in milliseconds
    pub const DATA_SEND_INTERVAL_MS: u64 = 10_000;

    /// Button debounce window in milliseconds
    pub const DEBOUNCE_MS: u64 = 50;

    /// Poll loop period in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 10;

    /// Firmware enters the running state right after boot association
    pub const AUTOSTART: bool = true;

    /// Alarm threshold in °C and its accepted range
    pub const DEFAULT_THRESHOLD: f32 = 30.0;
    pub const THRESHOLD_MIN: f32 = 0.0;
    pub const THRESHOLD_MAX: f32 = 100.0;

    /// Hold time of the "Sensor ERROR!" / "WiFi Check..." banners
    pub const BANNER_HOLD_MS: u64 = 2_000;

    /// Idle refresh period of the status display
    pub const DISPLAY_REFRESH_MS: u64 = 1_000;

    /// Local time offset applied to timestamps (UTC+8)
    pub const GMT_OFFSET_SECS: i64 = 8 * 3600;

    /// Maximum characters per snapshot body fragment
    pub const SNAPSHOT_CHUNK_CHARS: usize = 4000;

    /// Transport heartbeat: ping interval, pong timeout, misses before drop
    pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 5_000;
    pub const HEARTBEAT_MAX_MISSES: u8 = 2;

    /// Wait before re-reading a failed sensor on the forced emission path
    pub const SENSOR_RETRY_DELAY_MS: u64 = 100;

    /// Wait after a reconnect issued by the forced emission path
    pub const FORCE_RECONNECT_WAIT_MS: u64 = 500;

    /// Full-scale value of the 12-bit light ADC
    pub const LIGHT_ADC_MAX: u16 = 4095;

    /// SSD1306 I2C address
    pub const DISPLAY_I2C_ADDRESS: u8 = 0x3C;

    // build.rs has already rejected anything that is not a u16
    const fn parse_port(value: &str) -> u16 {
        let bytes = value.as_bytes();
        let mut port: u32 = 0;
        let mut i = 0;
        while i < bytes.len() {
            port = port * 10 + (bytes[i] - b'0') as u32;
            i += 1;
        }
        port as u16
    }
}

/// Error types for the environmental monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// WiFi association error
    WiFiError,
    /// Telemetry transport error
    TransportError,
    /// Sensor read error
    SensorError,
    /// Message encoding or parsing error
    ProtocolError,
    /// Status display error
    DisplayError,
    /// Invalid build-time configuration
    ConfigError,
    /// Camera capture error
    CameraError,
}
