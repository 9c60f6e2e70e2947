//! WiFi module for ESP32-C3 board
//!
//! Handles station association using esp-wifi 0.14.1 with embassy-net DHCP,
//! and keeps rejoining in the background once the session is running.

use embassy_net::Stack;
use embassy_time::{Duration, Instant, Timer};
use esp_wifi::wifi::{AuthMethod, ClientConfiguration, Configuration, WifiController};
use log::{debug, info, warn};

use crate::traits::NetworkLink;
use crate::{MonitorError, config};

const STATUS_POLL: Duration = Duration::from_millis(100);

/// Station-mode link with automatic rejoin
pub struct WifiLink<'a> {
    controller: WifiController<'a>,
    stack: Stack<'a>,
    rejoin_interval: Duration,
    last_rejoin: Option<Instant>,
    was_up: bool,
}

impl<'a> WifiLink<'a> {
    pub fn new(controller: WifiController<'a>, stack: Stack<'a>) -> Self {
        Self {
            controller,
            stack,
            rejoin_interval: Duration::from_millis(config::WIFI_RECONNECT_INTERVAL_MS),
            last_rejoin: None,
            was_up: false,
        }
    }

    pub fn stack(&self) -> Stack<'a> {
        self.stack
    }

    /// Join `ssid` and wait for a DHCP lease, giving up after `timeout`
    pub async fn associate(
        &mut self,
        ssid: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<[u8; 4], MonitorError> {
        info!("[WIFI] Connecting to WiFi network: {}", ssid);

        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let client_config = ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| MonitorError::ConfigError)?,
            password: password.try_into().map_err(|_| MonitorError::ConfigError)?,
            auth_method,
            ..Default::default()
        };

        self.controller
            .set_configuration(&Configuration::Client(client_config))
            .map_err(|e| {
                warn!("[WIFI] Invalid configuration: {:?}", e);
                MonitorError::WiFiError
            })?;
        self.controller.start().map_err(|e| {
            warn!("[WIFI] Failed to start radio: {:?}", e);
            MonitorError::WiFiError
        })?;
        self.controller.connect().map_err(|e| {
            warn!("[WIFI] Failed to start association: {:?}", e);
            MonitorError::WiFiError
        })?;

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(ip) = self.current_ip() {
                info!("[WIFI] Connected, IP address: {}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
                self.was_up = true;
                return Ok(ip);
            }
            Timer::after(STATUS_POLL).await;
        }

        warn!("[WIFI] Association timed out after {} ms", timeout.as_millis());
        Err(MonitorError::WiFiError)
    }

    fn current_ip(&self) -> Option<[u8; 4]> {
        if !self.controller.is_connected().unwrap_or(false) {
            return None;
        }
        self.stack
            .config_v4()
            .map(|config| config.address.address().octets())
    }

    fn rejoin(&mut self, now: Instant) {
        let due = self
            .last_rejoin
            .is_none_or(|at| now.saturating_duration_since(at) >= self.rejoin_interval);
        if !due {
            return;
        }

        self.last_rejoin = Some(now);
        info!("[WIFI] Link down, rejoining");
        if let Err(e) = self.controller.connect() {
            debug!("[WIFI] Rejoin request failed: {:?}", e);
        }
    }
}

impl NetworkLink for WifiLink<'_> {
    fn is_up(&mut self) -> bool {
        let up = self.current_ip().is_some();

        if up != self.was_up {
            if up {
                info!("[WIFI] Link restored");
            } else {
                warn!("[WIFI] Link lost");
            }
            self.was_up = up;
        }

        if !up {
            self.rejoin(Instant::now());
        }
        up
    }

    fn ip_address(&self) -> Option<[u8; 4]> {
        self.current_ip()
    }
}
