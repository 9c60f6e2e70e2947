//! Poll-step orchestration
//!
//! `Monitor` owns the session controller and every collaborator, and runs one
//! poll step at a time: button edge first, then link and transport events,
//! then the periodic reconnect/emit checks. Actions produced by the controller
//! are executed in order through a single queue, so the forced-emission retry
//! never re-enters itself.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

use crate::clock::WallClock;
use crate::config;
use crate::debounce::Debouncer;
use crate::display::{Banner, StatusScreen};
use crate::state_machine::{Action, SessionConfig, SessionController};
use crate::telemetry::{self, Reading};
use crate::traits::{Alarm, EnvironmentSensor, LightSensor, NetworkLink, StatusDisplay, Transport};

/// Events drained from the transport per poll step
const MAX_EVENTS_PER_STEP: usize = 4;

/// Reconnect retries allowed on the forced emission path
const FORCE_EMIT_RETRIES: usize = 1;

/// Local peripherals driven by the monitor
pub struct Devices<E, L, A, D> {
    pub climate: E,
    pub light: L,
    pub alarm: A,
    pub display: D,
}

pub struct Monitor<T, N, E, L, A, D> {
    controller: SessionController,
    debouncer: Debouncer,
    transport: T,
    link: N,
    devices: Devices<E, L, A, D>,
    clock: WallClock,
    screen: StatusScreen,
    pending: VecDeque<Action>,
    last_refresh: Option<Instant>,
}

impl<T, N, E, L, A, D> Monitor<T, N, E, L, A, D>
where
    T: Transport,
    N: NetworkLink,
    E: EnvironmentSensor,
    L: LightSensor,
    A: Alarm,
    D: StatusDisplay,
{
    pub fn new(
        session: SessionConfig,
        transport: T,
        link: N,
        devices: Devices<E, L, A, D>,
        clock: WallClock,
    ) -> Self {
        Self {
            controller: SessionController::new(session),
            debouncer: Debouncer::new(Duration::from_millis(config::DEBOUNCE_MS)),
            transport,
            link,
            devices,
            clock,
            screen: StatusScreen::new(),
            pending: VecDeque::new(),
            last_refresh: None,
        }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn screen(&self) -> &StatusScreen {
        &self.screen
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn link_mut(&mut self) -> &mut N {
        &mut self.link
    }

    pub fn devices(&self) -> &Devices<E, L, A, D> {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut Devices<E, L, A, D> {
        &mut self.devices
    }

    pub fn clock_mut(&mut self) -> &mut WallClock {
        &mut self.clock
    }

    /// Draw the idle screen and honour autostart
    pub async fn boot(&mut self, now: Instant) {
        let link_up = self.link.is_up();
        let actions = self.controller.on_link_event(link_up, now);
        self.run(actions, now).await;

        if self.controller.config().autostart {
            info!("[MAIN] Autostart enabled");
            let actions = self.controller.start(now);
            self.run(actions, now).await;
        }

        self.refresh_display(now);
    }

    /// One poll cycle. `button_pressed` is the raw, resolved button level.
    pub async fn step(&mut self, now: Instant, button_pressed: bool) {
        if self.debouncer.update(now, button_pressed) {
            info!("[BUTTON] Press accepted");
            let actions = self.controller.on_button_edge(now);
            self.run(actions, now).await;
        }

        let link_up = self.link.is_up();
        let actions = self.controller.on_link_event(link_up, now);
        self.run(actions, now).await;

        for _ in 0..MAX_EVENTS_PER_STEP {
            let Some(event) = self.transport.poll().await else {
                break;
            };
            let actions = self.controller.handle_transport_event(&event, now);
            self.run(actions, now).await;
        }

        let actions = self.controller.tick(now);
        self.run(actions, now).await;

        let refresh = Duration::from_millis(config::DISPLAY_REFRESH_MS);
        if self
            .last_refresh
            .is_none_or(|t| now.saturating_duration_since(t) >= refresh)
        {
            self.refresh_display(now);
        }
    }

    async fn run(&mut self, actions: Vec<Action>, now: Instant) {
        self.pending.extend(actions);

        while let Some(action) = self.pending.pop_front() {
            self.execute(action, now).await;
        }
    }

    async fn execute(&mut self, action: Action, now: Instant) {
        match action {
            Action::ConnectTransport => {
                if let Err(e) = self.transport.connect().await {
                    warn!("[WS] Connect attempt failed: {:?}", e);
                }
            }
            Action::DisconnectTransport => self.transport.disconnect().await,
            Action::SetAlarm(on) => self.devices.alarm.set_alarm(on),
            Action::EmitTelemetry => self.emit(now, false).await,
            Action::ForceEmit => self.force_emit(now).await,
            Action::SendThresholdAck(threshold) => self.send_ack(threshold).await,
            Action::ShowBanner(banner) => {
                self.screen
                    .show_banner(banner, now, Duration::from_millis(config::BANNER_HOLD_MS));
            }
            Action::RefreshDisplay => self.refresh_display(now),
        }
    }

    /// Sample, drive the alarm and dispatch one telemetry message
    async fn emit(&mut self, now: Instant, retry_sensor: bool) {
        if !self.controller.is_connected() {
            return;
        }

        let reading = self.sample(retry_sensor).await;
        let alarm = self.controller.apply_reading(reading.temperature());
        self.devices.alarm.set_alarm(alarm);

        if reading.sensor_error() {
            self.screen.show_banner(
                Banner::SensorError,
                now,
                Duration::from_millis(config::BANNER_HOLD_MS),
            );
        }
        self.screen.reading = Some(reading);
        self.refresh_display(now);

        let timestamp = self.clock.timestamp(now);
        let message = match telemetry::encode_telemetry(
            &reading,
            alarm,
            self.controller.threshold(),
            timestamp.as_deref(),
        ) {
            Ok(message) => message,
            Err(e) => {
                warn!("[DATA] Encoding failed: {:?}", e);
                return;
            }
        };

        match self.transport.send_text(&message).await {
            Ok(()) => {
                info!("[DATA] Sent {}", message.as_str());
                self.controller.note_emitted(now);
            }
            Err(e) => warn!("[DATA] Send failed: {:?}", e),
        }
    }

    /// Out-of-cycle emission after a threshold change, with one reconnect retry
    async fn force_emit(&mut self, mut now: Instant) {
        let wait = Duration::from_millis(config::FORCE_RECONNECT_WAIT_MS);
        for attempt in 0..=FORCE_EMIT_RETRIES {
            self.drain_transport(now).await;

            if !self.controller.is_running() {
                return;
            }
            if self.controller.is_connected() {
                self.emit(now, true).await;
                return;
            }
            if attempt == FORCE_EMIT_RETRIES {
                break;
            }
            if !self.link.is_up() {
                warn!("[DATA] Link down, forced emission dropped");
                return;
            }

            info!("[DATA] Transport down, reconnecting before forced emission");
            self.controller.note_reconnect_attempt(now);
            if let Err(e) = self.transport.connect().await {
                warn!("[WS] Connect attempt failed: {:?}", e);
            }
            Timer::after(wait).await;
            now = Instant::now().max(now + wait);
        }

        warn!("[DATA] Transport still down, forced emission dropped");
    }

    /// Feed queued transport events to the controller without executing the
    /// resulting actions
    async fn drain_transport(&mut self, now: Instant) {
        for _ in 0..MAX_EVENTS_PER_STEP {
            let Some(event) = self.transport.poll().await else {
                break;
            };
            let actions = self.controller.handle_transport_event(&event, now);
            self.pending.extend(actions);
        }
    }

    async fn send_ack(&mut self, threshold: f32) {
        let message = match telemetry::encode_threshold_ack(threshold) {
            Ok(message) => message,
            Err(e) => {
                warn!("[CMD] Encoding failed: {:?}", e);
                return;
            }
        };

        match self.transport.send_text(&message).await {
            Ok(()) => info!("[CMD] Acknowledged threshold {}", threshold),
            Err(e) => warn!("[CMD] Acknowledgement failed: {:?}", e),
        }
    }

    async fn sample(&mut self, retry: bool) -> Reading {
        let mut climate = self.devices.climate.read_climate();
        if retry && climate.is_err() {
            warn!("[SENSOR] Climate read failed, retrying");
            Timer::after(Duration::from_millis(config::SENSOR_RETRY_DELAY_MS)).await;
            climate = self.devices.climate.read_climate();
        }
        if let Err(e) = climate {
            warn!("[SENSOR] Climate read failed: {:?}", e);
        }

        let light = self.devices.light.read_percent();
        if let Err(e) = light {
            warn!("[SENSOR] Light read failed: {:?}", e);
        }

        Reading {
            climate: climate.ok(),
            light: light.ok(),
        }
    }

    fn refresh_display(&mut self, now: Instant) {
        self.screen.running = self.controller.is_running();
        self.screen.link_up = self.controller.link_up();
        self.screen.transport_connected = self.controller.is_connected();
        self.screen.alarm = self.controller.alarm();
        self.screen.ip_suffix = self.link.ip_address().map(|ip| ip[3]);
        if !self.screen.running {
            self.screen.reading = None;
        }

        if let Err(e) = self.devices.display.render(&self.screen, now) {
            debug!("[DISPLAY] Render failed: {:?}", e);
        }
        self.last_refresh = Some(now);
    }
}
