//! 会话状态机模块
//!
//! 管理监测会话的运行/停止、传输连接状态、重连节流以及遥测发送时机。
//! 状态机本身不接触硬件：调用方喂入事件和当前时间，取回需要执行的动作。

use alloc::vec::Vec;
use embassy_time::{Duration, Instant};
use log::{info, warn};

use crate::MonitorError;
use crate::config;
use crate::display::Banner;
use crate::telemetry::{self, Command, InboundText};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 监测未运行
    Stopped,
    /// 监测运行中，传输未连接
    RunningDisconnected,
    /// 监测运行中，传输已连接
    RunningConnected,
}

/// 传输层上报的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error,
    TextReceived(InboundText),
}

/// 状态机内部事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    // 按键事件
    ButtonPressed,

    // 网络链路事件
    LinkLost,
    LinkRestored,

    // 传输事件
    TransportConnected,
    TransportDisconnected,
    TransportError,
}

/// 状态转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// 保持当前状态
    Stay,
    /// 转换到新状态
    Transition(SessionState),
}

/// 状态机需要执行的动作
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// 发起传输连接
    ConnectTransport,
    /// 断开传输连接
    DisconnectTransport,
    /// 设置蜂鸣器输出
    SetAlarm(bool),
    /// 周期性采样并发送遥测
    EmitTelemetry,
    /// 命令触发的立即发送（允许一次重连重试）
    ForceEmit,
    /// 回复阈值修改确认
    SendThresholdAck(f32),
    /// 显示提示横幅
    ShowBanner(Banner),
    /// 刷新状态屏
    RefreshDisplay,
}

/// 会话运行参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub reconnect_interval: Duration,
    pub data_send_interval: Duration,
    pub initial_threshold: f32,
    /// 启动后无需按键直接进入运行状态
    pub autostart: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(config::RECONNECT_INTERVAL_MS),
            data_send_interval: Duration::from_millis(config::DATA_SEND_INTERVAL_MS),
            initial_threshold: config::DEFAULT_THRESHOLD,
            autostart: false,
        }
    }
}

/// 会话控制器
pub struct SessionController {
    current_state: SessionState,
    previous_state: Option<SessionState>,
    config: SessionConfig,
    threshold: f32,
    link_up: bool,
    alarm: bool,
    last_temperature: Option<f32>,
    last_reconnect_attempt: Option<Instant>,
    last_sent: Option<Instant>,
    pending: Vec<Action>,
}

impl SessionController {
    /// 创建新的控制器，初始状态为停止
    pub fn new(config: SessionConfig) -> Self {
        Self {
            current_state: SessionState::Stopped,
            previous_state: None,
            config,
            threshold: config.initial_threshold,
            link_up: false,
            alarm: false,
            last_temperature: None,
            last_reconnect_attempt: None,
            last_sent: None,
            pending: Vec::new(),
        }
    }

    /// 获取当前状态
    pub fn state(&self) -> SessionState {
        self.current_state
    }

    /// 获取上一个状态
    pub fn previous_state(&self) -> Option<SessionState> {
        self.previous_state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.current_state != SessionState::Stopped
    }

    pub fn is_connected(&self) -> bool {
        self.current_state == SessionState::RunningConnected
    }

    pub fn link_up(&self) -> bool {
        self.link_up
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// 当前蜂鸣器应处的状态
    pub fn alarm(&self) -> bool {
        self.alarm
    }

    /// 处理一次去抖后的按键
    pub fn on_button_edge(&mut self, now: Instant) -> Vec<Action> {
        self.handle_event(SessionEvent::ButtonPressed, now);
        self.take_actions()
    }

    /// 启动时自动进入运行状态
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        if !self.is_running() {
            self.handle_event(SessionEvent::ButtonPressed, now);
        }
        self.take_actions()
    }

    /// 同步网络链路状态，每个轮询周期调用一次
    pub fn on_link_event(&mut self, link_up: bool, now: Instant) -> Vec<Action> {
        if link_up != self.link_up {
            let event = if link_up {
                SessionEvent::LinkRestored
            } else {
                SessionEvent::LinkLost
            };
            self.handle_event(event, now);
        }

        if self.is_running() && !self.link_up {
            self.pending.push(Action::ShowBanner(Banner::LinkCheck));
        }

        self.take_actions()
    }

    /// 处理传输层事件
    pub fn handle_transport_event(&mut self, event: &TransportEvent, now: Instant) -> Vec<Action> {
        match event {
            TransportEvent::Connected => {
                self.handle_event(SessionEvent::TransportConnected, now);
            }
            TransportEvent::Disconnected => {
                self.handle_event(SessionEvent::TransportDisconnected, now);
            }
            TransportEvent::Error => {
                self.handle_event(SessionEvent::TransportError, now);
            }
            TransportEvent::TextReceived(text) => self.handle_text(text),
        }

        self.take_actions()
    }

    /// 周期检查：重连节流与遥测发送节流
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        match self.current_state {
            SessionState::Stopped => {}
            SessionState::RunningDisconnected => {
                if self.link_up
                    && interval_elapsed(
                        self.last_reconnect_attempt,
                        now,
                        self.config.reconnect_interval,
                    )
                {
                    info!("[SESSION] Reconnect attempt");
                    self.last_reconnect_attempt = Some(now);
                    self.pending.push(Action::ConnectTransport);
                }
            }
            SessionState::RunningConnected => {
                if interval_elapsed(self.last_sent, now, self.config.data_send_interval) {
                    self.last_sent = Some(now);
                    self.pending.push(Action::EmitTelemetry);
                }
            }
        }

        self.take_actions()
    }

    /// 记录一次成功发送，周期发送从此刻重新计时
    pub fn note_emitted(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// 记录一次由强制发送路径发起的重连
    pub fn note_reconnect_attempt(&mut self, now: Instant) {
        self.last_reconnect_attempt = Some(now);
    }

    /// 用最新读数评估报警输出
    ///
    /// 读取失败时沿用上一次有效温度，报警保持不变；停止状态下的读数不保留
    pub fn apply_reading(&mut self, temperature: Option<f32>) -> bool {
        if !self.is_running() {
            self.alarm = false;
            return false;
        }
        if temperature.is_some() {
            self.last_temperature = temperature;
        }
        self.alarm = self.last_temperature.is_some_and(|t| t > self.threshold);
        self.alarm
    }

    /// 修改报警阈值，范围 [0, 100]
    pub fn set_threshold(&mut self, value: f32) -> Result<f32, MonitorError> {
        if !(config::THRESHOLD_MIN..=config::THRESHOLD_MAX).contains(&value) {
            return Err(MonitorError::ProtocolError);
        }
        self.threshold = value;
        Ok(value)
    }

    /// 处理状态机事件
    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) -> StateTransition {
        match event {
            SessionEvent::LinkLost => self.link_up = false,
            SessionEvent::LinkRestored => self.link_up = true,
            _ => {}
        }

        let transition = self.get_state_transition(self.current_state, event);

        match transition {
            StateTransition::Transition(new_state) => {
                self.transition_to_state(new_state, now);
            }
            StateTransition::Stay => self.handle_in_state(event, now),
        }

        transition
    }

    fn take_actions(&mut self) -> Vec<Action> {
        core::mem::take(&mut self.pending)
    }

    /// 保持状态时的附带处理
    fn handle_in_state(&mut self, event: SessionEvent, now: Instant) {
        match (self.current_state, event) {
            // 链路恢复后重新计时，至少等待一个重连间隔
            (SessionState::RunningDisconnected, SessionEvent::LinkRestored) => {
                info!("[SESSION] Link restored, reconnecting after interval");
                self.last_reconnect_attempt = Some(now);
            }
            (SessionState::Stopped, SessionEvent::TransportConnected) => {
                info!("[SESSION] Connected while stopped, closing session");
                self.pending.push(Action::DisconnectTransport);
            }
            _ => {}
        }
    }

    /// 内部状态转换逻辑
    fn transition_to_state(&mut self, new_state: SessionState, now: Instant) {
        if new_state == self.current_state {
            return;
        }

        let old_state = self.current_state;
        self.previous_state = Some(old_state);
        self.current_state = new_state;

        match (old_state, new_state) {
            (_, SessionState::Stopped) => {
                info!("[SESSION] Monitoring stopped");
                if old_state == SessionState::RunningConnected {
                    self.pending.push(Action::DisconnectTransport);
                }
                self.force_alarm_off();
            }
            (SessionState::Stopped, SessionState::RunningDisconnected) => {
                info!("[SESSION] Monitoring started");
                if self.link_up {
                    self.last_reconnect_attempt = Some(now);
                    self.pending.push(Action::ConnectTransport);
                } else {
                    warn!("[SESSION] Link down, waiting for periodic reconnect");
                }
            }
            (SessionState::RunningConnected, SessionState::RunningDisconnected) => {
                warn!("[SESSION] Transport lost");
                self.force_alarm_off();
            }
            (_, SessionState::RunningConnected) => {
                info!("[SESSION] Transport connected");
                self.last_sent = None;
            }
            _ => {}
        }

        self.pending.push(Action::RefreshDisplay);
    }

    fn force_alarm_off(&mut self) {
        self.alarm = false;
        self.last_temperature = None;
        self.pending.push(Action::SetAlarm(false));
    }

    fn handle_text(&mut self, text: &str) {
        match telemetry::parse_command(text) {
            Ok(Some(Command::SetThreshold(value))) => match self.set_threshold(value) {
                Ok(threshold) => {
                    info!("[CMD] Threshold set to {}", threshold);
                    self.pending.push(Action::SendThresholdAck(threshold));
                    if self.is_running() {
                        self.pending.push(Action::ForceEmit);
                    }
                }
                Err(_) => warn!("[CMD] Threshold {} outside [0, 100], ignored", value),
            },
            Ok(None) => {}
            Err(_) => warn!("[CMD] Unparseable message ignored"),
        }
    }

    /// 获取状态转换规则
    fn get_state_transition(&self, current_state: SessionState, event: SessionEvent) -> StateTransition {
        match (current_state, event) {
            // 按键切换运行/停止
            (SessionState::Stopped, SessionEvent::ButtonPressed) => {
                StateTransition::Transition(SessionState::RunningDisconnected)
            }
            (
                SessionState::RunningDisconnected | SessionState::RunningConnected,
                SessionEvent::ButtonPressed,
            ) => StateTransition::Transition(SessionState::Stopped),

            // 传输连接成功
            (SessionState::RunningDisconnected, SessionEvent::TransportConnected) => {
                StateTransition::Transition(SessionState::RunningConnected)
            }

            // 传输断开、出错或链路丢失时强制回到未连接
            (
                SessionState::RunningConnected,
                SessionEvent::TransportDisconnected
                | SessionEvent::TransportError
                | SessionEvent::LinkLost,
            ) => StateTransition::Transition(SessionState::RunningDisconnected),

            // 默认情况：保持当前状态
            _ => StateTransition::Stay,
        }
    }
}

fn interval_elapsed(since: Option<Instant>, now: Instant, interval: Duration) -> bool {
    since.is_none_or(|t| now.saturating_duration_since(t) >= interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn text(payload: &str) -> TransportEvent {
        let mut message = InboundText::new();
        message.push_str(payload).unwrap();
        TransportEvent::TextReceived(message)
    }

    fn connected_controller() -> SessionController {
        let mut controller = SessionController::new(SessionConfig::default());
        controller.on_link_event(true, at(0));
        controller.on_button_edge(at(100));
        controller.handle_transport_event(&TransportEvent::Connected, at(200));
        assert_eq!(controller.state(), SessionState::RunningConnected);
        controller
    }

    #[test]
    fn running_follows_press_parity() {
        let mut controller = SessionController::new(SessionConfig::default());
        controller.on_link_event(true, at(0));

        for presses in 1..=7u64 {
            controller.on_button_edge(at(presses * 1000));
            assert_eq!(controller.is_running(), presses % 2 == 1);
        }
    }

    #[test]
    fn start_with_link_up_connects_immediately() {
        let mut controller = SessionController::new(SessionConfig::default());
        controller.on_link_event(true, at(0));

        let actions = controller.on_button_edge(at(100));

        assert_eq!(controller.state(), SessionState::RunningDisconnected);
        assert!(actions.contains(&Action::ConnectTransport));
        // Reconnect throttle starts from the immediate attempt
        assert!(controller.tick(at(4000)).is_empty());
        assert_eq!(controller.tick(at(5100)), [Action::ConnectTransport]);
    }

    #[test]
    fn start_with_link_down_waits_for_periodic_check() {
        let mut controller = SessionController::new(SessionConfig::default());

        let actions = controller.on_button_edge(at(100));
        assert!(!actions.contains(&Action::ConnectTransport));
        assert_eq!(controller.state(), SessionState::RunningDisconnected);

        // No attempts while the link is down
        assert!(controller.tick(at(20_000)).is_empty());
    }

    #[test]
    fn stop_deasserts_alarm_and_disconnects() {
        let mut controller = connected_controller();
        assert!(controller.apply_reading(Some(35.0)));

        let actions = controller.on_button_edge(at(1000));

        assert_eq!(controller.state(), SessionState::Stopped);
        assert!(actions.contains(&Action::DisconnectTransport));
        assert!(actions.contains(&Action::SetAlarm(false)));
        assert!(!controller.alarm());
    }

    #[test]
    fn stop_while_disconnected_still_deasserts_alarm() {
        let mut controller = SessionController::new(SessionConfig::default());
        controller.on_button_edge(at(100));

        let actions = controller.on_button_edge(at(200));

        assert!(actions.contains(&Action::SetAlarm(false)));
        assert!(!actions.contains(&Action::DisconnectTransport));
    }

    #[test]
    fn telemetry_only_while_running_and_connected() {
        let mut controller = SessionController::new(SessionConfig::default());
        controller.on_link_event(true, at(0));

        for ms in (0..60_000).step_by(500) {
            assert!(!controller.tick(at(ms)).contains(&Action::EmitTelemetry));
        }

        controller.on_button_edge(at(60_000));
        for ms in (60_000..120_000).step_by(500) {
            assert!(!controller.tick(at(ms)).contains(&Action::EmitTelemetry));
        }
    }

    #[test]
    fn emits_on_first_tick_then_every_interval() {
        let mut controller = connected_controller();

        assert_eq!(controller.tick(at(210)), [Action::EmitTelemetry]);
        assert!(controller.tick(at(5000)).is_empty());
        assert!(controller.tick(at(10_200)).is_empty());
        assert_eq!(controller.tick(at(10_210)), [Action::EmitTelemetry]);
        assert_eq!(controller.tick(at(20_210)), [Action::EmitTelemetry]);
    }

    #[test]
    fn connected_event_ignored_when_stopped() {
        let mut controller = SessionController::new(SessionConfig::default());

        let actions = controller.handle_transport_event(&TransportEvent::Connected, at(0));

        assert_eq!(controller.state(), SessionState::Stopped);
        assert_eq!(actions, [Action::DisconnectTransport]);
    }

    #[test]
    fn transport_error_forces_alarm_off() {
        let mut controller = connected_controller();
        controller.apply_reading(Some(40.0));

        let actions = controller.handle_transport_event(&TransportEvent::Error, at(1000));

        assert_eq!(controller.state(), SessionState::RunningDisconnected);
        assert!(actions.contains(&Action::SetAlarm(false)));
        assert!(!controller.alarm());
    }

    #[test]
    fn link_drop_mid_session() {
        let mut controller = connected_controller();
        controller.tick(at(300));
        controller.apply_reading(Some(40.0));

        // Link lost before the transport reports anything
        let actions = controller.on_link_event(false, at(1000));
        assert_eq!(controller.state(), SessionState::RunningDisconnected);
        assert!(actions.contains(&Action::SetAlarm(false)));
        assert!(actions.contains(&Action::ShowBanner(Banner::LinkCheck)));
        assert!(!controller.alarm());

        // Nothing goes out while the link is down
        for ms in (1000..30_000).step_by(100) {
            assert!(controller.tick(at(ms)).is_empty());
        }

        controller.on_link_event(true, at(30_000));
        for ms in (30_000..35_000).step_by(10) {
            assert!(controller.tick(at(ms)).is_empty(), "early attempt at {ms}");
        }
        assert_eq!(controller.tick(at(35_000)), [Action::ConnectTransport]);
    }

    #[test]
    fn alarm_tracks_threshold_only_while_running() {
        let mut controller = SessionController::new(SessionConfig::default());
        assert!(!controller.apply_reading(Some(50.0)));

        controller.on_button_edge(at(0));
        assert!(controller.apply_reading(Some(30.5)));
        assert!(!controller.apply_reading(Some(30.0)));
        assert!(!controller.apply_reading(None));
    }

    #[test]
    fn failed_reading_keeps_last_alarm_state() {
        let mut controller = connected_controller();

        assert!(controller.apply_reading(Some(35.0)));
        assert!(controller.apply_reading(None));
        assert!(controller.alarm());

        // A lowered reading still clears it once the sensor recovers
        assert!(!controller.apply_reading(Some(25.0)));
        assert!(!controller.apply_reading(None));
    }

    #[test]
    fn valid_threshold_command() {
        let mut controller = connected_controller();

        let actions = controller.handle_transport_event(
            &text(r#"{"type":"command","setThreshold":25.5}"#),
            at(1000),
        );

        assert_eq!(controller.threshold(), 25.5);
        assert_eq!(actions, [Action::SendThresholdAck(25.5), Action::ForceEmit]);
    }

    #[test]
    fn out_of_range_threshold_is_dropped_silently() {
        let mut controller = connected_controller();

        for payload in [
            r#"{"type":"command","setThreshold":100.5}"#,
            r#"{"type":"command","setThreshold":-1}"#,
        ] {
            let actions = controller.handle_transport_event(&text(payload), at(1000));
            assert!(actions.is_empty());
        }
        assert_eq!(controller.threshold(), config::DEFAULT_THRESHOLD);
    }

    #[test]
    fn threshold_bounds_are_inclusive() {
        let mut controller = SessionController::new(SessionConfig::default());
        assert_eq!(controller.set_threshold(0.0), Ok(0.0));
        assert_eq!(controller.set_threshold(100.0), Ok(100.0));
        assert!(controller.set_threshold(f32::NAN).is_err());
        assert_eq!(controller.threshold(), 100.0);
    }

    #[test]
    fn command_while_reconnecting_still_forces_emission() {
        let mut controller = connected_controller();
        controller.handle_transport_event(&TransportEvent::Error, at(500));
        assert_eq!(controller.state(), SessionState::RunningDisconnected);

        let actions = controller.handle_transport_event(
            &text(r#"{"type":"command","setThreshold":40}"#),
            at(1000),
        );

        assert_eq!(actions, [Action::SendThresholdAck(40.0), Action::ForceEmit]);
    }

    #[test]
    fn command_while_stopped_acks_without_emitting() {
        let mut controller = SessionController::new(SessionConfig::default());

        let actions = controller.handle_transport_event(
            &text(r#"{"type":"command","setThreshold":20}"#),
            at(0),
        );

        assert_eq!(actions, [Action::SendThresholdAck(20.0)]);
    }

    #[test]
    fn autostart_enters_running_once() {
        let mut controller = SessionController::new(SessionConfig {
            autostart: true,
            ..SessionConfig::default()
        });
        controller.on_link_event(true, at(0));

        assert!(controller.start(at(10)).contains(&Action::ConnectTransport));
        assert!(controller.start(at(20)).is_empty());
        assert!(controller.is_running());
    }
}
