//! SSD1306 status screen
//!
//! `StatusScreen` is the hardware-free screen model: the monitor feeds it the
//! session flags and the latest reading, and it produces positioned text lines.
//! The `StatusDisplay` impl for a buffered `Ssd1306` draws those lines with
//! embedded-graphics.

use core::fmt::Write;

use embassy_time::{Duration, Instant};
use embedded_graphics::{
    mono_font::{MonoTextStyle, MonoTextStyleBuilder, ascii::FONT_6X10},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use heapless::{String, Vec};
use ssd1306::{Ssd1306, mode::BufferedGraphicsMode, prelude::*};

use crate::MonitorError;
use crate::telemetry::Reading;
use crate::traits::StatusDisplay;

const LINE_HEIGHT: i32 = 10;
const HALF_WIDTH: i32 = 64;
const BANNER_Y: i32 = 40;
const FOOTER_Y: i32 = 54;
const IP_X: i32 = 104;

pub const MAX_LINES: usize = 8;

/// Timed one-line notices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banner {
    SensorError,
    LinkCheck,
}

impl Banner {
    pub fn text(&self) -> &'static str {
        match self {
            Banner::SensorError => " Sensor ERROR! ",
            Banner::LinkCheck => " WiFi Check... ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenLine {
    pub x: i32,
    pub y: i32,
    pub text: String<24>,
    /// Drawn black-on-white
    pub inverted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatusScreen {
    pub running: bool,
    pub link_up: bool,
    pub transport_connected: bool,
    pub alarm: bool,
    pub reading: Option<Reading>,
    /// Last octet of the local IPv4 address
    pub ip_suffix: Option<u8>,
    sensor_banner_until: Option<Instant>,
    link_banner_until: Option<Instant>,
}

impl StatusScreen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show `banner` for `hold`, extending any banner already showing
    pub fn show_banner(&mut self, banner: Banner, now: Instant, hold: Duration) {
        let until = Some(now + hold);
        match banner {
            Banner::SensorError => self.sensor_banner_until = until,
            Banner::LinkCheck => self.link_banner_until = until,
        }
    }

    /// Sensor errors take priority over link notices
    pub fn active_banner(&self, now: Instant) -> Option<Banner> {
        let showing = |until: Option<Instant>| until.is_some_and(|t| now < t);

        if showing(self.sensor_banner_until) {
            Some(Banner::SensorError)
        } else if showing(self.link_banner_until) {
            Some(Banner::LinkCheck)
        } else {
            None
        }
    }

    pub fn lines(&self, now: Instant) -> Vec<ScreenLine, MAX_LINES> {
        let mut lines = Vec::new();
        let mut push = |x: i32, y: i32, inverted: bool, args: core::fmt::Arguments<'_>| {
            let mut text = String::new();
            // Overlong lines are clipped by the panel anyway
            let _ = text.write_fmt(args);
            let _ = lines.push(ScreenLine { x, y, text, inverted });
        };

        push(
            0,
            0,
            false,
            format_args!("Status: {}", if self.running { "Running" } else { "Stopped" }),
        );

        if self.running {
            match self.reading.map(|r| r.climate) {
                Some(Some(climate)) => {
                    push(0, LINE_HEIGHT, false, format_args!("T:{:.1}C", climate.temperature));
                    push(HALF_WIDTH, LINE_HEIGHT, false, format_args!(" H:{:.1}%", climate.humidity));
                }
                Some(None) => {
                    push(0, LINE_HEIGHT, false, format_args!("T:ERR"));
                    push(HALF_WIDTH, LINE_HEIGHT, false, format_args!(" H:ERR"));
                }
                // Nothing sampled yet this session
                None => {
                    push(0, LINE_HEIGHT, false, format_args!("T:--"));
                    push(HALF_WIDTH, LINE_HEIGHT, false, format_args!(" H:--"));
                }
            }

            match self.reading.and_then(|r| r.light) {
                Some(light) => push(0, 2 * LINE_HEIGHT, false, format_args!("L:{}%", light)),
                None => push(0, 2 * LINE_HEIGHT, false, format_args!("L:--%")),
            }

            if self.alarm {
                push(HALF_WIDTH, 2 * LINE_HEIGHT, true, format_args!(" ALARM! "));
            }

            if let Some(banner) = self.active_banner(now) {
                push(0, BANNER_Y, true, format_args!("{}", banner.text()));
            }
        } else {
            push(0, 2 * LINE_HEIGHT, false, format_args!("Press button"));
            push(0, 3 * LINE_HEIGHT, false, format_args!("to start..."));
        }

        push(
            0,
            FOOTER_Y,
            false,
            format_args!(
                "WiFi:{} WS:{}",
                if self.link_up { "OK" } else { "NC" },
                if self.running && self.transport_connected { "OK" } else { "NC" }
            ),
        );

        if let (true, Some(octet)) = (self.link_up, self.ip_suffix) {
            push(IP_X, FOOTER_Y, false, format_args!("{}", octet));
        }

        lines
    }
}

fn styles() -> (MonoTextStyle<'static, BinaryColor>, MonoTextStyle<'static, BinaryColor>) {
    let normal = MonoTextStyleBuilder::new()
        .font(&FONT_6X10)
        .text_color(BinaryColor::On)
        .build();
    let inverted = MonoTextStyleBuilder::new()
        .font(&FONT_6X10)
        .text_color(BinaryColor::Off)
        .background_color(BinaryColor::On)
        .build();
    (normal, inverted)
}

/// Draw screen lines onto any monochrome target
pub fn draw<D>(target: &mut D, lines: &[ScreenLine]) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    let (normal, inverted) = styles();

    for line in lines {
        let style = if line.inverted { inverted } else { normal };
        Text::with_baseline(&line.text, Point::new(line.x, line.y), style, Baseline::Top).draw(target)?;
    }

    Ok(())
}

impl<DI, SIZE> StatusDisplay for Ssd1306<DI, SIZE, BufferedGraphicsMode<SIZE>>
where
    DI: WriteOnlyDataCommand,
    SIZE: DisplaySize,
{
    fn render(&mut self, screen: &StatusScreen, now: Instant) -> Result<(), MonitorError> {
        self.clear_buffer();
        draw(self, &screen.lines(now)).map_err(|_| MonitorError::DisplayError)?;
        self.flush().map_err(|_| MonitorError::DisplayError)
    }

    fn show_message(&mut self, message: &[&str]) -> Result<(), MonitorError> {
        self.clear_buffer();
        let (normal, _) = styles();
        for (row, text) in message.iter().enumerate() {
            Text::with_baseline(text, Point::new(0, row as i32 * LINE_HEIGHT), normal, Baseline::Top)
                .draw(self)
                .map_err(|_| MonitorError::DisplayError)?;
        }
        self.flush().map_err(|_| MonitorError::DisplayError)
    }
}
