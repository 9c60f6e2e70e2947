//! DHT11 single-wire driver
//!
//! Bit-banged over any open-drain pin that can be both driven and read. The
//! 40-bit frame is humidity (integer, decimal), temperature (integer, decimal
//! with the sign in bit 7) and an 8-bit additive checksum.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use log::warn;

use crate::MonitorError;
use crate::telemetry::Climate;
use crate::traits::EnvironmentSensor;

/// Host start signal, held low
const START_LOW_MS: u32 = 20;
/// Host release before the sensor answers
const RELEASE_US: u32 = 30;
/// Longest level the protocol ever holds
const LEVEL_TIMEOUT_US: u32 = 100;
/// High pulses longer than this encode a 1 (26-28 µs vs 70 µs)
const ONE_THRESHOLD_US: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtError {
    /// Sensor did not answer or a level was held too long
    Timeout,
    Checksum,
    /// Pin access failed
    Bus,
}

/// Validate a raw frame and convert it to physical units
pub fn decode_frame(frame: &[u8; 5]) -> Result<Climate, DhtError> {
    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[4] {
        return Err(DhtError::Checksum);
    }

    let humidity = frame[0] as f32 + frame[1] as f32 / 10.0;
    let magnitude = frame[2] as f32 + (frame[3] & 0x7F) as f32 / 10.0;
    let temperature = if frame[3] & 0x80 != 0 { -magnitude } else { magnitude };

    Ok(Climate {
        temperature,
        humidity,
    })
}

pub struct Dht11<P, D> {
    pin: P,
    delay: D,
}

impl<P, D> Dht11<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    /// `pin` must idle high (open drain with pull-up)
    pub fn new(pin: P, delay: D) -> Self {
        Self { pin, delay }
    }

    pub fn read(&mut self) -> Result<Climate, DhtError> {
        self.pin.set_low().map_err(|_| DhtError::Bus)?;
        self.delay.delay_ms(START_LOW_MS);
        self.pin.set_high().map_err(|_| DhtError::Bus)?;
        self.delay.delay_us(RELEASE_US);

        // Pulse widths are only meaningful without interrupts in between
        let frame = critical_section::with(|_| self.receive())?;
        decode_frame(&frame)
    }

    fn receive(&mut self) -> Result<[u8; 5], DhtError> {
        // Response: sensor pulls low for 80 µs, then high for 80 µs
        self.wait_while(true)?;
        self.wait_while(false)?;
        self.wait_while(true)?;

        let mut frame = [0u8; 5];
        for bit in 0..40 {
            self.wait_while(false)?;
            let high = self.wait_while(true)?;
            if high > ONE_THRESHOLD_US {
                frame[bit / 8] |= 1 << (7 - bit % 8);
            }
        }

        Ok(frame)
    }

    /// Wait for the line to leave `high`, returning the elapsed µs
    fn wait_while(&mut self, high: bool) -> Result<u32, DhtError> {
        let mut elapsed = 0;
        while self.pin.is_high().map_err(|_| DhtError::Bus)? == high {
            if elapsed >= LEVEL_TIMEOUT_US {
                return Err(DhtError::Timeout);
            }
            self.delay.delay_us(1);
            elapsed += 1;
        }
        Ok(elapsed)
    }
}

impl<P, D> EnvironmentSensor for Dht11<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn read_climate(&mut self) -> Result<Climate, MonitorError> {
        self.read().map_err(|e| {
            warn!("[SENSOR] DHT11 read failed: {:?}", e);
            MonitorError::SensorError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    /// Replays a recorded line level, one sample per read
    struct ScriptedPin {
        levels: Vec<bool>,
        cursor: usize,
        driven_low: usize,
    }

    impl ErrorType for ScriptedPin {
        type Error = Infallible;
    }

    impl InputPin for ScriptedPin {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            let level = self.levels.get(self.cursor).copied().unwrap_or(false);
            self.cursor += 1;
            Ok(level)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            self.is_high().map(|high| !high)
        }
    }

    impl OutputPin for ScriptedPin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.driven_low += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    /// Line levels (1 sample per µs) for a sensor answering with `frame`
    fn waveform(frame: [u8; 5]) -> Vec<bool> {
        let mut levels = Vec::new();
        let mut hold = |level: bool, us: usize| levels.extend(std::iter::repeat_n(level, us));

        hold(true, 5);
        hold(false, 80);
        hold(true, 80);
        for byte in frame {
            for bit in (0..8).rev() {
                hold(false, 50);
                hold(true, if byte & (1 << bit) != 0 { 70 } else { 26 });
            }
        }
        hold(false, 50);
        levels
    }

    fn sensor(levels: Vec<bool>) -> Dht11<ScriptedPin, NoDelay> {
        Dht11::new(
            ScriptedPin {
                levels,
                cursor: 0,
                driven_low: 0,
            },
            NoDelay,
        )
    }

    #[test]
    fn decodes_valid_frame() {
        let climate = decode_frame(&[45, 0, 23, 5, 73]).unwrap();
        assert_eq!(climate.humidity, 45.0);
        assert_eq!(climate.temperature, 23.5);
    }

    #[test]
    fn decodes_negative_temperature() {
        let climate = decode_frame(&[60, 0, 2, 0x83, 0xC1]).unwrap();
        assert!((climate.temperature + 2.3).abs() < 1e-4);
    }

    #[test]
    fn rejects_bad_checksum() {
        assert_eq!(decode_frame(&[45, 0, 23, 5, 74]), Err(DhtError::Checksum));
    }

    #[test]
    fn reads_frame_from_line() {
        let mut dht = sensor(waveform([52, 0, 27, 3, 82]));

        let climate = dht.read().unwrap();

        assert_eq!(climate.humidity, 52.0);
        assert!((climate.temperature - 27.3).abs() < 1e-4);
        assert_eq!(dht.pin.driven_low, 1);
    }

    #[test]
    fn corrupted_frame_fails_checksum() {
        let mut dht = sensor(waveform([52, 0, 27, 3, 80]));
        assert_eq!(dht.read(), Err(DhtError::Checksum));
    }

    #[test]
    fn silent_sensor_times_out() {
        let mut dht = sensor(std::vec![true; 500]);
        assert_eq!(dht.read(), Err(DhtError::Timeout));
        assert_eq!(dht.read_climate(), Err(MonitorError::SensorError));
    }
}
