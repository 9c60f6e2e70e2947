//! Board peripherals behind the monitor's traits
//!
//! `Buzzer` works with any embedded-hal output pin. The ADC light sensor and
//! the hardware RNG wrap esp-hal drivers and only exist in firmware builds.

use embedded_hal::digital::OutputPin;
use log::warn;

use crate::traits::Alarm;

/// Active-high buzzer
pub struct Buzzer<P> {
    pin: P,
    on: bool,
}

impl<P: OutputPin> Buzzer<P> {
    pub fn new(mut pin: P) -> Self {
        if pin.set_low().is_err() {
            warn!("[ALARM] Failed to park buzzer pin low");
        }
        Self { pin, on: false }
    }
}

impl<P: OutputPin> Alarm for Buzzer<P> {
    fn set_alarm(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        match result {
            Ok(()) => self.on = on,
            Err(_) => warn!("[ALARM] Failed to drive buzzer pin"),
        }
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

#[cfg(target_os = "none")]
pub use self::esp::{HwRng, LightAdc};

#[cfg(target_os = "none")]
mod esp {
    use esp_hal::Blocking;
    use esp_hal::analog::adc::{Adc, AdcPin};
    use esp_hal::peripherals::{ADC1, GPIO2};
    use esp_hal::rng::Rng;
    use rand_core::{CryptoRng, RngCore};

    use crate::MonitorError;
    use crate::telemetry::light_percent;
    use crate::traits::LightSensor;

    /// Photoresistor divider on ADC1
    pub struct LightAdc<'d> {
        adc: Adc<'d, ADC1<'d>, Blocking>,
        pin: AdcPin<GPIO2<'d>, ADC1<'d>>,
    }

    impl<'d> LightAdc<'d> {
        pub fn new(adc: Adc<'d, ADC1<'d>, Blocking>, pin: AdcPin<GPIO2<'d>, ADC1<'d>>) -> Self {
            Self { adc, pin }
        }
    }

    impl LightSensor for LightAdc<'_> {
        fn read_percent(&mut self) -> Result<u8, MonitorError> {
            let raw: u16 = nb::block!(self.adc.read_oneshot(&mut self.pin))
                .map_err(|_| MonitorError::SensorError)?;
            Ok(light_percent(raw))
        }
    }

    /// Hardware RNG as a `rand_core` source, for WebSocket masking keys
    #[derive(Clone, Copy)]
    pub struct HwRng(Rng);

    impl HwRng {
        pub fn new(rng: Rng) -> Self {
            Self(rng)
        }
    }

    impl RngCore for HwRng {
        fn next_u32(&mut self) -> u32 {
            self.0.random()
        }

        fn next_u64(&mut self) -> u64 {
            ((self.0.random() as u64) << 32) | self.0.random() as u64
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(4) {
                let bytes = self.0.random().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for HwRng {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    #[derive(Default)]
    struct RecordingPin {
        high: bool,
        writes: usize,
    }

    impl ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.high = false;
            self.writes += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.high = true;
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn buzzer_starts_silent_and_follows_alarm() {
        let mut buzzer = Buzzer::new(RecordingPin::default());
        assert!(!buzzer.is_on());
        assert_eq!(buzzer.pin.writes, 1);

        buzzer.set_alarm(true);
        assert!(buzzer.is_on());
        assert!(buzzer.pin.high);

        buzzer.set_alarm(false);
        assert!(!buzzer.is_on());
        assert!(!buzzer.pin.high);
    }
}
