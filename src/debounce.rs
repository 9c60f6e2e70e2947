//! Push-button debouncing
//!
//! The raw pin level is sampled every poll cycle. A level change restarts the
//! settle timer, and the level is only accepted once it has been stable for
//! longer than the debounce window. Only accepted transitions into the pressed
//! level are reported, so a burst of contact bounce yields at most one press.

use embassy_time::{Duration, Instant};

pub struct Debouncer {
    window: Duration,
    last_raw: bool,
    stable: bool,
    last_change: Instant,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_raw: false,
            stable: false,
            last_change: Instant::from_ticks(0),
        }
    }

    /// Feed one raw sample (`pressed` is the resolved, active-low level).
    /// Returns `true` exactly once per accepted press.
    pub fn update(&mut self, now: Instant, pressed: bool) -> bool {
        if pressed != self.last_raw {
            self.last_raw = pressed;
            self.last_change = now;
        }

        if now.saturating_duration_since(self.last_change) > self.window && pressed != self.stable {
            self.stable = pressed;
            return pressed;
        }

        false
    }

    /// Debounced level
    pub fn is_pressed(&self) -> bool {
        self.stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn clean_press_is_accepted_once() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));

        assert!(!debouncer.update(at(1000), true));
        assert!(!debouncer.update(at(1040), true));
        assert!(debouncer.update(at(1060), true));
        // Holding the button does not repeat the press
        assert!(!debouncer.update(at(1500), true));
        assert!(debouncer.is_pressed());

        // Release is tracked but not reported
        assert!(!debouncer.update(at(1600), false));
        assert!(!debouncer.update(at(1700), false));
        assert!(!debouncer.is_pressed());
    }

    #[test]
    fn bounce_within_window_collapses_to_one_press() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let mut accepted = 0;

        // Contact chatter every 10 ms for 40 ms, then held
        let samples = [
            (1000, true),
            (1010, false),
            (1020, true),
            (1030, false),
            (1040, true),
            (1050, true),
            (1080, true),
            (1100, true),
            (1200, true),
        ];
        for (ms, level) in samples {
            if debouncer.update(at(ms), level) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
    }

    #[test]
    fn glitch_shorter_than_window_is_ignored() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));

        assert!(!debouncer.update(at(1000), true));
        assert!(!debouncer.update(at(1030), false));
        assert!(!debouncer.update(at(1200), false));
        assert!(!debouncer.is_pressed());
    }

    #[test]
    fn two_separate_presses_are_both_accepted() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let mut accepted = 0;

        for ms in (1000..1100).step_by(10) {
            accepted += debouncer.update(at(ms), true) as u32;
        }
        for ms in (1100..1200).step_by(10) {
            accepted += debouncer.update(at(ms), false) as u32;
        }
        for ms in (1200..1300).step_by(10) {
            accepted += debouncer.update(at(ms), true) as u32;
        }

        assert_eq!(accepted, 2);
    }
}
