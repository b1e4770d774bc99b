//! Step-counting simulation clock.
//!
//! The timeline is a fixed, configured start instant advanced in whole
//! steps, never wall clock, so runs are reproducible. Only the hour of day
//! and the calendar month are ever consumed by the model, so the clock
//! tracks elapsed steps plus those two derived values instead of a full
//! datetime.

/// Simulation clock advancing in fixed steps of `step_minutes`.
#[derive(Debug, Clone)]
pub struct SimClock {
    step_minutes: u32,
    start_hour: u32,
    month: u32,
    step: u64,
}

impl SimClock {
    /// Creates a clock at `start_hour:00` in `month`.
    ///
    /// # Panics
    ///
    /// Panics if `step_minutes` is zero, `start_hour >= 24`, or `month` is
    /// outside `1..=12`.
    pub fn new(step_minutes: u32, start_hour: u32, month: u32) -> Self {
        assert!(step_minutes > 0, "step_minutes must be > 0");
        assert!(start_hour < 24, "start_hour must be in 0..=23");
        assert!((1..=12).contains(&month), "month must be in 1..=12");
        Self {
            step_minutes,
            start_hour,
            month,
            step: 0,
        }
    }

    /// Rewinds the clock to the configured start instant.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Advances by one step.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Steps completed since reset.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Minutes elapsed since reset.
    pub fn elapsed_minutes(&self) -> f64 {
        self.step as f64 * f64::from(self.step_minutes)
    }

    /// Current hour of day (0-23).
    pub fn hour(&self) -> u32 {
        let total_minutes = u64::from(self.start_hour) * 60 + self.step * u64::from(self.step_minutes);
        ((total_minutes / 60) % 24) as u32
    }

    /// Calendar month (1-12), constant over the run.
    pub fn month(&self) -> u32 {
        self.month
    }

    /// Step length in minutes.
    pub fn step_minutes(&self) -> u32 {
        self.step_minutes
    }

    /// Step length in hours.
    pub fn step_hours(&self) -> f32 {
        self.step_minutes as f32 / 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_configured_hour() {
        let clock = SimClock::new(15, 8, 6);
        assert_eq!(clock.hour(), 8);
        assert_eq!(clock.elapsed_minutes(), 0.0);
        assert_eq!(clock.month(), 6);
    }

    #[test]
    fn hour_wraps_past_midnight() {
        let mut clock = SimClock::new(60, 23, 1);
        clock.advance();
        assert_eq!(clock.hour(), 0);
        clock.advance();
        assert_eq!(clock.hour(), 1);
    }

    #[test]
    fn quarter_hour_steps_accumulate() {
        let mut clock = SimClock::new(15, 0, 1);
        for _ in 0..5 {
            clock.advance();
        }
        assert_eq!(clock.elapsed_minutes(), 75.0);
        assert_eq!(clock.hour(), 1);
        assert_eq!(clock.step(), 5);
    }

    #[test]
    fn reset_rewinds() {
        let mut clock = SimClock::new(30, 6, 3);
        clock.advance();
        clock.advance();
        clock.reset();
        assert_eq!(clock.step(), 0);
        assert_eq!(clock.hour(), 6);
    }

    #[test]
    #[should_panic]
    fn zero_step_minutes_panics() {
        SimClock::new(0, 0, 1);
    }
}
