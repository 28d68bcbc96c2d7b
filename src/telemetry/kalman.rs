//! Per-sensor sample filters. Currently a single 1-D Kalman smoother; the
//! chain shape leaves room for more.

use crate::telemetry::data::TelemetrySample;

/// A stateful transform over one sensor's sample stream
pub trait SampleFilter: Send {
    fn apply(&mut self, sample: TelemetrySample) -> TelemetrySample;
    fn reset(&mut self);
}

/// Scalar constant-model Kalman filter with process variance `Q` and
/// measurement variance `R`.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    q: f64,
    r: f64,
    x: f64,
    p: f64,
    initial_estimate: f64,
    initial_error: f64,
    initialized: bool,
}

impl KalmanFilter {
    pub fn new(process_variance: f64, measurement_variance: f64) -> Self {
        Self::with_initial(process_variance, measurement_variance, 0.0, 1.0)
    }

    pub fn with_initial(
        process_variance: f64,
        measurement_variance: f64,
        initial_estimate: f64,
        initial_error: f64,
    ) -> Self {
        KalmanFilter {
            q: process_variance,
            r: measurement_variance,
            x: initial_estimate,
            p: initial_error,
            initial_estimate,
            initial_error,
            initialized: false,
        }
    }

    /// One textbook scalar update; the first measurement seeds the state
    pub fn update(&mut self, measurement: f64) -> f64 {
        if !self.initialized {
            self.x = measurement;
            self.initialized = true;
            return self.x;
        }

        let p_pred = self.p + self.q;
        let k = p_pred / (p_pred + self.r);
        self.x += k * (measurement - self.x);
        self.p = (1.0 - k) * p_pred;
        self.x
    }

    pub fn estimate(&self) -> f64 {
        self.x
    }
}

impl SampleFilter for KalmanFilter {
    fn apply(&mut self, mut sample: TelemetrySample) -> TelemetrySample {
        sample.value = self.update(sample.value);
        sample
    }

    fn reset(&mut self) {
        self.x = self.initial_estimate;
        self.p = self.initial_error;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64, t: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: t,
            sensor_name: "depth".to_string(),
            value,
            unit: Some("m".to_string()),
        }
    }

    #[test]
    fn stationary_input_stays_at_the_measurement() {
        let mut filter = KalmanFilter::with_initial(1e-5, 1e-2, 0.0, 1.0);

        let first = filter.update(10.0);
        assert_eq!(first, 10.0); // init takes the measurement verbatim

        for _ in 0..2 {
            let next = filter.update(10.0);
            assert!((next - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ramp_input_is_smoothed_and_monotone() {
        let mut filter = KalmanFilter::with_initial(1e-5, 1e-2, 0.0, 1.0);

        let a = filter.update(10.0);
        let b = filter.update(20.0);
        let c = filter.update(30.0);

        assert!(a < b && b < c);
        // The smoothed track trails the raw ramp by a measurable margin,
        // and the margin widens as the error covariance shrinks
        assert!(b < 20.0 - 0.05);
        assert!(c < 30.0 - 0.5);
        assert!((30.0 - c) > (20.0 - b));
    }

    #[test]
    fn reset_reproduces_identical_outputs() {
        let mut filter = KalmanFilter::with_initial(1e-5, 1e-2, 0.0, 1.0);
        let inputs = [3.0, 4.5, 2.5, 6.0, 5.5];

        let first: Vec<f64> = inputs.iter().map(|&v| filter.update(v)).collect();
        filter.reset();
        let second: Vec<f64> = inputs.iter().map(|&v| filter.update(v)).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn filter_trait_rewrites_only_the_value() {
        let mut filter = KalmanFilter::new(1e-5, 1e-2);
        let out = filter.apply(sample(7.0, 1.0));
        assert_eq!(out.value, 7.0);
        assert_eq!(out.sensor_name, "depth");
        assert_eq!(out.unit.as_deref(), Some("m"));

        let out = filter.apply(sample(8.0, 2.0));
        assert!(out.value > 7.0 && out.value < 8.0);
        assert_eq!(out.timestamp, 2.0);
    }
}
