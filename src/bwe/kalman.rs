use crate::Config;

/// Residuals are capped at this many standard deviations when updating the
/// measurement noise estimate.
const MAX_RESIDUAL_STD: f64 = 3.0;
/// EWMA factor for the measurement variance while the filter warms up.
const VAR_ALPHA_EARLY: f64 = 0.1;
/// EWMA factor once more than [`EARLY_SAMPLES`] deltas have been observed.
const VAR_ALPHA_LATE: f64 = 0.01;
const EARLY_SAMPLES: usize = 10;
/// Lower bound on the measurement variance (ms²).
const MIN_VAR: f64 = 1.0;
/// Size deltas are normalized against a nominal full packet.
const NOMINAL_PACKET_BYTES: f64 = 1_200.0;

/// Scalar Kalman filter tracking the inter-group delay trend.
///
/// The state `m_hat` is the smoothed one-way delay gradient in milliseconds.
/// A growing positive estimate means queues are building along the path.
#[derive(Debug)]
pub(crate) struct KalmanFilter {
    /// Estimated delay gradient (ms).
    estimate: f64,
    /// Estimate error variance.
    error: f64,
    /// Process noise added per update.
    process_noise: f64,
    /// Measurement noise variance (ms²), adapted from residuals.
    var_v: f64,
    samples: usize,
}

impl KalmanFilter {
    pub fn new(config: &Config) -> Self {
        KalmanFilter {
            estimate: 0.0,
            error: 0.1,
            process_noise: config.kalman_process_noise,
            var_v: 1.0,
            samples: 0,
        }
    }

    /// Feed one inter-group delay measurement (ms) together with the size
    /// difference between the groups (bytes). Returns the updated estimate.
    pub fn update(&mut self, measurement_ms: f64, size_delta_bytes: f64) -> f64 {
        let residual = measurement_ms - self.estimate;

        // Adapt the measurement noise from the residual, capped so latency
        // spikes don't blow up the variance.
        let std = self.var_v.sqrt();
        let capped = residual.clamp(-MAX_RESIDUAL_STD * std, MAX_RESIDUAL_STD * std);
        let alpha = if self.samples > EARLY_SAMPLES {
            VAR_ALPHA_LATE
        } else {
            VAR_ALPHA_EARLY
        };
        self.var_v = (alpha * capped * capped + (1.0 - alpha) * self.var_v).max(MIN_VAR);

        // A large size difference between groups explains arrival spread
        // through serialization time rather than queue growth, so it lowers
        // the gain.
        let size_factor = 1.0 + size_delta_bytes.abs() / NOMINAL_PACKET_BYTES;

        self.error += self.process_noise;
        let gain = self.error / (self.error + size_factor * self.var_v);
        self.estimate += gain * residual;
        self.error *= 1.0 - gain;
        self.samples += 1;

        self.estimate
    }
}
