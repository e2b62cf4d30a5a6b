//! Single-channel NLMS adaptive filter producing anti-noise.
//!
//! The filter keeps the last `order` reference samples in a circular history
//! addressed by a cursor, so pushing a sample is O(1). Each [`NlmsFilter::step`]
//! predicts the desired sample from the history, returns the negated prediction
//! as anti-noise and adapts the taps with the normalized LMS rule
//! `w_i += (mu / (sum(x_i^2) + epsilon)) * e * x_i`.
//!
//! Arithmetic is carried out in `f64`; the sample interface is `f32`.

use thiserror::Error;

/// Regularization added to the history power before normalizing the step.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Weight-vector L2 norm above which the filter is considered diverged.
pub const DEFAULT_NORM_CEILING: f64 = 10.0;

/// How the filter obtains the history power for the normalization term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// Recompute `sum(x_i^2)` every sample alongside the prediction.
    Exact,
    /// Track the power incrementally as samples enter and leave the history,
    /// resynchronising exactly once per `order` samples.
    Running,
}

/// Divergence detected after a weight update.
///
/// The filter has already reset itself when this is reported.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum NumericInstability {
    #[error("weight vector contains a non-finite value")]
    NonFinite,
    #[error("weight norm {norm} exceeded ceiling {ceiling}")]
    NormExceeded { norm: f64, ceiling: f64 },
}

/// Outcome of a single filter step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// Negated prediction, computed before any reset.
    pub anti_noise: f32,
    /// A priori error `desired - prediction`.
    pub error: f64,
    pub instability: Option<NumericInstability>,
}

/// Summary of a block run through [`NlmsFilter::process_block`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockReport {
    pub instabilities: usize,
    pub last_instability: Option<NumericInstability>,
}

/// Construction parameters for [`NlmsFilter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NlmsOptions {
    pub order: usize,
    pub mu: f64,
    pub epsilon: f64,
    pub norm_ceiling: f64,
    pub power: PowerMode,
}

impl NlmsOptions {
    pub fn new(order: usize, mu: f64) -> Self {
        Self {
            order,
            mu,
            epsilon: DEFAULT_EPSILON,
            norm_ceiling: DEFAULT_NORM_CEILING,
            power: PowerMode::Exact,
        }
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn norm_ceiling(mut self, ceiling: f64) -> Self {
        self.norm_ceiling = ceiling;
        self
    }

    pub fn power(mut self, power: PowerMode) -> Self {
        self.power = power;
        self
    }
}

/// Normalized Least Mean Squares filter with divergence protection.
#[derive(Debug, Clone)]
pub struct NlmsFilter {
    taps: Vec<f64>,
    history: Vec<f64>,
    history_pos: usize,
    energy: f64,
    since_resync: usize,
    mu: f64,
    epsilon: f64,
    norm_ceiling: f64,
    power: PowerMode,
    resets: u64,
}

impl NlmsFilter {
    /// Creates a filter with `tap_len` taps and default regularization.
    pub fn new(tap_len: usize, mu: f64) -> Self {
        Self::with_options(NlmsOptions::new(tap_len, mu))
    }

    /// Creates a filter from explicit options. Weights and history start at zero.
    pub fn with_options(options: NlmsOptions) -> Self {
        assert!(options.order > 0, "order must be positive");
        Self {
            taps: vec![0.0; options.order],
            history: vec![0.0; options.order],
            history_pos: 0,
            energy: 0.0,
            since_resync: 0,
            mu: options.mu,
            epsilon: options.epsilon,
            norm_ceiling: options.norm_ceiling,
            power: options.power,
            resets: 0,
        }
    }

    /// Pushes `reference` into the history, predicts `desired` and adapts.
    ///
    /// Non-finite inputs are treated as silence. If the updated weights are
    /// non-finite or exceed the norm ceiling, the filter returns to its
    /// initial zero state and the step reports the instability; the returned
    /// anti-noise still comes from the prediction made before the reset.
    pub fn step(&mut self, reference: f32, desired: f32) -> Step {
        let new_sample = sanitize(reference);
        let desired = sanitize(desired);
        let len = self.history.len();

        let old_sample = self.history[self.history_pos];
        self.history[self.history_pos] = new_sample;
        self.history_pos += 1;
        if self.history_pos == len {
            self.history_pos = 0;
        }

        let (estimate, power) = match self.power {
            PowerMode::Exact => self.estimate_with_power(),
            PowerMode::Running => {
                let estimate = self.estimate();
                (estimate, self.track_energy(new_sample, old_sample))
            }
        };
        let error = desired - estimate;

        let norm_sq = self.update_taps(error, power + self.epsilon);
        let instability = self.check_norm(norm_sq);
        if instability.is_some() {
            self.reset();
            self.resets += 1;
        }

        Step {
            anti_noise: saturate(-estimate),
            error,
            instability,
        }
    }

    /// Runs [`step`](Self::step) over whole blocks.
    ///
    /// Each slice must share the same length.
    pub fn process_block(
        &mut self,
        reference: &[f32],
        desired: &[f32],
        anti_noise: &mut [f32],
        error: &mut [f64],
    ) -> BlockReport {
        assert_eq!(
            reference.len(),
            desired.len(),
            "reference and desired blocks must match"
        );
        assert_eq!(
            reference.len(),
            anti_noise.len(),
            "anti-noise buffer length must match reference block"
        );
        assert_eq!(
            reference.len(),
            error.len(),
            "error buffer length must match reference block"
        );

        let mut report = BlockReport::default();
        for idx in 0..reference.len() {
            let step = self.step(reference[idx], desired[idx]);
            anti_noise[idx] = step.anti_noise;
            error[idx] = step.error;
            if let Some(instability) = step.instability {
                report.instabilities += 1;
                report.last_instability = Some(instability);
            }
        }
        report
    }

    /// Returns the filter to its initial zero state. Parameters are kept.
    pub fn reset(&mut self) {
        self.taps.fill(0.0);
        self.history.fill(0.0);
        self.history_pos = 0;
        self.energy = 0.0;
        self.since_resync = 0;
    }

    pub fn order(&self) -> usize {
        self.taps.len()
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Changes the step size without touching taps or history.
    pub fn set_mu(&mut self, mu: f64) {
        self.mu = mu;
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn norm_ceiling(&self) -> f64 {
        self.norm_ceiling
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power
    }

    /// Switches how the history power is obtained. Entering
    /// [`PowerMode::Running`] seeds the running total from the current history.
    pub fn set_power_mode(&mut self, power: PowerMode) {
        if power == PowerMode::Running && self.power != PowerMode::Running {
            self.energy = self.history.iter().map(|x| x * x).sum();
            self.since_resync = 0;
        }
        self.power = power;
    }

    /// Current taps, newest-sample tap first.
    pub fn weights(&self) -> &[f64] {
        &self.taps
    }

    pub fn weight_norm(&self) -> f64 {
        self.taps.iter().map(|w| w * w).sum::<f64>().sqrt()
    }

    /// Number of automatic resets since construction.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    fn estimate(&self) -> f64 {
        let len = self.history.len();
        let mut idx = self.history_pos;
        let mut acc = 0.0;
        for weight in &self.taps {
            idx = dec_idx(len, idx);
            acc += weight * self.history[idx];
        }
        acc
    }

    fn estimate_with_power(&self) -> (f64, f64) {
        let len = self.history.len();
        let mut idx = self.history_pos;
        let mut acc = 0.0;
        let mut power = 0.0;
        for weight in &self.taps {
            idx = dec_idx(len, idx);
            let sample = self.history[idx];
            acc += weight * sample;
            power += sample * sample;
        }
        (acc, power)
    }

    fn track_energy(&mut self, new_sample: f64, old_sample: f64) -> f64 {
        self.since_resync += 1;
        if self.since_resync >= self.history.len() {
            self.energy = self.history.iter().map(|x| x * x).sum();
            self.since_resync = 0;
        } else {
            self.energy += new_sample * new_sample - old_sample * old_sample;
            if self.energy < 0.0 {
                self.energy = 0.0;
            }
        }
        self.energy
    }

    /// Applies the NLMS update and returns the squared norm of the new taps.
    fn update_taps(&mut self, error: f64, norm: f64) -> f64 {
        let scale = self.mu * error / norm;

        let len = self.history.len();
        let mut idx = self.history_pos;
        let mut norm_sq = 0.0;
        for weight in &mut self.taps {
            idx = dec_idx(len, idx);
            *weight += scale * self.history[idx];
            norm_sq += *weight * *weight;
        }
        norm_sq
    }

    fn check_norm(&self, norm_sq: f64) -> Option<NumericInstability> {
        if !norm_sq.is_finite() {
            return Some(NumericInstability::NonFinite);
        }
        let norm = norm_sq.sqrt();
        if norm > self.norm_ceiling {
            return Some(NumericInstability::NormExceeded {
                norm,
                ceiling: self.norm_ceiling,
            });
        }
        None
    }
}

fn dec_idx(len: usize, idx: usize) -> usize {
    if idx == 0 {
        len - 1
    } else {
        idx - 1
    }
}

fn sanitize(sample: f32) -> f64 {
    if sample.is_finite() {
        sample as f64
    } else {
        0.0
    }
}

fn saturate(value: f64) -> f32 {
    value.clamp(f32::MIN as f64, f32::MAX as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(len: usize, freq: f32, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|n| amplitude * (2.0 * PI * freq * n as f32 / 48_000.0).sin())
            .collect()
    }

    #[test]
    fn first_step_predicts_nothing() {
        let mut filter = NlmsFilter::new(8, 0.5);
        let step = filter.step(0.25, 0.25);
        assert_eq!(step.anti_noise, 0.0);
        assert_eq!(step.error, 0.25);
        assert!(step.instability.is_none());
        assert!(filter.weights()[0] > 0.0);
    }

    #[test]
    fn identical_runs_are_bit_identical() {
        let input = sine(3000, 440.0, 0.5);
        let options = NlmsOptions::new(64, 0.05).epsilon(1e-6);
        let mut a = NlmsFilter::with_options(options);
        let mut b = NlmsFilter::with_options(options);

        for &x in &input {
            let sa = a.step(x, x);
            let sb = b.step(x, x);
            assert_eq!(sa.anti_noise.to_bits(), sb.anti_noise.to_bits());
            assert_eq!(sa.error.to_bits(), sb.error.to_bits());
        }
        let bits_a: Vec<u64> = a.weights().iter().map(|w| w.to_bits()).collect();
        let bits_b: Vec<u64> = b.weights().iter().map(|w| w.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    #[test]
    fn error_shrinks_on_stationary_tone() {
        let input = sine(4000, 440.0, 0.5);
        let mut filter = NlmsFilter::with_options(NlmsOptions::new(128, 0.05));
        let mut early = 0.0;
        let mut late = 0.0;
        for (n, &x) in input.iter().enumerate() {
            let step = filter.step(x, x);
            if (200..400).contains(&n) {
                early += step.error * step.error;
            }
            if n >= 3800 {
                late += step.error * step.error;
            }
        }
        assert!(late < early * 1e-3, "early={early} late={late}");
    }

    #[test]
    fn running_power_matches_exact_closely() {
        let input = sine(2000, 300.0, 0.4);
        let mut exact = NlmsFilter::with_options(NlmsOptions::new(32, 0.1));
        let mut running =
            NlmsFilter::with_options(NlmsOptions::new(32, 0.1).power(PowerMode::Running));
        for &x in &input {
            let a = exact.step(x, x);
            let b = running.step(x, x);
            assert!((a.error - b.error).abs() < 1e-6);
        }
    }

    #[test]
    fn switching_power_mode_mid_stream_keeps_tracking() {
        let input = sine(1500, 300.0, 0.4);
        let mut exact = NlmsFilter::with_options(NlmsOptions::new(32, 0.1));
        let mut switched = NlmsFilter::with_options(NlmsOptions::new(32, 0.1));
        for (n, &x) in input.iter().enumerate() {
            if n == 700 {
                switched.set_power_mode(PowerMode::Running);
            }
            let a = exact.step(x, x);
            let b = switched.step(x, x);
            assert!((a.error - b.error).abs() < 1e-6);
        }
        assert_eq!(switched.power_mode(), PowerMode::Running);
    }

    #[test]
    fn adversarial_step_size_resets_instead_of_diverging() {
        let options = NlmsOptions::new(16, 10.0).epsilon(0.0);
        let mut filter = NlmsFilter::with_options(options);
        let input = sine(2000, 1000.0, 0.9);
        let mut instabilities = 0;
        for &x in &input {
            let step = filter.step(x, x);
            assert!(step.anti_noise.is_finite());
            assert!(step.error.is_finite());
            assert!(filter.weights().iter().all(|w| w.is_finite()));
            if step.instability.is_some() {
                instabilities += 1;
            }
        }
        assert!(instabilities > 0);
        assert_eq!(filter.resets(), instabilities);
    }

    #[test]
    fn zero_epsilon_on_silence_reports_non_finite() {
        let mut filter = NlmsFilter::with_options(NlmsOptions::new(4, 0.5).epsilon(0.0));
        let step = filter.step(0.0, 0.0);
        assert_eq!(step.instability, Some(NumericInstability::NonFinite));
        assert_eq!(step.anti_noise, 0.0);
        assert!(filter.weights().iter().all(|&w| w == 0.0));
    }

    #[test]
    fn non_finite_input_is_treated_as_silence() {
        let mut filter = NlmsFilter::new(4, 0.5);
        for x in [f32::NAN, f32::INFINITY, 0.3, f32::NEG_INFINITY, 0.1] {
            let step = filter.step(x, x);
            assert!(step.anti_noise.is_finite());
            assert!(step.error.is_finite());
        }
    }

    #[test]
    fn history_wraps_without_losing_alignment() {
        let mut filter = NlmsFilter::new(3, 0.0);
        for x in [1.0, 2.0, 3.0, 4.0, 5.0] {
            filter.step(x, 0.0);
        }
        // Newest sample sits behind the cursor.
        assert_eq!(filter.history_pos, 2);
        assert_eq!(filter.history[dec_idx(3, filter.history_pos)], 5.0);
        assert_eq!(filter.history, vec![4.0, 5.0, 3.0]);
    }

    #[test]
    fn block_matches_sample_steps() {
        let input = sine(256, 500.0, 0.3);
        let mut by_sample = NlmsFilter::new(16, 0.2);
        let mut by_block = NlmsFilter::new(16, 0.2);

        let expected: Vec<f32> = input
            .iter()
            .map(|&x| by_sample.step(x, x).anti_noise)
            .collect();
        let mut anti_noise = vec![0.0; input.len()];
        let mut error = vec![0.0; input.len()];
        let report = by_block.process_block(&input, &input, &mut anti_noise, &mut error);

        assert_eq!(report.instabilities, 0);
        assert_eq!(anti_noise, expected);
    }

    #[test]
    fn reset_keeps_parameters() {
        let mut filter = NlmsFilter::with_options(NlmsOptions::new(8, 0.3).norm_ceiling(4.0));
        for x in sine(100, 440.0, 0.5) {
            filter.step(x, x);
        }
        filter.reset();
        assert!(filter.weights().iter().all(|&w| w == 0.0));
        assert_eq!(filter.order(), 8);
        assert_eq!(filter.mu(), 0.3);
        assert_eq!(filter.norm_ceiling(), 4.0);
    }
}
