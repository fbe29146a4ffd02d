//! Complementary filter over roll/pitch with gyro-only yaw.

use crate::calibration::accel_angles;
use crate::{CalibrationOffsets, FusionError, OrientationState, RawSample, Result};

pub const DEFAULT_ALPHA: f32 = 0.96;
pub const DEFAULT_MIN_DT_S: f32 = 0.001;
pub const ANGLE_LIMIT_DEG: f32 = 180.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterConfig {
    /// Weight of the gyro-integrated estimate, in (0, 1].
    pub alpha: f32,
    /// Floor applied to the tick interval, seconds.
    pub min_dt_s: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            min_dt_s: DEFAULT_MIN_DT_S,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(FusionError::InvalidParameter("alpha must be in (0, 1]"));
        }
        if !(self.min_dt_s > 0.0 && self.min_dt_s.is_finite()) {
            return Err(FusionError::InvalidParameter("min_dt_s must be positive"));
        }
        Ok(())
    }
}

pub struct ComplementaryFilter {
    config: FilterConfig,
    offsets: CalibrationOffsets,
    state: OrientationState,
    seeded: bool,
}

impl ComplementaryFilter {
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            offsets: CalibrationOffsets::default(),
            state: OrientationState::default(),
            seeded: false,
        })
    }

    pub fn offsets(&self) -> CalibrationOffsets {
        self.offsets
    }

    pub fn set_offsets(&mut self, offsets: CalibrationOffsets) {
        self.offsets = offsets;
    }

    pub fn state(&self) -> OrientationState {
        self.state
    }

    /// Forget the current attitude; the next tick re-seeds from the accelerometer.
    pub fn reset(&mut self) {
        self.state = OrientationState::default();
        self.seeded = false;
    }

    /// Clamp a reported interval to something safe to integrate with.
    pub fn effective_dt(&self, dt_s: f32) -> f32 {
        if dt_s.is_finite() && dt_s > self.config.min_dt_s {
            dt_s
        } else {
            self.config.min_dt_s
        }
    }

    /// Advance the filter by one tick.
    ///
    /// Every field of the returned state is finite: a non-finite intermediate
    /// keeps the previous value for that axis.
    pub fn update(&mut self, sample: &RawSample, dt_s: f32) -> OrientationState {
        let dt = self.effective_dt(dt_s);
        let prev = self.state;
        let gyro = sample.gyro - self.offsets.gyro;
        let tilt = accel_angles(&sample.accel).map(|(roll, pitch)| {
            (
                roll - self.offsets.accel_roll,
                pitch - self.offsets.accel_pitch,
            )
        });

        // No absolute heading reference; yaw drifts with the gyro.
        let gyro_yaw = finite_or(wrap_angle(prev.gyro_yaw + gyro.z * dt), prev.gyro_yaw);
        self.state.gyro_yaw = gyro_yaw;
        self.state.yaw = gyro_yaw;

        if !self.seeded {
            if let Some((roll, pitch)) = tilt {
                self.state.roll = clamp_angle(finite_or(roll, prev.roll));
                self.state.pitch = clamp_angle(finite_or(pitch, prev.pitch));
                self.seeded = true;
                return self.state;
            }
        }

        let alpha = self.config.alpha;
        let blend = |previous: f32, rate: f32, absolute: Option<f32>| {
            let integrated = previous + rate * dt;
            match absolute {
                Some(a) => alpha * integrated + (1.0 - alpha) * a,
                None => integrated,
            }
        };

        let roll = blend(prev.roll, gyro.x, tilt.map(|t| t.0));
        let pitch = blend(prev.pitch, gyro.y, tilt.map(|t| t.1));
        self.state.roll = clamp_angle(finite_or(roll, prev.roll));
        self.state.pitch = clamp_angle(finite_or(pitch, prev.pitch));

        self.state
    }
}

pub(crate) fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else if fallback.is_finite() {
        fallback
    } else {
        0.0
    }
}

fn clamp_angle(deg: f32) -> f32 {
    deg.clamp(-ANGLE_LIMIT_DEG, ANGLE_LIMIT_DEG)
}

fn wrap_angle(deg: f32) -> f32 {
    if !deg.is_finite() {
        return deg;
    }
    let mut d = deg % 360.0;
    if d > 180.0 {
        d -= 360.0;
    } else if d < -180.0 {
        d += 360.0;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Axes;

    fn sample(accel: Axes, gyro: Axes) -> RawSample {
        RawSample {
            accel,
            gyro,
            temp_raw: 0,
        }
    }

    fn in_range(s: &OrientationState) -> bool {
        s.is_finite()
            && [s.roll, s.pitch, s.yaw]
                .iter()
                .all(|a| (-180.0..=180.0).contains(a))
    }

    #[test]
    fn test_first_tick_seeds_from_accel() {
        let mut f = ComplementaryFilter::new(FilterConfig::default()).unwrap();
        let s = f.update(
            &sample(Axes::new(0.0, 0.5, 3.0f32.sqrt() / 2.0), Axes::ZERO),
            0.05,
        );
        assert!((s.roll - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_gyro_integration_dominates_short_term() {
        let mut f = ComplementaryFilter::new(FilterConfig::default()).unwrap();
        let level = Axes::new(0.0, 0.0, 1.0);
        f.update(&sample(level, Axes::ZERO), 0.05);
        // 10 deg/s about x for 0.1s with the accelerometer still reading level.
        let s = f.update(&sample(level, Axes::new(10.0, 0.0, 0.0)), 0.1);
        assert!((s.roll - 0.96).abs() < 1e-4);
    }

    #[test]
    fn test_yaw_is_gyro_only_and_wraps() {
        let mut f = ComplementaryFilter::new(FilterConfig::default()).unwrap();
        let level = Axes::new(0.0, 0.0, 1.0);
        f.update(&sample(level, Axes::ZERO), 0.05);
        let mut s = OrientationState::default();
        for _ in 0..20 {
            s = f.update(&sample(level, Axes::new(0.0, 0.0, 100.0)), 0.1);
        }
        // 200 degrees of rotation wraps to -160.
        assert!((s.yaw + 160.0).abs() < 1e-2, "yaw = {}", s.yaw);
        assert_eq!(s.yaw, s.gyro_yaw);
    }

    #[test]
    fn test_seeding_tick_still_integrates_yaw() {
        let mut f = ComplementaryFilter::new(FilterConfig::default()).unwrap();
        let level = Axes::new(0.0, 0.0, 1.0);
        let s = f.update(&sample(level, Axes::new(0.0, 0.0, 20.0)), 0.5);
        assert!((s.yaw - 10.0).abs() < 1e-4, "yaw = {}", s.yaw);
        f.reset();
        let s = f.update(&sample(level, Axes::new(0.0, 0.0, -20.0)), 0.5);
        assert!((s.yaw + 10.0).abs() < 1e-4, "yaw = {}", s.yaw);
    }

    #[test]
    fn test_non_positive_dt_is_clamped() {
        let mut f = ComplementaryFilter::new(FilterConfig::default()).unwrap();
        assert_eq!(f.effective_dt(0.0), DEFAULT_MIN_DT_S);
        assert_eq!(f.effective_dt(-1.0), DEFAULT_MIN_DT_S);
        assert_eq!(f.effective_dt(f32::NAN), DEFAULT_MIN_DT_S);
        let level = Axes::new(0.0, 0.0, 1.0);
        for dt in [0.0, -0.5, f32::INFINITY, f32::NAN] {
            let s = f.update(&sample(level, Axes::new(50.0, 50.0, 50.0)), dt);
            assert!(in_range(&s));
        }
    }

    #[test]
    fn test_state_stays_finite_under_garbage() {
        let mut f = ComplementaryFilter::new(FilterConfig::default()).unwrap();
        let inputs = [
            sample(Axes::new(0.0, 0.0, 1.0), Axes::ZERO),
            sample(Axes::new(f32::NAN, 1.0, 1.0), Axes::new(f32::INFINITY, 0.0, 0.0)),
            sample(Axes::ZERO, Axes::new(f32::NAN, f32::NAN, f32::NAN)),
            sample(Axes::new(1e30, -1e30, 1e30), Axes::new(1e30, -1e30, 1e30)),
            sample(Axes::new(0.2, -0.9, 0.1), Axes::new(-400.0, 250.0, 2000.0)),
        ];
        for (i, s) in inputs.iter().cycle().take(200).enumerate() {
            let out = f.update(s, 0.02 * (i % 3) as f32);
            assert!(in_range(&out), "tick {i}: {out:?}");
        }
    }

    #[test]
    fn test_rejects_bad_alpha() {
        let cfg = FilterConfig {
            alpha: 1.5,
            ..Default::default()
        };
        assert!(ComplementaryFilter::new(cfg).is_err());
    }
}
