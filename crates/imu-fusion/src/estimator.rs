use crate::filter::{ComplementaryFilter, FilterConfig};
use crate::joint::joint_angle_for_code;
use crate::{calibrate, CalibrationOffsets, OrientationState, RawSample, Result, TempCalibration};

/// Output of one estimator tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Estimate {
    pub orientation: OrientationState,
    pub joint_angle: f32,
    pub temperature_c: f32,
}

/// Bias removal, fusion and joint-angle derivation behind one handle.
pub struct OrientationEstimator {
    filter: ComplementaryFilter,
    temp: TempCalibration,
}

impl OrientationEstimator {
    pub fn new(config: FilterConfig, temp: TempCalibration) -> Result<Self> {
        Ok(Self {
            filter: ComplementaryFilter::new(config)?,
            temp,
        })
    }

    /// Replace the offsets from a stationary capture and restart fusion.
    ///
    /// On error the previous offsets stay in effect.
    pub fn calibrate<I>(&mut self, samples: I) -> Result<CalibrationOffsets>
    where
        I: IntoIterator<Item = RawSample>,
    {
        let offsets = calibrate(samples)?;
        self.filter.set_offsets(offsets);
        self.filter.reset();
        Ok(offsets)
    }

    pub fn offsets(&self) -> CalibrationOffsets {
        self.filter.offsets()
    }

    pub fn orientation(&self) -> OrientationState {
        self.filter.state()
    }

    pub fn tick(&mut self, sample: &RawSample, dt_s: f32, mode_code: u8) -> Estimate {
        let orientation = self.filter.update(sample, dt_s);
        Estimate {
            orientation,
            joint_angle: joint_angle_for_code(mode_code, orientation.roll, orientation.pitch),
            temperature_c: self.temp.celsius(sample.temp_raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Axes;

    #[test]
    fn test_tick_after_calibration_removes_bias() {
        let mut est =
            OrientationEstimator::new(FilterConfig::default(), TempCalibration::default()).unwrap();
        let biased = RawSample {
            accel: Axes::new(0.0, 0.0, 1.0),
            gyro: Axes::new(2.0, -1.0, 0.5),
            temp_raw: 0,
        };
        est.calibrate(std::iter::repeat(biased).take(200)).unwrap();
        for _ in 0..100 {
            est.tick(&biased, 0.05, 1);
        }
        let o = est.orientation();
        assert!(o.roll.abs() < 1e-3);
        assert!(o.pitch.abs() < 1e-3);
        assert!(o.yaw.abs() < 1e-3);
    }

    #[test]
    fn test_temperature_from_register() {
        let mut est =
            OrientationEstimator::new(FilterConfig::default(), TempCalibration::default()).unwrap();
        let s = RawSample {
            accel: Axes::new(0.0, 0.0, 1.0),
            gyro: Axes::ZERO,
            temp_raw: -340,
        };
        let e = est.tick(&s, 0.05, 0);
        assert!((e.temperature_c - 35.53).abs() < 1e-3);
    }
}
