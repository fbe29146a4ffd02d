use crate::SensorError;
use imu_fusion::RawSample;

/// A 6-axis sensor read once per tick.
pub trait SensorSource: Send {
    fn read(&mut self) -> Result<RawSample, SensorError>;
}

impl<S: SensorSource + ?Sized> SensorSource for Box<S> {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        (**self).read()
    }
}

#[cfg(feature = "sim")]
pub use sim::SimulatedImu;

#[cfg(feature = "sim")]
mod sim {
    use super::SensorSource;
    use crate::SensorError;
    use imu_fusion::{Axes, RawSample};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Synthetic leg swinging in the sagittal plane.
    ///
    /// The first `still_samples` reads are stationary so a boot calibration
    /// sees a still sensor; after that pitch follows a sine between
    /// `-center - amplitude` and `-center + amplitude`.
    pub struct SimulatedImu {
        rng: StdRng,
        sample_period_s: f32,
        still_samples: usize,
        reads: usize,
        center_deg: f32,
        amplitude_deg: f32,
        cycle_s: f32,
        gyro_bias: Axes,
        noise: f32,
        temp_raw: i16,
    }

    impl SimulatedImu {
        pub fn new(seed: u64, sample_period_s: f32) -> Self {
            Self {
                rng: StdRng::seed_from_u64(seed),
                sample_period_s,
                still_samples: 0,
                reads: 0,
                center_deg: 45.0,
                amplitude_deg: 35.0,
                cycle_s: 4.0,
                gyro_bias: Axes::new(0.8, -0.4, 0.2),
                noise: 0.01,
                temp_raw: -1700,
            }
        }

        /// A sensor that never moves.
        pub fn stationary(seed: u64) -> Self {
            let mut imu = Self::new(seed, 0.05);
            imu.amplitude_deg = 0.0;
            imu.center_deg = 0.0;
            imu
        }

        pub fn with_still_samples(mut self, n: usize) -> Self {
            self.still_samples = n;
            self
        }

        pub fn with_motion(mut self, center_deg: f32, amplitude_deg: f32, cycle_s: f32) -> Self {
            self.center_deg = center_deg;
            self.amplitude_deg = amplitude_deg;
            self.cycle_s = cycle_s.max(0.1);
            self
        }

        pub fn with_noise(mut self, noise: f32) -> Self {
            self.noise = noise.max(0.0);
            self
        }

        fn jitter(&mut self) -> f32 {
            if self.noise == 0.0 {
                0.0
            } else {
                self.rng.gen_range(-self.noise..self.noise)
            }
        }
    }

    impl SensorSource for SimulatedImu {
        fn read(&mut self) -> Result<RawSample, SensorError> {
            let moving_reads = self.reads.saturating_sub(self.still_samples);
            self.reads += 1;

            let t = moving_reads as f32 * self.sample_period_s;
            let w = core::f32::consts::TAU / self.cycle_s;
            let (pitch_deg, rate_dps) = if self.reads <= self.still_samples {
                (-self.center_deg, 0.0)
            } else {
                (
                    -self.center_deg + self.amplitude_deg * (w * t).sin(),
                    self.amplitude_deg * w * (w * t).cos(),
                )
            };

            let p = pitch_deg.to_radians();
            let accel = Axes::new(
                -p.sin() + self.jitter(),
                self.jitter(),
                p.cos() + self.jitter(),
            );
            let gyro = Axes::new(
                self.gyro_bias.x + self.jitter() * 10.0,
                self.gyro_bias.y + rate_dps + self.jitter() * 10.0,
                self.gyro_bias.z + self.jitter() * 10.0,
            );
            Ok(RawSample {
                accel,
                gyro,
                temp_raw: self.temp_raw,
            })
        }
    }
}
