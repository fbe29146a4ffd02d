use crate::{Axes, CalibrationOffsets, FusionError, RawSample, Result};

/// Smallest vector magnitude accepted as an arctangent denominator.
pub const MIN_DENOMINATOR: f32 = 0.01;

/// Sample count used for a calibration capture.
pub const DEFAULT_CALIBRATION_SAMPLES: usize = 200;

/// Tilt angles (roll, pitch) in degrees implied by the gravity vector alone.
///
/// Returns `None` when either denominator is below [`MIN_DENOMINATOR`],
/// e.g. during free fall or with a disconnected sensor reading all zeros.
pub fn accel_angles(accel: &Axes) -> Option<(f32, f32)> {
    let roll_den = (accel.x * accel.x + accel.z * accel.z).sqrt();
    let pitch_den = (accel.y * accel.y + accel.z * accel.z).sqrt();
    if !(roll_den >= MIN_DENOMINATOR) || !(pitch_den >= MIN_DENOMINATOR) {
        return None;
    }
    let roll = (accel.y / roll_den).atan().to_degrees();
    let pitch = (-accel.x / pitch_den).atan().to_degrees();
    if roll.is_finite() && pitch.is_finite() {
        Some((roll, pitch))
    } else {
        None
    }
}

/// Average a stationary capture into a fresh set of offsets.
///
/// Samples whose accelerometer denominators are too small only contribute to
/// the gyroscope average. Non-finite gyroscope readings are skipped entirely.
pub fn calibrate<I>(samples: I) -> Result<CalibrationOffsets>
where
    I: IntoIterator<Item = RawSample>,
{
    let mut total = 0usize;
    let mut gyro_n = 0usize;
    let mut gyro_sum = (0.0f64, 0.0f64, 0.0f64);
    let mut accel_n = 0usize;
    let mut roll_sum = 0.0f64;
    let mut pitch_sum = 0.0f64;

    for sample in samples {
        total += 1;
        if sample.gyro.is_finite() {
            gyro_sum.0 += f64::from(sample.gyro.x);
            gyro_sum.1 += f64::from(sample.gyro.y);
            gyro_sum.2 += f64::from(sample.gyro.z);
            gyro_n += 1;
        }
        if let Some((roll, pitch)) = accel_angles(&sample.accel) {
            roll_sum += f64::from(roll);
            pitch_sum += f64::from(pitch);
            accel_n += 1;
        }
    }

    if total == 0 {
        return Err(FusionError::NoSamples);
    }
    if accel_n == 0 {
        tracing::warn!(total, "no usable accelerometer samples; tilt offsets left at zero");
    }

    let mean = |sum: f64, n: usize| if n == 0 { 0.0 } else { (sum / n as f64) as f32 };
    let offsets = CalibrationOffsets {
        accel_roll: mean(roll_sum, accel_n),
        accel_pitch: mean(pitch_sum, accel_n),
        gyro: Axes::new(
            mean(gyro_sum.0, gyro_n),
            mean(gyro_sum.1, gyro_n),
            mean(gyro_sum.2, gyro_n),
        ),
    };
    if !(offsets.accel_roll.is_finite()
        && offsets.accel_pitch.is_finite()
        && offsets.gyro.is_finite())
    {
        return Err(FusionError::NonFiniteOffset);
    }

    tracing::info!(
        samples = total,
        accel_samples = accel_n,
        roll = offsets.accel_roll,
        pitch = offsets.accel_pitch,
        gx = offsets.gyro.x,
        gy = offsets.gyro.y,
        gz = offsets.gyro.z,
        "calibration complete"
    );
    Ok(offsets)
}
