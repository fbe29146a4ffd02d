use crate::filter::finite_or;
use crate::ExerciseMode;

pub const JOINT_ANGLE_MIN_DEG: f32 = 0.0;
pub const JOINT_ANGLE_MAX_DEG: f32 = 160.0;

/// Derive the clinical joint angle from the two tiltable axes.
///
/// Flexion measures the included angle (`180 - |pitch|`), extension the
/// pitch itself, lateral the roll. The result is clamped to `[0, 160]` and
/// non-finite inputs yield `0`.
pub fn joint_angle(mode: ExerciseMode, roll: f32, pitch: f32) -> f32 {
    let raw = match mode {
        ExerciseMode::Flexion => 180.0 - pitch.abs(),
        ExerciseMode::Extension => pitch.abs(),
        ExerciseMode::Lateral => roll.abs(),
    };
    finite_or(raw, 0.0).clamp(JOINT_ANGLE_MIN_DEG, JOINT_ANGLE_MAX_DEG)
}

/// [`joint_angle`] for a raw wire code; unknown codes use the extension formula.
pub fn joint_angle_for_code(code: u8, roll: f32, pitch: f32) -> f32 {
    joint_angle(ExerciseMode::from_code_lossy(code), roll, pitch)
}
