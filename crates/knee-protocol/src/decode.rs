use crate::tags::*;
use crate::{Command, DeviceMessage, DeviceStatus, ProtocolError, Result, TelemetryFrame};
use imu_fusion::ExerciseMode;

/// Classify one device line.
///
/// Telemetry must match the schema exactly; a mismatch is an error so the
/// caller can surface it without tearing the link down. Lines with an
/// unrecognised tag are returned as [`DeviceMessage::Diagnostic`].
pub fn parse_line(line: &str) -> Result<DeviceMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if let Some(payload) = line.strip_prefix(KNEE_DATA) {
        return decode_telemetry(payload).map(DeviceMessage::Telemetry);
    }
    if let Some(id) = line.strip_prefix(SESSION_STARTED) {
        let id = id.trim();
        if id.is_empty() {
            return Err(ProtocolError::InvalidPayload {
                tag: SESSION_STARTED,
                reason: "missing session id".into(),
            });
        }
        return Ok(DeviceMessage::SessionStarted(id.to_string()));
    }
    if let Some(payload) = line.strip_prefix(STATUS) {
        return decode_status(payload).map(DeviceMessage::Status);
    }
    let msg = match line {
        SESSION_STOPPED => DeviceMessage::SessionStopped,
        CALIBRATING => DeviceMessage::Calibrating,
        CALIBRATION_COMPLETE => DeviceMessage::CalibrationComplete,
        SYSTEM_READY => DeviceMessage::SystemReady,
        other => DeviceMessage::Diagnostic(other.to_string()),
    };
    Ok(msg)
}

pub fn decode_telemetry(payload: &str) -> Result<TelemetryFrame> {
    let frame: TelemetryFrame =
        serde_json::from_str(payload.trim()).map_err(|e| ProtocolError::Schema(e.to_string()))?;
    frame.validate()?;
    Ok(frame)
}

fn decode_status(payload: &str) -> Result<DeviceStatus> {
    let invalid = |reason: &str| ProtocolError::InvalidPayload {
        tag: STATUS,
        reason: reason.to_string(),
    };
    let (state, rest) = payload
        .split_once(':')
        .ok_or_else(|| invalid("expected <state>:<session>:<mode>"))?;
    // Session ids may themselves contain ':'; the mode is always last.
    let (sid, mode) = rest
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected <state>:<session>:<mode>"))?;
    let recording = match state {
        STATUS_RECORDING => true,
        STATUS_IDLE => false,
        _ => return Err(invalid("state must be RECORDING or IDLE")),
    };
    let code: u8 = mode.trim().parse().map_err(|_| invalid("mode is not an integer"))?;
    let exercise_mode = ExerciseMode::from_code(code).ok_or_else(|| invalid("mode out of range"))?;
    let sid = sid.trim();
    Ok(DeviceStatus {
        recording,
        session_id: if sid.is_empty() {
            None
        } else {
            Some(sid.to_string())
        },
        exercise_mode,
    })
}

impl Command {
    /// Parse one host line on the device side.
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if let Some(id) = line.strip_prefix(START_SESSION) {
            let id = id.trim();
            if id.is_empty() {
                return Err(ProtocolError::InvalidPayload {
                    tag: START_SESSION,
                    reason: "missing session id".into(),
                });
            }
            return Ok(Command::StartSession(id.to_string()));
        }
        if let Some(mode) = line.strip_prefix(SET_EXERCISE) {
            let code = mode
                .trim()
                .parse::<u8>()
                .map_err(|e| ProtocolError::InvalidPayload {
                    tag: SET_EXERCISE,
                    reason: e.to_string(),
                })?;
            return Ok(Command::SetExercise(code));
        }
        match line {
            STOP_SESSION => Ok(Command::StopSession),
            CALIBRATE => Ok(Command::Calibrate),
            GET_STATUS => Ok(Command::GetStatus),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}
