use crate::tags::*;
use crate::{Command, DeviceMessage, ProtocolError, Result};

impl Command {
    /// Render as one newline-terminated wire line.
    pub fn encode(&self) -> Result<String> {
        let body = match self {
            Command::StartSession(id) => {
                check_frameable(id, "session id")?;
                format!("{START_SESSION}{id}")
            }
            Command::StopSession => STOP_SESSION.to_string(),
            Command::SetExercise(mode) => format!("{SET_EXERCISE}{mode}"),
            Command::Calibrate => CALIBRATE.to_string(),
            Command::GetStatus => GET_STATUS.to_string(),
        };
        Ok(terminate(body))
    }
}

impl DeviceMessage {
    /// Render as one newline-terminated wire line.
    pub fn encode(&self) -> Result<String> {
        let body = match self {
            DeviceMessage::Telemetry(frame) => {
                frame.validate()?;
                let json = serde_json::to_string(frame)
                    .map_err(|e| ProtocolError::Schema(e.to_string()))?;
                format!("{KNEE_DATA}{json}")
            }
            DeviceMessage::SessionStarted(id) => {
                check_frameable(id, "session id")?;
                format!("{SESSION_STARTED}{id}")
            }
            DeviceMessage::SessionStopped => SESSION_STOPPED.to_string(),
            DeviceMessage::Calibrating => CALIBRATING.to_string(),
            DeviceMessage::CalibrationComplete => CALIBRATION_COMPLETE.to_string(),
            DeviceMessage::SystemReady => SYSTEM_READY.to_string(),
            DeviceMessage::Status(status) => {
                let state = if status.recording {
                    STATUS_RECORDING
                } else {
                    STATUS_IDLE
                };
                let sid = status.session_id.as_deref().unwrap_or("");
                check_frameable(sid, "session id")?;
                format!("{STATUS}{state}:{sid}:{}", status.exercise_mode.code())
            }
            DeviceMessage::Diagnostic(text) => {
                check_frameable(text, "diagnostic")?;
                text.clone()
            }
        };
        Ok(terminate(body))
    }
}

fn terminate(mut body: String) -> String {
    body.push(TERMINATOR);
    body
}

fn check_frameable(s: &str, what: &'static str) -> Result<()> {
    if s.chars().any(|c| c == '\n' || c == '\r') {
        return Err(ProtocolError::Unframeable(what));
    }
    Ok(())
}
