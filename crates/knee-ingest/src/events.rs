use crate::{Recommendation, SessionState};
use knee_protocol::{DeviceStatus, TelemetryFrame};
use serde::{Deserialize, Serialize};

/// Connection state of the sensor link plus reachability of the analytics
/// endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub analytics_enabled: bool,
    pub analytics_reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub link: LinkStatus,
    pub session: Option<SessionState>,
    /// Last `STATUS:` reply from the device, if one has been seen on this link.
    pub device: Option<DeviceStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A line that failed the telemetry schema.
    Parse,
    Transport,
    Calibration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// One item on the live subscriber channel, as `{"type": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    Status(StatusReport),
    ArduinoConnected {
        port: String,
    },
    ArduinoDisconnected {
        port: String,
        reason: String,
    },
    KneeData(TelemetryFrame),
    SessionStarted(SessionState),
    SessionStopped(SessionState),
    CalibrationComplete,
    Error(ErrorEvent),
    /// An untagged device line, passed through verbatim.
    Diagnostic {
        line: String,
    },
    RecommendationsReceived {
        session_id: Option<String>,
        recommendations: Vec<Recommendation>,
    },
}

impl LiveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LiveEvent::Status(_) => "status",
            LiveEvent::ArduinoConnected { .. } => "arduino_connected",
            LiveEvent::ArduinoDisconnected { .. } => "arduino_disconnected",
            LiveEvent::KneeData(_) => "knee_data",
            LiveEvent::SessionStarted(_) => "session_started",
            LiveEvent::SessionStopped(_) => "session_stopped",
            LiveEvent::CalibrationComplete => "calibration_complete",
            LiveEvent::Error(_) => "error",
            LiveEvent::Diagnostic { .. } => "diagnostic",
            LiveEvent::RecommendationsReceived { .. } => "recommendations_received",
        }
    }

    pub(crate) fn error(kind: ErrorKind, message: impl Into<String>, raw: Option<String>) -> Self {
        LiveEvent::Error(ErrorEvent {
            kind,
            message: message.into(),
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let ev = LiveEvent::ArduinoConnected {
            port: "/dev/ttyACM0".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "arduino_connected", "data": {"port": "/dev/ttyACM0"}})
        );
        assert_eq!(
            serde_json::to_value(LiveEvent::CalibrationComplete).unwrap(),
            json!({"type": "calibration_complete"})
        );
        let err = LiveEvent::error(ErrorKind::Parse, "missing field", Some("KNEE_DATA:{}".into()));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"]["kind"], "parse");
        assert_eq!(v["data"]["raw"], "KNEE_DATA:{}");
    }

    #[test]
    fn test_kind_matches_tag() {
        let ev = LiveEvent::Diagnostic {
            line: "hello".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], ev.kind());
    }
}
