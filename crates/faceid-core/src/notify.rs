//! Fire-and-forget event sink.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UnknownDetected,
    Enrolled,
    IntegrityViolation,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownDetected => "unknown_detected",
            Self::Enrolled => "enrolled",
            Self::IntegrityViolation => "integrity_violation",
        }
    }
}

/// Serializes as `{"event": "...", "identityId": "...", "timestamp": "..."}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event: EventKind, identity_id: Option<String>) -> Self {
        Self {
            event,
            identity_id,
            timestamp: Utc::now(),
        }
    }

    pub fn unknown_detected(closest: Option<String>) -> Self {
        Self::new(EventKind::UnknownDetected, closest)
    }

    pub fn enrolled(identity_id: impl Into<String>) -> Self {
        Self::new(EventKind::Enrolled, Some(identity_id.into()))
    }

    pub fn integrity_violation(identity_id: impl Into<String>) -> Self {
        Self::new(EventKind::IntegrityViolation, Some(identity_id.into()))
    }
}

/// Receives engine events. Implementations must not block or fail the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Emits every event as a structured tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &Event) {
        let identity = event.identity_id.as_deref().unwrap_or("-");
        match event.event {
            EventKind::IntegrityViolation => tracing::warn!(
                event = event.event.as_str(),
                identity,
                timestamp = %event.timestamp.to_rfc3339(),
                "integrity violation"
            ),
            _ => tracing::info!(
                event = event.event.as_str(),
                identity,
                timestamp = %event.timestamp.to_rfc3339(),
                "event"
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(Event::enrolled("abc")).unwrap();
        assert_eq!(json["event"], "enrolled");
        assert_eq!(json["identityId"], "abc");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_event_without_identity_omits_field() {
        let json = serde_json::to_value(Event::unknown_detected(None)).unwrap();
        assert_eq!(json["event"], "unknown_detected");
        assert!(json.get("identityId").is_none());
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in [EventKind::UnknownDetected, EventKind::Enrolled, EventKind::IntegrityViolation] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }
}
