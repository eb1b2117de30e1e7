//! Event kinds, status enums, and actor types.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// Event type names as sent by the HR system.
pub mod event_types {
    pub const EMPLOYEE_ADMITTED: &str = "colaborador.admitido";
    pub const EMPLOYEE_TRANSFERRED: &str = "colaborador.transferido";
    pub const EMPLOYEE_TERMINATED: &str = "colaborador.desligado";
    pub const EMPLOYEE_PROMOTED: &str = "colaborador.promovido";
}

// =============================================================================
// Event Kind
// =============================================================================

/// Kind of employee lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Admission,
    Transfer,
    Termination,
    Promotion,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Admission,
        EventKind::Transfer,
        EventKind::Termination,
        EventKind::Promotion,
    ];

    /// Returns the HR system's event type name for this kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::Admission => event_types::EMPLOYEE_ADMITTED,
            EventKind::Transfer => event_types::EMPLOYEE_TRANSFERRED,
            EventKind::Termination => event_types::EMPLOYEE_TERMINATED,
            EventKind::Promotion => event_types::EMPLOYEE_PROMOTED,
        }
    }

    /// Parses an HR system event type name.
    pub fn from_event_type(event_type: &str) -> Result<Self, EventError> {
        match event_type {
            event_types::EMPLOYEE_ADMITTED => Ok(EventKind::Admission),
            event_types::EMPLOYEE_TRANSFERRED => Ok(EventKind::Transfer),
            event_types::EMPLOYEE_TERMINATED => Ok(EventKind::Termination),
            event_types::EMPLOYEE_PROMOTED => Ok(EventKind::Promotion),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Admission => "admission",
            EventKind::Transfer => "transfer",
            EventKind::Termination => "termination",
            EventKind::Promotion => "promotion",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Status Enums
// =============================================================================

/// Employment status reported by the HR system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmployeeStatus {
    #[serde(rename = "ativo")]
    Active,
    #[serde(rename = "afastado")]
    OnLeave,
    #[serde(rename = "ferias")]
    Vacation,
    #[serde(rename = "desligado")]
    Terminated,
}

impl EmployeeStatus {
    /// Wire values accepted in payloads.
    pub const WIRE_VALUES: [&'static str; 4] = ["ativo", "afastado", "ferias", "desligado"];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ativo" => Some(EmployeeStatus::Active),
            "afastado" => Some(EmployeeStatus::OnLeave),
            "ferias" => Some(EmployeeStatus::Vacation),
            "desligado" => Some(EmployeeStatus::Terminated),
            _ => None,
        }
    }
}

// =============================================================================
// Actors
// =============================================================================

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// The HR system delivering webhooks.
    HrSystem,
    /// An operator using the administrative API.
    Operator,
    /// The service itself (scheduler, cleanup).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::HrSystem => write!(f, "hr_system"),
            ActorType::Operator => write!(f, "operator"),
            ActorType::System => write!(f, "system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_event_type(kind.event_type()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_event_type() {
        let err = EventKind::from_event_type("colaborador.demitido_admitido").unwrap_err();
        assert!(matches!(err, EventError::UnknownEventType(_)));
    }

    #[test]
    fn test_status_wire_values() {
        for value in EmployeeStatus::WIRE_VALUES {
            let status = EmployeeStatus::parse(value).unwrap();
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{value}\"")
            );
        }
        assert!(EmployeeStatus::parse("active").is_none());
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::HrSystem.to_string(), "hr_system");
        assert_eq!(
            serde_json::to_string(&ActorType::Operator).unwrap(),
            "\"operator\""
        );
    }
}
