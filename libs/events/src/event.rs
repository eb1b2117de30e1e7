//! The employee lifecycle event.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{EmployeeStatus, EventKind};

/// Kind-specific data of an employee transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmployeeChange {
    /// A new hire.
    Admission,

    /// Move to the event's cost center. The role may change at the same time;
    /// when `previous_role_id` is absent the role is unchanged.
    Transfer {
        previous_cost_center_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_role_id: Option<String>,
    },

    /// The employee leaves the company.
    Termination { termination_date: NaiveDate },

    /// Move to the event's role inside the same cost center.
    Promotion { previous_role_id: String },
}

impl EmployeeChange {
    pub fn kind(&self) -> EventKind {
        match self {
            EmployeeChange::Admission => EventKind::Admission,
            EmployeeChange::Transfer { .. } => EventKind::Transfer,
            EmployeeChange::Termination { .. } => EventKind::Termination,
            EmployeeChange::Promotion { .. } => EventKind::Promotion,
        }
    }
}

/// One employee lifecycle transition ("colaborador" event).
///
/// `role_id` and `cost_center_id` always describe where the employee is
/// *after* the transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColaboradorEvent {
    pub employee_id: String,
    pub name: String,
    pub national_id: String,
    pub role_id: String,
    pub cost_center_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    pub shift: String,
    pub hire_date: NaiveDate,
    pub has_disability: bool,
    pub status: EmployeeStatus,
    /// Timestamp the HR system attached to the delivery.
    pub occurred_at: DateTime<Utc>,
    pub change: EmployeeChange,
}

impl ColaboradorEvent {
    pub fn kind(&self) -> EventKind {
        self.change.kind()
    }

    /// Key identifying the logical event across redeliveries.
    ///
    /// Two deliveries with the same employee, kind and HR timestamp are the
    /// same event.
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.employee_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.kind().event_type().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.occurred_at.timestamp_micros().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn admission(employee_id: &str, ts: i64) -> ColaboradorEvent {
        ColaboradorEvent {
            employee_id: employee_id.to_string(),
            name: "Maria Souza".to_string(),
            national_id: "12345678909".to_string(),
            role_id: "cargo_dev_junior".to_string(),
            cost_center_id: "cc_ti".to_string(),
            position_id: None,
            shift: "diurno".to_string(),
            hire_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            has_disability: false,
            status: EmployeeStatus::Active,
            occurred_at: Utc.timestamp_opt(ts, 0).unwrap(),
            change: EmployeeChange::Admission,
        }
    }

    #[test]
    fn test_dedup_key_stable_for_redelivery() {
        let first = admission("col_001", 1_700_000_000);
        let mut redelivered = first.clone();
        redelivered.name = "Maria S.".to_string();
        assert_eq!(first.dedup_key(), redelivered.dedup_key());
        assert_eq!(first.dedup_key().len(), 64);
    }

    #[test]
    fn test_dedup_key_differs_by_kind() {
        let admitted = admission("col_001", 1_700_000_000);
        let mut terminated = admitted.clone();
        terminated.change = EmployeeChange::Termination {
            termination_date: NaiveDate::from_ymd_opt(2024, 9, 30).unwrap(),
        };
        assert_ne!(admitted.dedup_key(), terminated.dedup_key());
        assert_eq!(terminated.kind(), EventKind::Termination);
    }

    #[test]
    fn test_change_serialization_is_tagged() {
        let change = EmployeeChange::Promotion {
            previous_role_id: "cargo_dev_junior".to_string(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "promotion");
        assert_eq!(json["previous_role_id"], "cargo_dev_junior");
    }

    proptest! {
        #[test]
        fn prop_dedup_key_distinguishes_timestamps(a in 0i64..4_000_000_000, b in 0i64..4_000_000_000) {
            prop_assume!(a != b);
            let first = admission("col_001", a);
            let second = admission("col_001", b);
            prop_assert_ne!(first.dedup_key(), second.dedup_key());
        }
    }
}
