//! Webhook payload validation.
//!
//! The HR system posts `{event, timestamp, data: {...}}`. Validation walks
//! every field and reports all violations at once instead of stopping at the
//! first one.

use chrono::{DateTime, NaiveDate, Utc};
use lotacao_events::{ColaboradorEvent, EmployeeChange, EmployeeStatus, EventKind};
use serde::Serialize;
use serde_json::{Map, Value};

/// One validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Joins errors into one line for logs and job error messages.
pub fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parses raw request bytes. Returns the event and the parsed document that
/// gets stored for reprocessing.
pub fn parse_event(
    kind: EventKind,
    body: &[u8],
) -> Result<(ColaboradorEvent, Value), Vec<FieldError>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| vec![FieldError::new("body", format!("invalid JSON: {e}"))])?;
    let event = parse_event_value(kind, &value)?;
    Ok((event, value))
}

/// Validates a parsed document for the endpoint's `kind`.
pub fn parse_event_value(
    kind: EventKind,
    value: &Value,
) -> Result<ColaboradorEvent, Vec<FieldError>> {
    let Some(root) = value.as_object() else {
        return Err(vec![FieldError::new("body", "must be a JSON object")]);
    };

    let mut errors = Vec::new();

    match root.get("event") {
        Some(Value::String(event)) if event == kind.event_type() => {}
        Some(Value::String(event)) => errors.push(FieldError::new(
            "event",
            format!("expected {}, got {}", kind.event_type(), event),
        )),
        Some(_) => errors.push(FieldError::new("event", "must be a string")),
        None => errors.push(FieldError::new("event", "is required")),
    }

    let occurred_at = match root.get("timestamp") {
        Some(Value::String(ts)) => match DateTime::parse_from_rfc3339(ts) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                errors.push(FieldError::new("timestamp", "must be an RFC 3339 timestamp"));
                None
            }
        },
        Some(_) => {
            errors.push(FieldError::new("timestamp", "must be a string"));
            None
        }
        None => {
            errors.push(FieldError::new("timestamp", "is required"));
            None
        }
    };

    let empty = Map::new();
    let data = match root.get("data") {
        Some(Value::Object(data)) => data,
        Some(_) => {
            errors.push(FieldError::new("data", "must be an object"));
            &empty
        }
        None => {
            errors.push(FieldError::new("data", "is required"));
            &empty
        }
    };

    let mut fields = Fields {
        data,
        errors: &mut errors,
    };
    let employee_id = fields.required_str("employee_id");
    let name = fields.required_str("name");
    let national_id = fields.national_id("national_id");
    let role_id = fields.required_str("role_id");
    let cost_center_id = fields.required_str("cost_center_id");
    let position_id = fields.optional_str("position_id");
    let shift = fields.required_str("shift");
    let hire_date = fields.required_date("hire_date");
    let has_disability = fields.required_bool("has_disability");
    let status = fields.status("status");

    let change = match kind {
        EventKind::Admission => Some(EmployeeChange::Admission),
        EventKind::Transfer => {
            let previous_cost_center_id = fields.required_str("previous_cost_center_id");
            let previous_role_id = fields.optional_str("previous_role_id");
            previous_cost_center_id.map(|previous_cost_center_id| EmployeeChange::Transfer {
                previous_cost_center_id,
                previous_role_id,
            })
        }
        EventKind::Termination => fields
            .required_date("termination_date")
            .map(|termination_date| EmployeeChange::Termination { termination_date }),
        EventKind::Promotion => fields
            .required_str("previous_role_id")
            .map(|previous_role_id| EmployeeChange::Promotion { previous_role_id }),
    };

    match (
        employee_id,
        name,
        national_id,
        role_id,
        cost_center_id,
        shift,
        hire_date,
        has_disability,
        status,
        occurred_at,
        change,
    ) {
        (
            Some(employee_id),
            Some(name),
            Some(national_id),
            Some(role_id),
            Some(cost_center_id),
            Some(shift),
            Some(hire_date),
            Some(has_disability),
            Some(status),
            Some(occurred_at),
            Some(change),
        ) if errors.is_empty() => Ok(ColaboradorEvent {
            employee_id,
            name,
            national_id,
            role_id,
            cost_center_id,
            position_id,
            shift,
            hire_date,
            has_disability,
            status,
            occurred_at,
            change,
        }),
        _ => Err(errors),
    }
}

/// Field readers over `data`, collecting errors as they go.
struct Fields<'a> {
    data: &'a Map<String, Value>,
    errors: &'a mut Vec<FieldError>,
}

impl Fields<'_> {
    fn fail(&mut self, name: &str, message: &str) {
        self.errors
            .push(FieldError::new(format!("data.{name}"), message));
    }

    fn required_str(&mut self, name: &str) -> Option<String> {
        let data = self.data;
        match data.get(name) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::String(_)) => {
                self.fail(name, "must not be empty");
                None
            }
            Some(Value::Null) | None => {
                self.fail(name, "is required");
                None
            }
            Some(_) => {
                self.fail(name, "must be a string");
                None
            }
        }
    }

    fn optional_str(&mut self, name: &str) -> Option<String> {
        let data = self.data;
        match data.get(name) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::String(_)) | Some(Value::Null) | None => None,
            Some(_) => {
                self.fail(name, "must be a string");
                None
            }
        }
    }

    fn required_date(&mut self, name: &str) -> Option<NaiveDate> {
        let raw = self.required_str(name)?;
        match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                self.fail(name, "must be a date (YYYY-MM-DD)");
                None
            }
        }
    }

    fn required_bool(&mut self, name: &str) -> Option<bool> {
        let data = self.data;
        match data.get(name) {
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::Null) | None => {
                self.fail(name, "is required");
                None
            }
            Some(_) => {
                self.fail(name, "must be a boolean");
                None
            }
        }
    }

    fn status(&mut self, name: &str) -> Option<EmployeeStatus> {
        let raw = self.required_str(name)?;
        let status = EmployeeStatus::parse(&raw);
        if status.is_none() {
            let message = format!("must be one of {}", EmployeeStatus::WIRE_VALUES.join(", "));
            self.fail(name, &message);
        }
        status
    }

    /// CPF: 11 digits, punctuation allowed.
    fn national_id(&mut self, name: &str) -> Option<String> {
        let raw = self.required_str(name)?;
        let digits: String = raw.chars().filter(|c| !matches!(c, '.' | '-')).collect();
        if digits.len() != 11 || !digits.chars().all(|c| c.is_ascii_digit()) {
            self.fail(name, "must contain 11 digits");
            return None;
        }
        Some(digits)
    }
}
