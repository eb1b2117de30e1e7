//! Discrepancy resolver.
//!
//! Compares an admitted employee's role, cost center and position against the
//! active plan, classifies the mismatch, and maps it through a [`RuleTable`]
//! to allow, block or require approval.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use lotacao_events::ColaboradorEvent;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::staffing::{pick_row, RowFilter, RowKey, StaffingError, StaffingRepository};

/// How an event differs from the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    None,
    OverCapacity,
    RoleNotPlanned,
    CostCenterNotPlanned,
    PositionInactive,
    /// The explicit position is planned for a different role.
    PositionRoleMismatch,
}

impl MismatchKind {
    pub const ALL: [MismatchKind; 6] = [
        MismatchKind::None,
        MismatchKind::OverCapacity,
        MismatchKind::RoleNotPlanned,
        MismatchKind::CostCenterNotPlanned,
        MismatchKind::PositionInactive,
        MismatchKind::PositionRoleMismatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchKind::None => "none",
            MismatchKind::OverCapacity => "over_capacity",
            MismatchKind::RoleNotPlanned => "role_not_planned",
            MismatchKind::CostCenterNotPlanned => "cost_center_not_planned",
            MismatchKind::PositionInactive => "position_inactive",
            MismatchKind::PositionRoleMismatch => "position_role_mismatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a discrepancy check. Serialized with the values the HR system
/// expects in 409 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscrepancyAction {
    #[serde(rename = "permitir", alias = "allow")]
    Allow,
    #[serde(rename = "bloquear", alias = "block")]
    Block,
    #[serde(rename = "exigir_aprovacao", alias = "require_approval")]
    RequireApproval,
}

impl DiscrepancyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyAction::Allow => "permitir",
            DiscrepancyAction::Block => "bloquear",
            DiscrepancyAction::RequireApproval => "exigir_aprovacao",
        }
    }
}

// =============================================================================
// Rule table
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid rule file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown mismatch kind in rule file: {0}")]
    UnknownMismatch(String),
}

/// Mismatch kind to action mapping. Every kind maps to exactly one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    rules: HashMap<MismatchKind, DiscrepancyAction>,
}

impl Default for RuleTable {
    fn default() -> Self {
        let rules = MismatchKind::ALL
            .into_iter()
            .map(|kind| {
                let action = match kind {
                    MismatchKind::None => DiscrepancyAction::Allow,
                    MismatchKind::OverCapacity
                    | MismatchKind::RoleNotPlanned
                    | MismatchKind::PositionRoleMismatch => DiscrepancyAction::RequireApproval,
                    MismatchKind::CostCenterNotPlanned | MismatchKind::PositionInactive => {
                        DiscrepancyAction::Block
                    }
                };
                (kind, action)
            })
            .collect();
        Self { rules }
    }
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: HashMap<String, DiscrepancyAction>,
}

impl RuleTable {
    pub fn action_for(&self, kind: MismatchKind) -> DiscrepancyAction {
        self.rules
            .get(&kind)
            .copied()
            .unwrap_or(DiscrepancyAction::Block)
    }

    pub fn set(&mut self, kind: MismatchKind, action: DiscrepancyAction) {
        self.rules.insert(kind, action);
    }

    /// Parses overrides on top of the defaults:
    ///
    /// ```toml
    /// [rules]
    /// over_capacity = "bloquear"
    /// role_not_planned = "permitir"
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, RuleError> {
        let file: RuleFile = toml::from_str(input)?;
        let mut table = Self::default();
        for (name, action) in file.rules {
            let kind = MismatchKind::parse(&name).ok_or(RuleError::UnknownMismatch(name))?;
            table.set(kind, action);
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let input = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }
}

// =============================================================================
// Resolver
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: DiscrepancyAction,
    pub mismatch: MismatchKind,
    pub reason: String,
    /// Row the admission would land on, when one exists.
    pub target: Option<RowKey>,
}

#[derive(Clone)]
pub struct DiscrepancyResolver {
    repo: StaffingRepository,
    rules: Arc<RuleTable>,
}

impl DiscrepancyResolver {
    pub fn new(repo: StaffingRepository, rules: Arc<RuleTable>) -> Self {
        Self { repo, rules }
    }

    /// Whether the event is already in the processed-event ledger. A
    /// redelivered admission is not re-checked against the plan it already
    /// changed.
    pub async fn is_duplicate(&self, event: &ColaboradorEvent) -> Result<bool, StaffingError> {
        self.repo.is_processed(&event.dedup_key()).await
    }

    pub async fn resolve(&self, event: &ColaboradorEvent) -> Result<Decision, StaffingError> {
        let (mismatch, reason, target) = self.classify(event).await?;
        let action = self.rules.action_for(mismatch);
        debug!(
            employee_id = %event.employee_id,
            mismatch = %mismatch,
            action = action.as_str(),
            "Discrepancy resolved"
        );
        Ok(Decision {
            action,
            mismatch,
            reason,
            target,
        })
    }

    async fn classify(
        &self,
        event: &ColaboradorEvent,
    ) -> Result<(MismatchKind, String, Option<RowKey>), StaffingError> {
        let plan_id = self.repo.require_active_plan().await?;
        let rows = self
            .repo
            .list_rows(&RowFilter::plan(&plan_id).cost_center(&event.cost_center_id))
            .await?;

        if rows.is_empty() {
            return Ok((
                MismatchKind::CostCenterNotPlanned,
                format!(
                    "cost center {} has no positions in plan {}",
                    event.cost_center_id, plan_id
                ),
                None,
            ));
        }

        let row = match &event.position_id {
            Some(position_id) => {
                let position_rows: Vec<_> = rows
                    .iter()
                    .filter(|r| r.key.position_id == *position_id)
                    .collect();
                if position_rows.is_empty() {
                    return Ok((
                        MismatchKind::CostCenterNotPlanned,
                        format!(
                            "position {} is not planned in cost center {}",
                            position_id, event.cost_center_id
                        ),
                        None,
                    ));
                }
                match position_rows.iter().find(|r| r.key.role_id == event.role_id) {
                    Some(row) => *row,
                    None => {
                        return Ok((
                            MismatchKind::PositionRoleMismatch,
                            format!(
                                "position {} is planned for role {}, not {}",
                                position_id, position_rows[0].key.role_id, event.role_id
                            ),
                            None,
                        ))
                    }
                }
            }
            None => {
                if !rows.iter().any(|r| r.key.role_id == event.role_id) {
                    return Ok((
                        MismatchKind::RoleNotPlanned,
                        format!(
                            "role {} is not planned in cost center {}",
                            event.role_id, event.cost_center_id
                        ),
                        None,
                    ));
                }
                match pick_row(&rows, &event.role_id) {
                    Some(row) => row,
                    None => {
                        return Ok((
                            MismatchKind::PositionInactive,
                            format!(
                                "every position for role {} in cost center {} is inactive",
                                event.role_id, event.cost_center_id
                            ),
                            None,
                        ))
                    }
                }
            }
        };

        let target = Some(row.key.clone());
        if !row.active {
            return Ok((
                MismatchKind::PositionInactive,
                format!("position {} is inactive", row.key.position_id),
                target,
            ));
        }
        if !row.has_capacity() {
            return Ok((
                MismatchKind::OverCapacity,
                format!(
                    "position {} has no open slot ({} planned, {} filled, {} reserved)",
                    row.key.position_id, row.planned, row.actual, row.reserved
                ),
                target,
            ));
        }
        Ok((MismatchKind::None, "matches the plan".to_string(), target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{admission, fixture};
    use rstest::rstest;

    fn resolver(rules: RuleTable) -> (DiscrepancyResolver, crate::test_support::Fixture) {
        let fx = fixture();
        (
            DiscrepancyResolver::new(fx.repo.clone(), Arc::new(rules)),
            fx,
        )
    }

    #[rstest]
    #[case("cargo_dev", "cc_ti", None, MismatchKind::None, DiscrepancyAction::Allow)]
    #[case("cargo_analista", "cc_rh", None, MismatchKind::OverCapacity, DiscrepancyAction::RequireApproval)]
    #[case("cargo_gerente", "cc_ti", None, MismatchKind::RoleNotPlanned, DiscrepancyAction::RequireApproval)]
    #[case("cargo_dev", "cc_juridico", None, MismatchKind::CostCenterNotPlanned, DiscrepancyAction::Block)]
    #[case("cargo_dev", "cc_fin", None, MismatchKind::PositionInactive, DiscrepancyAction::Block)]
    #[case("cargo_dev", "cc_fin", Some("posto_fin_01"), MismatchKind::PositionInactive, DiscrepancyAction::Block)]
    #[case("cargo_dev", "cc_ti", Some("posto_ti_03"), MismatchKind::PositionRoleMismatch, DiscrepancyAction::RequireApproval)]
    #[case("cargo_dev", "cc_ti", Some("posto_ti_02"), MismatchKind::None, DiscrepancyAction::Allow)]
    #[tokio::test]
    async fn test_default_classification(
        #[case] role: &str,
        #[case] cost_center: &str,
        #[case] position: Option<&str>,
        #[case] mismatch: MismatchKind,
        #[case] action: DiscrepancyAction,
    ) {
        let (resolver, _fx) = resolver(RuleTable::default());
        let mut event = admission("col_300", role, cost_center);
        event.position_id = position.map(str::to_string);

        let decision = resolver.resolve(&event).await.unwrap();
        assert_eq!(decision.mismatch, mismatch);
        assert_eq!(decision.action, action);
    }

    #[tokio::test]
    async fn test_over_capacity_reports_target() {
        let (resolver, _fx) = resolver(RuleTable::default());
        let decision = resolver
            .resolve(&admission("col_300", "cargo_analista", "cc_rh"))
            .await
            .unwrap();
        assert_eq!(
            decision.target.map(|k| k.position_id),
            Some("posto_rh_02".to_string())
        );
        assert!(decision.reason.contains("no open slot"));
    }

    #[tokio::test]
    async fn test_rule_override_changes_outcome() {
        let rules = RuleTable::from_toml_str(
            r#"
            [rules]
            over_capacity = "bloquear"
            role_not_planned = "allow"
            "#,
        )
        .unwrap();
        assert_eq!(
            rules.action_for(MismatchKind::CostCenterNotPlanned),
            DiscrepancyAction::Block
        );
        let (resolver, _fx) = resolver(rules);

        let decision = resolver
            .resolve(&admission("col_300", "cargo_analista", "cc_rh"))
            .await
            .unwrap();
        assert_eq!(decision.action, DiscrepancyAction::Block);

        let decision = resolver
            .resolve(&admission("col_300", "cargo_gerente", "cc_ti"))
            .await
            .unwrap();
        assert_eq!(decision.action, DiscrepancyAction::Allow);
    }

    #[test]
    fn test_rule_file_rejects_unknown_kind() {
        let err = RuleTable::from_toml_str("[rules]\nwrong_shift = \"bloquear\"\n").unwrap_err();
        assert!(matches!(err, RuleError::UnknownMismatch(name) if name == "wrong_shift"));
    }

    #[test]
    fn test_empty_rule_file_keeps_defaults() {
        assert_eq!(RuleTable::from_toml_str("").unwrap(), RuleTable::default());
    }

    #[test]
    fn test_action_wire_values() {
        assert_eq!(
            serde_json::to_string(&DiscrepancyAction::RequireApproval).unwrap(),
            "\"exigir_aprovacao\""
        );
        assert_eq!(DiscrepancyAction::Block.as_str(), "bloquear");
    }
}
