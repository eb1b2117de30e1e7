//! Postgres proposal store.

use async_trait::async_trait;
use lotacao_id::{ProposalId, WebhookEventId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};

use super::DbError;
use crate::proposals::{Proposal, ProposalDraft, ProposalError, ProposalStatus, ProposalStore};
use crate::resolver::MismatchKind;

const COLUMNS: &str = "proposal_id, webhook_event_id, dedup_key, employee_id, role_id, \
     cost_center_id, position_id, mismatch, reason, status, reviewer, created_at, decided_at";

fn decode_error(column: &str, message: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Proposal {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("proposal_id")?;
        let webhook_event_id: String = row.try_get("webhook_event_id")?;
        let mismatch: String = row.try_get("mismatch")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: ProposalId::parse(&id).map_err(|e| decode_error("proposal_id", e.to_string()))?,
            webhook_event_id: WebhookEventId::parse(&webhook_event_id)
                .map_err(|e| decode_error("webhook_event_id", e.to_string()))?,
            dedup_key: row.try_get("dedup_key")?,
            employee_id: row.try_get("employee_id")?,
            role_id: row.try_get("role_id")?,
            cost_center_id: row.try_get("cost_center_id")?,
            position_id: row.try_get("position_id")?,
            mismatch: MismatchKind::parse(&mismatch)
                .ok_or_else(|| decode_error("mismatch", format!("unknown mismatch {mismatch}")))?,
            reason: row.try_get("reason")?,
            status: ProposalStatus::parse(&status)
                .ok_or_else(|| decode_error("status", format!("unknown status {status}")))?,
            reviewer: row.try_get("reviewer")?,
            created_at: row.try_get("created_at")?,
            decided_at: row.try_get("decided_at")?,
        })
    }
}

#[derive(Clone)]
pub struct PgProposalStore {
    pool: PgPool,
}

impl PgProposalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProposalStore for PgProposalStore {
    async fn create(&self, draft: ProposalDraft) -> Result<Proposal, ProposalError> {
        let sql = format!(
            "INSERT INTO proposals ( \
                 proposal_id, webhook_event_id, dedup_key, employee_id, role_id, \
                 cost_center_id, position_id, mismatch, reason \
             ) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {COLUMNS}"
        );
        let proposal = sqlx::query_as::<_, Proposal>(&sql)
            .bind(ProposalId::new().to_string())
            .bind(draft.webhook_event_id.to_string())
            .bind(&draft.dedup_key)
            .bind(&draft.employee_id)
            .bind(&draft.role_id)
            .bind(&draft.cost_center_id)
            .bind(draft.position_id.as_deref())
            .bind(draft.mismatch.as_str())
            .bind(&draft.reason)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(proposal)
    }

    async fn get(&self, id: ProposalId) -> Result<Option<Proposal>, ProposalError> {
        let sql = format!("SELECT {COLUMNS} FROM proposals WHERE proposal_id = $1");
        let proposal = sqlx::query_as::<_, Proposal>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(proposal)
    }

    async fn find_pending(&self, dedup_key: &str) -> Result<Option<Proposal>, ProposalError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM proposals WHERE dedup_key = $1 AND status = 'pending'"
        );
        let proposal = sqlx::query_as::<_, Proposal>(&sql)
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(proposal)
    }

    async fn list_pending(&self) -> Result<Vec<Proposal>, ProposalError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM proposals WHERE status = 'pending' ORDER BY created_at"
        );
        let proposals = sqlx::query_as::<_, Proposal>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(proposals)
    }

    async fn decide(
        &self,
        id: ProposalId,
        approved: bool,
        reviewer: &str,
    ) -> Result<Proposal, ProposalError> {
        let status = if approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        };
        let sql = format!(
            "UPDATE proposals \
             SET status = $2, reviewer = $3, decided_at = now() \
             WHERE proposal_id = $1 AND status = 'pending' \
             RETURNING {COLUMNS}"
        );
        let decided = sqlx::query_as::<_, Proposal>(&sql)
            .bind(id.to_string())
            .bind(status.as_str())
            .bind(reviewer)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;

        if let Some(proposal) = decided {
            return Ok(proposal);
        }

        match self.get(id).await? {
            Some(existing) => Err(ProposalError::AlreadyDecided {
                id,
                status: existing.status.as_str(),
            }),
            None => Err(ProposalError::NotFound(id)),
        }
    }
}
