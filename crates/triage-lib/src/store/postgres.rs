//! PostgreSQL ticket store

use super::{transition_error, InsertOutcome, StoreError, TicketStore};
use crate::decision::DecisionUpdate;
use crate::models::{
    ModelRecord, NewTicket, ReviewInput, StatusBreakdown, Ticket, TicketStats, TicketStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const TICKET_COLUMNS: &str = "ticket_id, subject, description, status, predicted_category, \
     predicted_priority, prediction_confidence_category, prediction_confidence_priority, \
     category_model_id, priority_model_id, final_category, final_priority, created_at, \
     reviewed_at, used_for_retraining";

const MODEL_COLUMNS: &str = "model_id, model_name, model_version, deployed_at, is_active";

#[derive(sqlx::FromRow)]
struct TicketRow {
    ticket_id: Uuid,
    subject: String,
    description: String,
    status: String,
    predicted_category: Option<String>,
    predicted_priority: Option<String>,
    prediction_confidence_category: Option<f64>,
    prediction_confidence_priority: Option<f64>,
    category_model_id: Option<i64>,
    priority_model_id: Option<i64>,
    final_category: Option<String>,
    final_priority: Option<String>,
    created_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
    used_for_retraining: bool,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = StoreError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TicketStatus>()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Ticket {
            ticket_id: row.ticket_id,
            subject: row.subject,
            description: row.description,
            status,
            predicted_category: row.predicted_category,
            predicted_priority: row.predicted_priority,
            prediction_confidence_category: row.prediction_confidence_category,
            prediction_confidence_priority: row.prediction_confidence_priority,
            category_model_id: row.category_model_id,
            priority_model_id: row.priority_model_id,
            final_category: row.final_category,
            final_priority: row.final_priority,
            created_at: row.created_at,
            reviewed_at: row.reviewed_at,
            used_for_retraining: row.used_for_retraining,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ModelRow {
    model_id: i64,
    model_name: String,
    model_version: String,
    deployed_at: DateTime<Utc>,
    is_active: bool,
}

impl From<ModelRow> for ModelRecord {
    fn from(row: ModelRow) -> Self {
        ModelRecord {
            model_id: row.model_id,
            model_name: row.model_name,
            model_version: row.model_version,
            deployed_at: row.deployed_at,
            is_active: row.is_active,
        }
    }
}

fn into_tickets(rows: Vec<TicketRow>) -> Result<Vec<Ticket>, StoreError> {
    rows.into_iter().map(Ticket::try_from).collect()
}

/// Ticket store backed by PostgreSQL
#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool sized for the worker
    pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(pool)
    }

    /// Apply the bundled migrations
    pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        info!("Migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, ticket_id: Uuid) -> Result<Option<TicketStatus>, StoreError> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM tickets WHERE ticket_id = $1")
                .bind(ticket_id)
                .fetch_optional(&self.pool)
                .await?;

        status
            .map(|(s,)| s.parse::<TicketStatus>())
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn get_or_create_model_record(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ModelRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialize activation per model name across workers
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE models SET is_active = FALSE \
             WHERE model_name = $1 AND model_version <> $2 AND is_active",
        )
        .bind(name)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        let row: ModelRow = sqlx::query_as(&format!(
            "INSERT INTO models (model_name, model_version, is_active) VALUES ($1, $2, TRUE) \
             ON CONFLICT (model_name, model_version) DO UPDATE SET is_active = TRUE \
             RETURNING {MODEL_COLUMNS}"
        ))
        .bind(name)
        .bind(version)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn insert_processing_ticket(&self, new: NewTicket) -> Result<InsertOutcome, StoreError> {
        let created: Option<TicketRow> = sqlx::query_as(&format!(
            "INSERT INTO tickets (ticket_id, subject, description, status, \
                                  category_model_id, priority_model_id, used_for_retraining) \
             VALUES ($1, $2, $3, 'PROCESSING', $4, $5, FALSE) \
             ON CONFLICT (ticket_id) DO NOTHING \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(new.ticket_id)
        .bind(&new.subject)
        .bind(&new.description)
        .bind(new.category_model_id)
        .bind(new.priority_model_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = created {
            return Ok(InsertOutcome::Created(row.try_into()?));
        }

        let refreshed: Option<TicketRow> = sqlx::query_as(&format!(
            "UPDATE tickets SET category_model_id = $2, priority_model_id = $3 \
             WHERE ticket_id = $1 AND status = 'PROCESSING' \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(new.ticket_id)
        .bind(new.category_model_id)
        .bind(new.priority_model_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match refreshed {
            Some(row) => row,
            None => sqlx::query_as(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE ticket_id = $1"
            ))
            .bind(new.ticket_id)
            .fetch_one(&self.pool)
            .await?,
        };

        Ok(InsertOutcome::Existing(row.try_into()?))
    }

    async fn record_decision(
        &self,
        ticket_id: Uuid,
        update: &DecisionUpdate,
    ) -> Result<Ticket, StoreError> {
        let (final_category, final_priority) = match update.final_labels() {
            Some((c, p)) => (Some(c), Some(p)),
            None => (None, None),
        };

        let row: Option<TicketRow> = sqlx::query_as(&format!(
            "UPDATE tickets SET status = $2, predicted_category = $3, predicted_priority = $4, \
                    prediction_confidence_category = $5, prediction_confidence_priority = $6, \
                    final_category = $7, final_priority = $8 \
             WHERE ticket_id = $1 AND status = 'PROCESSING' \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(ticket_id)
        .bind(update.status().as_str())
        .bind(&update.predicted_category)
        .bind(&update.predicted_priority)
        .bind(update.category_confidence)
        .bind(update.priority_confidence)
        .bind(final_category)
        .bind(final_priority)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(transition_error(
                ticket_id,
                self.current_status(ticket_id).await?,
                TicketStatus::Processing,
            )),
        }
    }

    async fn apply_review(
        &self,
        ticket_id: Uuid,
        review: &ReviewInput,
        reviewed_at: DateTime<Utc>,
    ) -> Result<Ticket, StoreError> {
        let row: Option<TicketRow> = sqlx::query_as(&format!(
            "UPDATE tickets SET status = 'COMPLETED', final_category = $2, \
                    final_priority = $3, reviewed_at = $4 \
             WHERE ticket_id = $1 AND status = 'PENDING_REVIEW' \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(ticket_id)
        .bind(&review.final_category)
        .bind(&review.final_priority)
        .bind(reviewed_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(transition_error(
                ticket_id,
                self.current_status(ticket_id).await?,
                TicketStatus::PendingReview,
            )),
        }
    }

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError> {
        let row: Option<TicketRow> = sqlx::query_as(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE ticket_id = $1"
        ))
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Ticket::try_from).transpose()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let rows: Vec<TicketRow> = sqlx::query_as(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_tickets(rows)
    }

    async fn list_pending_review(&self, limit: usize) -> Result<Vec<Ticket>, StoreError> {
        let rows: Vec<TicketRow> = sqlx::query_as(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE status = 'PENDING_REVIEW' \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_tickets(rows)
    }

    async fn stats(&self) -> Result<TicketStats, StoreError> {
        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tickets GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut status_breakdown = StatusBreakdown::default();
        for (status, count) in by_status {
            let count = count.max(0) as u64;
            match status.parse::<TicketStatus>() {
                Ok(TicketStatus::Completed) => status_breakdown.completed += count,
                Ok(TicketStatus::PendingReview) => status_breakdown.pending_review += count,
                Ok(TicketStatus::Processing) => status_breakdown.processing += count,
                Err(e) => return Err(StoreError::Backend(e.to_string())),
            }
        }

        let by_category: Vec<(String, i64)> = sqlx::query_as(
            "SELECT COALESCE(final_category, predicted_category) AS category, COUNT(*) \
             FROM tickets \
             WHERE COALESCE(final_category, predicted_category) IS NOT NULL \
             GROUP BY 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let category_breakdown: HashMap<String, u64> = by_category
            .into_iter()
            .map(|(category, count)| (category, count.max(0) as u64))
            .collect();

        Ok(TicketStats {
            total: status_breakdown.total(),
            status_breakdown,
            category_breakdown,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelRecord>, StoreError> {
        let rows: Vec<ModelRow> = sqlx::query_as(&format!(
            "SELECT {MODEL_COLUMNS} FROM models ORDER BY model_name, model_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ModelRecord::from).collect())
    }
}
