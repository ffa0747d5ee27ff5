//! Recipient resolution: targeting filters to contact records.
//!
//! The student tables queried by `PgRecipientResolver` belong to the host
//! application's schema; this crate only reads them.

use async_trait::async_trait;
use sqlx::PgPool;

use beacon_common::types::{Channel, Recipient, RecipientFilters, RecipientType};

use crate::error::NotifierError;

/// Turns a recipient type and filters into concrete contact records.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(
        &self,
        recipient_type: RecipientType,
        filters: &RecipientFilters,
        channel: Channel,
    ) -> Result<Vec<Recipient>, NotifierError>;
}

/// Drop recipients that lack a non-blank contact for `channel`.
pub fn reachable(recipients: Vec<Recipient>, channel: Channel) -> Vec<Recipient> {
    recipients
        .into_iter()
        .filter(|r| r.contact(channel).is_some())
        .collect()
}

/// Reject filter combinations that cannot target anyone.
pub fn validate_filters(
    recipient_type: RecipientType,
    filters: &RecipientFilters,
) -> Result<(), NotifierError> {
    match recipient_type {
        RecipientType::ClassStudents if filters.class_ids.is_empty() => Err(
            NotifierError::RecipientResolution("CLASS_STUDENTS requires class_ids".to_string()),
        ),
        RecipientType::CustomList if filters.recipient_ids.is_empty() => Err(
            NotifierError::RecipientResolution("CUSTOM_LIST requires recipient_ids".to_string()),
        ),
        _ => Ok(()),
    }
}

#[derive(sqlx::FromRow)]
struct StudentRow {
    id: i64,
    first_name: String,
    last_name: String,
    email: Option<String>,
    phone: Option<String>,
}

impl From<StudentRow> for Recipient {
    fn from(row: StudentRow) -> Self {
        Recipient {
            id: row.id,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            phone: row.phone,
            variables: Default::default(),
        }
    }
}

/// Resolves recipients from the `students` / `fee_invoices` tables.
#[derive(Clone)]
pub struct PgRecipientResolver {
    pool: PgPool,
}

impl PgRecipientResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientResolver for PgRecipientResolver {
    async fn resolve(
        &self,
        recipient_type: RecipientType,
        filters: &RecipientFilters,
        channel: Channel,
    ) -> Result<Vec<Recipient>, NotifierError> {
        validate_filters(recipient_type, filters)?;

        let rows: Vec<StudentRow> = match recipient_type {
            RecipientType::AllStudents => {
                sqlx::query_as::<_, StudentRow>(
                    r#"
                    SELECT id, first_name, last_name, email, phone
                    FROM students
                    WHERE status = 'active'
                    ORDER BY id
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
            RecipientType::ClassStudents => {
                sqlx::query_as::<_, StudentRow>(
                    r#"
                    SELECT id, first_name, last_name, email, phone
                    FROM students
                    WHERE status = 'active' AND class_id = ANY($1)
                    ORDER BY id
                    "#,
                )
                .bind(&filters.class_ids)
                .fetch_all(&self.pool)
                .await
            }
            RecipientType::FeeDefaulters => {
                sqlx::query_as::<_, StudentRow>(
                    r#"
                    SELECT DISTINCT s.id, s.first_name, s.last_name, s.email, s.phone
                    FROM students s
                    JOIN fee_invoices f ON f.student_id = s.id
                    WHERE s.status = 'active'
                      AND f.balance > 0
                      AND f.due_date < NOW()
                    ORDER BY s.id
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
            RecipientType::CustomList => {
                sqlx::query_as::<_, StudentRow>(
                    r#"
                    SELECT id, first_name, last_name, email, phone
                    FROM students
                    WHERE id = ANY($1)
                    ORDER BY id
                    "#,
                )
                .bind(&filters.recipient_ids)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| NotifierError::RecipientResolution(e.to_string()))?;

        tracing::debug!(
            recipient_type = %recipient_type,
            channel = %channel,
            rows = rows.len(),
            "Resolved recipients"
        );

        Ok(rows.into_iter().map(Recipient::from).collect())
    }
}
