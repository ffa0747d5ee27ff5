use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification medium. Each channel has its own queue, cadence and batch size.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Sms];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
        }
    }
}

/// Lifecycle status of a bulk job.
///
/// `Pending → Processing → {Completed, CompletedWithErrors}`, with
/// `Processing → Pending` on a retryable failure and `Processing → Failed`
/// once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    /// Statuses from which no further processing occurs.
    pub const TERMINAL: [JobStatus; 3] = [
        JobStatus::Completed,
        JobStatus::CompletedWithErrors,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Who a bulk job is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientType {
    AllStudents,
    ClassStudents,
    FeeDefaulters,
    CustomList,
}

impl RecipientType {
    pub const VALID: &[&str] = &[
        "ALL_STUDENTS",
        "CLASS_STUDENTS",
        "FEE_DEFAULTERS",
        "CUSTOM_LIST",
    ];
}

impl FromStr for RecipientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALL_STUDENTS" => Ok(RecipientType::AllStudents),
            "CLASS_STUDENTS" => Ok(RecipientType::ClassStudents),
            "FEE_DEFAULTERS" => Ok(RecipientType::FeeDefaulters),
            "CUSTOM_LIST" => Ok(RecipientType::CustomList),
            other => Err(format!(
                "Invalid recipient_type '{}'. Valid types: {}",
                other,
                Self::VALID.join(", ")
            )),
        }
    }
}

impl std::fmt::Display for RecipientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientType::AllStudents => write!(f, "ALL_STUDENTS"),
            RecipientType::ClassStudents => write!(f, "CLASS_STUDENTS"),
            RecipientType::FeeDefaulters => write!(f, "FEE_DEFAULTERS"),
            RecipientType::CustomList => write!(f, "CUSTOM_LIST"),
        }
    }
}

/// Outcome of a single (job, recipient) delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Filter parameters accompanying a `RecipientType`.
///
/// All fields are optional; which ones matter depends on the recipient type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientFilters {
    /// Classes to target (`CLASS_STUDENTS`)
    #[serde(default)]
    pub class_ids: Vec<i64>,
    /// Explicit recipient ids (`CUSTOM_LIST`)
    #[serde(default)]
    pub recipient_ids: Vec<i64>,
}

/// A bulk-send request as submitted by a caller.
///
/// `recipient_type` stays a raw string here so that unknown values can be
/// rejected with a validation error instead of a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub recipient_type: String,
    #[serde(default)]
    pub filters: RecipientFilters,
    pub message: String,
    #[serde(default)]
    pub template_variables: HashMap<String, String>,
    /// Email only
    pub subject: Option<String>,
    /// Email only
    #[serde(default)]
    pub is_html: bool,
}

/// Validated targeting and message template of a job, persisted as `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    pub recipient_type: RecipientType,
    #[serde(default)]
    pub filters: RecipientFilters,
    pub message: String,
    #[serde(default)]
    pub template_variables: HashMap<String, String>,
    pub subject: Option<String>,
    #[serde(default)]
    pub is_html: bool,
}

/// A resolved contact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Per-recipient template variables
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Recipient {
    /// The channel-appropriate contact address, if present and non-blank.
    pub fn contact(&self, channel: Channel) -> Option<&str> {
        let value = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// One recipient that could not be reached during a processing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub recipient_id: i64,
    pub recipient: String,
    pub error: String,
}

/// Aggregated delivery counts of a job, persisted as `results`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    /// Fixed when recipients are resolved
    pub total: u32,
    pub sent: u32,
    pub failed: u32,
    #[serde(default)]
    pub errors: Vec<DeliveryFailure>,
}

/// One bulk-send request for a single channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub id: String,
    pub channel: Channel,
    pub status: JobStatus,
    pub data: JobData,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Resolved recipients; not part of the persisted row.
    #[serde(skip)]
    pub recipients: Vec<Recipient>,
    pub results: JobResults,
    pub error: Option<String>,
}

impl BulkJob {
    /// Build a pending job whose total is fixed to the given recipients.
    pub fn new(channel: Channel, data: JobData, recipients: Vec<Recipient>) -> Self {
        let total = recipients.len() as u32;
        Self {
            id: Self::generate_id(channel),
            channel,
            status: JobStatus::Pending,
            data,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            recipients,
            results: JobResults {
                total,
                ..JobResults::default()
            },
            error: None,
        }
    }

    /// Make the job terminally failed without a completed pass.
    ///
    /// No recipient counts as delivered: `failed` covers the whole total and
    /// any partial counts from the interrupted pass are discarded.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        self.results.sent = 0;
        self.results.failed = self.results.total;
    }

    /// Time + random derived id, e.g. `email_1718000000000_3f9a2c1be`.
    pub fn generate_id(channel: Channel) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}",
            channel,
            Utc::now().timestamp_millis(),
            &random[..9]
        )
    }
}

/// A persisted (job, recipient) delivery outcome, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub job_id: String,
    pub recipient_id: i64,
    pub channel: Channel,
    pub contact: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
