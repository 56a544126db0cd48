use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod logging;

/// Template variables for one recipient. Insertion order is preserved so that
/// placeholder expansion is deterministic.
pub type Variables = IndexMap<String, Value>;

// ============================================================================
// Dispatch Modes & Payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobMode {
    Single,
    Bulk,
    MultiBlock,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Single => "single",
            JobMode::Bulk => "bulk",
            JobMode::MultiBlock => "multiBlock",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode-specific job body. The variant is the job's mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum JobPayload {
    Single(SingleDispatch),
    Bulk(BulkDispatch),
    MultiBlock(MultiBlockDispatch),
}

impl JobPayload {
    pub fn mode(&self) -> JobMode {
        match self {
            JobPayload::Single(_) => JobMode::Single,
            JobPayload::Bulk(_) => JobMode::Bulk,
            JobPayload::MultiBlock(_) => JobMode::MultiBlock,
        }
    }
}

/// One message to one phone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleDispatch {
    pub phone: String,
    pub content: Content,
}

/// One content template sent to many recipients, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDispatch {
    pub recipients: Vec<Recipient>,
    pub content: Content,
    /// Pause between two consecutive sends
    #[serde(default)]
    pub delay_between_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Variables>,
}

/// A sequence of blocks sent to a single phone in ascending `order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiBlockDispatch {
    pub phone: String,
    pub blocks: Vec<MessageBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_delay_ms: Option<u64>,
    #[serde(default)]
    pub block_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBlock {
    pub order: i64,
    pub content: Content,
}

// ============================================================================
// Message Content
// ============================================================================

/// Content as submitted. Anything that does not match a known message type is
/// kept as `Unsupported` so one bad unit cannot poison a whole job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Supported(MessageContent),
    Unsupported(UnsupportedContent),
}

impl Content {
    /// The `type` tag as submitted
    pub fn kind(&self) -> &str {
        match self {
            Content::Supported(content) => content.kind(),
            Content::Unsupported(content) => &content.kind,
        }
    }
}

impl From<MessageContent> for Content {
    fn from(content: MessageContent) -> Self {
        Content::Supported(content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsupportedContent {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text(TextContent),
    Media(MediaContent),
    Audio(AudioContent),
    Buttons(ButtonsContent),
    List(ListContent),
    Poll(PollContent),
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::Text(_) => "text",
            MessageContent::Media(_) => "media",
            MessageContent::Audio(_) => "audio",
            MessageContent::Buttons(_) => "buttons",
            MessageContent::List(_) => "list",
            MessageContent::Poll(_) => "poll",
        }
    }

    pub fn text(message: impl Into<String>) -> Self {
        MessageContent::Text(TextContent {
            message: Some(message.into()),
            options: SendOptions::default(),
        })
    }
}

/// Presence and preview flags forwarded to the gateway as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_preview: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions_every_one: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentioned: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContent {
    pub media_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mediatype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioContent {
    pub audio_url: String,
    #[serde(flatten)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonsContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    #[serde(default)]
    pub buttons: Vec<Value>,
    #[serde(flatten)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer_text: Option<String>,
    /// List sections, passed through untouched
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(flatten)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollContent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectable_count: Option<u32>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(flatten)]
    pub options: SendOptions,
}

// ============================================================================
// Job Options
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackoffPolicy {
    /// `delay_ms * 2^(attempts_made - 1)`
    #[serde(rename_all = "camelCase")]
    Exponential { delay_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Fixed { delay_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before the next lease, given how many attempts have been made so far.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`. Used for log fields.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential { delay_ms: 5000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    /// Delete the job as soon as it is acknowledged
    pub remove_on_complete: bool,
    /// Keep at most this many exhausted jobs (oldest are pruned first)
    pub keep_failed: Option<usize>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            remove_on_complete: false,
            keep_failed: Some(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub retention: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            retention: Retention::default(),
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// A job as submitted by the intake layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    /// Caller-supplied id; a UUID is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub channel_instance: String,
    pub payload: JobPayload,
}

impl NewJob {
    pub fn new(channel_instance: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: None,
            channel_instance: channel_instance.into(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn data(&self) -> JobData {
        JobData {
            channel_instance: self.channel_instance.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// The persisted body of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub channel_instance: String,
    pub payload: JobPayload,
}

/// A leased job, handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub id: String,
    pub channel_instance: String,
    pub payload: JobPayload,
    /// Incremented by the queue on every lease, including this one
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Identifies this lease; acks and fails with an older token are rejected
    pub lease_token: String,
}

impl DispatchJob {
    pub fn mode(&self) -> JobMode {
        self.payload.mode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    /// Failed, waiting for the backoff delay before it can be leased again
    Delayed,
    Completed,
    /// Terminal failure: attempts used up or a non-retryable error
    Exhausted,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Exhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Exhausted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "waiting" | "wait" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "exhausted" | "failed" => Ok(JobState::Exhausted),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Status view of a stored job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub mode: JobMode,
    pub channel_instance: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: String,
    /// False when a job with the same id already existed
    pub created: bool,
}

/// Why a leased job did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub reason: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), retryable: true }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), retryable: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub exhausted: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Active => self.active += count,
            JobState::Delayed => self.delayed += count,
            JobState::Completed => self.completed += count,
            JobState::Exhausted => self.exhausted += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.exhausted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub total: u64,
}

// ============================================================================
// Send Results
// ============================================================================

/// Outcome of one unit (a recipient or a block)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    /// Raw phone for bulk recipients, block order for multi-block sends
    pub identifier: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SendResult {
    pub fn sent(identifier: impl Into<String>, provider_response: Value) -> Self {
        Self {
            identifier: identifier.into(),
            success: true,
            provider_response: Some(provider_response),
            error_message: None,
        }
    }

    pub fn failed(identifier: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            success: false,
            provider_response: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn with_provider_response(mut self, provider_response: Value) -> Self {
        self.provider_response = Some(provider_response);
        self
    }
}

/// Aggregate result of a bulk or multi-block job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    /// True only when no unit failed
    pub success: bool,
    pub total_units: usize,
    pub successful_sends: usize,
    pub failed_sends: usize,
    pub results: Vec<SendResult>,
}

impl DispatchSummary {
    pub fn from_results(results: Vec<SendResult>) -> Self {
        let successful_sends = results.iter().filter(|r| r.success).count();
        let failed_sends = results.len() - successful_sends;
        Self {
            success: failed_sends == 0,
            total_units: results.len(),
            successful_sends,
            failed_sends,
            results,
        }
    }
}

/// What a completed job returns to the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    /// Single mode: the provider response
    Delivered(Value),
    Summary(DispatchSummary),
}
