use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};
use uuid::Uuid;

use crate::liveness;

/// Unique, time-ordered identifier of a job record.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Principal that requested a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub i64);

impl Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer key selecting the handler that executes a job.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct OperationCode(pub u32);

impl OperationCode {
    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lightweight reference to a domain object owned by another subsystem.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
}

impl ObjectRef {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: true,
        }
    }
}

/// Concrete type of a job's target, cached on the record at creation.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Unknown,
    Entry,
    Entity,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Unknown => "unknown",
            TargetKind::Entry => "entry",
            TargetKind::Entity => "entity",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "entry" => TargetKind::Entry,
            "entity" => TargetKind::Entity,
            _ => TargetKind::Unknown,
        }
    }
}

impl Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The domain object a job acts on.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetRef {
    Entry(ObjectRef),
    Entity(ObjectRef),
    Unknown(ObjectRef),
}

impl TargetRef {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetRef::Entry(_) => TargetKind::Entry,
            TargetRef::Entity(_) => TargetKind::Entity,
            TargetRef::Unknown(_) => TargetKind::Unknown,
        }
    }

    pub fn object(&self) -> &ObjectRef {
        match self {
            TargetRef::Entry(object)
            | TargetRef::Entity(object)
            | TargetRef::Unknown(object) => object,
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            kind: self.kind(),
            id: self.object().id,
        }
    }

    pub(crate) fn from_parts(kind: TargetKind, object: ObjectRef) -> Self {
        match kind {
            TargetKind::Entry => TargetRef::Entry(object),
            TargetKind::Entity => TargetRef::Entity(object),
            TargetKind::Unknown => TargetRef::Unknown(object),
        }
    }
}

/// Identity of a target: two references with the same key are the same object.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub kind: TargetKind,
    pub id: i64,
}

impl Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Preparing,
    Processing,
    Done,
    Error,
    Timeout,
    Canceled,
    Warning,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Preparing,
        JobStatus::Done,
        JobStatus::Error,
        JobStatus::Timeout,
        JobStatus::Processing,
        JobStatus::Canceled,
        JobStatus::Warning,
    ];

    /// Stable numeric code used on the wire and in storage.
    pub const fn code(self) -> u8 {
        match self {
            JobStatus::Preparing => 1,
            JobStatus::Done => 2,
            JobStatus::Error => 3,
            JobStatus::Timeout => 4,
            JobStatus::Processing => 5,
            JobStatus::Canceled => 6,
            JobStatus::Warning => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Preparing | JobStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Preparing => "preparing",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Timeout => "timeout",
            JobStatus::Canceled => "canceled",
            JobStatus::Warning => "warning",
        }
    }

    /// Whether a stored record may move from `self` to `next`.
    ///
    /// `Timeout` is never written; it only exists as a derived status.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (_, JobStatus::Timeout) => false,
            (current, _) if current.is_terminal() => false,
            (JobStatus::Processing, JobStatus::Preparing) => false,
            _ => true,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical, key-order-stable JSON payload interpreted by a job handler.
///
/// Object keys are sorted recursively on construction, so params built from
/// equal values always compare equal. Duplicate-submission detection relies
/// on it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParams(String);

impl Default for JobParams {
    fn default() -> Self {
        Self::empty()
    }
}

impl JobParams {
    pub fn empty() -> Self {
        Self("{}".to_string())
    }

    pub fn from_value(value: Value) -> Self {
        Self(canonicalize(value).to_string())
    }

    pub fn from_serializable<T: Serialize + ?Sized>(
        value: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::from_value(serde_json::to_value(value)?))
    }

    /// Re-canonicalizes a stored payload; malformed input is kept verbatim.
    pub fn from_json_str(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(_) => Self(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.0)
    }

    pub fn parse<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.0)
    }
}

impl Display for JobParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(canonicalize).collect())
        }
        other => other,
    }
}

/// The persisted unit of asynchronous work.
///
/// Fields are public for storage backends; every mutation after creation goes
/// through [`JobRecord::apply_update`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner: OwnerId,
    pub target: Option<TargetRef>,
    pub target_kind: TargetKind,
    pub operation: OperationCode,
    pub status: JobStatus,
    pub text: String,
    pub params: JobParams,
    pub dependent_job: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh record in `preparing`. Dependency assignment happens in the
    /// resolver before the record is stored.
    pub fn new(
        owner: OwnerId,
        target: Option<TargetRef>,
        operation: OperationCode,
        text: impl Into<String>,
        params: JobParams,
    ) -> Self {
        let now = Utc::now();
        let target_kind =
            target.as_ref().map(TargetRef::kind).unwrap_or_default();
        Self {
            id: JobId::new(),
            owner,
            target,
            target_kind,
            operation,
            status: JobStatus::Preparing,
            text: text.into(),
            params,
            dependent_job: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn target_key(&self) -> Option<TargetKey> {
        self.target.as_ref().map(TargetRef::key)
    }

    /// Status as observed by callers: non-terminal records idle for longer
    /// than `timeout` read as [`JobStatus::Timeout`].
    pub fn effective_status(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> JobStatus {
        liveness::effective_status(self.status, self.updated_at, now, timeout)
    }

    pub fn is_finished(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> bool {
        self.effective_status(now, timeout).is_terminal()
    }

    pub fn is_canceled(&self) -> bool {
        self.status == JobStatus::Canceled
    }

    pub fn is_timeout(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> bool {
        self.effective_status(now, timeout) == JobStatus::Timeout
    }

    /// Applies the update contract. Invalid values are skipped rather than
    /// rejected; a terminal record is left untouched.
    pub fn apply_update(
        &mut self,
        update: &JobUpdate,
        is_known_operation: impl Fn(OperationCode) -> bool,
        now: DateTime<Utc>,
    ) -> UpdateEffect {
        let mut effect = UpdateEffect::default();
        if self.status.is_terminal() {
            effect.frozen = true;
            return effect;
        }

        if let Some(code) = update.status {
            match JobStatus::from_code(code) {
                Some(next) if self.status.can_transition_to(next) => {
                    effect.status_changed = next != self.status;
                    self.status = next;
                }
                Some(next) => {
                    tracing::debug!(
                        job_id = %self.id,
                        from = %self.status,
                        to = %next,
                        "ignoring disallowed status transition"
                    );
                    effect.ignored.push(IgnoredField::Status);
                }
                None => {
                    tracing::debug!(
                        job_id = %self.id,
                        code,
                        "ignoring unrecognized status code"
                    );
                    effect.ignored.push(IgnoredField::Status);
                }
            }
        }

        if let Some(text) = &update.text {
            self.text.clone_from(text);
        }

        if let Some(target) = &update.target {
            if target.kind() == self.target_kind {
                self.target = Some(target.clone());
            } else {
                tracing::debug!(
                    job_id = %self.id,
                    expected = %self.target_kind,
                    got = %target.kind(),
                    "ignoring target of a different kind"
                );
                effect.ignored.push(IgnoredField::Target);
            }
        }

        if let Some(operation) = update.operation {
            if is_known_operation(operation) {
                self.operation = operation;
            } else {
                tracing::debug!(
                    job_id = %self.id,
                    %operation,
                    "ignoring unknown operation code"
                );
                effect.ignored.push(IgnoredField::Operation);
            }
        }

        self.updated_at = now;
        effect
    }

    pub fn snapshot(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> StatusSnapshot {
        StatusSnapshot {
            id: self.id,
            owner: self.owner,
            target: self.target.clone(),
            target_kind: self.target_kind,
            text: self.text.clone(),
            status: self.effective_status(now, timeout),
            operation: self.operation,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Partial update accepted by the update contract.
///
/// `status` is a raw code so untrusted results can be passed through; unknown
/// codes are ignored when applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<u8>,
    pub text: Option<String>,
    pub target: Option<TargetRef>,
    pub operation: Option<OperationCode>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: JobStatus) -> Self {
        Self::new().with_status(status)
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status.code());
        self
    }

    pub fn with_status_code(mut self, code: u8) -> Self {
        self.status = Some(code);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_target(mut self, target: TargetRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_operation(mut self, operation: OperationCode) -> Self {
        self.operation = Some(operation);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IgnoredField {
    Status,
    Target,
    Operation,
}

/// What [`JobRecord::apply_update`] actually did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateEffect {
    /// The record was terminal and nothing was applied.
    pub frozen: bool,
    pub status_changed: bool,
    pub ignored: Vec<IgnoredField>,
}

/// Externally visible read model of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: JobId,
    pub owner: OwnerId,
    pub target: Option<TargetRef>,
    pub target_kind: TargetKind,
    pub text: String,
    pub status: JobStatus,
    pub operation: OperationCode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: i64) -> TargetRef {
        TargetRef::Entry(ObjectRef::new(id, format!("entry-{id}")))
    }

    fn record() -> JobRecord {
        JobRecord::new(
            OwnerId(1),
            Some(entry(10)),
            OperationCode(2),
            "",
            JobParams::empty(),
        )
    }

    fn known(_: OperationCode) -> bool {
        true
    }

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(JobStatus::Preparing.code(), 1);
        assert_eq!(JobStatus::Processing.code(), 5);
        assert_eq!(JobStatus::from_code(6), Some(JobStatus::Canceled));
        assert_eq!(JobStatus::from_code(0), None);
        assert_eq!(JobStatus::from_code(8), None);
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(|status| status.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 5);
        assert!(!JobStatus::Preparing.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_new_record_caches_target_kind() {
        let job = JobRecord::new(
            OwnerId(1),
            Some(TargetRef::Entity(ObjectRef::new(3, "servers"))),
            OperationCode(11),
            "",
            JobParams::empty(),
        );
        assert_eq!(job.target_kind, TargetKind::Entity);
        assert_eq!(job.status, JobStatus::Preparing);

        let untargeted = JobRecord::new(
            OwnerId(1),
            None,
            OperationCode(8),
            "",
            JobParams::empty(),
        );
        assert_eq!(untargeted.target_kind, TargetKind::Unknown);
        assert!(untargeted.target_key().is_none());
    }

    #[test]
    fn test_params_are_key_order_stable() {
        let a = JobParams::from_value(
            json!({"b": 1, "a": {"y": [1, 2], "x": null}}),
        );
        let b = JobParams::from_value(
            json!({"a": {"x": null, "y": [1, 2]}, "b": 1}),
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_unrecognized_status_is_ignored_but_touches_updated_at() {
        let mut job = record();
        let before = job.updated_at;
        let later = before + chrono::Duration::seconds(5);

        let update = JobUpdate::new().with_status_code(42);
        let effect = job.apply_update(&update, known, later);

        assert_eq!(job.status, JobStatus::Preparing);
        assert_eq!(job.updated_at, later);
        assert_eq!(effect.ignored, vec![IgnoredField::Status]);
    }

    #[test]
    fn test_forward_transitions_only() {
        let mut job = record();
        let now = Utc::now();
        job.apply_update(&JobUpdate::status(JobStatus::Processing), known, now);
        assert_eq!(job.status, JobStatus::Processing);

        job.apply_update(&JobUpdate::status(JobStatus::Preparing), known, now);
        assert_eq!(job.status, JobStatus::Processing);

        job.apply_update(&JobUpdate::status(JobStatus::Timeout), known, now);
        assert_eq!(job.status, JobStatus::Processing);

        job.apply_update(&JobUpdate::status(JobStatus::Done), known, now);
        assert_eq!(job.status, JobStatus::Done);
    }

    #[test]
    fn test_terminal_record_is_frozen() {
        let mut job = record();
        let now = Utc::now();
        job.apply_update(&JobUpdate::status(JobStatus::Canceled), known, now);
        let frozen_at = job.updated_at;

        let effect = job.apply_update(
            &JobUpdate::status(JobStatus::Done).with_text("late result"),
            known,
            now + chrono::Duration::seconds(1),
        );

        assert!(effect.frozen);
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.text, "");
        assert_eq!(job.updated_at, frozen_at);
    }

    #[test]
    fn test_unknown_operation_and_mismatched_target_are_ignored() {
        let mut job = record();
        let effect = job.apply_update(
            &JobUpdate::new()
                .with_operation(OperationCode(9000))
                .with_target(TargetRef::Entity(ObjectRef::new(1, "other")))
                .with_text("still applied"),
            |code| code.get() < 100,
            Utc::now(),
        );

        assert_eq!(job.operation, OperationCode(2));
        assert_eq!(job.target, Some(entry(10)));
        assert_eq!(job.text, "still applied");
        assert_eq!(
            effect.ignored,
            vec![IgnoredField::Target, IgnoredField::Operation]
        );
    }

    #[test]
    fn test_snapshot_reports_timeout_without_rewriting() {
        let mut job = record();
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now() - chrono::Duration::seconds(100);

        let snapshot = job.snapshot(Utc::now(), chrono::Duration::seconds(60));

        assert_eq!(snapshot.status, JobStatus::Timeout);
        assert_eq!(job.status, JobStatus::Processing);
    }
}
