use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Version tag embedded in every audit snapshot object.
pub const AUDIT_SNAPSHOT_SCHEMA: u32 = 1;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IngestError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insert conflict: {0}")]
    Conflict(String),
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl IngestError {
    /// Stable machine-readable kind for the caller-facing error contract.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "insert_conflict",
            Self::Transaction(_) => "transaction_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThrowId(pub Ulid);

impl ThrowId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a throw id from its canonical ULID string form.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when the input is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| IngestError::Validation(format!("invalid throw id: {raw}")))
    }
}

impl Display for ThrowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SampleId(pub Ulid);

impl SampleId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a sample id from its canonical ULID string form.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when the input is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| IngestError::Validation(format!("invalid sample id: {raw}")))
    }
}

impl Display for SampleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Rotation,
    Height,
    MaxAcceleration,
}

impl Metric {
    /// Reporting precedence when several metrics set a record in one event.
    pub const PRECEDENCE: [Self; 3] = [Self::Rotation, Self::Height, Self::MaxAcceleration];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rotation => "rotation",
            Self::Height => "height",
            Self::MaxAcceleration => "max_acceleration",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rotation" => Some(Self::Rotation),
            "height" => Some(Self::Height),
            "max_acceleration" => Some(Self::MaxAcceleration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ThrowLifecycle {
    Active,
    Deleted {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
}

impl ThrowLifecycle {
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active)
    }

    #[must_use]
    pub fn deleted_at(self) -> Option<OffsetDateTime> {
        match self {
            Self::Active => None,
            Self::Deleted { at } => Some(at),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TrackedTable {
    Throws,
    Discs,
}

impl TrackedTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throws => "throws",
            Self::Discs => "discs",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "throws" => Some(Self::Throws),
            "discs" => Some(Self::Discs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Insert,
    InsertComplete,
    Delete,
}

impl AuditOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::InsertComplete => "insert_complete",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "insert_complete" => Some(Self::InsertComplete),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Player,
    Trainer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Trainer => "trainer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "player" => Some(Self::Player),
            "trainer" => Some(Self::Trainer),
            _ => None,
        }
    }
}

/// Resolved identity of a bearer credential: the consumed contract of the
/// external identity collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuthUser {
    pub id: String,
    pub role: Role,
}

/// Policy governing how a soft-deleted throw interacts with the per-player
/// highscore projection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// All-time bests are irrevocable; deleting a throw leaves them baked in.
    #[default]
    RetainBests,
    /// Deleting a throw rebuilds the player's bests from remaining live throws.
    RecomputeOnDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disc {
    pub id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub calibration_date: Option<OffsetDateTime>,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiscInput {
    pub id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub calibration_date: Option<OffsetDateTime>,
}

impl DiscInput {
    /// Validates a disc registration request before any transaction opens.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when the caller-supplied id is
    /// missing.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.id.trim().is_empty() {
            return Err(IngestError::Validation("id is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Throw {
    pub id: ThrowId,
    pub disc_id: String,
    pub player_id: Option<String>,
    pub rotation: Option<f64>,
    pub height: Option<f64>,
    pub max_acceleration: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub version: u32,
    pub lifecycle: ThrowLifecycle,
}

impl Throw {
    #[must_use]
    pub fn metrics(&self) -> MetricValues {
        MetricValues {
            rotation: self.rotation,
            height: self.height,
            max_acceleration: self.max_acceleration,
        }
    }
}

/// Request payload for creating a throw. One canonical spelling per field;
/// unknown (legacy alias) keys are rejected during deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThrowInput {
    pub id: Option<ThrowId>,
    pub disc_id: String,
    pub player_id: Option<String>,
    pub rotation: Option<f64>,
    pub height: Option<f64>,
    pub max_acceleration: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
}

impl ThrowInput {
    /// Validates a throw creation request before any transaction opens.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when the disc reference is missing,
    /// no metric is present, or a metric is not a finite number.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.disc_id.trim().is_empty() {
            return Err(IngestError::Validation("disc_id is required".to_string()));
        }

        if self.metrics().is_empty() {
            return Err(IngestError::Validation(
                "at least one of rotation, height, max_acceleration is required".to_string(),
            ));
        }

        for (name, value) in [
            ("rotation", self.rotation),
            ("height", self.height),
            ("max_acceleration", self.max_acceleration),
        ] {
            if let Some(value) = value {
                if !value.is_finite() {
                    return Err(IngestError::Validation(format!(
                        "{name} must be a finite number"
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn metrics(&self) -> MetricValues {
        MetricValues {
            rotation: self.rotation,
            height: self.height,
            max_acceleration: self.max_acceleration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub id: SampleId,
    pub throw_id: ThrowId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub sequence_nr: u32,
    pub accel_x: Option<f64>,
    pub accel_y: Option<f64>,
    pub accel_z: Option<f64>,
    pub gyro_x: Option<f64>,
    pub gyro_y: Option<f64>,
    pub gyro_z: Option<f64>,
    pub mag_x: Option<f64>,
    pub mag_y: Option<f64>,
    pub mag_z: Option<f64>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_altitude: Option<f64>,
}

/// Request payload for one sensor sample. One canonical spelling per axis;
/// unknown (legacy alias) keys are rejected during deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SampleInput {
    pub id: Option<SampleId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub sequence_nr: Option<u32>,
    pub accel_x: Option<f64>,
    pub accel_y: Option<f64>,
    pub accel_z: Option<f64>,
    pub gyro_x: Option<f64>,
    pub gyro_y: Option<f64>,
    pub gyro_z: Option<f64>,
    pub mag_x: Option<f64>,
    pub mag_y: Option<f64>,
    pub mag_z: Option<f64>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_altitude: Option<f64>,
}

/// Validates a sample batch before any transaction opens.
///
/// # Errors
/// Returns [`IngestError::Validation`] when the batch is empty or a sample is
/// missing its timestamp; the message names the offending batch index.
pub fn validate_sample_batch(samples: &[SampleInput]) -> Result<(), IngestError> {
    if samples.is_empty() {
        return Err(IngestError::Validation(
            "at least one sample is required".to_string(),
        ));
    }

    for (index, sample) in samples.iter().enumerate() {
        if sample.timestamp.is_none() {
            return Err(IngestError::Validation(format!(
                "sample at index {index}: timestamp is required"
            )));
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: i64,
    pub table: TrackedTable,
    pub record_id: String,
    pub operation: AuditOperation,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub actor_ip: Option<String>,
    pub actor_agent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Network origin and agent string of the caller, captured per mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActorContext {
    pub ip: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Highscore {
    pub player_id: String,
    pub best_rotation: Option<f64>,
    pub best_height: Option<f64>,
    pub best_max_acceleration: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Highscore {
    #[must_use]
    pub fn best(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Rotation => self.best_rotation,
            Metric::Height => self.best_height,
            Metric::MaxAcceleration => self.best_max_acceleration,
        }
    }

    fn best_slot_mut(&mut self, metric: Metric) -> &mut Option<f64> {
        match metric {
            Metric::Rotation => &mut self.best_rotation,
            Metric::Height => &mut self.best_height,
            Metric::MaxAcceleration => &mut self.best_max_acceleration,
        }
    }
}

/// Metric subset present on one throw.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricValues {
    pub rotation: Option<f64>,
    pub height: Option<f64>,
    pub max_acceleration: Option<f64>,
}

impl MetricValues {
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.rotation.is_none() && self.height.is_none() && self.max_acceleration.is_none()
    }

    #[must_use]
    pub fn get(self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Rotation => self.rotation,
            Metric::Height => self.height,
            Metric::MaxAcceleration => self.max_acceleration,
        }
    }
}

/// Result of evaluating one throw against a player's stored bests.
#[derive(Debug, Clone, PartialEq)]
pub struct HighscoreUpdate {
    pub row: Highscore,
    /// Metrics that set a new record, in reporting precedence order.
    pub record_metrics: Vec<Metric>,
}

impl HighscoreUpdate {
    #[must_use]
    pub fn is_new_record(&self) -> bool {
        !self.record_metrics.is_empty()
    }

    #[must_use]
    pub fn record_metric(&self) -> Option<Metric> {
        self.record_metrics.first().copied()
    }
}

/// Evaluates the metrics of a newly inserted throw against the player's
/// current bests. A missing row counts as "no record" for every metric;
/// strictly greater values win and equal values are never records. Metrics
/// absent from the throw are left untouched.
#[must_use]
pub fn evaluate_highscore(
    current: Option<&Highscore>,
    player_id: &str,
    metrics: MetricValues,
    now: OffsetDateTime,
) -> HighscoreUpdate {
    let mut row = current.cloned().unwrap_or_else(|| Highscore {
        player_id: player_id.to_string(),
        best_rotation: None,
        best_height: None,
        best_max_acceleration: None,
        updated_at: now,
    });
    row.updated_at = now;

    let mut record_metrics = Vec::new();
    for metric in Metric::PRECEDENCE {
        let Some(value) = metrics.get(metric) else {
            continue;
        };

        let slot = row.best_slot_mut(metric);
        if (*slot).map_or(true, |best| value > best) {
            *slot = Some(value);
            record_metrics.push(metric);
        }
    }

    HighscoreUpdate {
        row,
        record_metrics,
    }
}

/// Caller-facing result of an ingestion operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReceipt {
    pub id: ThrowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_samples: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_new_record: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_metric: Option<Metric>,
}

/// Canonical audit snapshot of a throw.
///
/// # Errors
/// Returns [`IngestError::Validation`] when a timestamp cannot be formatted.
pub fn throw_snapshot(throw: &Throw) -> Result<Value, IngestError> {
    let (state, deleted_at) = match throw.lifecycle {
        ThrowLifecycle::Active => ("active", None),
        ThrowLifecycle::Deleted { at } => ("deleted", Some(format_rfc3339(at)?)),
    };

    Ok(serde_json::json!({
        "snapshot_schema": AUDIT_SNAPSHOT_SCHEMA,
        "id": throw.id.to_string(),
        "disc_id": throw.disc_id,
        "player_id": throw.player_id,
        "rotation": throw.rotation,
        "height": throw.height,
        "max_acceleration": throw.max_acceleration,
        "version": throw.version,
        "lifecycle": state,
        "deleted_at": deleted_at,
    }))
}

/// Canonical audit snapshot of a disc.
#[must_use]
pub fn disc_snapshot(disc: &Disc) -> Value {
    serde_json::json!({
        "snapshot_schema": AUDIT_SNAPSHOT_SCHEMA,
        "id": disc.id,
        "name": disc.name,
        "model": disc.model,
        "serial_number": disc.serial_number,
        "firmware_version": disc.firmware_version,
        "active": disc.active,
    })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`IngestError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IngestError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IngestError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IngestError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`IngestError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IngestError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            IngestError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_throw_input() -> ThrowInput {
        ThrowInput {
            id: None,
            disc_id: "disc-alpha".to_string(),
            player_id: Some("player-1".to_string()),
            rotation: Some(120.0),
            height: None,
            max_acceleration: None,
            start_time: None,
            end_time: None,
        }
    }

    fn fixture_highscore() -> Highscore {
        Highscore {
            player_id: "player-1".to_string(),
            best_rotation: Some(120.0),
            best_height: Some(8.5),
            best_max_acceleration: None,
            updated_at: must_utc("2026-03-01T10:00:00Z"),
        }
    }

    #[test]
    fn throw_input_requires_disc_id() {
        let mut input = fixture_throw_input();
        input.disc_id = "  ".to_string();

        let err = match input.validate() {
            Ok(()) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn throw_input_requires_at_least_one_metric() {
        let mut input = fixture_throw_input();
        input.rotation = None;

        let err = match input.validate() {
            Ok(()) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("at least one of"));
    }

    #[test]
    fn throw_input_rejects_non_finite_metric() {
        let mut input = fixture_throw_input();
        input.height = Some(f64::NAN);

        let err = match input.validate() {
            Ok(()) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("height must be a finite number"));
    }

    #[test]
    fn sample_batch_rejects_empty_input() {
        let err = match validate_sample_batch(&[]) {
            Ok(()) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn sample_batch_names_offending_index_for_missing_timestamp() {
        let good = SampleInput {
            timestamp: Some(must_utc("2026-03-01T10:00:00Z")),
            ..SampleInput::default()
        };
        let bad = SampleInput::default();

        let err = match validate_sample_batch(&[good, bad]) {
            Ok(()) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("sample at index 1"));
    }

    #[test]
    fn sample_input_rejects_legacy_alias_spellings() {
        let payload = serde_json::json!({
            "timestamp": "2026-03-01T10:00:00Z",
            "ax": 0.5,
        });

        let decoded: Result<SampleInput, _> = serde_json::from_value(payload);
        assert!(decoded.is_err());
    }

    #[test]
    fn sample_input_accepts_canonical_rfc3339_timestamp() {
        let payload = serde_json::json!({
            "timestamp": "2026-03-01T10:00:00Z",
            "accel_x": 0.5,
        });

        let decoded: SampleInput = must_ok(serde_json::from_value(payload));
        assert_eq!(decoded.timestamp, Some(must_utc("2026-03-01T10:00:00Z")));
    }

    #[test]
    fn throw_input_rejects_unknown_fields() {
        let payload = serde_json::json!({
            "disc_id": "disc-alpha",
            "hoehe": 8.5,
        });

        let decoded: Result<ThrowInput, _> = serde_json::from_value(payload);
        assert!(decoded.is_err());
    }

    #[test]
    fn first_throw_creates_row_from_present_metrics_only() {
        let update = evaluate_highscore(
            None,
            "player-1",
            MetricValues {
                rotation: Some(120.0),
                height: None,
                max_acceleration: None,
            },
            must_utc("2026-03-01T10:00:00Z"),
        );

        assert!(update.is_new_record());
        assert_eq!(update.record_metric(), Some(Metric::Rotation));
        assert_eq!(update.row.best_rotation, Some(120.0));
        assert_eq!(update.row.best_height, None);
        assert_eq!(update.row.best_max_acceleration, None);
    }

    #[test]
    fn equal_value_is_not_a_record() {
        let current = fixture_highscore();
        let update = evaluate_highscore(
            Some(&current),
            "player-1",
            MetricValues {
                rotation: Some(120.0),
                height: None,
                max_acceleration: None,
            },
            must_utc("2026-03-01T11:00:00Z"),
        );

        assert!(!update.is_new_record());
        assert_eq!(update.record_metric(), None);
        assert_eq!(update.row.best_rotation, Some(120.0));
    }

    #[test]
    fn higher_value_updates_only_that_metric() {
        let current = fixture_highscore();
        let update = evaluate_highscore(
            Some(&current),
            "player-1",
            MetricValues {
                rotation: Some(110.0),
                height: Some(9.0),
                max_acceleration: None,
            },
            must_utc("2026-03-01T11:00:00Z"),
        );

        assert!(update.is_new_record());
        assert_eq!(update.record_metric(), Some(Metric::Height));
        assert_eq!(update.row.best_rotation, Some(120.0));
        assert_eq!(update.row.best_height, Some(9.0));
    }

    #[test]
    fn record_metric_follows_fixed_precedence() {
        let current = fixture_highscore();
        let update = evaluate_highscore(
            Some(&current),
            "player-1",
            MetricValues {
                rotation: Some(130.0),
                height: Some(9.0),
                max_acceleration: Some(40.0),
            },
            must_utc("2026-03-01T11:00:00Z"),
        );

        assert_eq!(
            update.record_metrics,
            vec![Metric::Rotation, Metric::Height, Metric::MaxAcceleration]
        );
        assert_eq!(update.record_metric(), Some(Metric::Rotation));
    }

    #[test]
    fn absent_metric_with_no_prior_best_becomes_first_record() {
        let current = fixture_highscore();
        let update = evaluate_highscore(
            Some(&current),
            "player-1",
            MetricValues {
                rotation: None,
                height: None,
                max_acceleration: Some(35.0),
            },
            must_utc("2026-03-01T11:00:00Z"),
        );

        assert!(update.is_new_record());
        assert_eq!(update.record_metric(), Some(Metric::MaxAcceleration));
        assert_eq!(update.row.best_max_acceleration, Some(35.0));
    }

    #[test]
    fn throw_snapshot_carries_schema_version_and_lifecycle() {
        let throw = Throw {
            id: ThrowId::generate(),
            disc_id: "disc-alpha".to_string(),
            player_id: None,
            rotation: Some(100.0),
            height: None,
            max_acceleration: None,
            start_time: None,
            end_time: None,
            created_at: must_utc("2026-03-01T10:00:00Z"),
            modified_at: must_utc("2026-03-01T10:00:00Z"),
            version: 2,
            lifecycle: ThrowLifecycle::Deleted {
                at: must_utc("2026-03-02T10:00:00Z"),
            },
        };

        let snapshot = must_ok(throw_snapshot(&throw));
        assert_eq!(snapshot["snapshot_schema"], serde_json::json!(1));
        assert_eq!(snapshot["lifecycle"], serde_json::json!("deleted"));
        assert_eq!(
            snapshot["deleted_at"],
            serde_json::json!("2026-03-02T10:00:00Z")
        );
    }

    #[test]
    fn parse_rfc3339_requires_utc_offset() {
        let err = match parse_rfc3339_utc("2026-03-01T10:00:00+02:00") {
            Ok(_) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("UTC"));
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            IngestError::Validation(String::new()).kind(),
            "validation_error"
        );
        assert_eq!(IngestError::NotFound(String::new()).kind(), "not_found");
        assert_eq!(
            IngestError::Conflict(String::new()).kind(),
            "insert_conflict"
        );
        assert_eq!(
            IngestError::Transaction(String::new()).kind(),
            "transaction_error"
        );
    }
}
