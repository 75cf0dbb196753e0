#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use smartdisc_core::{
    disc_snapshot, evaluate_highscore, format_rfc3339, now_utc, parse_rfc3339_utc, throw_snapshot,
    ActorContext, AuditOperation, AuditRecord, AuthUser, DeletePolicy, Disc, DiscInput, Highscore,
    HighscoreUpdate, IngestError, IngestReceipt, Role, Sample, SampleId, SampleInput, Throw,
    ThrowId, ThrowInput, ThrowLifecycle, TrackedTable, AUDIT_SNAPSHOT_SCHEMA,
};
use time::OffsetDateTime;
use ulid::Ulid;

const INGEST_MIGRATION_VERSION: i64 = 1;

const SCHEMA_INGEST_V1: &str = r"
CREATE TABLE IF NOT EXISTS discs (
  id TEXT PRIMARY KEY,
  name TEXT,
  model TEXT,
  serial_number TEXT,
  firmware_version TEXT,
  calibration_date TEXT,
  active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_discs_created_at ON discs(created_at);

CREATE TABLE IF NOT EXISTS throws (
  id TEXT PRIMARY KEY,
  disc_id TEXT NOT NULL,
  player_id TEXT,
  rotation REAL,
  height REAL,
  max_acceleration REAL,
  start_time TEXT,
  end_time TEXT,
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL,
  version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
  deleted_at TEXT,
  CHECK ((deleted = 0 AND deleted_at IS NULL) OR (deleted = 1 AND deleted_at IS NOT NULL)),
  CHECK (rotation IS NOT NULL OR height IS NOT NULL OR max_acceleration IS NOT NULL),
  FOREIGN KEY (disc_id) REFERENCES discs(id)
);

CREATE INDEX IF NOT EXISTS idx_throws_disc_id ON throws(disc_id);
CREATE INDEX IF NOT EXISTS idx_throws_player_id ON throws(player_id);
CREATE INDEX IF NOT EXISTS idx_throws_created_at ON throws(created_at);
CREATE INDEX IF NOT EXISTS idx_throws_deleted ON throws(deleted);

CREATE TABLE IF NOT EXISTS samples (
  id TEXT PRIMARY KEY,
  throw_id TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  sequence_nr INTEGER NOT NULL CHECK (sequence_nr >= 0),
  accel_x REAL,
  accel_y REAL,
  accel_z REAL,
  gyro_x REAL,
  gyro_y REAL,
  gyro_z REAL,
  mag_x REAL,
  mag_y REAL,
  mag_z REAL,
  temperature REAL,
  pressure REAL,
  gps_latitude REAL,
  gps_longitude REAL,
  gps_altitude REAL,
  FOREIGN KEY (throw_id) REFERENCES throws(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_samples_throw_sequence ON samples(throw_id, sequence_nr);
CREATE INDEX IF NOT EXISTS idx_samples_timestamp ON samples(timestamp);

CREATE TABLE IF NOT EXISTS audit_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  table_name TEXT NOT NULL CHECK (table_name IN ('throws', 'discs')),
  record_id TEXT NOT NULL,
  operation TEXT NOT NULL CHECK (operation IN ('insert', 'insert_complete', 'delete')),
  before_json TEXT,
  after_json TEXT,
  actor_ip TEXT,
  actor_agent TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_audit_log_table_record ON audit_log(table_name, record_id);
CREATE INDEX IF NOT EXISTS idx_audit_log_recorded_at ON audit_log(recorded_at);

CREATE TABLE IF NOT EXISTS highscores (
  player_id TEXT PRIMARY KEY,
  best_rotation REAL,
  best_height REAL,
  best_max_acceleration REAL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  role TEXT NOT NULL CHECK (role IN ('player', 'trainer')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_tokens (
  token TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_auth_tokens_user_id ON auth_tokens(user_id);
";

const THROW_COLUMNS: &str = "id, disc_id, player_id, rotation, height, max_acceleration, \
     start_time, end_time, created_at, modified_at, version, deleted, deleted_at";

const SAMPLE_COLUMNS: &str = "id, throw_id, timestamp, sequence_nr, \
     accel_x, accel_y, accel_z, gyro_x, gyro_y, gyro_z, mag_x, mag_y, mag_z, \
     temperature, pressure, gps_latitude, gps_longitude, gps_altitude";

pub struct SqliteStore {
    conn: Connection,
    delete_policy: DeletePolicy,
}

#[derive(Debug, Clone, Default)]
pub struct ThrowFilter {
    pub disc_id: Option<String>,
    pub player_id: Option<String>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SampleFilter {
    pub throw_id: Option<ThrowId>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub table: Option<TrackedTable>,
    pub record_id: Option<String>,
    pub operation: Option<AuditOperation>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

/// Aggregate over live throws, mirroring the external stats read surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StatsSummary {
    pub throw_count: usize,
    pub rotation_max: Option<f64>,
    pub rotation_avg: Option<f64>,
    pub height_max: Option<f64>,
    pub height_avg: Option<f64>,
    pub max_acceleration_max: Option<f64>,
    pub max_acceleration_avg: Option<f64>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_policy(path, DeletePolicy::default())
    }

    pub fn open_with_policy(path: &Path, delete_policy: DeletePolicy) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            delete_policy,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_INGEST_V1)
            .context("failed to apply ingest schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow::anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![INGEST_MIGRATION_VERSION, now],
            )
            .context("failed to register ingest schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    pub fn register_disc(
        &mut self,
        input: &DiscInput,
        actor: &ActorContext,
    ) -> Result<Disc, IngestError> {
        input.validate()?;

        let now = now_utc();
        let disc = Disc {
            id: input.id.clone(),
            name: input.name.clone(),
            model: input.model.clone(),
            serial_number: input.serial_number.clone(),
            firmware_version: input.firmware_version.clone(),
            calibration_date: input.calibration_date,
            active: true,
            created_at: now,
            modified_at: now,
        };

        let tx = begin_write(&mut self.conn, "register disc")?;
        insert_disc(&tx, &disc)?;
        record_audit(
            &tx,
            TrackedTable::Discs,
            &disc.id,
            AuditOperation::Insert,
            None,
            Some(&disc_snapshot(&disc)),
            actor,
        )?;
        commit(tx, "register disc")?;

        Ok(disc)
    }

    /// Deactivation is terminal for listing purposes; the row persists for
    /// referential integrity and history.
    pub fn deactivate_disc(
        &mut self,
        disc_id: &str,
        actor: &ActorContext,
    ) -> Result<(), IngestError> {
        let tx = begin_write(&mut self.conn, "deactivate disc")?;

        let before = fetch_disc(&tx, disc_id)?
            .ok_or_else(|| IngestError::NotFound(format!("disc {disc_id} not found")))?;

        let mut after = before.clone();
        after.active = false;
        after.modified_at = now_utc();

        tx.execute(
            "UPDATE discs SET active = 0, modified_at = ?1 WHERE id = ?2",
            params![format_rfc3339(after.modified_at)?, disc_id],
        )
        .map_err(|err| store_error("deactivate disc", &err))?;

        record_audit(
            &tx,
            TrackedTable::Discs,
            disc_id,
            AuditOperation::Delete,
            Some(&disc_snapshot(&before)),
            Some(&disc_snapshot(&after)),
            actor,
        )?;
        commit(tx, "deactivate disc")?;

        Ok(())
    }

    pub fn list_discs(&self) -> Result<Vec<Disc>, IngestError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, model, serial_number, firmware_version, calibration_date,
                        active, created_at, modified_at
                 FROM discs
                 WHERE active = 1
                 ORDER BY created_at DESC",
            )
            .map_err(|err| store_error("list discs", &err))?;

        let rows = stmt
            .query_map([], parse_disc_row)
            .map_err(|err| store_error("list discs", &err))?;
        collect_rows(rows, "list discs")
    }

    /// Persists a throw, its audit entry, and any highscore update as one
    /// atomic unit.
    pub fn create_throw(
        &mut self,
        input: &ThrowInput,
        actor: &ActorContext,
    ) -> Result<IngestReceipt, IngestError> {
        input.validate()?;

        let throw = build_throw(input, now_utc());
        let tx = begin_write(&mut self.conn, "create throw")?;

        ensure_disc_exists(&tx, &throw.disc_id)?;
        insert_throw(&tx, &throw)?;
        record_audit(
            &tx,
            TrackedTable::Throws,
            &throw.id.to_string(),
            AuditOperation::Insert,
            None,
            Some(&throw_snapshot(&throw)?),
            actor,
        )?;
        let update = apply_highscore(&tx, &throw)?;
        commit(tx, "create throw")?;

        Ok(receipt(&throw, None, update.as_ref()))
    }

    /// Persists a throw together with its whole sample batch. Any failure
    /// mid-batch rolls the entire transaction back; zero rows of either kind
    /// remain.
    pub fn create_throw_with_samples(
        &mut self,
        input: &ThrowInput,
        samples: &[SampleInput],
        actor: &ActorContext,
    ) -> Result<IngestReceipt, IngestError> {
        input.validate()?;
        smartdisc_core::validate_sample_batch(samples)?;

        let mut throw = build_throw(input, now_utc());
        if throw.start_time.is_none() {
            throw.start_time = samples.first().and_then(|sample| sample.timestamp);
        }
        if throw.end_time.is_none() {
            throw.end_time = samples.last().and_then(|sample| sample.timestamp);
        }

        let tx = begin_write(&mut self.conn, "create throw with samples")?;

        ensure_disc_exists(&tx, &throw.disc_id)?;
        insert_throw(&tx, &throw)?;
        let inserted = insert_sample_batch(&tx, throw.id, samples)?;
        record_audit(
            &tx,
            TrackedTable::Throws,
            &throw.id.to_string(),
            AuditOperation::InsertComplete,
            None,
            Some(&serde_json::json!({
                "snapshot_schema": AUDIT_SNAPSHOT_SCHEMA,
                "id": throw.id.to_string(),
                "inserted_samples": inserted,
            })),
            actor,
        )?;
        let update = apply_highscore(&tx, &throw)?;
        commit(tx, "create throw with samples")?;

        Ok(receipt(&throw, Some(inserted), update.as_ref()))
    }

    /// Appends a sample batch to an existing live throw. Sample-only appends
    /// emit no audit entry.
    pub fn append_samples(
        &mut self,
        throw_id: ThrowId,
        samples: &[SampleInput],
    ) -> Result<usize, IngestError> {
        smartdisc_core::validate_sample_batch(samples)?;

        let tx = begin_write(&mut self.conn, "append samples")?;
        let _ = fetch_live_throw(&tx, throw_id)?;
        let inserted = insert_sample_batch(&tx, throw_id, samples)?;
        commit(tx, "append samples")?;

        Ok(inserted)
    }

    /// Single-sample convenience path. Sequence allocation runs inside an
    /// immediate transaction, so the read-max-then-insert pair is serialized
    /// by the store's write lock.
    pub fn create_sample(
        &mut self,
        throw_id: ThrowId,
        input: &SampleInput,
    ) -> Result<(SampleId, u32), IngestError> {
        if input.timestamp.is_none() {
            return Err(IngestError::Validation("timestamp is required".to_string()));
        }

        let tx = begin_write(&mut self.conn, "create sample")?;
        let _ = fetch_live_throw(&tx, throw_id)?;

        let sequence_nr = match input.sequence_nr {
            Some(value) => value,
            None => next_sequence_nr(&tx, throw_id)?,
        };
        let sample = build_sample(throw_id, input, sequence_nr)?;
        insert_sample_row(&tx, &sample)?;
        commit(tx, "create sample")?;

        Ok((sample.id, sequence_nr))
    }

    /// Soft-deletes a throw: lifecycle becomes `Deleted`, the version counter
    /// advances, and a delete audit entry captures both snapshots. The
    /// configured [`DeletePolicy`] decides whether the player's highscores
    /// are recomputed from the remaining live throws.
    pub fn delete_throw(
        &mut self,
        throw_id: ThrowId,
        actor: &ActorContext,
    ) -> Result<(), IngestError> {
        let delete_policy = self.delete_policy;
        let tx = begin_write(&mut self.conn, "delete throw")?;

        let before = fetch_live_throw(&tx, throw_id)?;
        let now = now_utc();
        let mut after = before.clone();
        after.lifecycle = ThrowLifecycle::Deleted { at: now };
        after.version = before.version + 1;
        after.modified_at = now;

        tx.execute(
            "UPDATE throws
             SET modified_at = ?1, version = ?2, deleted = 1, deleted_at = ?3
             WHERE id = ?4 AND deleted = 0",
            params![
                format_rfc3339(after.modified_at)?,
                i64::from(after.version),
                format_rfc3339(now)?,
                throw_id.to_string(),
            ],
        )
        .map_err(|err| store_error("delete throw", &err))?;

        record_audit(
            &tx,
            TrackedTable::Throws,
            &throw_id.to_string(),
            AuditOperation::Delete,
            Some(&throw_snapshot(&before)?),
            Some(&throw_snapshot(&after)?),
            actor,
        )?;

        if delete_policy == DeletePolicy::RecomputeOnDelete {
            if let Some(player_id) = before.player_id.as_deref() {
                recompute_highscore(&tx, player_id)?;
            }
        }

        commit(tx, "delete throw")?;
        Ok(())
    }

    /// Live throws only; soft-deleted throws stay reachable through the audit
    /// trail and their samples.
    pub fn get_throw(&self, throw_id: ThrowId) -> Result<Option<Throw>, IngestError> {
        let query = format!("SELECT {THROW_COLUMNS} FROM throws WHERE id = ?1 AND deleted = 0");
        self.conn
            .query_row(&query, params![throw_id.to_string()], parse_throw_row)
            .optional()
            .map_err(|err| store_error("get throw", &err))
    }

    pub fn list_throws(&self, filter: &ThrowFilter) -> Result<Vec<Throw>, IngestError> {
        let mut clauses = vec!["deleted = 0".to_string()];
        let mut args: Vec<String> = Vec::new();

        if let Some(disc_id) = &filter.disc_id {
            args.push(disc_id.clone());
            clauses.push(format!("disc_id = ?{}", args.len()));
        }
        if let Some(player_id) = &filter.player_id {
            args.push(player_id.clone());
            clauses.push(format!("player_id = ?{}", args.len()));
        }
        if let Some(from) = filter.from {
            args.push(format_rfc3339(from)?);
            clauses.push(format!("created_at >= ?{}", args.len()));
        }
        if let Some(to) = filter.to {
            args.push(format_rfc3339(to)?);
            clauses.push(format!("created_at <= ?{}", args.len()));
        }

        let mut query = format!(
            "SELECT {THROW_COLUMNS} FROM throws WHERE {} ORDER BY created_at DESC",
            clauses.join(" AND ")
        );
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ");
            query.push_str(&limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| store_error("list throws", &err))?;
        let rows = stmt
            .query_map(params_from_iter(args), parse_throw_row)
            .map_err(|err| store_error("list throws", &err))?;
        collect_rows(rows, "list throws")
    }

    pub fn list_samples(&self, filter: &SampleFilter) -> Result<Vec<Sample>, IngestError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(throw_id) = filter.throw_id {
            args.push(throw_id.to_string());
            clauses.push(format!("throw_id = ?{}", args.len()));
        }
        if let Some(from) = filter.from {
            args.push(format_rfc3339(from)?);
            clauses.push(format!("timestamp >= ?{}", args.len()));
        }
        if let Some(to) = filter.to {
            args.push(format_rfc3339(to)?);
            clauses.push(format!("timestamp <= ?{}", args.len()));
        }

        let mut query = format!("SELECT {SAMPLE_COLUMNS} FROM samples");
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY timestamp DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ");
            query.push_str(&limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| store_error("list samples", &err))?;
        let rows = stmt
            .query_map(params_from_iter(args), parse_sample_row)
            .map_err(|err| store_error("list samples", &err))?;
        collect_rows(rows, "list samples")
    }

    /// Sequence-ordered samples of one throw; also available for soft-deleted
    /// throws.
    pub fn list_samples_for_throw(&self, throw_id: ThrowId) -> Result<Vec<Sample>, IngestError> {
        let query = format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples WHERE throw_id = ?1 ORDER BY sequence_nr ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| store_error("list samples for throw", &err))?;
        let rows = stmt
            .query_map(params![throw_id.to_string()], parse_sample_row)
            .map_err(|err| store_error("list samples for throw", &err))?;
        collect_rows(rows, "list samples for throw")
    }

    pub fn get_highscore(&self, player_id: &str) -> Result<Option<Highscore>, IngestError> {
        query_highscore(&self.conn, player_id)
    }

    /// Audit entries ordered by timestamp descending; ties resolve by
    /// insertion order, older first.
    pub fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, IngestError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(table) = filter.table {
            args.push(table.as_str().to_string());
            clauses.push(format!("table_name = ?{}", args.len()));
        }
        if let Some(record_id) = &filter.record_id {
            args.push(record_id.clone());
            clauses.push(format!("record_id = ?{}", args.len()));
        }
        if let Some(operation) = filter.operation {
            args.push(operation.as_str().to_string());
            clauses.push(format!("operation = ?{}", args.len()));
        }
        if let Some(from) = filter.from {
            args.push(format_rfc3339(from)?);
            clauses.push(format!("recorded_at >= ?{}", args.len()));
        }
        if let Some(to) = filter.to {
            args.push(format_rfc3339(to)?);
            clauses.push(format!("recorded_at <= ?{}", args.len()));
        }

        let mut query = "SELECT id, table_name, record_id, operation, before_json, after_json, \
             actor_ip, actor_agent, recorded_at FROM audit_log"
            .to_string();
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY recorded_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ");
            query.push_str(&limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| store_error("list audit entries", &err))?;
        let rows = stmt
            .query_map(params_from_iter(args), parse_audit_row)
            .map_err(|err| store_error("list audit entries", &err))?;
        collect_rows(rows, "list audit entries")
    }

    pub fn stats_summary(&self) -> Result<StatsSummary, IngestError> {
        let row = self
            .conn
            .query_row(
                "SELECT COUNT(*),
                        MAX(rotation), AVG(rotation),
                        MAX(height), AVG(height),
                        MAX(max_acceleration), AVG(max_acceleration)
                 FROM throws
                 WHERE deleted = 0",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                    ))
                },
            )
            .map_err(|err| store_error("stats summary", &err))?;

        let (count, rotation_max, rotation_avg, height_max, height_avg, accel_max, accel_avg) = row;
        let throw_count = usize::try_from(count)
            .map_err(|_| IngestError::Transaction("stats summary: invalid count".to_string()))?;

        Ok(StatsSummary {
            throw_count,
            rotation_max,
            rotation_avg,
            height_max,
            height_avg,
            max_acceleration_max: accel_max,
            max_acceleration_avg: accel_avg,
        })
    }

    pub fn register_user(&mut self, user_id: &str, role: Role) -> Result<(), IngestError> {
        if user_id.trim().is_empty() {
            return Err(IngestError::Validation("user id is required".to_string()));
        }

        self.conn
            .execute(
                "INSERT INTO users(id, role, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, role.as_str(), format_rfc3339(now_utc())?],
            )
            .map_err(|err| {
                if is_constraint_violation(&err) {
                    IngestError::Conflict(format!("user {user_id} already exists"))
                } else {
                    store_error("register user", &err)
                }
            })?;
        Ok(())
    }

    /// Issues a long-lived random bearer token for the given user.
    pub fn issue_token(&mut self, user_id: &str) -> Result<String, IngestError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(|err| store_error("issue token", &err))?
            .is_some();
        if !exists {
            return Err(IngestError::NotFound(format!("user {user_id} not found")));
        }

        let token = Ulid::new().to_string();
        self.conn
            .execute(
                "INSERT INTO auth_tokens(token, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, format_rfc3339(now_utc())?],
            )
            .map_err(|err| store_error("issue token", &err))?;

        Ok(token)
    }

    /// Resolves a bearer token to the user id and role it was issued for.
    pub fn resolve_token(&self, token: &str) -> Result<Option<AuthUser>, IngestError> {
        self.conn
            .query_row(
                "SELECT users.id, users.role
                 FROM users
                 INNER JOIN auth_tokens ON auth_tokens.user_id = users.id
                 WHERE auth_tokens.token = ?1",
                params![token],
                |row| {
                    let id: String = row.get(0)?;
                    let role_raw: String = row.get(1)?;
                    let role = Role::parse(&role_raw).ok_or_else(|| {
                        invalid_column(1, format!("invalid role: {role_raw}"))
                    })?;
                    Ok(AuthUser { id, role })
                },
            )
            .optional()
            .map_err(|err| store_error("resolve token", &err))
    }

    /// Revocation is explicit deletion of the credential record.
    pub fn revoke_token(&mut self, token: &str) -> Result<(), IngestError> {
        let removed = self
            .conn
            .execute("DELETE FROM auth_tokens WHERE token = ?1", params![token])
            .map_err(|err| store_error("revoke token", &err))?;

        if removed == 0 {
            return Err(IngestError::NotFound("token not found".to_string()));
        }
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn begin_write<'a>(
    conn: &'a mut Connection,
    operation: &str,
) -> Result<rusqlite::Transaction<'a>, IngestError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|_| IngestError::Transaction(format!("{operation}: failed to begin transaction")))
}

fn commit(tx: rusqlite::Transaction<'_>, operation: &str) -> Result<(), IngestError> {
    tx.commit()
        .map_err(|_| IngestError::Transaction(format!("{operation}: commit failed")))
}

fn build_throw(input: &ThrowInput, now: OffsetDateTime) -> Throw {
    Throw {
        id: input.id.unwrap_or_else(ThrowId::generate),
        disc_id: input.disc_id.clone(),
        player_id: input.player_id.clone(),
        rotation: input.rotation,
        height: input.height,
        max_acceleration: input.max_acceleration,
        start_time: input.start_time,
        end_time: input.end_time,
        created_at: now,
        modified_at: now,
        version: 1,
        lifecycle: ThrowLifecycle::Active,
    }
}

fn build_sample(
    throw_id: ThrowId,
    input: &SampleInput,
    sequence_nr: u32,
) -> Result<Sample, IngestError> {
    let timestamp = input
        .timestamp
        .ok_or_else(|| IngestError::Validation("timestamp is required".to_string()))?;

    Ok(Sample {
        id: input.id.unwrap_or_else(SampleId::generate),
        throw_id,
        timestamp,
        sequence_nr,
        accel_x: input.accel_x,
        accel_y: input.accel_y,
        accel_z: input.accel_z,
        gyro_x: input.gyro_x,
        gyro_y: input.gyro_y,
        gyro_z: input.gyro_z,
        mag_x: input.mag_x,
        mag_y: input.mag_y,
        mag_z: input.mag_z,
        temperature: input.temperature,
        pressure: input.pressure,
        gps_latitude: input.gps_latitude,
        gps_longitude: input.gps_longitude,
        gps_altitude: input.gps_altitude,
    })
}

fn receipt(
    throw: &Throw,
    inserted_samples: Option<usize>,
    update: Option<&HighscoreUpdate>,
) -> IngestReceipt {
    IngestReceipt {
        id: throw.id,
        inserted_samples,
        is_new_record: update.map(HighscoreUpdate::is_new_record),
        record_metric: update.and_then(HighscoreUpdate::record_metric),
    }
}

fn ensure_disc_exists(conn: &Connection, disc_id: &str) -> Result<(), IngestError> {
    let exists = conn
        .query_row("SELECT 1 FROM discs WHERE id = ?1", params![disc_id], |_| {
            Ok(())
        })
        .optional()
        .map_err(|err| store_error("check disc reference", &err))?
        .is_some();

    if exists {
        Ok(())
    } else {
        Err(IngestError::NotFound(format!("disc {disc_id} not found")))
    }
}

fn fetch_disc(conn: &Connection, disc_id: &str) -> Result<Option<Disc>, IngestError> {
    conn.query_row(
        "SELECT id, name, model, serial_number, firmware_version, calibration_date,
                active, created_at, modified_at
         FROM discs
         WHERE id = ?1",
        params![disc_id],
        parse_disc_row,
    )
    .optional()
    .map_err(|err| store_error("fetch disc", &err))
}

fn fetch_live_throw(conn: &Connection, throw_id: ThrowId) -> Result<Throw, IngestError> {
    let query = format!("SELECT {THROW_COLUMNS} FROM throws WHERE id = ?1 AND deleted = 0");
    conn.query_row(&query, params![throw_id.to_string()], parse_throw_row)
        .optional()
        .map_err(|err| store_error("fetch throw", &err))?
        .ok_or_else(|| IngestError::NotFound(format!("throw {throw_id} not found")))
}

fn insert_disc(conn: &Connection, disc: &Disc) -> Result<(), IngestError> {
    conn.execute(
        "INSERT INTO discs(
            id, name, model, serial_number, firmware_version, calibration_date,
            active, created_at, modified_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            disc.id,
            disc.name,
            disc.model,
            disc.serial_number,
            disc.firmware_version,
            disc.calibration_date.map(format_rfc3339).transpose()?,
            i64::from(disc.active),
            format_rfc3339(disc.created_at)?,
            format_rfc3339(disc.modified_at)?,
        ],
    )
    .map_err(|err| {
        if is_constraint_violation(&err) {
            IngestError::Conflict(format!("disc {} already registered", disc.id))
        } else {
            IngestError::Transaction("insert disc: store operation failed".to_string())
        }
    })?;
    Ok(())
}

fn insert_throw(conn: &Connection, throw: &Throw) -> Result<(), IngestError> {
    let (deleted, deleted_at) = match throw.lifecycle {
        ThrowLifecycle::Active => (0_i64, None),
        ThrowLifecycle::Deleted { at } => (1_i64, Some(format_rfc3339(at)?)),
    };

    conn.execute(
        "INSERT INTO throws(
            id, disc_id, player_id, rotation, height, max_acceleration,
            start_time, end_time, created_at, modified_at, version, deleted, deleted_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            throw.id.to_string(),
            throw.disc_id,
            throw.player_id,
            throw.rotation,
            throw.height,
            throw.max_acceleration,
            throw.start_time.map(format_rfc3339).transpose()?,
            throw.end_time.map(format_rfc3339).transpose()?,
            format_rfc3339(throw.created_at)?,
            format_rfc3339(throw.modified_at)?,
            i64::from(throw.version),
            deleted,
            deleted_at,
        ],
    )
    .map_err(|err| {
        if is_constraint_violation(&err) {
            IngestError::Conflict(format!("throw {} already exists", throw.id))
        } else {
            IngestError::Transaction("insert throw: store operation failed".to_string())
        }
    })?;
    Ok(())
}

/// Batch-mode sequence assignment: position within the batch unless the entry
/// carries an explicit number. Explicit numbers are trusted, not gap-checked.
fn insert_sample_batch(
    conn: &Connection,
    throw_id: ThrowId,
    samples: &[SampleInput],
) -> Result<usize, IngestError> {
    let mut inserted = 0_usize;
    for (index, input) in samples.iter().enumerate() {
        let positional = u32::try_from(index)
            .map_err(|_| IngestError::Validation("sample batch too large".to_string()))?;
        let sequence_nr = input.sequence_nr.unwrap_or(positional);
        let sample = build_sample(throw_id, input, sequence_nr)?;
        insert_sample_row(conn, &sample)?;
        inserted += 1;
    }
    Ok(inserted)
}

fn insert_sample_row(conn: &Connection, sample: &Sample) -> Result<(), IngestError> {
    conn.execute(
        "INSERT INTO samples(
            id, throw_id, timestamp, sequence_nr,
            accel_x, accel_y, accel_z, gyro_x, gyro_y, gyro_z, mag_x, mag_y, mag_z,
            temperature, pressure, gps_latitude, gps_longitude, gps_altitude
         ) VALUES (
            ?1, ?2, ?3, ?4,
            ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
            ?14, ?15, ?16, ?17, ?18
         )",
        params![
            sample.id.to_string(),
            sample.throw_id.to_string(),
            format_rfc3339(sample.timestamp)?,
            i64::from(sample.sequence_nr),
            sample.accel_x,
            sample.accel_y,
            sample.accel_z,
            sample.gyro_x,
            sample.gyro_y,
            sample.gyro_z,
            sample.mag_x,
            sample.mag_y,
            sample.mag_z,
            sample.temperature,
            sample.pressure,
            sample.gps_latitude,
            sample.gps_longitude,
            sample.gps_altitude,
        ],
    )
    .map_err(|err| {
        if is_constraint_violation(&err) {
            IngestError::Conflict(format!(
                "sample insert conflict for throw {} at sequence {}",
                sample.throw_id, sample.sequence_nr
            ))
        } else {
            IngestError::Transaction("insert sample: store operation failed".to_string())
        }
    })?;
    Ok(())
}

/// Single-insert sequence allocation: current maximum for the throw plus one,
/// or zero when no samples exist yet.
fn next_sequence_nr(conn: &Connection, throw_id: ThrowId) -> Result<u32, IngestError> {
    let next: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sequence_nr), -1) + 1 FROM samples WHERE throw_id = ?1",
            params![throw_id.to_string()],
            |row| row.get(0),
        )
        .map_err(|err| store_error("allocate sequence number", &err))?;

    u32::try_from(next).map_err(|_| {
        IngestError::Transaction("allocate sequence number: sequence overflow".to_string())
    })
}

/// Appends one audit entry on the open transaction of the mutation it
/// documents, so a reader can never observe one without the other.
fn record_audit(
    conn: &Connection,
    table: TrackedTable,
    record_id: &str,
    operation: AuditOperation,
    before: Option<&Value>,
    after: Option<&Value>,
    actor: &ActorContext,
) -> Result<(), IngestError> {
    conn.execute(
        "INSERT INTO audit_log(
            table_name, record_id, operation, before_json, after_json,
            actor_ip, actor_agent, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            table.as_str(),
            record_id,
            operation.as_str(),
            before.map(Value::to_string),
            after.map(Value::to_string),
            actor.ip,
            actor.agent,
            format_rfc3339(now_utc())?,
        ],
    )
    .map_err(|err| store_error("record audit entry", &err))?;
    Ok(())
}

fn apply_highscore(
    conn: &Connection,
    throw: &Throw,
) -> Result<Option<HighscoreUpdate>, IngestError> {
    let Some(player_id) = throw.player_id.as_deref() else {
        return Ok(None);
    };

    let metrics = throw.metrics();
    if metrics.is_empty() {
        return Ok(None);
    }

    let current = query_highscore(conn, player_id)?;
    let update = evaluate_highscore(current.as_ref(), player_id, metrics, now_utc());
    if update.is_new_record() {
        upsert_highscore(conn, &update.row)?;
    }

    Ok(Some(update))
}

fn query_highscore(conn: &Connection, player_id: &str) -> Result<Option<Highscore>, IngestError> {
    conn.query_row(
        "SELECT player_id, best_rotation, best_height, best_max_acceleration, updated_at
         FROM highscores
         WHERE player_id = ?1",
        params![player_id],
        parse_highscore_row,
    )
    .optional()
    .map_err(|err| store_error("query highscore", &err))
}

fn upsert_highscore(conn: &Connection, row: &Highscore) -> Result<(), IngestError> {
    conn.execute(
        "INSERT INTO highscores(player_id, best_rotation, best_height, best_max_acceleration, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(player_id) DO UPDATE SET
            best_rotation = excluded.best_rotation,
            best_height = excluded.best_height,
            best_max_acceleration = excluded.best_max_acceleration,
            updated_at = excluded.updated_at",
        params![
            row.player_id,
            row.best_rotation,
            row.best_height,
            row.best_max_acceleration,
            format_rfc3339(row.updated_at)?,
        ],
    )
    .map_err(|err| store_error("upsert highscore", &err))?;
    Ok(())
}

/// Rebuilds a player's bests from the remaining live throws. Used only under
/// [`DeletePolicy::RecomputeOnDelete`].
fn recompute_highscore(conn: &Connection, player_id: &str) -> Result<(), IngestError> {
    let (live_count, rotation, height, acceleration) = conn
        .query_row(
            "SELECT COUNT(*), MAX(rotation), MAX(height), MAX(max_acceleration)
             FROM throws
             WHERE player_id = ?1 AND deleted = 0",
            params![player_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )
        .map_err(|err| store_error("recompute highscore", &err))?;

    if live_count == 0 {
        conn.execute(
            "DELETE FROM highscores WHERE player_id = ?1",
            params![player_id],
        )
        .map_err(|err| store_error("recompute highscore", &err))?;
        return Ok(());
    }

    upsert_highscore(
        conn,
        &Highscore {
            player_id: player_id.to_string(),
            best_rotation: rotation,
            best_height: height,
            best_max_acceleration: acceleration,
            updated_at: now_utc(),
        },
    )
}

fn parse_disc_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Disc> {
    let calibration_raw: Option<String> = row.get(5)?;
    let calibration_date = calibration_raw
        .as_deref()
        .map(|raw| parse_rfc3339_utc(raw).map_err(to_sql_error))
        .transpose()?;

    Ok(Disc {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        serial_number: row.get(3)?,
        firmware_version: row.get(4)?,
        calibration_date,
        active: row.get::<_, i64>(6)? == 1,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(7)?).map_err(to_sql_error)?,
        modified_at: parse_rfc3339_utc(&row.get::<_, String>(8)?).map_err(to_sql_error)?,
    })
}

fn parse_throw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Throw> {
    let id_raw: String = row.get(0)?;
    let version_i64: i64 = row.get(10)?;
    let deleted: i64 = row.get(11)?;
    let deleted_at_raw: Option<String> = row.get(12)?;

    let version = u32::try_from(version_i64)
        .map_err(|_| invalid_column(10, format!("invalid version: {version_i64}")))?;

    let lifecycle = if deleted == 1 {
        let raw = deleted_at_raw
            .ok_or_else(|| invalid_column(12, "deleted throw missing deleted_at".to_string()))?;
        ThrowLifecycle::Deleted {
            at: parse_rfc3339_utc(&raw).map_err(to_sql_error)?,
        }
    } else {
        ThrowLifecycle::Active
    };

    let start_raw: Option<String> = row.get(6)?;
    let end_raw: Option<String> = row.get(7)?;

    Ok(Throw {
        id: parse_throw_id(&id_raw)?,
        disc_id: row.get(1)?,
        player_id: row.get(2)?,
        rotation: row.get(3)?,
        height: row.get(4)?,
        max_acceleration: row.get(5)?,
        start_time: start_raw
            .as_deref()
            .map(|raw| parse_rfc3339_utc(raw).map_err(to_sql_error))
            .transpose()?,
        end_time: end_raw
            .as_deref()
            .map(|raw| parse_rfc3339_utc(raw).map_err(to_sql_error))
            .transpose()?,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(8)?).map_err(to_sql_error)?,
        modified_at: parse_rfc3339_utc(&row.get::<_, String>(9)?).map_err(to_sql_error)?,
        version,
        lifecycle,
    })
}

fn parse_sample_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    let id_raw: String = row.get(0)?;
    let throw_id_raw: String = row.get(1)?;
    let sequence_i64: i64 = row.get(3)?;

    let sequence_nr = u32::try_from(sequence_i64)
        .map_err(|_| invalid_column(3, format!("invalid sequence_nr: {sequence_i64}")))?;

    Ok(Sample {
        id: SampleId(parse_ulid(&id_raw, 0)?),
        throw_id: parse_throw_id(&throw_id_raw)?,
        timestamp: parse_rfc3339_utc(&row.get::<_, String>(2)?).map_err(to_sql_error)?,
        sequence_nr,
        accel_x: row.get(4)?,
        accel_y: row.get(5)?,
        accel_z: row.get(6)?,
        gyro_x: row.get(7)?,
        gyro_y: row.get(8)?,
        gyro_z: row.get(9)?,
        mag_x: row.get(10)?,
        mag_y: row.get(11)?,
        mag_z: row.get(12)?,
        temperature: row.get(13)?,
        pressure: row.get(14)?,
        gps_latitude: row.get(15)?,
        gps_longitude: row.get(16)?,
        gps_altitude: row.get(17)?,
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let table_raw: String = row.get(1)?;
    let operation_raw: String = row.get(3)?;
    let before_raw: Option<String> = row.get(4)?;
    let after_raw: Option<String> = row.get(5)?;

    let table = TrackedTable::parse(&table_raw)
        .ok_or_else(|| invalid_column(1, format!("invalid table_name: {table_raw}")))?;
    let operation = AuditOperation::parse(&operation_raw)
        .ok_or_else(|| invalid_column(3, format!("invalid operation: {operation_raw}")))?;

    let before = before_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .map_err(|err| invalid_column(4, format!("invalid before_json: {err}")))
        })
        .transpose()?;
    let after = after_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .map_err(|err| invalid_column(5, format!("invalid after_json: {err}")))
        })
        .transpose()?;

    Ok(AuditRecord {
        id: row.get(0)?,
        table,
        record_id: row.get(2)?,
        operation,
        before,
        after,
        actor_ip: row.get(6)?,
        actor_agent: row.get(7)?,
        recorded_at: parse_rfc3339_utc(&row.get::<_, String>(8)?).map_err(to_sql_error)?,
    })
}

fn parse_highscore_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Highscore> {
    Ok(Highscore {
        player_id: row.get(0)?,
        best_rotation: row.get(1)?,
        best_height: row.get(2)?,
        best_max_acceleration: row.get(3)?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(4)?).map_err(to_sql_error)?,
    })
}

fn parse_throw_id(raw: &str) -> rusqlite::Result<ThrowId> {
    Ok(ThrowId(parse_ulid(raw, 0)?))
}

fn parse_ulid(raw: &str, column: usize) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| invalid_column(column, format!("invalid ULID: {raw}")))
}

fn invalid_column(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: IngestError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Maps a store-level failure to the caller contract without leaking raw
/// driver text.
fn store_error(operation: &str, err: &rusqlite::Error) -> IngestError {
    if is_constraint_violation(err) {
        IngestError::Conflict(format!("{operation}: uniqueness constraint violated"))
    } else {
        IngestError::Transaction(format!("{operation}: store operation failed"))
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
    operation: &str,
) -> Result<Vec<T>, IngestError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| store_error(operation, &err))?);
    }
    Ok(values)
}
