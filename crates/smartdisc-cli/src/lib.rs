//! Embeddable SmartDisc command surface.
//!
//! Host runtimes can drive the ingestion core through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use smartdisc_core::{
    parse_rfc3339_utc, ActorContext, AuditOperation, DeletePolicy, DiscInput, Role, SampleInput,
    ThrowId, ThrowInput, TrackedTable,
};
use smartdisc_store_sqlite::{AuditFilter, SampleFilter, SqliteStore, ThrowFilter};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "sd")]
#[command(about = "SmartDisc ingestion CLI")]
pub struct Cli {
    #[arg(long, default_value = "./smartdisc.sqlite3")]
    db: PathBuf,

    /// Highscore behavior when throws are soft-deleted; defaults to
    /// retaining all-time bests.
    #[arg(long, value_enum)]
    delete_policy: Option<DeletePolicyArg>,

    #[arg(long)]
    actor_ip: Option<String>,

    #[arg(long)]
    actor_agent: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Disc {
        #[command(subcommand)]
        command: Box<DiscCommand>,
    },
    Throw {
        #[command(subcommand)]
        command: Box<ThrowCommand>,
    },
    Sample {
        #[command(subcommand)]
        command: Box<SampleCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
    Highscore {
        #[command(subcommand)]
        command: Box<HighscoreCommand>,
    },
    Stats {
        #[command(subcommand)]
        command: Box<StatsCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Token {
        #[command(subcommand)]
        command: Box<TokenCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DiscCommand {
    Register(DiscRegisterArgs),
    List,
    Deactivate(DiscIdArgs),
}

#[derive(Debug, Args)]
pub struct DiscRegisterArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    serial_number: Option<String>,
    #[arg(long)]
    firmware_version: Option<String>,
    #[arg(long)]
    calibration_date: Option<String>,
}

#[derive(Debug, Args)]
pub struct DiscIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum ThrowCommand {
    Create(ThrowCreateArgs),
    Get(ThrowIdArgs),
    List(ThrowListArgs),
    Delete(ThrowIdArgs),
}

#[derive(Debug, Args)]
pub struct ThrowCreateArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    disc_id: String,
    #[arg(long)]
    player_id: Option<String>,
    #[arg(long)]
    rotation: Option<f64>,
    #[arg(long)]
    height: Option<f64>,
    #[arg(long)]
    max_acceleration: Option<f64>,
    #[arg(long)]
    start_time: Option<String>,
    #[arg(long)]
    end_time: Option<String>,
    /// JSON array of sample objects; when present, the throw and the whole
    /// batch commit in one transaction.
    #[arg(long)]
    samples_json: Option<String>,
}

#[derive(Debug, Args)]
pub struct ThrowIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct ThrowListArgs {
    #[arg(long)]
    disc_id: Option<String>,
    #[arg(long)]
    player_id: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum SampleCommand {
    Add(SampleAddArgs),
    Append(SampleAppendArgs),
    List(SampleListArgs),
    ForThrow(SampleForThrowArgs),
}

#[derive(Debug, Args)]
pub struct SampleAddArgs {
    #[arg(long)]
    throw_id: String,
    #[arg(long)]
    timestamp: String,
    #[arg(long)]
    sequence_nr: Option<u32>,
    #[arg(long)]
    accel_x: Option<f64>,
    #[arg(long)]
    accel_y: Option<f64>,
    #[arg(long)]
    accel_z: Option<f64>,
    #[arg(long)]
    gyro_x: Option<f64>,
    #[arg(long)]
    gyro_y: Option<f64>,
    #[arg(long)]
    gyro_z: Option<f64>,
    #[arg(long)]
    mag_x: Option<f64>,
    #[arg(long)]
    mag_y: Option<f64>,
    #[arg(long)]
    mag_z: Option<f64>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    pressure: Option<f64>,
    #[arg(long)]
    gps_latitude: Option<f64>,
    #[arg(long)]
    gps_longitude: Option<f64>,
    #[arg(long)]
    gps_altitude: Option<f64>,
}

#[derive(Debug, Args)]
pub struct SampleAppendArgs {
    #[arg(long)]
    throw_id: String,
    /// JSON array of sample objects.
    #[arg(long)]
    samples_json: String,
}

#[derive(Debug, Args)]
pub struct SampleListArgs {
    #[arg(long)]
    throw_id: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct SampleForThrowArgs {
    #[arg(long)]
    throw_id: String,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    List(AuditListArgs),
}

#[derive(Debug, Args)]
pub struct AuditListArgs {
    #[arg(long)]
    table: Option<TableArg>,
    #[arg(long)]
    record_id: Option<String>,
    #[arg(long)]
    operation: Option<OperationArg>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum HighscoreCommand {
    Show(HighscoreShowArgs),
}

#[derive(Debug, Args)]
pub struct HighscoreShowArgs {
    #[arg(long)]
    player_id: String,
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    Summary,
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Register(UserRegisterArgs),
}

#[derive(Debug, Args)]
pub struct UserRegisterArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    role: RoleArg,
}

#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    Issue(TokenIssueArgs),
    Resolve(TokenArgs),
    Revoke(TokenArgs),
}

#[derive(Debug, Args)]
pub struct TokenIssueArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Args)]
pub struct TokenArgs {
    #[arg(long)]
    token: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DeletePolicyArg {
    RetainBests,
    RecomputeOnDelete,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Player,
    Trainer,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TableArg {
    Throws,
    Discs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OperationArg {
    Insert,
    InsertComplete,
    Delete,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let actor = ActorContext {
        ip: cli.actor_ip,
        agent: cli.actor_agent.or_else(|| Some("smartdisc-cli".to_string())),
    };
    let delete_policy = cli
        .delete_policy
        .map_or_else(DeletePolicy::default, map_delete_policy);
    run_command_with_db(&cli.db, delete_policy, &actor, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command
/// fails.
pub fn run_command_with_db(
    db_path: &Path,
    delete_policy: DeletePolicy,
    actor: &ActorContext,
    command: Command,
) -> Result<()> {
    let mut store = SqliteStore::open_with_policy(db_path, delete_policy)?;
    store.migrate()?;
    run_command(command, actor, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or retrieval fails.
pub fn run_command(command: Command, actor: &ActorContext, store: &mut SqliteStore) -> Result<()> {
    match command {
        Command::Disc { command } => run_disc(*command, actor, store),
        Command::Throw { command } => run_throw(*command, actor, store),
        Command::Sample { command } => run_sample(*command, store),
        Command::Audit { command } => run_audit(*command, store),
        Command::Highscore { command } => run_highscore(*command, store),
        Command::Stats { command } => run_stats(*command, store),
        Command::User { command } => run_user(*command, store),
        Command::Token { command } => run_token(*command, store),
    }
}

fn run_disc(command: DiscCommand, actor: &ActorContext, store: &mut SqliteStore) -> Result<()> {
    match command {
        DiscCommand::Register(args) => {
            let input = DiscInput {
                id: args.id,
                name: args.name,
                model: args.model,
                serial_number: args.serial_number,
                firmware_version: args.firmware_version,
                calibration_date: parse_optional_utc(args.calibration_date.as_deref())?,
            };
            let disc = store.register_disc(&input, actor)?;
            print_json(&disc)
        }
        DiscCommand::List => {
            let discs = store.list_discs()?;
            print_json(&discs)
        }
        DiscCommand::Deactivate(args) => {
            store.deactivate_disc(&args.id, actor)?;
            print_json(&serde_json::json!({ "id": args.id, "active": false }))
        }
    }
}

fn run_throw(command: ThrowCommand, actor: &ActorContext, store: &mut SqliteStore) -> Result<()> {
    match command {
        ThrowCommand::Create(args) => {
            let id = args
                .id
                .as_deref()
                .map(ThrowId::parse)
                .transpose()
                .map_err(|err| anyhow!("invalid --id value: {err}"))?;
            let input = ThrowInput {
                id,
                disc_id: args.disc_id,
                player_id: args.player_id,
                rotation: args.rotation,
                height: args.height,
                max_acceleration: args.max_acceleration,
                start_time: parse_optional_utc(args.start_time.as_deref())?,
                end_time: parse_optional_utc(args.end_time.as_deref())?,
            };

            let receipt = match args.samples_json {
                Some(raw) => {
                    let samples = parse_samples_json(&raw)?;
                    store.create_throw_with_samples(&input, &samples, actor)?
                }
                None => store.create_throw(&input, actor)?,
            };
            print_json(&receipt)
        }
        ThrowCommand::Get(args) => {
            let throw_id = parse_throw_id_arg(&args.id)?;
            let Some(throw) = store.get_throw(throw_id)? else {
                return Err(anyhow!("throw {} not found", args.id));
            };
            print_json(&throw)
        }
        ThrowCommand::List(args) => {
            let filter = ThrowFilter {
                disc_id: args.disc_id,
                player_id: args.player_id,
                from: parse_optional_utc(args.from.as_deref())?,
                to: parse_optional_utc(args.to.as_deref())?,
                limit: args.limit,
            };
            let throws = store.list_throws(&filter)?;
            print_json(&throws)
        }
        ThrowCommand::Delete(args) => {
            let throw_id = parse_throw_id_arg(&args.id)?;
            store.delete_throw(throw_id, actor)?;
            print_json(&serde_json::json!({ "id": args.id, "deleted": true }))
        }
    }
}

fn run_sample(command: SampleCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        SampleCommand::Add(args) => {
            let throw_id = parse_throw_id_arg(&args.throw_id)?;
            let input = SampleInput {
                id: None,
                timestamp: Some(
                    parse_rfc3339_utc(&args.timestamp)
                        .map_err(|err| anyhow!("invalid --timestamp value: {err}"))?,
                ),
                sequence_nr: args.sequence_nr,
                accel_x: args.accel_x,
                accel_y: args.accel_y,
                accel_z: args.accel_z,
                gyro_x: args.gyro_x,
                gyro_y: args.gyro_y,
                gyro_z: args.gyro_z,
                mag_x: args.mag_x,
                mag_y: args.mag_y,
                mag_z: args.mag_z,
                temperature: args.temperature,
                pressure: args.pressure,
                gps_latitude: args.gps_latitude,
                gps_longitude: args.gps_longitude,
                gps_altitude: args.gps_altitude,
            };
            let (sample_id, sequence_nr) = store.create_sample(throw_id, &input)?;
            print_json(&serde_json::json!({
                "id": sample_id.to_string(),
                "sequence_nr": sequence_nr,
            }))
        }
        SampleCommand::Append(args) => {
            let throw_id = parse_throw_id_arg(&args.throw_id)?;
            let samples = parse_samples_json(&args.samples_json)?;
            let inserted = store.append_samples(throw_id, &samples)?;
            print_json(&serde_json::json!({
                "throw_id": args.throw_id,
                "inserted_samples": inserted,
            }))
        }
        SampleCommand::List(args) => {
            let throw_id = args
                .throw_id
                .as_deref()
                .map(parse_throw_id_arg)
                .transpose()?;
            let filter = SampleFilter {
                throw_id,
                from: parse_optional_utc(args.from.as_deref())?,
                to: parse_optional_utc(args.to.as_deref())?,
                limit: args.limit,
            };
            let samples = store.list_samples(&filter)?;
            print_json(&samples)
        }
        SampleCommand::ForThrow(args) => {
            let throw_id = parse_throw_id_arg(&args.throw_id)?;
            let samples = store.list_samples_for_throw(throw_id)?;
            print_json(&samples)
        }
    }
}

fn run_audit(command: AuditCommand, store: &SqliteStore) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let filter = AuditFilter {
                table: args.table.map(map_table),
                record_id: args.record_id,
                operation: args.operation.map(map_operation),
                from: parse_optional_utc(args.from.as_deref())?,
                to: parse_optional_utc(args.to.as_deref())?,
                limit: args.limit,
            };
            let entries = store.list_audit(&filter)?;
            print_json(&entries)
        }
    }
}

fn run_highscore(command: HighscoreCommand, store: &SqliteStore) -> Result<()> {
    match command {
        HighscoreCommand::Show(args) => {
            let Some(highscore) = store.get_highscore(&args.player_id)? else {
                return Err(anyhow!("no highscore recorded for player {}", args.player_id));
            };
            print_json(&highscore)
        }
    }
}

fn run_stats(command: StatsCommand, store: &SqliteStore) -> Result<()> {
    match command {
        StatsCommand::Summary => {
            let stats = store.stats_summary()?;
            print_json(&stats)
        }
    }
}

fn run_user(command: UserCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        UserCommand::Register(args) => {
            let role = match args.role {
                RoleArg::Player => Role::Player,
                RoleArg::Trainer => Role::Trainer,
            };
            store.register_user(&args.id, role)?;
            print_json(&serde_json::json!({ "id": args.id, "role": role.as_str() }))
        }
    }
}

fn run_token(command: TokenCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        TokenCommand::Issue(args) => {
            let token = store.issue_token(&args.user_id)?;
            print_json(&serde_json::json!({ "user_id": args.user_id, "token": token }))
        }
        TokenCommand::Resolve(args) => {
            let Some(user) = store.resolve_token(&args.token)? else {
                return Err(anyhow!("token does not resolve to a user"));
            };
            print_json(&user)
        }
        TokenCommand::Revoke(args) => {
            store.revoke_token(&args.token)?;
            print_json(&serde_json::json!({ "revoked": true }))
        }
    }
}

fn map_delete_policy(arg: DeletePolicyArg) -> DeletePolicy {
    match arg {
        DeletePolicyArg::RetainBests => DeletePolicy::RetainBests,
        DeletePolicyArg::RecomputeOnDelete => DeletePolicy::RecomputeOnDelete,
    }
}

fn map_table(arg: TableArg) -> TrackedTable {
    match arg {
        TableArg::Throws => TrackedTable::Throws,
        TableArg::Discs => TrackedTable::Discs,
    }
}

fn map_operation(arg: OperationArg) -> AuditOperation {
    match arg {
        OperationArg::Insert => AuditOperation::Insert,
        OperationArg::InsertComplete => AuditOperation::InsertComplete,
        OperationArg::Delete => AuditOperation::Delete,
    }
}

fn parse_throw_id_arg(raw: &str) -> Result<ThrowId> {
    ThrowId::parse(raw).map_err(|err| anyhow!("invalid throw id: {err}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| {
        parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp value: {err}"))
    })
    .transpose()
}

fn parse_samples_json(raw: &str) -> Result<Vec<SampleInput>> {
    serde_json::from_str(raw).context("failed to parse --samples-json as a sample array")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
