use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use series_dao_api::{ApiConfig, CountTarget, SeriesDaoApi, ValueQuery};
use series_dao_core::{Crs, ErrorCategory, ParameterEntity, QueryError, QuerySpecification};
use series_dao_store_sqlite::Fixture;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sdao")]
#[command(about = "Series data-access CLI")]
struct Cli {
    #[arg(long, env = "SERIES_DAO_DB", default_value = "./series_dao.sqlite3")]
    db: PathBuf,

    /// Reference system geometries are stored in.
    #[arg(long, env = "SERIES_DAO_DATABASE_CRS", default_value = "EPSG:4326")]
    database_crs: String,

    /// Request parameter as `key=value`; repeatable.
    #[arg(long = "param", value_name = "KEY=VALUE", global = true)]
    params: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Series {
        #[command(subcommand)]
        command: SeriesCommand,
    },
    /// First, last or closest value of a series.
    Value(ValueArgs),
    /// Series values with metadata.
    Data(SeriesArgs),
    /// Geometry of the last value of a series.
    Geometry(SeriesArgs),
    Observations(ObservationsArgs),
    Params {
        #[command(subcommand)]
        command: ParamsCommand,
    },
    Count(CountArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    /// Load a JSON seed document.
    Seed(DbSeedArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbSeedArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SeriesCommand {
    Show(SeriesArgs),
}

#[derive(Debug, Args)]
struct SeriesArgs {
    /// `42` or `.../series/42`.
    series: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ValueMode {
    First,
    Last,
    Before,
    After,
}

impl From<ValueMode> for ValueQuery {
    fn from(mode: ValueMode) -> Self {
        match mode {
            ValueMode::First => Self::First,
            ValueMode::Last => Self::Last,
            ValueMode::Before => Self::BeforeStart,
            ValueMode::After => Self::AfterEnd,
        }
    }
}

#[derive(Debug, Args)]
struct ValueArgs {
    #[arg(value_enum)]
    mode: ValueMode,
    series: String,
}

#[derive(Debug, Args)]
struct ObservationsArgs {
    /// Restrict to one series.
    #[arg(long)]
    series: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ParamsCommand {
    List(EntityArgs),
    Exists(ExistsArgs),
    /// Requires `--param q=<term>`.
    Search(EntityArgs),
}

#[derive(Debug, Args)]
struct EntityArgs {
    #[arg(value_parser = parse_entity)]
    entity: ParameterEntity,
}

#[derive(Debug, Args)]
struct ExistsArgs {
    #[arg(value_parser = parse_entity)]
    entity: ParameterEntity,
    id: String,
}

#[derive(Debug, Args)]
struct CountArgs {
    /// Entity name, `datasets`, `stations` or a dataset type.
    target: String,
}

fn parse_entity(value: &str) -> Result<ParameterEntity, String> {
    ParameterEntity::parse(value).ok_or_else(|| format!("unknown entity: {value}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn error_category(err: &anyhow::Error) -> ErrorCategory {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<QueryError>())
        .map_or(ErrorCategory::Internal, QueryError::category)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = serde_json::json!({
                "error": format!("{err:#}"),
                "category": error_category(&err).as_str()
            });
            if let Err(emit_err) = emit_json(payload) {
                eprintln!("failed to report error: {emit_err:#} (original: {err:#})");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let spec = parse_spec(&cli.params)?;
    let config = ApiConfig::new(cli.db).with_database_crs(Crs::parse(&cli.database_crs)?);
    let api = SeriesDaoApi::new(config);
    debug!(fingerprint = %spec.fingerprint(), "parsed request parameters");

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Series { command: SeriesCommand::Show(args) } => {
            emit_json(serde_json::to_value(api.find_series(&args.series, &spec)?)?)
        }
        Command::Value(args) => run_value(&args, &api, &spec),
        Command::Data(args) => emit_json(serde_json::to_value(api.get_data(&args.series, &spec)?)?),
        Command::Geometry(args) => {
            let geometry = api.last_known_geometry(&args.series, &spec)?;
            emit_json(serde_json::json!({ "series": args.series, "geometry": geometry }))
        }
        Command::Observations(args) => run_observations(&args, &api, &spec),
        Command::Params { command } => run_params(command, &api, &spec),
        Command::Count(args) => {
            let target = CountTarget::parse(&args.target)?;
            emit_json(serde_json::to_value(api.count(&target, &spec)?)?)
        }
    }
}

fn parse_spec(params: &[String]) -> Result<QuerySpecification> {
    let pairs = params
        .iter()
        .map(|param| {
            param.split_once('=').ok_or_else(|| {
                QueryError::InvalidParameter(format!("expected key=value, got `{param}`"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QuerySpecification::from_parameters(pairs)?)
}

fn run_db(command: DbCommand, api: &SeriesDaoApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Seed(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read seed file {}", args.file.display()))?;
            let fixture: Fixture = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse seed file {}", args.file.display()))?;
            emit_json(serde_json::to_value(api.seed(&fixture)?)?)
        }
    }
}

fn run_value(args: &ValueArgs, api: &SeriesDaoApi, spec: &QuerySpecification) -> Result<()> {
    let query = ValueQuery::from(args.mode);
    let value = api.value(&args.series, query, spec)?;
    emit_json(serde_json::json!({
        "series": args.series,
        "mode": query.as_str(),
        "value": value
    }))
}

fn run_observations(args: &ObservationsArgs, api: &SeriesDaoApi, spec: &QuerySpecification) -> Result<()> {
    let observations = match &args.series {
        Some(series) => api.observations_for_series(series, spec)?,
        None => api.observations(spec)?,
    };
    emit_json(serde_json::json!({
        "query_fingerprint": spec.fingerprint(),
        "observations": observations
    }))
}

fn run_params(command: ParamsCommand, api: &SeriesDaoApi, spec: &QuerySpecification) -> Result<()> {
    match command {
        ParamsCommand::List(args) => {
            let items = api.list_parameters(args.entity, spec)?;
            emit_json(serde_json::json!({
                "entity": args.entity.as_str(),
                "query_fingerprint": spec.fingerprint(),
                "items": items
            }))
        }
        ParamsCommand::Exists(args) => {
            let exists = api.exists(args.entity, &args.id, spec)?;
            emit_json(serde_json::json!({
                "entity": args.entity.as_str(),
                "id": args.id,
                "exists": exists
            }))
        }
        ParamsCommand::Search(args) => {
            let items = api.search(args.entity, spec)?;
            emit_json(serde_json::json!({
                "entity": args.entity.as_str(),
                "query_fingerprint": spec.fingerprint(),
                "items": items
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_version_wraps_non_objects() {
        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(wrapped["payload"], serde_json::json!([1, 2]));
    }

    #[test]
    fn malformed_params_are_validation_errors() {
        let err = match parse_spec(&["timespan".to_string()]) {
            Ok(spec) => panic!("expected an error, got {spec:?}"),
            Err(err) => err,
        };
        assert_eq!(error_category(&err), ErrorCategory::Validation);
    }

    #[test]
    fn params_split_on_first_equals_sign() -> Result<()> {
        let spec = parse_spec(&["q=a=b".to_string(), "LOCALE=de".to_string()])?;
        assert_eq!(spec.search_term(), Some("a=b"));
        assert_eq!(spec.locale().map(|locale| locale.as_str()), Some("de"));
        Ok(())
    }
}
