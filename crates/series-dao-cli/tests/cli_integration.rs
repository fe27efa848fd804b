use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

struct TempDb {
    dir: PathBuf,
}

impl TempDb {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("series-dao-cli-{}", Ulid::new()));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
        Self { dir }
    }

    fn db(&self) -> PathBuf {
        self.dir.join("series.sqlite3")
    }

    fn db_arg(&self) -> String {
        path_str(&self.db()).to_string()
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn run_sdao<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_sdao"))
        .args(args)
        .env_remove("SERIES_DAO_DB")
        .env_remove("SERIES_DAO_DATABASE_CRS")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sdao binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sdao(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "sdao command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn run_failure<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sdao(args);
    assert!(!output.status.success(), "command unexpectedly succeeded");
    parse_stdout(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn seed_document() -> Value {
    serde_json::json!({
        "platforms": [
            {"id": 1, "identifier": "mast", "name": "Mast"},
            {"id": 2, "identifier": "glider", "name": "Glider", "mobile": true}
        ],
        "procedures": [
            {"id": 1, "identifier": "mast", "name": "Mast"},
            {"id": 2, "identifier": "glider", "name": "Glider", "mobile": true}
        ],
        "features": [
            {"id": 1, "identifier": "site", "name": "Site",
             "geometry": {"min_x": 7.0, "min_y": 51.0, "max_x": 7.0, "max_y": 51.0}},
            {"id": 2, "identifier": "transect", "name": "Transect"}
        ],
        "offerings": [{"id": 1, "identifier": "off", "name": "Offering"}],
        "phenomena": [{"id": 1, "identifier": "temp", "name": "Temperature"}],
        "categories": [{"id": 1, "identifier": "cat", "name": "Category"}],
        "translations": [
            {"entity": "phenomenon", "entity_id": 1, "locale": "de_DE", "name": "Temperatur"}
        ],
        "series": [
            {"id": 1, "identifier": "ts-1", "platform": 1, "procedure": 1, "feature": 1,
             "offering": 1, "phenomenon": 1, "category": 1, "dataset_type": "timeseries"},
            {"id": 2, "identifier": "ts-2", "platform": 2, "procedure": 2, "feature": 2,
             "offering": 1, "phenomenon": 1, "category": 1, "dataset_type": "trajectory"}
        ],
        "observations": [
            {"id": 10, "series": 1, "time_start": "2024-05-01T00:00:00Z", "value": 1.5},
            {"id": 11, "series": 1, "time_start": "2024-05-02T00:00:00Z", "value": 2.5,
             "result_time": "2024-05-02T06:00:00Z"},
            {"id": 12, "series": 1, "time_start": "2024-05-02T00:00:00Z", "value": 2.7,
             "result_time": "2024-05-02T09:00:00Z"},
            {"id": 20, "series": 2, "time_start": "2024-05-01T00:00:00Z", "value": 9.0,
             "geometry": {"min_x": 4.0, "min_y": 54.0, "max_x": 4.0, "max_y": 54.0}}
        ]
    })
}

fn seeded() -> TempDb {
    let temp = TempDb::new();
    let seed_path = temp.dir.join("seed.json");
    fs::write(&seed_path, seed_document().to_string())
        .unwrap_or_else(|err| panic!("failed to write seed file: {err}"));
    let summary = run_json(["--db", temp.db_arg().as_str(), "db", "seed", "--file", path_str(&seed_path)]);
    assert_eq!(as_i64(&summary, "observations"), 4);
    temp
}

#[test]
fn migrate_dry_run_then_apply_reports_versions() {
    let temp = TempDb::new();
    let db_arg = temp.db_arg();
    let db = db_arg.as_str();

    let planned = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&planned, "contract_version"), "cli.v1");
    assert_eq!(planned["would_apply_versions"], serde_json::json!([1]));

    let before = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);

    let applied = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(applied["up_to_date"], Value::Bool(true));

    let after = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(as_i64(&after, "current_version"), as_i64(&after, "target_version"));
}

#[test]
fn values_pick_latest_result_time_version() {
    let temp = seeded();
    let db_arg = temp.db_arg();
    let db = db_arg.as_str();

    let first = run_json(["--db", db, "value", "first", "series/1"]);
    assert_eq!(as_i64(&first["value"], "id"), 10);

    let last = run_json(["--db", db, "value", "last", "1"]);
    assert_eq!(as_str(&last, "mode"), "last");
    assert_eq!(as_i64(&last["value"], "id"), 12);

    let pinned = run_json([
        "--db",
        db,
        "value",
        "last",
        "1",
        "--param",
        "resultTime=2024-05-02T06:00:00Z",
    ]);
    assert_eq!(as_i64(&pinned["value"], "id"), 11);

    let after = run_json([
        "--db",
        db,
        "value",
        "after",
        "1",
        "--param",
        "timespan=2024-05-02T00:00:00Z/2024-05-03T00:00:00Z",
    ]);
    assert_eq!(after["value"], Value::Null);
}

#[test]
fn data_and_observations_respect_filters() {
    let temp = seeded();
    let db_arg = temp.db_arg();
    let db = db_arg.as_str();

    let data = run_json(["--db", db, "data", "2"]);
    assert_eq!(as_str(&data, "dataset_type"), "trajectory");
    assert!(data["values"][0].get("geometry").is_some());

    let window = run_json([
        "--db",
        db,
        "observations",
        "--series",
        "1",
        "--param",
        "timespan=2024-05-02T00:00:00Z/2024-05-02T00:00:00Z",
    ]);
    let ids = window["observations"]
        .as_array()
        .unwrap_or_else(|| panic!("observations should be an array: {window}"))
        .iter()
        .map(|row| as_i64(row, "id"))
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![11, 12]);
    assert!(as_str(&window, "query_fingerprint").starts_with("spec_"));

    let near_glider = run_json(["--db", db, "observations", "--param", "bbox=3.5,53.5,4.5,54.5"]);
    assert_eq!(near_glider["observations"].as_array().map(Vec::len), Some(1));
}

#[test]
fn params_and_counts() {
    let temp = seeded();
    let db_arg = temp.db_arg();
    let db = db_arg.as_str();

    let german = run_json(["--db", db, "params", "list", "phenomena", "--param", "locale=de"]);
    assert_eq!(as_str(&german["items"][0], "label"), "Temperatur");

    let exists = run_json(["--db", db, "params", "exists", "platform", "2"]);
    assert_eq!(exists["exists"], Value::Bool(true));

    let search = run_json(["--db", db, "params", "search", "features", "--param", "q=TRAN"]);
    assert_eq!(as_i64(&search["items"][0], "id"), 2);

    let platforms = run_json(["--db", db, "count", "platforms"]);
    assert_eq!(as_i64(&platforms, "count"), 2);

    let mobile_platforms = run_json(["--db", db, "count", "platforms", "--param", "platformTypes=mobile"]);
    assert_eq!(as_i64(&mobile_platforms, "count"), 1);

    let datasets = run_json(["--db", db, "count", "datasets"]);
    assert_eq!(as_i64(&datasets, "count"), 2);

    let mobile = run_json(["--db", db, "count", "datasets", "--param", "platformTypes=mobile"]);
    assert_eq!(as_i64(&mobile, "count"), 1);

    let trajectories = run_json(["--db", db, "count", "trajectory"]);
    assert_eq!(as_str(&trajectories, "target"), "trajectory");
    assert_eq!(as_i64(&trajectories, "count"), 1);
}

#[test]
fn failures_report_category_and_exit_non_zero() {
    let temp = seeded();
    let db_arg = temp.db_arg();
    let db = db_arg.as_str();

    let missing = run_failure(["--db", db, "series", "show", "99"]);
    assert_eq!(as_str(&missing, "category"), "not_found");

    let inverted = run_failure([
        "--db",
        db,
        "observations",
        "--param",
        "timespan=2024-05-03T00:00:00Z/2024-05-01T00:00:00Z",
    ]);
    assert_eq!(as_str(&inverted, "category"), "validation");

    let no_span = run_failure(["--db", db, "value", "before", "1"]);
    assert_eq!(as_str(&no_span, "category"), "validation");

    let bad_crs = run_failure(["--db", db, "--database-crs", "EPSG:9999", "series", "show", "1"]);
    assert_eq!(as_str(&bad_crs, "category"), "validation");
}

#[test]
fn database_path_falls_back_to_environment() {
    let temp = seeded();
    let output = Command::new(env!("CARGO_BIN_EXE_sdao"))
        .args(["series", "show", "ts/1"])
        .env("SERIES_DAO_DB", temp.db())
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sdao binary: {err}"));
    assert!(output.status.success());
    let series = parse_stdout(&output);
    assert_eq!(as_str(&series, "identifier"), "ts-1");
}
