use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use series_dao_core::builder::{observation_select, parameter_select};
use series_dao_core::counting::{
    count_dataset_type, count_datasets, count_parameters, count_stations, KNOWN_DATASET_TYPES,
};
use series_dao_core::temporal::{
    closest_value_after_end, closest_value_before_start, find_series, observation_spec, parse_id,
    resolve,
};
use series_dao_core::{
    Column, Crs, Envelope, EpsgTransform, ObservationRow, ParameterEntity, ParameterRow,
    Predicate, QueryError, QuerySpecification, RetrievalMode, SeriesRow, SpatialContext,
    StoreSession, Value,
};
use series_dao_store_sqlite::{Fixture, FixtureSummary, SchemaStatus, SqliteStore};
use time::OffsetDateTime;
use tracing::{debug, info_span, Span};
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub db_path: PathBuf,
    /// Reference system the store keeps geometries in.
    pub database_crs: Crs,
}

impl ApiConfig {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, database_crs: Crs::default() }
    }

    #[must_use]
    pub fn with_database_crs(mut self, database_crs: Crs) -> Self {
        self.database_crs = database_crs;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// One observation as handed to collaborators.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataValue {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Set only for interval observations.
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub time_start: Option<OffsetDateTime>,
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub result_time: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_time: Option<ValidTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Envelope>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidTime {
    #[serde(with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

impl DataValue {
    fn bare(row: &ObservationRow) -> Self {
        Self {
            id: row.id,
            timestamp: row.time_end,
            time_start: (row.time_start != row.time_end).then_some(row.time_start),
            value: row.value.clone(),
            result_time: None,
            valid_time: None,
            geometry: None,
        }
    }

    /// Result time always; valid time and geometry when expanded, otherwise geometry only for
    /// mobile platforms.
    fn with_metadata(row: &ObservationRow, series: &SeriesRow, spec: &QuerySpecification) -> Self {
        let mut value = Self::bare(row);
        value.result_time = row.result_time;
        if spec.is_expanded() {
            if row.valid_start.is_some() || row.valid_end.is_some() {
                value.valid_time = Some(ValidTime { start: row.valid_start, end: row.valid_end });
            }
            value.geometry = row.geometry;
        } else if series.platform_mobile {
            value.geometry = row.geometry;
        }
        value
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesData {
    pub series_id: i64,
    pub identifier: String,
    pub dataset_type: String,
    pub values: Vec<DataValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValueQuery {
    First,
    Last,
    BeforeStart,
    AfterEnd,
}

impl ValueQuery {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
            Self::BeforeStart => "before_start",
            Self::AfterEnd => "after_end",
        }
    }
}

/// What `count` counts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CountTarget {
    Parameter(ParameterEntity),
    Datasets,
    DatasetType(String),
    Stations,
}

impl CountTarget {
    /// Accepts parameter entity names, `datasets`, `stations` and the known dataset types.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] for anything else.
    pub fn parse(value: &str) -> Result<Self, QueryError> {
        let trimmed = value.trim();
        if let Some(entity) = ParameterEntity::parse(trimmed) {
            return Ok(Self::Parameter(entity));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "datasets" | "dataset" => return Ok(Self::Datasets),
            "stations" | "station" => return Ok(Self::Stations),
            _ => {}
        }
        KNOWN_DATASET_TYPES
            .iter()
            .find(|known| known.eq_ignore_ascii_case(trimmed))
            .map(|known| Self::DatasetType((*known).to_string()))
            .ok_or_else(|| QueryError::InvalidParameter(format!("unknown count target: {value}")))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CountResult {
    pub target: String,
    pub count: u64,
}

/// One store connection bound to a single facade call. Released on drop, whichever way the
/// call exits.
struct ScopedSession {
    store: SqliteStore,
    span: Span,
}

impl ScopedSession {
    fn acquire(store: SqliteStore, operation: &'static str) -> Self {
        let session_id = Ulid::new();
        let span = info_span!("session", %session_id, operation);
        span.in_scope(|| debug!("acquired session"));
        Self { store, span }
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        self.span.in_scope(|| debug!("released session"));
    }
}

#[derive(Debug, Clone)]
pub struct SeriesDaoApi {
    config: ApiConfig,
    transform: EpsgTransform,
}

impl SeriesDaoApi {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self { config, transform: EpsgTransform::default() }
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.config.db_path)
    }

    fn with_session<T>(
        &self,
        operation: &'static str,
        run: impl FnOnce(&dyn StoreSession, &SpatialContext<'_>) -> Result<T, QueryError>,
    ) -> Result<T> {
        let session = ScopedSession::acquire(self.open_store()?, operation);
        let _entered = session.span.enter();
        let context = SpatialContext::new(self.config.database_crs, &self.transform);
        Ok(run(&session.store, &context)?)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Migrate, then load a seed document.
    ///
    /// # Errors
    /// Returns an error when migration or any insert fails; nothing is written in that case.
    pub fn seed(&self, fixture: &Fixture) -> Result<FixtureSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.load_fixture(fixture)
    }

    /// # Errors
    /// Returns [`QueryError::SeriesNotFound`] (wrapped) when no live series matches.
    pub fn find_series(&self, identifier: &str, spec: &QuerySpecification) -> Result<SeriesRow> {
        self.with_session("find_series", |session, context| {
            find_series(session, context, identifier, spec)
        })
    }

    /// First, last or closest value of a series, without observation metadata.
    ///
    /// # Errors
    /// Returns an error when the series is unknown, the before/after modes lack a time span,
    /// or the store fails.
    pub fn value(
        &self,
        identifier: &str,
        query: ValueQuery,
        spec: &QuerySpecification,
    ) -> Result<Option<DataValue>> {
        self.with_session(query.as_str(), |session, context| {
            let series = find_series(session, context, identifier, spec)?;
            let row = match query {
                ValueQuery::First => resolve(session, &series, RetrievalMode::First, spec)?,
                ValueQuery::Last => resolve(session, &series, RetrievalMode::Last, spec)?,
                ValueQuery::BeforeStart => closest_value_before_start(session, &series, spec)?,
                ValueQuery::AfterEnd => closest_value_after_end(session, &series, spec)?,
            };
            Ok(row.as_ref().map(DataValue::bare))
        })
    }

    /// Geometry of the last value of a series.
    ///
    /// # Errors
    /// Returns an error when the series is unknown or the store fails.
    pub fn last_known_geometry(
        &self,
        identifier: &str,
        spec: &QuerySpecification,
    ) -> Result<Option<Envelope>> {
        self.with_session("last_known_geometry", |session, context| {
            let series = find_series(session, context, identifier, spec)?;
            let last = resolve(session, &series, RetrievalMode::Last, spec)?;
            Ok(last.and_then(|row| row.geometry))
        })
    }

    /// Observations of one series ordered by time end, then id.
    ///
    /// # Errors
    /// Returns an error when the series is unknown or the store fails.
    pub fn observations_for_series(
        &self,
        identifier: &str,
        spec: &QuerySpecification,
    ) -> Result<Vec<ObservationRow>> {
        self.with_session("observations_for_series", |session, context| {
            let series = find_series(session, context, identifier, spec)?;
            let spec = observation_spec(&series, spec);
            session.select_observations(&observation_select(&spec, Some(series.id), context)?)
        })
    }

    /// Observations across every series.
    ///
    /// # Errors
    /// Returns an error when the bounding box cannot be transformed or the store fails.
    pub fn observations(&self, spec: &QuerySpecification) -> Result<Vec<ObservationRow>> {
        self.with_session("observations", |session, context| {
            session.select_observations(&observation_select(spec, None, context)?)
        })
    }

    /// Series values with metadata attached according to the expanded flag.
    ///
    /// # Errors
    /// Returns an error when the series is unknown or the store fails.
    pub fn get_data(&self, identifier: &str, spec: &QuerySpecification) -> Result<SeriesData> {
        self.with_session("get_data", |session, context| {
            let series = find_series(session, context, identifier, spec)?;
            let observation_spec = observation_spec(&series, spec);
            let rows = session
                .select_observations(&observation_select(&observation_spec, Some(series.id), context)?)?;
            let values = rows
                .iter()
                .map(|row| DataValue::with_metadata(row, &series, spec))
                .collect();
            Ok(SeriesData {
                series_id: series.id,
                identifier: series.identifier,
                dataset_type: series.dataset_type,
                values,
            })
        })
    }

    /// Rows of a metadata entity with labels resolved for the requested locale.
    ///
    /// # Errors
    /// Returns an error when the bounding box cannot be transformed or the store fails.
    pub fn list_parameters(
        &self,
        entity: ParameterEntity,
        spec: &QuerySpecification,
    ) -> Result<Vec<ParameterRow>> {
        self.with_session("list_parameters", |session, context| {
            session.select_parameters(&parameter_select(spec, entity, context)?)
        })
    }

    /// Whether a metadata row with the given identifier passes the specification's filters.
    /// Unparsable identifiers do not exist.
    ///
    /// # Errors
    /// Returns an error when the store fails.
    pub fn exists(
        &self,
        entity: ParameterEntity,
        identifier: &str,
        spec: &QuerySpecification,
    ) -> Result<bool> {
        let Some(id) = parse_id(identifier) else {
            return Ok(false);
        };
        self.with_session("exists", |session, context| {
            let select = parameter_select(spec, entity, context)?
                .and(Predicate::equals(Column::parameter_id(entity), Value::Integer(id)));
            Ok(session.count(&select)? > 0)
        })
    }

    /// Metadata rows whose identifier or label contains the `q` term.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] (wrapped) without a search term.
    pub fn search(
        &self,
        entity: ParameterEntity,
        spec: &QuerySpecification,
    ) -> Result<Vec<ParameterRow>> {
        if spec.search_term().is_none() {
            return Err(QueryError::InvalidParameter("search needs a q parameter".to_string()).into());
        }
        self.list_parameters(entity, spec)
    }

    /// # Errors
    /// Returns an error when the bounding box cannot be transformed or the store fails.
    pub fn count(&self, target: &CountTarget, spec: &QuerySpecification) -> Result<CountResult> {
        self.with_session("count", |session, context| {
            let (label, count) = match target {
                CountTarget::Parameter(entity) => {
                    (entity.as_str().to_string(), count_parameters(session, context, *entity, spec)?)
                }
                CountTarget::Datasets => ("datasets".to_string(), count_datasets(session, context, spec)?),
                CountTarget::DatasetType(dataset_type) => (
                    dataset_type.clone(),
                    count_dataset_type(session, context, dataset_type, spec)?,
                ),
                CountTarget::Stations => ("stations".to_string(), count_stations(session, context)?),
            };
            Ok(CountResult { target: label, count })
        })
    }
}

#[cfg(test)]
mod tests {
    use series_dao_core::Point;
    use series_dao_store_sqlite::{
        FeatureFixture, FlaggedFixture, ObservationFixture, ParameterFixture, SeriesFixture,
        TranslationFixture,
    };
    use time::macros::datetime;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("series-dao-api-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &std::path::Path) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("sqlite3-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("sqlite3-shm"));
    }

    fn spec(parameters: &[(&str, &str)]) -> Result<QuerySpecification> {
        Ok(QuerySpecification::from_parameters(parameters.iter().copied())?)
    }

    /// A fixed station and a ship, one phenomenon each.
    fn fixture() -> Fixture {
        let stations = vec![
            FlaggedFixture {
                id: 1,
                identifier: "mast".to_string(),
                name: "Weather mast".to_string(),
                mobile: false,
                insitu: true,
            },
            FlaggedFixture {
                id: 2,
                identifier: "ship".to_string(),
                name: "Research vessel".to_string(),
                mobile: true,
                insitu: true,
            },
        ];
        let mut first = ObservationFixture::at(11, 1, datetime!(2024-03-01 00:00 UTC));
        first.result_time = Some(datetime!(2024-03-01 01:00 UTC));
        first.valid_start = Some(datetime!(2024-03-01 00:00 UTC));
        first.geometry = Some(Envelope::from_point(Point::new(7.0, 51.0)));
        let second = ObservationFixture::at(12, 1, datetime!(2024-03-02 00:00 UTC));
        let mut track = ObservationFixture::at(21, 2, datetime!(2024-03-01 12:00 UTC));
        track.geometry = Some(Envelope::from_point(Point::new(4.0, 54.0)));

        Fixture {
            platforms: stations.clone(),
            procedures: stations,
            features: vec![
                FeatureFixture {
                    id: 1,
                    identifier: "mast-site".to_string(),
                    name: "Mast site".to_string(),
                    geometry: Some(Envelope::from_point(Point::new(7.0, 51.0))),
                },
                FeatureFixture {
                    id: 2,
                    identifier: "cruise".to_string(),
                    name: "Cruise".to_string(),
                    geometry: None,
                },
            ],
            offerings: vec![ParameterFixture {
                id: 1,
                identifier: "offering".to_string(),
                name: "Offering".to_string(),
            }],
            phenomena: vec![ParameterFixture {
                id: 1,
                identifier: "temp".to_string(),
                name: "Temperature".to_string(),
            }],
            categories: vec![ParameterFixture {
                id: 1,
                identifier: "category".to_string(),
                name: "Category".to_string(),
            }],
            translations: vec![TranslationFixture {
                entity: ParameterEntity::Phenomenon,
                entity_id: 1,
                locale: Some("de".to_string()),
                name: "Temperatur".to_string(),
            }],
            series: [(1, "timeseries"), (2, "trajectory")]
                .into_iter()
                .map(|(id, dataset_type)| SeriesFixture {
                    id,
                    identifier: format!("series-{id}"),
                    platform: id,
                    procedure: id,
                    feature: id,
                    offering: 1,
                    phenomenon: 1,
                    category: 1,
                    dataset_type: dataset_type.to_string(),
                    deleted: false,
                })
                .collect(),
            observations: vec![first, second, track],
        }
    }

    fn seeded_api() -> Result<(SeriesDaoApi, PathBuf)> {
        let db_path = unique_temp_db_path();
        let api = SeriesDaoApi::new(ApiConfig::new(db_path.clone()));
        let summary = api.seed(&fixture())?;
        assert_eq!(summary.observations, 3);
        Ok((api, db_path))
    }

    #[test]
    fn migrate_dry_run_reports_pending_versions_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = SeriesDaoApi::new(ApiConfig::new(db_path.clone()));

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn first_last_and_window_values() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        let default = QuerySpecification::default();

        let first = api.value("series/1", ValueQuery::First, &default)?;
        assert_eq!(first.map(|value| value.id), Some(11));
        let last = api.value("1", ValueQuery::Last, &default)?;
        assert_eq!(last.as_ref().map(|value| value.id), Some(12));
        assert_eq!(last.and_then(|value| value.result_time), None);

        let window = spec(&[("timespan", "2024-03-01T12:00:00Z/2024-03-01T18:00:00Z")])?;
        let before = api.value("1", ValueQuery::BeforeStart, &window)?;
        assert_eq!(before.map(|value| value.id), Some(11));
        let after = api.value("1", ValueQuery::AfterEnd, &window)?;
        assert_eq!(after.map(|value| value.id), Some(12));

        let missing_span = api.value("1", ValueQuery::BeforeStart, &default);
        let category = missing_span
            .err()
            .and_then(|err| err.downcast_ref::<QueryError>().map(QueryError::category));
        assert_eq!(category, Some(series_dao_core::ErrorCategory::Validation));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn unknown_series_is_not_found() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        let err = match api.find_series("series/99", &QuerySpecification::default()) {
            Ok(series) => panic!("expected not found, got {series:?}"),
            Err(err) => err,
        };
        assert!(matches!(err.downcast_ref::<QueryError>(), Some(QueryError::SeriesNotFound(_))));

        let garbage = api.find_series("not-a-number", &QuerySpecification::default());
        assert!(garbage.is_err());
        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn get_data_attaches_metadata_by_expansion_and_mobility() -> Result<()> {
        let (api, db_path) = seeded_api()?;

        let condensed = api.get_data("1", &QuerySpecification::default())?;
        assert_eq!(condensed.values.len(), 2);
        assert_eq!(condensed.values[0].result_time, Some(datetime!(2024-03-01 01:00 UTC)));
        assert!(condensed.values[0].geometry.is_none());
        assert!(condensed.values[0].valid_time.is_none());

        let expanded = api.get_data("1", &spec(&[("expanded", "true")])?)?;
        assert!(expanded.values[0].geometry.is_some());
        assert!(expanded.values[0].valid_time.is_some());

        let mobile = api.get_data("2", &QuerySpecification::default())?;
        assert!(mobile.values[0].geometry.is_some());

        let bbox_ignored_on_series = api.get_data("1", &spec(&[("bbox", "0,0,1,1")])?)?;
        assert!(bbox_ignored_on_series.values.is_empty());

        assert_eq!(
            api.last_known_geometry("2", &QuerySpecification::default())?,
            Some(Envelope::from_point(Point::new(4.0, 54.0)))
        );
        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn parameters_list_exist_search_and_count() -> Result<()> {
        let (api, db_path) = seeded_api()?;

        let german = api.list_parameters(ParameterEntity::Phenomenon, &spec(&[("locale", "de-AT")])?)?;
        assert_eq!(german[0].label, "Temperatur");

        assert!(api.exists(ParameterEntity::Platform, "platforms/2", &QuerySpecification::default())?);
        assert!(!api.exists(ParameterEntity::Platform, "7", &QuerySpecification::default())?);
        assert!(!api.exists(ParameterEntity::Platform, "x", &QuerySpecification::default())?);

        let found = api.search(ParameterEntity::Feature, &spec(&[("q", "cruise")])?)?;
        assert_eq!(found.iter().map(|row| row.id).collect::<Vec<_>>(), vec![2]);
        assert!(api.search(ParameterEntity::Feature, &QuerySpecification::default()).is_err());

        let default = QuerySpecification::default();
        assert_eq!(api.count(&CountTarget::parse("platforms")?, &default)?.count, 2);
        assert_eq!(api.count(&CountTarget::Datasets, &default)?.count, 2);
        assert_eq!(api.count(&CountTarget::parse("trajectory")?, &default)?.count, 1);
        assert_eq!(api.count(&CountTarget::Stations, &default)?.count, 2);
        assert!(CountTarget::parse("rivers").is_err());

        cleanup(&db_path);
        Ok(())
    }
}
