use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use series_dao_core::spec::primary_subtag;
use series_dao_core::{
    Entity, Envelope, ObservationRow, ParameterEntity, ParameterRow, QueryError, Select,
    SeriesRow, StoreSession,
};
use time::OffsetDateTime;
use tracing::{debug, info};

pub mod fixture;
pub mod sql;

pub use fixture::{
    FeatureFixture, Fixture, FixtureSummary, FlaggedFixture, ObservationFixture, ParameterFixture,
    SeriesFixture, TranslationFixture,
};
use sql::{instant_text, parameter_table, Projection, SqlQuery};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS platforms (
  id INTEGER PRIMARY KEY,
  identifier TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  mobile INTEGER NOT NULL CHECK (mobile IN (0,1)),
  insitu INTEGER NOT NULL CHECK (insitu IN (0,1))
);

CREATE TABLE IF NOT EXISTS procedures (
  id INTEGER PRIMARY KEY,
  identifier TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  mobile INTEGER NOT NULL CHECK (mobile IN (0,1)),
  insitu INTEGER NOT NULL CHECK (insitu IN (0,1))
);

CREATE TABLE IF NOT EXISTS features (
  id INTEGER PRIMARY KEY,
  identifier TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  min_x REAL,
  min_y REAL,
  max_x REAL,
  max_y REAL,
  CHECK (min_x IS NULL OR (min_x <= max_x AND min_y <= max_y))
);

CREATE TABLE IF NOT EXISTS offerings (
  id INTEGER PRIMARY KEY,
  identifier TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS phenomena (
  id INTEGER PRIMARY KEY,
  identifier TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
  id INTEGER PRIMARY KEY,
  identifier TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS translations (
  entity_type TEXT NOT NULL CHECK (entity_type IN ('platform','procedure','feature','offering','phenomenon','category')),
  entity_id INTEGER NOT NULL,
  locale TEXT,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS series (
  id INTEGER PRIMARY KEY,
  identifier TEXT NOT NULL UNIQUE,
  platform_id INTEGER NOT NULL REFERENCES platforms(id),
  procedure_id INTEGER NOT NULL REFERENCES procedures(id),
  feature_id INTEGER NOT NULL REFERENCES features(id),
  offering_id INTEGER NOT NULL REFERENCES offerings(id),
  phenomenon_id INTEGER NOT NULL REFERENCES phenomena(id),
  category_id INTEGER NOT NULL REFERENCES categories(id),
  dataset_type TEXT NOT NULL,
  first_value_at TEXT,
  last_value_at TEXT,
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0,1))
);

CREATE TABLE IF NOT EXISTS observations (
  id INTEGER PRIMARY KEY,
  series_id INTEGER NOT NULL REFERENCES series(id),
  time_start TEXT NOT NULL,
  time_end TEXT NOT NULL,
  result_time TEXT,
  valid_start TEXT,
  valid_end TEXT,
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0,1)),
  parent INTEGER NOT NULL DEFAULT 0 CHECK (parent IN (0,1)),
  parent_id INTEGER REFERENCES observations(id),
  min_x REAL,
  min_y REAL,
  max_x REAL,
  max_y REAL,
  value_json TEXT,
  CHECK (time_start <= time_end)
);

CREATE INDEX IF NOT EXISTS idx_translations_entity ON translations(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_series_platform ON series(platform_id);
CREATE INDEX IF NOT EXISTS idx_series_procedure ON series(procedure_id);
CREATE INDEX IF NOT EXISTS idx_series_feature ON series(feature_id);
CREATE INDEX IF NOT EXISTS idx_observations_series_start ON observations(series_id, time_start);
CREATE INDEX IF NOT EXISTS idx_observations_series_end ON observations(series_id, time_end);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

struct RawParameter {
    id: i64,
    identifier: String,
    name: String,
    locale: Option<String>,
    translated: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed series store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to begin migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
            info!(version = 1, "applied schema migration");
        }

        Ok(())
    }

    /// Insert a seed document in one transaction and recompute series bounds.
    ///
    /// # Errors
    /// Returns an error when any row violates the schema (unknown references, duplicate ids,
    /// inverted observation times).
    pub fn load_fixture(&mut self, fixture: &Fixture) -> Result<FixtureSummary> {
        let tx = self.conn.transaction().context("failed to begin fixture transaction")?;

        for (entity, rows) in [
            (ParameterEntity::Platform, &fixture.platforms),
            (ParameterEntity::Procedure, &fixture.procedures),
        ] {
            for row in rows {
                tx.execute(
                    &format!(
                        "INSERT INTO {}(id, identifier, name, mobile, insitu) VALUES (?1, ?2, ?3, ?4, ?5)",
                        parameter_table(entity)
                    ),
                    params![row.id, row.identifier, row.name, row.mobile, row.insitu],
                )
                .with_context(|| format!("failed to insert {} {}", entity.as_str(), row.identifier))?;
            }
        }

        for feature in &fixture.features {
            let geometry = feature.geometry;
            tx.execute(
                "INSERT INTO features(id, identifier, name, min_x, min_y, max_x, max_y)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    feature.id,
                    feature.identifier,
                    feature.name,
                    geometry.map(|envelope| envelope.min_x),
                    geometry.map(|envelope| envelope.min_y),
                    geometry.map(|envelope| envelope.max_x),
                    geometry.map(|envelope| envelope.max_y),
                ],
            )
            .with_context(|| format!("failed to insert feature {}", feature.identifier))?;
        }

        for (entity, rows) in [
            (ParameterEntity::Offering, &fixture.offerings),
            (ParameterEntity::Phenomenon, &fixture.phenomena),
            (ParameterEntity::Category, &fixture.categories),
        ] {
            for row in rows {
                tx.execute(
                    &format!(
                        "INSERT INTO {}(id, identifier, name) VALUES (?1, ?2, ?3)",
                        parameter_table(entity)
                    ),
                    params![row.id, row.identifier, row.name],
                )
                .with_context(|| format!("failed to insert {} {}", entity.as_str(), row.identifier))?;
            }
        }

        for translation in &fixture.translations {
            tx.execute(
                "INSERT INTO translations(entity_type, entity_id, locale, name) VALUES (?1, ?2, ?3, ?4)",
                params![
                    translation.entity.as_str(),
                    translation.entity_id,
                    translation.locale,
                    translation.name
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert translation for {} {}",
                    translation.entity.as_str(),
                    translation.entity_id
                )
            })?;
        }

        for series in &fixture.series {
            tx.execute(
                "INSERT INTO series(
                    id, identifier, platform_id, procedure_id, feature_id, offering_id,
                    phenomenon_id, category_id, dataset_type, deleted
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    series.id,
                    series.identifier,
                    series.platform,
                    series.procedure,
                    series.feature,
                    series.offering,
                    series.phenomenon,
                    series.category,
                    series.dataset_type,
                    series.deleted,
                ],
            )
            .with_context(|| format!("failed to insert series {}", series.identifier))?;
        }

        for observation in &fixture.observations {
            insert_observation(&tx, observation)?;
        }

        tx.commit().context("failed to commit fixture")?;
        self.refresh_series_bounds()?;

        let summary = FixtureSummary {
            parameters: fixture.platforms.len()
                + fixture.procedures.len()
                + fixture.features.len()
                + fixture.offerings.len()
                + fixture.phenomena.len()
                + fixture.categories.len(),
            translations: fixture.translations.len(),
            series: fixture.series.len(),
            observations: fixture.observations.len(),
        };
        info!(
            parameters = summary.parameters,
            series = summary.series,
            observations = summary.observations,
            "loaded fixture"
        );
        Ok(summary)
    }

    /// Recompute every series' first and last value time from its live observations.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn refresh_series_bounds(&mut self) -> Result<()> {
        self.conn
            .execute(
                "UPDATE series SET
                   first_value_at = (SELECT MIN(o.time_start) FROM observations o
                                     WHERE o.series_id = series.id AND o.deleted = 0),
                   last_value_at = (SELECT MAX(o.time_end) FROM observations o
                                    WHERE o.series_id = series.id AND o.deleted = 0)",
                [],
            )
            .context("failed to refresh series bounds")?;
        Ok(())
    }

    fn query_observations(&self, query: &SqlQuery) -> Result<Vec<ObservationRow>> {
        let mut stmt = self
            .conn
            .prepare(&query.sql)
            .with_context(|| format!("failed to prepare observation query: {}", query.sql))?;
        let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            observations.push(observation_from_row(row)?);
        }
        Ok(observations)
    }

    fn query_series(&self, query: &SqlQuery) -> Result<Vec<SeriesRow>> {
        let mut stmt = self
            .conn
            .prepare(&query.sql)
            .with_context(|| format!("failed to prepare series query: {}", query.sql))?;
        let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
        let mut series = Vec::new();
        while let Some(row) = rows.next()? {
            series.push(series_from_row(row)?);
        }
        Ok(series)
    }

    fn query_parameters(&self, query: &SqlQuery) -> Result<Vec<RawParameter>> {
        let mut stmt = self
            .conn
            .prepare(&query.sql)
            .with_context(|| format!("failed to prepare parameter query: {}", query.sql))?;
        let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
        let mut parameters = Vec::new();
        while let Some(row) = rows.next()? {
            parameters.push(RawParameter {
                id: row.get(0)?,
                identifier: row.get(1)?,
                name: row.get(2)?,
                locale: row.get(3)?,
                translated: row.get(4)?,
            });
        }
        Ok(parameters)
    }

    fn query_count(&self, query: &SqlQuery) -> Result<u64> {
        let count = self
            .conn
            .query_row(&query.sql, params_from_iter(query.params.iter()), |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run count query: {}", query.sql))?;
        u64::try_from(count).context("count query returned a negative value")
    }
}

impl StoreSession for SqliteStore {
    fn select_observations(&self, select: &Select) -> Result<Vec<ObservationRow>, QueryError> {
        let query = sql::render(select, Projection::Rows)?;
        debug!(sql = %query.sql, params = query.params.len(), "select observations");
        self.query_observations(&query).map_err(store_error)
    }

    fn select_series(&self, select: &Select) -> Result<Vec<SeriesRow>, QueryError> {
        let query = sql::render(select, Projection::Rows)?;
        debug!(sql = %query.sql, params = query.params.len(), "select series");
        self.query_series(&query).map_err(store_error)
    }

    fn select_parameters(&self, select: &Select) -> Result<Vec<ParameterRow>, QueryError> {
        let Entity::Parameter(entity) = select.root else {
            return Err(QueryError::InvalidPath(format!(
                "{} is not a parameter entity",
                select.root.name()
            )));
        };
        let query = sql::render(select, Projection::Rows)?;
        debug!(sql = %query.sql, params = query.params.len(), "select parameters");
        let raw = self.query_parameters(&query).map_err(store_error)?;
        Ok(resolve_labels(entity, raw, select.translation_subtag(), select.limit))
    }

    fn count(&self, select: &Select) -> Result<u64, QueryError> {
        let query = sql::render(select, Projection::Count)?;
        debug!(sql = %query.sql, params = query.params.len(), "count");
        self.query_count(&query).map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> QueryError {
    QueryError::StoreExecution(format!("{err:#}"))
}

/// Collapses joined translation rows to one row per entity. Label preference: translation in
/// the requested language, then a translation without locale, then the entity name.
fn resolve_labels(
    entity: ParameterEntity,
    raw: Vec<RawParameter>,
    subtag: Option<&str>,
    limit: Option<u32>,
) -> Vec<ParameterRow> {
    let mut positions: BTreeMap<i64, usize> = BTreeMap::new();
    let mut resolved: Vec<(ParameterRow, u8)> = Vec::new();

    for row in raw {
        let rank = match (&row.translated, &row.locale) {
            (Some(_), Some(locale)) if subtag.is_some_and(|subtag| primary_subtag(locale) == subtag) => 2,
            (Some(_), None) => 1,
            _ => 0,
        };
        let label = match (rank, &row.translated) {
            (1 | 2, Some(translated)) => translated.clone(),
            _ => row.name.clone(),
        };

        if let Some(&position) = positions.get(&row.id) {
            let existing = &mut resolved[position];
            if rank > existing.1 {
                existing.0.label = label;
                existing.1 = rank;
            }
            continue;
        }
        positions.insert(row.id, resolved.len());
        resolved.push((ParameterRow { entity, id: row.id, identifier: row.identifier, label }, rank));
    }

    let rows = resolved.into_iter().map(|(row, _)| row);
    match limit {
        Some(limit) => rows.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect(),
        None => rows.collect(),
    }
}

fn insert_observation(tx: &rusqlite::Transaction<'_>, observation: &ObservationFixture) -> Result<()> {
    let time_end = observation.time_end.unwrap_or(observation.time_start);
    let geometry = observation.geometry;
    let value_json = observation
        .value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize observation value")?;
    tx.execute(
        "INSERT INTO observations(
            id, series_id, time_start, time_end, result_time, valid_start, valid_end,
            deleted, parent, parent_id, min_x, min_y, max_x, max_y, value_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            observation.id,
            observation.series,
            instant_text(observation.time_start)?,
            instant_text(time_end)?,
            observation.result_time.map(instant_text).transpose()?,
            observation.valid_start.map(instant_text).transpose()?,
            observation.valid_end.map(instant_text).transpose()?,
            observation.deleted,
            observation.parent,
            observation.parent_id,
            geometry.map(|envelope| envelope.min_x),
            geometry.map(|envelope| envelope.min_y),
            geometry.map(|envelope| envelope.max_x),
            geometry.map(|envelope| envelope.max_y),
            value_json,
        ],
    )
    .with_context(|| format!("failed to insert observation {}", observation.id))?;
    Ok(())
}

fn observation_from_row(row: &Row<'_>) -> Result<ObservationRow> {
    let value_json: Option<String> = row.get(14)?;
    Ok(ObservationRow {
        id: row.get(0)?,
        series_id: row.get(1)?,
        time_start: parse_rfc3339(&row.get::<_, String>(2)?)?,
        time_end: parse_rfc3339(&row.get::<_, String>(3)?)?,
        result_time: parse_optional_rfc3339(row.get(4)?)?,
        valid_start: parse_optional_rfc3339(row.get(5)?)?,
        valid_end: parse_optional_rfc3339(row.get(6)?)?,
        deleted: row.get::<_, i64>(7)? != 0,
        parent: row.get::<_, i64>(8)? != 0,
        parent_id: row.get(9)?,
        geometry: envelope_from(row.get(10)?, row.get(11)?, row.get(12)?, row.get(13)?),
        value: value_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("failed to decode observation value")?,
    })
}

fn series_from_row(row: &Row<'_>) -> Result<SeriesRow> {
    Ok(SeriesRow {
        id: row.get(0)?,
        identifier: row.get(1)?,
        platform_id: row.get(2)?,
        procedure_id: row.get(3)?,
        feature_id: row.get(4)?,
        offering_id: row.get(5)?,
        phenomenon_id: row.get(6)?,
        category_id: row.get(7)?,
        dataset_type: row.get(8)?,
        first_value_at: parse_optional_rfc3339(row.get(9)?)?,
        last_value_at: parse_optional_rfc3339(row.get(10)?)?,
        deleted: row.get::<_, i64>(11)? != 0,
        platform_mobile: row.get::<_, i64>(12)? != 0,
    })
}

fn envelope_from(
    min_x: Option<f64>,
    min_y: Option<f64>,
    max_x: Option<f64>,
    max_y: Option<f64>,
) -> Option<Envelope> {
    Some(Envelope { min_x: min_x?, min_y: min_y?, max_x: max_x?, max_y: max_y? })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = instant_text(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.as_deref().map(parse_rfc3339).transpose()
}
