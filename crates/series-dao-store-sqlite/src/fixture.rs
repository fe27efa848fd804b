use serde::{Deserialize, Serialize};
use series_dao_core::{Envelope, ParameterEntity};
use time::OffsetDateTime;

/// Seed document accepted by [`crate::SqliteStore::load_fixture`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Fixture {
    #[serde(default)]
    pub platforms: Vec<FlaggedFixture>,
    #[serde(default)]
    pub procedures: Vec<FlaggedFixture>,
    #[serde(default)]
    pub features: Vec<FeatureFixture>,
    #[serde(default)]
    pub offerings: Vec<ParameterFixture>,
    #[serde(default)]
    pub phenomena: Vec<ParameterFixture>,
    #[serde(default)]
    pub categories: Vec<ParameterFixture>,
    #[serde(default)]
    pub translations: Vec<TranslationFixture>,
    #[serde(default)]
    pub series: Vec<SeriesFixture>,
    #[serde(default)]
    pub observations: Vec<ObservationFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterFixture {
    pub id: i64,
    pub identifier: String,
    pub name: String,
}

/// Platform or procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlaggedFixture {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub mobile: bool,
    #[serde(default = "default_true")]
    pub insitu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureFixture {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub geometry: Option<Envelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslationFixture {
    pub entity: ParameterEntity,
    pub entity_id: i64,
    #[serde(default)]
    pub locale: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesFixture {
    pub id: i64,
    pub identifier: String,
    pub platform: i64,
    pub procedure: i64,
    pub feature: i64,
    pub offering: i64,
    pub phenomenon: i64,
    pub category: i64,
    pub dataset_type: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationFixture {
    pub id: i64,
    pub series: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub time_start: OffsetDateTime,
    /// Defaults to `time_start`.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub time_end: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub result_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_end: Option<OffsetDateTime>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub parent: bool,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub geometry: Option<Envelope>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl ObservationFixture {
    #[must_use]
    pub fn at(id: i64, series: i64, time: OffsetDateTime) -> Self {
        Self {
            id,
            series,
            time_start: time,
            time_end: None,
            result_time: None,
            valid_start: None,
            valid_end: None,
            deleted: false,
            parent: false,
            parent_id: None,
            geometry: None,
            value: Some(serde_json::json!(id)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureSummary {
    pub parameters: usize,
    pub translations: usize,
    pub series: usize,
    pub observations: usize,
}

fn default_true() -> bool {
    true
}
