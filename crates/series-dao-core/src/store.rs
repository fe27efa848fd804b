use serde::Serialize;
use time::OffsetDateTime;

use crate::error::QueryError;
use crate::predicate::{
    Column, ColumnSource, ObservationField, ParameterEntity, Select, SeriesField, Value,
};
use crate::spatial::Envelope;

/// One observation as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationRow {
    pub id: i64,
    pub series_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub time_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub time_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub result_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_end: Option<OffsetDateTime>,
    pub deleted: bool,
    pub parent: bool,
    pub parent_id: Option<i64>,
    pub geometry: Option<Envelope>,
    pub value: Option<serde_json::Value>,
}

impl ColumnSource for ObservationRow {
    fn value(&self, column: Column) -> Option<Value> {
        let Column::Observation(field) = column else {
            return None;
        };
        match field {
            ObservationField::Id => Some(Value::Integer(self.id)),
            ObservationField::SeriesId => Some(Value::Integer(self.series_id)),
            ObservationField::TimeStart => Some(Value::Instant(self.time_start)),
            ObservationField::TimeEnd => Some(Value::Instant(self.time_end)),
            ObservationField::ResultTime => self.result_time.map(Value::Instant),
            ObservationField::Deleted => Some(Value::Bool(self.deleted)),
            ObservationField::Parent => Some(Value::Bool(self.parent)),
            ObservationField::Geometry => None,
        }
    }

    fn envelope(&self, column: Column) -> Option<Envelope> {
        match column {
            Column::Observation(ObservationField::Geometry) => self.geometry,
            _ => None,
        }
    }
}

/// Series metadata row with its platform's mobility resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesRow {
    pub id: i64,
    pub identifier: String,
    pub platform_id: i64,
    pub procedure_id: i64,
    pub feature_id: i64,
    pub offering_id: i64,
    pub phenomenon_id: i64,
    pub category_id: i64,
    pub dataset_type: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_value_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_value_at: Option<OffsetDateTime>,
    pub deleted: bool,
    pub platform_mobile: bool,
}

impl SeriesRow {
    #[must_use]
    pub fn reference(&self, entity: ParameterEntity) -> i64 {
        match entity {
            ParameterEntity::Platform => self.platform_id,
            ParameterEntity::Procedure => self.procedure_id,
            ParameterEntity::Feature => self.feature_id,
            ParameterEntity::Offering => self.offering_id,
            ParameterEntity::Phenomenon => self.phenomenon_id,
            ParameterEntity::Category => self.category_id,
        }
    }
}

impl ColumnSource for SeriesRow {
    fn value(&self, column: Column) -> Option<Value> {
        let Column::Series(field) = column else {
            return None;
        };
        match field {
            SeriesField::Id => Some(Value::Integer(self.id)),
            SeriesField::Reference(entity) => Some(Value::Integer(self.reference(entity))),
            SeriesField::DatasetType => Some(Value::Text(self.dataset_type.clone())),
            SeriesField::FirstValueAt => self.first_value_at.map(Value::Instant),
            SeriesField::LastValueAt => self.last_value_at.map(Value::Instant),
            SeriesField::Deleted => Some(Value::Bool(self.deleted)),
        }
    }
}

/// A metadata entity with its label resolved for the requested locale.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ParameterRow {
    pub entity: ParameterEntity,
    pub id: i64,
    pub identifier: String,
    pub label: String,
}

/// Store session executing predicate trees. Implementations own the connection for the
/// lifetime of one request.
pub trait StoreSession {
    /// # Errors
    /// Returns [`QueryError::StoreExecution`] when the store call fails.
    fn select_observations(&self, select: &Select) -> Result<Vec<ObservationRow>, QueryError>;

    /// # Errors
    /// Returns [`QueryError::StoreExecution`] when the store call fails.
    fn select_series(&self, select: &Select) -> Result<Vec<SeriesRow>, QueryError>;

    /// Rows are distinct by id; the label prefers a translation in the language of the
    /// select's translation join and falls back to the entity name.
    ///
    /// # Errors
    /// Returns [`QueryError::StoreExecution`] when the store call fails.
    fn select_parameters(&self, select: &Select) -> Result<Vec<ParameterRow>, QueryError>;

    /// Number of distinct root rows matching the select; ordering and limit are ignored.
    ///
    /// # Errors
    /// Returns [`QueryError::StoreExecution`] when the store call fails.
    fn count(&self, select: &Select) -> Result<u64, QueryError>;
}
