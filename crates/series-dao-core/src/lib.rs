//! Query specification, predicate composition and temporal resolution for a store of
//! environmental observation series.

pub mod builder;
pub mod counting;
pub mod error;
pub mod predicate;
pub mod spatial;
pub mod spec;
pub mod store;
pub mod temporal;

pub use builder::SpatialContext;
pub use error::{ErrorCategory, QueryError};
pub use predicate::{
    Column, CompareOp, CorrelatedSubquery, Direction, Entity, Join, JoinPath, ObservationField,
    OrderBy, ParameterColumn, ParameterEntity, ParameterField, Predicate, Select, SeriesField,
    TranslationField, Value,
};
pub use spatial::{CoordinateTransform, Crs, Envelope, EpsgTransform, Point};
pub use spec::{BoundingBox, Locale, PlatformTypeFilter, QuerySpecification, TimeSpan};
pub use store::{ObservationRow, ParameterRow, SeriesRow, StoreSession};
pub use temporal::RetrievalMode;
