use tracing::debug;

use crate::builder::{log_select, parameter_select, series_select, SpatialContext};
use crate::error::QueryError;
use crate::predicate::{
    Column, CorrelatedSubquery, JoinPath, ParameterEntity, ParameterField, Predicate, Select,
    SeriesField, Value,
};
use crate::spec::QuerySpecification;
use crate::store::StoreSession;

pub const DATASET_TYPE_TIMESERIES: &str = "timeseries";
pub const DATASET_TYPE_INDIVIDUAL_OBSERVATION: &str = "individualObservation";
pub const DATASET_TYPE_TRAJECTORY: &str = "trajectory";
pub const DATASET_TYPE_PROFILE: &str = "profile";

pub const KNOWN_DATASET_TYPES: [&str; 4] = [
    DATASET_TYPE_TIMESERIES,
    DATASET_TYPE_INDIVIDUAL_OBSERVATION,
    DATASET_TYPE_TRAJECTORY,
    DATASET_TYPE_PROFILE,
];

/// Row count of a metadata entity. Platforms are delegated to [`count_platforms`].
///
/// # Errors
/// Propagates predicate-building and store failures.
pub fn count_parameters(
    session: &dyn StoreSession,
    context: &SpatialContext<'_>,
    entity: ParameterEntity,
    spec: &QuerySpecification,
) -> Result<u64, QueryError> {
    if entity == ParameterEntity::Platform {
        return count_platforms(session, context, spec);
    }
    let count = session.count(&parameter_select(spec, entity, context)?)?;
    debug!(entity = entity.as_str(), count, "counted parameters");
    Ok(count)
}

/// Features or procedures passing the request filters that are also reachable from live series
/// whose procedure has the given mobility.
///
/// # Errors
/// Returns [`QueryError::InvalidPath`] if the subquery cannot be anchored and
/// [`QueryError::SpatialTransform`] if the bounding box cannot be transformed.
pub fn mobility_path(
    spec: &QuerySpecification,
    counted: ParameterEntity,
    mobile: bool,
    context: &SpatialContext<'_>,
) -> Result<Select, QueryError> {
    let subquery = CorrelatedSubquery::new(
        JoinPath::SeriesTo(ParameterEntity::Procedure),
        Column::Series(SeriesField::Reference(counted)),
        vec![
            Predicate::equals(
                Column::parameter(ParameterEntity::Procedure, ParameterField::Mobile)?,
                Value::Bool(mobile),
            ),
            Predicate::equals(Column::Series(SeriesField::Deleted), Value::Bool(false)),
        ],
    )?;
    Ok(parameter_select(spec, counted, context)?
        .and(Predicate::in_subquery(Column::parameter_id(counted), subquery)))
}

/// Stationary platforms are counted through their features, mobile platforms through their
/// procedures. Each path carries the same request filters as a plain count of its entity.
/// Both paths key on the single `mobile` flag of the series' procedure, so a series
/// contributes to exactly one of them and the sum does not double count.
///
/// # Errors
/// Propagates predicate-building and store failures.
pub fn count_platforms(
    session: &dyn StoreSession,
    context: &SpatialContext<'_>,
    spec: &QuerySpecification,
) -> Result<u64, QueryError> {
    let stationary_select = mobility_path(spec, ParameterEntity::Feature, false, context)?;
    let mobile_select = mobility_path(spec, ParameterEntity::Procedure, true, context)?;
    log_select("stationary platforms", &stationary_select);
    log_select("mobile platforms", &mobile_select);

    let stationary = session.count(&stationary_select)?;
    let mobile = session.count(&mobile_select)?;
    debug!(stationary, mobile, "counted platforms");
    Ok(stationary + mobile)
}

/// Live series of the requested dataset types, or of every known type when none is requested.
///
/// # Errors
/// Propagates predicate-building and store failures.
pub fn count_datasets(
    session: &dyn StoreSession,
    context: &SpatialContext<'_>,
    spec: &QuerySpecification,
) -> Result<u64, QueryError> {
    let spec = if spec.dataset_types().is_empty() {
        spec.with_dataset_types(KNOWN_DATASET_TYPES)
    } else {
        spec.clone()
    };
    let count = session.count(&series_select(&spec, context)?)?;
    debug!(dataset_types = ?spec.dataset_types(), count, "counted datasets");
    Ok(count)
}

/// # Errors
/// Propagates predicate-building and store failures.
pub fn count_dataset_type(
    session: &dyn StoreSession,
    context: &SpatialContext<'_>,
    dataset_type: &str,
    spec: &QuerySpecification,
) -> Result<u64, QueryError> {
    count_datasets(session, context, &spec.with_dataset_types([dataset_type]))
}

/// Stations are features counted with an unfiltered specification.
///
/// # Errors
/// Propagates store failures.
pub fn count_stations(session: &dyn StoreSession, context: &SpatialContext<'_>) -> Result<u64, QueryError> {
    count_parameters(session, context, ParameterEntity::Feature, &QuerySpecification::default())
}
