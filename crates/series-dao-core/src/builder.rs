//! Translation of one filter dimension at a time into predicates anchored at a relation.

use tracing::debug;

use crate::error::QueryError;
use crate::predicate::{
    Column, CorrelatedSubquery, Entity, Join, JoinPath, ObservationField, OrderBy,
    ParameterEntity, ParameterField, Predicate, Select, SeriesField, TranslationField, Value,
};
use crate::spatial::{CoordinateTransform, Crs, Envelope};
use crate::spec::{PlatformTypeFilter, QuerySpecification};

/// Reference system of the stored geometries plus the transform used to reach it.
#[derive(Clone, Copy)]
pub struct SpatialContext<'a> {
    pub database_crs: Crs,
    pub transform: &'a dyn CoordinateTransform,
}

impl<'a> SpatialContext<'a> {
    #[must_use]
    pub fn new(database_crs: Crs, transform: &'a dyn CoordinateTransform) -> Self {
        Self { database_crs, transform }
    }
}

impl std::fmt::Debug for SpatialContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialContext").field("database_crs", &self.database_crs).finish()
    }
}

#[must_use]
pub fn timespan_predicate(spec: &QuerySpecification, column: Column) -> Option<Predicate> {
    spec.timespan().map(|timespan| Predicate::Between {
        column,
        low: Value::Instant(timespan.start()),
        high: Value::Instant(timespan.end()),
    })
}

/// Envelope of the requested bounding box in the store's reference system.
///
/// # Errors
/// Returns [`QueryError::SpatialTransform`] when either corner cannot be transformed.
pub fn spatial_envelope(
    spec: &QuerySpecification,
    context: &SpatialContext<'_>,
) -> Result<Option<Envelope>, QueryError> {
    let Some(bbox) = spec.spatial_filter() else {
        return Ok(None);
    };
    let lower_left = context.transform.transform(bbox.lower_left(), bbox.crs(), context.database_crs)?;
    let upper_right =
        context.transform.transform(bbox.upper_right(), bbox.crs(), context.database_crs)?;
    let envelope = Envelope::from_corners(lower_left, upper_right);
    debug!(
        source_crs = %bbox.crs(),
        target_crs = %context.database_crs,
        min_x = envelope.min_x,
        min_y = envelope.min_y,
        max_x = envelope.max_x,
        max_y = envelope.max_y,
        "transformed spatial filter"
    );
    Ok(Some(envelope))
}

/// # Errors
/// Returns [`QueryError::SpatialTransform`] when the bounding box cannot be transformed.
pub fn spatial_predicate(
    spec: &QuerySpecification,
    column: Column,
    context: &SpatialContext<'_>,
) -> Result<Option<Predicate>, QueryError> {
    Ok(spatial_envelope(spec, context)?.map(|envelope| Predicate::Intersects { column, envelope }))
}

/// Keeps translations whose language matches the requested locale, or rows without any
/// translation locale. Must be paired with [`Join::TranslationLeftOuter`].
#[must_use]
pub fn locale_predicate(spec: &QuerySpecification) -> Option<Predicate> {
    spec.locale().map(|locale| {
        let column = Column::Translation(TranslationField::Locale);
        Predicate::Or(vec![
            Predicate::PrimarySubtag { column, subtag: locale.primary_subtag() },
            Predicate::IsNull(column),
        ])
    })
}

/// Adds the translation join and locale predicate to a parameter select when a locale is set.
#[must_use]
pub fn with_locale(select: Select, spec: &QuerySpecification) -> Select {
    match (spec.locale(), locale_predicate(spec)) {
        (Some(locale), Some(predicate)) if matches!(select.root, Entity::Parameter(_)) => select
            .join(Join::TranslationLeftOuter { subtag: locale.primary_subtag() })
            .and(predicate),
        _ => select,
    }
}

/// `mobile = !include_stationary OR mobile = include_mobile`
#[must_use]
pub fn mobile_expression(column: Column, filter: PlatformTypeFilter) -> Predicate {
    Predicate::Or(vec![
        Predicate::equals(column, Value::Bool(!filter.include_stationary)),
        Predicate::equals(column, Value::Bool(filter.include_mobile)),
    ])
}

/// `insitu = include_insitu OR insitu = !include_remote`
#[must_use]
pub fn insitu_expression(column: Column, filter: PlatformTypeFilter) -> Predicate {
    Predicate::Or(vec![
        Predicate::equals(column, Value::Bool(filter.include_insitu)),
        Predicate::equals(column, Value::Bool(!filter.include_remote)),
    ])
}

fn platform_flags(entity: ParameterEntity, filter: PlatformTypeFilter) -> Result<Predicate, QueryError> {
    let mobile = Column::parameter(entity, ParameterField::Mobile)?;
    let insitu = Column::parameter(entity, ParameterField::Insitu)?;
    Ok(Predicate::And(vec![mobile_expression(mobile, filter), insitu_expression(insitu, filter)]))
}

/// Platform-type restriction for a query rooted at `anchor`, or `None` when every platform
/// type is included.
///
/// Platforms and procedures carry the flags themselves. Series reach them through their
/// platform, observations through their series, and the remaining metadata entities through
/// the procedures of the series referring to them.
///
/// # Errors
/// Returns [`QueryError::InvalidPath`] if a subquery cannot be anchored.
pub fn platform_type_predicate(
    spec: &QuerySpecification,
    anchor: Entity,
) -> Result<Option<Predicate>, QueryError> {
    let filter = spec.platform_types();
    if filter.includes_all() {
        return Ok(None);
    }

    let predicate = match anchor {
        Entity::Parameter(entity) if entity.has_platform_flags() => platform_flags(entity, filter)?,
        Entity::Parameter(entity) => {
            let subquery = CorrelatedSubquery::new(
                JoinPath::SeriesTo(ParameterEntity::Procedure),
                Column::Series(SeriesField::Reference(entity)),
                vec![
                    platform_flags(ParameterEntity::Procedure, filter)?,
                    Predicate::equals(Column::Series(SeriesField::Deleted), Value::Bool(false)),
                ],
            )?;
            Predicate::in_subquery(Column::parameter_id(entity), subquery)
        }
        Entity::Series => {
            let subquery = CorrelatedSubquery::new(
                JoinPath::Entity(ParameterEntity::Platform),
                Column::parameter_id(ParameterEntity::Platform),
                vec![platform_flags(ParameterEntity::Platform, filter)?],
            )?;
            Predicate::in_subquery(
                Column::Series(SeriesField::Reference(ParameterEntity::Platform)),
                subquery,
            )
        }
        Entity::Observation => {
            let subquery = CorrelatedSubquery::new(
                JoinPath::SeriesTo(ParameterEntity::Platform),
                Column::Series(SeriesField::Id),
                vec![platform_flags(ParameterEntity::Platform, filter)?],
            )?;
            Predicate::in_subquery(Column::Observation(ObservationField::SeriesId), subquery)
        }
    };
    Ok(Some(predicate))
}

/// # Errors
/// Returns [`QueryError::InvalidPath`] if a subquery cannot be anchored.
pub fn dataset_type_predicate(
    spec: &QuerySpecification,
    anchor: Entity,
) -> Result<Option<Predicate>, QueryError> {
    if spec.dataset_types().is_empty() {
        return Ok(None);
    }
    let types = Predicate::In {
        column: Column::Series(SeriesField::DatasetType),
        values: spec.dataset_types().iter().cloned().map(Value::Text).collect(),
    };

    let predicate = match anchor {
        Entity::Series => types,
        Entity::Observation => Predicate::in_subquery(
            Column::Observation(ObservationField::SeriesId),
            CorrelatedSubquery::new(JoinPath::Series, Column::Series(SeriesField::Id), vec![types])?,
        ),
        Entity::Parameter(entity) => Predicate::in_subquery(
            Column::parameter_id(entity),
            CorrelatedSubquery::new(
                JoinPath::Series,
                Column::Series(SeriesField::Reference(entity)),
                vec![types, Predicate::equals(Column::Series(SeriesField::Deleted), Value::Bool(false))],
            )?,
        ),
    };
    Ok(Some(predicate))
}

/// Always present: parent rows when the specification asks for complex parents, leaf rows
/// otherwise.
#[must_use]
pub fn parent_predicate(spec: &QuerySpecification) -> Predicate {
    Predicate::equals(Column::Observation(ObservationField::Parent), Value::Bool(spec.is_parent_only()))
}

#[must_use]
pub fn result_time_predicate(spec: &QuerySpecification) -> Option<Predicate> {
    spec.result_time().map(|result_time| {
        Predicate::equals(Column::Observation(ObservationField::ResultTime), Value::Instant(result_time))
    })
}

/// `None` for parameter entities, which have no deletion flag.
#[must_use]
pub fn not_deleted_predicate(anchor: Entity) -> Option<Predicate> {
    match anchor {
        Entity::Observation => Some(Predicate::equals(
            Column::Observation(ObservationField::Deleted),
            Value::Bool(false),
        )),
        Entity::Series => {
            Some(Predicate::equals(Column::Series(SeriesField::Deleted), Value::Bool(false)))
        }
        Entity::Parameter(_) => None,
    }
}

/// Identifier or label containing the search term.
#[must_use]
pub fn search_predicate(spec: &QuerySpecification, entity: ParameterEntity) -> Option<Predicate> {
    spec.search_term().map(|term| {
        let mut options = vec![
            Predicate::Contains { column: Column::parameter_identifier(entity), term: term.to_string() },
            Predicate::Contains { column: Column::parameter_name(entity), term: term.to_string() },
        ];
        if spec.locale().is_some() {
            options.push(Predicate::Contains {
                column: Column::Translation(TranslationField::Name),
                term: term.to_string(),
            });
        }
        Predicate::Or(options)
    })
}

/// Baseline every observation query shares: not deleted, parent flag and result time.
#[must_use]
pub fn observation_baseline(spec: &QuerySpecification, series_id: i64) -> Vec<Predicate> {
    let mut filter = vec![
        Predicate::equals(Column::Observation(ObservationField::Deleted), Value::Bool(false)),
        parent_predicate(spec),
        Predicate::equals(Column::Observation(ObservationField::SeriesId), Value::Integer(series_id)),
    ];
    filter.extend(result_time_predicate(spec));
    filter
}

/// Every filter dimension applicable to observations.
///
/// # Errors
/// Returns [`QueryError::SpatialTransform`] for bounding boxes that cannot be transformed.
pub fn observation_filters(
    spec: &QuerySpecification,
    context: &SpatialContext<'_>,
) -> Result<Vec<Predicate>, QueryError> {
    let mut filter = Vec::new();
    filter.extend(not_deleted_predicate(Entity::Observation));
    filter.push(parent_predicate(spec));
    filter.extend(result_time_predicate(spec));
    filter.extend(timespan_predicate(spec, Column::Observation(ObservationField::TimeEnd)));
    filter.extend(spatial_predicate(spec, Column::Observation(ObservationField::Geometry), context)?);
    filter.extend(platform_type_predicate(spec, Entity::Observation)?);
    filter.extend(dataset_type_predicate(spec, Entity::Observation)?);
    Ok(filter)
}

/// Observations ordered by time end, then id.
///
/// # Errors
/// See [`observation_filters`].
pub fn observation_select(
    spec: &QuerySpecification,
    series_id: Option<i64>,
    context: &SpatialContext<'_>,
) -> Result<Select, QueryError> {
    let mut select = Select::new(Entity::Observation).with_filter(observation_filters(spec, context)?);
    if let Some(series_id) = series_id {
        select = select
            .and(Predicate::equals(Column::Observation(ObservationField::SeriesId), Value::Integer(series_id)));
    }
    let select = select
        .order_by(OrderBy::asc(Column::Observation(ObservationField::TimeEnd)))
        .order_by(OrderBy::asc(Column::Observation(ObservationField::Id)));
    log_select("observations", &select);
    Ok(select)
}

/// # Errors
/// Returns [`QueryError::SpatialTransform`] for bounding boxes that cannot be transformed.
pub fn series_filters(
    spec: &QuerySpecification,
    context: &SpatialContext<'_>,
) -> Result<Vec<Predicate>, QueryError> {
    let mut filter = Vec::new();
    filter.extend(not_deleted_predicate(Entity::Series));
    filter.extend(dataset_type_predicate(spec, Entity::Series)?);
    filter.extend(platform_type_predicate(spec, Entity::Series)?);
    let geometry = Column::parameter(ParameterEntity::Feature, ParameterField::Geometry)?;
    if let Some(intersects) = spatial_predicate(spec, geometry, context)? {
        let features = CorrelatedSubquery::new(
            JoinPath::Entity(ParameterEntity::Feature),
            Column::parameter_id(ParameterEntity::Feature),
            vec![intersects],
        )?;
        filter.push(Predicate::in_subquery(
            Column::Series(SeriesField::Reference(ParameterEntity::Feature)),
            features,
        ));
    }
    Ok(filter)
}

/// # Errors
/// See [`series_filters`].
pub fn series_select(
    spec: &QuerySpecification,
    context: &SpatialContext<'_>,
) -> Result<Select, QueryError> {
    let select = Select::new(Entity::Series)
        .with_filter(series_filters(spec, context)?)
        .order_by(OrderBy::asc(Column::Series(SeriesField::Id)));
    log_select("series", &select);
    Ok(select)
}

/// Locale, platform-type, dataset-type, search and (for features) spatial restrictions.
///
/// # Errors
/// Returns [`QueryError::SpatialTransform`] for bounding boxes that cannot be transformed.
pub fn parameter_filters(
    spec: &QuerySpecification,
    entity: ParameterEntity,
    context: &SpatialContext<'_>,
) -> Result<Vec<Predicate>, QueryError> {
    let anchor = Entity::Parameter(entity);
    let mut filter = Vec::new();
    filter.extend(platform_type_predicate(spec, anchor)?);
    filter.extend(dataset_type_predicate(spec, anchor)?);
    filter.extend(search_predicate(spec, entity));
    if entity.has_geometry() {
        let geometry = Column::parameter(entity, ParameterField::Geometry)?;
        filter.extend(spatial_predicate(spec, geometry, context)?);
    }
    Ok(filter)
}

/// # Errors
/// See [`parameter_filters`].
pub fn parameter_select(
    spec: &QuerySpecification,
    entity: ParameterEntity,
    context: &SpatialContext<'_>,
) -> Result<Select, QueryError> {
    let select = Select::new(Entity::Parameter(entity))
        .with_filter(parameter_filters(spec, entity, context)?)
        .order_by(OrderBy::asc(Column::parameter_id(entity)));
    let select = with_locale(select, spec);
    log_select(entity.as_str(), &select);
    Ok(select)
}

pub(crate) fn log_select(target: &str, select: &Select) {
    debug!(
        target_entity = target,
        root = select.root.name(),
        predicates = select.filter.len(),
        joins = select.joins.len(),
        limit = ?select.limit,
        "built select"
    );
}
