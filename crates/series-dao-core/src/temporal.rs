//! First, last and closest-value resolution over the observations of one series.

use std::cmp::Ordering;

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::builder::{log_select, observation_baseline, series_select, SpatialContext};
use crate::error::QueryError;
use crate::predicate::{
    Column, CompareOp, Entity, ObservationField, OrderBy, Predicate, Select, SeriesField, Value,
};
use crate::spec::{format_instant, QuerySpecification};
use crate::store::{ObservationRow, SeriesRow, StoreSession};

/// Dataset types whose observations are containers of child values.
pub const COMPLEX_DATASET_TYPES: [&str; 1] = ["profile"];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetrievalMode {
    First,
    Last,
    /// Latest observation ending strictly before the instant.
    ClosestBefore(OffsetDateTime),
    /// Earliest observation starting strictly after the instant.
    ClosestAfter(OffsetDateTime),
}

impl RetrievalMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
            Self::ClosestBefore(_) => "closest_before",
            Self::ClosestAfter(_) => "closest_after",
        }
    }

    /// Column all candidates must share with the anchor row.
    #[must_use]
    pub fn anchor_column(self) -> Column {
        match self {
            Self::First | Self::ClosestAfter(_) => Column::Observation(ObservationField::TimeStart),
            Self::Last | Self::ClosestBefore(_) => Column::Observation(ObservationField::TimeEnd),
        }
    }
}

/// Parses `42` or `.../series/42`. Anything else resolves to nothing.
#[must_use]
pub fn parse_id(identifier: &str) -> Option<i64> {
    identifier.trim().trim_end_matches('/').rsplit('/').next()?.trim().parse().ok()
}

#[must_use]
pub fn is_complex_dataset_type(dataset_type: &str) -> bool {
    COMPLEX_DATASET_TYPES.iter().any(|complex| complex.eq_ignore_ascii_case(dataset_type))
}

/// Specification to use for the observations of `series`: complex series switch to parent rows.
#[must_use]
pub fn observation_spec(series: &SeriesRow, spec: &QuerySpecification) -> QuerySpecification {
    if is_complex_dataset_type(&series.dataset_type) {
        spec.with_complex_parent(true)
    } else {
        spec.clone()
    }
}

/// Looks up a live series; spatial and time filters are stripped because they target
/// observations, not the series itself.
///
/// # Errors
/// Returns [`QueryError::SeriesNotFound`] when the identifier does not resolve, and propagates
/// store failures.
pub fn find_series(
    session: &dyn StoreSession,
    context: &SpatialContext<'_>,
    identifier: &str,
    spec: &QuerySpecification,
) -> Result<SeriesRow, QueryError> {
    let Some(id) = parse_id(identifier) else {
        return Err(QueryError::SeriesNotFound(identifier.to_string()));
    };
    let select = series_select(&spec.without_spatial_and_time_filters(), context)?
        .and(Predicate::equals(Column::Series(SeriesField::Id), Value::Integer(id)))
        .limit(1);
    session
        .select_series(&select)?
        .into_iter()
        .next()
        .ok_or_else(|| QueryError::SeriesNotFound(identifier.to_string()))
}

/// Query locating the anchor row when the series carries no precomputed bound, or for the
/// closest modes.
#[must_use]
pub fn anchor_probe(series: &SeriesRow, mode: RetrievalMode, spec: &QuerySpecification) -> Select {
    let id = Column::Observation(ObservationField::Id);
    let select = Select::new(Entity::Observation)
        .with_filter(observation_baseline(spec, series.id));
    let select = match mode {
        RetrievalMode::First => select.order_by(OrderBy::asc(mode.anchor_column())),
        RetrievalMode::Last => select.order_by(OrderBy::desc(mode.anchor_column())),
        RetrievalMode::ClosestBefore(instant) => select
            .and(Predicate::compare(mode.anchor_column(), CompareOp::Lt, Value::Instant(instant)))
            .order_by(OrderBy::desc(mode.anchor_column())),
        RetrievalMode::ClosestAfter(instant) => select
            .and(Predicate::compare(mode.anchor_column(), CompareOp::Gt, Value::Instant(instant)))
            .order_by(OrderBy::asc(mode.anchor_column())),
    };
    select.order_by(OrderBy::asc(id)).limit(1)
}

/// All rows of the series sharing the anchor timestamp, ascending by anchor then id.
#[must_use]
pub fn candidates_at(
    series: &SeriesRow,
    mode: RetrievalMode,
    anchor: OffsetDateTime,
    spec: &QuerySpecification,
) -> Select {
    Select::new(Entity::Observation)
        .with_filter(observation_baseline(spec, series.id))
        .and(Predicate::equals(mode.anchor_column(), Value::Instant(anchor)))
        .order_by(OrderBy::asc(mode.anchor_column()))
        .order_by(OrderBy::asc(Column::Observation(ObservationField::Id)))
}

fn series_bound(series: &SeriesRow, mode: RetrievalMode) -> Option<OffsetDateTime> {
    match mode {
        RetrievalMode::First => series.first_value_at,
        RetrievalMode::Last => series.last_value_at,
        RetrievalMode::ClosestBefore(_) | RetrievalMode::ClosestAfter(_) => None,
    }
}

fn anchor_of(row: &ObservationRow, mode: RetrievalMode) -> OffsetDateTime {
    match mode {
        RetrievalMode::First | RetrievalMode::ClosestAfter(_) => row.time_start,
        RetrievalMode::Last | RetrievalMode::ClosestBefore(_) => row.time_end,
    }
}

/// Newest result time wins; a missing result time is older than any present one; remaining
/// ties go to the lowest id.
#[must_use]
pub fn select_latest_result_time(candidates: Vec<ObservationRow>) -> Option<ObservationRow> {
    candidates.into_iter().min_by(compare_versions)
}

fn compare_versions(left: &ObservationRow, right: &ObservationRow) -> Ordering {
    // Reversed so that `min_by` picks the newest result time.
    right.result_time.cmp(&left.result_time).then_with(|| left.id.cmp(&right.id))
}

/// Resolves one observation of `series` for `mode`. An empty result is `Ok(None)`.
///
/// # Errors
/// Returns [`QueryError::DataIntegrity`] when a result-time filter still matches several rows,
/// and propagates store failures.
pub fn resolve(
    session: &dyn StoreSession,
    series: &SeriesRow,
    mode: RetrievalMode,
    spec: &QuerySpecification,
) -> Result<Option<ObservationRow>, QueryError> {
    let spec = observation_spec(series, spec);

    let anchor = match series_bound(series, mode) {
        Some(bound) => bound,
        None => {
            let probe = anchor_probe(series, mode, &spec);
            log_select(mode.as_str(), &probe);
            match session.select_observations(&probe)?.first() {
                Some(row) => anchor_of(row, mode),
                None => {
                    debug!(series_id = series.id, mode = mode.as_str(), "no value in range");
                    return Ok(None);
                }
            }
        }
    };

    let select = candidates_at(series, mode, anchor, &spec);
    log_select(mode.as_str(), &select);
    let candidates = session.select_observations(&select)?;

    if let Some(result_time) = spec.result_time() {
        if candidates.len() > 1 {
            return Err(QueryError::DataIntegrity(format!(
                "series {} has {} observations at {} for result time {}",
                series.id,
                candidates.len(),
                format_instant(anchor),
                format_instant(result_time)
            )));
        }
        return Ok(candidates.into_iter().next());
    }

    if candidates.len() > 1 {
        warn!(
            series_id = series.id,
            mode = mode.as_str(),
            anchor = %format_instant(anchor),
            versions = candidates.len(),
            "multiple result-time versions share the anchor timestamp; picking the latest"
        );
    }
    Ok(select_latest_result_time(candidates))
}

/// Uses the start of the requested time span.
///
/// # Errors
/// Returns [`QueryError::InvalidParameter`] without a time span; see [`resolve`].
pub fn closest_value_before_start(
    session: &dyn StoreSession,
    series: &SeriesRow,
    spec: &QuerySpecification,
) -> Result<Option<ObservationRow>, QueryError> {
    let Some(timespan) = spec.timespan() else {
        return Err(QueryError::InvalidParameter(
            "closest value before start needs a timespan".to_string(),
        ));
    };
    resolve(session, series, RetrievalMode::ClosestBefore(timespan.start()), spec)
}

/// Uses the end of the requested time span.
///
/// # Errors
/// Returns [`QueryError::InvalidParameter`] without a time span; see [`resolve`].
pub fn closest_value_after_end(
    session: &dyn StoreSession,
    series: &SeriesRow,
    spec: &QuerySpecification,
) -> Result<Option<ObservationRow>, QueryError> {
    let Some(timespan) = spec.timespan() else {
        return Err(QueryError::InvalidParameter(
            "closest value after end needs a timespan".to_string(),
        ));
    };
    resolve(session, series, RetrievalMode::ClosestAfter(timespan.end()), spec)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use time::macros::datetime;

    use super::*;
    use crate::store::ParameterRow;

    /// In-memory store evaluating predicate trees without subqueries.
    #[derive(Default)]
    struct MemoryStore {
        series: Vec<SeriesRow>,
        observations: Vec<ObservationRow>,
        executed: RefCell<Vec<Select>>,
    }

    fn matches_all(filter: &[Predicate], row: &dyn crate::predicate::ColumnSource) -> Result<bool, QueryError> {
        for predicate in filter {
            if !predicate.evaluate(row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    impl StoreSession for MemoryStore {
        fn select_observations(&self, select: &Select) -> Result<Vec<ObservationRow>, QueryError> {
            select.validate()?;
            self.executed.borrow_mut().push(select.clone());
            let mut rows = Vec::new();
            for row in &self.observations {
                if matches_all(&select.filter, row)? {
                    rows.push(row.clone());
                }
            }
            rows.sort_by(|left, right| {
                let mut ordering = Ordering::Equal;
                for order in &select.ordering {
                    let key = |row: &ObservationRow| match order.column {
                        Column::Observation(ObservationField::TimeStart) => row.time_start,
                        Column::Observation(ObservationField::TimeEnd) => row.time_end,
                        _ => OffsetDateTime::UNIX_EPOCH,
                    };
                    let step = match order.column {
                        Column::Observation(ObservationField::Id) => left.id.cmp(&right.id),
                        _ => key(left).cmp(&key(right)),
                    };
                    let step = match order.direction {
                        crate::predicate::Direction::Ascending => step,
                        crate::predicate::Direction::Descending => step.reverse(),
                    };
                    ordering = ordering.then(step);
                }
                ordering
            });
            if let Some(limit) = select.limit {
                rows.truncate(limit as usize);
            }
            Ok(rows)
        }

        fn select_series(&self, select: &Select) -> Result<Vec<SeriesRow>, QueryError> {
            select.validate()?;
            let mut rows = Vec::new();
            for row in &self.series {
                if matches_all(&select.filter, row)? {
                    rows.push(row.clone());
                }
            }
            Ok(rows)
        }

        fn select_parameters(&self, _select: &Select) -> Result<Vec<ParameterRow>, QueryError> {
            Ok(Vec::new())
        }

        fn count(&self, select: &Select) -> Result<u64, QueryError> {
            match select.root {
                Entity::Observation => Ok(self.select_observations(select)?.len() as u64),
                Entity::Series => Ok(self.select_series(select)?.len() as u64),
                Entity::Parameter(_) => Ok(0),
            }
        }
    }

    fn series_row(id: i64, dataset_type: &str) -> SeriesRow {
        SeriesRow {
            id,
            identifier: format!("ts_{id}"),
            platform_id: 1,
            procedure_id: 1,
            feature_id: 1,
            offering_id: 1,
            phenomenon_id: 1,
            category_id: 1,
            dataset_type: dataset_type.to_string(),
            first_value_at: None,
            last_value_at: None,
            deleted: false,
            platform_mobile: false,
        }
    }

    fn observation(
        id: i64,
        series_id: i64,
        at: OffsetDateTime,
        result_time: Option<OffsetDateTime>,
    ) -> ObservationRow {
        ObservationRow {
            id,
            series_id,
            time_start: at,
            time_end: at,
            result_time,
            valid_start: None,
            valid_end: None,
            deleted: false,
            parent: false,
            parent_id: None,
            geometry: None,
            value: Some(serde_json::json!(id)),
        }
    }

    fn three_values() -> MemoryStore {
        MemoryStore {
            series: vec![series_row(1, "timeseries")],
            observations: vec![
                observation(10, 1, datetime!(2024-01-01 00:00 UTC), None),
                observation(11, 1, datetime!(2024-01-02 00:00 UTC), None),
                observation(12, 1, datetime!(2024-01-03 00:00 UTC), None),
                observation(13, 2, datetime!(2024-01-04 00:00 UTC), None),
            ],
            executed: RefCell::default(),
        }
    }

    fn resolved_id(
        store: &MemoryStore,
        series: &SeriesRow,
        mode: RetrievalMode,
        spec: &QuerySpecification,
    ) -> Option<i64> {
        match resolve(store, series, mode, spec) {
            Ok(row) => row.map(|row| row.id),
            Err(err) => panic!("resolution must succeed: {err}"),
        }
    }

    #[test]
    fn first_last_and_closest_values_follow_anchor_rules() {
        let store = three_values();
        let series = series_row(1, "timeseries");
        let spec = QuerySpecification::default();
        let t2 = datetime!(2024-01-02 00:00 UTC);

        assert_eq!(resolved_id(&store, &series, RetrievalMode::First, &spec), Some(10));
        assert_eq!(resolved_id(&store, &series, RetrievalMode::Last, &spec), Some(12));
        assert_eq!(resolved_id(&store, &series, RetrievalMode::ClosestBefore(t2), &spec), Some(10));
        assert_eq!(resolved_id(&store, &series, RetrievalMode::ClosestAfter(t2), &spec), Some(12));
    }

    #[test]
    fn empty_range_is_not_an_error() {
        let store = three_values();
        let series = series_row(1, "timeseries");
        let spec = QuerySpecification::default();
        let before_all = datetime!(2023-12-31 00:00 UTC);
        assert_eq!(
            resolved_id(&store, &series, RetrievalMode::ClosestBefore(before_all), &spec),
            None
        );
        assert_eq!(resolved_id(&store, &series_row(7, "timeseries"), RetrievalMode::Last, &spec), None);
    }

    #[test]
    fn series_bounds_skip_the_probe() {
        let store = three_values();
        let mut series = series_row(1, "timeseries");
        series.last_value_at = Some(datetime!(2024-01-02 00:00 UTC));
        let spec = QuerySpecification::default();
        assert_eq!(resolved_id(&store, &series, RetrievalMode::Last, &spec), Some(11));
        assert_eq!(store.executed.borrow().len(), 1);
    }

    #[test]
    fn latest_result_time_wins_without_filter_and_filter_selects_exact_row() -> Result<(), QueryError> {
        let at = datetime!(2024-01-05 00:00 UTC);
        let r1 = datetime!(2024-01-05 01:00 UTC);
        let r2 = datetime!(2024-01-05 02:00 UTC);
        let store = MemoryStore {
            series: vec![series_row(1, "timeseries")],
            observations: vec![observation(20, 1, at, Some(r1)), observation(21, 1, at, Some(r2))],
            executed: RefCell::default(),
        };
        let series = series_row(1, "timeseries");

        let unfiltered = QuerySpecification::default();
        assert_eq!(resolved_id(&store, &series, RetrievalMode::Last, &unfiltered), Some(21));

        let filtered = QuerySpecification::from_parameters([("resultTime", "2024-01-05T01:00:00Z")])?;
        assert_eq!(resolved_id(&store, &series, RetrievalMode::Last, &filtered), Some(20));
        Ok(())
    }

    #[test]
    fn duplicate_rows_for_a_result_time_are_an_integrity_error() -> Result<(), QueryError> {
        let at = datetime!(2024-01-05 00:00 UTC);
        let r1 = datetime!(2024-01-05 01:00 UTC);
        let store = MemoryStore {
            series: vec![series_row(1, "timeseries")],
            observations: vec![observation(20, 1, at, Some(r1)), observation(21, 1, at, Some(r1))],
            executed: RefCell::default(),
        };
        let filtered = QuerySpecification::from_parameters([("resultTime", "2024-01-05T01:00:00Z")])?;
        let result = resolve(&store, &series_row(1, "timeseries"), RetrievalMode::First, &filtered);
        assert!(matches!(result, Err(QueryError::DataIntegrity(_))));
        Ok(())
    }

    #[test]
    fn ties_without_result_times_pick_lowest_id() {
        let at = datetime!(2024-01-05 00:00 UTC);
        let versions = vec![
            observation(31, 1, at, None),
            observation(30, 1, at, None),
            observation(32, 1, at, None),
        ];
        assert_eq!(select_latest_result_time(versions).map(|row| row.id), Some(30));

        let mixed = vec![observation(40, 1, at, None), observation(41, 1, at, Some(at))];
        assert_eq!(select_latest_result_time(mixed).map(|row| row.id), Some(41));
    }

    #[test]
    fn profile_series_resolve_parent_rows() {
        let at = datetime!(2024-01-05 00:00 UTC);
        let mut parent = observation(50, 3, at, None);
        parent.parent = true;
        let mut child = observation(51, 3, at, None);
        child.parent_id = Some(50);
        let store = MemoryStore {
            series: vec![series_row(3, "profile")],
            observations: vec![parent, child],
            executed: RefCell::default(),
        };
        let spec = QuerySpecification::default();
        assert_eq!(resolved_id(&store, &series_row(3, "profile"), RetrievalMode::First, &spec), Some(50));
        assert_eq!(resolved_id(&store, &series_row(3, "timeseries"), RetrievalMode::First, &spec), Some(51));
    }

    #[test]
    fn closest_values_require_a_timespan() -> Result<(), QueryError> {
        let store = three_values();
        let series = series_row(1, "timeseries");
        let none = QuerySpecification::default();
        assert!(matches!(
            closest_value_before_start(&store, &series, &none),
            Err(QueryError::InvalidParameter(_))
        ));

        let spec = QuerySpecification::from_parameters([(
            "timespan",
            "2024-01-02T00:00:00Z/2024-01-02T12:00:00Z",
        )])?;
        assert_eq!(closest_value_before_start(&store, &series, &spec)?.map(|row| row.id), Some(10));
        assert_eq!(closest_value_after_end(&store, &series, &spec)?.map(|row| row.id), Some(12));
        Ok(())
    }

    #[test]
    fn find_series_ignores_time_and_space_but_parses_paths() -> Result<(), QueryError> {
        let store = three_values();
        let transform = crate::spatial::EpsgTransform::default();
        let context = SpatialContext::new(crate::spatial::Crs::Wgs84, &transform);
        let spec = QuerySpecification::from_parameters([
            ("timespan", "2030-01-01T00:00:00Z/2030-01-02T00:00:00Z"),
        ])?;
        assert_eq!(find_series(&store, &context, "/api/series/1", &spec)?.id, 1);
        assert!(matches!(
            find_series(&store, &context, "ts_x", &spec),
            Err(QueryError::SeriesNotFound(_))
        ));
        assert!(matches!(
            find_series(&store, &context, "9", &spec),
            Err(QueryError::SeriesNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn parse_id_takes_last_path_segment() {
        assert_eq!(parse_id("42"), Some(42));
        assert_eq!(parse_id("http://host/api/series/42/"), Some(42));
        assert_eq!(parse_id("series/abc"), None);
        assert_eq!(parse_id(""), None);
    }
}
