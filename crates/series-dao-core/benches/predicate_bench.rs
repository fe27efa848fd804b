use criterion::{criterion_group, criterion_main, Criterion};
use series_dao_core::builder::{observation_select, parameter_select, series_select};
use series_dao_core::temporal::select_latest_result_time;
use series_dao_core::{
    Crs, EpsgTransform, ObservationRow, ParameterEntity, QuerySpecification, SpatialContext,
};
use time::{Duration, OffsetDateTime};

fn full_spec() -> QuerySpecification {
    match QuerySpecification::from_parameters([
        ("timespan", "2024-01-01T00:00:00Z/2024-12-31T00:00:00Z"),
        ("bbox", "800000,6700000,900000,6800000"),
        ("crs", "EPSG:3857"),
        ("locale", "de_DE"),
        ("platformTypes", "stationary,insitu"),
        ("datasetTypes", "timeseries,profile"),
        ("q", "temp"),
    ]) {
        Ok(spec) => spec,
        Err(err) => panic!("bench specification must parse: {err}"),
    }
}

fn mk_version(index: i64) -> ObservationRow {
    let at = OffsetDateTime::UNIX_EPOCH;
    ObservationRow {
        id: index,
        series_id: 1,
        time_start: at,
        time_end: at,
        result_time: (index % 3 != 0).then(|| at + Duration::minutes(index % 97)),
        valid_start: None,
        valid_end: None,
        deleted: false,
        parent: false,
        parent_id: None,
        geometry: None,
        value: None,
    }
}

fn bench_predicates(c: &mut Criterion) {
    let spec = full_spec();
    let transform = EpsgTransform::default();
    let context = SpatialContext::new(Crs::Wgs84, &transform);

    c.bench_function("observation_select_full_spec", |b| {
        b.iter(|| observation_select(&spec, Some(42), &context));
    });
    c.bench_function("series_select_full_spec", |b| {
        b.iter(|| series_select(&spec, &context));
    });
    c.bench_function("parameter_select_all_entities", |b| {
        b.iter(|| {
            ParameterEntity::ALL
                .into_iter()
                .map(|entity| parameter_select(&spec, entity, &context))
                .collect::<Vec<_>>()
        });
    });
}

fn bench_tie_break(c: &mut Criterion) {
    let versions = (0..1_000).map(mk_version).collect::<Vec<_>>();
    c.bench_function("latest_result_time_1000_versions", |b| {
        b.iter(|| select_latest_result_time(versions.clone()));
    });
}

criterion_group!(benches, bench_predicates, bench_tie_break);
criterion_main!(benches);
