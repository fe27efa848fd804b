//! Predicate tree to SQLite translation. Every value is bound as a positional parameter in
//! text order; only table, column and alias names are spliced into the statement.

use rusqlite::types::Value as SqlValue;
use series_dao_core::{
    Column, Direction, Entity, JoinPath, ObservationField, OrderBy, ParameterEntity,
    ParameterField, Predicate, QueryError, Select, SeriesField, TranslationField, Value,
};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub(crate) const TRANSLATION_ALIAS: &str = "tr";
pub(crate) const SERIES_PLATFORM_ALIAS: &str = "sp";

/// Fixed-width UTC text so lexical order equals temporal order.
///
/// # Errors
/// Returns [`QueryError::InvalidParameter`] for instants outside the four-digit year range.
pub fn instant_text(instant: OffsetDateTime) -> Result<String, QueryError> {
    instant
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .map_err(|err| QueryError::InvalidParameter(format!("instant cannot be stored: {err}")))
}

#[must_use]
pub fn table_name(entity: Entity) -> &'static str {
    match entity {
        Entity::Observation => "observations",
        Entity::Series => "series",
        Entity::Parameter(parameter) => parameter_table(parameter),
    }
}

#[must_use]
pub fn parameter_table(entity: ParameterEntity) -> &'static str {
    match entity {
        ParameterEntity::Platform => "platforms",
        ParameterEntity::Procedure => "procedures",
        ParameterEntity::Feature => "features",
        ParameterEntity::Offering => "offerings",
        ParameterEntity::Phenomenon => "phenomena",
        ParameterEntity::Category => "categories",
    }
}

fn reference_column(entity: ParameterEntity) -> &'static str {
    match entity {
        ParameterEntity::Platform => "platform_id",
        ParameterEntity::Procedure => "procedure_id",
        ParameterEntity::Feature => "feature_id",
        ParameterEntity::Offering => "offering_id",
        ParameterEntity::Phenomenon => "phenomenon_id",
        ParameterEntity::Category => "category_id",
    }
}

/// What the statement returns.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Projection {
    Rows,
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Aliases visible at one nesting level.
struct Scope {
    bindings: Vec<(Entity, String)>,
    translation: bool,
}

impl Scope {
    fn alias(&self, entity: Entity) -> Result<&str, QueryError> {
        self.bindings
            .iter()
            .find(|(bound, _)| *bound == entity)
            .map(|(_, alias)| alias.as_str())
            .ok_or_else(|| QueryError::InvalidPath(format!("{} is not in scope", entity.name())))
    }
}

struct Renderer {
    params: Vec<SqlValue>,
    depth: usize,
}

impl Renderer {
    fn bind(&mut self, value: &Value) -> Result<&'static str, QueryError> {
        let bound = match value {
            Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
            Value::Integer(number) => SqlValue::Integer(*number),
            Value::Text(text) => SqlValue::Text(text.clone()),
            Value::Instant(instant) => SqlValue::Text(instant_text(*instant)?),
        };
        self.params.push(bound);
        Ok("?")
    }

    fn bind_raw(&mut self, value: SqlValue) -> &'static str {
        self.params.push(value);
        "?"
    }

    fn column(scope: &Scope, column: Column) -> Result<String, QueryError> {
        let name = match column {
            Column::Observation(field) => match field {
                ObservationField::Id => "id",
                ObservationField::SeriesId => "series_id",
                ObservationField::TimeStart => "time_start",
                ObservationField::TimeEnd => "time_end",
                ObservationField::ResultTime => "result_time",
                ObservationField::Deleted => "deleted",
                ObservationField::Parent => "parent",
                ObservationField::Geometry => return Err(geometry_scalar_error()),
            },
            Column::Series(field) => match field {
                SeriesField::Id => "id",
                SeriesField::Reference(entity) => reference_column(entity),
                SeriesField::DatasetType => "dataset_type",
                SeriesField::FirstValueAt => "first_value_at",
                SeriesField::LastValueAt => "last_value_at",
                SeriesField::Deleted => "deleted",
            },
            Column::Parameter(parameter) => match parameter.field() {
                ParameterField::Id => "id",
                ParameterField::Identifier => "identifier",
                ParameterField::Name => "name",
                ParameterField::Mobile => "mobile",
                ParameterField::Insitu => "insitu",
                ParameterField::Geometry => return Err(geometry_scalar_error()),
            },
            Column::Translation(field) => {
                if !scope.translation {
                    return Err(QueryError::InvalidPath(
                        "translation column without translation join".to_string(),
                    ));
                }
                let name = match field {
                    TranslationField::Locale => "locale",
                    TranslationField::Name => "name",
                };
                return Ok(format!("{TRANSLATION_ALIAS}.{name}"));
            }
        };
        let Some(owner) = column.owner() else {
            return Err(QueryError::InvalidPath(format!("column {column:?} has no owner")));
        };
        Ok(format!("{}.{name}", scope.alias(owner)?))
    }

    fn geometry_alias<'s>(scope: &'s Scope, column: Column) -> Result<&'s str, QueryError> {
        match column {
            Column::Observation(ObservationField::Geometry) => scope.alias(Entity::Observation),
            Column::Parameter(parameter) if parameter.field() == ParameterField::Geometry => {
                scope.alias(Entity::Parameter(parameter.entity()))
            }
            _ => Err(QueryError::InvalidPath(format!("{column:?} is not a geometry column"))),
        }
    }

    fn predicate(&mut self, scope: &Scope, predicate: &Predicate) -> Result<String, QueryError> {
        match predicate {
            Predicate::Compare { column, op, value } => {
                let column = Self::column(scope, *column)?;
                Ok(format!("{column} {} {}", op.as_sql(), self.bind(value)?))
            }
            Predicate::Between { column, low, high } => {
                let column = Self::column(scope, *column)?;
                let low = self.bind(low)?;
                let high = self.bind(high)?;
                Ok(format!("{column} BETWEEN {low} AND {high}"))
            }
            Predicate::In { column, values } => {
                if values.is_empty() {
                    return Ok("0".to_string());
                }
                let column = Self::column(scope, *column)?;
                let placeholders =
                    values.iter().map(|value| self.bind(value)).collect::<Result<Vec<_>, _>>()?;
                Ok(format!("{column} IN ({})", placeholders.join(", ")))
            }
            Predicate::IsNull(column) => Ok(format!("{} IS NULL", Self::column(scope, *column)?)),
            Predicate::Contains { column, term } => {
                let column = Self::column(scope, *column)?;
                let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
                Ok(format!("LOWER({column}) LIKE {} ESCAPE '\\'", self.bind_raw(SqlValue::Text(pattern))))
            }
            Predicate::PrimarySubtag { column, subtag } => {
                let column = Self::column(scope, *column)?;
                let subtag = subtag.to_ascii_lowercase();
                let escaped = escape_like(&subtag);
                let exact = self.bind_raw(SqlValue::Text(subtag));
                let underscore = self.bind_raw(SqlValue::Text(format!("{escaped}\\_%")));
                let hyphen = self.bind_raw(SqlValue::Text(format!("{escaped}-%")));
                Ok(format!(
                    "(LOWER({column}) = {exact} OR LOWER({column}) LIKE {underscore} ESCAPE '\\' \
                     OR LOWER({column}) LIKE {hyphen} ESCAPE '\\')"
                ))
            }
            Predicate::Intersects { column, envelope } => {
                let alias = Self::geometry_alias(scope, *column)?;
                let max_x = self.bind_raw(SqlValue::Real(envelope.max_x));
                let min_x = self.bind_raw(SqlValue::Real(envelope.min_x));
                let max_y = self.bind_raw(SqlValue::Real(envelope.max_y));
                let min_y = self.bind_raw(SqlValue::Real(envelope.min_y));
                Ok(format!(
                    "({alias}.min_x IS NOT NULL AND {alias}.min_x <= {max_x} AND {alias}.max_x >= {min_x} \
                     AND {alias}.min_y <= {max_y} AND {alias}.max_y >= {min_y})"
                ))
            }
            Predicate::InSubquery { column, subquery } => {
                let column = Self::column(scope, *column)?;
                self.depth += 1;
                let depth = self.depth;
                let (from, inner_scope) = subquery_from(subquery.path(), depth);
                let projection = Self::column(&inner_scope, subquery.projection())?;
                let filter = self.conjunction(&inner_scope, subquery.filter())?;
                Ok(format!("{column} IN (SELECT {projection} FROM {from} WHERE {filter})"))
            }
            Predicate::And(children) => {
                if children.is_empty() {
                    return Ok("1".to_string());
                }
                Ok(format!("({})", self.join(scope, children, " AND ")?))
            }
            Predicate::Or(children) => {
                if children.is_empty() {
                    return Ok("0".to_string());
                }
                Ok(format!("({})", self.join(scope, children, " OR ")?))
            }
            Predicate::Not(child) => Ok(format!("NOT ({})", self.predicate(scope, child)?)),
        }
    }

    fn join(&mut self, scope: &Scope, children: &[Predicate], separator: &str) -> Result<String, QueryError> {
        let parts =
            children.iter().map(|child| self.predicate(scope, child)).collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(separator))
    }

    fn conjunction(&mut self, scope: &Scope, filter: &[Predicate]) -> Result<String, QueryError> {
        if filter.is_empty() {
            return Ok("1".to_string());
        }
        self.join(scope, filter, " AND ")
    }
}

fn geometry_scalar_error() -> QueryError {
    QueryError::InvalidPath("geometry columns only support intersection".to_string())
}

fn subquery_from(path: JoinPath, depth: usize) -> (String, Scope) {
    match path {
        JoinPath::Series => {
            let alias = format!("s{depth}");
            (format!("series {alias}"), Scope { bindings: vec![(Entity::Series, alias)], translation: false })
        }
        JoinPath::SeriesTo(entity) => {
            let series = format!("s{depth}");
            let related = format!("p{depth}");
            let from = format!(
                "series {series} JOIN {} {related} ON {related}.id = {series}.{}",
                parameter_table(entity),
                reference_column(entity)
            );
            let bindings = vec![(Entity::Series, series), (Entity::Parameter(entity), related)];
            (from, Scope { bindings, translation: false })
        }
        JoinPath::Entity(entity) => {
            let alias = format!("p{depth}");
            (
                format!("{} {alias}", parameter_table(entity)),
                Scope { bindings: vec![(Entity::Parameter(entity), alias)], translation: false },
            )
        }
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_columns(root: Entity, translated: bool) -> String {
    match root {
        Entity::Observation => "t0.id, t0.series_id, t0.time_start, t0.time_end, t0.result_time, \
             t0.valid_start, t0.valid_end, t0.deleted, t0.parent, t0.parent_id, \
             t0.min_x, t0.min_y, t0.max_x, t0.max_y, t0.value_json"
            .to_string(),
        Entity::Series => format!(
            "t0.id, t0.identifier, t0.platform_id, t0.procedure_id, t0.feature_id, t0.offering_id, \
             t0.phenomenon_id, t0.category_id, t0.dataset_type, t0.first_value_at, \
             t0.last_value_at, t0.deleted, {SERIES_PLATFORM_ALIAS}.mobile"
        ),
        Entity::Parameter(_) if translated => {
            format!("t0.id, t0.identifier, t0.name, {TRANSLATION_ALIAS}.locale, {TRANSLATION_ALIAS}.name")
        }
        Entity::Parameter(_) => "t0.id, t0.identifier, t0.name, NULL, NULL".to_string(),
    }
}

fn root_from(root: Entity, translated: bool) -> String {
    match root {
        Entity::Series => format!(
            "series t0 JOIN platforms {SERIES_PLATFORM_ALIAS} ON {SERIES_PLATFORM_ALIAS}.id = t0.platform_id"
        ),
        Entity::Parameter(entity) if translated => format!(
            "{} t0 LEFT OUTER JOIN translations {TRANSLATION_ALIAS} \
             ON {TRANSLATION_ALIAS}.entity_type = '{}' AND {TRANSLATION_ALIAS}.entity_id = t0.id",
            parameter_table(entity),
            entity.as_str()
        ),
        other => format!("{} t0", table_name(other)),
    }
}

/// Renders `select` into one statement.
///
/// With a translation join the statement yields one row per (entity, translation) pair and
/// the limit is left to the caller, which deduplicates by id.
///
/// # Errors
/// Returns [`QueryError::InvalidPath`] for selects that fail validation.
pub fn render(select: &Select, projection: Projection) -> Result<SqlQuery, QueryError> {
    select.validate()?;
    let translated = select.has_translation_join();
    let scope = Scope { bindings: vec![(select.root, "t0".to_string())], translation: translated };
    let mut renderer = Renderer { params: Vec::new(), depth: 0 };

    let filter = renderer.conjunction(&scope, &select.filter)?;
    let mut sql = match projection {
        Projection::Rows => format!(
            "SELECT {} FROM {} WHERE {filter}",
            row_columns(select.root, translated),
            root_from(select.root, translated)
        ),
        Projection::Count => format!(
            "SELECT COUNT(DISTINCT t0.id) FROM {} WHERE {filter}",
            root_from(select.root, translated)
        ),
    };

    if projection == Projection::Rows {
        let mut ordering = select
            .ordering
            .iter()
            .map(|order| order_sql(&scope, *order))
            .collect::<Result<Vec<_>, _>>()?;
        if translated {
            ordering.push("t0.id ASC".to_string());
        }
        if !ordering.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&ordering.join(", "));
        }
        if let (Some(limit), false) = (select.limit, translated) {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
    }

    Ok(SqlQuery { sql, params: renderer.params })
}

fn order_sql(scope: &Scope, order: OrderBy) -> Result<String, QueryError> {
    let column = Renderer::column(scope, order.column)?;
    let direction = match order.direction {
        Direction::Ascending => "ASC",
        Direction::Descending => "DESC",
    };
    Ok(format!("{column} {direction}"))
}
