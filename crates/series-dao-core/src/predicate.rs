use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::QueryError;
use crate::spatial::Envelope;
use crate::spec::primary_subtag;

/// Metadata entities a series refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParameterEntity {
    Platform,
    Procedure,
    Feature,
    Offering,
    Phenomenon,
    Category,
}

impl ParameterEntity {
    pub const ALL: [Self; 6] = [
        Self::Platform,
        Self::Procedure,
        Self::Feature,
        Self::Offering,
        Self::Phenomenon,
        Self::Category,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Procedure => "procedure",
            Self::Feature => "feature",
            Self::Offering => "offering",
            Self::Phenomenon => "phenomenon",
            Self::Category => "category",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "platform" | "platforms" => Some(Self::Platform),
            "procedure" | "procedures" => Some(Self::Procedure),
            "feature" | "features" => Some(Self::Feature),
            "offering" | "offerings" => Some(Self::Offering),
            "phenomenon" | "phenomena" => Some(Self::Phenomenon),
            "category" | "categories" => Some(Self::Category),
            _ => None,
        }
    }

    /// Platforms and procedures carry the mobile and insitu flags.
    #[must_use]
    pub fn has_platform_flags(self) -> bool {
        matches!(self, Self::Platform | Self::Procedure)
    }

    #[must_use]
    pub fn has_geometry(self) -> bool {
        matches!(self, Self::Feature)
    }
}

/// Root relation of a [`Select`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Entity {
    Observation,
    Series,
    Parameter(ParameterEntity),
}

impl Entity {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Series => "series",
            Self::Parameter(entity) => entity.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ObservationField {
    Id,
    SeriesId,
    TimeStart,
    TimeEnd,
    ResultTime,
    Deleted,
    Parent,
    Geometry,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SeriesField {
    Id,
    /// Foreign key to the referenced metadata entity.
    Reference(ParameterEntity),
    DatasetType,
    FirstValueAt,
    LastValueAt,
    Deleted,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ParameterField {
    Id,
    Identifier,
    Name,
    Mobile,
    Insitu,
    Geometry,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TranslationField {
    Locale,
    Name,
}

/// A column on a parameter entity. Only constructible for fields the entity actually has.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ParameterColumn {
    entity: ParameterEntity,
    field: ParameterField,
}

impl ParameterColumn {
    #[must_use]
    pub fn entity(self) -> ParameterEntity {
        self.entity
    }

    #[must_use]
    pub fn field(self) -> ParameterField {
        self.field
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Column {
    Observation(ObservationField),
    Series(SeriesField),
    Parameter(ParameterColumn),
    /// Column of the translation relation left-joined to a parameter root.
    Translation(TranslationField),
}

impl Column {
    /// # Errors
    /// Returns [`QueryError::InvalidPath`] when `entity` has no such field.
    pub fn parameter(entity: ParameterEntity, field: ParameterField) -> Result<Self, QueryError> {
        let valid = match field {
            ParameterField::Id | ParameterField::Identifier | ParameterField::Name => true,
            ParameterField::Mobile | ParameterField::Insitu => entity.has_platform_flags(),
            ParameterField::Geometry => entity.has_geometry(),
        };
        if !valid {
            return Err(QueryError::InvalidPath(format!(
                "{} has no {field:?} column",
                entity.as_str()
            )));
        }
        Ok(Self::Parameter(ParameterColumn { entity, field }))
    }

    #[must_use]
    pub fn parameter_id(entity: ParameterEntity) -> Self {
        Self::Parameter(ParameterColumn { entity, field: ParameterField::Id })
    }

    #[must_use]
    pub fn parameter_identifier(entity: ParameterEntity) -> Self {
        Self::Parameter(ParameterColumn { entity, field: ParameterField::Identifier })
    }

    #[must_use]
    pub fn parameter_name(entity: ParameterEntity) -> Self {
        Self::Parameter(ParameterColumn { entity, field: ParameterField::Name })
    }

    /// Entity owning the column; `None` for translation columns.
    #[must_use]
    pub fn owner(self) -> Option<Entity> {
        match self {
            Self::Observation(_) => Some(Entity::Observation),
            Self::Series(_) => Some(Entity::Series),
            Self::Parameter(column) => Some(Entity::Parameter(column.entity)),
            Self::Translation(_) => None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Text(String),
    Instant(OffsetDateTime),
}

impl Value {
    fn partial_cmp_to(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Instant(a), Self::Instant(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// Association chain a correlated subquery ranges over.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JoinPath {
    Series,
    /// Series joined to the referenced entity through its foreign key.
    SeriesTo(ParameterEntity),
    Entity(ParameterEntity),
}

impl JoinPath {
    #[must_use]
    pub fn entities(self) -> Vec<Entity> {
        match self {
            Self::Series => vec![Entity::Series],
            Self::SeriesTo(entity) => vec![Entity::Series, Entity::Parameter(entity)],
            Self::Entity(entity) => vec![Entity::Parameter(entity)],
        }
    }

    #[must_use]
    pub fn reaches(self, column: Column) -> bool {
        column.owner().is_some_and(|owner| self.entities().contains(&owner))
    }
}

/// `outer IN (SELECT projection FROM path WHERE filter)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedSubquery {
    path: JoinPath,
    projection: Column,
    filter: Vec<Predicate>,
}

impl CorrelatedSubquery {
    /// # Errors
    /// Returns [`QueryError::InvalidPath`] when the projection or a filtered column is not
    /// reachable through `path`.
    pub fn new(path: JoinPath, projection: Column, filter: Vec<Predicate>) -> Result<Self, QueryError> {
        if !path.reaches(projection) {
            return Err(QueryError::InvalidPath(format!(
                "projection {projection:?} is not reachable through {path:?}"
            )));
        }
        for predicate in &filter {
            for column in predicate.columns() {
                if !path.reaches(column) {
                    return Err(QueryError::InvalidPath(format!(
                        "column {column:?} is not reachable through {path:?}"
                    )));
                }
            }
        }
        Ok(Self { path, projection, filter })
    }

    #[must_use]
    pub fn path(&self) -> JoinPath {
        self.path
    }

    #[must_use]
    pub fn projection(&self) -> Column {
        self.projection
    }

    #[must_use]
    pub fn filter(&self) -> &[Predicate] {
        &self.filter
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare { column: Column, op: CompareOp, value: Value },
    /// Inclusive on both ends.
    Between { column: Column, low: Value, high: Value },
    In { column: Column, values: Vec<Value> },
    IsNull(Column),
    /// Case-insensitive substring match.
    Contains { column: Column, term: String },
    /// Language tag whose primary subtag equals `subtag` (`en` matches `en`, `en_US`, `en-GB`).
    PrimarySubtag { column: Column, subtag: String },
    Intersects { column: Column, envelope: Envelope },
    InSubquery { column: Column, subquery: Box<CorrelatedSubquery> },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    #[must_use]
    pub fn equals(column: Column, value: Value) -> Self {
        Self::Compare { column, op: CompareOp::Eq, value }
    }

    #[must_use]
    pub fn compare(column: Column, op: CompareOp, value: Value) -> Self {
        Self::Compare { column, op, value }
    }

    #[must_use]
    pub fn in_subquery(column: Column, subquery: CorrelatedSubquery) -> Self {
        Self::InSubquery { column, subquery: Box::new(subquery) }
    }

    /// Columns of the enclosing query this predicate touches. Columns inside a subquery are
    /// scoped to the subquery and not reported.
    #[must_use]
    pub fn columns(&self) -> Vec<Column> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns(&self, columns: &mut Vec<Column>) {
        match self {
            Self::Compare { column, .. }
            | Self::Between { column, .. }
            | Self::In { column, .. }
            | Self::IsNull(column)
            | Self::Contains { column, .. }
            | Self::PrimarySubtag { column, .. }
            | Self::Intersects { column, .. }
            | Self::InSubquery { column, .. } => columns.push(*column),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_columns(columns);
                }
            }
            Self::Not(child) => child.collect_columns(columns),
        }
    }

    /// Evaluates the predicate against one materialized row. A predicate that is unknown under
    /// SQL three-valued logic drops the row, as a `WHERE` clause would.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidPath`] for correlated subqueries, which need a store.
    pub fn evaluate(&self, source: &dyn ColumnSource) -> Result<bool, QueryError> {
        Ok(self.truth(source)?.unwrap_or(false))
    }

    /// `None` is SQL unknown.
    fn truth(&self, source: &dyn ColumnSource) -> Result<Option<bool>, QueryError> {
        match self {
            Self::Compare { column, op, value } => Ok(source
                .value(*column)
                .and_then(|actual| actual.partial_cmp_to(value))
                .map(|ordering| op.holds(ordering))),
            Self::Between { column, low, high } => Ok(source.value(*column).and_then(|actual| {
                let above = actual.partial_cmp_to(low)?;
                let below = actual.partial_cmp_to(high)?;
                Some(above != Ordering::Less && below != Ordering::Greater)
            })),
            Self::In { column, values } => {
                Ok(source.value(*column).map(|actual| values.contains(&actual)))
            }
            Self::IsNull(column) => Ok(Some(source.value(*column).is_none())),
            Self::Contains { column, term } => Ok(match source.value(*column) {
                Some(Value::Text(text)) => {
                    Some(text.to_lowercase().contains(&term.to_lowercase()))
                }
                Some(_) => Some(false),
                None => None,
            }),
            Self::PrimarySubtag { column, subtag } => Ok(match source.value(*column) {
                Some(Value::Text(tag)) => Some(primary_subtag(&tag) == subtag.to_ascii_lowercase()),
                Some(_) => Some(false),
                None => None,
            }),
            Self::Intersects { column, envelope } => {
                Ok(source.envelope(*column).map(|actual| actual.intersects(envelope)))
            }
            Self::InSubquery { subquery, .. } => Err(QueryError::InvalidPath(format!(
                "subquery over {:?} cannot be evaluated in memory",
                subquery.path
            ))),
            Self::And(children) => {
                let mut result = Some(true);
                for child in children {
                    match child.truth(source)? {
                        Some(false) => return Ok(Some(false)),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                Ok(result)
            }
            Self::Or(children) => {
                let mut result = Some(false);
                for child in children {
                    match child.truth(source)? {
                        Some(true) => return Ok(Some(true)),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                Ok(result)
            }
            Self::Not(child) => Ok(child.truth(source)?.map(|truth| !truth)),
        }
    }
}

/// Row view used by [`Predicate::evaluate`]. `None` stands for SQL `NULL`.
pub trait ColumnSource {
    fn value(&self, column: Column) -> Option<Value>;

    fn envelope(&self, _column: Column) -> Option<Envelope> {
        None
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct OrderBy {
    pub column: Column,
    pub direction: Direction,
}

impl OrderBy {
    #[must_use]
    pub fn asc(column: Column) -> Self {
        Self { column, direction: Direction::Ascending }
    }

    #[must_use]
    pub fn desc(column: Column) -> Self {
        Self { column, direction: Direction::Descending }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Join {
    /// `LEFT OUTER JOIN` of the translation relation onto a parameter root. `subtag` is the
    /// language preferred when resolving labels.
    TranslationLeftOuter { subtag: String },
}

/// One store query: root relation, conjunctive filter, optional joins, ordering and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub root: Entity,
    pub filter: Vec<Predicate>,
    pub joins: Vec<Join>,
    pub ordering: Vec<OrderBy>,
    pub limit: Option<u32>,
}

impl Select {
    #[must_use]
    pub fn new(root: Entity) -> Self {
        Self { root, filter: Vec::new(), joins: Vec::new(), ordering: Vec::new(), limit: None }
    }

    #[must_use]
    pub fn with_filter<I>(mut self, predicates: I) -> Self
    where
        I: IntoIterator<Item = Predicate>,
    {
        self.filter.extend(predicates);
        self
    }

    #[must_use]
    pub fn and(mut self, predicate: Predicate) -> Self {
        self.filter.push(predicate);
        self
    }

    #[must_use]
    pub fn join(mut self, join: Join) -> Self {
        if !self.joins.contains(&join) {
            self.joins.push(join);
        }
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.ordering.push(order);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn has_translation_join(&self) -> bool {
        self.translation_subtag().is_some()
    }

    #[must_use]
    pub fn translation_subtag(&self) -> Option<&str> {
        self.joins.iter().find_map(|join| match join {
            Join::TranslationLeftOuter { subtag } => Some(subtag.as_str()),
        })
    }

    /// Checks that every filtered or ordered column belongs to the root (or to the joined
    /// translation relation).
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidPath`] for out-of-scope columns or a translation join on a
    /// root without labels.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.has_translation_join() && !matches!(self.root, Entity::Parameter(_)) {
            return Err(QueryError::InvalidPath(format!(
                "{} has no translations",
                self.root.name()
            )));
        }
        let ordered = self.ordering.iter().map(|order| order.column);
        let filtered = self.filter.iter().flat_map(Predicate::columns);
        for column in filtered.chain(ordered) {
            let in_scope = match column.owner() {
                Some(owner) => owner == self.root,
                None => self.has_translation_join(),
            };
            if !in_scope {
                return Err(QueryError::InvalidPath(format!(
                    "column {column:?} is not reachable from {}",
                    self.root.name()
                )));
            }
        }
        Ok(())
    }
}
