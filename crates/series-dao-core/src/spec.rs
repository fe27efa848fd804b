use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::error::QueryError;
use crate::spatial::{Crs, Point};

pub const PARAM_TIMESPAN: &str = "timespan";
pub const PARAM_BBOX: &str = "bbox";
pub const PARAM_CRS: &str = "crs";
pub const PARAM_LOCALE: &str = "locale";
pub const PARAM_PLATFORM_TYPES: &str = "platformtypes";
pub const PARAM_DATASET_TYPES: &str = "datasettypes";
pub const PARAM_RESULT_TIME: &str = "resulttime";
pub const PARAM_EXPANDED: &str = "expanded";
pub const PARAM_HREF_BASE: &str = "hrefbase";
pub const PARAM_SEARCH_TERM: &str = "q";

/// Closed interval of UTC instants.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TimeSpan {
    start: OffsetDateTime,
    end: OffsetDateTime,
}

impl TimeSpan {
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] when `start` is after `end`.
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, QueryError> {
        if start > end {
            return Err(QueryError::InvalidParameter(format!(
                "timespan start {} is after end {}",
                format_instant(start),
                format_instant(end)
            )));
        }
        Ok(Self { start: start.to_offset(UtcOffset::UTC), end: end.to_offset(UtcOffset::UTC) })
    }

    /// Parses `<rfc3339>/<rfc3339>`.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] for malformed or inverted intervals.
    pub fn parse(value: &str) -> Result<Self, QueryError> {
        let Some((start, end)) = value.split_once('/') else {
            return Err(QueryError::InvalidParameter(format!(
                "timespan must be <start>/<end>: {value}"
            )));
        };
        Self::new(parse_instant(start)?, parse_instant(end)?)
    }

    #[must_use]
    pub fn start(&self) -> OffsetDateTime {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> OffsetDateTime {
        self.end
    }

    #[must_use]
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.start <= instant && instant <= self.end
    }
}

impl Display for TimeSpan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", format_instant(self.start), format_instant(self.end))
    }
}

/// Lower-left / upper-right corners in the reference system the caller declared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    lower_left: Point,
    upper_right: Point,
    crs: Crs,
}

impl BoundingBox {
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] for non-finite coordinates or swapped corners.
    pub fn new(lower_left: Point, upper_right: Point, crs: Crs) -> Result<Self, QueryError> {
        if !lower_left.is_finite() || !upper_right.is_finite() {
            return Err(QueryError::InvalidParameter(
                "bbox coordinates must be finite".to_string(),
            ));
        }
        if lower_left.x > upper_right.x || lower_left.y > upper_right.y {
            return Err(QueryError::InvalidParameter(format!(
                "bbox lower-left ({}, {}) is not below upper-right ({}, {})",
                lower_left.x, lower_left.y, upper_right.x, upper_right.y
            )));
        }
        Ok(Self { lower_left, upper_right, crs })
    }

    /// Accepts `minx,miny,maxx,maxy` or `{"ll":{"type":"Point",...},"ur":{...}}`.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] when the value is neither form.
    pub fn parse(value: &str, crs: Crs) -> Result<Self, QueryError> {
        let trimmed = value.trim();
        if trimmed.starts_with('{') {
            let corners: GeoJsonCorners = serde_json::from_str(trimmed).map_err(|err| {
                QueryError::InvalidParameter(format!("bbox is not a valid corner document: {err}"))
            })?;
            return Self::new(corners.ll.point()?, corners.ur.point()?, crs);
        }

        let numbers = trimmed
            .split(',')
            .map(|part| {
                part.trim().parse::<f64>().map_err(|_| {
                    QueryError::InvalidParameter(format!("bbox coordinate is not a number: {part}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let [min_x, min_y, max_x, max_y] = numbers.as_slice() else {
            return Err(QueryError::InvalidParameter(format!(
                "bbox must have four coordinates: {value}"
            )));
        };
        Self::new(Point::new(*min_x, *min_y), Point::new(*max_x, *max_y), crs)
    }

    #[must_use]
    pub fn lower_left(&self) -> Point {
        self.lower_left
    }

    #[must_use]
    pub fn upper_right(&self) -> Point {
        self.upper_right
    }

    #[must_use]
    pub fn crs(&self) -> Crs {
        self.crs
    }
}

#[derive(Debug, Deserialize)]
struct GeoJsonCorners {
    ll: GeoJsonPoint,
    ur: GeoJsonPoint,
}

#[derive(Debug, Deserialize)]
struct GeoJsonPoint {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Vec<f64>,
}

impl GeoJsonPoint {
    fn point(&self) -> Result<Point, QueryError> {
        if !self.kind.eq_ignore_ascii_case("point") {
            return Err(QueryError::InvalidParameter(format!(
                "bbox corner must be a Point, got {}",
                self.kind
            )));
        }
        match self.coordinates.as_slice() {
            [x, y] | [x, y, _] => Ok(Point::new(*x, *y)),
            _ => Err(QueryError::InvalidParameter(
                "bbox corner needs two coordinates".to_string(),
            )),
        }
    }
}

/// A language tag such as `en`, `en_US` or `de-DE`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Locale(String);

impl Locale {
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] for empty tags or tags with foreign characters.
    pub fn parse(value: &str) -> Result<Self, QueryError> {
        let trimmed = value.trim();
        let valid = !trimmed.is_empty()
            && trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && trimmed.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
        if !valid {
            return Err(QueryError::InvalidParameter(format!("invalid locale: {value}")));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased language part: `en_US` and `en-GB` both yield `en`.
    #[must_use]
    pub fn primary_subtag(&self) -> String {
        primary_subtag(&self.0)
    }
}

#[must_use]
pub fn primary_subtag(tag: &str) -> String {
    tag.split(['_', '-']).next().unwrap_or_default().to_ascii_lowercase()
}

/// Inclusion flags for the mobility (stationary/mobile) and placement (insitu/remote) axes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub struct PlatformTypeFilter {
    pub include_stationary: bool,
    pub include_mobile: bool,
    pub include_insitu: bool,
    pub include_remote: bool,
}

impl Default for PlatformTypeFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl PlatformTypeFilter {
    #[must_use]
    pub fn all() -> Self {
        Self { include_stationary: true, include_mobile: true, include_insitu: true, include_remote: true }
    }

    #[must_use]
    pub fn includes_all(&self) -> bool {
        self.include_stationary && self.include_mobile && self.include_insitu && self.include_remote
    }

    /// Parses a comma list of `stationary`, `mobile`, `insitu`, `remote` and `all`.
    /// An axis without any of its values mentioned keeps both of its flags set.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] for unknown platform types.
    pub fn parse(value: &str) -> Result<Self, QueryError> {
        let mut mentioned = BTreeSet::new();
        for part in split_list(value) {
            let token = part.to_ascii_lowercase();
            match token.as_str() {
                "stationary" | "mobile" | "insitu" | "remote" | "all" => {
                    mentioned.insert(token);
                }
                _ => {
                    return Err(QueryError::InvalidParameter(format!(
                        "unknown platform type: {part}"
                    )))
                }
            }
        }
        if mentioned.contains("all") {
            return Ok(Self::all());
        }

        let mut filter = Self::all();
        if mentioned.contains("stationary") || mentioned.contains("mobile") {
            filter.include_stationary = mentioned.contains("stationary");
            filter.include_mobile = mentioned.contains("mobile");
        }
        if mentioned.contains("insitu") || mentioned.contains("remote") {
            filter.include_insitu = mentioned.contains("insitu");
            filter.include_remote = mentioned.contains("remote");
        }
        Ok(filter)
    }
}

/// Parsed, immutable filter intent of one request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySpecification {
    timespan: Option<TimeSpan>,
    spatial_filter: Option<BoundingBox>,
    locale: Option<Locale>,
    platform_types: PlatformTypeFilter,
    dataset_types: BTreeSet<String>,
    result_time: Option<OffsetDateTime>,
    complex_parent: bool,
    expanded: bool,
    href_base: Option<String>,
    search_term: Option<String>,
}

impl QuerySpecification {
    /// Builds a specification from flat request parameters. Keys match case-insensitively and
    /// unknown keys are ignored.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidParameter`] for malformed values and
    /// [`QueryError::SpatialTransform`] for an unsupported `crs`.
    pub fn from_parameters<I, K, V>(parameters: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut spec = Self::default();
        let mut bbox = None;
        let mut crs = Crs::default();

        for (key, value) in parameters {
            let value = value.as_ref();
            match key.as_ref().to_ascii_lowercase().as_str() {
                PARAM_TIMESPAN => spec.timespan = Some(TimeSpan::parse(value)?),
                PARAM_BBOX => bbox = Some(value.to_string()),
                PARAM_CRS => crs = Crs::parse(value)?,
                PARAM_LOCALE => spec.locale = Some(Locale::parse(value)?),
                PARAM_PLATFORM_TYPES => spec.platform_types = PlatformTypeFilter::parse(value)?,
                PARAM_DATASET_TYPES => {
                    spec.dataset_types = split_list(value).map(ToString::to_string).collect();
                }
                PARAM_RESULT_TIME => spec.result_time = Some(parse_instant(value)?),
                PARAM_EXPANDED => spec.expanded = parse_bool(PARAM_EXPANDED, value)?,
                PARAM_HREF_BASE => spec.href_base = non_empty(value),
                PARAM_SEARCH_TERM => spec.search_term = non_empty(value),
                _ => {}
            }
        }

        if let Some(bbox) = bbox {
            spec.spatial_filter = Some(BoundingBox::parse(&bbox, crs)?);
        }
        Ok(spec)
    }

    #[must_use]
    pub fn timespan(&self) -> Option<&TimeSpan> {
        self.timespan.as_ref()
    }

    #[must_use]
    pub fn spatial_filter(&self) -> Option<&BoundingBox> {
        self.spatial_filter.as_ref()
    }

    #[must_use]
    pub fn locale(&self) -> Option<&Locale> {
        self.locale.as_ref()
    }

    #[must_use]
    pub fn platform_types(&self) -> PlatformTypeFilter {
        self.platform_types
    }

    #[must_use]
    pub fn dataset_types(&self) -> &BTreeSet<String> {
        &self.dataset_types
    }

    #[must_use]
    pub fn result_time(&self) -> Option<OffsetDateTime> {
        self.result_time
    }

    /// `true` selects parent (profile/complex container) rows, `false` leaf rows.
    #[must_use]
    pub fn is_parent_only(&self) -> bool {
        self.complex_parent
    }

    #[must_use]
    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    #[must_use]
    pub fn href_base(&self) -> Option<&str> {
        self.href_base.as_deref()
    }

    #[must_use]
    pub fn search_term(&self) -> Option<&str> {
        self.search_term.as_deref()
    }

    /// Same specification without time span and bounding box, for series metadata lookups.
    #[must_use]
    pub fn without_spatial_and_time_filters(&self) -> Self {
        Self { timespan: None, spatial_filter: None, ..self.clone() }
    }

    #[must_use]
    pub fn with_complex_parent(&self, complex_parent: bool) -> Self {
        Self { complex_parent, ..self.clone() }
    }

    #[must_use]
    pub fn with_dataset_types<I, S>(&self, dataset_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { dataset_types: dataset_types.into_iter().map(Into::into).collect(), ..self.clone() }
    }

    #[must_use]
    pub fn with_timespan(&self, timespan: Option<TimeSpan>) -> Self {
        Self { timespan, ..self.clone() }
    }

    /// Short stable digest of the filter intent, used to correlate log lines.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(timespan) = &self.timespan {
            hasher.update(format!("timespan={timespan};").as_bytes());
        }
        if let Some(bbox) = &self.spatial_filter {
            hasher.update(
                format!(
                    "bbox={},{},{},{}@{};",
                    bbox.lower_left.x, bbox.lower_left.y, bbox.upper_right.x, bbox.upper_right.y, bbox.crs
                )
                .as_bytes(),
            );
        }
        if let Some(locale) = &self.locale {
            hasher.update(format!("locale={};", locale.as_str()).as_bytes());
        }
        let flags = self.platform_types;
        hasher.update(
            format!(
                "platform={}{}{}{};",
                u8::from(flags.include_stationary),
                u8::from(flags.include_mobile),
                u8::from(flags.include_insitu),
                u8::from(flags.include_remote)
            )
            .as_bytes(),
        );
        for dataset_type in &self.dataset_types {
            hasher.update(format!("dataset={dataset_type};").as_bytes());
        }
        if let Some(result_time) = self.result_time {
            hasher.update(format!("result={};", format_instant(result_time)).as_bytes());
        }
        hasher.update(format!("parent={};", self.complex_parent).as_bytes());
        if let Some(term) = &self.search_term {
            hasher.update(format!("q={term};").as_bytes());
        }

        let digest_hex = format!("{:x}", hasher.finalize());
        format!("spec_{}", &digest_hex[..16])
    }
}

/// # Errors
/// Returns [`QueryError::InvalidParameter`] when the value is not RFC 3339.
pub fn parse_instant(value: &str) -> Result<OffsetDateTime, QueryError> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
        .map(|instant| instant.to_offset(UtcOffset::UTC))
        .map_err(|err| QueryError::InvalidParameter(format!("invalid instant `{value}`: {err}")))
}

#[must_use]
pub fn format_instant(instant: OffsetDateTime) -> String {
    instant
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_else(|_| instant.unix_timestamp().to_string())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, QueryError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(QueryError::InvalidParameter(format!("{key} must be true or false: {value}"))),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|part| !part.is_empty())
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
