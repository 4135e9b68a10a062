//! Half-open validity ranges over integer, numeric, date and timestamp domains.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::RangeError;

// ── Scalar domain ──

/// Element type of an era's range, as reported by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSubtype {
    Integer,
    Numeric,
    Date,
    Timestamp,
}

impl RangeSubtype {
    /// Map a PostgreSQL type name onto a supported subtype.
    pub fn from_type_name(name: &str) -> Result<Self, RangeError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" => {
                Ok(Self::Integer)
            }
            "numeric" | "decimal" => Ok(Self::Numeric),
            "date" => Ok(Self::Date),
            "timestamp" | "timestamp without time zone" | "timestamptz"
            | "timestamp with time zone" => Ok(Self::Timestamp),
            other => Err(RangeError::UnsupportedSubtype(other.to_string())),
        }
    }

    /// Discrete subtypes have a successor/predecessor, so an inclusive end
    /// column can be derived from the exclusive one.
    pub fn is_discrete(&self) -> bool {
        matches!(self, Self::Integer | Self::Date)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Numeric => "numeric",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemporalValue {
    Integer(i64),
    Numeric(Decimal),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl TemporalValue {
    pub fn subtype(&self) -> RangeSubtype {
        match self {
            Self::Integer(_) => RangeSubtype::Integer,
            Self::Numeric(_) => RangeSubtype::Numeric,
            Self::Date(_) => RangeSubtype::Date,
            Self::Timestamp(_) => RangeSubtype::Timestamp,
        }
    }

    fn parse_text(text: &str, subtype: Option<RangeSubtype>) -> Result<Self, RangeError> {
        let text = text.trim();
        let parsed = match subtype {
            Some(RangeSubtype::Integer) => text.parse::<i64>().ok().map(Self::Integer),
            Some(RangeSubtype::Numeric) => parse_decimal(text).map(Self::Numeric),
            Some(RangeSubtype::Date) => parse_date(text).map(Self::Date),
            Some(RangeSubtype::Timestamp) => parse_timestamp(text)
                .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
                .map(Self::Timestamp),
            None => text
                .parse::<i64>()
                .ok()
                .map(Self::Integer)
                .or_else(|| parse_date(text).map(Self::Date))
                .or_else(|| parse_timestamp(text).map(Self::Timestamp))
                .or_else(|| parse_decimal(text).map(Self::Numeric)),
        };
        parsed.ok_or_else(|| RangeError::InvalidBound(text.to_string()))
    }

    fn step(&self, forward: bool) -> Option<Self> {
        match self {
            Self::Integer(i) => {
                let next = if forward { i.checked_add(1) } else { i.checked_sub(1) };
                next.map(Self::Integer)
            }
            Self::Date(d) => {
                let next = if forward { d.succ_opt() } else { d.pred_opt() };
                next.map(Self::Date)
            }
            Self::Numeric(_) | Self::Timestamp(_) => None,
        }
    }
}

impl fmt::Display for TemporalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

/// Numeric values are normalised so `1.50` and `1.5` are the same bound.
fn parse_decimal(text: &str) -> Option<Decimal> {
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
        .map(|d| d.normalize())
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    const NAIVE: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    const ZONED: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    for fmt in ZONED {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc).naive_utc());
        }
    }
    NAIVE
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

// ── Bounds ──

/// A range endpoint. The derived ordering puts `NegInfinity` before every
/// finite value and `Infinity` after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bound {
    NegInfinity,
    Finite(TemporalValue),
    Infinity,
}

impl Bound {
    pub fn integer(i: i64) -> Self {
        Self::Finite(TemporalValue::Integer(i))
    }

    pub fn numeric(n: Decimal) -> Self {
        Self::Finite(TemporalValue::Numeric(n.normalize()))
    }

    /// Build a date bound, rejecting impossible calendar dates.
    pub fn date(y: i32, m: u32, d: u32) -> Result<Self, RangeError> {
        NaiveDate::from_ymd_opt(y, m, d)
            .map(|d| Self::Finite(TemporalValue::Date(d)))
            .ok_or_else(|| RangeError::InvalidBound(format!("{y:04}-{m:02}-{d:02}")))
    }

    pub fn timestamp(ts: NaiveDateTime) -> Self {
        Self::Finite(TemporalValue::Timestamp(ts))
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, Self::Finite(_))
    }

    pub fn subtype(&self) -> Option<RangeSubtype> {
        match self {
            Self::Finite(v) => Some(v.subtype()),
            _ => None,
        }
    }

    /// Parse a bound from text (`infinity`, `-infinity`, or a scalar literal).
    pub fn parse(text: &str, subtype: Option<RangeSubtype>) -> Result<Self, RangeError> {
        match text.trim().trim_matches('"') {
            "infinity" | "+infinity" => Ok(Self::Infinity),
            "-infinity" => Ok(Self::NegInfinity),
            other => TemporalValue::parse_text(other, subtype).map(Self::Finite),
        }
    }

    /// Read a bound from a JSON cell. NULL yields `Ok(None)`.
    pub fn from_json(value: &Value, subtype: Option<RangeSubtype>) -> Result<Option<Self>, RangeError> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => {
                let text = n.to_string();
                match (subtype, n.as_i64()) {
                    (None | Some(RangeSubtype::Integer), Some(i)) => Ok(Some(Self::integer(i))),
                    (None | Some(RangeSubtype::Numeric), _) => parse_decimal(&text)
                        .map(|d| Some(Self::Finite(TemporalValue::Numeric(d))))
                        .ok_or(RangeError::InvalidBound(text)),
                    (Some(RangeSubtype::Integer), None) => Err(RangeError::InvalidBound(text)),
                    (Some(other), _) => Err(RangeError::SubtypeMismatch {
                        expected: other,
                        value: text,
                    }),
                }
            }
            Value::String(s) => Self::parse(s, subtype).map(Some),
            other => Err(RangeError::InvalidBound(other.to_string())),
        }
    }

    /// JSON cell representation: integers and numerics as numbers, everything
    /// else as text.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Finite(TemporalValue::Integer(i)) => Value::from(*i),
            Self::Finite(TemporalValue::Numeric(n)) => n
                .to_string()
                .parse::<serde_json::Number>()
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(n.to_string())),
            other => Value::String(other.to_string()),
        }
    }

    /// Next value of a discrete domain. Infinite bounds map to themselves.
    pub fn succ(&self) -> Option<Self> {
        match self {
            Self::Finite(v) => v.step(true).map(Self::Finite),
            other => Some(*other),
        }
    }

    /// Previous value of a discrete domain. Infinite bounds map to themselves.
    pub fn pred(&self) -> Option<Self> {
        match self {
            Self::Finite(v) => v.step(false).map(Self::Finite),
            other => Some(*other),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegInfinity => f.write_str("-infinity"),
            Self::Infinity => f.write_str("infinity"),
            Self::Finite(v) => v.fmt(f),
        }
    }
}

impl Serialize for Bound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Bound::from_json(&value, None)
            .map_err(serde::de::Error::custom)?
            .ok_or_else(|| serde::de::Error::custom("range bound cannot be null"))
    }
}

// ── Ranges ──

/// A non-empty half-open range `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange", into = "RawRange")]
pub struct ValidRange {
    lower: Bound,
    upper: Bound,
}

#[derive(Serialize, Deserialize)]
struct RawRange {
    lower: Bound,
    upper: Bound,
}

impl TryFrom<RawRange> for ValidRange {
    type Error = RangeError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        ValidRange::new(raw.lower, raw.upper)
    }
}

impl From<ValidRange> for RawRange {
    fn from(r: ValidRange) -> Self {
        RawRange { lower: r.lower, upper: r.upper }
    }
}

impl ValidRange {
    pub fn new(lower: Bound, upper: Bound) -> Result<Self, RangeError> {
        if let (Some(a), Some(b)) = (lower.subtype(), upper.subtype()) {
            if a != b {
                return Err(RangeError::MixedSubtypes { lower, upper });
            }
        }
        if lower >= upper || lower == Bound::Infinity || upper == Bound::NegInfinity {
            return Err(RangeError::Empty { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    pub fn lower(&self) -> &Bound {
        &self.lower
    }

    pub fn upper(&self) -> &Bound {
        &self.upper
    }

    pub fn contains(&self, other: &ValidRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    pub fn overlaps(&self, other: &ValidRange) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }

    /// `self.upper == other.lower`: half-open adjacency.
    pub fn meets(&self, other: &ValidRange) -> bool {
        self.upper == other.lower
    }

    pub fn intersection(&self, other: &ValidRange) -> Option<ValidRange> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        ValidRange::new(lower, upper).ok()
    }

    /// Inclusive end value for discrete domains.
    pub fn inclusive_end(&self) -> Option<Bound> {
        self.upper.pred()
    }

    /// Parse range text in PostgreSQL's output format, e.g. `[2024-01-01,2024-02-01)`.
    /// Inclusive upper / exclusive lower brackets are normalised to half-open
    /// form, which needs a discrete subtype.
    pub fn parse(text: &str, subtype: Option<RangeSubtype>) -> Result<Self, RangeError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("empty") {
            return Err(RangeError::Malformed(text.to_string()));
        }
        let malformed = || RangeError::Malformed(text.to_string());
        let open = text.chars().next().ok_or_else(malformed)?;
        let close = text.chars().last().ok_or_else(malformed)?;
        if !matches!(open, '[' | '(') || !matches!(close, ')' | ']') || text.len() < 3 {
            return Err(malformed());
        }
        let inner = &text[1..text.len() - 1];
        let (lo, hi) = inner.split_once(',').ok_or_else(malformed)?;
        let parse_side = |s: &str, missing: Bound| -> Result<Bound, RangeError> {
            if s.trim().is_empty() {
                Ok(missing)
            } else {
                Bound::parse(s, subtype)
            }
        };
        let mut lower = parse_side(lo, Bound::NegInfinity)?;
        let mut upper = parse_side(hi, Bound::Infinity)?;
        if open == '(' && lower.is_finite() {
            lower = lower.succ().ok_or_else(malformed)?;
        }
        if close == ']' && upper.is_finite() {
            upper = upper.succ().ok_or_else(malformed)?;
        }
        ValidRange::new(lower, upper)
    }
}

impl fmt::Display for ValidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn side(b: &Bound) -> String {
            let s = b.to_string();
            if s.contains(' ') || s.contains(',') {
                format!("\"{s}\"")
            } else {
                s
            }
        }
        write!(f, "[{},{})", side(&self.lower), side(&self.upper))
    }
}

/// Order ranges by lower bound, then upper.
pub fn cmp_by_lower(a: &ValidRange, b: &ValidRange) -> Ordering {
    a.lower.cmp(&b.lower).then_with(|| a.upper.cmp(&b.upper))
}
