//! Archive filters.
//!
//! Filters are supplied as a JSON expression over the fields `date` (the
//! timestamp embedded in an archive name) and `region`:
//!
//! `[{"field": "date", "match": ">=", "value": "2019-01-01"}]`
//!
//! A single object instead of an array is also accepted.

use chrono::NaiveDateTime;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown filter field '{0}'; available fields are 'date' and 'region'")]
    UnknownField(String),
    #[error("unknown match '{0}'")]
    UnknownMatch(String),
    #[error("the 'date' field does not support match '{0}'")]
    DateMatch(String),
    #[error("wrong filter format: {0}")]
    Format(String),
    #[error("bad date value '{0}': expected '%Y-%m-%d' or '%Y-%m-%d %H:%M:%S'")]
    BadDate(String),
}

/// Comparison operator of one filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Like,
    NotLike,
    Between,
    NotBetween,
    In,
    NotIn,
    Begin,
    End,
}

impl MatchOp {
    fn parse(s: &str) -> Result<Self, FilterError> {
        Ok(match s {
            "==" | "=" | "eq" => MatchOp::Eq,
            "!=" => MatchOp::Ne,
            ">=" => MatchOp::Ge,
            "<=" => MatchOp::Le,
            ">" => MatchOp::Gt,
            "<" => MatchOp::Lt,
            "like" => MatchOp::Like,
            "not like" => MatchOp::NotLike,
            "between" => MatchOp::Between,
            "not between" => MatchOp::NotBetween,
            "in" => MatchOp::In,
            "not in" => MatchOp::NotIn,
            "begin" => MatchOp::Begin,
            "end" => MatchOp::End,
            other => return Err(FilterError::UnknownMatch(other.to_string())),
        })
    }

    /// Negative matches express "everything except"; a positive match names
    /// the wanted values directly.
    pub fn is_positive(self) -> bool {
        !matches!(
            self,
            MatchOp::Ne | MatchOp::NotLike | MatchOp::NotBetween | MatchOp::NotIn
        )
    }

    fn needs_list(self) -> bool {
        matches!(
            self,
            MatchOp::Between | MatchOp::NotBetween | MatchOp::In | MatchOp::NotIn
        )
    }

    fn is_like_class(self) -> bool {
        matches!(
            self,
            MatchOp::Like | MatchOp::NotLike | MatchOp::Begin | MatchOp::End
        )
    }
}

#[derive(Debug, Clone)]
struct RegionRule {
    op: MatchOp,
    values: Vec<String>,
    ignore_case: bool,
}

impl RegionRule {
    fn matches(&self, region: &str) -> bool {
        let normalized = if self.ignore_case {
            region.to_lowercase()
        } else {
            region.to_string()
        };
        let region = normalized.as_str();
        let first = self.values.first().map(String::as_str).unwrap_or("");
        match self.op {
            MatchOp::Eq => region == first,
            MatchOp::Ne => region != first,
            MatchOp::Ge => region >= first,
            MatchOp::Le => region <= first,
            MatchOp::Gt => region > first,
            MatchOp::Lt => region < first,
            MatchOp::Like => region.contains(first),
            MatchOp::NotLike => !region.contains(first),
            MatchOp::Begin => region.starts_with(first),
            MatchOp::End => region.ends_with(first),
            MatchOp::In => self.values.iter().any(|v| v.as_str() == region),
            MatchOp::NotIn => !self.values.iter().any(|v| v.as_str() == region),
            MatchOp::Between => region >= first && region <= self.values[1].as_str(),
            MatchOp::NotBetween => !(region >= first && region <= self.values[1].as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct DateRule {
    op: MatchOp,
    values: Vec<NaiveDateTime>,
}

impl DateRule {
    fn matches(&self, date: NaiveDateTime) -> bool {
        match self.op {
            MatchOp::Eq => date == self.values[0],
            MatchOp::Ne => date != self.values[0],
            MatchOp::Ge => date >= self.values[0],
            MatchOp::Le => date <= self.values[0],
            MatchOp::Gt => date > self.values[0],
            MatchOp::Lt => date < self.values[0],
            MatchOp::In => self.values.contains(&date),
            MatchOp::NotIn => !self.values.contains(&date),
            MatchOp::Between => date >= self.values[0] && date <= self.values[1],
            MatchOp::NotBetween => !(date >= self.values[0] && date <= self.values[1]),
            // Rejected at parse time.
            MatchOp::Like | MatchOp::NotLike | MatchOp::Begin | MatchOp::End => false,
        }
    }
}

/// Fully configured archive filters. The crawl loop only asks two questions:
/// "should this region be skipped" and "should this archive date be skipped".
#[derive(Debug, Clone, Default)]
pub struct Filters {
    date: Option<DateRule>,
    region: Option<RegionRule>,
}

impl Filters {
    /// No filtering; everything is processed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a JSON filter expression: a single rule object or an array of
    /// rule objects with `field`, `value` and optional `match` / `ignorecase`.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let parsed: Value = serde_json::from_str(input)?;
        let mut filters = Self::default();
        match parsed {
            Value::Array(rules) => {
                for rule in rules {
                    filters.read_rule(&rule)?;
                }
            }
            rule @ Value::Object(_) => filters.read_rule(&rule)?,
            other => {
                return Err(FilterError::Format(format!(
                    "expected an object or an array of objects, got {other}"
                )))
            }
        }
        Ok(filters)
    }

    fn read_rule(&mut self, rule: &Value) -> Result<(), FilterError> {
        let obj = rule
            .as_object()
            .ok_or_else(|| FilterError::Format(format!("filter rule must be an object, got {rule}")))?;
        let field = obj
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| FilterError::Format("missing 'field'".to_string()))?
            .to_lowercase();
        let value = obj
            .get("value")
            .ok_or_else(|| FilterError::Format("missing 'value'".to_string()))?;
        let op = match obj.get("match").and_then(Value::as_str) {
            Some(m) => MatchOp::parse(&m.to_lowercase())?,
            None => MatchOp::Eq,
        };
        let ignore_case = ["ignorecase", "ignore_case", "ignoreCase"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_bool))
            .unwrap_or(false);

        match field.as_str() {
            "date" => {
                if op.is_like_class() {
                    return Err(FilterError::DateMatch(format!("{op:?}").to_lowercase()));
                }
                self.date = Some(DateRule {
                    op,
                    values: parse_date_values(value, op)?,
                });
            }
            "region" => {
                let mut values = parse_string_values(value, op)?;
                if ignore_case {
                    for v in &mut values {
                        *v = v.to_lowercase();
                    }
                }
                self.region = Some(RegionRule {
                    op,
                    values,
                    ignore_case,
                });
            }
            other => return Err(FilterError::UnknownField(other.to_string())),
        }
        Ok(())
    }

    pub fn has_date_filter(&self) -> bool {
        self.date.is_some()
    }

    pub fn has_region_filter(&self) -> bool {
        self.region.is_some()
    }

    pub fn is_positive_date_match(&self) -> bool {
        self.date.as_ref().is_some_and(|r| r.op.is_positive())
    }

    pub fn is_positive_region_match(&self) -> bool {
        self.region.as_ref().is_some_and(|r| r.op.is_positive())
    }

    /// Whether the date filter matches the given date. `false` without a
    /// configured date filter.
    pub fn matches_date(&self, date: NaiveDateTime) -> bool {
        self.date.as_ref().is_some_and(|r| r.matches(date))
    }

    /// Whether the region filter matches the given region. `false` without a
    /// configured region filter.
    pub fn matches_region(&self, region: &str) -> bool {
        self.region.as_ref().is_some_and(|r| r.matches(region))
    }

    /// An archive is skipped when a date filter exists and rejects its date.
    pub fn skip_date(&self, date: NaiveDateTime) -> bool {
        self.has_date_filter() && !self.matches_date(date)
    }

    /// A region is skipped when a region filter exists and rejects it.
    pub fn skip_region(&self, region: &str) -> bool {
        self.has_region_filter() && !self.matches_region(region)
    }
}

fn parse_string_values(value: &Value, op: MatchOp) -> Result<Vec<String>, FilterError> {
    if op.needs_list() {
        let list = value.as_array().ok_or_else(|| {
            FilterError::Format(format!("match {op:?} requires a list value, got {value}"))
        })?;
        if matches!(op, MatchOp::Between | MatchOp::NotBetween) && list.len() != 2 {
            return Err(FilterError::Format(format!(
                "match {op:?} requires exactly 2 values, got {}",
                list.len()
            )));
        }
        list.iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| FilterError::Format(format!("expected a string, got {v}")))
            })
            .collect()
    } else {
        let single = value
            .as_str()
            .ok_or_else(|| FilterError::Format(format!("expected a string value, got {value}")))?;
        Ok(vec![single.to_string()])
    }
}

fn parse_date_values(value: &Value, op: MatchOp) -> Result<Vec<NaiveDateTime>, FilterError> {
    let raw = parse_string_values(value, op)?;
    raw.iter().map(|s| parse_date(s)).collect()
}

/// Dates come as either `%Y-%m-%d %H:%M:%S` or `%Y-%m-%d` (midnight).
fn parse_date(s: &str) -> Result<NaiveDateTime, FilterError> {
    match s.split_whitespace().count() {
        2 => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"),
        1 => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| d.and_time(chrono::NaiveTime::MIN)),
        _ => return Err(FilterError::BadDate(s.to_string())),
    }
    .map_err(|_| FilterError::BadDate(s.to_string()))
}
