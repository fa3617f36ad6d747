//! Core domain model for ApplyLog: application records, their closed
//! enumerations, write payloads and the stats wire shape.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "applog-core";

/// Pipeline stage of an application.
///
/// Unrecognized wire values are kept verbatim in `Other` so they can still be
/// counted and displayed instead of failing the whole payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    Applied,
    Test,
    Interview,
    Offer,
    Rejected,
    Withdrawn,
    Other(String),
}

impl Status {
    pub const KNOWN: [Status; 6] = [
        Status::Applied,
        Status::Test,
        Status::Interview,
        Status::Offer,
        Status::Rejected,
        Status::Withdrawn,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Status::Applied => "applied",
            Status::Test => "test",
            Status::Interview => "interview",
            Status::Offer => "offer",
            Status::Rejected => "rejected",
            Status::Withdrawn => "withdrawn",
            Status::Other(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Status::Other(_))
    }

    pub fn label(&self) -> String {
        title_case(self.as_str())
    }
}

impl From<String> for Status {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "applied" => Status::Applied,
            "test" => Status::Test,
            "interview" => Status::Interview,
            "offer" => Status::Offer,
            "rejected" => Status::Rejected,
            "withdrawn" => Status::Withdrawn,
            _ => Status::Other(raw),
        }
    }
}

impl From<&str> for Status {
    fn from(raw: &str) -> Self {
        Status::from(raw.to_string())
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        match status {
            Status::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the opportunity came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Campus,
    OffCampus,
    Hackathon,
    Other(String),
}

impl Category {
    pub const KNOWN: [Category; 3] = [Category::Campus, Category::OffCampus, Category::Hackathon];

    pub fn as_str(&self) -> &str {
        match self {
            Category::Campus => "campus",
            Category::OffCampus => "off_campus",
            Category::Hackathon => "hackathon",
            Category::Other(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Category::Other(_))
    }

    pub fn label(&self) -> String {
        title_case(self.as_str())
    }
}

impl From<String> for Category {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "campus" => Category::Campus,
            "off_campus" => Category::OffCampus,
            "hackathon" => Category::Hackathon,
            _ => Category::Other(raw),
        }
    }
}

impl From<&str> for Category {
    fn from(raw: &str) -> Self {
        Category::from(raw.to_string())
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        match category {
            Category::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn title_case(raw: &str) -> String {
    raw.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One tracked job application as served by the record API.
///
/// `date_applied` and `last_updated` keep the literal stored text; use
/// [`ApplicationRecord::applied_on`] and [`ApplicationRecord::last_touched`]
/// for parsed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireRecord")]
pub struct ApplicationRecord {
    pub id: String,
    pub company_name: String,
    pub role: String,
    pub category: Category,
    pub status: Status,
    pub date_applied: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important_dates: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<BTreeMap<String, String>>,
}

/// Record as it arrives on the wire. The backend keys records by `_id`;
/// echoes of our own serialization carry `id`. When both are present `_id` wins.
#[derive(Deserialize)]
struct WireRecord {
    #[serde(default, rename = "_id")]
    mongo_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    company_name: String,
    role: String,
    category: Category,
    status: Status,
    #[serde(default, deserialize_with = "null_as_empty")]
    date_applied: String,
    #[serde(default)]
    last_updated: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    important_dates: Option<BTreeMap<String, String>>,
    #[serde(default)]
    links: Option<BTreeMap<String, String>>,
}

impl TryFrom<WireRecord> for ApplicationRecord {
    type Error = PayloadError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let id = wire.mongo_id.or(wire.id).ok_or(PayloadError::MissingId)?;
        Ok(Self {
            id,
            company_name: wire.company_name,
            role: wire.role,
            category: wire.category,
            status: wire.status,
            date_applied: wire.date_applied,
            last_updated: wire.last_updated,
            notes: wire.notes,
            important_dates: wire.important_dates,
            links: wire.links,
        })
    }
}

impl ApplicationRecord {
    pub fn applied_on(&self) -> Option<NaiveDate> {
        parse_calendar_day(&self.date_applied)
    }

    /// `date_applied` as an instant; a bare date is midnight UTC.
    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.date_applied)
    }

    pub fn last_touched(&self) -> Option<DateTime<Utc>> {
        self.last_updated.as_deref().and_then(parse_timestamp)
    }

    pub fn has_notes(&self) -> bool {
        self.notes.as_deref().is_some_and(|n| !n.trim().is_empty())
    }

    pub fn has_important_dates(&self) -> bool {
        self.important_dates.as_ref().is_some_and(|m| !m.is_empty())
    }

    pub fn has_links(&self) -> bool {
        self.links.as_ref().is_some_and(|m| !m.is_empty())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parses a stored date into its UTC calendar day.
///
/// Accepts `YYYY-MM-DD`, RFC 3339 and naive ISO datetimes. Returns `None` for
/// anything else, including the empty string.
pub fn parse_calendar_day(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(day);
    }
    parse_timestamp(raw).map(|ts| ts.date_naive())
}

/// Parses a stored timestamp. Naive values are read as UTC; a bare date is
/// midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("invalid date `{value}` for {field}; expected YYYY-MM-DD")]
    InvalidDate { field: String, value: String },
    #[error("record carries neither `_id` nor `id`")]
    MissingId,
}

/// Create payload for `POST /applications/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewApplication {
    pub company_name: String,
    pub role: String,
    pub category: Category,
    pub status: Status,
    #[serde(default)]
    pub date_applied: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important_dates: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl NewApplication {
    /// Trims text fields, fills a blank `date_applied` with `today` and
    /// checks the fields the record API requires.
    pub fn prepare(mut self, today: NaiveDate) -> Result<Self, PayloadError> {
        self.company_name = self.company_name.trim().to_string();
        self.role = self.role.trim().to_string();
        if self.company_name.is_empty() {
            return Err(PayloadError::EmptyField("company_name"));
        }
        if self.role.is_empty() {
            return Err(PayloadError::EmptyField("role"));
        }

        let date = self.date_applied.trim();
        self.date_applied = if date.is_empty() {
            today.format("%Y-%m-%d").to_string()
        } else {
            date.to_string()
        };
        check_date("date_applied", &self.date_applied)?;

        self.important_dates = self.important_dates.and_then(labeled_map);
        self.links = self.links.and_then(labeled_map);
        if let Some(dates) = &self.important_dates {
            for (label, value) in dates {
                check_date(label, value)?;
            }
        }
        self.notes = self.notes.and_then(non_blank);
        Ok(self)
    }
}

/// Partial update payload for `PUT /applications/{id}`. Absent fields are
/// never serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_applied: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important_dates: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ApplicationPatch {
    pub fn is_empty(&self) -> bool {
        self.company_name.is_none()
            && self.role.is_none()
            && self.category.is_none()
            && self.status.is_none()
            && self.date_applied.is_none()
            && self.important_dates.is_none()
            && self.links.is_none()
            && self.notes.is_none()
    }

    /// Drops blank strings and empty maps so only real changes are sent.
    pub fn normalized(self) -> Result<Self, PayloadError> {
        let patch = Self {
            company_name: self.company_name.and_then(non_blank),
            role: self.role.and_then(non_blank),
            category: self.category,
            status: self.status,
            date_applied: self.date_applied.and_then(non_blank),
            important_dates: self.important_dates.and_then(labeled_map),
            links: self.links.and_then(labeled_map),
            notes: self.notes.and_then(non_blank),
        };
        if let Some(date) = &patch.date_applied {
            check_date("date_applied", date)?;
        }
        Ok(patch)
    }
}

/// Builds a label -> value map from form rows: both sides are trimmed, rows
/// with a blank side are dropped and an empty result is `None`.
pub fn labeled_map<I, K, V>(rows: I) -> Option<BTreeMap<String, String>>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let map = rows
        .into_iter()
        .filter_map(|(label, value)| {
            let label = label.as_ref().trim();
            let value = value.as_ref().trim();
            (!label.is_empty() && !value.is_empty()).then(|| (label.to_string(), value.to_string()))
        })
        .collect::<BTreeMap<_, _>>();
    (!map.is_empty()).then_some(map)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn check_date(field: &str, value: &str) -> Result<(), PayloadError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| PayloadError::InvalidDate {
            field: field.to_string(),
            value: value.to_string(),
        })
}

/// Body of `GET /applications/stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(default)]
    pub counts: Vec<GroupCount>,
}

/// One row of the server-side `(category, status)` aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCount {
    #[serde(rename = "_id")]
    pub key: GroupKey,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKey {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}
