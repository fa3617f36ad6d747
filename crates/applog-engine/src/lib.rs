//! Aggregation engine over application record snapshots.
//!
//! Every function here is a pure transformation of its arguments. Anything
//! time-relative takes `now` explicitly; nothing reads the wall clock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use applog_core::{ApplicationRecord, Category, GroupCount, Status};
use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use icu_collator::options::CollatorOptions;
use icu_collator::{Collator, CollatorPreferences};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "applog-engine";

/// Trend charts cover this many trailing days unless told otherwise.
pub const DEFAULT_TREND_DAYS: usize = 30;

/// How many records the dashboard home page lists as recent activity.
pub const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCriteriaError {
    #[error("unknown sort key `{0}` (expected date_desc, date_asc, company or status)")]
    UnknownSortKey(String),
    #[error("unknown timeframe `{0}` (expected all, 7d, 30d or 90d)")]
    UnknownTimeframe(String),
}

/// Status predicate; `"all"` (or blank) disables it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusFilter {
    #[default]
    All,
    Only(Status),
}

impl StatusFilter {
    pub fn admits(&self, status: &Status) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => wanted == status,
        }
    }
}

impl From<String> for StatusFilter {
    fn from(raw: String) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            StatusFilter::All
        } else {
            StatusFilter::Only(Status::from(raw))
        }
    }
}

impl From<StatusFilter> for String {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::All => "all".to_string(),
            StatusFilter::Only(status) => status.into(),
        }
    }
}

/// Category predicate; `"all"` (or blank) disables it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CategoryFilter {
    #[default]
    All,
    Only(Category),
}

impl CategoryFilter {
    pub fn admits(&self, category: &Category) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Only(wanted) => wanted == category,
        }
    }
}

impl From<String> for CategoryFilter {
    fn from(raw: String) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            CategoryFilter::All
        } else {
            CategoryFilter::Only(Category::from(raw))
        }
    }
}

impl From<CategoryFilter> for String {
    fn from(filter: CategoryFilter) -> Self {
        match filter {
            CategoryFilter::All => "all".to_string(),
            CategoryFilter::Only(category) => category.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Most recently applied first; unparsable dates last.
    #[default]
    DateDesc,
    DateAsc,
    /// Case-insensitive company name, ascending.
    Company,
    /// Raw status string, ascending. Not a pipeline ordering.
    Status,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::DateDesc => "date_desc",
            SortKey::DateAsc => "date_asc",
            SortKey::Company => "company",
            SortKey::Status => "status",
        }
    }
}

impl FromStr for SortKey {
    type Err = ParseCriteriaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "" | "date_desc" => Ok(SortKey::DateDesc),
            "date_asc" => Ok(SortKey::DateAsc),
            "company" => Ok(SortKey::Company),
            "status" => Ok(SortKey::Status),
            other => Err(ParseCriteriaError::UnknownSortKey(other.to_string())),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trailing window anchored at an explicit reference instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "7d")]
    Last7Days,
    #[serde(rename = "30d")]
    Last30Days,
    #[serde(rename = "90d")]
    Last90Days,
}

impl Timeframe {
    pub fn days(&self) -> Option<u64> {
        match self {
            Timeframe::All => None,
            Timeframe::Last7Days => Some(7),
            Timeframe::Last30Days => Some(30),
            Timeframe::Last90Days => Some(90),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::All => "all",
            Timeframe::Last7Days => "7d",
            Timeframe::Last30Days => "30d",
            Timeframe::Last90Days => "90d",
        }
    }
}

impl FromStr for Timeframe {
    type Err = ParseCriteriaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "" | "all" => Ok(Timeframe::All),
            "7d" => Ok(Timeframe::Last7Days),
            "30d" => Ok(Timeframe::Last30Days),
            "90d" => Ok(Timeframe::Last90Days),
            other => Err(ParseCriteriaError::UnknownTimeframe(other.to_string())),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of the list view. All active predicates are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewCriteria {
    pub search: String,
    pub status: StatusFilter,
    pub category: CategoryFilter,
    pub sort: SortKey,
}

impl ViewCriteria {
    pub fn matches(&self, record: &ApplicationRecord) -> bool {
        matches_search(record, &self.search)
            && self.status.admits(&record.status)
            && self.category.admits(&record.category)
    }
}

/// Case-insensitive substring match on company or role. Empty matches all.
pub fn matches_search(record: &ApplicationRecord, term: &str) -> bool {
    if term.is_empty() {
        return true;
    }
    let needle = term.to_lowercase();
    record.company_name.to_lowercase().contains(&needle)
        || record.role.to_lowercase().contains(&needle)
}

/// Filtered and sorted view of `records`. The input slice is left untouched.
pub fn filter_and_sort<'a>(
    records: &'a [ApplicationRecord],
    criteria: &ViewCriteria,
) -> Vec<&'a ApplicationRecord> {
    let mut view = records
        .iter()
        .filter(|record| criteria.matches(record))
        .collect::<Vec<_>>();
    sort_records(&mut view, criteria.sort);
    view
}

/// Stable sort; ties keep their input order.
pub fn sort_records(records: &mut [&ApplicationRecord], key: SortKey) {
    match key {
        // `None < Some(_)`, so unparsable dates land at the "earliest" end.
        SortKey::DateDesc => records.sort_by(|a, b| b.applied_at().cmp(&a.applied_at())),
        SortKey::DateAsc => records.sort_by(|a, b| a.applied_at().cmp(&b.applied_at())),
        SortKey::Company => sort_by_company(records),
        SortKey::Status => records.sort_by(|a, b| a.status.as_str().cmp(b.status.as_str())),
    }
}

/// Root-locale Unicode collation, so `Éclair` sorts between `Alpha` and `Zeta`.
fn sort_by_company(records: &mut [&ApplicationRecord]) {
    match Collator::try_new(CollatorPreferences::default(), CollatorOptions::default()) {
        Ok(collator) => records.sort_by(|a, b| {
            collator
                .compare(&a.company_name, &b.company_name)
                .then_with(|| a.company_name.cmp(&b.company_name))
        }),
        // Compiled collation data is linked in; this arm only keeps the order total.
        Err(_) => records.sort_by(|a, b| a.company_name.cmp(&b.company_name)),
    }
}

/// Counts and derived percentages over one record set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollup {
    pub total: usize,
    pub counts_by_status: BTreeMap<String, usize>,
    pub counts_by_category: BTreeMap<String, usize>,
    /// Interviews plus offers over total.
    pub response_rate: u32,
    pub success_rate: u32,
    pub rejection_rate: u32,
}

impl Rollup {
    fn from_counts(
        total: usize,
        counts_by_status: BTreeMap<String, usize>,
        counts_by_category: BTreeMap<String, usize>,
    ) -> Self {
        let count = |status: Status| counts_by_status.get(status.as_str()).copied().unwrap_or(0);
        let response_rate = percentage(count(Status::Interview) + count(Status::Offer), total);
        let success_rate = percentage(count(Status::Offer), total);
        let rejection_rate = percentage(count(Status::Rejected), total);
        Self {
            total,
            counts_by_status,
            counts_by_category,
            response_rate,
            success_rate,
            rejection_rate,
        }
    }

    pub fn count(&self, status: &Status) -> usize {
        self.counts_by_status.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn category_count(&self, category: &Category) -> usize {
        self.counts_by_category
            .get(category.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn share_of(&self, status: &Status) -> u32 {
        percentage(self.count(status), self.total)
    }
}

/// `round(count / total * 100)` with halves rounded up; zero when `total` is zero.
pub fn percentage(count: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let scaled = (count as u128 * 200 + total as u128) / (total as u128 * 2);
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// Status/category rollup. Unknown values are counted under their literal.
pub fn rollup<'a, I>(records: I) -> Rollup
where
    I: IntoIterator<Item = &'a ApplicationRecord>,
{
    let mut total = 0usize;
    let mut by_status = BTreeMap::<String, usize>::new();
    let mut by_category = BTreeMap::<String, usize>::new();
    for record in records {
        total += 1;
        *by_status.entry(record.status.as_str().to_string()).or_default() += 1;
        *by_category.entry(record.category.as_str().to_string()).or_default() += 1;
    }
    Rollup::from_counts(total, by_status, by_category)
}

/// Same rollup built from the server-side `(category, status)` aggregation.
/// Rows without a category only contribute to the status side.
pub fn rollup_from_group_counts(rows: &[GroupCount]) -> Rollup {
    let mut total = 0usize;
    let mut by_status = BTreeMap::<String, usize>::new();
    let mut by_category = BTreeMap::<String, usize>::new();
    for row in rows {
        let count = usize::try_from(row.count).unwrap_or(usize::MAX);
        total = total.saturating_add(count);
        *by_status.entry(row.key.status.as_str().to_string()).or_default() += count;
        if let Some(category) = &row.key.category {
            *by_category.entry(category.as_str().to_string()).or_default() += count;
        }
    }
    Rollup::from_counts(total, by_status, by_category)
}

/// Records whose `date_applied` instant lies in `[now - N * 24h, now]`.
/// A bare date counts as midnight UTC. `Timeframe::All` keeps everything,
/// unparsable dates included.
pub fn within_timeframe<'a, I>(
    records: I,
    timeframe: Timeframe,
    now: DateTime<Utc>,
) -> Vec<&'a ApplicationRecord>
where
    I: IntoIterator<Item = &'a ApplicationRecord>,
{
    let Some(days) = timeframe.days() else {
        return records.into_iter().collect();
    };
    let cutoff = i64::try_from(days)
        .ok()
        .and_then(Duration::try_days)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    records
        .into_iter()
        .filter(|record| {
            record
                .applied_at()
                .is_some_and(|at| at >= cutoff && at <= now)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: usize,
}

/// One bucket per UTC calendar day from `now - (window_days - 1)` through
/// `now`, oldest first, zero-count days included.
pub fn daily_histogram<'a, I>(records: I, now: DateTime<Utc>, window_days: usize) -> Vec<DayCount>
where
    I: IntoIterator<Item = &'a ApplicationRecord>,
{
    let mut per_day = HashMap::<NaiveDate, usize>::new();
    for day in records.into_iter().filter_map(ApplicationRecord::applied_on) {
        *per_day.entry(day).or_default() += 1;
    }

    let today = now.date_naive();
    (0..window_days as u64)
        .rev()
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .map(|date| DayCount {
            date,
            count: per_day.get(&date).copied().unwrap_or(0),
        })
        .collect()
}

/// Records sharing one literal `date_applied` value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateBucket<'a> {
    pub date: &'a str,
    pub applications: Vec<&'a ApplicationRecord>,
}

/// Groups by the literal stored date, newest bucket first (unparsable
/// buckets last), and orders each bucket by `last_updated` descending with
/// untouched records last.
pub fn group_by_date<'a, I>(records: I) -> Vec<DateBucket<'a>>
where
    I: IntoIterator<Item = &'a ApplicationRecord>,
{
    let mut grouped = BTreeMap::<&'a str, Vec<&'a ApplicationRecord>>::new();
    for record in records {
        grouped.entry(record.date_applied.as_str()).or_default().push(record);
    }

    let mut buckets = grouped
        .into_iter()
        .map(|(date, mut applications)| {
            applications.sort_by(|a, b| b.last_touched().cmp(&a.last_touched()));
            DateBucket { date, applications }
        })
        .collect::<Vec<_>>();
    buckets.sort_by(|a, b| applied_instant(b.date).cmp(&applied_instant(a.date)));
    buckets
}

fn applied_instant(raw: &str) -> Option<DateTime<Utc>> {
    applog_core::parse_timestamp(raw)
}

/// The `limit` most recently updated records; records never updated come last.
pub fn recent<'a, I>(records: I, limit: usize) -> Vec<&'a ApplicationRecord>
where
    I: IntoIterator<Item = &'a ApplicationRecord>,
{
    let mut view = records.into_iter().collect::<Vec<_>>();
    view.sort_by(|a, b| b.last_touched().cmp(&a.last_touched()));
    view.truncate(limit);
    view
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSummary {
    pub total: usize,
    pub offers: usize,
    pub interviews: usize,
}

pub fn timeline_summary<'a, I>(records: I) -> TimelineSummary
where
    I: IntoIterator<Item = &'a ApplicationRecord>,
{
    records
        .into_iter()
        .fold(TimelineSummary::default(), |mut summary, record| {
            summary.total += 1;
            match record.status {
                Status::Offer => summary.offers += 1,
                Status::Interview => summary.interviews += 1,
                _ => {}
            }
            summary
        })
}

/// Whole days between `day` (midnight UTC) and `now`, rounded up, either direction.
pub fn days_since(day: NaiveDate, now: DateTime<Utc>) -> i64 {
    let Some(midnight) = day.and_hms_opt(0, 0, 0) else {
        return 0;
    };
    let seconds = (now - midnight.and_utc()).num_seconds().abs();
    (seconds + 86_399) / 86_400
}

/// `"{h}h ago"` under a day, otherwise `"{d}d ago"`.
pub fn time_ago(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let hours = (now - ts).num_seconds().div_euclid(3_600);
    if hours < 24 {
        format!("{hours}h ago")
    } else {
        format!("{}d ago", hours / 24)
    }
}

/// `Today`, `Yesterday`, or a long date such as `Monday, March 4, 2024`.
pub fn day_label(day: NaiveDate, now: DateTime<Utc>) -> String {
    let today = now.date_naive();
    if day == today {
        "Today".to_string()
    } else if today.pred_opt() == Some(day) {
        "Yesterday".to_string()
    } else {
        day.format("%A, %B %-d, %Y").to_string()
    }
}
