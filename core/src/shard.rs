//! Shard and day identifiers.
//!
//! A shard id is `yyyyMMdd_N`; a bare `yyyyMMdd` stands for every shard of
//! that day. Ids are compared as plain strings.

use chrono::NaiveDate;

pub const DAY_FORMAT: &str = "%Y%m%d";

pub fn parse_day(day: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(day, DAY_FORMAT)
}

pub fn format_day(date: NaiveDate) -> String {
    date.format(DAY_FORMAT).to_string()
}

/// Every day in `[begin, end]`, formatted.
pub fn days_between(begin: NaiveDate, end: NaiveDate) -> impl Iterator<Item = String> {
    begin
        .iter_days()
        .take_while(move |day| *day <= end)
        .map(format_day)
}

/// Date of the given 1-based day of `year`.
pub fn day_of_year(year: i32, ordinal: u32) -> Option<NaiveDate> {
    NaiveDate::from_yo_opt(year, ordinal)
}

pub fn is_day(id: &str) -> bool {
    !id.contains('_')
}

/// Day portion of a shard id (the id itself for a day).
pub fn day_of(id: &str) -> &str {
    id.split_once('_').map(|(day, _)| day).unwrap_or(id)
}

/// True when `outer` is a day and `inner` is one of its shards.
pub fn covers(outer: &str, inner: &str) -> bool {
    is_day(outer)
        && inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with('_'))
}

/// True when `id` sorts before `target` and does not contain it, i.e. a
/// stream positioned at `id` must move on to reach `target`.
pub fn precedes(id: &str, target: &str) -> bool {
    id < target && !covers(id, target)
}
