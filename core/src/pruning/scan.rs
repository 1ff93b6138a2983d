//! Bitmap index scans for one day or one year.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use chrono::NaiveDate;

use crate::bitmap::{BitSetIndexEntry, ShardBitmap};
use crate::query::Node;
use crate::shard::{day_of_year, format_day};
use crate::store::layout::{bitmap_index_row, parse_bitmap_index_row};
use crate::store::{Authorizations, Key, Range, Store, StoreResult};

/// Indexed equality terms of a query, value -> fields.
pub type Terms = BTreeMap<String, BTreeSet<String>>;

fn term_key(field: &str, value: &str) -> String {
    Node::equals(field, value).to_string()
}

/// Rendered form of every term, as used for bitmap term keys.
pub fn wanted_terms(terms: &Terms) -> std::collections::HashSet<String> {
    terms
        .iter()
        .flat_map(|(value, fields)| fields.iter().map(move |field| term_key(field, value)))
        .collect()
}

/// Where to resume after an unwanted key: the next wanted field of the same
/// value, else the first field of the next wanted value.
fn next_wanted(terms: &Terms, period: &str, value: &str, field: &str) -> Option<Key> {
    if let Some(fields) = terms.get(value)
        && let Some(next_field) = fields
            .range::<str, _>((Bound::Excluded(field), Bound::Unbounded))
            .next()
    {
        return Some(Key::new(bitmap_index_row(period, value), next_field.as_str(), ""));
    }
    let (next_value, fields) = terms
        .range::<str, _>((Bound::Excluded(value), Bound::Unbounded))
        .next()?;
    let first_field = fields.iter().next()?;
    Some(Key::new(bitmap_index_row(period, next_value), first_field.as_str(), ""))
}

/// Scans the day index for `day`, visiting only the wanted (value, field)
/// pairs. `None` when the day holds none of them.
pub fn scan_day(
    store: &dyn Store,
    table: &str,
    auths: &Authorizations,
    day: &str,
    terms: &Terms,
) -> StoreResult<Option<BitSetIndexEntry>> {
    let Some((first_value, first_fields)) = terms.iter().next() else {
        return Ok(None);
    };
    let Some(first_field) = first_fields.iter().next() else {
        return Ok(None);
    };

    let mut scanner = store.open_scanner(table, auths)?;
    scanner.set_range(Range::prefix_from(
        Key::new(bitmap_index_row(day, first_value), first_field.as_str(), ""),
        &bitmap_index_row(day, ""),
    ));

    let mut entry = BitSetIndexEntry::new(day);
    while let Some((key, bytes)) = scanner.next_entry()? {
        let Some((_, value)) = parse_bitmap_index_row(&key.row) else {
            continue;
        };
        if terms.get(value).is_some_and(|fields| fields.contains(&key.family)) {
            entry.insert(term_key(&key.family, value), ShardBitmap::from_bytes(&bytes));
            continue;
        }
        match next_wanted(terms, day, value, &key.family) {
            Some(target) => scanner.seek(&target)?,
            None => break,
        }
    }
    Ok((!entry.is_empty()).then_some(entry))
}

/// Scans the year index for `year` in one batch. Bits of the result are
/// 1-based days of the year.
pub fn scan_year(
    store: &dyn Store,
    table: &str,
    auths: &Authorizations,
    year: i32,
    terms: &Terms,
) -> StoreResult<Option<BitSetIndexEntry>> {
    let period = year.to_string();
    let ranges: Vec<Range> = terms
        .keys()
        .map(|value| Range::exact_row(&bitmap_index_row(&period, value)))
        .collect();
    let families: Vec<String> = terms
        .values()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut entry = BitSetIndexEntry::new(period.as_str());
    for (key, bytes) in store.scan_ranges(table, auths, &ranges, &families)? {
        let Some((_, value)) = parse_bitmap_index_row(&key.row) else {
            continue;
        };
        if terms.get(value).is_some_and(|fields| fields.contains(&key.family)) {
            entry.insert(term_key(&key.family, value), ShardBitmap::from_bytes(&bytes));
        }
    }
    Ok((!entry.is_empty()).then_some(entry))
}

/// Days flagged in a year entry that fall inside `[begin, end]`, in order.
pub fn days_in_year_entry(year: i32, entry: &BitSetIndexEntry, begin: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut days = ShardBitmap::new();
    for bits in entry.terms().values() {
        days.union_with(bits);
    }
    days.iter()
        .filter_map(|ordinal| day_of_year(year, u32::try_from(ordinal).ok()?))
        .filter(|date| *date >= begin && *date <= end)
        .map(format_day)
        .collect()
}
