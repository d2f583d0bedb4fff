//* Pure parsing and ordering logic over ZFS snapshot names. No I/O here;
//* SSA (src/ssa.rs) is the only caller that touches the network.
use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;

static HOUR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".*_(\d{4}-\d{2}-\d{2})_(\d{2})").unwrap());
static DAY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r".*_(\d{4}-\d{2}-\d{2})").unwrap());
static MONTH_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r".*_(\d{4}-\d{2})").unwrap());

/// A ZFS snapshot as seen from the directory side: an opaque name plus a
/// best-effort timestamp parsed from it (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SnapshotDescriptor {
    pub name: String,
    pub timestamp: Option<NaiveDateTime>,
}

impl SnapshotDescriptor {
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let timestamp = parse_snapshot_timestamp(&name);
        SnapshotDescriptor { name, timestamp }
    }
}

/// Try, in order, the hour / day / month suffix patterns from spec §3.
/// First match wins; an unparseable captured date falls through to the
/// next pattern rather than failing outright.
pub fn parse_snapshot_timestamp(name: &str) -> Option<NaiveDateTime> {
    if let Some(caps) = HOUR_PATTERN.captures(name) {
        let date = caps.get(1)?.as_str();
        let hour: u32 = caps.get(2)?.as_str().parse().ok()?;
        if let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            if let Some(dt) = date.and_hms_opt(hour, 0, 0) {
                return Some(dt);
            }
        }
    }

    if let Some(caps) = DAY_PATTERN.captures(name) {
        let date = caps.get(1)?.as_str();
        if let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    if let Some(caps) = MONTH_PATTERN.captures(name) {
        let year_month = caps.get(1)?.as_str();
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{year_month}-01"), "%Y-%m-%d") {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    None
}

/// Order for the snapshot menu: present timestamps first, newest first;
/// timestamp-less entries last, in unspecified relative order (spec §4.2).
pub fn sort_snapshots(descriptors: &mut [SnapshotDescriptor]) {
    descriptors.sort_by(|a, b| match (&a.timestamp, &b.timestamp) {
        (Some(t1), Some(t2)) => t2.cmp(t1),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
