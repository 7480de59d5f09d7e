//! Presence aggregation over already-fetched attendance rows.
//!
//! All counting happens in memory: a day's rows are deduplicated by student
//! id, absentees are whatever remains of the roster, and the grade chart is
//! a plain grouping of the student list. Duplicate rows per student are
//! expected (multiple check-ins per day) and must not inflate the counts.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use std::collections::{BTreeMap, HashSet};

/// Bucket label for students with no grade assigned.
pub const UNASSIGNED_GRADE: &str = "Sin grado";

/// Spanish short labels matching the dashboard chart axis.
pub fn day_label(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Lun",
        Weekday::Tue => "Mar",
        Weekday::Wed => "Mie",
        Weekday::Thu => "Jue",
        Weekday::Fri => "Vie",
        Weekday::Sat => "Sab",
        Weekday::Sun => "Dom",
    }
}

/// Half-open local-time bounds for one day's check-ins, as TEXT range
/// endpoints. Timestamps are stored `YYYY-MM-DDTHH:MM:SS.mmm`, so the
/// lexicographic filter is also the chronological one.
pub fn day_bounds(date: NaiveDate) -> (String, String) {
    (
        format!("{}T00:00:00.000", date.format("%Y-%m-%d")),
        format!("{}T23:59:59.999", date.format("%Y-%m-%d")),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSummary {
    pub present: usize,
    pub absent: usize,
    pub total: usize,
}

/// Dedup by student id and count against the roster size. `present` can
/// exceed `total` when rows reference students outside the roster; the
/// absent count saturates at zero rather than going negative.
pub fn presence_summary<'a, I>(total_students: usize, attendee_ids: I) -> PresenceSummary
where
    I: IntoIterator<Item = &'a str>,
{
    let unique: HashSet<&str> = attendee_ids.into_iter().collect();
    let present = unique.len();
    PresenceSummary {
        present,
        absent: total_students.saturating_sub(present),
        total: total_students,
    }
}

/// Group students by grade; a missing grade lands in the sentinel bucket.
/// BTreeMap keeps the output order deterministic.
pub fn grade_distribution<'a, I>(grades: I) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut buckets: BTreeMap<String, usize> = BTreeMap::new();
    for grade in grades {
        let label = match grade {
            Some(g) if !g.trim().is_empty() => g.trim().to_string(),
            _ => UNASSIGNED_GRADE.to_string(),
        };
        *buckets.entry(label).or_insert(0) += 1;
    }
    buckets.into_iter().collect()
}

/// Monday through Friday of the week containing `date`.
pub fn school_week(date: NaiveDate) -> Vec<NaiveDate> {
    let monday = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
    (0..5)
        .filter_map(|i| monday.checked_add_days(Days::new(i)))
        .collect()
}
