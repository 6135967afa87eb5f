//! Derived glucose statistics
//!
//! Readings are bucketed into rolling, weekly and monthly windows. Every stat
//! keeps the value for the running period (`current`) next to the value of
//! the period before it (`previous`), so the dashboard can show a trend.
//!
//! Weeks start on Monday 00:00 UTC and months on the 1st at 00:00 UTC. When
//! a new week or month begins, [`StatsRecord::archive`] rolls the matching
//! stats over: `current` moves into `previous` and `current` is reset to a
//! placeholder until the next [`StatsRecord::refresh`].

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::reading::{GlucoseUnit, MealTiming, Reading};

/// Difference below which a stat is reported as steady
pub const TREND_EPSILON: f64 = 0.05;

/// Target range used for high/low counts and time in range, in mg/dL
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: 70.0,
            high: 180.0,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        if !self.low.is_finite() || !self.high.is_finite() {
            return Err("Thresholds must be numbers".to_string());
        }
        if self.low < 40.0 || self.high > 400.0 {
            return Err("Thresholds must lie between 40 and 400 mg/dL".to_string());
        }
        if self.low >= self.high {
            return Err("Low threshold must be below the high threshold".to_string());
        }
        Ok(())
    }

    pub fn in_range(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }
}

/// How a stat's window is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// The last `days` days up to now, never archived
    Rolling { days: i64 },
    /// Calendar week starting Monday
    Weekly,
    /// Calendar month
    Monthly,
}

/// Half-open time window; an open end includes everything after `start`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Window {
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: day_start(start),
            end: Some(day_start(end)),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && self.end.is_none_or(|end| at < end)
    }

    pub fn select<'a>(&self, readings: &'a [Reading]) -> Vec<&'a Reading> {
        readings.iter().filter(|r| self.contains(r.taken_at)).collect()
    }
}

pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Monday of the week containing `date`
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

impl Cadence {
    /// First day of the period `now` falls in
    pub fn period_start(&self, now: DateTime<Utc>) -> NaiveDate {
        let today = now.date_naive();
        match self {
            Cadence::Rolling { .. } => today,
            Cadence::Weekly => week_start(today),
            Cadence::Monthly => month_start(today),
        }
    }

    /// First day of the period preceding the one starting at `start`
    pub fn previous_period_start(&self, start: NaiveDate) -> NaiveDate {
        match self {
            Cadence::Rolling { days } => start - Duration::days(*days),
            Cadence::Weekly => start - Duration::days(7),
            Cadence::Monthly => month_start(start - Duration::days(1)),
        }
    }

    pub fn window(&self, now: DateTime<Utc>) -> Window {
        let start = match self {
            Cadence::Rolling { days } => now - Duration::days(*days),
            _ => day_start(self.period_start(now)),
        };
        Window { start, end: None }
    }

    pub fn previous_window(&self, now: DateTime<Utc>) -> Window {
        match self {
            Cadence::Rolling { days } => Window {
                start: now - Duration::days(days * 2),
                end: Some(now - Duration::days(*days)),
            },
            _ => {
                let start = self.period_start(now);
                Window::between(self.previous_period_start(start), start)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Cadence::Rolling { .. } => "rolling",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }
}

/// Every statistic the dashboard shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    SevenDayAverage,
    WeeklyAverage,
    WeeklyHighest,
    WeeklyLowest,
    WeeklyHighCount,
    WeeklyLowCount,
    WeeklyInRange,
    WeeklyFastingAverage,
    MonthlyAverage,
    MonthlyHighCount,
    MonthlyLowCount,
    MonthlyInRange,
    EstimatedA1c,
}

impl StatKind {
    pub const ALL: [StatKind; 13] = [
        StatKind::SevenDayAverage,
        StatKind::WeeklyAverage,
        StatKind::WeeklyHighest,
        StatKind::WeeklyLowest,
        StatKind::WeeklyHighCount,
        StatKind::WeeklyLowCount,
        StatKind::WeeklyInRange,
        StatKind::WeeklyFastingAverage,
        StatKind::MonthlyAverage,
        StatKind::MonthlyHighCount,
        StatKind::MonthlyLowCount,
        StatKind::MonthlyInRange,
        StatKind::EstimatedA1c,
    ];

    pub fn cadence(self) -> Cadence {
        match self {
            StatKind::SevenDayAverage => Cadence::Rolling { days: 7 },
            StatKind::EstimatedA1c => Cadence::Rolling { days: 90 },
            StatKind::WeeklyAverage
            | StatKind::WeeklyHighest
            | StatKind::WeeklyLowest
            | StatKind::WeeklyHighCount
            | StatKind::WeeklyLowCount
            | StatKind::WeeklyInRange
            | StatKind::WeeklyFastingAverage => Cadence::Weekly,
            StatKind::MonthlyAverage
            | StatKind::MonthlyHighCount
            | StatKind::MonthlyLowCount
            | StatKind::MonthlyInRange => Cadence::Monthly,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StatKind::SevenDayAverage => "7-day average",
            StatKind::WeeklyAverage => "Weekly average",
            StatKind::WeeklyHighest => "Weekly highest",
            StatKind::WeeklyLowest => "Weekly lowest",
            StatKind::WeeklyHighCount => "Weekly highs",
            StatKind::WeeklyLowCount => "Weekly lows",
            StatKind::WeeklyInRange => "Weekly time in range (%)",
            StatKind::WeeklyFastingAverage => "Weekly fasting average",
            StatKind::MonthlyAverage => "Monthly average",
            StatKind::MonthlyHighCount => "Monthly highs",
            StatKind::MonthlyLowCount => "Monthly lows",
            StatKind::MonthlyInRange => "Monthly time in range (%)",
            StatKind::EstimatedA1c => "Estimated A1C (%)",
        }
    }

    fn is_count(self) -> bool {
        matches!(
            self,
            StatKind::WeeklyHighCount
                | StatKind::WeeklyLowCount
                | StatKind::MonthlyHighCount
                | StatKind::MonthlyLowCount
        )
    }

    /// Whether the stat is a glucose value that follows the user's unit
    pub fn is_glucose(self) -> bool {
        matches!(
            self,
            StatKind::SevenDayAverage
                | StatKind::WeeklyAverage
                | StatKind::WeeklyHighest
                | StatKind::WeeklyLowest
                | StatKind::WeeklyFastingAverage
                | StatKind::MonthlyAverage
        )
    }

    /// Value `current` is reset to when the stat is archived
    pub fn placeholder(self) -> Option<f64> {
        if self.is_count() { Some(0.0) } else { None }
    }

    /// Computes the stat over readings already restricted to its window
    pub fn measure(self, readings: &[&Reading], thresholds: &Thresholds) -> Option<f64> {
        let values: Vec<f64> = readings
            .iter()
            .filter(|r| self != StatKind::WeeklyFastingAverage || r.meal == MealTiming::Fasting)
            .map(|r| r.value)
            .collect();

        match self {
            StatKind::SevenDayAverage
            | StatKind::WeeklyAverage
            | StatKind::WeeklyFastingAverage
            | StatKind::MonthlyAverage => average(&values).map(round1),
            StatKind::WeeklyHighest => values.iter().copied().reduce(f64::max),
            StatKind::WeeklyLowest => values.iter().copied().reduce(f64::min),
            StatKind::WeeklyHighCount | StatKind::MonthlyHighCount => {
                Some(values.iter().filter(|v| **v > thresholds.high).count() as f64)
            }
            StatKind::WeeklyLowCount | StatKind::MonthlyLowCount => {
                Some(values.iter().filter(|v| **v < thresholds.low).count() as f64)
            }
            StatKind::WeeklyInRange | StatKind::MonthlyInRange => {
                if values.is_empty() {
                    return None;
                }
                let in_range = values.iter().filter(|v| thresholds.in_range(**v)).count();
                Some(round1(in_range as f64 * 100.0 / values.len() as f64))
            }
            StatKind::EstimatedA1c => average(&values).map(estimated_a1c),
        }
    }
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// A1C estimated from the mean glucose (ADAG formula)
pub fn estimated_a1c(mean_mg_dl: f64) -> f64 {
    round1((mean_mg_dl + 46.7) / 28.7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Steady,
    Unknown,
}

/// Cached value of one stat with its snapshot of the previous period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatField {
    pub current: Option<f64>,
    pub previous: Option<f64>,
    pub period_start: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

impl StatField {
    pub fn change(&self) -> Option<f64> {
        match (self.current, self.previous) {
            (Some(current), Some(previous)) => Some(round1(current - previous)),
            _ => None,
        }
    }

    pub fn trend(&self) -> Trend {
        match (self.current, self.previous) {
            (Some(current), Some(previous)) => {
                let diff = current - previous;
                if diff.abs() < TREND_EPSILON {
                    Trend::Steady
                } else if diff > 0.0 {
                    Trend::Up
                } else {
                    Trend::Down
                }
            }
            _ => Trend::Unknown,
        }
    }
}

/// Which cadences rolled over during an archive pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveOutcome {
    pub weekly: bool,
    pub monthly: bool,
}

impl ArchiveOutcome {
    pub fn any(&self) -> bool {
        self.weekly || self.monthly
    }
}

/// Per-user stats as persisted between requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub fields: BTreeMap<StatKind, StatField>,
    pub last_weekly_archive: Option<NaiveDate>,
    pub last_monthly_archive: Option<NaiveDate>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// One stat as returned by the API, converted to the user's unit
#[derive(Debug, Clone, Serialize)]
pub struct StatSummary {
    pub kind: StatKind,
    pub label: &'static str,
    pub cadence: &'static str,
    pub current: Option<f64>,
    pub previous: Option<f64>,
    pub change: Option<f64>,
    pub trend: Trend,
    pub period_start: NaiveDate,
}

impl StatsRecord {
    pub fn get(&self, kind: StatKind) -> Option<&StatField> {
        self.fields.get(&kind)
    }

    /// Rolls weekly and monthly stats over when a new period has begun
    ///
    /// Running it again within the same period changes nothing. A clock that
    /// moved backwards never rolls a period back.
    pub fn archive(
        &mut self,
        readings: &[Reading],
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome::default();

        let week = Cadence::Weekly.period_start(now);
        if self.last_weekly_archive.is_none_or(|last| last < week) {
            self.roll(Cadence::Weekly, week, readings, thresholds, now);
            self.last_weekly_archive = Some(week);
            outcome.weekly = true;
        }

        let month = Cadence::Monthly.period_start(now);
        if self.last_monthly_archive.is_none_or(|last| last < month) {
            self.roll(Cadence::Monthly, month, readings, thresholds, now);
            self.last_monthly_archive = Some(month);
            outcome.monthly = true;
        }

        outcome
    }

    fn roll(
        &mut self,
        cadence: Cadence,
        new_start: NaiveDate,
        readings: &[Reading],
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) {
        let previous_start = cadence.previous_period_start(new_start);
        let ended = Window::between(previous_start, new_start);
        let ended_readings = ended.select(readings);

        for kind in StatKind::ALL.into_iter().filter(|k| k.cadence() == cadence) {
            let previous = match self.fields.get(&kind) {
                Some(field) if field.period_start == new_start => continue,
                Some(field) if field.period_start == previous_start => field.current,
                // missed periods or a stat that never existed
                _ => kind.measure(&ended_readings, thresholds),
            };

            self.fields.insert(
                kind,
                StatField {
                    current: kind.placeholder(),
                    previous,
                    period_start: new_start,
                    updated_at: now,
                },
            );
        }
    }

    /// Archives if due, then recomputes every stat from `readings`
    ///
    /// Both values are derived again: `current` from the running period and
    /// `previous` from the one before, so edits to readings of a period that
    /// already ended show up in the trend. Only [`StatsRecord::archive`] on its
    /// own keeps the moved-over snapshot.
    pub fn refresh(
        &mut self,
        readings: &[Reading],
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> ArchiveOutcome {
        let outcome = self.archive(readings, thresholds, now);

        for kind in StatKind::ALL {
            let cadence = kind.cadence();
            let period_start = cadence.period_start(now);
            let current = kind.measure(&cadence.window(now).select(readings), thresholds);
            let previous = kind.measure(&cadence.previous_window(now).select(readings), thresholds);

            self.fields.insert(
                kind,
                StatField {
                    current,
                    previous,
                    period_start,
                    updated_at: now,
                },
            );
        }

        self.refreshed_at = Some(now);
        outcome
    }

    pub fn summary(&self, unit: GlucoseUnit) -> Vec<StatSummary> {
        let convert = |kind: StatKind, value: Option<f64>| {
            if kind.is_glucose() {
                value.map(|v| round1(unit.from_mg_dl(v)))
            } else {
                value
            }
        };

        self.fields
            .iter()
            .map(|(kind, field)| StatSummary {
                kind: *kind,
                label: kind.label(),
                cadence: kind.cadence().name(),
                current: convert(*kind, field.current),
                previous: convert(*kind, field.previous),
                change: convert(*kind, field.change()),
                trend: field.trend(),
                period_start: field.period_start,
            })
            .collect()
    }
}
