use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ReadingError;

/// Lowest glucose value accepted, in mg/dL
pub const MIN_MG_DL: f64 = 20.0;
/// Highest glucose value accepted, in mg/dL
pub const MAX_MG_DL: f64 = 600.0;
/// Conversion factor between mmol/L and mg/dL
pub const MG_DL_PER_MMOL_L: f64 = 18.0182;
pub const MAX_NOTE_LEN: usize = 500;

/// Meal-timing tag attached to every reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MealTiming {
    Fasting,
    BeforeMeal,
    AfterMeal,
    Bedtime,
    #[default]
    Other,
}

impl MealTiming {
    pub const ALL: [MealTiming; 5] = [
        MealTiming::Fasting,
        MealTiming::BeforeMeal,
        MealTiming::AfterMeal,
        MealTiming::Bedtime,
        MealTiming::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MealTiming::Fasting => "fasting",
            MealTiming::BeforeMeal => "before_meal",
            MealTiming::AfterMeal => "after_meal",
            MealTiming::Bedtime => "bedtime",
            MealTiming::Other => "other",
        }
    }
}

impl fmt::Display for MealTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealTiming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        MealTiming::ALL
            .into_iter()
            .find(|meal| meal.as_str() == normalized)
            .ok_or_else(|| format!("Unknown meal timing: {}", s))
    }
}

/// Unit a user enters and reads glucose values in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseUnit {
    #[default]
    MgDl,
    MmolL,
}

impl GlucoseUnit {
    pub fn to_mg_dl(self, value: f64) -> f64 {
        match self {
            GlucoseUnit::MgDl => value,
            GlucoseUnit::MmolL => value * MG_DL_PER_MMOL_L,
        }
    }

    pub fn from_mg_dl(self, value: f64) -> f64 {
        match self {
            GlucoseUnit::MgDl => value,
            GlucoseUnit::MmolL => value / MG_DL_PER_MMOL_L,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GlucoseUnit::MgDl => "mg/dL",
            GlucoseUnit::MmolL => "mmol/L",
        }
    }

    /// Formats a mg/dL value in this unit with the precision users expect
    pub fn format(self, mg_dl: f64) -> String {
        match self {
            GlucoseUnit::MgDl => format!("{:.0}", mg_dl),
            GlucoseUnit::MmolL => format!("{:.1}", self.from_mg_dl(mg_dl)),
        }
    }
}

impl FromStr for GlucoseUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mg/dl" | "mg_dl" | "mgdl" => Ok(GlucoseUnit::MgDl),
            "mmol/l" | "mmol_l" | "mmoll" => Ok(GlucoseUnit::MmolL),
            other => Err(format!("Unknown glucose unit: {}", other)),
        }
    }
}

/// A single glucose measurement, always stored in mg/dL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: Uuid,
    pub value: f64,
    pub taken_at: DateTime<Utc>,
    pub meal: MealTiming,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Payload for logging a new reading
#[derive(Debug, Clone, Deserialize)]
pub struct NewReading {
    pub value: f64,
    #[serde(default)]
    pub unit: Option<GlucoseUnit>,
    #[serde(default)]
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meal: MealTiming,
    #[serde(default)]
    pub note: Option<String>,
}

/// Partial update of an existing reading
///
/// An empty `note` clears the stored note.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadingPatch {
    pub value: Option<f64>,
    pub unit: Option<GlucoseUnit>,
    pub taken_at: Option<DateTime<Utc>>,
    pub meal: Option<MealTiming>,
    pub note: Option<String>,
}

/// Filter for listing readings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadingQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub meal: Option<MealTiming>,
    pub limit: Option<usize>,
}

fn check_value(value: f64) -> Result<f64, ReadingError> {
    if !value.is_finite() {
        return Err(ReadingError::NotFinite);
    }
    if !(MIN_MG_DL..=MAX_MG_DL).contains(&value) {
        return Err(ReadingError::OutOfRange(value));
    }
    Ok(value)
}

fn check_time(taken_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>, ReadingError> {
    // small allowance for device clocks running ahead
    if taken_at > now + Duration::minutes(5) {
        return Err(ReadingError::InFuture);
    }
    Ok(taken_at)
}

fn clean_note(note: Option<String>) -> Result<Option<String>, ReadingError> {
    match note.map(|n| n.trim().to_string()) {
        Some(n) if n.is_empty() => Ok(None),
        Some(n) if n.chars().count() > MAX_NOTE_LEN => Err(ReadingError::NoteTooLong(MAX_NOTE_LEN)),
        other => Ok(other),
    }
}

impl Reading {
    /// Validates a new reading, converting its value to mg/dL
    pub fn create(
        new: NewReading,
        default_unit: GlucoseUnit,
        now: DateTime<Utc>,
    ) -> Result<Self, ReadingError> {
        let unit = new.unit.unwrap_or(default_unit);
        let value = check_value(unit.to_mg_dl(new.value))?;
        let taken_at = check_time(new.taken_at.unwrap_or(now), now)?;
        let note = clean_note(new.note)?;

        Ok(Reading {
            id: Uuid::new_v4(),
            value,
            taken_at,
            meal: new.meal,
            note,
            created_at: now,
        })
    }

    /// Applies a patch; the reading is left untouched if any field is invalid
    pub fn apply(
        &mut self,
        patch: ReadingPatch,
        default_unit: GlucoseUnit,
        now: DateTime<Utc>,
    ) -> Result<(), ReadingError> {
        let unit = patch.unit.unwrap_or(default_unit);
        let value = match patch.value {
            Some(v) => check_value(unit.to_mg_dl(v))?,
            None => self.value,
        };
        let taken_at = match patch.taken_at {
            Some(t) => check_time(t, now)?,
            None => self.taken_at,
        };
        let note = match patch.note {
            Some(n) => clean_note(Some(n))?,
            None => self.note.clone(),
        };

        self.value = value;
        self.taken_at = taken_at;
        self.note = note;
        if let Some(meal) = patch.meal {
            self.meal = meal;
        }
        Ok(())
    }

    pub fn value_in(&self, unit: GlucoseUnit) -> f64 {
        unit.from_mg_dl(self.value)
    }
}

impl ReadingQuery {
    pub fn matches(&self, reading: &Reading) -> bool {
        self.from.is_none_or(|from| reading.taken_at >= from)
            && self.to.is_none_or(|to| reading.taken_at < to)
            && self.meal.is_none_or(|meal| reading.meal == meal)
    }

    /// Matching readings, newest first
    pub fn apply(&self, readings: &[Reading]) -> Vec<Reading> {
        let mut matched: Vec<Reading> = readings
            .iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap()
    }

    fn new_reading(value: f64) -> NewReading {
        NewReading {
            value,
            unit: None,
            taken_at: None,
            meal: MealTiming::Fasting,
            note: None,
        }
    }

    #[test]
    fn create_converts_mmol_to_mg_dl() {
        let mut new = new_reading(5.5);
        new.unit = Some(GlucoseUnit::MmolL);
        let reading = Reading::create(new, GlucoseUnit::MgDl, now()).unwrap();
        assert!((reading.value - 99.1).abs() < 0.01);
        assert_eq!(reading.taken_at, now());
        assert_eq!(reading.meal, MealTiming::Fasting);
    }

    #[test]
    fn create_uses_profile_unit_when_none_given() {
        let reading = Reading::create(new_reading(7.0), GlucoseUnit::MmolL, now()).unwrap();
        assert!((reading.value_in(GlucoseUnit::MmolL) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn create_rejects_out_of_range_values() {
        assert_eq!(
            Reading::create(new_reading(5.0), GlucoseUnit::MgDl, now()),
            Err(ReadingError::OutOfRange(5.0))
        );
        assert_eq!(
            Reading::create(new_reading(f64::NAN), GlucoseUnit::MgDl, now()).unwrap_err(),
            ReadingError::NotFinite
        );
        assert!(Reading::create(new_reading(600.0), GlucoseUnit::MgDl, now()).is_ok());
    }

    #[test]
    fn create_rejects_future_readings() {
        let mut new = new_reading(120.0);
        new.taken_at = Some(now() + Duration::hours(1));
        assert_eq!(
            Reading::create(new, GlucoseUnit::MgDl, now()),
            Err(ReadingError::InFuture)
        );

        let mut skewed = new_reading(120.0);
        skewed.taken_at = Some(now() + Duration::minutes(2));
        assert!(Reading::create(skewed, GlucoseUnit::MgDl, now()).is_ok());
    }

    #[test]
    fn blank_notes_are_dropped_and_long_notes_rejected() {
        let mut new = new_reading(100.0);
        new.note = Some("   ".to_string());
        assert_eq!(
            Reading::create(new, GlucoseUnit::MgDl, now()).unwrap().note,
            None
        );

        let mut long = new_reading(100.0);
        long.note = Some("x".repeat(MAX_NOTE_LEN + 1));
        assert_eq!(
            Reading::create(long, GlucoseUnit::MgDl, now()),
            Err(ReadingError::NoteTooLong(MAX_NOTE_LEN))
        );
    }

    #[test]
    fn invalid_patch_leaves_reading_unchanged() {
        let mut reading = Reading::create(new_reading(100.0), GlucoseUnit::MgDl, now()).unwrap();
        let before = reading.clone();
        let patch = ReadingPatch {
            value: Some(1000.0),
            meal: Some(MealTiming::Bedtime),
            ..Default::default()
        };
        assert!(reading.apply(patch, GlucoseUnit::MgDl, now()).is_err());
        assert_eq!(reading, before);
    }

    #[test]
    fn patch_updates_fields_and_clears_note() {
        let mut new = new_reading(100.0);
        new.note = Some("after run".to_string());
        let mut reading = Reading::create(new, GlucoseUnit::MgDl, now()).unwrap();

        let patch = ReadingPatch {
            value: Some(140.0),
            meal: Some(MealTiming::AfterMeal),
            note: Some(String::new()),
            ..Default::default()
        };
        reading.apply(patch, GlucoseUnit::MgDl, now()).unwrap();
        assert_eq!(reading.value, 140.0);
        assert_eq!(reading.meal, MealTiming::AfterMeal);
        assert_eq!(reading.note, None);
    }

    #[test]
    fn query_filters_and_sorts_newest_first() {
        let readings: Vec<Reading> = (0..5)
            .map(|i| {
                let mut new = new_reading(100.0 + i as f64);
                new.taken_at = Some(now() - Duration::days(i));
                new.meal = if i % 2 == 0 {
                    MealTiming::Fasting
                } else {
                    MealTiming::AfterMeal
                };
                Reading::create(new, GlucoseUnit::MgDl, now()).unwrap()
            })
            .collect();

        let query = ReadingQuery {
            from: Some(now() - Duration::days(3)),
            meal: Some(MealTiming::Fasting),
            ..Default::default()
        };
        let values: Vec<f64> = query.apply(&readings).iter().map(|r| r.value).collect();
        assert_eq!(values, vec![100.0, 102.0]);

        let limited = ReadingQuery {
            limit: Some(2),
            ..Default::default()
        };
        let values: Vec<f64> = limited.apply(&readings).iter().map(|r| r.value).collect();
        assert_eq!(values, vec![100.0, 101.0]);
    }

    #[test]
    fn meal_timing_parses_loose_spellings() {
        assert_eq!("Before Meal".parse::<MealTiming>(), Ok(MealTiming::BeforeMeal));
        assert_eq!("after-meal".parse::<MealTiming>(), Ok(MealTiming::AfterMeal));
        assert!("brunch".parse::<MealTiming>().is_err());
        assert_eq!("mmol/L".parse::<GlucoseUnit>(), Ok(GlucoseUnit::MmolL));
    }
}
