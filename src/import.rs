use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::ImportError;
use crate::reading::{GlucoseUnit, MG_DL_PER_MMOL_L, MealTiming, NewReading, Reading};

/// Values closer than this (mg/dL) at the same time count as the same reading.
/// Half a step of the coarsest export rounding (0.1 mmol/L), plus slack.
const DUPLICATE_TOLERANCE: f64 = 0.05 * MG_DL_PER_MMOL_L + 0.01;

/// A CSV line that could not be imported
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedLine {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub readings: Vec<Reading>,
    pub skipped: Vec<SkippedLine>,
}

struct Columns {
    taken_at: usize,
    value: usize,
    unit: Option<usize>,
    meal: Option<usize>,
    note: Option<usize>,
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self, ImportError> {
        let find = |names: &[&str]| {
            header
                .iter()
                .position(|h| names.contains(&h.trim().to_ascii_lowercase().as_str()))
        };

        Ok(Columns {
            taken_at: find(&["taken_at", "timestamp", "time", "date"])
                .ok_or(ImportError::MissingColumn("taken_at"))?,
            value: find(&["value", "glucose", "reading"])
                .ok_or(ImportError::MissingColumn("value"))?,
            unit: find(&["unit", "units"]),
            meal: find(&["meal", "meal_timing", "tag"]),
            note: find(&["note", "notes", "comment"]),
        })
    }
}

// Parse a CSV row into a vector of strings
fn parse_csv_row(line: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current_field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    // Double quote inside quoted field - add a single quote
                    current_field.push('"');
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => {
                result.push(std::mem::take(&mut current_field));
            }
            _ => current_field.push(c),
        }
    }

    result.push(current_field);
    result
}

/// Splits CSV text into records, keeping line breaks inside quoted fields
///
/// Each record comes with the line number it starts on.
fn split_records(text: &str) -> Vec<(usize, &str)> {
    let mut records = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    let mut record_line = 1;
    let mut line = 1;

    for (i, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\n' => {
                line += 1;
                if !in_quotes {
                    records.push((record_line, text[start..i].trim_end_matches('\r')));
                    start = i + 1;
                    record_line = line;
                }
            }
            _ => {}
        }
    }
    if start < text.len() {
        records.push((record_line, text[start..].trim_end_matches('\r')));
    }
    records
}

/// Accepts RFC 3339 or a plain `YYYY-MM-DD HH:MM[:SS]` taken as UTC
fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_row(
    fields: &[String],
    columns: &Columns,
    default_unit: GlucoseUnit,
    now: DateTime<Utc>,
) -> Result<Reading, String> {
    let field = |idx: Option<usize>| {
        idx.and_then(|i| fields.get(i))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    };

    let raw_time = field(Some(columns.taken_at)).ok_or("missing time")?;
    let taken_at = parse_time(raw_time).ok_or_else(|| format!("invalid time {:?}", raw_time))?;

    let raw_value = field(Some(columns.value)).ok_or("missing value")?;
    let value: f64 = raw_value
        .parse()
        .map_err(|_| format!("invalid value {:?}", raw_value))?;

    let unit = field(columns.unit)
        .map(str::parse::<GlucoseUnit>)
        .transpose()?
        .unwrap_or(default_unit);
    let meal = field(columns.meal)
        .map(str::parse::<MealTiming>)
        .transpose()?
        .unwrap_or_default();

    let new = NewReading {
        value,
        unit: Some(unit),
        taken_at: Some(taken_at),
        meal,
        note: field(columns.note).map(str::to_string),
    };
    Reading::create(new, default_unit, now).map_err(|e| e.to_string())
}

/// Load readings from CSV text
///
/// The first non-empty line is the header; `taken_at` and `value` columns are
/// required. Bad rows are reported in [`ImportReport::skipped`] instead of
/// failing the whole file.
pub fn from_csv(
    text: &str,
    default_unit: GlucoseUnit,
    now: DateTime<Utc>,
) -> Result<ImportReport, ImportError> {
    let mut lines = split_records(text)
        .into_iter()
        .filter(|(_, record)| !record.trim().is_empty());

    let (_, header) = lines.next().ok_or(ImportError::Empty)?;
    let columns = Columns::from_header(&parse_csv_row(header))?;

    let mut report = ImportReport::default();
    for (line, text) in lines {
        match parse_row(&parse_csv_row(text), &columns, default_unit, now) {
            Ok(reading) => report.readings.push(reading),
            Err(reason) => report.skipped.push(SkippedLine { line, reason }),
        }
    }

    Ok(report)
}

/// Adds readings not already present (same time and value), returning how many
pub fn merge_readings(existing: &mut Vec<Reading>, incoming: Vec<Reading>) -> usize {
    let mut added = 0;
    for reading in incoming {
        let duplicate = existing.iter().any(|r| {
            r.taken_at == reading.taken_at && (r.value - reading.value).abs() < DUPLICATE_TOLERANCE
        });
        if !duplicate {
            existing.push(reading);
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::to_csv;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_quoted_fields() {
        assert_eq!(
            parse_csv_row(r#"a,"b, c","say ""hi""",d"#),
            vec!["a", "b, c", "say \"hi\"", "d"]
        );
    }

    #[test]
    fn imports_what_export_writes() {
        let csv = "taken_at,value,unit,meal,note\n\
                   2024-03-05T07:30:00+00:00,95,mg/dL,fasting,\n\
                   2024-03-06 19:00,7.8,mmol/L,after_meal,\"pasta, large\"\n";
        let report = from_csv(csv, GlucoseUnit::MgDl, now()).unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(report.readings.len(), 2);

        let second = &report.readings[1];
        assert!((second.value - 140.54).abs() < 0.01);
        assert_eq!(second.meal, MealTiming::AfterMeal);
        assert_eq!(second.note.as_deref(), Some("pasta, large"));

        let again = from_csv(&to_csv(&report.readings, GlucoseUnit::MgDl), GlucoseUnit::MgDl, now())
            .unwrap();
        assert_eq!(again.readings.len(), 2);
        assert_eq!(again.readings[0].taken_at, report.readings[0].taken_at);
    }

    #[test]
    fn bad_rows_are_skipped_with_reasons() {
        let csv = "Date,Glucose\n\
                   2024-03-05 08:00,110\n\
                   yesterday,120\n\
                   2024-03-05 09:00,abc\n\
                   2024-03-05 10:00,900\n\
                   \n\
                   2024-03-05 11:00,\n";
        let report = from_csv(csv, GlucoseUnit::MgDl, now()).unwrap();
        assert_eq!(report.readings.len(), 1);
        let lines: Vec<usize> = report.skipped.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![3, 4, 5, 7]);
        assert!(report.skipped[0].reason.contains("invalid time"));
    }

    #[test]
    fn header_must_name_required_columns() {
        assert_eq!(
            from_csv("when,value\n", GlucoseUnit::MgDl, now()).unwrap_err(),
            ImportError::MissingColumn("taken_at")
        );
        assert_eq!(
            from_csv("\n\n", GlucoseUnit::MgDl, now()).unwrap_err(),
            ImportError::Empty
        );
    }

    #[test]
    fn multi_line_notes_survive_a_round_trip() {
        let taken_at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 30, 0).unwrap();
        let new = NewReading {
            value: 101.0,
            unit: None,
            taken_at: Some(taken_at),
            meal: MealTiming::Fasting,
            note: Some("line one\nline two".to_string()),
        };
        let original = Reading::create(new, GlucoseUnit::MgDl, now()).unwrap();
        let csv = to_csv(&[original], GlucoseUnit::MgDl) + "2024-03-06 08:00,99,mg/dL,fasting,\n";

        let report = from_csv(&csv, GlucoseUnit::MgDl, now()).unwrap();
        assert!(report.skipped.is_empty(), "{:?}", report.skipped);
        assert_eq!(report.readings.len(), 2);
        assert_eq!(report.readings[0].note.as_deref(), Some("line one\nline two"));
        assert_eq!(report.readings[0].taken_at, taken_at);
    }

    #[test]
    fn skipped_lines_count_quoted_line_breaks() {
        let csv = "taken_at,value,unit,meal,note\n\
                   2024-03-05 08:00,110,mg/dL,fasting,\"a\nb\"\n\
                   never,120\n";
        let report = from_csv(csv, GlucoseUnit::MgDl, now()).unwrap();
        assert_eq!(report.readings.len(), 1);
        assert_eq!(report.skipped[0].line, 4);
    }

    fn entered(value: f64, unit: GlucoseUnit, hour: u32) -> Reading {
        let new = NewReading {
            value,
            unit: Some(unit),
            taken_at: Some(Utc.with_ymd_and_hms(2024, 3, 5, hour, 0, 0).unwrap()),
            meal: MealTiming::Other,
            note: None,
        };
        Reading::create(new, GlucoseUnit::MgDl, now()).unwrap()
    }

    #[test]
    fn reimporting_an_export_in_either_unit_adds_nothing() {
        let mut existing = vec![
            entered(5.5, GlucoseUnit::MmolL, 7),
            entered(140.0, GlucoseUnit::MgDl, 8),
            entered(6.3, GlucoseUnit::MmolL, 9),
            entered(97.0, GlucoseUnit::MgDl, 10),
        ];

        for unit in [GlucoseUnit::MgDl, GlucoseUnit::MmolL] {
            let csv = to_csv(&existing, unit);
            let report = from_csv(&csv, unit, now()).unwrap();
            assert_eq!(report.readings.len(), 4);
            assert_eq!(merge_readings(&mut existing, report.readings), 0, "{:?}", unit);
        }
        assert_eq!(existing.len(), 4);
    }

    #[test]
    fn distinct_values_at_the_same_time_are_kept() {
        let mut existing = vec![entered(100.0, GlucoseUnit::MgDl, 7)];
        let added = merge_readings(&mut existing, vec![entered(102.0, GlucoseUnit::MgDl, 7)]);
        assert_eq!(added, 1);
    }

    #[test]
    fn merge_skips_duplicates() {
        let csv = "taken_at,value\n2024-03-05 08:00,110\n2024-03-05 09:00,120\n";
        let first = from_csv(csv, GlucoseUnit::MgDl, now()).unwrap().readings;
        let second = from_csv(csv, GlucoseUnit::MgDl, now()).unwrap().readings;

        let mut existing = Vec::new();
        assert_eq!(merge_readings(&mut existing, first), 2);
        assert_eq!(merge_readings(&mut existing, second), 0);
        assert_eq!(existing.len(), 2);
    }
}
