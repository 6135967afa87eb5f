#![cfg(not(tarpaulin_include))]

use crate::reading::{GlucoseUnit, Reading};
#[cfg(feature = "web")]
use crate::stats::StatsRecord;
#[cfg(feature = "web")]
use std::error::Error;

pub const CSV_HEADER: &str = "taken_at,value,unit,meal,note";

/// Quotes a CSV field when it holds a comma, quote or line break
pub fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn oldest_first(readings: &[Reading]) -> Vec<&Reading> {
    let mut sorted: Vec<&Reading> = readings.iter().collect();
    sorted.sort_by_key(|r| r.taken_at);
    sorted
}

/// Convert readings to CSV format
///
/// One row per reading, oldest first, with values in `unit`. The output is
/// accepted back by [`crate::import::from_csv`].
pub fn to_csv(readings: &[Reading], unit: GlucoseUnit) -> String {
    let mut csv_content = String::from(CSV_HEADER);
    csv_content.push('\n');

    for reading in oldest_first(readings) {
        let row = [
            reading.taken_at.to_rfc3339(),
            unit.format(reading.value),
            unit.label().to_string(),
            reading.meal.to_string(),
            csv_field(reading.note.as_deref().unwrap_or("")),
        ];
        csv_content.push_str(&row.join(","));
        csv_content.push('\n');
    }

    csv_content
}

/// Convert readings and stats to an XLSX workbook
///
/// The workbook has a "Readings" sheet and a "Summary" sheet listing every
/// stat with its previous value and trend.
#[cfg(feature = "web")]
pub fn to_xlsx(
    readings: &[Reading],
    stats: &StatsRecord,
    unit: GlucoseUnit,
) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    use rust_xlsxwriter::{Format, Workbook, Worksheet};

    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();

    let mut sheet = Worksheet::new();
    sheet.set_name("Readings")?;
    let value_header = format!("Value ({})", unit.label());
    for (col, title) in ["Taken at (UTC)", value_header.as_str(), "Meal", "Note"]
        .iter()
        .enumerate()
    {
        sheet.write_string_with_format(0, col as u16, *title, &bold)?;
    }
    for (i, reading) in oldest_first(readings).into_iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_string(row, 0, &reading.taken_at.format("%Y-%m-%d %H:%M").to_string())?;
        sheet.write_number(row, 1, reading.value_in(unit))?;
        sheet.write_string(row, 2, reading.meal.as_str())?;
        sheet.write_string(row, 3, reading.note.as_deref().unwrap_or(""))?;
    }
    sheet.set_column_width(0, 18.0)?;
    sheet.set_column_width(3, 40.0)?;
    workbook.push_worksheet(sheet);

    let mut summary = Worksheet::new();
    summary.set_name("Summary")?;
    for (col, title) in ["Statistic", "Current", "Previous", "Trend", "Period start"]
        .iter()
        .enumerate()
    {
        summary.write_string_with_format(0, col as u16, *title, &bold)?;
    }
    for (i, stat) in stats.summary(unit).iter().enumerate() {
        let row = (i + 1) as u32;
        summary.write_string(row, 0, stat.label)?;
        if let Some(current) = stat.current {
            summary.write_number(row, 1, current)?;
        }
        if let Some(previous) = stat.previous {
            summary.write_number(row, 2, previous)?;
        }
        summary.write_string(row, 3, &format!("{:?}", stat.trend).to_lowercase())?;
        summary.write_string(row, 4, &stat.period_start.to_string())?;
    }
    summary.set_column_width(0, 28.0)?;
    workbook.push_worksheet(summary);

    let buffer = workbook.save_to_buffer()?;
    Ok(buffer)
}

#[cfg(feature = "web")]
mod pdf {
    use printpdf::{
        BuiltinFont, Image, ImageTransform, IndirectFontRef, Mm, PdfDocumentReference,
        PdfLayerReference,
    };

    // A4 portrait, in millimetres
    pub const PAGE_WIDTH: f32 = 210.0;
    pub const PAGE_HEIGHT: f32 = 297.0;
    pub const MARGIN: f32 = 15.0;
    const LINE_HEIGHT: f32 = 5.5;

    /// Keeps text inside what the builtin fonts encode; anything else becomes `?`
    pub fn pdf_text(value: &str, max_chars: usize) -> String {
        let mut text: String = value
            .chars()
            .map(|c| match c {
                '\n' | '\r' | '\t' => ' ',
                c if c.is_ascii_graphic() || c == ' ' => c,
                _ => '?',
            })
            .take(max_chars)
            .collect();
        if value.chars().count() > max_chars {
            text.push_str("...");
        }
        text
    }

    /// Writes lines top to bottom, starting a new page when one fills up
    pub struct Pages<'a> {
        pub doc: &'a PdfDocumentReference,
        pub layer: PdfLayerReference,
        pub regular: IndirectFontRef,
        pub bold: IndirectFontRef,
        pub y: f32,
        pub pages: usize,
    }

    impl Pages<'_> {
        fn ensure_room(&mut self, height: f32) {
            if self.y - height >= MARGIN {
                return;
            }
            self.pages += 1;
            let (page, layer) = self.doc.add_page(
                Mm(PAGE_WIDTH),
                Mm(PAGE_HEIGHT),
                format!("Page {}", self.pages),
            );
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = PAGE_HEIGHT - MARGIN;
        }

        pub fn heading(&mut self, text: &str, size: f32) {
            self.ensure_room(size * 0.6 + LINE_HEIGHT);
            self.y -= size * 0.6;
            self.layer
                .use_text(pdf_text(text, 80), size, Mm(MARGIN), Mm(self.y), &self.bold);
            self.y -= LINE_HEIGHT;
        }

        /// One table row; `cells` pairs an x offset from the margin with text
        pub fn row(&mut self, cells: &[(f32, String)], bold: bool) {
            self.ensure_room(LINE_HEIGHT);
            let font = if bold { &self.bold } else { &self.regular };
            for (x, text) in cells {
                self.layer
                    .use_text(text.as_str(), 9.0, Mm(MARGIN + x), Mm(self.y), font);
            }
            self.y -= LINE_HEIGHT;
        }

        pub fn gap(&mut self) {
            self.y -= LINE_HEIGHT;
        }

        /// Places an image across the content width
        pub fn image(&mut self, chart: &image::RgbImage) {
            let content_width = PAGE_WIDTH - 2.0 * MARGIN;
            let dpi = chart.width() as f32 / (content_width / 25.4);
            let height = chart.height() as f32 / dpi * 25.4;
            self.ensure_room(height + LINE_HEIGHT);

            self.y -= height;
            Image::from_dynamic_image(&image::DynamicImage::ImageRgb8(chart.clone())).add_to_layer(
                self.layer.clone(),
                ImageTransform {
                    translate_x: Some(Mm(MARGIN)),
                    translate_y: Some(Mm(self.y)),
                    dpi: Some(dpi),
                    ..Default::default()
                },
            );
            self.y -= LINE_HEIGHT;
        }
    }

    pub fn fonts(
        doc: &PdfDocumentReference,
    ) -> Result<(IndirectFontRef, IndirectFontRef), String> {
        let regular = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| e.to_string())?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| e.to_string())?;
        Ok((regular, bold))
    }
}

/// Convert readings and stats to a printable PDF report
///
/// The first page carries the stats summary and, when given, the chart.
/// The readings table follows, oldest first, over as many pages as needed.
#[cfg(feature = "web")]
pub fn to_pdf(
    owner: &str,
    readings: &[Reading],
    stats: &StatsRecord,
    unit: GlucoseUnit,
    chart: Option<&image::RgbImage>,
    generated_at: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    use pdf::{MARGIN, PAGE_HEIGHT, PAGE_WIDTH, Pages, pdf_text};
    use printpdf::{Mm, PdfDocument};

    let title = format!("Glucose report for {}", owner);
    let (doc, page, layer) = PdfDocument::new(
        title.clone(),
        Mm(PAGE_WIDTH),
        Mm(PAGE_HEIGHT),
        "Page 1".to_string(),
    );
    let (regular, bold) = pdf::fonts(&doc)?;
    let mut pages = Pages {
        layer: doc.get_page(page).get_layer(layer),
        doc: &doc,
        regular,
        bold,
        y: PAGE_HEIGHT - MARGIN,
        pages: 1,
    };

    pages.heading(&title, 18.0);
    pages.row(
        &[(
            0.0,
            format!(
                "Generated {} UTC, values in {}, {} readings",
                generated_at.format("%Y-%m-%d %H:%M"),
                unit.label(),
                readings.len()
            ),
        )],
        false,
    );
    pages.gap();

    pages.heading("Summary", 13.0);
    pages.row(
        &[
            (0.0, "Statistic".to_string()),
            (80.0, "Current".to_string()),
            (110.0, "Previous".to_string()),
            (140.0, "Trend".to_string()),
        ],
        true,
    );
    let number = |v: Option<f64>| v.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".to_string());
    for stat in stats.summary(unit) {
        pages.row(
            &[
                (0.0, pdf_text(stat.label, 45)),
                (80.0, number(stat.current)),
                (110.0, number(stat.previous)),
                (140.0, format!("{:?}", stat.trend).to_lowercase()),
            ],
            false,
        );
    }
    pages.gap();

    if let Some(chart) = chart {
        pages.image(chart);
    }

    pages.heading("Readings", 13.0);
    pages.row(
        &[
            (0.0, "Taken at (UTC)".to_string()),
            (40.0, format!("Value ({})", unit.label())),
            (70.0, "Meal".to_string()),
            (100.0, "Note".to_string()),
        ],
        true,
    );
    for reading in oldest_first(readings) {
        pages.row(
            &[
                (0.0, reading.taken_at.format("%Y-%m-%d %H:%M").to_string()),
                (40.0, unit.format(reading.value)),
                (70.0, reading.meal.as_str().to_string()),
                (100.0, pdf_text(reading.note.as_deref().unwrap_or(""), 45)),
            ],
            false,
        );
    }

    log::debug!("Rendered PDF report for {} on {} pages", owner, pages.pages);
    drop(pages);
    let bytes = doc.save_to_bytes().map_err(|e| e.to_string())?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::MealTiming;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn reading(value: f64, day: u32, note: Option<&str>) -> Reading {
        let taken_at = Utc.with_ymd_and_hms(2024, 3, day, 7, 30, 0).unwrap();
        Reading {
            id: Uuid::new_v4(),
            value,
            taken_at,
            meal: MealTiming::Fasting,
            note: note.map(str::to_string),
            created_at: taken_at,
        }
    }

    #[test]
    fn csv_rows_are_sorted_and_escaped() {
        let readings = vec![
            reading(140.0, 6, Some("pizza, then \"dessert\"")),
            reading(95.0, 5, None),
        ];
        let csv = to_csv(&readings, GlucoseUnit::MgDl);
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "2024-03-05T07:30:00+00:00,95,mg/dL,fasting,");
        assert_eq!(
            lines[2],
            "2024-03-06T07:30:00+00:00,140,mg/dL,fasting,\"pizza, then \"\"dessert\"\"\""
        );
    }

    #[test]
    fn csv_uses_the_requested_unit() {
        let csv = to_csv(&[reading(180.182, 5, None)], GlucoseUnit::MmolL);
        assert!(csv.lines().nth(1).unwrap().contains(",10.0,mmol/L,"));
    }

    #[cfg(feature = "web")]
    fn stats_for(readings: &[Reading]) -> StatsRecord {
        let mut stats = StatsRecord::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        stats.refresh(readings, &crate::stats::Thresholds::default(), now);
        stats
    }

    #[cfg(feature = "web")]
    #[test]
    fn xlsx_has_readings_and_summary_sheets() {
        use std::io::{Cursor, Read};

        let readings = vec![reading(95.0, 5, None), reading(140.0, 6, Some("lunch"))];
        let stats = stats_for(&readings);
        let bytes = to_xlsx(&readings, &stats, GlucoseUnit::MgDl).unwrap();
        assert_eq!(&bytes[..2], b"PK");

        // sheet names and cells live as plain XML inside the zip
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut workbook = String::new();
        archive
            .by_name("xl/workbook.xml")
            .unwrap()
            .read_to_string(&mut workbook)
            .unwrap();
        assert!(workbook.contains(r#"name="Readings""#));
        assert!(workbook.contains(r#"name="Summary""#));

        let mut rows = |sheet: &str| {
            let mut xml = String::new();
            archive
                .by_name(sheet)
                .unwrap()
                .read_to_string(&mut xml)
                .unwrap();
            xml.matches("<row ").count()
        };
        // header plus one row per reading / stat
        assert_eq!(rows("xl/worksheets/sheet1.xml"), 3);
        assert_eq!(rows("xl/worksheets/sheet2.xml"), 1 + stats.summary(GlucoseUnit::MgDl).len());
    }

    #[cfg(feature = "web")]
    #[test]
    fn pdf_report_is_a_pdf() {
        let generated = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let few = vec![reading(95.0, 5, Some("café, \"fasting\"\nsecond line"))];
        let stats = stats_for(&few);

        let small = to_pdf("alice", &few, &stats, GlucoseUnit::MmolL, None, generated).unwrap();
        assert!(small.starts_with(b"%PDF"));

        let chart = image::RgbImage::from_pixel(80, 40, image::Rgb([200, 220, 255]));
        let many: Vec<Reading> = (0..150).map(|i| reading(80.0 + i as f64, 1 + (i % 9) as u32, None)).collect();
        let long = to_pdf("alice", &many, &stats_for(&many), GlucoseUnit::MgDl, Some(&chart), generated)
            .unwrap();
        assert!(long.starts_with(b"%PDF"));
        assert!(long.len() > small.len());
    }

    #[cfg(feature = "web")]
    #[test]
    fn pdf_text_is_latin_and_bounded() {
        use super::pdf::pdf_text;
        assert_eq!(pdf_text("two\nlines", 20), "two lines");
        assert_eq!(pdf_text("café", 20), "caf?");
        assert_eq!(pdf_text("abcdef", 3), "abc...");
    }

    #[test]
    fn plain_fields_are_not_quoted() {
        assert_eq!(csv_field("fine"), "fine");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }
}
