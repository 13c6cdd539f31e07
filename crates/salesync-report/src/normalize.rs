//! Raw export → canonical rows.
//!
//! The export is positional: a fixed set of columns is dropped, the split
//! registration date/time columns are merged, and the nine remaining columns
//! map in order onto the canonical fields.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use salesync_core::{is_aggregate_label, SalesRecord};
use serde::Serialize;
use tracing::{debug, warn};

use crate::categories::SellerCategories;
use crate::sheet::{Cell, RawSheet};
use crate::NormalizeError;

/// The portal writes this where a cell is empty.
pub const PLACEHOLDER: char = '-';

pub const DEFAULT_DROPPED_COLUMNS: [usize; 15] =
    [0, 2, 5, 7, 8, 12, 13, 15, 16, 18, 20, 21, 23, 24, 25];
pub const DEFAULT_DATE_HEADER: &str = "Data Rregjistrimit";
pub const DEFAULT_TIME_HEADER: &str = "Koha Rregjistrimit";

const FIELD_COUNT: usize = 9;
const DATE_FORMATS: [&str; 3] = ["%d/%m/%Y", "%Y-%m-%d", "%d.%m.%Y"];
const TIME_FORMATS: [&str; 2] = ["%H:%M:%S%.f", "%H:%M"];
const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLayout {
    pub dropped_columns: BTreeSet<usize>,
    pub date_header: String,
    pub time_header: String,
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self {
            dropped_columns: DEFAULT_DROPPED_COLUMNS.into_iter().collect(),
            date_header: DEFAULT_DATE_HEADER.to_string(),
            time_header: DEFAULT_TIME_HEADER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResolvedLayout {
    date: usize,
    time: usize,
    fields: [usize; FIELD_COUNT],
}

impl ReportLayout {
    fn find_header(headers: &[String], name: &str) -> Result<usize, NormalizeError> {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| NormalizeError::Layout(format!("no `{name}` column in header row")))
    }

    fn resolve(&self, headers: &[String]) -> Result<ResolvedLayout, NormalizeError> {
        let date = Self::find_header(headers, &self.date_header)?;
        let time = Self::find_header(headers, &self.time_header)?;

        let kept: Vec<usize> = (0..headers.len())
            .filter(|i| !self.dropped_columns.contains(i) && *i != date && *i != time)
            .collect();
        if kept.len() < FIELD_COUNT {
            return Err(NormalizeError::Layout(format!(
                "expected at least {FIELD_COUNT} data columns after dropping, found {}",
                kept.len()
            )));
        }
        if kept.len() > FIELD_COUNT {
            debug!(extra = kept.len() - FIELD_COUNT, "ignoring trailing export columns");
        }

        let mut fields = [0; FIELD_COUNT];
        fields.copy_from_slice(&kept[..FIELD_COUNT]);
        Ok(ResolvedLayout { date, time, fields })
    }
}

/// Row accounting for one normalization.
///
/// `input_rows` counts non-blank data rows; every one of them ends up in
/// exactly one of the other counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub input_rows: usize,
    pub emitted: usize,
    pub totals_removed: usize,
    pub unparseable_timestamps: usize,
    pub missing_fields: usize,
}

impl NormalizeReport {
    pub fn rejected(&self) -> usize {
        self.totals_removed + self.unparseable_timestamps + self.missing_fields
    }
}

enum RowOutcome {
    Blank,
    Total,
    BadTimestamp,
    Missing(&'static str),
    Record(SalesRecord),
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    layout: ReportLayout,
    categories: SellerCategories,
}

impl Normalizer {
    pub fn new(layout: ReportLayout, categories: SellerCategories) -> Self {
        Self { layout, categories }
    }

    pub fn with_categories(mut self, categories: SellerCategories) -> Self {
        self.categories = categories;
        self
    }

    pub fn normalize(
        &self,
        sheet: &RawSheet,
    ) -> Result<(Vec<SalesRecord>, NormalizeReport), NormalizeError> {
        let layout = self.layout.resolve(&sheet.headers)?;
        let mut report = NormalizeReport::default();
        let mut records = Vec::with_capacity(sheet.rows.len());

        for (index, row) in sheet.rows.iter().enumerate() {
            // Header is sheet row 1.
            let sheet_row = index + 2;
            match self.normalize_row(&layout, row) {
                RowOutcome::Blank => continue,
                RowOutcome::Total => {
                    report.input_rows += 1;
                    report.totals_removed += 1;
                    debug!(sheet_row, "dropped aggregate row");
                }
                RowOutcome::BadTimestamp => {
                    report.input_rows += 1;
                    report.unparseable_timestamps += 1;
                    warn!(
                        sheet_row,
                        date = ?cell_at(row, layout.date),
                        time = ?cell_at(row, layout.time),
                        "dropping row with unparseable timestamp"
                    );
                }
                RowOutcome::Missing(field) => {
                    report.input_rows += 1;
                    report.missing_fields += 1;
                    warn!(sheet_row, field, "dropping row missing a required field");
                }
                RowOutcome::Record(record) => {
                    report.input_rows += 1;
                    report.emitted += 1;
                    records.push(record);
                }
            }
        }

        Ok((records, report))
    }

    fn normalize_row(&self, layout: &ResolvedLayout, row: &[Cell]) -> RowOutcome {
        if row.iter().all(|cell| text_value(cell).is_empty()) {
            return RowOutcome::Blank;
        }

        let field = |n: usize| cell_at(row, layout.fields[n]);
        let order_id = text_value(field(0));
        let seller = text_value(field(1));
        if is_aggregate_label(&seller) || is_aggregate_label(&order_id) {
            return RowOutcome::Total;
        }

        let Some(occurred_at) = combine_timestamp(cell_at(row, layout.date), cell_at(row, layout.time))
        else {
            return RowOutcome::BadTimestamp;
        };

        if order_id.is_empty() {
            return RowOutcome::Missing("Order_ID");
        }
        let Some(quantity) = number_value(field(6)) else {
            return RowOutcome::Missing("Quantity");
        };
        let Some(unit_price) = number_value(field(7)) else {
            return RowOutcome::Missing("Article_Price");
        };
        let Some(total_price) = number_value(field(8)) else {
            return RowOutcome::Missing("Total_Article_Price");
        };

        let seller_category = self.categories.category_for(&seller).map(ToString::to_string);
        RowOutcome::Record(SalesRecord {
            order_id,
            seller,
            buyer_name: optional_text(field(2)),
            buyer_tax_id: optional_text(field(3)),
            article_name: text_value(field(4)),
            category: optional_text(field(5)),
            quantity,
            unit_price,
            total_price,
            occurred_at,
            seller_category,
        })
    }
}

fn cell_at(row: &[Cell], index: usize) -> &Cell {
    row.get(index).unwrap_or(&Cell::Empty)
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Cell text with every placeholder removed, trimmed.
fn text_value(cell: &Cell) -> String {
    match cell {
        Cell::Empty => String::new(),
        Cell::Text(s) => s.replace(PLACEHOLDER, "").trim().to_string(),
        Cell::Number(n) | Cell::Serial { value: n } => format_number(*n),
    }
}

fn optional_text(cell: &Cell) -> Option<String> {
    Some(text_value(cell)).filter(|s| !s.is_empty())
}

fn number_value(cell: &Cell) -> Option<f64> {
    let value = match cell {
        Cell::Empty => return None,
        Cell::Number(n) | Cell::Serial { value: n } => *n,
        // Sign and separators are significant here, so the raw text is used.
        // A comma is never guessed at: "1,5" and "1,400" are both rejected.
        Cell::Text(s) => {
            let text = s.trim();
            if text.is_empty() || text.chars().all(|c| c == PLACEHOLDER) {
                return None;
            }
            text.parse::<f64>().ok()?
        }
    };
    value.is_finite().then_some(value)
}

fn serial_base() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or(NaiveDate::MIN)
}

/// Date part of the registration timestamp; the raw cell is used so ISO
/// dates survive placeholder stripping.
fn date_value(cell: &Cell) -> Option<NaiveDate> {
    match cell {
        Cell::Empty => None,
        Cell::Number(n) | Cell::Serial { value: n } => {
            if !n.is_finite() || *n < 0.0 {
                return None;
            }
            serial_base().checked_add_signed(Duration::days(n.floor() as i64))
        }
        Cell::Text(s) => {
            let token = s.split_whitespace().next()?;
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(token, fmt).ok())
        }
    }
}

/// Drops a `"<n> days "` overflow prefix.
fn strip_day_prefix(raw: &str) -> &str {
    let raw = raw.trim();
    if raw.contains("day") {
        raw.split_whitespace().last().unwrap_or(raw)
    } else {
        raw
    }
}

fn time_value(cell: &Cell) -> Option<NaiveTime> {
    match cell {
        Cell::Empty => None,
        Cell::Number(n) | Cell::Serial { value: n } => {
            if !n.is_finite() || *n < 0.0 {
                return None;
            }
            let seconds = (n.fract() * SECONDS_PER_DAY).round() as u32 % 86_400;
            NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)
        }
        Cell::Text(s) => {
            let token = strip_day_prefix(s);
            TIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveTime::parse_from_str(token, fmt).ok())
        }
    }
}

fn combine_timestamp(date: &Cell, time: &Cell) -> Option<NaiveDateTime> {
    Some(date_value(date)?.and_time(time_value(time)?))
}
