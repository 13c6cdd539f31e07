//! Raw spreadsheet access: the first worksheet of a workbook, or a CSV export.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

use crate::NormalizeError;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    /// Spreadsheet date/time serial (days since 1899-12-30).
    Serial { value: f64 },
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Empty => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Float(f) => Cell::Number(*f),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Bool(b) => Cell::Text(b.to_string()),
            Data::DateTime(dt) => Cell::Serial { value: dt.as_f64() },
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(_) => Cell::Empty,
        }
    }
}

/// Header row plus data rows, every row padded to the header width.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl RawSheet {
    /// Builds a sheet from already-split rows; the first row is the header.
    pub fn from_rows(mut rows: Vec<Vec<Cell>>) -> Self {
        if rows.is_empty() {
            return Self::default();
        }
        let headers: Vec<String> = rows
            .remove(0)
            .into_iter()
            .map(|cell| match cell {
                Cell::Text(s) => s.trim().to_string(),
                Cell::Number(n) => n.to_string(),
                _ => String::new(),
            })
            .collect();
        let width = headers.len();
        for row in &mut rows {
            if row.len() < width {
                row.resize(width, Cell::Empty);
            }
        }
        Self { headers, rows }
    }

    /// Reads an export by extension: `csv` through the CSV reader, anything
    /// else as a workbook.
    pub fn read_path(path: &Path) -> Result<Self, NormalizeError> {
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if is_csv {
            Self::read_csv(path)
        } else {
            Self::read_workbook(path)
        }
    }

    pub fn read_workbook(path: &Path) -> Result<Self, NormalizeError> {
        let mut workbook = open_workbook_auto(path).map_err(|source| NormalizeError::Workbook {
            path: path.to_path_buf(),
            source,
        })?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| NormalizeError::EmptyWorkbook(path.to_path_buf()))?
            .map_err(|source| NormalizeError::Workbook {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_rows(
            range
                .rows()
                .map(|row| row.iter().map(Cell::from).collect())
                .collect(),
        ))
    }

    pub fn read_csv(path: &Path) -> Result<Self, NormalizeError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(
                record?
                    .iter()
                    .map(|field| {
                        if field.is_empty() {
                            Cell::Empty
                        } else {
                            Cell::text(field)
                        }
                    })
                    .collect(),
            );
        }
        Ok(Self::from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workbook_values_map_to_cells() {
        assert_eq!(Cell::from(&Data::Int(3)), Cell::Number(3.0));
        assert_eq!(Cell::from(&Data::String("x".into())), Cell::text("x"));
        assert_eq!(Cell::from(&Data::Empty), Cell::Empty);
        assert_eq!(Cell::from(&Data::Bool(true)), Cell::text("true"));
    }

    #[test]
    fn short_rows_are_padded_to_header_width() {
        let sheet = RawSheet::from_rows(vec![
            vec![Cell::text(" a "), Cell::text("b"), Cell::text("c")],
            vec![Cell::Number(1.0)],
        ]);
        assert_eq!(sheet.headers, ["a", "b", "c"]);
        assert_eq!(sheet.rows[0].len(), 3);
        assert_eq!(sheet.rows[0][2], Cell::Empty);
    }

    #[test]
    fn csv_export_is_read_as_text_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raport shitjes.csv");
        std::fs::write(&path, "h1,h2\nx,\n").unwrap();
        let sheet = RawSheet::read_path(&path).unwrap();
        assert_eq!(sheet.headers, ["h1", "h2"]);
        assert_eq!(sheet.rows, vec![vec![Cell::text("x"), Cell::Empty]]);
    }
}
