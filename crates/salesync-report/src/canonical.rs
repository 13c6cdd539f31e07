//! The canonical sales file: fixed header, one row per sale line.

use std::fs::File;
use std::io;
use std::path::Path;

use salesync_core::{parse_occurred_at, SalesRecord, CANONICAL_HEADERS};
use tracing::warn;

use crate::NormalizeError;

const DATETIME_HEADER: &str = "Datetime";

/// Rows read back from a canonical file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRead {
    pub records: Vec<SalesRecord>,
    pub unparseable_timestamps: usize,
}

/// Writes the header row followed by `records`; the header is written even
/// when there are no records.
pub fn write_canonical<W: io::Write>(writer: W, records: &[SalesRecord]) -> Result<(), NormalizeError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    writer.write_record(CANONICAL_HEADERS)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn write_canonical_file(path: &Path, records: &[SalesRecord]) -> Result<(), NormalizeError> {
    let io_err = |source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    write_canonical(File::create(path).map_err(io_err)?, records)
}

/// Reads canonical rows, dropping (and counting) any whose `Datetime` does
/// not parse.
pub fn read_canonical<R: io::Read>(reader: R) -> Result<CanonicalRead, NormalizeError> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();
    let datetime_col = headers
        .iter()
        .position(|h| h.trim() == DATETIME_HEADER)
        .ok_or_else(|| NormalizeError::Layout(format!("no `{DATETIME_HEADER}` column in canonical file")))?;

    let mut out = CanonicalRead::default();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let raw = record.get(datetime_col).unwrap_or_default();
        if parse_occurred_at(raw).is_none() {
            out.unparseable_timestamps += 1;
            warn!(line = index + 2, datetime = raw, "skipping canonical row with unparseable Datetime");
            continue;
        }
        out.records.push(record.deserialize(Some(&headers))?);
    }
    Ok(out)
}

pub fn read_canonical_file(path: &Path) -> Result<CanonicalRead, NormalizeError> {
    let file = File::open(path).map_err(|source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_canonical(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record() -> SalesRecord {
        SalesRecord {
            order_id: "10".into(),
            seller: "Dea".into(),
            buyer_name: None,
            buyer_tax_id: Some("L12345678A".into()),
            article_name: "Espresso".into(),
            category: None,
            quantity: 1.0,
            unit_price: 100.0,
            total_price: 100.0,
            occurred_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            seller_category: Some("Delivery".into()),
        }
    }

    #[test]
    fn header_is_written_for_empty_output() {
        let mut buf = Vec::new();
        write_canonical(&mut buf, &[]).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "Order_ID,Seller,Buyer_Name,Buyer_NIPT,Article_Name,Category,Quantity,Article_Price,Total_Article_Price,Datetime,Seller Category\n"
        );
    }

    #[test]
    fn optional_fields_are_empty_and_datetime_is_plain() {
        let mut buf = Vec::new();
        write_canonical(&mut buf, &[record()]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let line = text.lines().nth(1).unwrap();
        assert!(line.starts_with("10,Dea,,L12345678A,Espresso,,"));
        assert!(line.ends_with(",2024-01-01 10:00:00,Delivery"));

        let back = read_canonical(text.as_bytes()).unwrap();
        assert_eq!(back.records, vec![record()]);
    }

    #[test]
    fn hand_edited_bad_datetime_is_dropped() {
        let text = "Order_ID,Seller,Buyer_Name,Buyer_NIPT,Article_Name,Category,Quantity,Article_Price,Total_Article_Price,Datetime,Seller Category\n\
                    1,Dea,,,Tea,,1,50,50,yesterday,Delivery\n\
                    2,Dea,,,Tea,,1,50,50,2024-01-02 08:00:00,Delivery\n";
        let read = read_canonical(text.as_bytes()).unwrap();
        assert_eq!(read.unparseable_timestamps, 1);
        assert_eq!(read.records.len(), 1);
        assert_eq!(read.records[0].order_id, "2");
    }
}
