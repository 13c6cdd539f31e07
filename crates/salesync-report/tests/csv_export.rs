use salesync_report::{normalize_file, read_canonical_file, write_canonical_file, Normalizer};

const HEADER: &str = "Nr,Nr Porosie,Tavolina,Shitesi,Bleresi,Statusi,NIPT Bleresi,Pagesa,Kasa,Artikulli,Kategoria,Sasia,Njesia,TVSH,Cmimi,Zbritja,Monedha,Totali,Shenime,Data Rregjistrimit,Terminali,Operatori,Koha Rregjistrimit,Fature,Sinkronizuar,Burimi";

fn line(order: &str, seller: &str, article: &str, qty: &str, price: &str, total: &str, date: &str, time: &str) -> String {
    format!("x,{order},x,{seller},-,x,-,x,x,{article},Pije,{qty},x,x,{price},x,x,{total},x,{date},x,x,{time},x,x,x")
}

#[test]
fn csv_export_normalizes_to_canonical_file() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raport shitjes 2024-01-01.csv");
    let body = [
        HEADER.to_string(),
        line("101", "Dea", "Espresso", "2", "100", "200", "01/01/2024", "0 days 08:15:00"),
        line("102", "Kristian Llupo", "Birre", "1", "300", "300", "01/01/2024", "08:20"),
        line("103", "Unknown Person", "Uje", "1", "80", "80", "not a date", "08:25"),
        line("TOTALI", "", "", "4", "", "580", "", ""),
    ]
    .join("\n");
    std::fs::write(&raw, body).unwrap();

    let (records, report) = normalize_file(&Normalizer::default(), &raw).unwrap();
    assert_eq!(report.input_rows, 4);
    assert_eq!(report.emitted, 2);
    assert_eq!(report.totals_removed, 1);
    assert_eq!(report.unparseable_timestamps, 1);

    assert_eq!(records[0].order_id, "101");
    assert_eq!(records[0].seller_category.as_deref(), Some("Delivery"));
    assert_eq!(records[0].buyer_name, None);
    assert_eq!(records[1].seller_category.as_deref(), Some("Bar"));
    assert_eq!(records[1].category.as_deref(), Some("Pije"));

    let canonical = dir.path().join("work").join("sales.csv");
    write_canonical_file(&canonical, &records).unwrap();
    let back = read_canonical_file(&canonical).unwrap();
    assert_eq!(back.unparseable_timestamps, 0);
    assert_eq!(back.records, records);
}
