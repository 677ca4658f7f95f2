mod common;

use chrono::NaiveDate;
use deal_recon::{
    config::ReconConfig,
    context::{ContextInferrer, ContextSource, ExplicitContext, LocationKind},
    data::Value,
    duplicates::{DuplicateMode, find_duplicates},
    filter::area_codes,
    normalize::Normalizer,
    reader::TabularReader,
    recon::{
        ReconciliationResult, Reconciler, ReferenceSource, SOURCE_COLUMN, SourceEntry,
        SourceStatus, collect_sources,
    },
    table::Table,
};
use encoding_rs::WINDOWS_1255;

use common::{REFERENCE_HEADER, SCAN_HEADER, csv, with_unsupported_compression, zip_archive};

fn normalized(text: &str) -> Table {
    let normalizer = Normalizer::default();
    let reader = TabularReader::new(normalizer.aliases(), WINDOWS_1255);
    let source = reader.read("table.csv", text.as_bytes()).expect("readable csv");
    normalizer.normalize(source.table)
}

fn scan_table() -> Table {
    normalized(&csv(
        SCAN_HEADER,
        &[
            "1-1-1,05/01/2024,100,1,חיפה,01/02/2024",
            "1-1-2,06/01/2024,200,1,חיפה,01/02/2024",
            "1-1-2,06/01/2024,200,1,חיפה,01/02/2024",
            "7-7-7,06/01/2024,700,1,עכו,01/02/2024",
        ],
    ))
}

fn reconcile(scan: &Table, sources: Vec<SourceEntry>) -> ReconciliationResult {
    let config = ReconConfig::default();
    let normalizer = Normalizer::default();
    let inferrer = ContextInferrer::from_config(&config);
    let reader = TabularReader::new(normalizer.aliases(), WINDOWS_1255);
    Reconciler::new(reader, &normalizer, &inferrer).reconcile(scan, sources)
}

fn ready(name: &str, contents: &str) -> SourceEntry {
    SourceEntry::Ready(ReferenceSource {
        name: name.to_string(),
        bytes: contents.as_bytes().to_vec(),
    })
}

fn parcels(table: &Table) -> Vec<String> {
    table
        .column_values("parcel_id")
        .into_iter()
        .map(Value::as_display)
        .collect()
}

#[test]
fn set_difference_reports_only_unmatched_reference_rows() {
    let reference = csv(
        REFERENCE_HEADER,
        &[
            "1-1-1,05/01/2024,100,1,חיפה",
            "1-1-2,06/01/2024,200,1,חיפה",
            "1-1-3,07/01/2024,300,1,חיפה",
        ],
    );
    let result = reconcile(
        &scan_table(),
        vec![ready("חיפה-01.01.24-31.01.24.csv", &reference)],
    );

    let report = &result.sources[0];
    assert_eq!(report.status, SourceStatus::Ok);
    assert_eq!(report.missing_count, 1);
    assert_eq!(report.scan_rows_filtered, 3);
    assert_eq!(parcels(&result.missing), vec!["1-1-3"]);
    assert_eq!(result.summary.missing_total, 1);
    assert_eq!(result.summary.global_missing_pct, 33.33);
}

#[test]
fn reference_is_filtered_by_its_inferred_dates() {
    let reference = csv(
        REFERENCE_HEADER,
        &[
            "1-1-1,05/01/2024,100,1,חיפה",
            "1-1-9,05/03/2024,900,1,חיפה",
        ],
    );
    let result = reconcile(
        &scan_table(),
        vec![ready("חיפה-01.01.24-31.01.24.csv", &reference)],
    );
    let report = &result.sources[0];
    assert_eq!(report.reference_rows_total, 2);
    assert_eq!(report.reference_rows_filtered, 1);
    assert_eq!(report.missing_count, 0);
    assert_eq!(report.missing_pct_of_global, 0.0);
}

#[test]
fn batch_member_failure_does_not_block_siblings() {
    let first = csv(REFERENCE_HEADER, &["1-1-9,05/01/2024,900,1,חיפה"]);
    let third = csv(REFERENCE_HEADER, &["7-7-8,06/01/2024,800,1,עכו"]);
    let archive = zip_archive(&[
        ("חיפה-01.01.24-31.01.24.csv", first.as_bytes()),
        ("broken.xlsx", &b"\x00\x01 definitely not a workbook"[..]),
        ("nested/עכו-01.01.24-31.01.24.csv", third.as_bytes()),
    ]);
    let sources = collect_sources("batch.zip", archive);
    assert_eq!(sources.len(), 3);

    let result = reconcile(&scan_table(), sources);
    let statuses = result
        .sources
        .iter()
        .map(|r| matches!(r.status, SourceStatus::Ok))
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec![true, false, true]);
    assert_eq!(result.summary.ok_count, 2);
    assert_eq!(result.summary.error_count, 1);
    assert_eq!(result.sources[2].source, "nested_עכו-01.01.24-31.01.24.csv");

    let tags = result
        .missing
        .column_values(SOURCE_COLUMN)
        .into_iter()
        .map(Value::as_display)
        .collect::<Vec<_>>();
    assert_eq!(
        tags,
        vec![
            "חיפה-01.01.24-31.01.24.csv".to_string(),
            "nested_עכו-01.01.24-31.01.24.csv".to_string()
        ]
    );
    assert_eq!(parcels(&result.missing), vec!["1-1-9", "7-7-8"]);
}

#[test]
fn unopenable_archive_member_fails_alone() {
    let good = csv(REFERENCE_HEADER, &["1-1-9,05/01/2024,900,1,חיפה"]);
    let archive = with_unsupported_compression(
        zip_archive(&[
            ("חיפה-01.01.24-31.01.24.csv", good.as_bytes()),
            ("bad.csv", good.as_bytes()),
            ("עכו-01.01.24-31.01.24.csv", good.as_bytes()),
        ]),
        "bad.csv",
    );
    let sources = collect_sources("batch.zip", archive);
    let listed = sources
        .iter()
        .map(|entry| match entry {
            SourceEntry::Ready(source) => (true, source.name.clone()),
            SourceEntry::Unreadable { name, .. } => (false, name.clone()),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        listed,
        vec![
            (true, "חיפה-01.01.24-31.01.24.csv".to_string()),
            (false, "bad.csv".to_string()),
            (true, "עכו-01.01.24-31.01.24.csv".to_string()),
        ]
    );

    let result = reconcile(&scan_table(), sources);
    assert_eq!(result.summary.ok_count, 2);
    assert_eq!(result.summary.error_count, 1);
    assert!(matches!(
        &result.sources[1].status,
        SourceStatus::Error { message } if message.contains("batch.zip")
    ));
}

#[test]
fn explicit_area_code_scopes_the_scan() {
    let scan = normalized(&csv(
        SCAN_HEADER,
        &[
            "6650-1-1,05/01/2024,100,1,חיפה,01/02/2024",
            "6651-1-1,05/01/2024,100,1,חיפה,01/02/2024",
        ],
    ));
    let reference = csv(
        REFERENCE_HEADER,
        &["6650-1-1,05/01/2024,100,1,חיפה", "6651-1-1,05/01/2024,100,1,חיפה"],
    );
    let normalizer = Normalizer::default();
    let inferrer =
        ContextInferrer::from_config(&ReconConfig::default()).with_explicit(ExplicitContext {
            dates: None,
            area_codes: vec!["6650".into()],
            location_name: None,
        });
    let reader = TabularReader::new(normalizer.aliases(), WINDOWS_1255);
    let result = Reconciler::new(reader, &normalizer, &inferrer)
        .reconcile(&scan, vec![ready("01.01.24_31.01.24.csv", &reference)]);

    let report = &result.sources[0];
    let context = report.context.as_ref().unwrap();
    assert_eq!(context.evidence.location, Some(ContextSource::Explicit));
    let location = context.location.as_ref().unwrap();
    assert_eq!(location.kind, LocationKind::ByAreaCode);
    assert_eq!(location.display_value(), "6650");
    assert_eq!(report.scan_rows_filtered, 1);
    assert_eq!(parcels(&result.missing), vec!["6651-1-1"]);
}

#[test]
fn markup_disguised_as_spreadsheet_is_reconciled() {
    let html = r#"<html><body>
        <table>
          <tr><td>נתוני עסקאות</td></tr>
          <tr><td>חיפה</td></tr>
          <tr><td>01/01/2024 - 31/01/2024</td></tr>
        </table>
        <table>
          <tr><th>גוש חלקה</th><th>יום מכירה</th><th>תמורה מוצהרת בש"ח</th><th>ישוב</th></tr>
          <tr><td>1-1-1</td><td>05/01/2024</td><td>100</td><td>חיפה</td></tr>
          <tr><td>1-1-4</td><td>09/01/2024</td><td>1,400</td><td>חיפה</td></tr>
        </table>
    </body></html>"#;
    let result = reconcile(&scan_table(), vec![ready("export.xls", html)]);

    let report = &result.sources[0];
    assert_eq!(report.status, SourceStatus::Ok);
    let context = report.context.as_ref().unwrap();
    assert_eq!(context.evidence.dates, Some(ContextSource::MetadataCells));
    assert_eq!(context.evidence.location, Some(ContextSource::MetadataCells));
    assert_eq!(parcels(&result.missing), vec!["1-1-4"]);
}

#[test]
fn area_code_context_buckets_padded_parcels_together() {
    let scan = normalized(&csv(
        SCAN_HEADER,
        &[
            "028048-0058-010-00,27/01/2025,100,1,חיפה,01/06/2025",
            "6650-1-1,27/01/2025,100,1,עכו,01/06/2025",
        ],
    ));
    assert_eq!(area_codes(&scan).len(), 2);

    let reference = csv(
        REFERENCE_HEADER,
        &[
            "028048-0058-010-00,27/01/2025,100,1,חיפה",
            "28048-99-1-00,28/05/2025,500,1,חיפה",
        ],
    );
    let result = reconcile(
        &scan,
        vec![ready("גוש 28048-28.05.25-27.01.25.csv", &reference)],
    );
    let report = &result.sources[0];
    let context = report.context.as_ref().unwrap();
    let location = context.location.as_ref().unwrap();
    assert_eq!(location.kind, LocationKind::ByAreaCode);
    assert!(location.values.contains("28048"));
    let dates = context.dates.unwrap();
    assert_eq!(dates.from, NaiveDate::from_ymd_opt(2025, 1, 27).unwrap());
    assert_eq!(dates.to, NaiveDate::from_ymd_opt(2025, 5, 28).unwrap());
    assert_eq!(report.scan_rows_filtered, 1);
    assert_eq!(parcels(&result.missing), vec!["28048-99-1-00"]);
}

#[test]
fn location_falls_back_to_reference_values() {
    let reference = csv(
        REFERENCE_HEADER,
        &["1-1-1,05/01/2024,100,1,חיפה", "1-1-5,08/01/2024,500,1,חיפה"],
    );
    // Only dates in the name; the location comes from the rows themselves.
    let result = reconcile(&scan_table(), vec![ready("01.01.24_31.01.24.csv", &reference)]);
    let context = result.sources[0].context.as_ref().unwrap();
    assert_eq!(context.evidence.location, Some(ContextSource::ReferenceTable));
    assert_eq!(result.sources[0].scan_rows_filtered, 3);
    assert_eq!(parcels(&result.missing), vec!["1-1-5"]);
}

#[test]
fn duplicate_groups_respect_threshold_and_order() {
    let scan = normalized(&csv(
        SCAN_HEADER,
        &[
            "A,01/01/2024,1,1,x,01/02/2024",
            "B,01/01/2024,1,1,x,01/02/2024",
            "D,01/01/2024,1,1,x,01/02/2024",
            "C,01/01/2024,1,1,x,01/02/2024",
            "D,01/01/2024,1,1,x,01/02/2024",
            "C,01/01/2024,1,1,x,01/02/2024",
            "D,01/01/2024,1,1,x,01/02/2024",
        ],
    ));

    let summary = find_duplicates(&scan, DuplicateMode::Summary).unwrap();
    assert_eq!(summary.len(), 2);
    assert_eq!(parcels(&summary), vec!["D", "C"]);
    let counts = summary
        .column_values("count")
        .into_iter()
        .map(Value::as_display)
        .collect::<Vec<_>>();
    assert_eq!(counts, vec!["3", "2"]);

    let rows = find_duplicates(&scan, DuplicateMode::Rows).unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(parcels(&rows), vec!["C", "C", "D", "D", "D"]);
}

#[test]
fn zero_row_tables_give_empty_results() {
    let empty_scan = normalized(&csv(SCAN_HEADER, &[]));
    assert!(find_duplicates(&empty_scan, DuplicateMode::Summary).unwrap().is_empty());
    assert!(find_duplicates(&Table::default(), DuplicateMode::Rows).unwrap().is_empty());

    let reference = csv(REFERENCE_HEADER, &[]);
    let result = reconcile(
        &empty_scan,
        vec![ready("חיפה-01.01.24-31.01.24.csv", &reference)],
    );
    assert_eq!(result.summary.ok_count, 1);
    assert!(result.missing.is_empty());
    assert_eq!(result.summary.global_missing_pct, 0.0);
}
