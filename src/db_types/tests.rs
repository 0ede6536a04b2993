use super::*;
use chrono::TimeZone;

#[test]
fn test_row_lookup_falls_back_to_case_insensitive_match() {
    let row: Row = vec![("NAME", CellValue::text("Alice")), ("name", CellValue::text("bob"))]
        .into_iter()
        .collect();
    assert_eq!(row.get("name"), Some(&CellValue::text("bob")));

    let upper_only: Row = vec![("CLIENT_ID", CellValue::Integer(7))].into_iter().collect();
    assert_eq!(upper_only.get("client_id"), Some(&CellValue::Integer(7)));
    assert_eq!(upper_only.get("missing"), None);
}

#[test]
fn test_row_insert_replaces_existing_column() {
    let mut row = Row::new();
    row.insert("a", CellValue::Integer(1));
    row.insert("b", CellValue::Integer(2));
    row.insert("a", CellValue::Integer(3));

    assert_eq!(row.len(), 2);
    assert_eq!(row.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(row.get("a"), Some(&CellValue::Integer(3)));
}

#[test]
fn test_row_serializes_in_column_order() {
    let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
    let row: Row = vec![
        ("z", CellValue::Bool(true)),
        ("a", CellValue::Number(1.5)),
        ("at", CellValue::Timestamp(timestamp)),
        ("nothing", CellValue::Null),
    ]
    .into_iter()
    .collect();

    let json = serde_json::to_string(&row).unwrap();
    assert_eq!(
        json,
        r#"{"z":true,"a":1.5,"at":"2024-03-01T12:30:00.000Z","nothing":null}"#
    );
}

#[test]
fn test_row_set_from_values_and_csv() {
    let rows = RowSet::from_values(
        vec!["id".to_string(), "name".to_string()],
        vec![
            vec![CellValue::Integer(1), CellValue::text("Ann, Jr")],
            vec![CellValue::Integer(2), CellValue::Null],
        ],
    );

    assert_eq!(rows.len(), 2);
    let csv = rows.to_csv().unwrap();
    assert_eq!(csv, "id,name\n1,\"Ann, Jr\"\n2,\n");
}

#[test]
fn test_non_finite_number_serializes_as_null() {
    assert_eq!(CellValue::Number(f64::NAN).to_json(), serde_json::Value::Null);
    assert_eq!(CellValue::Number(3.0).to_plain_string(), "3");
}

#[test]
fn test_dialect_labels() {
    assert_eq!(SqlDialect::TopN.as_str(), "top_n");
    assert_eq!(SqlDialect::default(), SqlDialect::LimitOffset);
}
