use super::*;

#[test]
fn test_parse_target_with_inline_port_and_instance() {
    let target = parse_target(
        "Provider=MSDASQL;Driver={SQL Server};Server=erp.local\\LEGACY,1533;Database=sales;UID=sa;PWD=p@ss",
    )
    .unwrap();

    assert_eq!(target.host, "erp.local");
    assert_eq!(target.instance.as_deref(), Some("LEGACY"));
    assert_eq!(target.port, 1533);
    assert_eq!(target.database.as_deref(), Some("sales"));
    assert_eq!(target.username, "sa");
    assert_eq!(target.password, "p@ss");
}

#[test]
fn test_parse_target_alternate_field_names() {
    let target =
        parse_target("Driver={SQL Server};Host=10.0.0.5;Port=1444;DB=erp;User=reader;Password=x")
            .unwrap();
    assert_eq!(target.host, "10.0.0.5");
    assert_eq!(target.port, 1444);
    assert_eq!(target.database.as_deref(), Some("erp"));
    assert_eq!(target.username, "reader");

    let catalog = parse_target(
        "Driver={SQL Server};Data Source=tcp:db01;Initial Catalog=erp;User ID=reader;Password=x",
    )
    .unwrap();
    assert_eq!(catalog.host, "db01");
    assert_eq!(catalog.port, 1433);
    assert_eq!(catalog.database.as_deref(), Some("erp"));
}

#[test]
fn test_dsn_only_string_is_rejected() {
    let err = parse_target("DSN=LegacyErp;UID=sa;PWD=secret").unwrap_err();
    assert!(err.contains("LegacyErp"));
    assert!(!err.contains("secret"));

    assert!(parse_target("Server=db;Port=abc").is_err());
}

#[test]
fn test_driver_identifiers() {
    let driver = MssqlDriver::new();
    assert!(driver.identifiers().contains(&"sql server"));
}
