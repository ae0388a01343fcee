//! Settings files and command-line overrides.

use std::io::Write;
use std::time::Duration;

use outbox_relay::{BrokerOpts, RelaySettings, SettingsError, SourceOpts};
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_settings_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
source:
  uri: "postgresql://relay:secret@db:5432/erp"
  table: outbox
  notification_channel: erp_outbox
broker:
  uri: "amqp://mq:5672/%2f"
  username: relay
  password: secret
  exchange: erp
  routes:
    Documents.Receipt:
      routing_key: receipts
      queue: receipts-archive
messages_per_transaction: 250
notification_timeout: 3m
"#
    )
    .unwrap();

    let settings = RelaySettings::from_file(file.path()).unwrap();
    assert_ok!(settings.validate());
    assert_eq!(settings.messages_per_transaction, 250);
    assert_eq!(settings.notification_timeout, Duration::from_secs(180));
    assert_eq!(settings.source.notification_channel, "erp_outbox");
    assert_eq!(settings.broker.credentials().unwrap().password, "secret");

    let bindings = settings.broker.router().bindings();
    assert_eq!(bindings.len(), 2);
    assert_eq!(bindings[0].queue, "outbox-relay");
    assert_eq!(bindings[0].exchange, "erp");
    assert_eq!(bindings[1].queue, "receipts-archive");
    assert_eq!(bindings[1].exchange, "erp");
}

#[test]
fn test_missing_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = RelaySettings::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, SettingsError::IoError(_)));
}

#[test]
fn test_invalid_duration_in_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "confirm_timeout: soon").unwrap();
    let err = RelaySettings::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Invalid duration value: soon"));
}

#[test]
fn test_source_uri_wins_over_parts() {
    let opts = SourceOpts {
        source_uri: Some("host=db dbname=erp".to_string()),
        source_host: Some("ignored".to_string()),
        ..SourceOpts::default()
    };
    assert_eq!(
        opts.connection_string().unwrap().as_deref(),
        Some("host=db dbname=erp")
    );
}

#[test]
fn test_source_parts_are_assembled_and_quoted() {
    let opts = SourceOpts {
        source_host: Some("db.internal".to_string()),
        source_port: Some(6432),
        source_database: Some("erp".to_string()),
        source_user: Some("relay".to_string()),
        source_password: Some("it's secret".to_string()),
        ..SourceOpts::default()
    };
    assert_eq!(
        opts.connection_string().unwrap().as_deref(),
        Some(r"host=db.internal port=6432 dbname=erp user=relay password='it\'s secret'")
    );
}

#[test]
fn test_source_parts_need_host_and_database() {
    let no_host = SourceOpts {
        source_database: Some("erp".to_string()),
        ..SourceOpts::default()
    };
    let err = assert_err!(no_host.connection_string());
    assert_eq!(err.to_string(), "Server address is not defined.");

    let no_database = SourceOpts {
        source_host: Some("db".to_string()),
        ..SourceOpts::default()
    };
    let err = assert_err!(no_database.connection_string());
    assert_eq!(err.to_string(), "Database name is not defined.");

    assert_eq!(assert_ok!(SourceOpts::default().connection_string()), None);
}

#[test]
fn test_overrides_apply_on_top_of_file() {
    let mut settings = RelaySettings::from_yaml("source:\n  table: erp.outbox\n").unwrap();
    let source = SourceOpts {
        source_uri: Some("postgresql://localhost/erp".to_string()),
        ..SourceOpts::default()
    };
    let broker = BrokerOpts {
        exchange: Some("erp-events".to_string()),
        routing_key: Some("erp.{message_type}".to_string()),
        ..BrokerOpts::default()
    };

    source.apply(&mut settings.source).unwrap();
    broker.apply(&mut settings.broker);

    assert_eq!(settings.source.table, "erp.outbox");
    assert_eq!(settings.source.uri, "postgresql://localhost/erp");
    let route = settings.broker.router().route("Catalog.Products");
    assert_eq!(route.exchange, "erp-events");
    assert_eq!(route.routing_key, "erp.Catalog.Products");
}
