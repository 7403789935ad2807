// Configuration loading tests

use relaynode::{config, ConnectionOptions, RelayMetrics};
use std::fs;
use std::time::Duration;

#[test]
fn file_config_maps_onto_connection_options() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("relay.toml");
    fs::write(
        &path,
        r#"[server]
listen = "127.0.0.1:18336"
quiet = true

[relay]
txn_cache_capacity = 250
block_cache_capacity = 16
initial_throttle_ms = 5

[metrics]
bind = "127.0.0.1:19100"
"#,
    )
    .unwrap();

    let cfg = config::load(&path).expect("config loads");
    assert_eq!(cfg.server.listen, "127.0.0.1:18336");
    assert!(cfg.server.quiet);
    assert_eq!(cfg.metrics.bind, "127.0.0.1:19100");
    assert_eq!(cfg.relay.read_buffer_bytes, 64 * 1024);

    let opts = ConnectionOptions::from_config(&cfg.relay, RelayMetrics::default()).unwrap();
    assert_eq!(opts.txn_cache_capacity.get(), 250);
    assert_eq!(opts.block_cache_capacity.get(), 16);
    assert_eq!(opts.throttle_delay, Duration::from_millis(5));
}

#[test]
fn invalid_toml_is_reported() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("broken.toml");
    fs::write(&path, "[relay\ntxn_cache_capacity = ").unwrap();
    let err = config::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("invalid TOML"));
}

#[test]
fn defaults_match_relay_constants() {
    let opts = ConnectionOptions::from_config(&config::Relay::default(), RelayMetrics::default()).unwrap();
    let builtin = ConnectionOptions::default();
    assert_eq!(opts.txn_cache_capacity, builtin.txn_cache_capacity);
    assert_eq!(opts.block_cache_capacity, builtin.block_cache_capacity);
    assert_eq!(opts.throttle_delay, builtin.throttle_delay);
}
