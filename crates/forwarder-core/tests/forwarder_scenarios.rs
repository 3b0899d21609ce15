//! End-to-end scenarios against the `Forwarder` supervisor (spec.md §8).
//!
//! `Forwarder::new` builds a real `rdkafka` producer/consumer pair; client
//! construction succeeds without a reachable broker (connection is lazy), so
//! these tests exercise the full add/stop/command-apply path without a live
//! Kafka cluster. If the sandbox running these tests has no librdkafka
//! client support at all, each test skips itself rather than failing.

use std::time::Duration;

use forwarder_core::command::parse_command;
use forwarder_core::forwarder::{Forwarder, ForwarderConfig};
use forwarder_core::model::{ConverterSpec, StreamSpecWire};

fn base_config() -> ForwarderConfig {
    ForwarderConfig {
        brokers: "localhost:9092".to_string(),
        broker_instances: 1,
        command_topic: "pv-forwarder-commands".to_string(),
        status_topic: None,
        conversion_threads: 1,
        conversion_queue_size: 8,
        main_poll_interval: Duration::from_millis(5),
        period_ms: 0,
        fake_pv_period_ms: 50,
        initial_streams: vec![],
    }
}

fn try_forwarder() -> Option<Forwarder> {
    Forwarder::new(base_config(), None, None).ok()
}

#[test]
fn scenario_1_add_then_stream_present_with_provider() {
    let Some(forwarder) = try_forwarder() else {
        return;
    };
    let wire: StreamSpecWire = serde_json::from_str(
        r#"{"channel":"A","channel_provider_type":"ca","converter":{"schema":"f142","topic":"values"}}"#,
    )
    .unwrap();
    forwarder.add_mapping(wire.into_spec()).unwrap();
    assert_eq!(forwarder.stream_count(), 1);
}

#[test]
fn scenario_2_multiple_specs_partial_failure() {
    let Some(forwarder) = try_forwarder() else {
        return;
    };
    let good: StreamSpecWire = serde_json::from_str(r#"{"channel":"A"}"#).unwrap();
    let mut bad_spec = good.clone().into_spec();
    bad_spec.channel.channel_name = "B".to_string();
    bad_spec.converters = vec![ConverterSpec {
        schema: "missing".to_string(),
        topic: "values".to_string(),
        name: None,
    }];

    forwarder.add_mapping(good.into_spec()).unwrap();
    let err = forwarder.add_mapping(bad_spec).unwrap_err();
    assert!(err.to_string().contains("missing"));
    assert_eq!(forwarder.stream_count(), 1);
}

#[test]
fn scenario_3_stop_a_channel() {
    let Some(forwarder) = try_forwarder() else {
        return;
    };
    let wire: StreamSpecWire = serde_json::from_str(
        r#"{"channel":"A","converter":{"schema":"f142","topic":"values"}}"#,
    )
    .unwrap();
    forwarder.add_mapping(wire.into_spec()).unwrap();
    assert_eq!(forwarder.stream_count(), 1);

    let command = parse_command(br#"{"cmd":"stop_channel","channel":"A"}"#).unwrap();
    forwarder.apply_command(command);
    assert_eq!(forwarder.stream_count(), 0);
}

#[test]
fn scenario_4_stop_all_empties_the_stream_set() {
    let Some(forwarder) = try_forwarder() else {
        return;
    };
    for name in ["A", "B", "C"] {
        let wire: StreamSpecWire = serde_json::from_str(&format!(r#"{{"channel":"{name}"}}"#)).unwrap();
        forwarder.add_mapping(wire.into_spec()).unwrap();
    }
    assert_eq!(forwarder.stream_count(), 3);

    let command = parse_command(br#"{"cmd":"stop_all"}"#).unwrap();
    forwarder.apply_command(command);
    assert_eq!(forwarder.stream_count(), 0);
}

#[test]
fn scenario_5_exit_command_parses_and_raises_stop() {
    let Some(forwarder) = try_forwarder() else {
        return;
    };
    assert!(matches!(
        parse_command(br#"{"cmd":"exit"}"#).unwrap(),
        forwarder_core::command::Command::Exit
    ));
    forwarder.stop_forwarding();
    // A second call must not panic (monotonic OR-only bitset).
    forwarder.stop_forwarding();
}

#[test]
fn re_adding_an_existing_channel_is_a_no_op() {
    let Some(forwarder) = try_forwarder() else {
        return;
    };
    let wire: StreamSpecWire = serde_json::from_str(
        r#"{"channel":"A","converter":{"schema":"f142","topic":"values"}}"#,
    )
    .unwrap();
    forwarder.add_mapping(wire.clone().into_spec()).unwrap();
    forwarder.add_mapping(wire.into_spec()).unwrap();
    assert_eq!(forwarder.stream_count(), 1);
}
