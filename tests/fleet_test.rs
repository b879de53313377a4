use bytes::Bytes;
use sensor_gateway::codec::CharacteristicInfo;
use sensor_gateway::transport::Advertisement;
use sensor_gateway::transport::simulated::{RadioEvent, SimulatedDevice, SimulatedRadio};
use sensor_gateway::{
    AttributeTable, DeviceAddress, Directive, Gateway, GatewayConfig, GatewayError,
    MemoryRecordStore, OperatorSpec,
};
use std::sync::Arc;
use std::time::Duration;

const DUMP: [&[u8]; 3] = [b"t,o2\n1,2", b"0.9\x08t,o2\n", b"2,21.0\x08"];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn address(last: u8) -> DeviceAddress {
    DeviceAddress::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last])
}

fn sensor(radio: &SimulatedRadio, last: u8, dump: &[&[u8]]) -> DeviceAddress {
    let attributes = AttributeTable::default();
    let address = address(last);
    radio.add_device(
        SimulatedDevice::new(address)
            .with_advertisement(
                Advertisement::new(address)
                    .with_service(attributes.service)
                    .with_name(format!("o2-{last}")),
            )
            .with_characteristic(
                attributes.service,
                CharacteristicInfo {
                    uuid: attributes.temperature,
                    description: "Temperature".into(),
                    presentation_format: 0x14,
                },
                21.5f32.to_le_bytes().to_vec(),
            )
            .replying_to_value(
                attributes.is_logging,
                &[0x00],
                dump.iter().map(|c| Bytes::copy_from_slice(c)),
            ),
    );
    radio.advertise_every(
        address,
        Duration::from_millis(100 * u64::from(last)),
        Duration::from_secs(2),
        3,
    );
    address
}

fn gateway(radio: &SimulatedRadio, store: &Arc<MemoryRecordStore>, config: GatewayConfig) -> Gateway {
    Gateway::builder()
        .with_config(config)
        .with_transport(Arc::new(radio.clone()))
        .with_store(store.clone())
        .build()
        .unwrap()
}

fn seeded() -> GatewayConfig {
    GatewayConfig {
        rng_seed: Some(7),
        ..GatewayConfig::default()
    }
}

fn assert_one_connection_at_a_time(events: &[RadioEvent]) {
    let mut open: Option<DeviceAddress> = None;
    for event in events {
        match event {
            RadioEvent::Connected(a) => {
                assert!(open.is_none(), "{a} connected while {open:?} was still open");
                open = Some(*a);
            }
            RadioEvent::Disconnected(a) => {
                assert_eq!(open, Some(*a));
                open = None;
            }
            _ => {}
        }
    }
    assert!(open.is_none(), "{open:?} never disconnected");
}

#[tokio::test(start_paused = true)]
async fn test_round_tests_sampled_devices_one_at_a_time() {
    init_logger();
    let radio = SimulatedRadio::new();
    let fleet = [sensor(&radio, 1, &DUMP), sensor(&radio, 2, &DUMP), sensor(&radio, 3, &DUMP)];
    let store = Arc::new(MemoryRecordStore::new());
    let gateway = gateway(&radio, &store, seeded());

    let outcomes = gateway
        .run_tests(Duration::from_secs(30), 4)
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[0].offset, Duration::ZERO);
    assert!(outcomes.windows(2).all(|w| w[0].offset <= w[1].offset));
    for outcome in &outcomes {
        assert!(fleet.contains(&outcome.address));
        let report = outcome.result.as_ref().unwrap();
        assert_eq!(report.device_id, outcome.address.to_device_id());
        assert_eq!(report.characteristics.len(), 1);
        assert!(report.characteristics[0].starts_with("Temperature: "));
    }

    // Two log files per dump, one dump per test.
    let records = store.records();
    assert_eq!(records.len(), 8);
    assert!(
        records
            .chunks(2)
            .all(|pair| pair[0].1 == b"t,o2\n1,20.9"[..] && pair[1].1 == b"t,o2\n2,21.0"[..])
    );

    assert_one_connection_at_a_time(&radio.events());
    assert_eq!(gateway.sessions().active_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_device_writes_logging_sequence() {
    init_logger();
    let radio = SimulatedRadio::new();
    let device = sensor(&radio, 1, &DUMP);
    let store = Arc::new(MemoryRecordStore::new());
    let gateway = gateway(&radio, &store, GatewayConfig::default());
    let is_logging = gateway.config().attributes.is_logging;

    let started = tokio::time::Instant::now();
    gateway.test_device(device).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(10));
    let writes = radio.writes(device);
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].0, is_logging);
    assert_eq!(writes[0].1.len(), 8);
    assert_eq!(writes[1], (is_logging, vec![0x00]));
    assert_eq!(store.records().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_dump_fails_only_that_device() {
    init_logger();
    let radio = SimulatedRadio::new();
    let stalled = sensor(&radio, 1, &[b"t,o2\n1,20.9".as_slice()]);
    let healthy = sensor(&radio, 2, &DUMP);
    let store = Arc::new(MemoryRecordStore::new());
    let config = GatewayConfig {
        drain_timeout: Duration::from_secs(5),
        ..GatewayConfig::default()
    };
    let gateway = gateway(&radio, &store, config);

    let err = gateway.test_device(stalled).await.err().unwrap();
    assert!(matches!(err, GatewayError::Operator { .. }), "{err}");
    assert!(radio.events().contains(&RadioEvent::Disconnected(stalled)));

    gateway.test_device(healthy).await.unwrap();
    assert_eq!(store.records().len(), 2);
    assert_one_connection_at_a_time(&radio.events());
}

#[tokio::test(start_paused = true)]
async fn test_empty_fleet_runs_no_tests() {
    init_logger();
    let radio = SimulatedRadio::new();
    let store = Arc::new(MemoryRecordStore::new());
    let gateway = gateway(&radio, &store, seeded());

    let outcomes = gateway.run_tests(Duration::from_secs(30), 5).await.unwrap();

    assert!(outcomes.is_empty());
    assert!(
        !radio
            .events()
            .iter()
            .any(|e| matches!(e, RadioEvent::ConnectAttempt(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_scan_cancels_the_round() {
    init_logger();
    let radio = SimulatedRadio::new();
    sensor(&radio, 1, &DUMP);
    let store = Arc::new(MemoryRecordStore::new());
    let gateway = gateway(&radio, &store, seeded());

    let shutdown = gateway.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();
    });

    let err = gateway
        .run_tests(Duration::from_secs(30), 3)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GatewayError::Cancelled));
    assert_eq!(radio.events().last(), Some(&RadioEvent::ScanStopped));
}

#[tokio::test(start_paused = true)]
async fn test_directives_store_dump_of_selected_devices() {
    init_logger();
    let radio = SimulatedRadio::new();
    let chosen = sensor(&radio, 1, &DUMP);
    sensor(&radio, 2, &DUMP);
    let store = Arc::new(MemoryRecordStore::new());
    let gateway = gateway(&radio, &store, GatewayConfig::default());

    let disable = "disable-logging"
        .parse::<OperatorSpec>()
        .unwrap()
        .into_operator(&gateway.config().attributes)
        .unwrap();
    let report = gateway
        .run_directives([
            Directive::device_ids([chosen.to_device_id().as_str()]).unwrap(),
            disable.into(),
        ])
        .await
        .unwrap();

    assert_eq!(report.addresses(), vec![chosen]);
    assert_eq!(report.succeeded(), 1);
    assert!(!radio.events().contains(&RadioEvent::ScanStarted));
    let records = store.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|(id, _)| *id == chosen.to_device_id()));
}

#[tokio::test(start_paused = true)]
async fn test_directives_with_name_filter_scan_the_fleet() {
    init_logger();
    let radio = SimulatedRadio::new();
    sensor(&radio, 1, &DUMP);
    let second = sensor(&radio, 2, &DUMP);
    let store = Arc::new(MemoryRecordStore::new());
    let gateway = gateway(&radio, &store, GatewayConfig::default());

    let report = gateway
        .run_directives([
            Directive::name_prefix("o2-2"),
            Directive::operator(sensor_gateway::operators::list_characteristics()),
        ])
        .await
        .unwrap();

    assert_eq!(report.addresses(), vec![second]);
    assert_eq!(report.succeeded(), 1);
    assert_one_connection_at_a_time(&radio.events());
}
