// Integration test: registry bookkeeping, observer registration and
// adapter-wide operations.

mod common;

use common::*;
use gattlane_core::{
    ConnectFailure, ConnectionConfiguration, ConnectionHandle, ConnectionState, Device,
    EventObserver, RadioAdapter, Registry, RegistryError, RequestDescriptor, RequestError,
    ScannerKind, SimulatedTransport, ThreadMode,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn wait_for_state(handle: &ConnectionHandle, state: ConnectionState) {
    for _ in 0..500 {
        if handle.state() == state {
            return;
        }
        sleep(Duration::from_millis(2)).await;
    }
    panic!("{:?} never reached {:?}", handle, state);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_leave_one_entry() {
    init_tracing();
    let (_sim, registry) = rig(&[ADDR_A]);
    let registry = Arc::new(registry);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.connect(Device::new(ADDR_A), None, None).unwrap()
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }
    sleep(Duration::from_millis(300)).await;

    assert_eq!(registry.connections().len(), 1);
    let live: Vec<_> = handles.iter().filter(|h| !h.is_released()).collect();
    assert_eq!(live.len(), 1);
    let current = registry.connection(&addr(ADDR_A)).unwrap();
    assert_eq!(current.id(), live[0].id());

    let ids: HashSet<_> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(ids.len(), 8);
    registry.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_replacement_releases_old_connection_silently() {
    init_tracing();
    let (sim, registry) = rig(&[ADDR_A]);
    let first_rec = Recorder::new();
    let first = registry
        .connect(Device::new(ADDR_A), None, observe(&first_rec))
        .unwrap();
    sleep(ms(1000)).await;

    let second = registry.connect(Device::new(ADDR_A), None, None).unwrap();
    sleep(ms(1000)).await;

    assert!(first.is_released());
    assert!(!first_rec.states().contains(&ConnectionState::Released));
    // The old connection's release must not evict its replacement
    let current = registry.connection(&addr(ADDR_A)).unwrap();
    assert_eq!(current.id(), second.id());
    assert_eq!(second.state(), ConnectionState::ServiceDiscovered);
    assert_eq!(sim.open_count(&addr(ADDR_A)), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replacement_waits_for_old_link_to_close() {
    init_tracing();
    let config = ConnectionConfiguration::default()
        .with_discover_services_delay(Duration::ZERO);

    for round in 0..20 {
        let sim = SimulatedTransport::new().with_latency(Duration::ZERO);
        sim.add_peer(ADDR_A, services());
        let registry = Registry::new(RadioAdapter::new(sim.clone()));

        let first = registry
            .connect(Device::new(ADDR_A), Some(config.clone()), None)
            .unwrap();
        wait_for_state(&first, ConnectionState::ServiceDiscovered).await;

        let recorder = Recorder::new();
        let second = registry
            .connect(Device::new(ADDR_A), Some(config.clone()), observe(&recorder))
            .unwrap();
        wait_for_state(&second, ConnectionState::ServiceDiscovered).await;
        sleep(Duration::from_millis(200)).await;

        assert_eq!(sim.open_count(&addr(ADDR_A)), 2, "round {}", round);
        assert!(
            !recorder.states().contains(&ConnectionState::Disconnected),
            "round {}: {:?}",
            round,
            recorder.states()
        );
        assert_eq!(second.state(), ConnectionState::ServiceDiscovered);
        assert!(sim.is_link_open(&addr(ADDR_A)));
        registry.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_release_waits_for_close() {
    init_tracing();
    let (sim, registry) = rig(&[ADDR_A]);
    registry.connect(Device::new(ADDR_A), None, None).unwrap();
    sleep(ms(1000)).await;

    registry.release(&addr(ADDR_A)).unwrap();
    let recorder = Recorder::new();
    let handle = registry
        .connect(Device::new(ADDR_A), None, observe(&recorder))
        .unwrap();
    sleep(ms(1000)).await;

    assert_eq!(handle.state(), ConnectionState::ServiceDiscovered);
    assert_eq!(
        recorder.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::ServiceDiscovering,
            ConnectionState::ServiceDiscovered,
        ]
    );
    assert_eq!(sim.open_count(&addr(ADDR_A)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_observer_registration_is_idempotent() {
    init_tracing();
    let (_sim, registry) = rig(&[ADDR_A]);
    let recorder = Recorder::new();
    let observer: Arc<dyn EventObserver> = recorder.clone();

    assert!(registry.register_observer(observer.clone(), ThreadMode::Posting, None));
    assert!(!registry.register_observer(observer.clone(), ThreadMode::Dedicated, None));
    assert!(registry.is_observer_registered(&observer));

    registry.connect(Device::new(ADDR_A), None, None).unwrap();
    sleep(ms(1000)).await;
    assert_eq!(recorder.count_state(ConnectionState::Connecting), 1);
    assert_eq!(recorder.count_state(ConnectionState::ServiceDiscovered), 1);

    assert!(registry.unregister_observer(&observer));
    assert!(!registry.is_observer_registered(&observer));
}

#[tokio::test(start_paused = true)]
async fn test_dedicated_observer_sees_same_sequence() {
    init_tracing();
    let (_sim, registry) = rig(&[ADDR_A]);
    let posting = Recorder::new();
    let dedicated = Recorder::new();
    registry.register_observer(posting.clone(), ThreadMode::Posting, None);
    registry.register_observer(dedicated.clone(), ThreadMode::Dedicated, None);

    let handle = registry.connect(Device::new(ADDR_A), None, None).unwrap();
    sleep(ms(1000)).await;
    handle.submit(RequestDescriptor::read_rssi()).await.unwrap().unwrap();
    sleep(ms(10)).await;

    assert_eq!(posting.all(), dedicated.all());
    assert_eq!(dedicated.request_events(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unconnectable_device_is_refused() {
    init_tracing();
    let (sim, registry) = rig(&[ADDR_A]);
    let local = Recorder::new();
    let global = Recorder::new();
    registry.register_observer(global.clone(), ThreadMode::Posting, None);

    let result = registry.connect(
        Device::new(ADDR_A).with_connectable(false),
        None,
        observe(&local),
    );
    assert!(matches!(result, Err(RegistryError::UnconnectableDevice(_))));
    assert_eq!(local.connect_failures(), vec![ConnectFailure::Unconnectable]);
    assert_eq!(global.connect_failures(), vec![ConnectFailure::Unconnectable]);
    assert!(registry.connection(&addr(ADDR_A)).is_none());

    sleep(ms(1000)).await;
    assert_eq!(sim.open_count(&addr(ADDR_A)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connection_order() {
    init_tracing();
    let (_sim, registry) = rig(&[ADDR_A, ADDR_B, ADDR_C]);
    for address in [ADDR_A, ADDR_B, ADDR_C] {
        registry.connect(Device::new(address), None, None).unwrap();
    }

    let ordered: Vec<_> = registry
        .ordered_connections()
        .iter()
        .map(|h| h.address().clone())
        .collect();
    assert_eq!(ordered, vec![addr(ADDR_A), addr(ADDR_B), addr(ADDR_C)]);
    assert_eq!(registry.first_connection().unwrap().address(), &addr(ADDR_A));
    assert_eq!(registry.last_connection().unwrap().address(), &addr(ADDR_C));

    registry.release(&addr(ADDR_B)).unwrap();
    sleep(ms(100)).await;
    let ordered: Vec<_> = registry
        .ordered_connections()
        .iter()
        .map(|h| h.address().clone())
        .collect();
    assert_eq!(ordered, vec![addr(ADDR_A), addr(ADDR_C)]);
    assert!(matches!(
        registry.release(&addr(ADDR_B)),
        Err(RegistryError::ConnectionNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_tag_filtered_observer() {
    init_tracing();
    let (_sim, registry) = rig(&[ADDR_A]);
    let tagged = Recorder::new();
    registry.register_observer(tagged.clone(), ThreadMode::Posting, Some("ota".to_string()));

    registry.connect(Device::new(ADDR_A), None, None).unwrap();
    sleep(ms(1000)).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    registry
        .execute(&addr(ADDR_A), RequestDescriptor::read_rssi().with_tag("poll"))
        .unwrap();
    registry
        .execute(&addr(ADDR_A), RequestDescriptor::read_rssi())
        .unwrap();
    registry
        .execute(
            &addr(ADDR_A),
            RequestDescriptor::read_rssi()
                .with_tag("ota")
                .with_callback(move |result| {
                    let _ = tx.send(result);
                }),
        )
        .unwrap();
    assert!(rx.await.unwrap().is_ok());
    sleep(ms(10)).await;

    assert_eq!(tagged.completed_tags(), vec!["ota"]);
    assert_eq!(tagged.request_events(), 1);
    assert!(tagged.states().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_execute_without_connection() {
    init_tracing();
    let (_sim, registry) = rig(&[]);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let result = registry.execute(
        &addr(ADDR_A),
        RequestDescriptor::read_rssi().with_callback(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert!(matches!(result, Err(RegistryError::ConnectionNotFound(_))));
    assert_eq!(rx.await.unwrap(), Err(RequestError::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_adapter_events_and_scanning() {
    init_tracing();
    let (sim, registry) = rig(&[ADDR_A]);
    let recorder = Recorder::new();
    registry.register_observer(recorder.clone(), ThreadMode::Posting, None);

    registry.start_scan().unwrap();
    assert_eq!(registry.scanner_kind(), Some(ScannerKind::Le));
    assert!(sim.is_scanning(ScannerKind::Le));

    registry.on_device_discovered(Device::new(ADDR_B).with_name("beacon"));
    assert!(recorder.all().contains(&Seen::Discovered(addr(ADDR_B))));

    registry.disable_adapter().unwrap();
    registry.on_adapter_state_changed(false).await;
    assert!(!registry.is_scanning());
    assert!(registry.start_scan().is_err());

    registry.enable_adapter().unwrap();
    registry.on_adapter_state_changed(true).await;
    // Repeated reports are ignored
    registry.on_adapter_state_changed(true).await;
    let adapter_events: Vec<_> = recorder
        .all()
        .into_iter()
        .filter(|s| matches!(s, Seen::Adapter(_)))
        .collect();
    assert_eq!(adapter_events, vec![Seen::Adapter(false), Seen::Adapter(true)]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_adapter_off_waits_for_on() {
    init_tracing();
    let (sim, registry) = rig(&[ADDR_A]);
    registry.disable_adapter().unwrap();
    registry.on_adapter_state_changed(false).await;

    let handle = registry.connect(Device::new(ADDR_A), None, None).unwrap();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(sim.open_count(&addr(ADDR_A)), 0);

    registry.enable_adapter().unwrap();
    registry.on_adapter_state_changed(true).await;
    sleep(ms(1000)).await;
    assert_eq!(handle.state(), ConnectionState::ServiceDiscovered);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    init_tracing();
    let (_sim, registry) = rig(&[ADDR_A, ADDR_B]);
    let recorder = Recorder::new();
    registry.register_observer(recorder.clone(), ThreadMode::Posting, None);
    let a = registry.connect(Device::new(ADDR_A), None, None).unwrap();
    let b = registry.connect(Device::new(ADDR_B), None, None).unwrap();
    sleep(ms(1000)).await;

    registry.shutdown();
    sleep(ms(100)).await;

    assert!(a.is_released());
    assert!(b.is_released());
    assert!(registry.connections().is_empty());
    assert!(registry.bus().is_empty());
}
