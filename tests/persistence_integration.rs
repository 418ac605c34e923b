//! Durability across store reopen: devices, alerts, configuration.

use std::sync::Arc;

use lanpulse::{
    AlertEngine, AlertSeverity, AlertType, Broadcaster, Device, MetricType, NewAlert, Store,
};

fn file_store(dir: &tempfile::TempDir) -> Store {
    Store::open(dir.path().join("telemetry.db")).expect("store should open")
}

#[test]
fn test_devices_and_config_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = file_store(&dir);
        let device = Device::new(
            "dev-1".to_string(),
            "192.168.3.4".to_string(),
            "ap-attic".to_string(),
            "public".to_string(),
        );
        store.upsert_device(&device).unwrap();
        store.set_config("refresh_interval", "45", None).unwrap();
    }

    let store = file_store(&dir);
    let device = store.get_device("dev-1").unwrap().expect("device persists");
    assert_eq!(device.hostname, "ap-attic");
    assert_eq!(
        store.get_config_value("refresh_interval").unwrap().as_deref(),
        Some("45")
    );
}

#[test]
fn test_alert_engine_rehydrates_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let alert_id = {
        let store = file_store(&dir);
        let device = Device::new(
            "dev-1".to_string(),
            "192.168.3.4".to_string(),
            "ap-attic".to_string(),
            "public".to_string(),
        );
        store.upsert_device(&device).unwrap();

        let engine = AlertEngine::new(store, Arc::new(Broadcaster::new()));
        let alert = engine.create(NewAlert {
            device_id: "dev-1".to_string(),
            device_ip: "192.168.3.4".to_string(),
            alert_type: AlertType::Memory,
            severity: AlertSeverity::Warning,
            message: "Memory usage 82% exceeds warning threshold (80%)".to_string(),
            metadata: None,
        });
        alert.id
    };

    let store = file_store(&dir);
    let engine = AlertEngine::new(store, Arc::new(Broadcaster::new()));
    assert_eq!(engine.load().unwrap(), 1);

    let active = engine.active_alerts();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, alert_id);
    // in-memory dedup counters restart at one
    assert_eq!(active[0].occurrence_count, 1);

    // the rehydrated alert still dedups new occurrences
    let again = engine.create(NewAlert {
        device_id: "dev-1".to_string(),
        device_ip: "192.168.3.4".to_string(),
        alert_type: AlertType::Memory,
        severity: AlertSeverity::Warning,
        message: "Memory usage 83% exceeds warning threshold (80%)".to_string(),
        metadata: None,
    });
    assert_eq!(again.id, alert_id);
}

#[test]
fn test_device_delete_cascades_children() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);

    let device = Device::new(
        "dev-1".to_string(),
        "192.168.3.4".to_string(),
        "ap-attic".to_string(),
        "public".to_string(),
    );
    store.upsert_device(&device).unwrap();
    store
        .insert_metrics(
            "dev-1",
            &[(MetricType::CpuUsage, 12.0), (MetricType::MemoryUsage, 30.0)],
        )
        .unwrap();

    let engine = AlertEngine::new(store.clone(), Arc::new(Broadcaster::new()));
    engine.create(NewAlert {
        device_id: "dev-1".to_string(),
        device_ip: "192.168.3.4".to_string(),
        alert_type: AlertType::Cpu,
        severity: AlertSeverity::Warning,
        message: "CPU usage 80% exceeds warning threshold (75%)".to_string(),
        metadata: None,
    });

    assert!(store.delete_device("dev-1").unwrap());

    let stats = store.stats().unwrap();
    assert_eq!(stats.devices, 0);
    assert_eq!(stats.metrics, 0, "metrics must cascade");
    assert_eq!(stats.alerts, 0, "alerts must cascade");
}
