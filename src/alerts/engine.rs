//! Active-alert ownership: dedup, lifecycle, auto-resolution
//!
//! One mutex covers the active set and every per-alert mutation, so state
//! transitions for a given alert id are totally ordered. Store writes happen
//! after the in-memory change commits and are best-effort; a failed write is
//! logged and reconciled by a later upsert.

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::types::{Alert, AlertSeverity, AlertStats, AlertType, NewAlert};
use crate::config::ThresholdPair;
use crate::error::{CoreError, CoreResult};
use crate::events::{Broadcaster, Event};
use crate::store::Store;

/// Resolved alerts retained in memory for statistics.
const HISTORY_LIMIT: usize = 1000;

#[derive(Default)]
struct AlertState {
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
}

impl AlertState {
    fn push_history(&mut self, alert: Alert) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(alert);
    }
}

/// The canonical active-alert set.
pub struct AlertEngine {
    store: Store,
    broadcaster: Arc<Broadcaster>,
    state: Mutex<AlertState>,
}

impl AlertEngine {
    pub fn new(store: Store, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            state: Mutex::new(AlertState::default()),
        }
    }

    /// Hydrate the active set from the store.
    pub fn load(&self) -> anyhow::Result<usize> {
        let alerts = self.store.load_active_alerts()?;
        let mut state = self.lock_state();
        state.active.clear();
        for alert in alerts {
            state.active.insert(alert.id.clone(), alert);
        }
        let count = state.active.len();
        if count > 0 {
            tracing::info!("Hydrated {} active alerts from store", count);
        }
        Ok(count)
    }

    /// Create or increment. A matching active alert that is neither
    /// acknowledged nor resolved absorbs the occurrence instead of producing
    /// a duplicate row.
    pub fn create(&self, request: NewAlert) -> Alert {
        let now = Utc::now();

        let (alert, created) = {
            let mut state = self.lock_state();

            let existing = state.active.values_mut().find(|alert| {
                alert.device_id == request.device_id
                    && alert.alert_type == request.alert_type
                    && alert.severity == request.severity
                    && !alert.acknowledged
                    && alert.resolved_at.is_none()
            });

            if let Some(alert) = existing {
                alert.occurrence_count += 1;
                alert.last_occurrence = now;
                (alert.clone(), false)
            } else {
                let alert = Alert {
                    id: Uuid::new_v4().to_string(),
                    device_id: request.device_id,
                    device_ip: request.device_ip,
                    alert_type: request.alert_type,
                    severity: request.severity,
                    message: request.message,
                    acknowledged: false,
                    acknowledged_by: None,
                    acknowledged_at: None,
                    created_at: now,
                    resolved_at: None,
                    resolved_by: None,
                    occurrence_count: 1,
                    last_occurrence: now,
                    metadata: request.metadata,
                };
                state.active.insert(alert.id.clone(), alert.clone());
                (alert, true)
            }
        };

        if created {
            if let Err(e) = self.store.insert_alert(&alert) {
                tracing::warn!("Failed to persist alert {}: {:#}", alert.id, e);
            }
            self.broadcaster.publish(Event::AlertCreated {
                alert: alert.clone(),
            });
            tracing::info!(
                "Alert created: {} {} on {} ({})",
                alert.severity,
                alert.alert_type,
                alert.device_id,
                alert.message
            );
        }

        alert
    }

    pub fn acknowledge(&self, id: &str, who: &str) -> CoreResult<Alert> {
        let now = Utc::now();
        let alert = {
            let mut state = self.lock_state();
            let Some(alert) = state.active.get_mut(id) else {
                drop(state);
                return Err(self.missing_alert_error(id));
            };
            if alert.acknowledged {
                return Err(CoreError::conflict(format!("alert {} already acknowledged", id)));
            }
            alert.acknowledged = true;
            alert.acknowledged_by = Some(who.to_string());
            alert.acknowledged_at = Some(now);
            alert.clone()
        };

        if let Err(e) = self.store.ack_alert(id, who, now) {
            tracing::warn!("Failed to persist acknowledgement of {}: {:#}", id, e);
        }
        self.broadcaster.publish(Event::AlertAcknowledged {
            alert: alert.clone(),
        });
        Ok(alert)
    }

    pub fn resolve(&self, id: &str, who: Option<&str>) -> CoreResult<Alert> {
        let now = Utc::now();
        let alert = {
            let mut state = self.lock_state();
            let Some(mut alert) = state.active.remove(id) else {
                drop(state);
                return Err(self.missing_alert_error(id));
            };
            alert.resolved_at = Some(now);
            alert.resolved_by = who.map(str::to_string);
            state.push_history(alert.clone());
            alert
        };

        if let Err(e) = self.store.resolve_alert(id, who, now) {
            tracing::warn!("Failed to persist resolution of {}: {:#}", id, e);
        }
        self.broadcaster.publish(Event::AlertResolved {
            alert: alert.clone(),
        });
        tracing::info!("Alert resolved: {} on {}", alert.alert_type, alert.device_id);
        Ok(alert)
    }

    pub fn delete(&self, id: &str) -> CoreResult<()> {
        let removed_active = self.lock_state().active.remove(id).is_some();
        let removed_store = self.store.delete_alert(id)?;

        if !removed_active && !removed_store {
            return Err(CoreError::not_found(format!("alert {}", id)));
        }

        self.broadcaster.publish(Event::AlertDeleted { id: id.to_string() });
        Ok(())
    }

    /// Resolve active alerts for `(device, type)` that recovered.
    ///
    /// Usage alerts resolve when the reading drops below the warning line;
    /// offline alerts resolve unconditionally (the caller only invokes this
    /// after a successful poll).
    pub fn auto_resolve(
        &self,
        device_id: &str,
        alert_type: AlertType,
        current_value: f64,
        thresholds: ThresholdPair,
    ) -> Vec<Alert> {
        let now = Utc::now();
        let resolved: Vec<Alert> = {
            let mut state = self.lock_state();
            let ids: Vec<String> = state
                .active
                .values()
                .filter(|alert| alert.device_id == device_id && alert.alert_type == alert_type)
                .filter(|_| match alert_type {
                    AlertType::Offline => true,
                    _ => current_value < thresholds.warning as f64,
                })
                .map(|alert| alert.id.clone())
                .collect();

            ids.into_iter()
                .filter_map(|id| {
                    state.active.remove(&id).map(|mut alert| {
                        alert.resolved_at = Some(now);
                        state.push_history(alert.clone());
                        alert
                    })
                })
                .collect()
        };

        for alert in &resolved {
            if let Err(e) = self.store.resolve_alert(&alert.id, None, now) {
                tracing::warn!("Failed to persist auto-resolution of {}: {:#}", alert.id, e);
            }
            self.broadcaster.publish(Event::AlertResolved {
                alert: alert.clone(),
            });
            tracing::info!(
                "Alert auto-resolved: {} on {} (value back to {:.0})",
                alert.alert_type,
                device_id,
                current_value
            );
        }

        resolved
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let state = self.lock_state();
        let mut alerts: Vec<Alert> = state.active.values().cloned().collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.lock_state().active.get(id).cloned()
    }

    /// Highest severity among a device's unacknowledged active alerts.
    pub fn device_alert_level(&self, device_id: &str) -> Option<AlertSeverity> {
        let state = self.lock_state();
        let mut level = None;
        for alert in state.active.values() {
            if alert.device_id != device_id || alert.acknowledged {
                continue;
            }
            match alert.severity {
                AlertSeverity::Critical => return Some(AlertSeverity::Critical),
                AlertSeverity::Warning => level = Some(AlertSeverity::Warning),
            }
        }
        level
    }

    pub fn stats(&self) -> AlertStats {
        let state = self.lock_state();
        let mut by_severity: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_device: HashMap<String, usize> = HashMap::new();
        let mut acknowledged = 0;

        for alert in state.active.values() {
            *by_severity.entry(alert.severity.to_string()).or_insert(0) += 1;
            *by_type.entry(alert.alert_type.to_string()).or_insert(0) += 1;
            *by_device.entry(alert.device_id.clone()).or_insert(0) += 1;
            if alert.acknowledged {
                acknowledged += 1;
            }
        }

        let cutoff = Utc::now() - Duration::hours(24);
        let resolved_last_24h = state
            .history
            .iter()
            .filter(|alert| alert.resolved_at.is_some_and(|at| at >= cutoff))
            .count();

        AlertStats {
            total_active: state.active.len(),
            unacknowledged: state.active.len() - acknowledged,
            by_severity,
            by_type,
            by_device,
            acknowledged,
            resolved_last_24h,
        }
    }

    /// An id missing from the active set is a conflict when the row exists
    /// but was already resolved, and not-found otherwise.
    fn missing_alert_error(&self, id: &str) -> CoreError {
        match self.store.get_alert(id) {
            Ok(Some(existing)) if existing.resolved_at.is_some() => {
                CoreError::conflict(format!("alert {} already resolved", id))
            }
            Ok(_) => CoreError::not_found(format!("alert {}", id)),
            Err(e) => CoreError::Internal(e),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AlertState> {
        self.state.lock().expect("alert state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Device;

    fn engine_with_device(device_id: &str) -> (Arc<AlertEngine>, Store) {
        let store = Store::in_memory().unwrap();
        let device = Device::new(
            device_id.to_string(),
            "192.168.1.50".to_string(),
            "host".to_string(),
            "public".to_string(),
        );
        store.upsert_device(&device).unwrap();
        let broadcaster = Arc::new(Broadcaster::new());
        (
            Arc::new(AlertEngine::new(store.clone(), broadcaster)),
            store,
        )
    }

    fn cpu_warning(device_id: &str) -> NewAlert {
        NewAlert {
            device_id: device_id.to_string(),
            device_ip: "192.168.1.50".to_string(),
            alert_type: AlertType::Cpu,
            severity: AlertSeverity::Warning,
            message: "CPU usage 80% exceeds warning threshold (75%)".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_create_then_increment() {
        let (engine, store) = engine_with_device("d");

        let first = engine.create(cpu_warning("d"));
        assert_eq!(first.occurrence_count, 1);

        let second = engine.create(cpu_warning("d"));
        assert_eq!(second.id, first.id);
        assert_eq!(second.occurrence_count, 2);
        assert!(second.last_occurrence >= first.last_occurrence);

        // only one row was persisted
        let rows = store
            .list_alerts(&crate::alerts::AlertFilter::default(), 50, 0)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_concurrent_creates_produce_one_alert() {
        let (engine, store) = engine_with_device("d");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || engine.create(cpu_warning("d"))));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert!(active[0].occurrence_count >= 10);

        let rows = store
            .list_alerts(&crate::alerts::AlertFilter::default(), 50, 0)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_ack_lifecycle_and_conflicts() {
        let (engine, _store) = engine_with_device("d");
        let alert = engine.create(cpu_warning("d"));

        let acked = engine.acknowledge(&alert.id, "operator").unwrap();
        assert!(acked.acknowledged);
        assert!(acked.created_at <= acked.acknowledged_at.unwrap());

        assert!(matches!(
            engine.acknowledge(&alert.id, "operator"),
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            engine.acknowledge("missing", "operator"),
            Err(CoreError::NotFound(_))
        ));

        // an acknowledged alert no longer dedups; a new occurrence opens a
        // fresh alert
        let fresh = engine.create(cpu_warning("d"));
        assert_ne!(fresh.id, alert.id);
    }

    #[test]
    fn test_resolve_removes_from_active() {
        let (engine, store) = engine_with_device("d");
        let alert = engine.create(cpu_warning("d"));

        let resolved = engine.resolve(&alert.id, Some("operator")).unwrap();
        assert!(resolved.resolved_at.is_some());
        assert!(engine.active_alerts().is_empty());
        // a second resolve of the same id is a conflict, not a missing id
        assert!(matches!(
            engine.resolve(&alert.id, None),
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            engine.resolve("missing", None),
            Err(CoreError::NotFound(_))
        ));

        let row = store.get_alert(&alert.id).unwrap().unwrap();
        assert!(row.resolved_at.is_some());
        assert_eq!(row.resolved_by.as_deref(), Some("operator"));
    }

    #[test]
    fn test_auto_resolve_threshold_rule() {
        let (engine, _store) = engine_with_device("d");
        engine.create(cpu_warning("d"));
        let thresholds = ThresholdPair {
            warning: 75,
            critical: 90,
        };

        // still above the warning line: nothing resolves
        assert!(engine
            .auto_resolve("d", AlertType::Cpu, 80.0, thresholds)
            .is_empty());
        assert_eq!(engine.active_alerts().len(), 1);

        let resolved = engine.auto_resolve("d", AlertType::Cpu, 40.0, thresholds);
        assert_eq!(resolved.len(), 1);
        assert!(engine.active_alerts().is_empty());

        // idempotent: a second identical call is a no-op
        assert!(engine
            .auto_resolve("d", AlertType::Cpu, 40.0, thresholds)
            .is_empty());
    }

    #[test]
    fn test_auto_resolve_offline_is_unconditional() {
        let (engine, _store) = engine_with_device("d");
        engine.create(NewAlert {
            device_id: "d".to_string(),
            device_ip: "192.168.1.50".to_string(),
            alert_type: AlertType::Offline,
            severity: AlertSeverity::Critical,
            message: "Device unreachable".to_string(),
            metadata: None,
        });

        let resolved = engine.auto_resolve(
            "d",
            AlertType::Offline,
            0.0,
            ThresholdPair {
                warning: 75,
                critical: 90,
            },
        );
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_device_alert_level() {
        let (engine, _store) = engine_with_device("d");
        assert_eq!(engine.device_alert_level("d"), None);

        engine.create(cpu_warning("d"));
        assert_eq!(engine.device_alert_level("d"), Some(AlertSeverity::Warning));

        let critical = engine.create(NewAlert {
            severity: AlertSeverity::Critical,
            ..cpu_warning("d")
        });
        assert_eq!(engine.device_alert_level("d"), Some(AlertSeverity::Critical));

        // acknowledged alerts stop driving the status
        engine.acknowledge(&critical.id, "op").unwrap();
        assert_eq!(engine.device_alert_level("d"), Some(AlertSeverity::Warning));
    }

    #[test]
    fn test_load_hydrates_active_set() {
        let (engine, store) = engine_with_device("d");
        engine.create(cpu_warning("d"));

        let rebuilt = AlertEngine::new(store, Arc::new(Broadcaster::new()));
        assert_eq!(rebuilt.load().unwrap(), 1);
        assert_eq!(rebuilt.active_alerts().len(), 1);
    }

    #[test]
    fn test_stats() {
        let (engine, _store) = engine_with_device("d");
        engine.create(cpu_warning("d"));
        let alert = engine.create(NewAlert {
            alert_type: AlertType::Memory,
            severity: AlertSeverity::Critical,
            ..cpu_warning("d")
        });
        engine.resolve(&alert.id, None).unwrap();

        let stats = engine.stats();
        assert_eq!(stats.total_active, 1);
        assert_eq!(stats.by_type.get("cpu"), Some(&1));
        assert_eq!(stats.resolved_last_24h, 1);
        assert_eq!(stats.unacknowledged, 1);
    }
}
