/// Forwarding of decoded batches with persist-and-retry on failure
///
/// A batch that cannot be delivered is written to the backlog and the cycle
/// ends there, so a backend outage never triggers full backlog scans. The
/// next batch that does get through flushes the backlog, deleting each file
/// as soon as the backend acknowledges it. Delivery is at-least-once.
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::SharedSettings;
use crate::delivery::backlog::Backlog;
use crate::delivery::client::{Backend, DeliveryError, Envelope};
use crate::models::MeasurementRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Persisted,
    Dropped,
}

pub struct DeliveryQueue {
    backend: Arc<dyn Backend>,
    backlog: Backlog,
    settings: SharedSettings,
    flushing: Mutex<()>,
}

impl DeliveryQueue {
    pub fn new(backend: Arc<dyn Backend>, backlog: Backlog, settings: SharedSettings) -> Self {
        DeliveryQueue {
            backend,
            backlog,
            settings,
            flushing: Mutex::new(()),
        }
    }

    /// Delivers one freshly decoded batch captured at `captured_at` (unix seconds).
    pub async fn submit(&self, records: &[MeasurementRecord], captured_at: i64) -> Delivery {
        let measurements = match serde_json::to_value(records) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize batch: {}", e);
                return Delivery::Dropped;
            }
        };

        match self.send(&measurements).await {
            Ok(()) => {
                info!("Delivered {} measurement(s)", records.len());
                self.flush_backlog().await;
                Delivery::Sent
            }
            Err(e) => {
                error!("Error sending data to server: {}", e);
                self.persist(&measurements, captured_at).await
            }
        }
    }

    /// Resends every persisted batch once. Returns how many were delivered.
    /// Does nothing when another flush is already running.
    pub async fn flush_backlog(&self) -> usize {
        let Ok(_guard) = self.flushing.try_lock() else {
            debug!("Backlog flush already in progress");
            return 0;
        };

        let entries = match self.backlog.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    "Failed to list backlog {}: {}",
                    self.backlog.dir().display(),
                    e
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for path in entries {
            match self.resend(&path).await {
                Ok(()) => {
                    if let Err(e) = self.backlog.remove(&path).await {
                        error!("Failed to remove {}: {}", path.display(), e);
                        continue;
                    }
                    delivered += 1;
                }
                Err(e) => warn!("Batch {} still pending: {}", path.display(), e),
            }
        }

        if delivered > 0 {
            info!("Flushed {} pending batch(es)", delivered);
        }
        delivered
    }

    async fn resend(&self, path: &Path) -> Result<(), DeliveryError> {
        let bytes = self.backlog.read(path).await?;
        let measurements: serde_json::Value = serde_json::from_slice(&bytes)?;
        self.send(&measurements).await
    }

    async fn send(&self, measurements: &serde_json::Value) -> Result<(), DeliveryError> {
        let (id, password) = {
            let settings = self.settings.read().await;
            (settings.id.clone(), settings.password.clone())
        };
        let envelope = Envelope {
            gateway_id: &id,
            gateway_password: &password,
            measurements,
        };
        self.backend.post(&envelope).await
    }

    async fn persist(&self, measurements: &serde_json::Value, captured_at: i64) -> Delivery {
        let persisted = match serde_json::to_vec(measurements) {
            Ok(bytes) => self.backlog.persist(captured_at, &bytes).await,
            Err(e) => Err(e.into()),
        };
        match persisted {
            Ok(path) => {
                info!("Saved undelivered batch to {}", path.display());
                Delivery::Persisted
            }
            Err(e) => {
                error!("Failed to save undelivered batch, dropping it: {}", e);
                Delivery::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::models::{Address, MeasurementType, Payload};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` posts, then accepts everything.
    struct FlakyBackend {
        failures: AtomicUsize,
        delivered: std::sync::Mutex<Vec<serde_json::Value>>,
    }

    impl FlakyBackend {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(FlakyBackend {
                failures: AtomicUsize::new(failures),
                delivered: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn delivered(&self) -> Vec<serde_json::Value> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn post(&self, envelope: &Envelope<'_>) -> Result<(), DeliveryError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryError::Rejected {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            assert_eq!(envelope.gateway_id, "gw-1");
            assert_eq!(envelope.gateway_password, "pw");
            self.delivered
                .lock()
                .unwrap()
                .push(envelope.measurements.clone());
            Ok(())
        }
    }

    fn batch(byte: u8) -> Vec<MeasurementRecord> {
        vec![MeasurementRecord {
            sensor_id: Address([1; 6]),
            time: i64::from(byte),
            measurement_type: MeasurementType::Audio,
            sampling_frequency: 8,
            axis: None,
            raw_data: Payload::Bytes(vec![byte]),
        }]
    }

    fn queue(backend: Arc<FlakyBackend>, dir: &std::path::Path) -> DeliveryQueue {
        let settings = GatewaySettings::in_memory("gw-1", "pw").into_shared();
        DeliveryQueue::new(backend, Backlog::new(dir), settings)
    }

    #[tokio::test]
    async fn test_backlog_flushed_after_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FlakyBackend::new(2);
        let queue = queue(backend.clone(), dir.path());

        assert_eq!(queue.submit(&batch(1), 100).await, Delivery::Persisted);
        assert_eq!(queue.submit(&batch(2), 101).await, Delivery::Persisted);
        assert_eq!(queue.backlog.entries().await.unwrap().len(), 2);
        assert!(backend.delivered().is_empty());

        assert_eq!(queue.submit(&batch(3), 102).await, Delivery::Sent);
        assert!(queue.backlog.entries().await.unwrap().is_empty());

        let delivered = backend.delivered();
        assert_eq!(delivered.len(), 3);
        // current batch first, then the backlog oldest first
        assert_eq!(delivered[0], serde_json::to_value(batch(3)).unwrap());
        assert_eq!(delivered[1], serde_json::to_value(batch(1)).unwrap());
        assert_eq!(delivered[2], serde_json::to_value(batch(2)).unwrap());
    }

    #[tokio::test]
    async fn test_failure_does_not_flush() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FlakyBackend::new(1);
        let queue = queue(backend.clone(), dir.path());
        queue
            .backlog
            .persist(50, &serde_json::to_vec(&batch(9)).unwrap())
            .await
            .unwrap();

        assert_eq!(queue.submit(&batch(1), 60).await, Delivery::Persisted);
        // the failing cycle must not have touched the older file
        assert_eq!(queue.backlog.entries().await.unwrap().len(), 2);
        assert!(backend.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_batch_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FlakyBackend::new(0);
        let queue = queue(backend.clone(), dir.path());
        queue.backlog.persist(10, b"not json").await.unwrap();
        queue
            .backlog
            .persist(11, &serde_json::to_vec(&batch(4)).unwrap())
            .await
            .unwrap();

        assert_eq!(queue.flush_backlog().await, 1);
        let left = queue.backlog.entries().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].file_name().unwrap().to_str().unwrap(), "10.json");
    }
}
