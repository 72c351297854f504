/// Shared daemon state and the data-frame path
///
/// Every transport event and operator command runs as its own task against
/// this object. Decoding and verification happen inline; delivery is spawned
/// so a slow backend never holds up the transport.
use log::{debug, error, info, warn};
use std::any::Any;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::config::SharedSettings;
use crate::delivery::{Delivery, DeliveryQueue};
use crate::models::{MeasurementRecord, MeasurementType, Payload};
use crate::pairing::{Pairing, ResponseValue};
use crate::registry::SharedRegistry;
use crate::telemetry::{DecodeError, Decoder};
use crate::utils::format_datetime;

pub struct Gateway {
    pub registry: SharedRegistry,
    pub settings: SharedSettings,
    pub pairing: Arc<Pairing>,
    pub response: ResponseValue,
    queue: Arc<DeliveryQueue>,
    decoder: Decoder,
    advertising: std::sync::Mutex<Option<Advertising>>,
}

/// Keeps the gateway advertised until dropped.
pub type Advertising = Box<dyn Any + Send>;

impl Gateway {
    pub fn new(
        registry: SharedRegistry,
        settings: SharedSettings,
        queue: Arc<DeliveryQueue>,
        decoder: Decoder,
        pairing_timeout: Duration,
    ) -> Arc<Self> {
        let response = ResponseValue::default();
        let pairing = Pairing::new(
            registry.clone(),
            settings.clone(),
            response.clone(),
            pairing_timeout,
        );
        Arc::new(Gateway {
            registry,
            settings,
            pairing,
            response,
            queue,
            decoder,
            advertising: std::sync::Mutex::new(None),
        })
    }

    /// Handles a write to the data characteristic. Rejected frames are logged
    /// and dropped; accepted ones are handed to the delivery queue.
    pub async fn on_data(&self, frame: &[u8]) -> Option<JoinHandle<Delivery>> {
        let now = OffsetDateTime::now_utc();
        let records = match self.ingest(frame, now.unix_timestamp()).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Dropped data frame: {}", e);
                return None;
            }
        };
        if let Some(first) = records.first() {
            debug!(
                "Received {} from {} at {}",
                first.measurement_type,
                first.sensor_id,
                format_datetime(&now)
            );
        }

        let queue = Arc::clone(&self.queue);
        let captured_at = now.unix_timestamp();
        Some(tokio::spawn(async move {
            queue.submit(&records, captured_at).await
        }))
    }

    /// Authenticates and decodes `frame`, recording the battery level a
    /// battery frame carries.
    pub async fn ingest(
        &self,
        frame: &[u8],
        time: i64,
    ) -> Result<Vec<MeasurementRecord>, DecodeError> {
        let records = {
            let registry = self.registry.read().await;
            self.decoder.decode(frame, &registry, time)?
        };

        for record in &records {
            if record.measurement_type != MeasurementType::Battery {
                continue;
            }
            let Payload::Bytes(bytes) = &record.raw_data else {
                continue;
            };
            let Some(&level) = bytes.first() else {
                continue;
            };
            let level = level.min(100);
            match self
                .registry
                .write()
                .await
                .set_battery_level(&record.sensor_id, level)
                .await
            {
                Ok(()) => debug!("Battery of {} at {}%", record.sensor_id, level),
                Err(e) => error!(
                    "Failed to store battery level of {}: {}",
                    record.sensor_id, e
                ),
            }
        }
        Ok(records)
    }

    pub fn set_advertising(&self, advertising: Advertising) {
        *self.advertising.lock().unwrap_or_else(|e| e.into_inner()) = Some(advertising);
    }

    /// Takes the gateway off the air. The GATT service and the control
    /// socket keep running. Returns false when it was not advertising.
    pub fn stop_advertising(&self) -> bool {
        let advertising = self
            .advertising
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match advertising {
            Some(handle) => {
                drop(handle);
                info!("Advertising stopped");
                true
            }
            None => false,
        }
    }
}
