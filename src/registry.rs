/// Durable set of enrolled sensors, persisted as a JSON array
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

use crate::capacity::{self, SettingError, SettingUpdate};
use crate::models::{Address, Sensor};

pub const SENSORS_FILE: &str = "sensors.json";

pub type SharedRegistry = Arc<RwLock<Registry>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("sensor with MAC address {0} not found")]
    NotFound(Address),
    #[error("sensor {0} is already paired")]
    AlreadyEnrolled(Address),
    #[error(transparent)]
    Setting(#[from] SettingError),
    #[error("failed to write registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed registry file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    sensors: Vec<Sensor>,
}

impl Registry {
    /// Loads the registry at `path`, starting empty when the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let sensors = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No sensor registry at {}, starting empty", path.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Registry { path, sensors })
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn get(&self, mac: &Address) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.mac == *mac)
    }

    pub fn contains(&self, mac: &Address) -> bool {
        self.get(mac).is_some()
    }

    pub async fn insert(&mut self, sensor: Sensor) -> Result<(), RegistryError> {
        if self.contains(&sensor.mac) {
            return Err(RegistryError::AlreadyEnrolled(sensor.mac));
        }
        let mut next = self.sensors.clone();
        next.push(sensor);
        self.commit(next).await
    }

    pub async fn remove(&mut self, mac: &Address) -> Result<Sensor, RegistryError> {
        let index = self
            .sensors
            .iter()
            .position(|s| s.mac == *mac)
            .ok_or(RegistryError::NotFound(*mac))?;
        let mut next = self.sensors.clone();
        let removed = next.remove(index);
        self.commit(next).await?;
        info!("Forgot sensor {}", mac);
        Ok(removed)
    }

    /// Validates `update` against the current settings and persists it, or
    /// leaves the registry untouched.
    pub async fn update_setting(
        &mut self,
        mac: &Address,
        update: &SettingUpdate,
    ) -> Result<&Sensor, RegistryError> {
        let index = self
            .sensors
            .iter()
            .position(|s| s.mac == *mac)
            .ok_or(RegistryError::NotFound(*mac))?;

        let mut sensor = self.sensors[index].clone();
        capacity::validate(&sensor, update)?;
        apply(&mut sensor, update);

        let mut next = self.sensors.clone();
        next[index] = sensor;
        self.commit(next).await?;
        Ok(&self.sensors[index])
    }

    pub async fn set_battery_level(
        &mut self,
        mac: &Address,
        level: u8,
    ) -> Result<(), RegistryError> {
        let index = self
            .sensors
            .iter()
            .position(|s| s.mac == *mac)
            .ok_or(RegistryError::NotFound(*mac))?;
        if self.sensors[index].battery_level == Some(level) {
            return Ok(());
        }
        let mut next = self.sensors.clone();
        next[index].battery_level = Some(level);
        self.commit(next).await
    }

    /// Persists `sensors` and only then makes them the in-memory state.
    async fn commit(&mut self, sensors: Vec<Sensor>) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, &sensors).await?;
        self.sensors = sensors;
        Ok(())
    }
}

fn apply(sensor: &mut Sensor, update: &SettingUpdate) {
    match update {
        SettingUpdate::Name(name) => sensor.name = name.clone(),
        SettingUpdate::WakeUpInterval(v) => sensor.wake_up_interval = *v,
        SettingUpdate::WakeUpIntervalMaxOffset(v) => sensor.wake_up_interval_max_offset = *v,
        SettingUpdate::Active(t, active) => sensor.settings.entry(*t).or_default().active = *active,
        SettingUpdate::SamplingFrequency(t, v) => {
            sensor.settings.entry(*t).or_default().sampling_frequency = *v
        }
        SettingUpdate::SamplingDuration(t, v) => {
            sensor.settings.entry(*t).or_default().sampling_duration = *v
        }
        SettingUpdate::Defaults => sensor.reset_to_defaults(),
    }
}

/// Writes `value` as JSON next to `path` and renames it into place.
pub async fn write_json_atomic<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::TestKey;
    use crate::models::{Capabilities, MeasurementType};

    fn enrolled(mac: Address) -> Sensor {
        Sensor::enrolled(mac, &Capabilities::default(), TestKey::generate().public_key())
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SENSORS_FILE);

        let mut registry = Registry::load(&path).unwrap();
        assert!(registry.sensors().is_empty());

        let mac = Address([0xAA, 0, 0, 0, 0, 1]);
        let sensor = enrolled(mac);
        registry.insert(sensor.clone()).await.unwrap();
        registry
            .update_setting(&mac, &SettingUpdate::SamplingDuration(MeasurementType::Vibration, 3))
            .await
            .unwrap();

        let reloaded = Registry::load(&path).unwrap();
        let back = reloaded.get(&mac).unwrap();
        assert_eq!(back.public_key, sensor.public_key);
        assert_eq!(back.settings, registry.get(&mac).unwrap().settings);
        assert_eq!(
            back.settings[&MeasurementType::Vibration].sampling_duration,
            3
        );
        assert_eq!(back, registry.get(&mac).unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::load(dir.path().join(SENSORS_FILE)).unwrap();
        let mac = Address([1; 6]);
        registry.insert(enrolled(mac)).await.unwrap();
        assert!(matches!(
            registry.insert(enrolled(mac)).await,
            Err(RegistryError::AlreadyEnrolled(_))
        ));
        registry.remove(&mac).await.unwrap();
        registry.insert(enrolled(mac)).await.unwrap();
        assert_eq!(registry.sensors().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_update_is_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SENSORS_FILE);
        let mut registry = Registry::load(&path).unwrap();
        let mac = Address([2; 6]);
        registry.insert(enrolled(mac)).await.unwrap();

        let result = registry
            .update_setting(
                &mac,
                &SettingUpdate::SamplingFrequency(MeasurementType::Audio, 1_000_000),
            )
            .await;
        assert!(matches!(
            result,
            Err(RegistryError::Setting(SettingError::CapacityExceeded { .. }))
        ));
        let reloaded = Registry::load(&path).unwrap();
        assert_eq!(
            reloaded.get(&mac).unwrap().settings[&MeasurementType::Audio].sampling_frequency,
            8000
        );
    }

    #[tokio::test]
    async fn test_failed_write_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SENSORS_FILE);
        let mut registry = Registry::load(&path).unwrap();
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let mac = Address([4; 6]);
        assert!(matches!(
            registry.insert(enrolled(mac)).await,
            Err(RegistryError::Io(_))
        ));
        assert!(!registry.contains(&mac));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::load(dir.path().join(SENSORS_FILE)).unwrap();
        assert!(matches!(
            registry.remove(&Address([3; 6])).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
