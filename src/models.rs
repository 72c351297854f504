use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::{Duration, OffsetDateTime};

use crate::crypto::PublicKey;

/// 6-byte hardware address of a sensor, written `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address '{0}' (expected AA:BB:CC:DD:EE:FF)")]
pub struct AddressParseError(pub String);

impl Address {
    pub const LEN: usize = 6;

    /// Reads the address from the first six bytes of a frame.
    pub fn from_prefix(bytes: &[u8]) -> Option<Self> {
        let prefix: [u8; 6] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Address(prefix))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(Address(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// Kind of measurement carried by a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementType {
    Vibration,
    Audio,
    Temperature,
    Battery,
}

impl MeasurementType {
    /// Types that carry a settings group on the sensor.
    pub const CONFIGURABLE: [MeasurementType; 3] = [
        MeasurementType::Vibration,
        MeasurementType::Audio,
        MeasurementType::Temperature,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(MeasurementType::Vibration),
            0x01 => Some(MeasurementType::Audio),
            0x02 => Some(MeasurementType::Temperature),
            0x03 => Some(MeasurementType::Battery),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MeasurementType::Vibration => "vibration",
            MeasurementType::Audio => "audio",
            MeasurementType::Temperature => "temperature",
            MeasurementType::Battery => "battery",
        }
    }

    /// Bytes per sample (vibration: three f32 axes; audio: one i16).
    /// Temperature is a single reading of this size per collection.
    pub fn sample_size(&self) -> u64 {
        match self {
            MeasurementType::Vibration => 12,
            MeasurementType::Audio | MeasurementType::Temperature => 2,
            MeasurementType::Battery => 0,
        }
    }

    /// Whether frequency and duration apply to this type.
    pub fn is_sampled(&self) -> bool {
        matches!(self, MeasurementType::Vibration | MeasurementType::Audio)
    }

    fn mask_bit(&self) -> u8 {
        match self {
            MeasurementType::Vibration => 0b001,
            MeasurementType::Audio => 0b010,
            MeasurementType::Temperature => 0b100,
            MeasurementType::Battery => 0,
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MeasurementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vibration" => Ok(MeasurementType::Vibration),
            "audio" => Ok(MeasurementType::Audio),
            "temperature" => Ok(MeasurementType::Temperature),
            "battery" => Ok(MeasurementType::Battery),
            other => Err(format!("unknown measurement type '{}'", other)),
        }
    }
}

/// Vibration axis tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeSettings {
    pub active: bool,
    #[serde(default)]
    pub sampling_frequency: u32,
    #[serde(default)]
    pub sampling_duration: u16,
}

/// What a device declares about itself when it asks to pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub types: Vec<MeasurementType>,
    pub collection_capacity: u32,
}

impl Capabilities {
    pub const DEFAULT_CAPACITY: u32 = 65_536;
    const TRAILER_LEN: usize = 5;

    /// Parses the optional `typeMask(1) ‖ capacity(u32 LE)` trailer that may
    /// follow the public key in a pair-request frame.
    pub fn from_trailer(trailer: &[u8]) -> Option<Self> {
        if trailer.is_empty() {
            return Some(Self::default());
        }
        if trailer.len() != Self::TRAILER_LEN {
            return None;
        }
        let mask = trailer[0];
        let types = MeasurementType::CONFIGURABLE
            .into_iter()
            .filter(|t| mask & t.mask_bit() != 0)
            .collect();
        let collection_capacity =
            u32::from_le_bytes([trailer[1], trailer[2], trailer[3], trailer[4]]);
        Some(Capabilities {
            types,
            collection_capacity,
        })
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            types: MeasurementType::CONFIGURABLE.to_vec(),
            collection_capacity: Self::DEFAULT_CAPACITY,
        }
    }
}

/// An enrolled sensor as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub mac: Address,
    pub name: String,
    pub types: Vec<MeasurementType>,
    #[serde(default)]
    pub battery_level: Option<u8>,
    pub collection_capacity: u32,
    pub wake_up_interval: u32,
    pub wake_up_interval_max_offset: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_wake_up: OffsetDateTime,
    pub settings: BTreeMap<MeasurementType, TypeSettings>,
    #[serde(rename = "key")]
    pub public_key: PublicKey,
}

pub const DEFAULT_WAKE_UP_INTERVAL: u32 = 3600;
pub const DEFAULT_WAKE_UP_INTERVAL_MAX_OFFSET: u32 = 300;

impl Sensor {
    /// Builds a freshly paired sensor with default settings for its declared types.
    pub fn enrolled(mac: Address, capabilities: &Capabilities, public_key: PublicKey) -> Self {
        let mut sensor = Sensor {
            mac,
            name: format!("Sensor {}", mac),
            types: capabilities.types.clone(),
            battery_level: None,
            collection_capacity: capabilities.collection_capacity,
            wake_up_interval: DEFAULT_WAKE_UP_INTERVAL,
            wake_up_interval_max_offset: DEFAULT_WAKE_UP_INTERVAL_MAX_OFFSET,
            next_wake_up: OffsetDateTime::now_utc(),
            settings: BTreeMap::new(),
            public_key,
        };
        sensor.reset_to_defaults();
        sensor
    }

    /// Restores default settings and wake schedule, keeping identity and key.
    ///
    /// Each default is lowered to fit whatever budget the types before it left.
    pub fn reset_to_defaults(&mut self) {
        self.name = format!("Sensor {}", self.mac);
        self.wake_up_interval = DEFAULT_WAKE_UP_INTERVAL;
        self.wake_up_interval_max_offset = DEFAULT_WAKE_UP_INTERVAL_MAX_OFFSET;
        self.next_wake_up =
            OffsetDateTime::now_utc() + Duration::seconds(i64::from(self.wake_up_interval));
        self.settings.clear();

        let mut remaining = u64::from(self.collection_capacity);
        let mut types = self.types.clone();
        // temperature is a fixed cost, reserve it before the sampled types
        types.sort_by_key(|t| t.is_sampled());
        for data_type in types {
            let settings = match data_type {
                MeasurementType::Temperature => {
                    let size = data_type.sample_size();
                    let active = size <= remaining;
                    if active {
                        remaining -= size;
                    }
                    TypeSettings {
                        active,
                        ..Default::default()
                    }
                }
                MeasurementType::Vibration | MeasurementType::Audio => {
                    let default_frequency: u32 = if data_type == MeasurementType::Vibration {
                        100
                    } else {
                        8000
                    };
                    let duration: u16 = 1;
                    let per_hz = data_type.sample_size() * u64::from(duration);
                    let fitting = (remaining / per_hz).min(u64::from(default_frequency)) as u32;
                    remaining -= u64::from(fitting) * per_hz;
                    TypeSettings {
                        active: fitting > 0,
                        sampling_frequency: fitting,
                        sampling_duration: duration,
                    }
                }
                MeasurementType::Battery => continue,
            };
            self.settings.insert(data_type, settings);
        }
    }

    pub fn supports(&self, data_type: MeasurementType) -> bool {
        self.types.contains(&data_type)
    }
}

/// Decoded measurement values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Samples(Vec<f32>),
    Bytes(Vec<u8>),
    Scalar(f64),
}

/// One decoded observation, ready for the backend envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    pub sensor_id: Address,
    pub time: i64,
    pub measurement_type: MeasurementType,
    pub sampling_frequency: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis: Option<Axis>,
    pub raw_data: Payload,
}
