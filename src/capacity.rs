/// Sensor setting updates and the collection capacity check
///
/// A sensor's collection size is the number of bytes one wake-up cycle
/// produces: `frequency × duration × sample size` for every active sampled
/// type, plus a fixed reading for temperature. Settings may never push that
/// size past the sensor's declared capacity.
use crate::models::{MeasurementType, Sensor};

/// Largest wake-up interval (seconds) whose millisecond value fits in a u32.
pub const MAX_WAKE_UP_INTERVAL: u32 = u32::MAX / 1000;

/// A single validated-and-typed change to a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingUpdate {
    Name(String),
    WakeUpInterval(u32),
    WakeUpIntervalMaxOffset(u32),
    Active(MeasurementType, bool),
    SamplingFrequency(MeasurementType, u32),
    SamplingDuration(MeasurementType, u16),
    /// Reset every setting to the pairing defaults.
    Defaults,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingError {
    #[error("setting {0} doesn't exist")]
    UnknownSetting(String),
    #[error("invalid value for {setting} setting ({reason})")]
    InvalidValue {
        setting: &'static str,
        reason: String,
    },
    #[error("sensor does not measure {0}")]
    UnsupportedType(MeasurementType),
    #[error("exceeds collection capacity of sensor (current maximum: {max})")]
    CapacityExceeded { max: u64 },
    #[error("sampling_frequency and sampling_duration of {0} must be greater than 0")]
    MissingFactor(MeasurementType),
}

impl SettingUpdate {
    /// Parses the operator's `<name> <value>` pair.
    pub fn parse(name: &str, value: &str) -> Result<Self, SettingError> {
        match name {
            "auto" => return Ok(SettingUpdate::Defaults),
            "name" => {
                if value.is_empty() {
                    return Err(invalid("name", "must not be empty"));
                }
                return Ok(SettingUpdate::Name(value.to_string()));
            }
            "wake_up_interval" => {
                return parse_number::<u32>("wake_up_interval", value, "an integer (seconds)")
                    .map(SettingUpdate::WakeUpInterval)
            }
            "wake_up_interval_max_offset" => {
                return parse_number::<u32>(
                    "wake_up_interval_max_offset",
                    value,
                    "a non-negative integer (seconds)",
                )
                .map(SettingUpdate::WakeUpIntervalMaxOffset)
            }
            _ => {}
        }

        let unknown = || SettingError::UnknownSetting(name.to_string());
        let (data_type, field) = MeasurementType::CONFIGURABLE
            .into_iter()
            .find_map(|t| {
                name.strip_prefix(t.name())
                    .and_then(|rest| rest.strip_prefix('_'))
                    .map(|field| (t, field))
            })
            .ok_or_else(unknown)?;

        match field {
            "active" => match value {
                "true" => Ok(SettingUpdate::Active(data_type, true)),
                "false" => Ok(SettingUpdate::Active(data_type, false)),
                _ => Err(invalid("active", "must be true or false")),
            },
            "sampling_frequency" if data_type.is_sampled() => parse_number::<u32>(
                "sampling_frequency",
                value,
                "an integer between 0 and 4 294 967 295 (Hz)",
            )
            .map(|v| SettingUpdate::SamplingFrequency(data_type, v)),
            "sampling_duration" if data_type.is_sampled() => parse_number::<u16>(
                "sampling_duration",
                value,
                "an integer between 0 and 65 535 (seconds)",
            )
            .map(|v| SettingUpdate::SamplingDuration(data_type, v)),
            _ => Err(unknown()),
        }
    }
}

fn invalid(setting: &'static str, reason: &str) -> SettingError {
    SettingError::InvalidValue {
        setting,
        reason: reason.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(
    setting: &'static str,
    value: &str,
    expected: &str,
) -> Result<T, SettingError> {
    value
        .parse()
        .map_err(|_| invalid(setting, &format!("must be {}", expected)))
}

/// Bytes one collection cycle of `sensor` produces, skipping `exclude`.
fn collection_size_excluding(sensor: &Sensor, exclude: Option<MeasurementType>) -> u64 {
    sensor
        .settings
        .iter()
        .filter(|(data_type, settings)| settings.active && Some(**data_type) != exclude)
        .map(|(data_type, settings)| match data_type {
            MeasurementType::Temperature => data_type.sample_size(),
            _ => {
                u64::from(settings.sampling_frequency)
                    * u64::from(settings.sampling_duration)
                    * data_type.sample_size()
            }
        })
        .sum()
}

pub fn collection_size(sensor: &Sensor) -> u64 {
    collection_size_excluding(sensor, None)
}

/// Checks `update` against `sensor` without applying it.
pub fn validate(sensor: &Sensor, update: &SettingUpdate) -> Result<(), SettingError> {
    match update {
        SettingUpdate::Name(_) | SettingUpdate::Defaults => Ok(()),
        SettingUpdate::Active(data_type, _) => require_type(sensor, *data_type),
        SettingUpdate::WakeUpInterval(interval) => {
            if *interval <= sensor.wake_up_interval_max_offset || *interval > MAX_WAKE_UP_INTERVAL {
                return Err(invalid(
                    "wake_up_interval",
                    &format!(
                        "must be an integer greater than \
                         wake_up_interval_max_offset ({}) and at most {}",
                        sensor.wake_up_interval_max_offset, MAX_WAKE_UP_INTERVAL
                    ),
                ));
            }
            Ok(())
        }
        SettingUpdate::WakeUpIntervalMaxOffset(offset) => {
            if *offset >= sensor.wake_up_interval {
                return Err(invalid(
                    "wake_up_interval_max_offset",
                    &format!(
                        "must be an integer between 0 and wake_up_interval ({})",
                        sensor.wake_up_interval
                    ),
                ));
            }
            Ok(())
        }
        SettingUpdate::SamplingFrequency(data_type, value) => {
            require_type(sensor, *data_type)?;
            let duration = sensor
                .settings
                .get(data_type)
                .map_or(0, |s| u64::from(s.sampling_duration));
            check_capacity(sensor, *data_type, u64::from(*value), duration)
        }
        SettingUpdate::SamplingDuration(data_type, value) => {
            require_type(sensor, *data_type)?;
            let frequency = sensor
                .settings
                .get(data_type)
                .map_or(0, |s| u64::from(s.sampling_frequency));
            check_capacity(sensor, *data_type, u64::from(*value), frequency)
        }
    }
}

fn require_type(sensor: &Sensor, data_type: MeasurementType) -> Result<(), SettingError> {
    if sensor.supports(data_type) {
        Ok(())
    } else {
        Err(SettingError::UnsupportedType(data_type))
    }
}

/// The changed factor may grow while `factor × other × size` still fits in
/// what the other types leave of the budget.
fn check_capacity(
    sensor: &Sensor,
    data_type: MeasurementType,
    candidate: u64,
    other_factor: u64,
) -> Result<(), SettingError> {
    if other_factor == 0 {
        return Err(SettingError::MissingFactor(data_type));
    }
    let others = collection_size_excluding(sensor, Some(data_type));
    let available = u64::from(sensor.collection_capacity).saturating_sub(others);
    let max = available / (data_type.sample_size() * other_factor);
    if candidate > max {
        return Err(SettingError::CapacityExceeded { max });
    }
    Ok(())
}
