/// Authentication and decoding of inbound data frames
///
/// Frame layout (device → gateway, data characteristic):
/// - Bytes 0-5: sensor address
/// - Byte 6: measurement type code
/// - Byte 7: sampling frequency
/// - Bytes 8..n-256: type-specific payload
/// - Last 256 bytes: signature over everything before it
use crate::crypto::SIGNATURE_LEN;
use crate::models::{Address, Axis, MeasurementRecord, MeasurementType, Payload};
use crate::registry::Registry;
use crate::telemetry::rtd::{ConversionError, RtdCurve};

const HEADER_LEN: usize = 8;
pub const MIN_FRAME_LEN: usize = HEADER_LEN + SIGNATURE_LEN;
const VIBRATION_SAMPLE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid data frame: {0} bytes (minimum 264)")]
    TooShort(usize),
    #[error("device {0} tried to send data, but it is not paired with this gateway")]
    UnknownSensor(Address),
    #[error("invalid signature received from {0}")]
    InvalidSignature(Address),
    #[error("unknown measurement type 0x{code:02x} from {address}")]
    UnknownType { address: Address, code: u8 },
    #[error("vibration payload of {0} bytes is not a multiple of 12")]
    MisalignedVibration(usize),
    #[error("temperature payload of {0} bytes holds no ADC reading")]
    MissingReading(usize),
    #[error(transparent)]
    Temperature(#[from] ConversionError),
}

#[derive(Debug, Clone, Default)]
pub struct Decoder {
    curve: RtdCurve,
}

impl Decoder {
    pub fn new(curve: RtdCurve) -> Self {
        Decoder { curve }
    }

    /// Verifies `frame` against the sender's enrolled key and decodes it into
    /// records stamped with `time` (unix seconds).
    pub fn decode(
        &self,
        frame: &[u8],
        registry: &Registry,
        time: i64,
    ) -> Result<Vec<MeasurementRecord>, DecodeError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TooShort(frame.len()));
        }
        let (data, signature) = frame.split_at(frame.len() - SIGNATURE_LEN);

        let address = Address::from_prefix(data).ok_or(DecodeError::TooShort(frame.len()))?;
        let sensor = registry
            .get(&address)
            .ok_or(DecodeError::UnknownSensor(address))?;
        if !sensor.public_key.verify(data, signature) {
            return Err(DecodeError::InvalidSignature(address));
        }

        let code = data[6];
        let measurement_type =
            MeasurementType::from_code(code).ok_or(DecodeError::UnknownType { address, code })?;
        let sampling_frequency = data[7];
        let payload = &data[HEADER_LEN..];

        let record = |axis, raw_data| MeasurementRecord {
            sensor_id: address,
            time,
            measurement_type,
            sampling_frequency,
            axis,
            raw_data,
        };

        let records = match measurement_type {
            MeasurementType::Vibration => {
                let (x, y, z) = split_axes(payload)?;
                vec![
                    record(Some(Axis::X), Payload::Samples(x)),
                    record(Some(Axis::Y), Payload::Samples(y)),
                    record(Some(Axis::Z), Payload::Samples(z)),
                ]
            }
            MeasurementType::Temperature => {
                let reading = payload
                    .get(..2)
                    .ok_or(DecodeError::MissingReading(payload.len()))?;
                let code = u16::from_le_bytes([reading[0], reading[1]]);
                let celsius = self.curve.celsius(code)?;
                vec![record(None, Payload::Scalar(celsius))]
            }
            MeasurementType::Audio | MeasurementType::Battery => {
                vec![record(None, Payload::Bytes(payload.to_vec()))]
            }
        };
        Ok(records)
    }
}

/// Splits interleaved little-endian `x y z` f32 samples into one series per axis.
fn split_axes(payload: &[u8]) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>), DecodeError> {
    if payload.len() % VIBRATION_SAMPLE_LEN != 0 {
        return Err(DecodeError::MisalignedVibration(payload.len()));
    }
    let samples = payload.len() / VIBRATION_SAMPLE_LEN;
    let (mut x, mut y, mut z) = (
        Vec::with_capacity(samples),
        Vec::with_capacity(samples),
        Vec::with_capacity(samples),
    );
    let float = |b: &[u8]| f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    for sample in payload.chunks_exact(VIBRATION_SAMPLE_LEN) {
        x.push(float(&sample[0..4]));
        y.push(float(&sample[4..8]));
        z.push(float(&sample[8..12]));
    }
    Ok((x, y, z))
}
