use super::FRAME_START;
use chrono::Timelike;
use std::fmt;
use tracing::debug;

const LOGIN: u8 = 0x17;
const MEASURE: u8 = 0x04;
const DAILY_DATA: u8 = 0x0a;
const SYNC_TIME: u8 = 0x01;
const SWITCH: u8 = 0x03;
const LED: u8 = 0x0f;

const PAYLOAD_OFFSET: usize = 4;
const MEASUREMENT_LEN: usize = 14;
const DAILY_DATA_FRAME_LEN: usize = 55;
const HOURS: usize = 24;

/// A decoded notification from the plug
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Login { result: u8 },
    Switch { result: u8 },
    Led,
    Measurement(Measurement),
    DailyData(DailyData),
    SyncTime { result: u8 },
    /// Frame does not (yet) match its declared length
    Incomplete { raw: Vec<u8> },
    Unknown,
}

/// Reachability of a plug, synthesized by the connection rather than sent by the plug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Lost,
    Available,
}

/// Everything a device connection hands to its subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Response(Response),
    Availability(Availability),
}

/// Live reading, decoded from the 14 bytes following the frame header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub relay_on: bool,
    /// Watts
    pub power: f32,
    /// Volts
    pub voltage: u8,
    /// Milliamperes
    pub current: u16,
    /// Hertz
    pub frequency: u8,
}

impl Measurement {
    fn from_payload(payload: &[u8; MEASUREMENT_LEN]) -> Self {
        let milliwatts = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]);
        Self {
            relay_on: payload[0] == 0x01,
            power: milliwatts as f32 / 1000.0,
            voltage: payload[4],
            current: u16::from_be_bytes([payload[5], payload[6]]),
            frequency: payload[7],
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "relay {}, {} V, {:.3} W, {} mA, {} Hz",
            if self.relay_on { "on" } else { "off" },
            self.voltage,
            self.power,
            self.current,
            self.frequency
        )
    }
}

/// Hourly energy counters of the last 24 hours, oldest first.
///
/// The final counter belongs to the hour the frame was received in.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyData {
    /// Wh consumed since midnight
    pub today: u32,
    /// Wh consumed in the last 24 hours
    pub last_24h: u32,
    pub hourly: [u16; HOURS],
}

impl DailyData {
    fn from_payload(payload: &[u8], current_hour: u32) -> Self {
        let mut hourly = [0u16; HOURS];
        for (slot, pair) in hourly.iter_mut().zip(payload.chunks_exact(2)) {
            *slot = u16::from_be_bytes([pair[0], pair[1]]);
        }

        let hours_today = (current_hour as usize).min(HOURS - 1) + 1;
        let today = hourly[HOURS - hours_today..]
            .iter()
            .map(|wh| *wh as u32)
            .sum();
        let last_24h = hourly.iter().map(|wh| *wh as u32).sum();

        Self {
            today,
            last_24h,
            hourly,
        }
    }
}

impl fmt::Display for DailyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "today {} Wh, last 24h {} Wh", self.today, self.last_24h)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available => write!(f, "online"),
            Availability::Lost => write!(f, "lost"),
        }
    }
}

impl Response {
    /// Decodes a raw notification. Total: every input maps to some variant.
    pub fn decode(raw: &[u8]) -> Self {
        Self::decode_at(raw, chrono::Local::now().hour())
    }

    /// Same as [`Response::decode`] with an explicit local hour for the daily counters
    pub fn decode_at(raw: &[u8], current_hour: u32) -> Self {
        debug!("Parsing sem6000 message '{}'", hex::encode(raw));

        let Some(&marker) = raw.get(3) else {
            return if raw.first() == Some(&FRAME_START) {
                Response::Incomplete { raw: raw.to_vec() }
            } else {
                Response::Unknown
            };
        };
        if marker != 0x00 {
            debug!("Message is unknown");
            return Response::Unknown;
        }
        if raw[0] != FRAME_START {
            return Response::Incomplete { raw: raw.to_vec() };
        }

        let expected_len = raw[1] as usize;
        let actual_len = raw.len();
        if actual_len != expected_len + 4 && actual_len != expected_len + 2 {
            debug!(
                "Message is not complete. Expected length: {}, actual length: {}",
                expected_len, actual_len
            );
            return Response::Incomplete { raw: raw.to_vec() };
        }

        let result = raw.get(PAYLOAD_OFFSET).copied();
        match (raw[2], result) {
            (LOGIN, Some(result)) => Response::Login { result },
            (SYNC_TIME, Some(result)) => Response::SyncTime { result },
            (SWITCH, Some(result)) => Response::Switch { result },
            (LOGIN | SYNC_TIME | SWITCH, None) => Response::Incomplete { raw: raw.to_vec() },
            (MEASURE, _) => {
                let mut payload = [0u8; MEASUREMENT_LEN];
                let available = &raw[PAYLOAD_OFFSET.min(actual_len)..];
                let copied = available.len().min(MEASUREMENT_LEN);
                payload[..copied].copy_from_slice(&available[..copied]);
                Response::Measurement(Measurement::from_payload(&payload))
            }
            (DAILY_DATA, _) => {
                if actual_len == DAILY_DATA_FRAME_LEN && raw[actual_len - 1] == 0xff {
                    let payload = &raw[PAYLOAD_OFFSET..PAYLOAD_OFFSET + HOURS * 2];
                    Response::DailyData(DailyData::from_payload(payload, current_hour))
                } else {
                    Response::Unknown
                }
            }
            (LED, _) => Response::Led,
            _ => Response::Unknown,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Login { result } => write!(f, "login result {}", result),
            Response::Switch { result } => write!(f, "switch result {}", result),
            Response::Led => write!(f, "LED: success"),
            Response::Measurement(measurement) => write!(f, "measurement: {}", measurement),
            Response::DailyData(data) => write!(f, "daily data: {}", data),
            Response::SyncTime { result } => write!(f, "sync time result {}", result),
            Response::Incomplete { raw } => write!(f, "incomplete: {}", hex::encode(raw)),
            Response::Unknown => write!(f, "unknown"),
        }
    }
}
