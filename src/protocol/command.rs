use super::{ProtocolError, FRAME_END, FRAME_START};
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::fmt;

const LOGIN: [u8; 2] = [0x17, 0x00];
const SYNC_TIME: [u8; 2] = [0x01, 0x00];
const SWITCH: [u8; 2] = [0x03, 0x00];
const LED: [u8; 2] = [0x0f, 0x00];
const MEASURE: [u8; 1] = [0x04];
const DAILY_DATA: [u8; 1] = [0x0a];

/// What a command asks the plug to do, kept for log output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Login,
    SyncTime,
    Switch(bool),
    Led(bool),
    Measure,
    DailyData,
    Raw,
}

/// An outgoing frame, built once per send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    frame: Vec<u8>,
}

impl Command {
    /// Frames an arbitrary command code and payload.
    ///
    /// Only fails if the frame would not fit the one-byte length field.
    pub fn encode(code: &[u8], payload: &[u8]) -> Result<Self, ProtocolError> {
        let len = code.len() + payload.len() + 1;
        if len > u8::MAX as usize {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        Ok(Self::assemble(CommandKind::Raw, code, payload))
    }

    /// Login with the 4-digit PIN printed on the plug
    pub fn login(pin: &str) -> Result<Self, ProtocolError> {
        let digits: Vec<u8> = pin
            .chars()
            .filter_map(|c| c.to_digit(10))
            .map(|d| d as u8)
            .collect();
        if digits.len() != 4 || pin.len() != 4 {
            return Err(ProtocolError::InvalidPin {
                length: pin.chars().count(),
            });
        }

        let mut payload = [0u8; 9];
        payload[1..5].copy_from_slice(&digits);
        Ok(Self::assemble(CommandKind::Login, &LOGIN, &payload))
    }

    /// Sets the plug clock, which it needs for its daily energy counters
    pub fn sync_time(now: NaiveDateTime) -> Self {
        let year = now.year() as u16;
        let payload = [
            now.second() as u8,
            now.minute() as u8,
            now.hour() as u8,
            now.day() as u8,
            now.month() as u8,
            (year >> 8) as u8,
            (year & 0xff) as u8,
            0x00,
            0x00,
        ];
        Self::assemble(CommandKind::SyncTime, &SYNC_TIME, &payload)
    }

    pub fn switch(on: bool) -> Self {
        let payload = [on as u8, 0x00, 0x00];
        Self::assemble(CommandKind::Switch(on), &SWITCH, &payload)
    }

    pub fn led(on: bool) -> Self {
        let payload = [0x05, on as u8, 0x00, 0x00, 0x00, 0x00, 0x00];
        Self::assemble(CommandKind::Led(on), &LED, &payload)
    }

    pub fn measure() -> Self {
        Self::assemble(CommandKind::Measure, &MEASURE, &[0x00, 0x00, 0x00])
    }

    pub fn daily_data() -> Self {
        Self::assemble(CommandKind::DailyData, &DAILY_DATA, &[0x00, 0x00, 0x00])
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.frame)
    }

    fn assemble(kind: CommandKind, code: &[u8], payload: &[u8]) -> Self {
        let len = code.len() + payload.len() + 1;
        let mut frame = Vec::with_capacity(len + 4);
        frame.push(FRAME_START);
        frame.push(len as u8);
        frame.extend_from_slice(code);
        frame.extend_from_slice(payload);
        frame.push(checksum(code, payload));
        frame.extend_from_slice(&FRAME_END);
        Self { kind, frame }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |on: bool| if on { "on" } else { "off" };
        match self.kind {
            CommandKind::Login => write!(f, "login"),
            CommandKind::SyncTime => write!(f, "sync time"),
            CommandKind::Switch(on) => write!(f, "relay {}", on_off(on)),
            CommandKind::Led(on) => write!(f, "led {}", on_off(on)),
            CommandKind::Measure => write!(f, "measure"),
            CommandKind::DailyData => write!(f, "daily data"),
            CommandKind::Raw => write!(f, "raw {}", self.to_hex()),
        }
    }
}

fn checksum(code: &[u8], payload: &[u8]) -> u8 {
    code.iter()
        .chain(payload)
        .fold(1u8, |sum, byte| sum.wrapping_add(*byte))
}
