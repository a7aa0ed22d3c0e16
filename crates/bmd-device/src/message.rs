//! Framing and typing of the async message endpoint (0x88).
//!
//! A frame starts with a 16-bit total length, followed by records
//! `{len, payload[len]}` until a zero length byte or the end of the
//! buffer.  The first payload byte is the record type.

use std::fmt;

/// FX2 firmware status, as carried in status-update records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FxStatus {
    /// Not yet reported or unrecognized wire value.
    Unknown = 0,
    /// Encoder power rail is down.
    NotPowered = 1,
    /// FX2 is rewriting its own firmware store.
    UpdatingFirmware = 2,
    /// H56 is being programmed.
    Programming = 3,
    /// H56 is booting.
    Booting = 4,
    /// Ready; encoding can start.
    Idle = 5,
    /// Encode pipeline is spinning up.
    PreparingEncode = 6,
    /// Actively producing the MPEG-TS stream.
    Encoding = 7,
    /// Null-output pipeline is spinning up.
    PreparingNullOutput = 8,
    /// Producing null output.
    NullOutput = 9,
    /// Encode pipeline is draining.
    PreparingStop = 10,
    /// Pipeline stopped.
    Stopped = 11,
    /// The FPGA bitstream did not validate.
    InvalidFpga = 12,
}

impl FxStatus {
    /// Decode the wire byte; values outside the table read as `Unknown`.
    #[must_use]
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => FxStatus::NotPowered,
            2 => FxStatus::UpdatingFirmware,
            3 => FxStatus::Programming,
            4 => FxStatus::Booting,
            5 => FxStatus::Idle,
            6 => FxStatus::PreparingEncode,
            7 => FxStatus::Encoding,
            8 => FxStatus::PreparingNullOutput,
            9 => FxStatus::NullOutput,
            10 => FxStatus::PreparingStop,
            11 => FxStatus::Stopped,
            12 => FxStatus::InvalidFpga,
            _ => FxStatus::Unknown,
        }
    }
}

impl fmt::Display for FxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FxStatus::Unknown => "Unknown",
            FxStatus::NotPowered => "Not powered",
            FxStatus::UpdatingFirmware => "Updating firmware",
            FxStatus::Programming => "Programming H56",
            FxStatus::Booting => "Booting H56",
            FxStatus::Idle => "Idle",
            FxStatus::PreparingEncode => "Preparing for Encode",
            FxStatus::Encoding => "Encoding",
            FxStatus::PreparingNullOutput => "Preparing for Null output",
            FxStatus::NullOutput => "Null output",
            FxStatus::PreparingStop => "Preparing for Stop",
            FxStatus::Stopped => "Stopped",
            FxStatus::InvalidFpga => "FPGA Firmware Invalid",
        };
        f.write_str(s)
    }
}

/// A typed view of one record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMessage<'a> {
    /// `0x01` — FX2 status update.
    Status {
        /// Decoded status.
        status: FxStatus,
        /// Raw wire byte, for logging unrecognized values.
        raw: u8,
    },
    /// `0x05` — input connector report.
    InputConnector {
        /// The raw connector byte; classify with
        /// [`bmd_modes::classify`].
        input: u8,
    },
    /// `0x0d` — H56 signalled an internal error.
    EncoderError,
    /// `0x0e` — periodic timestamp, carries nothing we use.
    Timestamp,
    /// Anything else, kept raw for debug logging.
    Other {
        /// Record type byte.
        kind: u8,
        /// Remaining payload.
        body: &'a [u8],
    },
}

/// Parse one record payload into its typed form.
///
/// Returns `None` for an empty payload or a status record too short to
/// carry its status byte, both protocol violations the caller should
/// log and skip.
#[must_use]
pub fn parse_record(payload: &[u8]) -> Option<DeviceMessage<'_>> {
    let (&kind, body) = payload.split_first()?;
    match kind {
        0x01 => {
            let &raw = payload.get(5)?;
            Some(DeviceMessage::Status {
                status: FxStatus::from_wire(raw),
                raw,
            })
        }
        0x05 => {
            let &input = payload.get(1)?;
            Some(DeviceMessage::InputConnector { input })
        }
        0x0d => Some(DeviceMessage::EncoderError),
        0x0e => Some(DeviceMessage::Timestamp),
        _ => Some(DeviceMessage::Other { kind, body }),
    }
}

/// Iterate the record payloads of a message frame.
///
/// The two-byte frame length header is skipped; iteration stops at a
/// zero length byte, the end of the frame, or a record that would run
/// past it.
#[must_use]
pub fn frame_records(frame: &[u8]) -> FrameRecords<'_> {
    FrameRecords {
        rest: frame.get(2..).unwrap_or(&[]),
    }
}

/// Iterator state for [`frame_records`].
pub struct FrameRecords<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for FrameRecords<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest;
        let (&len, body) = rest.split_first()?;
        if len == 0 {
            self.rest = &[];
            return None;
        }
        let len = usize::from(len);
        let payload = body.get(..len)?;
        self.rest = body.get(len..).unwrap_or(&[]);
        Some(payload)
    }
}
