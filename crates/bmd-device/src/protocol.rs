//! Wire-level constants: USB identifiers, vendor request codes, endpoints
//! and transfer timeouts.
//!
//! The request codes are vendor-assigned and carried verbatim; nothing
//! here is derived.

use std::time::Duration;

/// Blackmagic Design's USB vendor id.
pub const VID_BLACKMAGIC_DESIGN: u16 = 0x1edb;

/// ATEM TV Studio (mixer with built-in H.264 encoder).
pub const PID_ATEM_TV_STUDIO: u16 = 0xbd52;

/// H.264 Pro Recorder (standalone capture box).
pub const PID_H264_PRO_RECORDER: u16 = 0xbd43;

/// Cypress ROM loader request: write FX2 RAM / CPU-reset register.
pub const CYPRESS_FIRMWARE_LOAD: u8 = 0xa0;

/// FX2 address of the CPU-reset control register (CPUCS).
pub const CPU_RESET_ADDR: u16 = 0xe600;

/// Ask the FX2 to emit a device-status frame on the message endpoint.
pub const VR_SEND_DEVICE_STATUS: u8 = 0xb0;
/// Queue a command byte to the FPGA.
pub const VR_SEND_FPGA_COMMAND: u8 = 0xb1;
/// Clear a command byte from the FPGA.
pub const VR_CLEAR_FPGA_COMMAND: u8 = 0xb2;
/// Read the stream FIFO fill level (4 bytes).
pub const VR_GET_FIFO_LEVEL: u8 = 0xb3;
/// Set the audio delay byte for the current timing.
pub const VR_SET_AUDIO_DELAY: u8 = 0xb4;
/// Select the capture input connector (H.264 Pro Recorder only).
pub const VR_SET_INPUT_SOURCE: u8 = 0xb5;
/// Read one FX2-internal register (`index = reg << 8`).
pub const VR_READ_REGISTER: u8 = 0xb6;
/// Start the H56 encode pipeline (`value = 0x0004`).
pub const VR_FUJITSU_START_ENCODING: u8 = 0xb8;
/// Stop the H56 encode pipeline.
pub const VR_FUJITSU_STOP_ENCODING: u8 = 0xb9;
/// Read an H56 register (24-bit address split over value/index).
pub const VR_FUJITSU_READ: u8 = 0xba;
/// Write an H56 register (5-byte address+value payload).
pub const VR_FUJITSU_WRITE: u8 = 0xbb;

/// Bulk-IN endpoint carrying the MPEG-TS stream.
pub const EP_MPEGTS: u8 = 0x86;

/// Bulk-IN endpoint carrying asynchronous status messages.
pub const EP_MESSAGES: u8 = 0x88;

/// Timeout for ordinary control transfers.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for the slow control operations (audio delay, FIFO drain).
pub const LONG_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the start-encoding request.
pub const START_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for MPEG-TS bulk reads.
pub const MPEGTS_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for message-endpoint bulk reads.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
