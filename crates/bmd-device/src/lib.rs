//! USB driver for the Blackmagic H.264 encoder family.
//!
//! These devices pair a Cypress FX2 USB microcontroller with a Fujitsu
//! MB86H56 H.264 encoder.  The FX2 executes vendor control requests and
//! exposes two bulk-IN endpoints: the MPEG-TS payload on 0x86 and an
//! asynchronous status/event channel on 0x88.
//!
//! Layering, bottom up:
//! - [`transport`] — the raw port trait over control/bulk transfers, plus
//!   the `rusb`-backed implementation used against real hardware;
//! - [`device`] — [`EncoderDevice`], the sticky-failure wrapper carrying
//!   every vendor operation (FX2 registers, H56 registers, FPGA commands,
//!   encode start/stop);
//! - [`firmware`] — FX2 firmware blobs and their upload protocol;
//! - [`message`] — framing and typing of the async endpoint traffic;
//! - [`encoder`] — encoding parameters and the register program that
//!   configures the H56 for a display mode.

pub mod device;
pub mod encoder;
pub mod firmware;
pub mod message;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use device::EncoderDevice;
pub use transport::{RusbPort, TransportError, UsbPort};
