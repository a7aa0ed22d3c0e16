//! The per-device vendor-operation surface with sticky failure.
//!
//! Once a control transfer fails, every later vendor operation on the
//! same device short-circuits with the cached error instead of hammering
//! a wedged or unplugged device.  The fault cell is checked at the head
//! of every operation rather than threaded through each call site.

use std::sync::Mutex;
use std::time::Duration;

use crate::protocol::{
    CONTROL_TIMEOUT, CPU_RESET_ADDR, CYPRESS_FIRMWARE_LOAD, EP_MESSAGES,
    EP_MPEGTS, LONG_CONTROL_TIMEOUT, MESSAGE_TIMEOUT, MPEGTS_TIMEOUT,
    START_TIMEOUT, VR_CLEAR_FPGA_COMMAND, VR_FUJITSU_READ,
    VR_FUJITSU_START_ENCODING, VR_FUJITSU_STOP_ENCODING, VR_FUJITSU_WRITE,
    VR_GET_FIFO_LEVEL, VR_READ_REGISTER, VR_SEND_DEVICE_STATUS,
    VR_SEND_FPGA_COMMAND, VR_SET_AUDIO_DELAY, VR_SET_INPUT_SOURCE,
};
use crate::transport::{Result, TransportError, UsbPort};

/// An FX2/H56 encoder device with fail-fast vendor operations.
pub struct EncoderDevice<P> {
    port: P,
    fault: Mutex<Option<TransportError>>,
}

impl<P: UsbPort> EncoderDevice<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            fault: Mutex::new(None),
        }
    }

    /// Borrow the underlying port (bulk buffers, tests).
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The cached failure, if any vendor operation has faulted.
    pub fn fault(&self) -> Option<TransportError> {
        self.fault.lock().ok().and_then(|g| *g)
    }

    /// True while no vendor operation has faulted.
    pub fn healthy(&self) -> bool {
        self.fault().is_none()
    }

    fn check(&self) -> Result<()> {
        match self.fault() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn latch(&self, e: TransportError) -> TransportError {
        if let Ok(mut guard) = self.fault.lock() {
            guard.get_or_insert(e);
        }
        e
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        self.check()?;
        self.port
            .control_out(request, value, index, buf, timeout)
            .map_err(|e| self.latch(e))
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.check()?;
        self.port
            .control_in(request, value, index, buf, timeout)
            .map_err(|e| self.latch(e))
    }

    /// Read one FX2-internal register.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn read_fx2_register(&self, reg: u8) -> Result<u8> {
        let mut value = [0u8; 1];
        self.control_in(
            VR_READ_REGISTER,
            0x0000,
            u16::from(reg) << 8,
            &mut value,
            CONTROL_TIMEOUT,
        )?;
        Ok(value[0])
    }

    /// Write FX2 RAM (or the CPU-reset register) via the Cypress loader
    /// request.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn load_ram(&self, address: u16, data: &[u8]) -> Result<()> {
        self.control_out(CYPRESS_FIRMWARE_LOAD, address, 0, data, CONTROL_TIMEOUT)
    }

    /// Assert or deassert the FX2 CPU reset.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn cpu_reset(&self, hold: bool) -> Result<()> {
        self.load_ram(CPU_RESET_ADDR, &[u8::from(hold)])
    }

    /// Read a 16-bit H56 register at a 24-bit address.
    ///
    /// # Errors
    ///
    /// Transport failure (latches), or [`TransportError::Short`] when the
    /// device answers with fewer than two bytes (does not latch).
    #[allow(clippy::cast_possible_truncation)] // reg & 0xffff / >> 16 are masks
    pub fn h56_read(&self, reg: u32) -> Result<u16> {
        let mut value = [0u8; 2];
        let n = self.control_in(
            VR_FUJITSU_READ,
            (reg & 0xffff) as u16,
            ((reg >> 16) & 0xff) as u16,
            &mut value,
            CONTROL_TIMEOUT,
        )?;
        if n != 2 {
            return Err(TransportError::Short {
                expected: 2,
                actual: n,
            });
        }
        Ok(u16::from_be_bytes(value))
    }

    /// Write a 16-bit H56 register at a 24-bit address.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    #[allow(clippy::cast_possible_truncation)] // byte-split of reg/value
    pub fn h56_write(&self, reg: u32, value: u16) -> Result<()> {
        let msg = [
            (reg >> 16) as u8,
            (reg >> 8) as u8,
            reg as u8,
            (value >> 8) as u8,
            value as u8,
        ];
        self.control_out(VR_FUJITSU_WRITE, 0, 0, &msg, CONTROL_TIMEOUT)
    }

    /// Queue a command byte to the FPGA.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn send_fpga_command(&self, command: u8) -> Result<()> {
        self.control_out(VR_SEND_FPGA_COMMAND, 0, 0, &[command], CONTROL_TIMEOUT)
    }

    /// Clear a command byte from the FPGA.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn clear_fpga_command(&self, command: u8) -> Result<()> {
        self.control_out(VR_CLEAR_FPGA_COMMAND, 0, 0, &[command], CONTROL_TIMEOUT)
    }

    /// Set the audio delay for the current timing (slow operation).
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn set_audio_delay(&self, delay: u8) -> Result<()> {
        self.control_out(VR_SET_AUDIO_DELAY, 0, 0, &[delay], LONG_CONTROL_TIMEOUT)
    }

    /// Select the capture input connector (H.264 Pro Recorder).
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn set_input_source(&self, source: u16) -> Result<()> {
        self.control_out(VR_SET_INPUT_SOURCE, source, 0, &[], CONTROL_TIMEOUT)
    }

    /// Ask the FX2 to emit a status frame on the message endpoint.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn request_device_status(&self) -> Result<()> {
        self.control_out(VR_SEND_DEVICE_STATUS, 0, 0, &[], CONTROL_TIMEOUT)
    }

    /// Kick off the encode pipeline.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn start_encoding(&self) -> Result<()> {
        let mut status = [0u8; 1];
        self.control_in(
            VR_FUJITSU_START_ENCODING,
            0x0004,
            0,
            &mut status,
            START_TIMEOUT,
        )?;
        Ok(())
    }

    /// Halt the encode pipeline.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn stop_encoding(&self) -> Result<()> {
        let mut status = [0u8; 1];
        self.control_in(VR_FUJITSU_STOP_ENCODING, 0, 0, &mut status, CONTROL_TIMEOUT)?;
        Ok(())
    }

    /// Read the stream FIFO fill level (slow operation).
    ///
    /// # Errors
    ///
    /// Transport failure (latches), or [`TransportError::Short`] on an
    /// incomplete answer (does not latch).
    pub fn fifo_level(&self) -> Result<u32> {
        let mut level = [0u8; 4];
        let n = self.control_in(VR_GET_FIFO_LEVEL, 0, 0, &mut level, LONG_CONTROL_TIMEOUT)?;
        if n != 4 {
            return Err(TransportError::Short {
                expected: 4,
                actual: n,
            });
        }
        Ok(u32::from_le_bytes(level))
    }

    /// Bulk-read from the MPEG-TS endpoint.
    ///
    /// Timeouts are an expected idle condition here and no error latches;
    /// the reader thread decides what is terminal.
    ///
    /// # Errors
    ///
    /// Cached fault, or the fresh bulk error.
    pub fn read_mpegts(&self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        self.port.bulk_in(EP_MPEGTS, buf, MPEGTS_TIMEOUT)
    }

    /// Bulk-read from the async message endpoint.
    ///
    /// Any failure here (timeout included) means the status channel is
    /// gone, so errors latch.
    ///
    /// # Errors
    ///
    /// Cached or fresh transport failure; a fresh one latches.
    pub fn read_messages(&self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        self.port
            .bulk_in(EP_MESSAGES, buf, MESSAGE_TIMEOUT)
            .map_err(|e| self.latch(e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for readable assertions
mod tests {
    use super::*;
    use crate::testing::{MockPort, Transfer};

    #[test]
    fn fx2_register_read_encodes_address_in_index() {
        let port = MockPort::new();
        port.queue_control_in(VR_READ_REGISTER, vec![0x5a]);
        let dev = EncoderDevice::new(port);
        assert_eq!(dev.read_fx2_register(0x88).unwrap(), 0x5a);
        let log = dev.port().transfers();
        assert_eq!(
            log[0],
            Transfer::ControlIn {
                request: VR_READ_REGISTER,
                value: 0x0000,
                index: 0x8800,
                len: 1,
            }
        );
    }

    #[test]
    fn h56_write_packs_address_and_value_big_endian() {
        let dev = EncoderDevice::new(MockPort::new());
        dev.h56_write(0x0800ea, 0x0a0c).unwrap();
        let log = dev.port().transfers();
        assert_eq!(
            log[0],
            Transfer::ControlOut {
                request: VR_FUJITSU_WRITE,
                value: 0,
                index: 0,
                data: vec![0x08, 0x00, 0xea, 0x0a, 0x0c],
            }
        );
    }

    #[test]
    fn h56_read_decodes_big_endian_and_splits_address() {
        let port = MockPort::new();
        port.queue_control_in(VR_FUJITSU_READ, vec![0x12, 0x34]);
        let dev = EncoderDevice::new(port);
        assert_eq!(dev.h56_read(0x081020).unwrap(), 0x1234);
        let log = dev.port().transfers();
        assert_eq!(
            log[0],
            Transfer::ControlIn {
                request: VR_FUJITSU_READ,
                value: 0x1020,
                index: 0x08,
                len: 2,
            }
        );
    }

    #[test]
    fn fault_short_circuits_followup_operations() {
        let port = MockPort::new();
        port.fail_control(VR_FUJITSU_WRITE, rusb::Error::Pipe);
        let dev = EncoderDevice::new(port);
        assert!(dev.h56_write(0x001000, 0x0200).is_err());
        assert!(!dev.healthy());

        // Short-circuited: nothing new reaches the port.
        let before = dev.port().transfers().len();
        assert_eq!(
            dev.h56_write(0x001002, 0x8480),
            Err(TransportError::Usb(rusb::Error::Pipe))
        );
        assert_eq!(dev.read_fx2_register(0x88).unwrap_err(), dev.fault().unwrap());
        assert_eq!(dev.port().transfers().len(), before);
    }

    #[test]
    fn short_h56_read_is_an_error_but_does_not_latch() {
        let port = MockPort::new();
        port.queue_control_in(VR_FUJITSU_READ, vec![0x12]);
        let dev = EncoderDevice::new(port);
        assert_eq!(
            dev.h56_read(0x001000),
            Err(TransportError::Short {
                expected: 2,
                actual: 1,
            })
        );
        assert!(dev.healthy());
    }

    #[test]
    fn mpegts_timeout_does_not_latch() {
        let port = MockPort::new();
        port.queue_bulk_error(EP_MPEGTS, rusb::Error::Timeout);
        let dev = EncoderDevice::new(port);
        let mut buf = [0u8; 16];
        let err = dev.read_mpegts(&mut buf).unwrap_err();
        assert!(err.is_timeout());
        assert!(dev.healthy());
    }

    #[test]
    fn message_read_failure_latches() {
        let port = MockPort::new();
        port.queue_bulk_error(EP_MESSAGES, rusb::Error::NoDevice);
        let dev = EncoderDevice::new(port);
        let mut buf = [0u8; 16];
        assert!(dev.read_messages(&mut buf).is_err());
        assert!(!dev.healthy());
    }
}
