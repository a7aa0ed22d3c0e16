//! Raw USB port abstraction.
//!
//! [`UsbPort`] is the seam between the driver logic and libusb: vendor
//! control transfers in both directions plus bulk-IN reads.  Production
//! code uses [`RusbPort`]; tests substitute the recording mock from
//! [`crate::testing`].

use std::time::Duration;

/// Transfer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The underlying libusb transfer failed.
    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),
    /// The device answered with fewer bytes than the protocol requires.
    #[error("short transfer: {actual} of {expected} bytes")]
    Short {
        /// Bytes the protocol requires.
        expected: usize,
        /// Bytes actually transferred.
        actual: usize,
    },
}

impl TransportError {
    /// Bulk-read timeouts are retryable; everything else is a fault.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Usb(rusb::Error::Timeout))
    }
}

/// Driver-facing result type.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Vendor-request and bulk-IN capable USB port.
///
/// All methods take `&self`: libusb device handles are thread-safe and
/// the two per-device threads share one port.  The discipline that only
/// the message thread issues control transfers after encode start is the
/// caller's responsibility.
pub trait UsbPort: Send + Sync {
    /// Vendor control transfer, device to host.  Returns bytes received.
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Vendor control transfer, host to device.
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<()>;

    /// Bulk-IN read.  Returns bytes received.
    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// [`UsbPort`] over an opened, claimed rusb device handle.
pub struct RusbPort {
    handle: rusb::DeviceHandle<rusb::Context>,
}

impl RusbPort {
    /// Open the device, select configuration 1 and claim interface 0.
    ///
    /// # Errors
    ///
    /// Any libusb failure along the open/configure/claim sequence.
    pub fn open(device: &rusb::Device<rusb::Context>) -> Result<Self> {
        let mut handle = device.open()?;
        handle.set_active_configuration(1)?;
        handle.claim_interface(0)?;
        Ok(Self { handle })
    }
}

impl Drop for RusbPort {
    fn drop(&mut self) {
        // The handle close itself happens in rusb's own Drop.
        let _ = self.handle.release_interface(0);
    }
}

impl UsbPort for RusbPort {
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let rt = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        Ok(self
            .handle
            .read_control(rt, request, value, index, buf, timeout)?)
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let rt = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.handle
            .write_control(rt, request, value, index, buf, timeout)?;
        Ok(())
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(endpoint, buf, timeout)?)
    }
}
