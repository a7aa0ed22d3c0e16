//! Scriptable in-memory [`UsbPort`] for driver and worker tests.
//!
//! The mock records every transfer it sees and plays back queued
//! responses, so tests can assert on the exact vendor-request sequence a
//! code path emits (the firmware upload bracket, the encoder register
//! program, the stop flush) without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::transport::{Result, TransportError, UsbPort};

/// One recorded transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// Vendor IN transfer; `len` is the caller's buffer size.
    ControlIn {
        /// Vendor request code.
        request: u8,
        /// wValue.
        value: u16,
        /// wIndex.
        index: u16,
        /// Requested length.
        len: usize,
    },
    /// Vendor OUT transfer with its payload.
    ControlOut {
        /// Vendor request code.
        request: u8,
        /// wValue.
        value: u16,
        /// wIndex.
        index: u16,
        /// Payload bytes.
        data: Vec<u8>,
    },
    /// Bulk-IN read attempt.
    BulkIn {
        /// Endpoint address.
        endpoint: u8,
    },
}

#[derive(Default)]
struct Inner {
    log: Vec<Transfer>,
    control_in_data: HashMap<u8, VecDeque<Vec<u8>>>,
    control_failures: HashMap<u8, TransportError>,
    bulk: HashMap<u8, VecDeque<Result<Vec<u8>>>>,
}

/// Recording, scriptable USB port.
///
/// Unscripted control-IN transfers answer with a zero-filled buffer;
/// exhausted bulk queues answer `NoDevice` so reader loops terminate.
pub struct MockPort {
    inner: Mutex<Inner>,
}

impl MockPort {
    /// An empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    #[allow(clippy::unwrap_used)] // test support: a poisoned mock is a test bug
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Queue a response for the next control-IN with this request code.
    pub fn queue_control_in(&self, request: u8, data: Vec<u8>) {
        self.lock()
            .control_in_data
            .entry(request)
            .or_default()
            .push_back(data);
    }

    /// Make every transfer with this request code fail.
    pub fn fail_control(&self, request: u8, error: rusb::Error) {
        self.lock()
            .control_failures
            .insert(request, TransportError::Usb(error));
    }

    /// Queue a successful bulk-IN payload on an endpoint.
    pub fn queue_bulk(&self, endpoint: u8, data: Vec<u8>) {
        self.lock().bulk.entry(endpoint).or_default().push_back(Ok(data));
    }

    /// Queue a bulk-IN failure on an endpoint.
    pub fn queue_bulk_error(&self, endpoint: u8, error: rusb::Error) {
        self.lock()
            .bulk
            .entry(endpoint)
            .or_default()
            .push_back(Err(TransportError::Usb(error)));
    }

    /// Snapshot of every transfer recorded so far.
    #[must_use]
    pub fn transfers(&self) -> Vec<Transfer> {
        self.lock().log.clone()
    }

    /// Only the control-OUT transfers, in order.
    #[must_use]
    pub fn control_outs(&self) -> Vec<Transfer> {
        self.transfers()
            .into_iter()
            .filter(|t| matches!(t, Transfer::ControlOut { .. }))
            .collect()
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbPort for MockPort {
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut inner = self.lock();
        inner.log.push(Transfer::ControlIn {
            request,
            value,
            index,
            len: buf.len(),
        });
        if let Some(e) = inner.control_failures.get(&request) {
            return Err(*e);
        }
        match inner
            .control_in_data
            .get_mut(&request)
            .and_then(VecDeque::pop_front)
        {
            Some(data) => {
                let n = data.len().min(buf.len());
                // Bounds: n <= buf.len() and n <= data.len().
                #[allow(clippy::indexing_slicing)]
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => {
                buf.fill(0);
                Ok(buf.len())
            }
        }
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.log.push(Transfer::ControlOut {
            request,
            value,
            index,
            data: buf.to_vec(),
        });
        if let Some(e) = inner.control_failures.get(&request) {
            return Err(*e);
        }
        Ok(())
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut inner = self.lock();
        inner.log.push(Transfer::BulkIn { endpoint });
        match inner.bulk.get_mut(&endpoint).and_then(VecDeque::pop_front) {
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                // Bounds: n <= buf.len() and n <= data.len().
                #[allow(clippy::indexing_slicing)]
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Usb(rusb::Error::NoDevice)),
        }
    }
}
