//! FX2 firmware blobs and the RAM upload protocol.
//!
//! A blob is a flat stream of records `{len, addr_hi, addr_lo, marker,
//! data[len]}`; the first record with a nonzero marker terminates the
//! stream and is itself ignored.  Uploading brackets the records between
//! asserting and releasing the FX2 CPU reset, after which the device
//! re-enumerates with its proper descriptors.

use std::fs;
use std::path::{Path, PathBuf};

use crate::device::EncoderDevice;
use crate::protocol::{PID_ATEM_TV_STUDIO, PID_H264_PRO_RECORDER};
use crate::transport::{self, UsbPort};

/// Firmware file expected for the ATEM TV Studio.
pub const ATEM_TV_STUDIO_FILE: &str = "bmd-atemtvstudio.bin";

/// Firmware file expected for the H.264 Pro Recorder.
pub const H264_PRO_RECORDER_FILE: &str = "bmd-h264prorecorder.bin";

/// Failure to bring a firmware image into memory.
#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    /// The blob file could not be read.
    #[error("{path}: failed to load firmware: {source}")]
    Io {
        /// Offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// An in-memory firmware blob bound to the product id it serves.
#[derive(Debug)]
pub struct FirmwareImage {
    /// USB product id this image belongs to.
    pub device_id: u16,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Wrap raw blob bytes.
    #[must_use]
    pub fn from_bytes(device_id: u16, data: Vec<u8>) -> Self {
        Self { device_id, data }
    }

    /// Read a blob file from disk.
    ///
    /// # Errors
    ///
    /// [`FirmwareError::Io`] when the file cannot be read.
    pub fn load(path: &Path, device_id: u16) -> Result<Self, FirmwareError> {
        let data = fs::read(path).map_err(|source| FirmwareError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_bytes(device_id, data))
    }

    /// Load the standard pair of images from a firmware directory.
    ///
    /// # Errors
    ///
    /// [`FirmwareError::Io`] for the first missing or unreadable file.
    pub fn load_standard_set(dir: &Path) -> Result<Vec<Self>, FirmwareError> {
        Ok(vec![
            Self::load(&dir.join(ATEM_TV_STUDIO_FILE), PID_ATEM_TV_STUDIO)?,
            Self::load(&dir.join(H264_PRO_RECORDER_FILE), PID_H264_PRO_RECORDER)?,
        ])
    }

    /// Blob size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Iterate the load records, stopping at the terminator.
    #[must_use]
    pub fn records(&self) -> Records<'_> {
        Records { rest: &self.data }
    }
}

/// One RAM load record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareRecord<'a> {
    /// FX2 RAM target address.
    pub address: u16,
    /// Bytes to write there.
    pub data: &'a [u8],
}

/// Iterator over the records of a blob.
pub struct Records<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = FirmwareRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest;
        let header = rest.get(..4)?;
        // Bounds: header has exactly four bytes.
        #[allow(clippy::indexing_slicing)]
        let (len, marker) = (usize::from(header[0]), header[3]);
        if marker != 0 {
            // Terminator record; it carries no payload for us.
            self.rest = &[];
            return None;
        }
        // A truncated final record is dropped rather than half-uploaded.
        let data = rest.get(4..4 + len)?;
        self.rest = rest.get(4 + len..).unwrap_or(&[]);
        let address = u16::from(header[1]) << 8 | u16::from(header[2]);
        Some(FirmwareRecord { address, data })
    }
}

impl<P: UsbPort> EncoderDevice<P> {
    /// Stream a firmware image into FX2 RAM.
    ///
    /// Holds the CPU in reset, writes each record to its address, then
    /// releases the reset.  For a blob of K records this issues exactly
    /// K + 2 control-out transfers.
    ///
    /// # Errors
    ///
    /// The first transport failure; later records short-circuit via the
    /// sticky fault.
    pub fn upload_firmware(&self, fw: &FirmwareImage) -> transport::Result<()> {
        self.cpu_reset(true)?;
        for record in fw.records() {
            self.load_ram(record.address, record.data)?;
        }
        self.cpu_reset(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for readable assertions
mod tests {
    use super::*;

    #[test]
    fn records_stop_at_nonzero_marker() {
        // Two records, then a terminator with trailing junk.
        let blob = vec![
            0x01, 0x00, 0x10, 0x00, 0xaa, // one byte at 0x0010
            0x02, 0x00, 0x20, 0x00, 0xbb, 0xcc, // two bytes at 0x0020
            0x00, 0x00, 0x00, 0x01, // terminator
            0xde, 0xad,
        ];
        let fw = FirmwareImage::from_bytes(PID_ATEM_TV_STUDIO, blob);
        let records: Vec<_> = fw.records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, 0x0010);
        assert_eq!(records[0].data, [0xaa]);
        assert_eq!(records[1].address, 0x0020);
        assert_eq!(records[1].data, [0xbb, 0xcc]);
    }

    #[test]
    fn truncated_record_is_not_yielded() {
        let blob = vec![0x08, 0x00, 0x10, 0x00, 0xaa, 0xbb];
        let fw = FirmwareImage::from_bytes(PID_ATEM_TV_STUDIO, blob);
        assert_eq!(fw.records().count(), 0);
    }

    #[test]
    fn empty_blob_has_no_records() {
        let fw = FirmwareImage::from_bytes(PID_H264_PRO_RECORDER, Vec::new());
        assert_eq!(fw.records().count(), 0);
    }

    #[test]
    fn load_standard_set_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ATEM_TV_STUDIO_FILE), [0u8; 4]).unwrap();
        // Recorder image missing.
        let err = FirmwareImage::load_standard_set(dir.path()).unwrap_err();
        let FirmwareError::Io { path, .. } = err;
        assert!(path.ends_with(H264_PRO_RECORDER_FILE));
    }
}
