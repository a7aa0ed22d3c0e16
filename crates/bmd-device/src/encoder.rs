//! Encoding parameters and the H56 register program.
//!
//! [`configure`] translates a display-mode profile plus the operator's
//! encoding parameters into the fixed sequence of vendor transfers that
//! arms the encoder: FPGA conversion commands, the audio delay, roughly
//! seventy H56 register writes in six groups, and the final enable.
//!
//! Most register values are opaque hardware captures; the groups below
//! are labelled the way they were reverse engineered.  Do not reorder or
//! "clean up" the sequence; the chip cares.

use bmd_modes::ModeProfile;

use crate::device::EncoderDevice;
use crate::transport::{Result, UsbPort};

/// H.264 profile selector, as encoded into register 0x0015a0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum H264Profile {
    /// Baseline profile.
    Baseline,
    /// Main profile.
    Main,
    /// High profile.
    #[default]
    High,
}

impl H264Profile {
    /// The two-bit field value.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            H264Profile::Baseline => 0,
            H264Profile::Main => 1,
            H264Profile::High => 2,
        }
    }
}

/// Capture input connector of the H.264 Pro Recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSource {
    /// Leave the device's own selection alone.
    #[default]
    Unset,
    /// SDI input.
    Sdi,
    /// HDMI input.
    Hdmi,
    /// Component analog input.
    Component,
    /// Composite analog input.
    Composite,
    /// S-Video input.
    SVideo,
}

impl InputSource {
    /// Wire selector for SET_INPUT_SOURCE; `None` for [`Unset`].
    ///
    /// [`Unset`]: InputSource::Unset
    #[must_use]
    pub fn wire(self) -> Option<u16> {
        match self {
            InputSource::Unset => None,
            InputSource::Sdi => Some(0),
            InputSource::Hdmi => Some(1),
            InputSource::Component => Some(2),
            InputSource::Composite => Some(3),
            InputSource::SVideo => Some(4),
        }
    }
}

/// Operator-chosen encoding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingParameters {
    /// Target video bitrate.
    pub video_kbps: u16,
    /// Peak video bitrate; never below `video_kbps` after
    /// [`normalized`](EncodingParameters::normalized).
    pub video_max_kbps: u16,
    /// Audio bitrate.
    pub audio_kbps: u16,
    /// Audio sample rate in Hz (32000, 44100 or 48000).
    pub audio_khz: u32,
    /// H.264 profile.
    pub h264_profile: H264Profile,
    /// H.264 level, times ten (40 = level 4.0).
    pub h264_level: u8,
    /// CABAC entropy coding on/off.
    pub h264_cabac: bool,
    /// B-frame emission on/off.
    pub h264_bframes: bool,
    /// Frame-rate divider, 1 or 2.
    pub fps_divider: u8,
    /// Capture connector selection.
    pub input_source: InputSource,
}

impl Default for EncodingParameters {
    fn default() -> Self {
        Self {
            video_kbps: 3000,
            video_max_kbps: 3500,
            audio_kbps: 256,
            audio_khz: 48000,
            h264_profile: H264Profile::High,
            h264_level: 40,
            h264_cabac: true,
            h264_bframes: false,
            fps_divider: 1,
            input_source: InputSource::Unset,
        }
    }
}

impl EncodingParameters {
    /// Enforce the parameter invariants: the peak rate tops up to 100
    /// above the target when it was set below it, and the frame-rate
    /// divider clamps to {1, 2}.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.video_max_kbps < self.video_kbps {
            self.video_max_kbps = self.video_kbps.saturating_add(100);
        }
        self.fps_divider = self.fps_divider.clamp(1, 2);
        self
    }
}

/// Approximate the total mux bandwidth the device must be told about.
///
/// The shape of this expression was lifted from the vendor driver's
/// traffic; nobody claims it is pretty, only that it matches.  The
/// accumulator is a 32-bit integer, so every term is truncated as it
/// lands; the one-LSB differences feed straight into register values.
#[must_use]
pub fn total_bandwidth(mode: &ModeProfile, ep: &EncodingParameters) -> u32 {
    let fps = mode.fps.as_f64();
    let mut bw: u32 = 85226;
    bw = add_truncated(
        bw,
        (f64::from(ep.audio_kbps) * 1000.0 * 1024.0 / (8.0 * f64::from(ep.audio_khz))
            + 14.0)
            / 148.0
            * 1504.0
            * f64::from(ep.audio_khz)
            / 1024.0,
    );
    bw = add_truncated(
        bw,
        48128.0 * fps / if fps == 25.0 || fps == 50.0 { 12.0 } else { 15.0 },
    );
    bw = add_truncated(
        bw,
        1.021739130434783
            * ((1464.0 * fps).ceil()
                + (152.0 * fps).ceil()
                + f64::from(ep.video_max_kbps.saturating_add(1000)) * 1000.0),
    );
    bw
}

/// One `bw += term` step of the bandwidth sum: add in double precision,
/// truncate back to the integer accumulator.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // the truncation is the point
fn add_truncated(acc: u32, term: f64) -> u32 {
    (f64::from(acc) + term) as u32
}

/// Program the encoder for `mode` with parameters `ep`.
///
/// Call only with normalized parameters and only while the device is
/// Idle.  Ends with the group-6 enable write; the actual stream start is
/// a separate [`EncoderDevice::start_encoding`] call.
///
/// # Errors
///
/// The first transport failure; the sticky fault makes the remainder of
/// the sequence a no-op.
#[allow(clippy::cast_possible_truncation)] // 16-bit register fields are masks of wider math
pub fn configure<P: UsbPort>(
    dev: &EncoderDevice<P>,
    mode: &ModeProfile,
    ep: &EncodingParameters,
) -> Result<()> {
    let bandwidth = total_bandwidth(mode, ep);

    // The FPGA sits between the FX2 and the H56 and does the
    // interlace-to-progressive conversion when the profile wants it.
    for command in [0x20, 0x40] {
        if mode.program_fpga {
            dev.send_fpga_command(command)?;
        } else {
            dev.clear_fpga_command(command)?;
        }
    }
    dev.set_audio_delay(mode.audio_delay)?;

    let w = |reg: u32, value: u16| dev.h56_write(reg, value);

    // Group 1 - muxing
    w(0x0800ea, 0x0a0c)?;
    w(0x0800ec, 0x000d)?;
    w(0x0800ee, 0x0000)?;
    w(0x0800f0, 0x0504)?;
    w(0x0800f2, 0x4844)?;
    w(0x0800f4, 0x4d56)?;
    w(0x0800f6, 0x8804)?;
    w(0x0800f8, 0x0fff)?;
    w(0x0800fa, 0xfcfc)?;
    w(0x080100, 0x6308)?;
    w(0x080102, 0xc000 | ((bandwidth / 400) >> 8) as u16)?;
    w(0x080104, 0x00ff | ((bandwidth / 400) << 8) as u16)?;
    w(0x080106, 0xffff)?;
    w(0x080108, 0xffff)?;
    w(0x080110, 0x1bf0)?;
    w(0x080112, 0x11f0)?;
    w(0x080114, 0x0302)?;
    w(0x080116, 0x0102 | u16::from(mode.fx2_fps) << 3)?;
    w(0x080118, 0x0ff1)?;
    w(0x08011a, 0x00f0)?;
    w(0x08011c, 0x0000)?;

    // Group 2 - MPEG-TS muxer
    w(0x001000, mode.r1000)?;
    w(0x001002, 0x8480)?;
    w(0x001004, 0x0002)?;
    w(0x001006, (bandwidth / 1000) as u16)?;
    w(0x001008, 0x0000)?;
    w(0x00100c, 0x0000)?;
    w(0x00100e, 0x0000)?;
    w(0x001010, 0x0000)?;
    w(0x001012, 0x0000)?;
    w(0x001014, 0x0000)?;
    w(0x001016, 0x1011)?; // Video PID
    w(0x001018, 0x1100)?; // Audio PID
    w(0x00101a, 0x0100)?; // Program Map Table PID
    w(0x00101c, 0x001f)?; // DVB SIT PID
    w(0x00101e, 0x1001)?; // Program clock PID
    w(0x001020, 0x00e0)?; // Video PES stream ID
    w(0x001022, 0x00c0)?; // Audio PES stream ID
    w(0x001146, 0x0101)?;
    w(0x001148, 0x0100)?;

    // Group 3 - H.264 encoder, video source tuning
    w(0x001404, mode.r1404)?;
    w(0x001406, ep.video_max_kbps.saturating_add(1000))?;
    w(0x001408, ep.video_kbps)?;
    w(0x00140a, 0x1700 | mode.r140a)?;
    w(0x00140c, if ep.h264_cabac { 0x0000 } else { 0x0100 })?;
    w(0x00140e, 0xd400 | u16::from(mode.fps.den == 1))?;
    w(0x001418, 0x0001)?;
    w(0x001420, 0x0000)?;
    w(0x001422, ep.video_max_kbps)?;
    w(0x001430, mode.r1430_l | if ep.h264_bframes { 0x0000 } else { 0x0100 })?;
    w(0x001470, mode.r147x[0])?;
    w(0x001472, mode.r147x[1])?;
    w(0x001474, mode.r147x[2])?;
    w(0x001476, mode.r147x[3])?;
    w(0x001478, 0x0000)?;
    w(0x00147a, 0x0000)?;
    w(0x00147c, 0x0000)?;
    w(0x00147e, 0x0000)?;
    w(0x001540, 0x0000)?;
    // Input-timing constants; some are ignored and re-seeded by the
    // vendor driver, all are carried verbatim.
    for (slot, &seed) in mode.r154x.iter().enumerate() {
        w(0x001542 + 2 * slot as u32, seed)?;
    }

    // Group 4 - audio encoder
    let rate_code = match ep.audio_khz {
        32000 => 2,
        44100 => 1,
        _ => 0, // 48000 and anything exotic
    };
    w(0x001802, rate_code)?;
    w(0x001804, ep.audio_kbps)?;
    w(0x001806, 0x02c0)?;
    w(0x001810, 0x0000)?;
    w(0x001812, mode.ain_offset)?;
    // AAC audio format
    w(0x001850, 0x0033)?;
    w(0x001852, 0x0200)?;

    // Group 5 - scaler / encoder geometry
    if mode.convert_to_1088 {
        w(0x001520, 0x80ff)?;
        w(0x001522, 0)?; // src x offset
        w(0x001524, 0)?; // src y offset
        w(0x001526, mode.width)?;
        w(0x001528, mode.height)?;
        w(0x00152e, mode.width)?;
        w(0x001530, 1088)?;
    } else {
        w(0x001520, 0)?;
        w(0x001522, 0)?;
        w(0x001524, 0)?;
        w(0x001526, 0)?;
        w(0x001528, 0)?;
        w(0x00152e, 0)?;
        w(0x001530, 0)?;
    }
    w(0x0015a0, ep.h264_profile.code() << 14 | u16::from(ep.h264_level))?;
    w(0x0015a2, (mode.width + 15) >> 4)?;
    w(0x0015a4, (mode.height + 15) >> 4)?;
    w(0x0015a6, (mode.fps.den * u32::from(ep.fps_divider)) as u16)?;
    w(0x0015a8, ((2 * mode.fps.num) >> 16) as u16)?;
    w(0x0015aa, (2 * mode.fps.num) as u16)?;
    w(0x0015ac, 0x0001)?;
    w(0x0015b2, 0x0000)?;

    // Group 6 - enable
    w(0x001144, 0x3333)
}

/// Drain and halt the encode pipeline.
///
/// The FIFO level poll and the 67 flush commands push the last buffered
/// transport packets out before the pipeline dies.
///
/// # Errors
///
/// The first transport failure; the sticky fault makes the remainder of
/// the sequence a no-op.
pub fn stop_sequence<P: UsbPort>(dev: &EncoderDevice<P>) -> Result<()> {
    dev.stop_encoding()?;
    dev.clear_fpga_command(0x02)?;
    let level = dev.fifo_level()?;
    tracing::debug!(level, "stream fifo at stop");
    for _ in 0..67 {
        dev.send_fpga_command(0x80)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_raises_peak_rate_above_target() {
        let ep = EncodingParameters {
            video_kbps: 4000,
            video_max_kbps: 3500,
            ..EncodingParameters::default()
        }
        .normalized();
        assert_eq!(ep.video_max_kbps, 4100);
    }

    #[test]
    fn normalized_keeps_valid_peak_rate() {
        let ep = EncodingParameters::default().normalized();
        assert_eq!(ep.video_max_kbps, 3500);
    }

    #[test]
    fn normalized_clamps_fps_divider() {
        for (raw, want) in [(0u8, 1u8), (1, 1), (2, 2), (9, 2)] {
            let ep = EncodingParameters {
                fps_divider: raw,
                ..EncodingParameters::default()
            }
            .normalized();
            assert_eq!(ep.fps_divider, want);
        }
    }

    #[test]
    fn input_source_wire_codes() {
        assert_eq!(InputSource::Unset.wire(), None);
        assert_eq!(InputSource::Sdi.wire(), Some(0));
        assert_eq!(InputSource::SVideo.wire(), Some(4));
    }

    #[test]
    fn profile_codes_fit_two_bits() {
        for p in [H264Profile::Baseline, H264Profile::Main, H264Profile::High] {
            assert!(p.code() <= 3);
        }
    }
}
