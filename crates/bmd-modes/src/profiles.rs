//! The register table.
//!
//! Only the timings below have known register seeds; the rest of the
//! [`DisplayMode`](crate::DisplayMode) space classifies but has no profile
//! and is reported to the operator as unsupported.
//!
//! The interlaced 1080 timings come in two flavours: the default profile
//! converts the signal to progressive in the FPGA and scales to 1088
//! lines, the `native` sub-profile passes the interlaced fields through
//! untouched.  The register words are shared between the two; the flags
//! select the FPGA program and the scaler path.

use crate::{DisplayMode, ModeProfile, Rational};

static NATIVE_1080I25: ModeProfile = ModeProfile {
    description: "1080i 50 (native)",
    width: 1920,
    height: 1080,
    fps: Rational { num: 25, den: 1 },
    interlaced: true,
    program_fpga: false,
    convert_to_1088: false,
    fx2_fps: 0x3,
    audio_delay: 0x00,
    ain_offset: 0x0000,
    r1000: 0x0200,
    r1404: 0x0041,
    r140a: 0x0001,
    r1430_l: 0x00ff,
    r147x: [0x0026, 0x007d, 0x0056, 0x0007],
    r154x: [
        0x0034, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x000e, 0x0780,
        0x0438, 0x0000, 0x0000,
    ],
    native: None,
};

static MODE_1080I25: ModeProfile = ModeProfile {
    description: "1080i 50",
    width: 1920,
    height: 1080,
    fps: Rational { num: 25, den: 1 },
    interlaced: false,
    program_fpga: true,
    convert_to_1088: true,
    fx2_fps: 0x3,
    audio_delay: 0x00,
    ain_offset: 0x0000,
    r1000: 0x0200,
    r1404: 0x0041,
    r140a: 0x0001,
    r1430_l: 0x00ff,
    r147x: [0x0026, 0x007d, 0x0056, 0x0007],
    r154x: [
        0x0034, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x000e, 0x0780,
        0x0438, 0x0000, 0x0000,
    ],
    native: Some(&NATIVE_1080I25),
};

static NATIVE_1080I2997: ModeProfile = ModeProfile {
    description: "1080i 29.97 (native)",
    width: 1920,
    height: 1080,
    fps: Rational { num: 30000, den: 1001 },
    interlaced: true,
    program_fpga: false,
    convert_to_1088: false,
    fx2_fps: 0x4,
    audio_delay: 0x00,
    ain_offset: 0x0000,
    r1000: 0x0200,
    r1404: 0x0071,
    r140a: 0x0000,
    r1430_l: 0x00ff,
    r147x: [0x0026, 0x007d, 0x0056, 0x0007],
    r154x: [
        0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x000e, 0x0000,
        0x0400, 0x0000, 0x0000,
    ],
    native: None,
};

static MODE_1080I2997: ModeProfile = ModeProfile {
    description: "1080i 29.97",
    width: 1920,
    height: 1080,
    fps: Rational { num: 30000, den: 1001 },
    interlaced: false,
    program_fpga: true,
    convert_to_1088: true,
    fx2_fps: 0x4,
    audio_delay: 0x00,
    ain_offset: 0x0000,
    r1000: 0x0200,
    r1404: 0x0071,
    r140a: 0x0000,
    r1430_l: 0x00ff,
    r147x: [0x0026, 0x007d, 0x0056, 0x0007],
    r154x: [
        0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x000e, 0x0000,
        0x0400, 0x0000, 0x0000,
    ],
    native: Some(&NATIVE_1080I2997),
};

static MODE_720P50: ModeProfile = ModeProfile {
    description: "720p 50",
    width: 1280,
    height: 720,
    fps: Rational { num: 50, den: 1 },
    interlaced: false,
    program_fpga: false,
    convert_to_1088: false,
    fx2_fps: 0x6,
    audio_delay: 0x00,
    ain_offset: 0x0384,
    r1000: 0x0500,
    r1404: 0x0071,
    r140a: 0x00ff,
    r1430_l: 0x00ff,
    r147x: [0x0010, 0x0070, 0x0070, 0x0010],
    r154x: [
        0x0001, 0x07ff, 0x07bb, 0x02ee, 0x0107, 0x001a, 0x07ff, 0x0500,
        0x02d0, 0x0032, 0x0000,
    ],
    native: None,
};

static MODE_720P5994: ModeProfile = ModeProfile {
    description: "720p 59.94",
    width: 1280,
    height: 720,
    fps: Rational { num: 60000, den: 1001 },
    interlaced: false,
    program_fpga: false,
    convert_to_1088: false,
    fx2_fps: 0x7,
    audio_delay: 0x00,
    ain_offset: 0x0384,
    r1000: 0x0500,
    r1404: 0x0071,
    r140a: 0x00ff,
    r1430_l: 0x00ff,
    r147x: [0x0010, 0x0070, 0x0070, 0x0010],
    r154x: [
        0x0001, 0x07ff, 0x07bb, 0x02ee, 0x0107, 0x001a, 0x07ff, 0x0500,
        0x02d0, 0x003c, 0x0000,
    ],
    native: None,
};

static MODE_720P60: ModeProfile = ModeProfile {
    description: "720p 60",
    width: 1280,
    height: 720,
    fps: Rational { num: 60, den: 1 },
    interlaced: false,
    program_fpga: false,
    convert_to_1088: false,
    fx2_fps: 0x8,
    audio_delay: 0x06,
    ain_offset: 0x0384,
    r1000: 0x0500,
    r1404: 0x0071,
    r140a: 0x00ff,
    r1430_l: 0x00ff,
    r147x: [0x0010, 0x0070, 0x0070, 0x0010],
    r154x: [
        0x0001, 0x07ff, 0x07bb, 0x02ee, 0x0107, 0x001a, 0x07ff, 0x0500,
        0x02d0, 0x003c, 0x0000,
    ],
    native: None,
};

/// Raw catalogue lookup, ignoring native-mode preference.
#[must_use]
pub fn lookup(mode: DisplayMode) -> Option<&'static ModeProfile> {
    match mode {
        DisplayMode::Hd1080i25 => Some(&MODE_1080I25),
        DisplayMode::Hd1080i2997 => Some(&MODE_1080I2997),
        DisplayMode::Hd720p50 => Some(&MODE_720P50),
        DisplayMode::Hd720p5994 => Some(&MODE_720P5994),
        DisplayMode::Hd720p60 => Some(&MODE_720P60),
        _ => None,
    }
}
