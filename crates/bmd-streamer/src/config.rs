//! Command line surface and runtime configuration.

use std::path::PathBuf;

use bmd_device::encoder::{EncodingParameters, H264Profile, InputSource};
use bmd_device::firmware::FirmwareImage;
use clap::{ArgAction, Parser, ValueEnum};

/// Stream H.264 video from Blackmagic USB encoders to stdout or a
/// per-device program.
#[derive(Debug, Parser)]
#[command(name = "bmd-streamer", version)]
pub struct Cli {
    /// Target video bitrate in kbps
    #[arg(long, default_value_t = 3000)]
    pub video_kbps: u16,

    /// Peak video bitrate in kbps (raised above the target if needed)
    #[arg(long, default_value_t = 3500)]
    pub video_max_kbps: u16,

    /// Audio bitrate in kbps
    #[arg(long, default_value_t = 256)]
    pub audio_kbps: u16,

    /// Audio sample rate in Hz (32000, 44100 or 48000)
    #[arg(long, default_value_t = 48000)]
    pub audio_rate: u32,

    /// H.264 profile
    #[arg(long, value_enum, default_value_t = ProfileArg::High)]
    pub h264_profile: ProfileArg,

    /// H.264 level, times ten (40 = level 4.0)
    #[arg(long, default_value_t = 40)]
    pub h264_level: u8,

    /// Disable CABAC entropy coding
    #[arg(long)]
    pub no_cabac: bool,

    /// Enable B-frames
    #[arg(long)]
    pub bframes: bool,

    /// Frame-rate divider (1 or 2)
    #[arg(long, default_value_t = 1)]
    pub fps_divider: u8,

    /// Capture input connector (H.264 Pro Recorder only)
    #[arg(long, value_enum)]
    pub input_source: Option<SourceArg>,

    /// Directory containing bmd-atemtvstudio.bin and
    /// bmd-h264prorecorder.bin
    #[arg(long, default_value = ".")]
    pub firmware_dir: PathBuf,

    /// Shell command to spawn per stream; MPEG-TS arrives on its stdin
    #[arg(long)]
    pub exec: Option<String>,

    /// Respawn the exec command when its pipe breaks
    #[arg(long)]
    pub respawn: bool,

    /// Pass interlaced inputs through instead of converting to
    /// progressive
    #[arg(long)]
    pub native: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// CLI spelling of [`H264Profile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProfileArg {
    /// Baseline profile.
    Baseline,
    /// Main profile.
    Main,
    /// High profile.
    High,
}

impl From<ProfileArg> for H264Profile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Baseline => H264Profile::Baseline,
            ProfileArg::Main => H264Profile::Main,
            ProfileArg::High => H264Profile::High,
        }
    }
}

/// CLI spelling of [`InputSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    /// SDI input.
    Sdi,
    /// HDMI input.
    Hdmi,
    /// Component analog input.
    Component,
    /// Composite analog input.
    Composite,
    /// S-Video input.
    Svideo,
}

impl From<SourceArg> for InputSource {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Sdi => InputSource::Sdi,
            SourceArg::Hdmi => InputSource::Hdmi,
            SourceArg::Component => InputSource::Component,
            SourceArg::Composite => InputSource::Composite,
            SourceArg::Svideo => InputSource::SVideo,
        }
    }
}

/// Everything the supervisor and its workers need.
pub struct Config {
    /// Normalized encoding parameters applied to every device.
    pub params: EncodingParameters,
    /// Where the firmware blob files live.
    pub firmware_dir: PathBuf,
    /// Per-stream program, if not streaming to stdout.
    pub exec: Option<String>,
    /// Respawn the program on a broken pipe.
    pub respawn: bool,
    /// Prefer native interlaced sub-modes.
    pub native_mode: bool,
    /// Loaded firmware images; filled in by the supervisor.
    pub firmwares: Vec<FirmwareImage>,
}

impl Cli {
    /// Fold the raw arguments into a validated [`Config`].
    #[must_use]
    pub fn into_config(self) -> Config {
        let params = EncodingParameters {
            video_kbps: self.video_kbps,
            video_max_kbps: self.video_max_kbps,
            audio_kbps: self.audio_kbps,
            audio_khz: self.audio_rate,
            h264_profile: self.h264_profile.into(),
            h264_level: self.h264_level,
            h264_cabac: !self.no_cabac,
            h264_bframes: self.bframes,
            fps_divider: self.fps_divider,
            input_source: self
                .input_source
                .map(Into::into)
                .unwrap_or(InputSource::Unset),
        }
        .normalized();
        Config {
            params,
            firmware_dir: self.firmware_dir,
            exec: self.exec,
            respawn: self.respawn,
            native_mode: self.native,
            firmwares: Vec::new(),
        }
    }
}
