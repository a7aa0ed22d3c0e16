//! Downstream sink: process-wide stdout or a per-device child process.
//!
//! The sanitizer only sees an opaque vectored-write target; this module
//! decides where those bytes go.  A child receives the stream on its
//! stdin and learns the video geometry and device MAC through the
//! environment.  When the pipe to a child breaks, the target either
//! respawns it (dropping the segments of the failed pass) or reports the
//! error up so the worker can tear down.

use std::io::{self, IoSlice, Write};
use std::process::{Child, Command, Stdio};

use bmd_mpegts::{write_all_segments, StreamSink};
use tracing::{info, warn};

/// Stream geometry and identity handed to a child via environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachParams {
    /// Encoded stream width (`BMD_STREAM_WIDTH`).
    pub width: u16,
    /// Encoded stream height (`BMD_STREAM_HEIGHT`).
    pub height: u16,
    /// Device MAC address (`BMD_MAC`), when the SKU carries one.
    pub mac: Option<[u8; 6]>,
}

enum Target {
    Detached,
    Stdout,
    Child(Child),
}

/// Where one device's sanitized stream goes.
pub struct StreamTarget {
    exec: Option<String>,
    respawn: bool,
    target: Target,
    last: Option<AttachParams>,
}

impl StreamTarget {
    /// A detached target; nothing is emitted until [`attach`].
    ///
    /// [`attach`]: StreamTarget::attach
    pub fn new(exec: Option<String>, respawn: bool) -> Self {
        Self {
            exec,
            respawn,
            target: Target::Detached,
            last: None,
        }
    }

    /// True when no child program is configured and the stream would go
    /// to the process stdout.
    pub fn is_stdout(&self) -> bool {
        self.exec.is_none()
    }

    /// True between [`attach`] and [`detach`].
    ///
    /// [`attach`]: StreamTarget::attach
    /// [`detach`]: StreamTarget::detach
    pub fn attached(&self) -> bool {
        !matches!(self.target, Target::Detached)
    }

    /// Point the target at stdout, or spawn the configured program with
    /// the stream piped to its stdin.
    ///
    /// # Errors
    ///
    /// Spawn failure of the child program.
    pub fn attach(&mut self, params: AttachParams) -> io::Result<()> {
        self.detach();
        self.last = Some(params);
        match &self.exec {
            None => {
                self.target = Target::Stdout;
            }
            Some(program) => {
                let mut command = Command::new("/bin/sh");
                command
                    .arg("-c")
                    .arg(program)
                    .stdin(Stdio::piped())
                    .env("BMD_STREAM_WIDTH", params.width.to_string())
                    .env("BMD_STREAM_HEIGHT", params.height.to_string());
                if let Some(mac) = params.mac {
                    command.env("BMD_MAC", format_mac(&mac));
                }
                let child = command.spawn()?;
                info!(pid = child.id(), program = %program, "stream program started");
                self.target = Target::Child(child);
            }
        }
        Ok(())
    }

    /// Close the sink.  A child sees EOF on its stdin and is left to
    /// exit on its own; the supervisor reaps it.
    pub fn detach(&mut self) {
        if let Target::Child(mut child) = std::mem::replace(&mut self.target, Target::Detached)
        {
            drop(child.stdin.take());
        }
    }
}

impl StreamSink for StreamTarget {
    fn write_segments(&mut self, segments: &[IoSlice<'_>]) -> io::Result<()> {
        match &mut self.target {
            Target::Detached => Ok(()),
            Target::Stdout => write_all_segments(&mut io::stdout().lock(), segments),
            Target::Child(child) => {
                let result = match child.stdin.as_mut() {
                    Some(stdin) => write_all_segments(stdin, segments).and_then(|()| stdin.flush()),
                    None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
                };
                match result {
                    Ok(()) => Ok(()),
                    Err(e) if self.respawn => {
                        warn!("stream program pipe failed ({e}); respawning");
                        match self.last {
                            Some(params) => self.attach(params),
                            None => Err(e),
                        }
                    }
                    Err(e) => {
                        self.detach();
                        Err(e)
                    }
                }
            }
        }
    }
}

impl Drop for StreamTarget {
    fn drop(&mut self) {
        self.detach();
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for readable assertions
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn detached_target_discards_silently() {
        let mut target = StreamTarget::new(None, false);
        let data = [0u8; 4];
        target
            .write_segments(&[IoSlice::new(&data)])
            .unwrap();
        assert!(!target.attached());
    }

    #[test]
    fn stdout_target_attaches_without_exec() {
        let mut target = StreamTarget::new(None, false);
        assert!(target.is_stdout());
        target
            .attach(AttachParams {
                width: 1280,
                height: 720,
                mac: None,
            })
            .unwrap();
        assert!(target.attached());
        target.detach();
        assert!(!target.attached());
    }

    #[test]
    fn child_receives_geometry_and_mac_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env");
        let script = format!(
            "echo \"$BMD_STREAM_WIDTH/$BMD_STREAM_HEIGHT/$BMD_MAC\" > {}",
            out.display()
        );
        let mut target = StreamTarget::new(Some(script), false);
        target
            .attach(AttachParams {
                width: 1920,
                height: 1080,
                mac: Some([0x00, 0x90, 0xfa, 0x01, 0x02, 0x03]),
            })
            .unwrap();

        // The child runs asynchronously; poll for its output.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let contents = loop {
            if let Ok(s) = std::fs::read_to_string(&out) {
                if !s.is_empty() {
                    break s;
                }
            }
            assert!(std::time::Instant::now() < deadline, "child never wrote");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(contents.trim(), "1920/1080/00:90:fa:01:02:03");
        target.detach();
    }

    #[test]
    fn child_consumes_stream_bytes() {
        let mut target = StreamTarget::new(Some("cat > /dev/null".into()), false);
        target
            .attach(AttachParams {
                width: 1280,
                height: 720,
                mac: None,
            })
            .unwrap();
        let data = vec![0x47u8; 376];
        target.write_segments(&[IoSlice::new(&data)]).unwrap();
        target.detach();
    }

    #[test]
    fn broken_pipe_without_respawn_surfaces_and_detaches() {
        // `false` exits immediately, so the pipe dies under us.
        let mut target = StreamTarget::new(Some("exec false".into()), false);
        target
            .attach(AttachParams {
                width: 1280,
                height: 720,
                mac: None,
            })
            .unwrap();
        let data = vec![0u8; 64 * 1024];
        let mut result = Ok(());
        // The first writes may land in the pipe buffer; keep pushing
        // until the kernel reports the closed read end.
        for _ in 0..64 {
            result = target.write_segments(&[IoSlice::new(&data)]);
            if result.is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(result.is_err());
        assert!(!target.attached());
    }

    #[test]
    fn mac_formats_lowercase_colon_separated() {
        assert_eq!(
            format_mac(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x42]),
            "de:ad:be:ef:00:42"
        );
    }
}
