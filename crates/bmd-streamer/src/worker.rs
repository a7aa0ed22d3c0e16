//! Per-device worker.
//!
//! Each attached encoder gets exactly two threads sharing one device
//! handle:
//!
//! - the **message thread** (this module's [`Session`]) owns every state
//!   transition and is the only issuer of control transfers once
//!   encoding starts;
//! - the **MPEG-TS thread** ([`pump_mpegts`]) only performs bulk reads
//!   on the stream endpoint and feeds the sanitizer.
//!
//! The session logic is generic over the USB port so the whole state
//! machine runs against the recording mock in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use bmd_device::encoder::{self, EncodingParameters};
use bmd_device::message::{frame_records, parse_record, DeviceMessage, FxStatus};
use bmd_device::protocol::PID_H264_PRO_RECORDER;
use bmd_device::{EncoderDevice, RusbPort, UsbPort};
use bmd_modes::{classify, DisplayMode, ModeProfile};
use bmd_mpegts::TsFilter;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::sink::{AttachParams, StreamTarget};
use crate::supervisor::SupervisorState;

/// Resources shared between the two device threads.
pub struct Shared<P> {
    /// The device, sticky-failure included.
    pub dev: EncoderDevice<P>,
    /// Per-device run flag; cleared to start teardown.
    pub running: AtomicBool,
    /// Where sanitized stream bytes go.
    pub sink: Mutex<StreamTarget>,
    /// Log prefix: `[bus/addr vid:pid]`.
    pub name: String,
}

/// Mutable per-device state, owned by the message thread.
#[derive(Default)]
struct DeviceState {
    fxstatus: Option<FxStatus>,
    recognized: bool,
    encode_sent: bool,
    mode_changed: bool,
    mode: Option<(DisplayMode, &'static ModeProfile)>,
    mac: Option<[u8; 6]>,
}

/// The message-thread state machine.
pub struct Session<P> {
    shared: Arc<Shared<P>>,
    supervisor: Arc<SupervisorState>,
    params: EncodingParameters,
    native_mode: bool,
    product_id: u16,
    state: DeviceState,
    message_buf: Box<[u8; 1024]>,
}

impl<P: UsbPort> Session<P> {
    /// Build a session for an opened device.
    pub fn new(
        shared: Arc<Shared<P>>,
        supervisor: Arc<SupervisorState>,
        params: EncodingParameters,
        native_mode: bool,
        product_id: u16,
    ) -> Self {
        Self {
            shared,
            supervisor,
            params,
            native_mode,
            product_id,
            state: DeviceState::default(),
            message_buf: Box::new([0u8; 1024]),
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current FX2 status, as last reported.
    pub fn fxstatus(&self) -> Option<FxStatus> {
        self.state.fxstatus
    }

    fn should_run(&self) -> bool {
        self.supervisor.running() && self.shared.running.load(Ordering::SeqCst)
    }

    /// Kick the device and process messages until shutdown or error.
    pub fn run(&mut self) {
        if let Err(e) = self.shared.dev.request_device_status() {
            error!("{}: failed to request device status: {e}", self.name());
            return;
        }
        while self.should_run() {
            if !self.pump_once() {
                break;
            }
        }
    }

    /// Read one message frame and apply its records.
    ///
    /// Returns `false` when the message channel is gone.
    pub fn pump_once(&mut self) -> bool {
        let n = match self.shared.dev.read_messages(&mut self.message_buf[..]) {
            Ok(n) => n,
            Err(e) => {
                info!("{}: message reader exiting: {e}", self.name());
                return false;
            }
        };
        // Copied out so record handling may borrow the session mutably.
        let frame = self
            .message_buf
            .get(..n)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        trace!("{}: EP8 {n} bytes: {}", self.shared.name, hex(&frame));

        for payload in frame_records(&frame) {
            match parse_record(payload) {
                Some(message) => self.handle(message),
                None => warn!("{}: malformed message record", self.shared.name),
            }
        }
        true
    }

    fn handle(&mut self, message: DeviceMessage<'_>) {
        match message {
            DeviceMessage::Status { status, raw } => self.on_status(status, raw),
            DeviceMessage::InputConnector { input } => self.on_input_connector(input),
            DeviceMessage::EncoderError => {
                error!("{}: H56 error; expecting device restart", self.name());
            }
            DeviceMessage::Timestamp => {}
            DeviceMessage::Other { kind, body } => {
                debug!("{}: message {kind:#04x}: {}", self.name(), hex(body));
            }
        }
    }

    fn on_status(&mut self, status: FxStatus, raw: u8) {
        info!("{}: FX2 status: {status} ({raw})", self.name());
        self.state.fxstatus = Some(status);
        match status {
            FxStatus::Idle => {
                self.state.encode_sent = false;
                if !self.state.recognized {
                    self.recognize();
                }
                match self.state.mode {
                    Some((_, profile)) => {
                        info!("{}: display mode: {}", self.name(), profile.description);
                        if self.should_run() {
                            self.start_encoder();
                        }
                    }
                    None => {
                        if self.product_id == PID_H264_PRO_RECORDER {
                            if let Some(wire) = self.params.input_source.wire() {
                                debug!("{}: selecting input source", self.name());
                                if let Err(e) = self.shared.dev.set_input_source(wire) {
                                    error!("{}: failed to set input source: {e}", self.name());
                                }
                            }
                        }
                    }
                }
            }
            FxStatus::Encoding => {
                if self.state.mode_changed || !self.state.encode_sent {
                    self.stop_encoder();
                }
            }
            _ => {}
        }
    }

    fn on_input_connector(&mut self, input: u8) {
        let tag = classify(input);
        if tag == self.state.mode.map(|(t, _)| t) && tag.is_some() {
            return;
        }
        self.state.mode = tag.and_then(|t| {
            t.profile(self.native_mode).map(|profile| (t, profile))
        });
        self.state.mode_changed = true;
        match self.state.mode {
            Some((_, profile)) => {
                info!("{}: display mode: {}", self.name(), profile.description)
            }
            None => warn!(
                "{}: input mode {input:#04x} not supported",
                self.name()
            ),
        }
        if self.should_run()
            && self.state.fxstatus == Some(FxStatus::Idle)
            && self.state.mode.is_some()
            && !self.state.encode_sent
        {
            self.start_encoder();
        }
    }

    /// Read the device identity once the firmware is up.  Only the ATEM
    /// TV Studio carries a MAC address (in FX2 registers 0x88..=0x8d).
    fn recognize(&mut self) {
        if self.product_id != PID_H264_PRO_RECORDER {
            let mut mac = [0u8; 6];
            for (reg, byte) in (0x88u8..=0x8d).zip(mac.iter_mut()) {
                match self.shared.dev.read_fx2_register(reg) {
                    Ok(b) => *byte = b,
                    Err(e) => {
                        error!("{}: failed to read MAC: {e}", self.name());
                        return;
                    }
                }
            }
            info!(
                "{}: MAC address {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                self.name(),
                mac[0],
                mac[1],
                mac[2],
                mac[3],
                mac[4],
                mac[5]
            );
            self.state.mac = Some(mac);
        }
        self.state.recognized = true;
    }

    /// Configure, attach the sink and start the pipeline.
    fn start_encoder(&mut self) {
        let Some((_, profile)) = self.state.mode else {
            return;
        };
        self.state.encode_sent = true;
        self.state.mode_changed = false;

        info!("{}: configuring and starting encoder", self.name());
        if let Err(e) = encoder::configure(&self.shared.dev, profile, &self.params) {
            error!("{}: failed to configure encoder: {e}", self.name());
            return;
        }

        let attach = lock(&self.shared.sink).attach(AttachParams {
            width: profile.width,
            height: profile.height,
            mac: self.state.mac,
        });
        if let Err(e) = attach {
            error!("{}: failed to attach stream sink: {e}", self.name());
            return;
        }

        if let Err(e) = self.shared.dev.start_encoding() {
            error!("{}: failed to start encoding: {e}", self.name());
        }
    }

    /// Close the sink and drain the pipeline.
    fn stop_encoder(&mut self) {
        info!("{}: stopping encoder", self.name());
        lock(&self.shared.sink).detach();
        self.state.mode_changed = false;
        if let Err(e) = encoder::stop_sequence(&self.shared.dev) {
            error!("{}: failed to stop encoding: {e}", self.name());
        }
    }

    /// Teardown tail: if the device is still encoding, stop it and pump
    /// messages until it reports Idle.
    pub fn finish(&mut self) {
        if self.state.fxstatus != Some(FxStatus::Encoding) || !self.shared.dev.healthy() {
            return;
        }
        self.stop_encoder();
        while self.state.fxstatus != Some(FxStatus::Idle) && self.shared.dev.healthy() {
            if !self.pump_once() {
                break;
            }
        }
    }
}

/// MPEG-TS thread body: bulk-read, sanitize, forward.
///
/// Timeouts are idle periods; any other transfer error ends the thread.
/// A sink failure tears the worker down, and the whole process when the
/// stream was going to stdout, since nobody else will miss it.
pub fn pump_mpegts<P: UsbPort>(shared: &Shared<P>, supervisor: &SupervisorState) {
    let mut filter = TsFilter::new();
    while supervisor.running() && shared.running.load(Ordering::SeqCst) {
        let n = match shared.dev.read_mpegts(filter.read_buf()) {
            Ok(n) => n,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                info!("{}: mpeg-ts pump exiting: {e}", shared.name);
                break;
            }
        };
        let mut sink = lock(&shared.sink);
        if let Err(e) = filter.drain(n, &mut *sink) {
            error!("{}: stream sink failed: {e}", shared.name);
            let to_stdout = sink.is_stdout();
            sink.detach();
            drop(sink);
            shared.running.store(false, Ordering::SeqCst);
            if to_stdout {
                supervisor.stop();
            }
            break;
        }
    }
}

/// Thread entry for one hotplugged device; owns the device for its
/// whole life.
pub fn run_device(
    supervisor: Arc<SupervisorState>,
    config: Arc<Config>,
    usbdev: rusb::Device<rusb::Context>,
) {
    let descriptor = match usbdev.device_descriptor() {
        Ok(d) => d,
        Err(e) => {
            error!("failed to read device descriptor: {e}");
            return;
        }
    };
    let name = format!(
        "[{}/{} {:04x}:{:04x}]",
        usbdev.bus_number(),
        usbdev.address(),
        descriptor.vendor_id(),
        descriptor.product_id()
    );
    info!("{name}: device connected");

    // Right after hotplug the device node may not exist yet; opening too
    // early makes libusb mark the device disconnected.
    thread::sleep(Duration::from_millis(200));

    let port = match RusbPort::open(&usbdev) {
        Ok(p) => p,
        Err(e) => {
            error!("{name}: unable to open device: {e}");
            return;
        }
    };
    let dev = EncoderDevice::new(port);

    if descriptor.manufacturer_string_index().is_none() {
        // Blank FX2: feed it firmware and let it re-enumerate as a new
        // hotplug arrival.
        info!("{name}: firmware download needed");
        let image = config
            .firmwares
            .iter()
            .find(|fw| fw.device_id == descriptor.product_id());
        match image {
            Some(fw) => match dev.upload_firmware(fw) {
                Ok(()) => info!("{name}: firmware downloaded successfully"),
                Err(e) => error!("{name}: firmware download failed: {e}"),
            },
            None => warn!("{name}: no firmware image for this product"),
        }
        return;
    }

    let shared = Arc::new(Shared {
        dev,
        running: AtomicBool::new(true),
        sink: Mutex::new(StreamTarget::new(
            config.exec.clone(),
            config.respawn,
        )),
        name: name.clone(),
    });

    let pump = {
        let shared = Arc::clone(&shared);
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || pump_mpegts(&shared, &supervisor))
    };

    let mut session = Session::new(
        Arc::clone(&shared),
        Arc::clone(&supervisor),
        config.params,
        config.native_mode,
        descriptor.product_id(),
    );
    session.run();

    // Teardown order matters: stop the reader first, then quiesce the
    // encoder, then let the handle drop release the interface.
    shared.running.store(false, Ordering::SeqCst);
    if pump.join().is_err() {
        error!("{name}: mpeg-ts thread panicked");
    }
    session.finish();
    info!("{name}: closing device");
}

fn lock<'a>(sink: &'a Mutex<StreamTarget>) -> std::sync::MutexGuard<'a, StreamTarget> {
    sink.lock().unwrap_or_else(PoisonError::into_inner)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        out.push_str(&format!(" {b:02x}"));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for readable assertions
mod tests {
    use super::*;
    use bmd_device::protocol::{
        EP_MESSAGES, PID_ATEM_TV_STUDIO, VR_FUJITSU_START_ENCODING,
        VR_FUJITSU_STOP_ENCODING, VR_READ_REGISTER,
    };
    use bmd_device::testing::{MockPort, Transfer};

    fn status_frame(status: u8) -> Vec<u8> {
        vec![0x08, 0x00, 0x06, 0x01, 0, 0, 0, 0, status, 0x00]
    }

    fn input_frame(input: u8) -> Vec<u8> {
        vec![0x04, 0x00, 0x02, 0x05, input, 0x00]
    }

    fn session_over(port: MockPort) -> (Session<MockPort>, Arc<Shared<MockPort>>) {
        let shared = Arc::new(Shared {
            dev: EncoderDevice::new(port),
            running: AtomicBool::new(true),
            sink: Mutex::new(StreamTarget::new(None, false)),
            name: "[test]".into(),
        });
        let supervisor = Arc::new(SupervisorState::new());
        let session = Session::new(
            Arc::clone(&shared),
            supervisor,
            EncodingParameters::default().normalized(),
            false,
            PID_ATEM_TV_STUDIO,
        );
        (session, shared)
    }

    fn count_requests(shared: &Shared<MockPort>, request: u8) -> usize {
        shared
            .dev
            .port()
            .transfers()
            .iter()
            .filter(|t| match t {
                Transfer::ControlIn { request: r, .. }
                | Transfer::ControlOut { request: r, .. } => *r == request,
                Transfer::BulkIn { .. } => false,
            })
            .count()
    }

    #[test]
    fn idle_with_valid_mode_starts_exactly_once() {
        let port = MockPort::new();
        port.queue_bulk(EP_MESSAGES, input_frame(0x8a)); // 720p 50
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        let (mut session, shared) = session_over(port);

        assert!(session.pump_once());
        // No start yet: no Idle observed.
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 0);

        assert!(session.pump_once());
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 1);
        assert_eq!(session.fxstatus(), Some(FxStatus::Idle));

        // A repeated Idle without a mode change does not restart: the
        // first Idle cleared encode_sent, the start set it again.
        shared
            .dev
            .port()
            .queue_bulk(EP_MESSAGES, status_frame(FxStatus::Encoding as u8));
        assert!(session.pump_once());
        assert_eq!(count_requests(&shared, VR_FUJITSU_STOP_ENCODING), 0);
    }

    #[test]
    fn input_change_after_idle_triggers_start() {
        let port = MockPort::new();
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        port.queue_bulk(EP_MESSAGES, input_frame(0x8a));
        let (mut session, shared) = session_over(port);

        assert!(session.pump_once()); // Idle, no mode yet
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 0);
        assert!(session.pump_once()); // input arrives while idle
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 1);
    }

    #[test]
    fn recognition_reads_mac_registers_once() {
        let port = MockPort::new();
        for b in [0x00u8, 0x90, 0xfa, 0xaa, 0xbb, 0xcc] {
            port.queue_control_in(VR_READ_REGISTER, vec![b]);
        }
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        let (mut session, shared) = session_over(port);
        assert!(session.pump_once());
        assert!(session.pump_once());
        assert_eq!(count_requests(&shared, VR_READ_REGISTER), 6);
    }

    #[test]
    fn mode_change_while_encoding_stops_the_pipeline() {
        let port = MockPort::new();
        port.queue_bulk(EP_MESSAGES, input_frame(0x8a));
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8)); // start
        port.queue_bulk(EP_MESSAGES, input_frame(0x82)); // new input
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Encoding as u8)); // stop
        let (mut session, shared) = session_over(port);
        for _ in 0..4 {
            assert!(session.pump_once());
        }
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 1);
        assert_eq!(count_requests(&shared, VR_FUJITSU_STOP_ENCODING), 1);
    }

    #[test]
    fn unsupported_input_never_starts() {
        let port = MockPort::new();
        port.queue_bulk(EP_MESSAGES, input_frame(0x90)); // 1080p60: no profile
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        let (mut session, shared) = session_over(port);
        assert!(session.pump_once());
        assert!(session.pump_once());
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 0);
    }

    /// Shutdown while encoding: exactly one stop, then messages pumped
    /// until the device reports Idle again.
    #[test]
    fn shutdown_while_encoding_stops_once_and_drains_to_idle() {
        let port = MockPort::new();
        port.queue_bulk(EP_MESSAGES, input_frame(0x8a));
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Encoding as u8));
        let (mut session, shared) = session_over(port);
        for _ in 0..3 {
            assert!(session.pump_once());
        }
        assert_eq!(session.fxstatus(), Some(FxStatus::Encoding));
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 1);

        // Termination: the drain sees Stopped, then Idle.
        shared.running.store(false, Ordering::SeqCst);
        shared
            .dev
            .port()
            .queue_bulk(EP_MESSAGES, status_frame(FxStatus::Stopped as u8));
        shared
            .dev
            .port()
            .queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        session.finish();

        assert_eq!(session.fxstatus(), Some(FxStatus::Idle));
        assert_eq!(count_requests(&shared, VR_FUJITSU_STOP_ENCODING), 1);
        assert_eq!(count_requests(&shared, VR_FUJITSU_START_ENCODING), 1);
    }

    #[test]
    fn finish_is_a_noop_when_not_encoding() {
        let port = MockPort::new();
        port.queue_bulk(EP_MESSAGES, status_frame(FxStatus::Idle as u8));
        let (mut session, shared) = session_over(port);
        assert!(session.pump_once());
        let before = shared.dev.port().transfers().len();
        session.finish();
        assert_eq!(shared.dev.port().transfers().len(), before);
    }
}
