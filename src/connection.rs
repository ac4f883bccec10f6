//! Connection lifecycle, the request/response engine and the reader task.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{CdcError, InitError, ReceiveError, SendError};
use crate::port::{self, SerialLink};
use crate::proto::command::{
    encode_request, DataSendResult, DeviceInfo, MessageKind, ModuleInfo, ProgMemResult,
    ProgModeToggleResult, SpiStatus, FRAME_END, TARGET_UPLOAD_FLAG,
};
use crate::proto::parser::{self, ParseStatus};

/// Wait for the reader thread to come up during construction.
const READER_START_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait for the matching reply to a request.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Read granularity of the reader task.
const READ_CHUNK: usize = 1024;

type AsyncListener = Box<dyn FnMut(&[u8]) + Send>;

/// One recognized frame, kept whole so the extractors can slice it.
struct ParsedFrame {
    kind: MessageKind,
    bytes: Vec<u8>,
}

/// State shared between the caller side and the reader task.
struct Shared {
    /// Last synchronous response; single producer (reader), single
    /// consumer (caller).
    response: Mutex<Option<ParsedFrame>>,
    response_ready: Condvar,
    listener: Mutex<Option<AsyncListener>>,
    /// Caller requested shutdown (destruction).
    shutdown: AtomicBool,
    /// Reader hit a fatal error and exited; the connection is terminal.
    stopped: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            response: Mutex::new(None),
            response_ready: Condvar::new(),
            listener: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    fn record_error(&self, message: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(message.into());
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}

/// An open session with one gateway.
///
/// A `Connection` owns the port and a background reader thread. All
/// operations take `&mut self`: the protocol allows a single outstanding
/// request, and the exclusive borrow enforces that at the type level.
/// Unsolicited `<DR` frames are routed to the registered async listener
/// and never surface as an operation's reply.
///
/// When the reader hits a fatal transport error the connection becomes
/// terminal: [`is_reception_stopped`](Connection::is_reception_stopped)
/// turns true, the reason is kept in
/// [`last_reception_error`](Connection::last_reception_error), and every
/// further operation fails fast. Recovery means dropping the connection
/// and opening a new one.
pub struct Connection {
    tx: Box<dyn SerialLink>,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Opens `port_name` (for example `/dev/ttyACM0` or `COM4`) and starts
    /// the reader. Fails without leaving anything behind.
    pub fn open(port_name: &str) -> Result<Connection, InitError> {
        let link = port::open(port_name)?;
        Connection::with_link(link)
    }

    /// Builds a connection on an already opened link. This is how tests
    /// drive the engine against a scripted device, and how alternative
    /// transports plug in.
    pub fn with_link(link: Box<dyn SerialLink>) -> Result<Connection, InitError> {
        let rx_link = link.try_clone().map_err(InitError::CloneHandle)?;
        let shared = Arc::new(Shared::new());
        let (started_tx, started_rx) = mpsc::channel();

        let reader = thread::Builder::new()
            .name("cdclink-reader".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || reader_loop(rx_link, &shared, &started_tx)
            })
            .map_err(InitError::Spawn)?;

        if started_rx.recv_timeout(READER_START_TIMEOUT).is_err() {
            // tear the thread down too: construction must not leave a
            // detached reader holding the port
            shared.shutdown.store(true, Ordering::Relaxed);
            let _ = reader.join();
            return Err(InitError::ReaderStart(READER_START_TIMEOUT));
        }

        Ok(Connection {
            tx: link,
            shared,
            reader: Some(reader),
        })
    }

    /// Probes the gateway. A reachable, responsive gateway answers `OK`.
    pub fn test(&mut self) -> Result<bool, CdcError> {
        self.transact(MessageKind::Test, b"")?;
        Ok(true)
    }

    /// Resets the gateway itself.
    pub fn reset_usb(&mut self) -> Result<(), CdcError> {
        self.transact(MessageKind::ResetUsb, b"")?;
        Ok(())
    }

    /// Resets the TR module behind the gateway.
    pub fn reset_tr(&mut self) -> Result<(), CdcError> {
        self.transact(MessageKind::ResetTr, b"")?;
        Ok(())
    }

    /// Reads the gateway identification (type, firmware, serial number).
    pub fn usb_info(&mut self) -> Result<DeviceInfo, CdcError> {
        let frame = self.transact(MessageKind::UsbInfo, b"")?;
        Ok(parser::device_info(&frame.bytes))
    }

    /// Reads the TR module identification.
    pub fn tr_info(&mut self) -> Result<ModuleInfo, CdcError> {
        let frame = self.transact(MessageKind::TrInfo, b"")?;
        parser::module_info(&frame.bytes).ok_or(ReceiveError::BadPayload.into())
    }

    /// Makes the gateway blink its LED to identify itself.
    pub fn indicate_connectivity(&mut self) -> Result<(), CdcError> {
        self.transact(MessageKind::UsbIndicate, b"")?;
        Ok(())
    }

    /// Reads the SPI status of the TR module.
    pub fn spi_status(&mut self) -> Result<SpiStatus, CdcError> {
        let frame = self.transact(MessageKind::SpiStatus, b"")?;
        Ok(parser::spi_status(&frame.bytes))
    }

    /// Hands up to 255 bytes of application data to the TR module.
    pub fn send_data(&mut self, data: &[u8]) -> Result<DataSendResult, CdcError> {
        let frame = self.transact(MessageKind::DataSend, data)?;
        Ok(parser::data_send_result(&frame.bytes).map_err(|_| ReceiveError::BadPayload)?)
    }

    /// Switches the gateway into custom (pass-through) mode.
    pub fn switch_to_custom(&mut self) -> Result<(), CdcError> {
        self.transact(MessageKind::SwitchCustom, b"")?;
        Ok(())
    }

    /// Puts the TR module into programming mode.
    pub fn enter_prog_mode(&mut self) -> Result<ProgModeToggleResult, CdcError> {
        let frame = self.transact(MessageKind::EnterProgMode, b"")?;
        Ok(parser::prog_enter_result(&frame.bytes).map_err(|_| ReceiveError::BadPayload)?)
    }

    /// Returns the TR module from programming mode to normal operation.
    pub fn exit_prog_mode(&mut self) -> Result<ProgModeToggleResult, CdcError> {
        let frame = self.transact(MessageKind::ExitProgMode, b"")?;
        Ok(parser::prog_exit_result(&frame.bytes).map_err(|_| ReceiveError::BadPayload)?)
    }

    /// Writes `data` to the TR memory region selected by `target`.
    /// `target` must carry the upload direction bit
    /// ([`TARGET_UPLOAD_FLAG`]); the region codes are listed in
    /// [`crate::proto::command`].
    pub fn upload(&mut self, target: u8, data: &[u8]) -> Result<ProgMemResult, CdcError> {
        self.check_not_stopped()?;
        if target & TARGET_UPLOAD_FLAG == 0 {
            return Err(SendError::NotAnUploadTarget { target }.into());
        }
        let frame = self.transact(MessageKind::ProgMemResp, &pm_body(target, data))?;
        Ok(parser::prog_mem_result(&frame.bytes).map_err(|_| ReceiveError::BadPayload)?)
    }

    /// Reads from the TR memory region selected by `target` (direction bit
    /// clear). `request` is the region-specific argument block, typically
    /// an address. On success the payload lands in `out` and the number of
    /// bytes written is returned alongside [`ProgMemResult::Ok`]; when the
    /// device answers with a status token instead, that token is returned
    /// with a zero length.
    ///
    /// A payload of exactly 2 or 4 bytes cannot be produced by this
    /// firmware: those response sizes are indistinguishable from the
    /// `OK`/`ERRn`/`BUSY` tokens on the wire and would be rejected as
    /// malformed.
    pub fn download(
        &mut self,
        target: u8,
        request: &[u8],
        out: &mut [u8],
    ) -> Result<(ProgMemResult, usize), CdcError> {
        self.check_not_stopped()?;
        if target & TARGET_UPLOAD_FLAG != 0 {
            return Err(SendError::NotADownloadTarget { target }.into());
        }
        let frame = self.transact(MessageKind::ProgMemResp, &pm_body(target, request))?;

        if frame.kind == MessageKind::ProgMemDownloadData {
            let payload = parser::pm_download_payload(&frame.bytes);
            if payload.len() > out.len() {
                return Err(ReceiveError::BufferTooSmall {
                    len: payload.len(),
                    capacity: out.len(),
                }
                .into());
            }
            out[..payload.len()].copy_from_slice(payload);
            Ok((ProgMemResult::Ok, payload.len()))
        } else {
            let result =
                parser::prog_mem_result(&frame.bytes).map_err(|_| ReceiveError::BadPayload)?;
            Ok((result, 0))
        }
    }

    /// Registers `listener` for unsolicited `<DR` frames, replacing any
    /// previous one. The payload slice is only valid for the duration of
    /// the call.
    ///
    /// The listener runs on the reader thread with the listener slot
    /// locked: it must not call back into this connection, and a slow
    /// listener stalls reception.
    pub fn register_async_listener(&self, listener: impl FnMut(&[u8]) + Send + 'static) {
        *self.shared.listener.lock().unwrap() = Some(Box::new(listener));
    }

    /// Removes the async listener; further `<DR` frames are dropped.
    pub fn unregister_async_listener(&self) {
        self.shared.listener.lock().unwrap().take();
    }

    /// Whether the reader hit a fatal error and the connection is terminal.
    pub fn is_reception_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Relaxed)
    }

    /// Description of the most recent reception problem, fatal or not.
    pub fn last_reception_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    /// A terminal connection rejects every request up front.
    fn check_not_stopped(&self) -> Result<(), SendError> {
        if self.shared.stopped.load(Ordering::Relaxed) {
            return Err(SendError::ReceptionStopped {
                reason: self.shared.last_error(),
            });
        }
        Ok(())
    }

    /// Sends one request and hands back the matching reply frame.
    fn transact(&mut self, kind: MessageKind, body: &[u8]) -> Result<ParsedFrame, CdcError> {
        self.check_not_stopped()?;

        let request = encode_request(kind, body)?;

        // arm the slot before the request hits the wire
        self.shared.response.lock().unwrap().take();

        debug!("-> {:?}, {} bytes", kind, request.len());
        self.tx.write_all(&request).map_err(SendError::Io)?;

        let slot = self.shared.response.lock().unwrap();
        let (mut slot, _) = self
            .shared
            .response_ready
            .wait_timeout_while(slot, RESPONSE_TIMEOUT, |frame| frame.is_none())
            .unwrap();
        let Some(frame) = slot.take() else {
            return Err(ReceiveError::Timeout(RESPONSE_TIMEOUT).into());
        };
        drop(slot);
        debug!("<- {:?}, {} bytes", frame.kind, frame.bytes.len());

        if frame.kind != kind {
            // a download request legitimately comes back as download data
            let download_reply = kind == MessageKind::ProgMemResp
                && frame.kind == MessageKind::ProgMemDownloadData
                && body.first().is_some_and(|t| t & TARGET_UPLOAD_FLAG == 0);
            if !download_reply {
                return Err(ReceiveError::UnexpectedKind {
                    expected: kind,
                    got: frame.kind,
                }
                .into());
            }
        }
        Ok(frame)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn pm_body(target: u8, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + data.len());
    body.push(target);
    body.extend_from_slice(data);
    body
}

// ============================================================================
// Reader task
// ============================================================================

fn reader_loop(mut link: Box<dyn SerialLink>, shared: &Shared, started: &mpsc::Sender<()>) {
    let _ = started.send(());
    debug!("reader running");

    let mut chunk = [0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    while !shared.shutdown.load(Ordering::Relaxed) {
        match link.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                trace!("read {n} bytes");
                pending.extend_from_slice(&chunk[..n]);
                drain_frames(&mut pending, shared);
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("reader stopping: {e}");
                shared.record_error(format!("reading from the port failed: {e}"));
                shared.stopped.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
    debug!("reader shut down");
}

/// Pulls every complete frame out of `pending` and routes it.
fn drain_frames(pending: &mut Vec<u8>, shared: &Shared) {
    while !pending.is_empty() {
        let outcome = parser::parse(pending);
        match outcome.status {
            ParseStatus::NotComplete => return,
            ParseStatus::BadFormat => {
                // resynchronize on the next frame boundary
                warn!("malformed frame, resynchronizing");
                shared.record_error("Bad message format");
                let rest = pending
                    .iter()
                    .skip(outcome.last_position)
                    .position(|&b| b == FRAME_END);
                match rest {
                    Some(offset) => {
                        pending.drain(..=outcome.last_position + offset);
                    }
                    None => pending.clear(),
                }
            }
            ParseStatus::Ok => {
                let frame: Vec<u8> = pending.drain(..=outcome.last_position).collect();
                if outcome.kind == MessageKind::AsyncData {
                    dispatch_async(&frame, shared);
                } else {
                    let mut slot = shared.response.lock().unwrap();
                    *slot = Some(ParsedFrame {
                        kind: outcome.kind,
                        bytes: frame,
                    });
                    shared.response_ready.notify_one();
                }
            }
        }
    }
}

fn dispatch_async(frame: &[u8], shared: &Shared) {
    let mut guard = shared.listener.lock().unwrap();
    if let Some(listener) = guard.as_mut() {
        let payload = parser::dr_payload(frame);
        // a panicking listener must not take the reader down with it
        if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
            warn!("async listener panicked");
            shared.record_error("async listener panicked");
        }
    }
}

/* ---------- tests ---------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockLink;
    use crate::proto::command::{SpiMode, TARGET_FLASH, TARGET_INTERNAL_EEPROM};
    use std::time::Instant;

    fn fake_device() -> (MockLink, Connection) {
        let link = MockLink::new();
        let conn = Connection::with_link(Box::new(link.clone())).unwrap();
        (link, conn)
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn probe_round_trip() {
        let (link, mut conn) = fake_device();
        link.expect(b">\r", b"<OK\r");
        assert!(conn.test().unwrap());
        assert_eq!(link.written(), b">\r");
    }

    #[test]
    fn spi_status_mode_and_data_ready() {
        let (link, mut conn) = fake_device();
        link.expect(b">S\r", b"<S:\x80\r");
        assert_eq!(
            conn.spi_status().unwrap(),
            SpiStatus::Mode(SpiMode::ReadyComm)
        );

        link.expect(b">S\r", b"<S:\x05\r");
        assert_eq!(conn.spi_status().unwrap(), SpiStatus::DataReady(5));
    }

    #[test]
    fn send_data_ack() {
        let (link, mut conn) = fake_device();
        link.expect(
            &[0x3E, 0x44, 0x53, 0x02, 0x3A, 0xAA, 0xBB, 0x0D],
            b"<DS:OK\r",
        );
        assert_eq!(
            conn.send_data(&[0xAA, 0xBB]).unwrap(),
            DataSendResult::Ok
        );

        link.expect(&[0x3E, 0x44, 0x53, 0x01, 0x3A, 0x00, 0x0D], b"<DS:BUSY\r");
        assert_eq!(conn.send_data(&[0x00]).unwrap(), DataSendResult::Busy);
    }

    #[test]
    fn usb_info_fields() {
        let (link, mut conn) = fake_device();
        link.expect(b">I\r", b"<I:GW#1.0#A\r");
        let info = conn.usb_info().unwrap();
        assert_eq!(info.device_type, b"GW");
        assert_eq!(info.firmware_version, b"1.0");
        assert_eq!(info.serial_number, b"A");
    }

    #[test]
    fn tr_info_standard_variant() {
        let (link, mut conn) = fake_device();
        let mut reply = b"<IT:".to_vec();
        reply.extend_from_slice(&[
            0xA1, 0xA2, 0xA3, 0xA4, // serial number
            0x42, // OS version
            0x24, // TR type
            0x08, 0xB7, // OS build
            0x00, 0x00, // reserved
            0, 0, 0, 0, 0, 0, // padding
        ]);
        reply.push(0x0D);
        link.expect(b">IT\r", &reply);

        let info = conn.tr_info().unwrap();
        assert_eq!(info.serial_number, [0xA1, 0xA2, 0xA3, 0xA4]);
        assert_eq!(info.os_version, 0x42);
        assert_eq!(info.ibk, [0u8; 16]);
    }

    #[test]
    fn mode_switches() {
        let (link, mut conn) = fake_device();
        link.expect(b">U\r", b"<U:OK\r");
        conn.switch_to_custom().unwrap();

        link.expect(b">PE\r", b"<PE:OK\r");
        assert_eq!(conn.enter_prog_mode().unwrap(), ProgModeToggleResult::Ok);

        link.expect(b">PT\r", b"<PT:ERR1\r");
        assert_eq!(conn.exit_prog_mode().unwrap(), ProgModeToggleResult::Err1);
    }

    #[test]
    fn reset_is_idempotent_on_the_wire() {
        let (link, mut conn) = fake_device();
        link.expect(b">R\r", b"<R:OK\r");
        link.expect(b">R\r", b"<R:OK\r");
        conn.reset_usb().unwrap();
        conn.reset_usb().unwrap();
        assert_eq!(link.written(), b">R\r>R\r");

        link.expect(b">RT\r", b"<RT:OK\r");
        conn.reset_tr().unwrap();
    }

    #[test]
    fn upload_frames_target_and_payload() {
        let (link, mut conn) = fake_device();
        let target = TARGET_FLASH | TARGET_UPLOAD_FLAG;
        link.expect(&[0x3E, 0x50, 0x4D, 0x85, 0x10, 0x20, 0x0D], b"<PM:OK\r");
        assert_eq!(
            conn.upload(target, &[0x10, 0x20]).unwrap(),
            ProgMemResult::Ok
        );

        link.expect(&[0x3E, 0x50, 0x4D, 0x85, 0x0D], b"<PM:ERR3\r");
        assert_eq!(conn.upload(target, &[]).unwrap(), ProgMemResult::Err3);
    }

    #[test]
    fn download_returns_data() {
        let (link, mut conn) = fake_device();
        link.expect(
            &[0x3E, 0x50, 0x4D, 0x06, 0x00, 0x00, 0x0D],
            b"<PM:\x01\x02\x03\x04\x05\r",
        );
        let mut out = [0u8; 32];
        let (result, len) = conn
            .download(TARGET_INTERNAL_EEPROM, &[0x00, 0x00], &mut out)
            .unwrap();
        assert_eq!(result, ProgMemResult::Ok);
        assert_eq!(len, 5);
        assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn download_returns_status_token() {
        let (link, mut conn) = fake_device();
        link.expect(&[0x3E, 0x50, 0x4D, 0x06, 0x00, 0x00, 0x0D], b"<PM:ERR2\r");
        let mut out = [0u8; 32];
        let (result, len) = conn
            .download(TARGET_INTERNAL_EEPROM, &[0x00, 0x00], &mut out)
            .unwrap();
        assert_eq!(result, ProgMemResult::Err2);
        assert_eq!(len, 0);
    }

    #[test]
    fn download_rejects_short_output_buffer() {
        let (link, mut conn) = fake_device();
        link.expect(
            &[0x3E, 0x50, 0x4D, 0x06, 0x00, 0x00, 0x0D],
            b"<PM:\x01\x02\x03\x04\x05\r",
        );
        let mut out = [0u8; 2];
        let err = conn
            .download(TARGET_INTERNAL_EEPROM, &[0x00, 0x00], &mut out)
            .unwrap_err();
        assert!(matches!(
            err,
            CdcError::Receive(ReceiveError::BufferTooSmall {
                len: 5,
                capacity: 2
            })
        ));
    }

    #[test]
    fn direction_bit_is_checked_before_sending() {
        let (link, mut conn) = fake_device();
        assert!(matches!(
            conn.upload(TARGET_FLASH, &[0x00]),
            Err(CdcError::Send(SendError::NotAnUploadTarget { target: 0x05 }))
        ));
        assert!(matches!(
            conn.download(TARGET_FLASH | TARGET_UPLOAD_FLAG, &[], &mut []),
            Err(CdcError::Send(SendError::NotADownloadTarget {
                target: 0x85
            }))
        ));
        // nothing reached the wire
        assert!(link.written().is_empty());
    }

    #[test]
    fn stopped_connection_wins_over_target_validation() {
        let (link, mut conn) = fake_device();
        link.fail_reads();
        wait_until("reception to stop", || conn.is_reception_stopped());

        // the terminal state is reported even when the target is also bad
        assert!(matches!(
            conn.upload(TARGET_FLASH, &[0x00]),
            Err(CdcError::Send(SendError::ReceptionStopped { .. }))
        ));
        assert!(matches!(
            conn.download(TARGET_FLASH | TARGET_UPLOAD_FLAG, &[], &mut []),
            Err(CdcError::Send(SendError::ReceptionStopped { .. }))
        ));
    }

    #[test]
    fn async_frames_go_to_the_listener() {
        let (link, conn) = fake_device();
        let (tx, rx) = mpsc::channel();
        conn.register_async_listener(move |payload| {
            tx.send(payload.to_vec()).unwrap();
        });

        link.inject(b"<DR\x02:\x11\x22\r");
        let payload = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(payload, vec![0x11, 0x22]);
    }

    #[test]
    fn async_frames_do_not_satisfy_a_waiting_call() {
        let (link, mut conn) = fake_device();
        let (tx, rx) = mpsc::channel();
        conn.register_async_listener(move |payload| {
            tx.send(payload.to_vec()).unwrap();
        });

        // the DR frame arrives ahead of the actual reply
        link.expect(b">S\r", b"<DR\x01:\x7F\r<S:\x81\r");
        assert_eq!(
            conn.spi_status().unwrap(),
            SpiStatus::Mode(SpiMode::ReadyProg)
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![0x7F]
        );
    }

    #[test]
    fn listener_panic_is_contained() {
        let (link, conn) = fake_device();
        conn.register_async_listener(|_| panic!("listener bug"));
        link.inject(b"<DR\x01:\x00\r");
        wait_until("panic to be recorded", || {
            conn.last_reception_error().as_deref() == Some("async listener panicked")
        });
        assert!(!conn.is_reception_stopped());

        // the reader is still alive and delivering
        let (tx, rx) = mpsc::channel();
        conn.register_async_listener(move |payload| {
            tx.send(payload.to_vec()).unwrap();
        });
        link.inject(b"<DR\x01:\x55\r");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![0x55]
        );
    }

    #[test]
    fn malformed_frame_is_skipped_and_recorded() {
        let (link, mut conn) = fake_device();
        // garbage first, then the real reply in the same burst
        link.expect(b">S\r", b"<XX\r<S:\x80\r");
        assert_eq!(
            conn.spi_status().unwrap(),
            SpiStatus::Mode(SpiMode::ReadyComm)
        );
        assert_eq!(
            conn.last_reception_error().as_deref(),
            Some("Bad message format")
        );
        assert!(!conn.is_reception_stopped());
    }

    #[test]
    fn firmware_quirk_gt_reply_accepted() {
        let (link, mut conn) = fake_device();
        link.expect(b">\r", b">OK\r");
        assert!(conn.test().unwrap());
    }

    #[test]
    fn wrong_reply_kind_is_an_error() {
        let (link, mut conn) = fake_device();
        link.expect(b">B\r", b"<U:OK\r");
        let err = conn.indicate_connectivity().unwrap_err();
        assert!(matches!(
            err,
            CdcError::Receive(ReceiveError::UnexpectedKind {
                expected: MessageKind::UsbIndicate,
                got: MessageKind::SwitchCustom,
            })
        ));
    }

    #[test]
    fn gateway_error_reply_is_an_error() {
        let (link, mut conn) = fake_device();
        link.expect(b">B\r", b"<ERR\r");
        let err = conn.indicate_connectivity().unwrap_err();
        assert!(matches!(
            err,
            CdcError::Receive(ReceiveError::UnexpectedKind {
                got: MessageKind::Error,
                ..
            })
        ));
    }

    #[test]
    fn fatal_read_error_stops_the_connection() {
        let (link, mut conn) = fake_device();
        link.fail_reads();
        wait_until("reception to stop", || conn.is_reception_stopped());
        assert!(conn.last_reception_error().is_some());

        let err = conn.send_data(&[0x01]).unwrap_err();
        assert!(matches!(
            err,
            CdcError::Send(SendError::ReceptionStopped { .. })
        ));
    }

    #[test]
    fn oversized_payload_rejected_before_sending() {
        let (link, mut conn) = fake_device();
        let err = conn.send_data(&[0u8; 256]).unwrap_err();
        assert!(matches!(
            err,
            CdcError::Send(SendError::PayloadTooLong { len: 256, max: 255 })
        ));
        assert!(link.written().is_empty());
    }
}
