//! Serial transport for the gateway's CDC endpoint.

use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::trace;

/// The gateway enumerates its CDC endpoint at a fixed rate.
pub const BAUD_RATE: u32 = 57_600;

/// How long a blocking read waits before giving the reader a chance to
/// observe a shutdown request.
pub const READ_POLL: Duration = Duration::from_millis(50);

/// Upper bound on getting a whole request onto the wire.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte-oriented, cloneable handle to the gateway link.
///
/// Both sides of a connection hold one: the caller writes requests, the
/// reader thread owns a clone for the receive direction.
pub trait SerialLink: Send {
    /// Reads at least one byte, blocking at most [`READ_POLL`]; a quiet
    /// link yields `TimedOut`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer, retrying partial writes until
    /// [`SEND_TIMEOUT`] elapses.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Duplicates the handle for use on another thread.
    fn try_clone(&self) -> io::Result<Box<dyn SerialLink>>;
}

/// Windows device names need the device-namespace prefix (`COM10` and up
/// cannot be opened without it); other platforms take the name as given.
fn device_path(name: &str) -> Cow<'_, str> {
    if cfg!(windows) && !name.starts_with(r"\\.\") {
        Cow::Owned(format!(r"\\.\{name}"))
    } else {
        Cow::Borrowed(name)
    }
}

/// Opens and configures the port: 57600 baud, 8 data bits, no parity, one
/// stop bit, no flow control, raw byte stream.
pub fn open(name: &str) -> Result<Box<dyn SerialLink>, serialport::Error> {
    let port = serialport::new(device_path(name), BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_POLL)
        .open()?;
    Ok(Box::new(CdcPort { inner: port }))
}

struct CdcPort {
    inner: Box<dyn serialport::SerialPort>,
}

impl SerialLink for CdcPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + SEND_TIMEOUT;
        let mut rest = buf;
        while !rest.is_empty() {
            match self.inner.write(rest) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "port accepted no bytes",
                    ));
                }
                Ok(n) => {
                    trace!("wrote {n} of {} pending bytes", rest.len());
                    rest = &rest[n..];
                }
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "port not ready to send",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.inner.flush()
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialLink>> {
        let clone = self.inner.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(CdcPort { inner: clone }))
    }
}

// ============================================================================
// Scripted link for driving the engine without hardware
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::SerialLink;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct State {
        // expected request bytes paired with the canned device reply
        script: VecDeque<(Vec<u8>, Vec<u8>)>,
        written: Vec<u8>,
        rx: VecDeque<u8>,
        read_fault: bool,
    }

    /// Shared-state fake device: every clone sees the same script, write
    /// log and receive queue, so the reader thread and the test body can
    /// hold separate handles.
    #[derive(Clone)]
    pub(crate) struct MockLink {
        shared: Arc<(Mutex<State>, Condvar)>,
    }

    impl MockLink {
        pub fn new() -> Self {
            MockLink {
                shared: Arc::new((Mutex::new(State::default()), Condvar::new())),
            }
        }

        /// Queues a reply to be delivered when exactly `request` is written.
        pub fn expect(&self, request: &[u8], reply: &[u8]) {
            let (lock, _) = &*self.shared;
            lock.lock()
                .unwrap()
                .script
                .push_back((request.to_vec(), reply.to_vec()));
        }

        /// Makes bytes appear on the link without any request, like an
        /// unsolicited `DR` frame.
        pub fn inject(&self, bytes: &[u8]) {
            let (lock, cvar) = &*self.shared;
            lock.lock().unwrap().rx.extend(bytes.iter().copied());
            cvar.notify_all();
        }

        /// Every read from now on fails, as if the device disappeared.
        pub fn fail_reads(&self) {
            let (lock, cvar) = &*self.shared;
            lock.lock().unwrap().read_fault = true;
            cvar.notify_all();
        }

        /// Everything written so far, across all clones.
        pub fn written(&self) -> Vec<u8> {
            let (lock, _) = &*self.shared;
            lock.lock().unwrap().written.clone()
        }
    }

    impl SerialLink for MockLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let (lock, cvar) = &*self.shared;
            let mut state = lock.lock().unwrap();
            if state.rx.is_empty() && !state.read_fault {
                let (guard, _) = cvar
                    .wait_timeout(state, Duration::from_millis(10))
                    .unwrap();
                state = guard;
            }
            if state.read_fault {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device unplugged",
                ));
            }
            if state.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "poll tick"));
            }
            let n = buf.len().min(state.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = state.rx.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            let (lock, cvar) = &*self.shared;
            let mut state = lock.lock().unwrap();
            state.written.extend_from_slice(buf);
            if let Some((expected, _)) = state.script.front() {
                if expected == buf {
                    let (_, reply) = state.script.pop_front().unwrap();
                    state.rx.extend(reply.iter().copied());
                    cvar.notify_all();
                }
            }
            Ok(())
        }

        fn try_clone(&self) -> io::Result<Box<dyn SerialLink>> {
            Ok(Box::new(self.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_untouched_on_unix() {
        if cfg!(windows) {
            assert_eq!(device_path("COM12"), r"\\.\COM12");
            assert_eq!(device_path(r"\\.\COM3"), r"\\.\COM3");
        } else {
            assert_eq!(device_path("/dev/ttyACM0"), "/dev/ttyACM0");
        }
    }
}
