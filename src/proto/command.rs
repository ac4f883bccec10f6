//! Request encoding and the typed payloads carried by gateway responses.

use crate::error::SendError;

/// Frame terminator. The gateway speaks bare-CR lines, never CR-LF.
pub const FRAME_END: u8 = 0x0D;

/// Longest payload a `DS` or `PM` request may carry.
pub const MAX_PAYLOAD: usize = 255;

// ---- Memory-region target codes (PM body byte 0) ----
//
// Bit 7 encodes the direction: set = upload (write to the TR), clear =
// download (read from the TR). Password, user key and plugin exist only
// with bit 7 set.

/// Direction bit: OR into a region code to form an upload target.
pub const TARGET_UPLOAD_FLAG: u8 = 0x80;

pub const TARGET_HWP_CONFIG: u8 = 0x00;
pub const TARGET_RFPGM_CONFIG: u8 = 0x01;
pub const TARGET_RF_BAND: u8 = 0x02;
/// Write-only.
pub const TARGET_PASSWORD: u8 = 0x03;
/// Write-only.
pub const TARGET_USER_KEY: u8 = 0x04;
pub const TARGET_FLASH: u8 = 0x05;
pub const TARGET_INTERNAL_EEPROM: u8 = 0x06;
pub const TARGET_EXTERNAL_EEPROM: u8 = 0x07;
/// Write-only.
pub const TARGET_PLUGIN: u8 = 0x08;

/// Classification of a parsed gateway frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `<OK` — reply to the bare connectivity probe.
    Test,
    /// `<R:OK` — gateway reset acknowledged.
    ResetUsb,
    /// `<RT:OK` — TR module reset acknowledged.
    ResetTr,
    /// `<I:...` — gateway identification, three `#`-separated fields.
    UsbInfo,
    /// `<IT:...` — TR module identification, binary.
    TrInfo,
    /// `<B:OK` — connectivity blink acknowledged.
    UsbIndicate,
    /// `<S:..` — SPI status byte.
    SpiStatus,
    /// `<DS:..` — data-send acknowledgement.
    DataSend,
    /// `<DR..` — unsolicited inbound data from the TR.
    AsyncData,
    /// `<U:OK` — switch to custom mode acknowledged.
    SwitchCustom,
    /// `<PE:..` — enter programming mode.
    EnterProgMode,
    /// `<PT:..` — exit programming mode.
    ExitProgMode,
    /// `<PM:..` — programming-memory status token.
    ProgMemResp,
    /// `<PM:..` — programming-memory download payload.
    ProgMemDownloadData,
    /// `<ERR` — the gateway rejected the last request.
    Error,
}

impl MessageKind {
    /// Request header bytes for this message family (the response grammar
    /// echoes the same header after `<`). `AsyncData` and the download
    /// alias only ever occur on the receive side.
    pub(crate) fn header(self) -> &'static [u8] {
        match self {
            MessageKind::Test => b"",
            MessageKind::ResetUsb => b"R",
            MessageKind::ResetTr => b"RT",
            MessageKind::UsbInfo => b"I",
            MessageKind::TrInfo => b"IT",
            MessageKind::UsbIndicate => b"B",
            MessageKind::SpiStatus => b"S",
            MessageKind::DataSend => b"DS",
            MessageKind::AsyncData => b"DR",
            MessageKind::SwitchCustom => b"U",
            MessageKind::EnterProgMode => b"PE",
            MessageKind::ExitProgMode => b"PT",
            MessageKind::ProgMemResp => b"PM",
            MessageKind::ProgMemDownloadData => b"PM",
            MessageKind::Error => b"",
        }
    }
}

/// Builds the wire image of a request: `'>' header [framing] body 0x0D`.
///
/// `DS` bodies are prefixed with a length byte and `':'`; `PM` bodies start
/// with the target code followed by the operation payload.
pub(crate) fn encode_request(kind: MessageKind, body: &[u8]) -> Result<Vec<u8>, SendError> {
    let header = kind.header();
    let mut out = Vec::with_capacity(2 + header.len() + body.len() + 2);
    out.push(b'>');
    out.extend_from_slice(header);

    match kind {
        MessageKind::DataSend => {
            if body.len() > MAX_PAYLOAD {
                return Err(SendError::PayloadTooLong {
                    len: body.len(),
                    max: MAX_PAYLOAD,
                });
            }
            out.push(body.len() as u8);
            out.push(b':');
            out.extend_from_slice(body);
        }
        MessageKind::ProgMemResp => {
            // body[0] is the target code and does not count against the limit
            if body.len() > MAX_PAYLOAD + 1 {
                return Err(SendError::PayloadTooLong {
                    len: body.len() - 1,
                    max: MAX_PAYLOAD,
                });
            }
            out.extend_from_slice(body);
        }
        _ => debug_assert!(body.is_empty(), "{kind:?} requests carry no body"),
    }

    out.push(FRAME_END);
    Ok(out)
}

// ---- Typed response payloads ----

/// Gateway identification from a `<I:` frame. All three fields are the raw
/// ASCII bytes between the `#` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_type: Vec<u8>,
    pub firmware_version: Vec<u8>,
    pub serial_number: Vec<u8>,
}

/// TR module identification from a `<IT:` frame.
///
/// `ibk` is the individual bonding key, present only in the extended
/// identification variant; it is zero-filled when the module answered with
/// the standard (short) variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub serial_number: [u8; 4],
    pub os_version: u8,
    pub tr_type: u8,
    pub os_build: [u8; 2],
    pub reserved: [u8; 2],
    pub ibk: [u8; 16],
}

/// The closed set of SPI mode codes the TR reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    Disabled,
    Suspended,
    BufferProtect,
    CrcMismatch,
    ReadyComm,
    ReadyProg,
    ReadyDebug,
    SlowMode,
    HwError,
}

impl SpiMode {
    pub fn from_byte(byte: u8) -> Option<SpiMode> {
        match byte {
            0x00 => Some(SpiMode::Disabled),
            0x07 => Some(SpiMode::Suspended),
            0x3F => Some(SpiMode::BufferProtect),
            0x3E => Some(SpiMode::CrcMismatch),
            0x80 => Some(SpiMode::ReadyComm),
            0x81 => Some(SpiMode::ReadyProg),
            0x82 => Some(SpiMode::ReadyDebug),
            0x83 => Some(SpiMode::SlowMode),
            0xFF => Some(SpiMode::HwError),
            _ => None,
        }
    }
}

/// SPI status byte interpretation: either one of the known mode codes, or
/// the number of bytes the TR has queued for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiStatus {
    Mode(SpiMode),
    DataReady(u8),
}

/// Acknowledgement of a `DS` data-send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSendResult {
    Ok,
    Err,
    Busy,
}

/// Result of entering or exiting programming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgModeToggleResult {
    Ok,
    Err1,
}

/// Status token of a programming-memory upload or download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgMemResult {
    Ok,
    Err2,
    Err3,
    Err4,
    Err5,
    Err6,
    Err7,
    Busy,
}

/* ---------- tests ---------- */
