//! Finite-state recognizer for gateway response frames.
//!
//! The parser is deterministic and restartable: every call to [`parse`]
//! starts over at state 0, byte offset 0, so a partially received frame
//! costs nothing but a re-scan once more bytes arrive. Callers consume
//! `last_position + 1` bytes from their buffer after an `Ok` result and
//! resynchronize on the next `0x0D` after a `BadFormat`.

use thiserror::Error;

use super::command::{
    DataSendResult, DeviceInfo, MessageKind, ModuleInfo, ProgMemResult, ProgModeToggleResult,
    SpiMode, SpiStatus, FRAME_END,
};

/// How far [`parse`] got with the supplied bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A complete frame was recognized.
    Ok,
    /// The buffer holds a valid frame prefix; more bytes are needed.
    NotComplete,
    /// No production of the grammar matches.
    BadFormat,
}

/// Result of one [`parse`] call over the head of a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct ParseOutcome {
    /// Terminal classification; only meaningful when `status` is `Ok`.
    pub kind: MessageKind,
    pub status: ParseStatus,
    /// On `Ok` the index of the terminating `0x0D`; on `BadFormat` the
    /// offending position.
    pub last_position: usize,
}

/// Raised by an extractor whose frame body is not a known status token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unknown status token")]
    UnknownToken,
}

// State numbering. Terminal states are marked with the kind they yield;
// states 20, 23, 52 and 82 need content- or length-sensitive handling and
// are processed outside the transition table.
//
//   0 start                  '<' (or '>', firmware quirk) -> 1
//   1 header dispatch        E->2 O->6 R->9 I->19 B->26 S->31 D->35 U->55 P->60
//   2..5    <ERR\r                                     5 = Error
//   6..8    <OK\r                                      8 = Test
//   9..13   <R:OK\r                                   13 = ResetUsb
//   9,14..18 <RT:OK\r                                 18 = ResetTr
//  19,20,21 <I:type#version#serial\r   20 special     21 = UsbInfo
//  19,22..25 <IT:[16|32 bytes]\r       23 special     25 = TrInfo
//  26..30   <B:OK\r                                   30 = UsbIndicate
//  31..34   <S:[status byte]\r         32 catch-all   34 = SpiStatus
//  35..40   <DS:OK\r                                  40 = DataSend
//  35,37,41..44 <DS:ERR\r                             44 = DataSend
//  35,37,45..49 <DS:BUSY\r                            49 = DataSend
//  35,50..54 <DR[len]:[payload]\r      50 catch-all, 52 special
//                                                     54 = AsyncData
//  55..59   <U:OK\r                                   59 = SwitchCustom
//  60..65   <PE:OK\r                                  65 = EnterProgMode
//  60..62,66..70 <PE:ERR1\r                           70 = EnterProgMode
//  60,71..75 <PT:OK\r                                 75 = ExitProgMode
//  60,71,72,76..80 <PT:ERR1\r                         80 = ExitProgMode
//  60,81,82 <PM:...                    82 special
//  83..86   ... OK\r                                  86 = ProgMemResp
//  83,87..91 ... ERR[2-7]\r                           91 = ProgMemResp
//  83,92..96 ... BUSY\r                               96 = ProgMemResp
//  97,98    ... [payload]\r                           98 = ProgMemDownloadData

const ST_START: u8 = 0;
const ST_USB_INFO_BODY: u8 = 20;
const ST_USB_INFO_DONE: u8 = 21;
const ST_TR_INFO_BODY: u8 = 23;
const ST_TR_INFO_CR: u8 = 24;
const ST_DR_BODY: u8 = 52;
const ST_DR_CR: u8 = 53;
const ST_PM_BODY: u8 = 82;
const ST_PM_STAT: u8 = 83;
const ST_PM_DATA: u8 = 97;

/// Total frame length of a standard TR identification, terminator included.
const TR_INFO_STANDARD_LEN: usize = 21;
/// Total frame length of an extended TR identification (with IBK).
const TR_INFO_EXTENDED_LEN: usize = 37;

/// Total frame lengths that classify a `<PM:` response as a status token
/// (`OK`, `ERR2`..`ERR7`, `BUSY`); every other length is download data.
const PM_TOKEN_LENGTHS: [usize; 2] = [7, 9];

fn transition(state: u8, byte: u8) -> Option<u8> {
    Some(match (state, byte) {
        (0, b'<') | (0, b'>') => 1,
        (1, b'E') => 2,
        (1, b'O') => 6,
        (1, b'R') => 9,
        (1, b'I') => 19,
        (1, b'B') => 26,
        (1, b'S') => 31,
        (1, b'D') => 35,
        (1, b'U') => 55,
        (1, b'P') => 60,

        // <ERR
        (2, b'R') => 3,
        (3, b'R') => 4,
        (4, FRAME_END) => 5,

        // <OK
        (6, b'K') => 7,
        (7, FRAME_END) => 8,

        // <R:OK
        (9, b':') => 10,
        (10, b'O') => 11,
        (11, b'K') => 12,
        (12, FRAME_END) => 13,

        // <RT:OK
        (9, b'T') => 14,
        (14, b':') => 15,
        (15, b'O') => 16,
        (16, b'K') => 17,
        (17, FRAME_END) => 18,

        // <I: / <IT:
        (19, b':') => ST_USB_INFO_BODY,
        (19, b'T') => 22,
        (22, b':') => ST_TR_INFO_BODY,
        (24, FRAME_END) => 25,

        // <B:OK
        (26, b':') => 27,
        (27, b'O') => 28,
        (28, b'K') => 29,
        (29, FRAME_END) => 30,

        // <S: one raw status byte
        (31, b':') => 32,
        (32, _) => 33,
        (33, FRAME_END) => 34,

        // <DS:OK / <DS:ERR / <DS:BUSY
        (35, b'S') => 36,
        (36, b':') => 37,
        (37, b'O') => 38,
        (38, b'K') => 39,
        (39, FRAME_END) => 40,
        (37, b'E') => 41,
        (41, b'R') => 42,
        (42, b'R') => 43,
        (43, FRAME_END) => 44,
        (37, b'B') => 45,
        (45, b'U') => 46,
        (46, b'S') => 47,
        (47, b'Y') => 48,
        (48, FRAME_END) => 49,

        // <DR[len]:
        (35, b'R') => 50,
        (50, _) => 51,
        (51, b':') => ST_DR_BODY,
        (53, FRAME_END) => 54,

        // <U:OK
        (55, b':') => 56,
        (56, b'O') => 57,
        (57, b'K') => 58,
        (58, FRAME_END) => 59,

        // <PE:OK / <PE:ERR1
        (60, b'E') => 61,
        (61, b':') => 62,
        (62, b'O') => 63,
        (63, b'K') => 64,
        (64, FRAME_END) => 65,
        (62, b'E') => 66,
        (66, b'R') => 67,
        (67, b'R') => 68,
        (68, b'1') => 69,
        (69, FRAME_END) => 70,

        // <PT:OK / <PT:ERR1
        (60, b'T') => 71,
        (71, b':') => 72,
        (72, b'O') => 73,
        (73, b'K') => 74,
        (74, FRAME_END) => 75,
        (72, b'E') => 76,
        (76, b'R') => 77,
        (77, b'R') => 78,
        (78, b'1') => 79,
        (79, FRAME_END) => 80,

        // <PM:
        (60, b'M') => 81,
        (81, b':') => ST_PM_BODY,

        // <PM: status tokens, re-scanned after the length heuristic
        (83, b'O') => 84,
        (84, b'K') => 85,
        (85, FRAME_END) => 86,
        (83, b'E') => 87,
        (87, b'R') => 88,
        (88, b'R') => 89,
        (89, b'2'..=b'7') => 90,
        (90, FRAME_END) => 91,
        (83, b'B') => 92,
        (92, b'U') => 93,
        (93, b'S') => 94,
        (94, b'Y') => 95,
        (95, FRAME_END) => 96,

        // <PM: download payload, terminator only
        (97, FRAME_END) => 98,

        _ => return None,
    })
}

fn finite(state: u8) -> Option<MessageKind> {
    Some(match state {
        5 => MessageKind::Error,
        8 => MessageKind::Test,
        13 => MessageKind::ResetUsb,
        18 => MessageKind::ResetTr,
        21 => MessageKind::UsbInfo,
        25 => MessageKind::TrInfo,
        30 => MessageKind::UsbIndicate,
        34 => MessageKind::SpiStatus,
        40 | 44 | 49 => MessageKind::DataSend,
        54 => MessageKind::AsyncData,
        59 => MessageKind::SwitchCustom,
        65 | 70 => MessageKind::EnterProgMode,
        75 | 80 => MessageKind::ExitProgMode,
        86 | 91 | 96 => MessageKind::ProgMemResp,
        98 => MessageKind::ProgMemDownloadData,
        _ => return None,
    })
}

/// Outcome of scanning a content-sensitive frame body.
struct BodyScan {
    next: u8,
    last: usize,
    bad: bool,
}

impl BodyScan {
    fn pending(state: u8, last: usize) -> Self {
        BodyScan {
            next: state,
            last,
            bad: false,
        }
    }

    fn advance(next: u8, last: usize) -> Self {
        BodyScan {
            next,
            last,
            bad: false,
        }
    }

    fn bad(state: u8, last: usize) -> Self {
        BodyScan {
            next: state,
            last,
            bad: true,
        }
    }
}

/// `<I:` body: three sections split by `#`. The type section is opaque,
/// the version section is digits and `.`, the serial section is digits
/// and `A`-`H`. Terminates on `0x0D` seen in the serial section.
fn usb_info_body(buf: &[u8], pos: usize) -> BodyScan {
    const TYPE: u8 = 0;
    const VERSION: u8 = 1;
    const SERIAL: u8 = 2;

    if pos == buf.len() - 1 {
        return BodyScan::pending(ST_USB_INFO_BODY, pos);
    }

    let mut section = TYPE;
    let mut last = pos;
    for (i, &b) in buf.iter().enumerate().skip(pos) {
        last = i;
        if b == FRAME_END && section == SERIAL {
            return BodyScan::advance(ST_USB_INFO_DONE, i);
        }
        if b == b'#' {
            if section == SERIAL {
                return BodyScan::bad(ST_USB_INFO_BODY, i);
            }
            section += 1;
            continue;
        }
        let valid = match section {
            TYPE => true,
            VERSION => b.is_ascii_digit() || b == b'.',
            _ => b.is_ascii_digit() || (b'A'..=b'H').contains(&b),
        };
        if !valid {
            return BodyScan::bad(ST_USB_INFO_BODY, i);
        }
    }
    BodyScan::pending(ST_USB_INFO_BODY, last)
}

/// `<IT:` body: a standard (16-byte) or extended (32-byte) identification
/// block. The terminator position decides the variant: `0x0D` at offset 20
/// means standard, otherwise the frame must run to 37 bytes. A frame of
/// neither length is malformed once its would-be terminator is in.
fn tr_info_body(buf: &[u8], pos: usize) -> BodyScan {
    if pos == buf.len() - 1 {
        return BodyScan::pending(ST_TR_INFO_BODY, pos);
    }

    if buf.len() >= TR_INFO_STANDARD_LEN && buf[TR_INFO_STANDARD_LEN - 1] == FRAME_END {
        return BodyScan::advance(ST_TR_INFO_CR, TR_INFO_STANDARD_LEN - 2);
    }
    if buf.len() < TR_INFO_EXTENDED_LEN {
        return BodyScan::pending(ST_TR_INFO_BODY, buf.len() - 1);
    }
    BodyScan::advance(ST_TR_INFO_CR, TR_INFO_EXTENDED_LEN - 2)
}

/// `<DR` body: the byte at frame offset 3 gives the payload length; the
/// payload is opaque and followed by the terminator.
fn dr_body(buf: &[u8], pos: usize) -> BodyScan {
    if pos == buf.len() - 1 {
        return BodyScan::pending(ST_DR_BODY, pos);
    }

    let payload_len = buf[3] as usize;
    if pos + payload_len >= buf.len() {
        return BodyScan::pending(ST_DR_BODY, buf.len() - 1);
    }
    BodyScan::advance(ST_DR_CR, pos + payload_len - 1)
}

/// `<PM:` body: frame length up to the first terminator decides between a
/// status token (7 or 9 bytes total) and opaque download data (any other
/// length). Real downloads are 5 or 36 bytes for this device, but other
/// lengths are accepted to tolerate firmware growth. A download payload
/// whose length lands on 7 or 9 is misclassified; the grammar gives no way
/// to tell the cases apart.
fn pm_body(buf: &[u8], pos: usize) -> BodyScan {
    if pos == buf.len() - 1 {
        return BodyScan::pending(ST_PM_BODY, pos);
    }

    let Some(end) = buf[pos..].iter().position(|&b| b == FRAME_END) else {
        return BodyScan::pending(ST_PM_BODY, buf.len() - 1);
    };
    let end = pos + end;
    if PM_TOKEN_LENGTHS.contains(&(end + 1)) {
        BodyScan::advance(ST_PM_STAT, pos - 1)
    } else {
        BodyScan::advance(ST_PM_DATA, end - 1)
    }
}

fn body_scan(state: u8, buf: &[u8], pos: usize) -> Option<BodyScan> {
    match state {
        ST_USB_INFO_BODY => Some(usb_info_body(buf, pos)),
        ST_TR_INFO_BODY => Some(tr_info_body(buf, pos)),
        ST_DR_BODY => Some(dr_body(buf, pos)),
        ST_PM_BODY => Some(pm_body(buf, pos)),
        _ => None,
    }
}

/// Runs the recognizer over the head of `buf`.
///
/// `buf` may hold a partial frame, exactly one frame, or a frame followed
/// by arbitrary further bytes; only the head is classified.
pub fn parse(buf: &[u8]) -> ParseOutcome {
    let mut outcome = ParseOutcome {
        kind: MessageKind::Error,
        status: ParseStatus::NotComplete,
        last_position: 0,
    };

    let mut state = ST_START;
    let mut pos = 0usize;
    while pos < buf.len() {
        outcome.last_position = pos;

        if let Some(scan) = body_scan(state, buf, pos) {
            outcome.last_position = scan.last;
            if scan.bad {
                outcome.status = ParseStatus::BadFormat;
                return outcome;
            }
            state = scan.next;
            if let Some(kind) = finite(state) {
                outcome.kind = kind;
                outcome.status = ParseStatus::Ok;
                return outcome;
            }
            pos = scan.last + 1;
            continue;
        }

        match transition(state, buf[pos]) {
            Some(next) => state = next,
            None => {
                outcome.status = ParseStatus::BadFormat;
                return outcome;
            }
        }
        if let Some(kind) = finite(state) {
            outcome.kind = kind;
            outcome.status = ParseStatus::Ok;
            return outcome;
        }
        pos += 1;
    }

    outcome
}

// ---- Field extractors ----
//
// Each slices the frame between its fixed header and the terminating 0x0D.
// They must only be called on a frame parse() classified with the matching
// kind; offsets are taken on that contract.

fn status_body(frame: &[u8]) -> &[u8] {
    &frame[4..frame.len() - 1]
}

/// Splits a `UsbInfo` frame into its three identification fields.
pub fn device_info(frame: &[u8]) -> DeviceInfo {
    let body = &frame[3..frame.len() - 1];
    let mut sections = body.splitn(3, |&b| b == b'#');
    let device_type = sections.next().unwrap_or_default().to_vec();
    let firmware_version = sections.next().unwrap_or_default().to_vec();
    let serial_number = sections.next().unwrap_or_default().to_vec();
    DeviceInfo {
        device_type,
        firmware_version,
        serial_number,
    }
}

/// Decodes a `TrInfo` frame. Returns `None` when the frame is neither the
/// standard nor the extended identification length.
pub fn module_info(frame: &[u8]) -> Option<ModuleInfo> {
    if frame.len() != TR_INFO_STANDARD_LEN && frame.len() != TR_INFO_EXTENDED_LEN {
        return None;
    }
    let body = &frame[4..];

    let mut serial_number = [0u8; 4];
    serial_number.copy_from_slice(&body[..4]);
    let mut os_build = [0u8; 2];
    os_build.copy_from_slice(&body[6..8]);
    let mut reserved = [0u8; 2];
    reserved.copy_from_slice(&body[8..10]);

    let mut ibk = [0u8; 16];
    if frame.len() == TR_INFO_EXTENDED_LEN {
        ibk.copy_from_slice(&body[10..26]);
    }

    Some(ModuleInfo {
        serial_number,
        os_version: body[4],
        tr_type: body[5],
        os_build,
        reserved,
        ibk,
    })
}

/// Interprets the single status byte of a `SpiStatus` frame.
pub fn spi_status(frame: &[u8]) -> SpiStatus {
    let byte = frame[3];
    match SpiMode::from_byte(byte) {
        Some(mode) => SpiStatus::Mode(mode),
        None => SpiStatus::DataReady(byte),
    }
}

/// Decodes the acknowledgement token of a `DataSend` frame.
pub fn data_send_result(frame: &[u8]) -> Result<DataSendResult, ExtractError> {
    match status_body(frame) {
        b"OK" => Ok(DataSendResult::Ok),
        b"ERR" => Ok(DataSendResult::Err),
        b"BUSY" => Ok(DataSendResult::Busy),
        _ => Err(ExtractError::UnknownToken),
    }
}

/// Payload of an `AsyncData` frame. Valid only for the lifetime of the
/// frame slice.
pub fn dr_payload(frame: &[u8]) -> &[u8] {
    &frame[5..frame.len() - 1]
}

fn toggle_result(frame: &[u8]) -> Result<ProgModeToggleResult, ExtractError> {
    match status_body(frame) {
        b"OK" => Ok(ProgModeToggleResult::Ok),
        b"ERR1" => Ok(ProgModeToggleResult::Err1),
        _ => Err(ExtractError::UnknownToken),
    }
}

/// Decodes the token of an `EnterProgMode` frame.
pub fn prog_enter_result(frame: &[u8]) -> Result<ProgModeToggleResult, ExtractError> {
    toggle_result(frame)
}

/// Decodes the token of an `ExitProgMode` frame.
pub fn prog_exit_result(frame: &[u8]) -> Result<ProgModeToggleResult, ExtractError> {
    toggle_result(frame)
}

/// Decodes the status token of a `ProgMemResp` frame.
pub fn prog_mem_result(frame: &[u8]) -> Result<ProgMemResult, ExtractError> {
    match status_body(frame) {
        b"OK" => Ok(ProgMemResult::Ok),
        b"ERR2" => Ok(ProgMemResult::Err2),
        b"ERR3" => Ok(ProgMemResult::Err3),
        b"ERR4" => Ok(ProgMemResult::Err4),
        b"ERR5" => Ok(ProgMemResult::Err5),
        b"ERR6" => Ok(ProgMemResult::Err6),
        b"ERR7" => Ok(ProgMemResult::Err7),
        b"BUSY" => Ok(ProgMemResult::Busy),
        _ => Err(ExtractError::UnknownToken),
    }
}

/// Payload of a `ProgMemDownloadData` frame.
pub fn pm_download_payload(frame: &[u8]) -> &[u8] {
    &frame[4..frame.len() - 1]
}

/* ---------- tests ---------- */
