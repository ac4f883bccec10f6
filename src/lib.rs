//! Host-side driver for GW-USB radio gateways.
//!
//! The gateway bridges a USB CDC serial endpoint to the SPI bus of a TR
//! radio transceiver module. This crate speaks its `<…\r` line protocol:
//! probing, resets, identification of both the gateway and the TR, SPI
//! status, application data exchange, the custom pass-through mode, and
//! the programming protocol that uploads and downloads TR memory regions
//! (flash, EEPROMs, RF configuration, security material, plugins).
//!
//! A [`Connection`] owns the serial port plus a background reader thread
//! and exposes one method per gateway operation. Requests are strictly
//! one-at-a-time; unsolicited `<DR` data frames from the TR are delivered
//! to a registered listener independently of the request flow.
//!
//! ```no_run
//! use cdclink::Connection;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut gw = Connection::open("/dev/ttyACM0")?;
//!     if gw.test()? {
//!         let info = gw.usb_info()?;
//!         println!("gateway type: {}", String::from_utf8_lossy(&info.device_type));
//!     }
//!     gw.send_data(&[0x01, 0x02, 0x03])?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod port;
pub mod proto;

pub use connection::Connection;
pub use error::{CdcError, InitError, ReceiveError, SendError};
pub use proto::command::{
    DataSendResult, DeviceInfo, MessageKind, ModuleInfo, ProgMemResult, ProgModeToggleResult,
    SpiMode, SpiStatus,
};
pub use proto::command::{
    TARGET_EXTERNAL_EEPROM, TARGET_FLASH, TARGET_HWP_CONFIG, TARGET_INTERNAL_EEPROM,
    TARGET_PASSWORD, TARGET_PLUGIN, TARGET_RFPGM_CONFIG, TARGET_RF_BAND, TARGET_UPLOAD_FLAG,
    TARGET_USER_KEY,
};
pub use proto::parser::{parse, ParseOutcome, ParseStatus};
