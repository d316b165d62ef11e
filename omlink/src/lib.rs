//! # omlink
//!
//! Host-side protocol stack for OM sensor modules.
//!
//! The modules expose a bank of 16-bit holding registers over Modbus RTU,
//! either on a direct serial line or tunneled through a CAN bridge node. On
//! top of the register layer this crate provides:
//!
//! - A background [`Worker`] that serializes all traffic of one link
//! - Device commands: reboot, ID assignment, version and identity queries
//! - A virtual CAN frame window used to reach the bootloader
//! - Bootloader control: bank selection, CRC and validity checks, erase
//! - Raw firmware images with trailer CRC scanning and block-verified upload
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for result types
//!
//! ## Example
//!
//! ```rust,no_run
//! use omlink::{
//!     Bank, ClientConfig, FirmwareImage, FirmwareUploader, ModbusRtu, OmClient, SerialConfig,
//!     Worker,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rtu = ModbusRtu::open(&SerialConfig::new("/dev/ttyUSB0", 500_000))?;
//!     let worker = Worker::spawn(rtu)?;
//!     let client = OmClient::new(worker.handle(), ClientConfig::default().with_target_id(2));
//!
//!     println!("firmware {}", client.firmware_version()?);
//!
//!     let image = FirmwareImage::from_file("module.bin")?;
//!     FirmwareUploader::new(&client).upload(Bank::Reserve, &image, |done, total| {
//!         println!("{done}/{total}");
//!     })?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod client;
pub mod error;
pub mod firmware;
pub mod port;
pub mod protocol;
pub mod transport;
pub mod upload;
pub mod worker;

#[cfg(test)]
mod testutil;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    client::{ClientConfig, FirmwareVersion, OmClient},
    error::{Error, Result},
    firmware::FirmwareImage,
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        Bank, CanWrapRequest, CanWrapResponse, FlashCtrl, FlashInfo, FlashState, Opcode,
        TrailerInfo, crc32_stm, locate_trailer,
    },
    transport::{
        RegisterTransport, Request, Response,
        can_bridge::{CanBridge, CanVarLink},
        rtu::ModbusRtu,
    },
    upload::{FirmwareUploader, UploadConfig},
    worker::{Worker, WorkerHandle},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
