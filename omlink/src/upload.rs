//! Firmware upload into the inactive bank.
//!
//! The image is streamed through the CAN window in chunks of up to 8 bytes.
//! After each block the control block is polled until it reports no error,
//! and once the whole file is staged the bootloader checks the CRC of the
//! bank against the image trailer.

use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::{
    client::OmClient,
    error::{Error, Result},
    firmware::{FirmwareImage, firmware_chunks},
    protocol::bootloader::{Bank, FlashInfo},
};

/// Upload tuning.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Bytes written between two control block checks.
    pub block_size: usize,
    /// Bytes per CAN frame, 1 to 8.
    pub chunk_size: usize,
    /// Control block reads per block before giving up.
    pub verify_attempts: u32,
    /// Pause between two control block reads of the same block.
    pub retry_delay: Duration,
    /// Pause after a block before the first control block read.
    pub block_settle: Duration,
    /// Offset of the staging bank inside the bootloader variable.
    pub staging_base: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size: 128,
            chunk_size: 8,
            verify_attempts: 3,
            retry_delay: Duration::from_millis(200),
            block_settle: Duration::from_millis(100),
            staging_base: 0,
        }
    }
}

impl UploadConfig {
    /// Set the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the number of control block reads per block.
    #[must_use]
    pub fn with_verify_attempts(mut self, attempts: u32) -> Self {
        self.verify_attempts = attempts;
        self
    }

    /// Set the pause between control block reads.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the pause after each block.
    #[must_use]
    pub fn with_block_settle(mut self, settle: Duration) -> Self {
        self.block_settle = settle;
        self
    }

    /// Set the staging base offset.
    #[must_use]
    pub fn with_staging_base(mut self, base: u32) -> Self {
        self.staging_base = base;
        self
    }

    /// Reject settings the bootloader cannot handle.
    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.chunk_size) {
            return Err(Error::Validation(format!(
                "chunk size {} out of range 1..=8",
                self.chunk_size
            )));
        }
        if self.block_size == 0 || self.block_size % self.chunk_size != 0 {
            return Err(Error::Validation(format!(
                "block size {} must be a non-zero multiple of the chunk size {}",
                self.block_size, self.chunk_size
            )));
        }
        if self.verify_attempts == 0 {
            return Err(Error::Validation(
                "at least one verify attempt is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Streams a firmware image into a bank and has the bootloader verify it.
pub struct FirmwareUploader<'a> {
    client: &'a OmClient,
    config: UploadConfig,
    interrupted: fn() -> bool,
}

impl<'a> FirmwareUploader<'a> {
    /// Uploader with the default settings.
    pub fn new(client: &'a OmClient) -> Self {
        Self::with_config(client, UploadConfig::default())
    }

    /// Uploader with explicit settings.
    pub fn with_config(client: &'a OmClient, config: UploadConfig) -> Self {
        Self {
            client,
            config,
            interrupted: crate::is_interrupted_requested,
        }
    }

    /// Replace the check consulted between chunks.
    ///
    /// Defaults to [`crate::is_interrupted_requested`].
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    /// Upload settings.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Write `image` into `bank` and verify its CRC.
    ///
    /// `progress` is called after every block with `(written, total)` bytes.
    /// Refuses to touch the bank the module is currently running from.
    pub fn upload<F>(&self, bank: Bank, image: &FirmwareImage, mut progress: F) -> Result<FlashInfo>
    where
        F: FnMut(usize, usize),
    {
        self.config.validate()?;
        image.validate()?;

        let info = self.client.read_control_block()?;
        if info.current_block == bank.index() {
            error!("Refusing to write bank {bank}: module is running from it");
            return Err(Error::ActiveBank {
                image: bank.index(),
            });
        }

        let data = image.data();
        let total = data.len();
        info!(
            "Uploading {total} bytes to bank {bank} (firmware {} bytes, CRC {:#010x})",
            image.trailer().payload_size(),
            image.trailer().crc
        );

        for (index, block) in data.chunks(self.config.block_size).enumerate() {
            let block_start = index * self.config.block_size;
            self.write_block(block_start, block)?;
            self.verify_block(block_start)?;

            let written = block_start + block.len();
            progress(written, total);
            debug!("Block at {block_start:#x} verified ({written}/{total})");
        }

        info!("Transfer complete, checking CRC of bank {bank}");
        let info = match self.client.check_image_crc(bank, image) {
            Ok(info) => info,
            Err(Error::Device { status, .. }) => {
                error!("CRC check of bank {bank} failed with status {status:#04x}");
                return Err(Error::CrcCheckFailed {
                    image: bank.index(),
                    status: Some(status),
                });
            },
            Err(e) => return Err(e),
        };
        info!("Firmware upload to bank {bank} successful");
        Ok(info)
    }

    fn write_block(&self, block_start: usize, block: &[u8]) -> Result<()> {
        let base = self.config.staging_base + block_start as u32;
        for (offset, chunk) in firmware_chunks(base, block, self.config.chunk_size) {
            if (self.interrupted)() {
                warn!("Upload interrupted at offset {offset:#x}");
                return Err(Error::Interrupted);
            }
            self.client.write_flash_chunk(offset, &chunk)?;
        }
        Ok(())
    }

    fn verify_block(&self, block_start: usize) -> Result<()> {
        if !self.config.block_settle.is_zero() {
            thread::sleep(self.config.block_settle);
        }

        let attempts = self.config.verify_attempts;
        let mut last_status = None;
        for attempt in 1..=attempts {
            match self.client.poll_control_block() {
                Ok(info) if !info.is_error() => return Ok(()),
                Ok(info) => {
                    last_status = Some(info.status);
                    warn!(
                        "Block at {block_start:#x}: status {:#04x} (attempt {attempt}/{attempts})",
                        info.status
                    );
                },
                Err(e) => {
                    warn!("Block at {block_start:#x}: {e} (attempt {attempt}/{attempts})");
                },
            }
            if attempt < attempts {
                thread::sleep(self.config.retry_delay);
            }
        }

        error!("Write failed at offset {block_start:#x}");
        Err(Error::WriteFailed {
            offset: block_start as u32,
            status: last_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::ClientConfig,
        firmware::tests::image_bytes,
        protocol::bootloader::{FlashCtrl, STATUS_LOAD_OK},
        testutil::MockTransport,
        worker::Worker,
    };

    fn setup() -> (Worker, OmClient, MockTransport) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mock = MockTransport::new();
        // Running from bank 0.
        mock.set_info(STATUS_LOAD_OK, 0, 0, 0);
        let worker = Worker::spawn(mock.clone()).unwrap();
        let client = OmClient::new(worker.handle(), ClientConfig::default());
        (worker, client, mock)
    }

    fn fast() -> UploadConfig {
        UploadConfig::default()
            .with_retry_delay(Duration::ZERO)
            .with_block_settle(Duration::ZERO)
    }

    // Not tied to the process-wide interrupt flag other tests toggle.
    fn uploader(client: &OmClient, config: UploadConfig) -> FirmwareUploader<'_> {
        FirmwareUploader::with_config(client, config).with_interrupt_check(|| false)
    }

    fn image(payload_len: usize) -> FirmwareImage {
        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
        FirmwareImage::from_bytes(image_bytes(&payload)).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(UploadConfig::default().validate().is_ok());
        assert!(fast().with_chunk_size(0).validate().is_err());
        assert!(fast().with_chunk_size(9).validate().is_err());
        assert!(fast().with_block_size(100).validate().is_err());
        assert!(fast().with_verify_attempts(0).validate().is_err());
        assert!(fast().with_chunk_size(4).with_block_size(12).validate().is_ok());
    }

    #[test]
    fn test_refuses_active_bank() {
        let (_worker, client, mock) = setup();
        let image = image(200);

        let err = uploader(&client, fast())
            .upload(Bank::Main, &image, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::ActiveBank { image: 0 }));
        assert!(mock.chunks().is_empty());
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_invalid_image_never_touches_device() {
        let (_worker, client, mock) = setup();
        let image = FirmwareImage::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let err = uploader(&client, fast())
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::InvalidFirmware(_)));
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn test_full_upload() {
        let (_worker, client, mock) = setup();
        let image = image(200);
        let mut calls = Vec::new();

        uploader(&client, fast())
            .upload(Bank::Reserve, &image, |written, total| calls.push((written, total)))
            .unwrap();

        assert_eq!(mock.flash(), image.data());
        assert_eq!(mock.chunks().len(), 26);
        assert_eq!(calls, vec![(128, 208), (208, 208)]);
        // Preflight, one check per block, CRC result.
        assert_eq!(mock.cb_reads(), 4);

        let trailer = image.trailer();
        assert_eq!(
            mock.commands(),
            vec![FlashCtrl::check_crc(Bank::Reserve, 200, trailer.crc)]
        );
    }

    #[test]
    fn test_staging_base_offsets_chunks() {
        let (_worker, client, mock) = setup();
        let image = image(24);

        uploader(&client, fast().with_staging_base(0x100))
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap();

        let offsets: Vec<u32> = mock.chunks().iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![0x100, 0x108, 0x110, 0x118]);
    }

    #[test]
    fn test_tail_chunk_is_padded() {
        let (_worker, client, mock) = setup();
        // 204 + 8 = 212 bytes, last frame carries 4 bytes.
        let image = image(204);

        uploader(&client, fast())
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap();

        let chunks = mock.chunks();
        let (offset, last) = chunks.last().unwrap();
        assert_eq!(*offset, 208);
        assert_eq!(&last[..4], &image.data()[208..]);
        assert_eq!(&last[4..], &[0xFE; 4]);
        assert_eq!(mock.flash().len(), 216);
    }

    #[test]
    fn test_block_retry_then_success() {
        let (_worker, client, mock) = setup();
        // Preflight, then two failed polls for the first block.
        mock.script_status(&[STATUS_LOAD_OK, 0x81, 0x81, STATUS_LOAD_OK]);
        let image = image(56);

        uploader(&client, fast())
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap();

        assert_eq!(mock.cb_reads(), 5);
        assert_eq!(mock.commands().len(), 1);
    }

    #[test]
    fn test_block_fails_after_three_attempts() {
        let (_worker, client, mock) = setup();
        mock.script_status(&[STATUS_LOAD_OK, 0x81, 0x81, 0x81]);
        let image = image(200);

        let err = uploader(&client, fast())
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap_err();

        match err {
            Error::WriteFailed { offset, status } => {
                assert_eq!(offset, 0);
                assert_eq!(status, Some(0x81));
            },
            other => panic!("unexpected error: {other:?}"),
        }
        // The second block is never written and the CRC is never checked.
        assert_eq!(mock.chunks().len(), 16);
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_read_errors_count_as_attempts() {
        let (_worker, client, mock) = setup();
        mock.fail_cb_reads(1, 3);
        let image = image(56);

        let err = uploader(&client, fast())
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap_err();

        assert!(matches!(
            err,
            Error::WriteFailed {
                offset: 0,
                status: None
            }
        ));
    }

    #[test]
    fn test_crc_check_failure() {
        let (_worker, client, mock) = setup();
        mock.set_command_status(0x81);
        let image = image(56);

        let err = uploader(&client, fast())
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap_err();

        assert!(matches!(
            err,
            Error::CrcCheckFailed {
                image: 1,
                status: Some(0x81)
            }
        ));
    }

    #[test]
    fn test_interrupt_stops_before_writing() {
        let (_worker, client, mock) = setup();
        let image = image(56);

        let err = uploader(&client, fast())
            .with_interrupt_check(|| true)
            .upload(Bank::Reserve, &image, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Interrupted));
        assert!(mock.chunks().is_empty());
    }
}
