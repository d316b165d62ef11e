//! High-level device client.
//!
//! [`OmClient`] turns module operations into register requests on a
//! [`WorkerHandle`]. It owns the wire conventions: outbound byte buffers are
//! packed and byte-swapped so the module receives them in order, inbound
//! registers are unpacked high byte first.
//!
//! Bootloader commands travel as virtual CAN frames through the boot block
//! window. Every command is a write of the frame, optionally followed by a
//! read round trip of the control block.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::{
    error::{Error, Result},
    firmware::FirmwareImage,
    protocol::{
        bootloader::{Bank, CONTROL_BLOCK_OFFSET, FlashCtrl, FlashInfo},
        can_wrap::{CAN_FRAME_LEN, CanWrapRequest, CanWrapResponse},
        codec::{registers_to_bytes, wire_registers},
        regmap::{boot, command},
    },
    transport::Request,
    worker::WorkerHandle,
};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bus address of the module.
    pub target_id: u8,
    /// Wait limit for writes and commands.
    pub request_timeout: Duration,
    /// Wait limit for status reads.
    pub read_timeout: Duration,
    /// Time the bootloader needs to finish an erase.
    pub erase_settle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target_id: 1,
            request_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
            erase_settle: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Set the bus address of the module.
    #[must_use]
    pub fn with_target_id(mut self, target_id: u8) -> Self {
        self.target_id = target_id;
        self
    }

    /// Set the wait limit for writes and commands.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the wait limit for status reads.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the delay between an erase command and reading its result.
    #[must_use]
    pub fn with_erase_settle(mut self, settle: Duration) -> Self {
        self.erase_settle = settle;
        self
    }
}

/// Firmware version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Patch level.
    pub patch: u16,
}

impl FirmwareVersion {
    /// Decode the three version registers (patch, minor, major).
    pub fn from_registers(regs: &[u16]) -> Result<Self> {
        match regs {
            [patch, minor, major] => Ok(Self {
                major: major.swap_bytes(),
                minor: minor.swap_bytes(),
                patch: patch.swap_bytes(),
            }),
            _ => Err(Error::Protocol(format!(
                "firmware version is {} registers, expected 3",
                regs.len()
            ))),
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}.{:02}.{:02}", self.major, self.minor, self.patch)
    }
}

/// Client for one sensor module.
#[derive(Clone)]
pub struct OmClient {
    worker: WorkerHandle,
    config: ClientConfig,
}

impl OmClient {
    /// Create a client on top of a running worker.
    pub fn new(worker: WorkerHandle, config: ClientConfig) -> Self {
        Self { worker, config }
    }

    /// Client settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ---- register access ----

    /// Read `count` registers at `address`.
    pub fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.read_registers_with(address, count, false)
    }

    fn read_registers_with(&self, address: u16, count: u16, silent: bool) -> Result<Vec<u16>> {
        let request = Request::read(address, count, self.config.target_id);
        self.worker
            .call(request, self.config.read_timeout, silent)?
            .into_registers()
    }

    /// Read `count` registers at `address` as bytes, high byte first.
    pub fn read_bytes(&self, address: u16, count: u16) -> Result<Vec<u8>> {
        self.read_registers(address, count)
            .map(|regs| registers_to_bytes(&regs))
    }

    /// Write registers as they are.
    pub fn write_registers(&self, address: u16, registers: Vec<u16>) -> Result<()> {
        self.write_registers_with(address, registers, false)
    }

    fn write_registers_with(&self, address: u16, registers: Vec<u16>, silent: bool) -> Result<()> {
        let request = Request::write(address, registers, self.config.target_id);
        self.worker
            .call(request, self.config.request_timeout, silent)
            .map(drop)
    }

    /// Write a byte buffer so the module receives it in order.
    pub fn write_bytes(&self, address: u16, bytes: &[u8]) -> Result<()> {
        self.write_registers(address, wire_registers(bytes))
    }

    // ---- command block ----

    /// Write `[code LE, data_len LE, data...]` to the command register.
    fn send_command(&self, code: u16, data_len: u16, data: &[u8]) -> Result<()> {
        let mut pack = Vec::with_capacity(4 + data.len());
        pack.extend_from_slice(&code.to_le_bytes());
        pack.extend_from_slice(&data_len.to_le_bytes());
        pack.extend_from_slice(data);
        self.write_bytes(command::COMMAND.address(command::BASE), &pack)
    }

    /// Reboot the module immediately.
    pub fn force_reboot(&self) -> Result<()> {
        info!("Rebooting module {}", self.config.target_id);
        self.send_command(command::CMD_REBOOT, 1, &[0x01, 0x30])
    }

    /// Change the bus address of the module.
    pub fn set_device_id(&self, id: u8) -> Result<()> {
        info!("Changing device id {} -> {id}", self.config.target_id);
        self.send_command(command::CMD_SET_ID, 1, &[id])
    }

    /// Firmware version of the running application.
    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        let field = command::FW_VERSION;
        let regs = self.read_registers(field.address(command::BASE), field.len)?;
        FirmwareVersion::from_registers(&regs)
    }

    /// Manufacturer identifier as 8 hex digits.
    pub fn manufacturer_id(&self) -> Result<String> {
        let field = command::MNF_ID;
        let bytes = self.read_bytes(field.address(command::BASE), field.len)?;
        match bytes.as_slice() {
            [b0, b1, b2, b3] => Ok(format!("{b3:02x}{b2:02x}{b1:02x}{b0:02x}")),
            _ => Err(Error::Protocol(format!(
                "manufacturer id is {} bytes, expected 4",
                bytes.len()
            ))),
        }
    }

    /// Flash region the application runs from.
    pub fn current_region(&self) -> Result<u8> {
        let field = command::CURRENT_REGION;
        let bytes = self.read_bytes(field.address(command::BASE), field.len)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| Error::Protocol("empty current region".to_string()))
    }

    /// Bus address reported by the module.
    pub fn device_id(&self) -> Result<u16> {
        let field = command::DEV_ID;
        let regs = self.read_registers(field.address(command::BASE), field.len)?;
        regs.first()
            .map(|reg| reg.swap_bytes())
            .ok_or_else(|| Error::Protocol("empty device id".to_string()))
    }

    // ---- CAN window ----

    fn window_address() -> u16 {
        boot::CAN_WRAP.address(boot::BASE)
    }

    /// Write a virtual CAN frame without reading the answer.
    pub fn can_wrap_write(&self, request: &CanWrapRequest) -> Result<()> {
        self.can_wrap_write_with(request, false)
    }

    fn can_wrap_write_with(&self, request: &CanWrapRequest, silent: bool) -> Result<()> {
        let frame = request.encode()?;
        self.write_registers_with(Self::window_address(), wire_registers(&frame), silent)
    }

    /// Write a virtual CAN frame and read the response window.
    pub fn can_wrap_exchange(&self, request: &CanWrapRequest) -> Result<CanWrapResponse> {
        self.can_wrap_exchange_with(request, false)
    }

    fn can_wrap_exchange_with(
        &self,
        request: &CanWrapRequest,
        silent: bool,
    ) -> Result<CanWrapResponse> {
        self.can_wrap_write_with(request, silent)?;
        let regs = self.read_registers_with(
            Self::window_address(),
            (CAN_FRAME_LEN / 2) as u16,
            silent,
        )?;
        CanWrapResponse::parse(&registers_to_bytes(&regs))
    }

    /// Write a firmware chunk into the staging bank without logging.
    pub fn write_flash_chunk(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.can_wrap_write_with(&CanWrapRequest::write(offset, data), true)
    }

    /// Read 8 bytes of the bootloader variable at `offset`.
    pub fn read_flash_fragment(&self, offset: u32) -> Result<[u8; 8]> {
        self.can_wrap_exchange(&CanWrapRequest::read(offset))
            .map(|resp| resp.data)
    }

    /// Read the bootloader control block.
    pub fn read_control_block(&self) -> Result<FlashInfo> {
        self.read_control_block_with(false)
    }

    /// Read the control block without logging, for polling loops.
    pub fn poll_control_block(&self) -> Result<FlashInfo> {
        self.read_control_block_with(true)
    }

    fn read_control_block_with(&self, silent: bool) -> Result<FlashInfo> {
        let resp = self.can_wrap_exchange_with(&CanWrapRequest::read(CONTROL_BLOCK_OFFSET), silent)?;
        FlashInfo::parse(&resp.data)
    }

    // ---- bootloader ----

    /// Write a control command without reading the result.
    pub fn send_flash_command(&self, ctrl: FlashCtrl) -> Result<()> {
        debug!("Bootloader command {} ({:02X?})", ctrl.name(), ctrl.encode());
        self.can_wrap_write(&CanWrapRequest::write(CONTROL_BLOCK_OFFSET, &ctrl.encode()))
    }

    /// Write a control command, wait `settle`, then read the control block.
    fn run_flash_command(&self, ctrl: FlashCtrl, settle: Duration) -> Result<FlashInfo> {
        self.send_flash_command(ctrl)?;
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        let info = self.read_control_block()?;
        if info.is_error() {
            return Err(Error::Device {
                command: ctrl.name(),
                status: info.status,
            });
        }
        Ok(info)
    }

    /// Select the bank booted next.
    pub fn set_preferred_bank(&self, bank: Bank) -> Result<FlashInfo> {
        self.run_flash_command(FlashCtrl::set_preferred(bank), Duration::ZERO)
    }

    /// Run the validity check on `bank`.
    pub fn check_image_valid(&self, bank: Bank) -> Result<FlashInfo> {
        self.run_flash_command(FlashCtrl::check_valid(bank), Duration::ZERO)
    }

    /// Have the bootloader compare the CRC of `bank` against `image`.
    pub fn check_image_crc(&self, bank: Bank, image: &FirmwareImage) -> Result<FlashInfo> {
        self.run_flash_command(image.check_crc_command(bank)?, Duration::ZERO)
    }

    /// Force the valid flag on `bank`.
    pub fn fix_valid_image(&self, bank: Bank) -> Result<FlashInfo> {
        self.run_flash_command(FlashCtrl::fix_valid(bank), Duration::ZERO)
    }

    /// Erase one sector (index modulo 8).
    pub fn erase_sector(&self, sector: u8) -> Result<FlashInfo> {
        self.run_flash_command(FlashCtrl::erase_sector(sector), self.config.erase_settle)
    }

    /// Erase the second half of flash.
    pub fn erase_second_half(&self) -> Result<FlashInfo> {
        self.run_flash_command(FlashCtrl::erase_second_half(), self.config.erase_settle)
    }

    /// Soft-reset the bootloader.
    ///
    /// The module may reset before acknowledging, so a timeout or a
    /// truncated reply counts as success.
    pub fn restart(&self) -> Result<()> {
        match self.send_flash_command(FlashCtrl::restart()) {
            Err(e @ (Error::Timeout(_) | Error::Protocol(_))) => {
                debug!("No acknowledgement to restart: {e}");
                Ok(())
            },
            other => other,
        }
    }

    /// Copy the staged `image` over the active bank and jump to it.
    pub fn copy_and_go(&self, image: &FirmwareImage) -> Result<()> {
        self.send_flash_command(image.copy_and_go_command()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{bootloader::FlashState, can_wrap::BOOTLOADER_VAR_ID},
        testutil::MockTransport,
        worker::Worker,
    };

    fn setup() -> (Worker, OmClient, MockTransport) {
        let mock = MockTransport::new();
        let worker = Worker::spawn(mock.clone()).unwrap();
        let config = ClientConfig::default()
            .with_erase_settle(Duration::ZERO)
            .with_target_id(2);
        let client = OmClient::new(worker.handle(), config);
        (worker, client, mock)
    }

    #[test]
    fn test_firmware_version() {
        let (_worker, client, mock) = setup();
        mock.set_registers(0x1014, &[0x0300, 0x0200, 0x0100]);
        let version = client.firmware_version().unwrap();
        assert_eq!(version.to_string(), "01.02.03");
        assert_eq!(mock.reads(), vec![(0x1014, 3, 2)]);
    }

    #[test]
    fn test_manufacturer_id() {
        let (_worker, client, mock) = setup();
        mock.set_registers(0x1018, &[0x1234, 0x5678]);
        assert_eq!(client.manufacturer_id().unwrap(), "78563412");
    }

    #[test]
    fn test_region_and_device_id() {
        let (_worker, client, mock) = setup();
        mock.set_registers(0x1017, &[0x0100]);
        mock.set_registers(0x101E, &[0x0200]);
        assert_eq!(client.current_region().unwrap(), 1);
        assert_eq!(client.device_id().unwrap(), 2);
    }

    #[test]
    fn test_force_reboot_payload() {
        let (_worker, client, mock) = setup();
        client.force_reboot().unwrap();

        let writes = mock.writes();
        assert_eq!(writes[0].0, 0x1000);
        assert_eq!(
            registers_to_bytes(&writes[0].1),
            vec![0xFE, 0x00, 0x01, 0x00, 0x01, 0x30]
        );
    }

    #[test]
    fn test_set_device_id_payload() {
        let (_worker, client, mock) = setup();
        client.set_device_id(5).unwrap();

        let writes = mock.writes();
        assert_eq!(
            registers_to_bytes(&writes[0].1),
            vec![0x13, 0x00, 0x01, 0x00, 0x05, 0x00]
        );
    }

    #[test]
    fn test_read_control_block() {
        let (_worker, client, mock) = setup();
        mock.set_info(0x00, 0, 0, 1);
        let info = client.read_control_block().unwrap();
        assert_eq!(
            info,
            FlashInfo {
                status: 0,
                current_block: 0,
                pref_block: 0,
                reset_src: 1,
            }
        );
        assert_eq!(mock.cb_reads(), 1);
    }

    #[test]
    fn test_control_block_error_state() {
        let (_worker, client, mock) = setup();
        mock.set_info(0x81, 0, 0, 1);
        let info = client.read_control_block().unwrap();
        assert_eq!(info.state(), FlashState::Error);
    }

    #[test]
    fn test_exchange_echoes_type_id() {
        let (_worker, client, _mock) = setup();
        let resp = client
            .can_wrap_exchange(&CanWrapRequest::read(CONTROL_BLOCK_OFFSET))
            .unwrap();
        let fields = resp.type_fields();
        assert_eq!(resp.bus_id, 1);
        assert_eq!(fields.var, BOOTLOADER_VAR_ID);
        assert_eq!(fields.offset, CONTROL_BLOCK_OFFSET);
        assert!(fields.rtr);
    }

    #[test]
    fn test_invalid_frame_never_reaches_transport() {
        let (_worker, client, mock) = setup();
        let bad_bus = CanWrapRequest::read(0).with_bus(3);
        let bad_var = CanWrapRequest::read(0).with_var(9);

        assert!(matches!(
            client.can_wrap_exchange(&bad_bus),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            client.can_wrap_write(&bad_var),
            Err(Error::Validation(_))
        ));
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn test_flash_fragment_round_trip() {
        let (_worker, client, mock) = setup();
        client
            .can_wrap_write(&CanWrapRequest::write(0x40, &[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        assert_eq!(mock.chunks(), vec![(0x40, vec![1, 2, 3, 4, 5, 6, 7, 8])]);
        assert_eq!(client.read_flash_fragment(0x40).unwrap(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_set_preferred_bank() {
        let (_worker, client, mock) = setup();
        let info = client.set_preferred_bank(Bank::Reserve).unwrap();

        assert_eq!(info.pref_block, 1);
        let commands = mock.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].encode(), [0, 0, 0, 0x0B, 0, 0, 0, 0]);
    }

    #[test]
    fn test_device_error_is_reported() {
        let (_worker, client, mock) = setup();
        mock.set_command_status(0x81);

        let err = client.check_image_valid(Bank::Main).unwrap_err();
        match err {
            Error::Device { command, status } => {
                assert_eq!(command, "check-valid");
                assert_eq!(status, 0x81);
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_erase_commands() {
        let (_worker, client, mock) = setup();
        client.erase_sector(9).unwrap();
        client.erase_second_half().unwrap();
        client.fix_valid_image(Bank::Reserve).unwrap();

        let cmds: Vec<u8> = mock.commands().iter().map(|c| c.cmd).collect();
        assert_eq!(cmds, vec![0x12, 0x02, 0x09]);
        assert_eq!(mock.commands()[0].size, 1);
    }

    #[test]
    fn test_restart_without_answer_is_ok() {
        let mock = MockTransport::new();
        mock.set_delay(Duration::from_millis(200));
        let worker = Worker::spawn(mock.clone()).unwrap();
        let config = ClientConfig::default().with_request_timeout(Duration::from_millis(30));
        let client = OmClient::new(worker.handle(), config);

        client.restart().unwrap();
    }

    #[test]
    fn test_restart_link_failure_is_error() {
        let (_worker, client, mock) = setup();
        mock.fail_all("port closed");
        assert!(matches!(client.restart(), Err(Error::Transport(_))));
    }

    #[test]
    fn test_restart_with_garbled_reply_is_ok() {
        let (_worker, client, mock) = setup();
        mock.garble_replies("CRC mismatch");
        client.restart().unwrap();
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn test_garbled_reply_fails_other_commands() {
        let (_worker, client, mock) = setup();
        mock.garble_replies("CRC mismatch");
        assert!(matches!(
            client.send_flash_command(FlashCtrl::copy_and_go(8, 1)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_restart_is_write_only() {
        let (_worker, client, mock) = setup();
        client.restart().unwrap();
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.commands()[0].cmd, 0x0E);
    }
}
