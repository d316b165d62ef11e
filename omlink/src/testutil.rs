//! In-memory device used by the unit tests.
//!
//! Serves plain holding registers and emulates the bootloader behind the
//! CAN window: RTR frames load the window with the requested variable
//! bytes, data frames at the control block run a command, other data frames
//! land in the staging bank.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{Error, Result},
    protocol::{
        bootloader::{CONTROL_BLOCK_OFFSET, FlashCtrl, Opcode, STATUS_LOAD_OK},
        can_wrap::{CAN_FRAME_LEN, TypeId},
        codec::registers_to_bytes,
        regmap::boot,
    },
    transport::RegisterTransport,
};

#[derive(Default)]
struct State {
    registers: HashMap<u16, u16>,
    calls: usize,
    reads: Vec<(u16, u16, u8)>,
    writes: Vec<(u16, Vec<u16>, u8)>,
    delay: Option<Duration>,
    failure: Option<String>,
    garbled: Option<String>,
    cb_fail_skip: usize,
    fail_cb_reads: usize,
    window: [u8; CAN_FRAME_LEN],
    info: [u8; 8],
    status_script: VecDeque<u8>,
    command_status: Option<u8>,
    commands: Vec<FlashCtrl>,
    chunks: Vec<(u32, Vec<u8>)>,
    flash: Vec<u8>,
}

/// Shared handle to the emulated device; clones see the same state.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Preload holding registers starting at `address`.
    pub(crate) fn set_registers(&self, address: u16, values: &[u16]) {
        let mut state = self.lock();
        for (i, value) in values.iter().enumerate() {
            state.registers.insert(address + i as u16, *value);
        }
    }

    /// Delay every transport operation.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Fail every transport operation with a transport error.
    pub(crate) fn fail_all(&self, message: &str) {
        self.lock().failure = Some(message.to_string());
    }

    /// Answer every transport operation with a malformed reply.
    pub(crate) fn garble_replies(&self, message: &str) {
        self.lock().garbled = Some(message.to_string());
    }

    /// Control block returned by the bootloader.
    pub(crate) fn set_info(&self, status: u8, current: u8, pref: u8, reset_src: u8) {
        self.lock().info[..4].copy_from_slice(&[status, current, pref, reset_src]);
    }

    /// Status bytes returned by the next control block reads, in order.
    pub(crate) fn script_status(&self, statuses: &[u8]) {
        self.lock().status_script.extend(statuses);
    }

    /// After `skip` control block reads, fail the next `count` at the
    /// transport level.
    pub(crate) fn fail_cb_reads(&self, skip: usize, count: usize) {
        let mut state = self.lock();
        state.cb_fail_skip = skip;
        state.fail_cb_reads = count;
    }

    /// Status the bootloader reports after executing a command.
    pub(crate) fn set_command_status(&self, status: u8) {
        self.lock().command_status = Some(status);
    }

    pub(crate) fn calls(&self) -> usize {
        self.lock().calls
    }

    pub(crate) fn reads(&self) -> Vec<(u16, u16, u8)> {
        self.lock().reads.clone()
    }

    pub(crate) fn writes(&self) -> Vec<(u16, Vec<u16>, u8)> {
        self.lock().writes.clone()
    }

    /// Commands written to the control block.
    pub(crate) fn commands(&self) -> Vec<FlashCtrl> {
        self.lock().commands.clone()
    }

    /// Data frames written outside the control block, as `(offset, data)`.
    pub(crate) fn chunks(&self) -> Vec<(u32, Vec<u8>)> {
        self.lock().chunks.clone()
    }

    /// Staging bank contents.
    pub(crate) fn flash(&self) -> Vec<u8> {
        self.lock().flash.clone()
    }

    /// Number of control block reads served.
    pub(crate) fn cb_reads(&self) -> usize {
        self.lock()
            .writes
            .iter()
            .filter(|(addr, regs, _)| {
                *addr == boot::BASE && {
                    let frame = registers_to_bytes(regs);
                    let id = TypeId::unpack(LittleEndian::read_u32(&frame[2..6]));
                    id.rtr && id.offset == CONTROL_BLOCK_OFFSET
                }
            })
            .count()
    }
}

impl State {
    fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let id = TypeId::unpack(LittleEndian::read_u32(&frame[2..6]));
        let mut window = [0u8; CAN_FRAME_LEN];
        window[..6].copy_from_slice(&frame[..6]);
        window[6] = 8;

        if id.rtr {
            if id.offset == CONTROL_BLOCK_OFFSET {
                if self.cb_fail_skip > 0 {
                    self.cb_fail_skip -= 1;
                } else if self.fail_cb_reads > 0 {
                    self.fail_cb_reads -= 1;
                    return Err(Error::Transport("CAN window busy".to_string()));
                }
                let mut info = self.info;
                if let Some(status) = self.status_script.pop_front() {
                    info[0] = status;
                }
                window[8..].copy_from_slice(&info);
            } else {
                let start = id.offset as usize;
                for (i, byte) in window[8..].iter_mut().enumerate() {
                    *byte = self.flash.get(start + i).copied().unwrap_or(0xFF);
                }
            }
        } else if id.offset == CONTROL_BLOCK_OFFSET {
            let ctrl = FlashCtrl::parse(&frame[8..16])?;
            if ctrl.opcode() == Some(Opcode::SetPref) {
                self.info[2] = ctrl.cmd & 0x01;
            }
            self.info[0] = self.command_status.unwrap_or(STATUS_LOAD_OK);
            self.commands.push(ctrl);
            window[8..].copy_from_slice(&frame[8..16]);
        } else {
            let data = frame[8..].to_vec();
            let start = id.offset as usize;
            if self.flash.len() < start + data.len() {
                self.flash.resize(start + data.len(), 0xFF);
            }
            self.flash[start..start + data.len()].copy_from_slice(&data);
            window[8..8 + data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
            self.chunks.push((id.offset, data));
        }
        self.window = window;
        Ok(())
    }
}

impl RegisterTransport for MockTransport {
    fn read(&mut self, address: u16, count: u16, target: u8) -> Result<Vec<u16>> {
        let delay = {
            let mut state = self.lock();
            state.calls += 1;
            state.reads.push((address, count, target));
            state.delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let state = self.lock();
        if let Some(message) = &state.failure {
            return Err(Error::Transport(message.clone()));
        }
        if let Some(message) = &state.garbled {
            return Err(Error::Protocol(message.clone()));
        }
        if address == boot::BASE {
            return Ok(state
                .window
                .chunks_exact(2)
                .take(usize::from(count))
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect());
        }
        Ok((0..count)
            .map(|i| {
                state
                    .registers
                    .get(&(address + i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    fn write(&mut self, address: u16, registers: &[u16], target: u8) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.calls += 1;
            state
                .writes
                .push((address, registers.to_vec(), target));
            state.delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if let Some(message) = &state.failure {
            return Err(Error::Transport(message.clone()));
        }
        if let Some(message) = &state.garbled {
            return Err(Error::Protocol(message.clone()));
        }
        if address == boot::BASE {
            let frame = registers_to_bytes(registers);
            return state.handle_frame(&frame);
        }
        for (i, value) in registers.iter().enumerate() {
            state.registers.insert(address + i as u16, *value);
        }
        Ok(())
    }
}
