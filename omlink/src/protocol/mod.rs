//! Protocol implementations.

pub mod bootloader;
pub mod can_wrap;
pub mod codec;
pub mod crc;
pub mod regmap;

// Re-export common types
pub use bootloader::{Bank, FlashCtrl, FlashInfo, FlashState, Opcode};
pub use can_wrap::{CanWrapRequest, CanWrapResponse, TypeId};
pub use crc::{Crc32Stm, TrailerInfo, crc32_stm, locate_trailer};
