//! AVR ISP programming and UART passthrough over a networked or serial
//! programmer bridge.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod memory;
pub mod operation;
pub mod pattern;
pub mod protocol;
pub mod transport;
pub mod uart;

pub use self::device::{Chip, ChipDB, FuseKind};
pub use self::error::{Error, Result};
pub use self::flashing::{Flashing, Programmer, SessionConfig};
pub use self::memory::{Memory, MemoryImage};
pub use self::operation::MemoryOp;
pub use self::protocol::{Command, Packet, PacketType};
pub use self::transport::Transport;
pub use self::uart::{UartConfig, UartSession};
