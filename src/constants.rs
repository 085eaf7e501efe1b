use std::time::Duration;

/// Start-of-frame marker of the networked framing.
pub const START_FRAME_BYTE: u8 = 0x1b;

/// Maximum payload of one networked frame.
pub const NET_MAX_DATA_LENGTH: usize = 1029;

/// Maximum total size (header, payload and CRC) of one serial frame.
pub const SERIAL_MAX_PACKET_SIZE: usize = 300;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Settle time after a chip erase instruction.
pub const CHIP_ERASE_DELAY: Duration = Duration::from_millis(50);

/// Sub-selector of the programmer-init packet.
pub const AVR_PROGRAMMER_BYTE: u8 = 0x00;

/// Memory-space selectors used by program/read memory packets.
pub mod memory {
    pub const FLASH: u8 = 0x00;
    pub const EEPROM: u8 = 0x01;
}

/// Sizes of the fixed fields in memory packets.
pub mod layout {
    /// 4-byte address and 1-byte memory selector.
    pub const PROGRAM_MEMORY_HEADER: usize = 5;
    /// 1-byte memory selector, 4-byte address, 4-byte length.
    pub const READ_MEMORY_REQUEST: usize = 9;
    /// Byte of a CMD reply carrying the instruction's output.
    pub const CMD_REPLY_OUTPUT: usize = 3;
}

/// Fallback ISP instruction patterns when a chip descriptor omits them.
pub mod patterns {
    pub const CHIP_ERASE: &str =
        "1 0 1 0 1 1 0 0 1 0 0 0 0 0 0 0 x x x x x x x x x x x x x x x x";
    pub const READ_SIGNATURE: &str =
        "0 0 1 1 0 0 0 0 0 0 0 0 0 0 0 0 x x x x x x a1 a0 o o o o o o o o";
}

pub mod net {
    /// TCP port of the programmer bridge.
    pub const BRIDGE_PORT: u16 = 1000;
    pub const DISCOVERY_PORT: u16 = 1098;
    pub const BROADCAST_PORT: u16 = 1094;
    pub const OBSERVER_CONTROL_BYTE: u8 = 0xad;
    pub const OBSERVER_VALIDATION_BYTE: u8 = 0xff;
    pub const OBSERVER_KEY_SIZE: usize = 32;
    pub const DEFAULT_KEY: &str = "00000000000000000000000000000000";
    pub const DISCOVERY_RETRIES: usize = 5;
    /// Frames buffered between the receiver thread and the session.
    pub const RECEIVE_QUEUE_DEPTH: usize = 16;
}

/// UART passthrough configuration packet.
pub mod uart {
    use std::time::Duration;

    /// How often a monitor checks whether it should stop.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub const CONFIG_LEN: usize = 4;
    pub const BAUDRATE_OFFSET: usize = 0;
    pub const PARITY_OFFSET: usize = 1;
    pub const DATA_BITS_OFFSET: usize = 2;
    pub const STOP_BITS_OFFSET: usize = 3;

    pub const PARITY_EVEN: u8 = 0xc0;
    pub const PARITY_ODD: u8 = 0xc1;
    pub const PARITY_NONE: u8 = 0xc2;
    pub const DATA_BITS_8: u8 = 0xc3;
    pub const DATA_BITS_9: u8 = 0xc4;
    pub const STOP_BITS_1: u8 = 0xc5;
    pub const STOP_BITS_2: u8 = 0xc6;
    pub const BAUDRATE_9600: u8 = 0xc7;
    pub const BAUDRATE_19200: u8 = 0xc8;
    pub const BAUDRATE_38400: u8 = 0xc9;
    pub const BAUDRATE_57600: u8 = 0xca;
    pub const BAUDRATE_74880: u8 = 0xcb;
    pub const BAUDRATE_115200: u8 = 0xcc;

    /// First byte of an error reply raised by the UART peripheral.
    pub const PARITY_ERROR: u8 = 0xe0;
    pub const FRAME_ERROR: u8 = 0xe1;
    pub const DATA_BITS_ERROR: u8 = 0xe2;
    pub const STOP_BITS_ERROR: u8 = 0xe3;
    pub const BAUDRATE_ERROR: u8 = 0xe4;
}
