//! The framed binary protocol spoken with the programmer bridge.

use std::fmt;

use bitfield::bitfield;
use scroll::{Pread, Pwrite, BE};

use crate::constants::{layout, NET_MAX_DATA_LENGTH, SERIAL_MAX_PACKET_SIZE, START_FRAME_BYTE};
use crate::error::{Error, Result};

/// Packet type. The discriminant is the wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PacketType {
    ProgrammerInit = 0x10,
    ProgrammerStop = 0x11,
    UartInit = 0x12,
    UartStop = 0x13,
    Reset = 0x14,
    Ack = 0x15,
    CloseConnection = 0x16,
    NetworkConfig = 0x17,
    SetObserverKey = 0x18,
    SetEncryptionKeys = 0x19,
    SetSignKeys = 0x1a,
    EnableEncryption = 0x1b,
    EnableSign = 0x1c,
    Error = 0x1d,

    LoadMcuInfo = 0x20,
    ProgramMemory = 0x21,
    ReadMemory = 0x22,
    Memory = 0x23,
    Cmd = 0x24,

    UartConfiguration = 0x40,
    UartData = 0x41,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketGroup {
    Control,
    Programmer,
    Uart,
}

impl PacketType {
    pub const ALL: [PacketType; 21] = [
        PacketType::ProgrammerInit,
        PacketType::ProgrammerStop,
        PacketType::UartInit,
        PacketType::UartStop,
        PacketType::Reset,
        PacketType::Ack,
        PacketType::CloseConnection,
        PacketType::NetworkConfig,
        PacketType::SetObserverKey,
        PacketType::SetEncryptionKeys,
        PacketType::SetSignKeys,
        PacketType::EnableEncryption,
        PacketType::EnableSign,
        PacketType::Error,
        PacketType::LoadMcuInfo,
        PacketType::ProgramMemory,
        PacketType::ReadMemory,
        PacketType::Memory,
        PacketType::Cmd,
        PacketType::UartConfiguration,
        PacketType::UartData,
    ];

    pub const fn to_byte(self) -> u8 {
        self as u8
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        let t = match b {
            0x10 => PacketType::ProgrammerInit,
            0x11 => PacketType::ProgrammerStop,
            0x12 => PacketType::UartInit,
            0x13 => PacketType::UartStop,
            0x14 => PacketType::Reset,
            0x15 => PacketType::Ack,
            0x16 => PacketType::CloseConnection,
            0x17 => PacketType::NetworkConfig,
            0x18 => PacketType::SetObserverKey,
            0x19 => PacketType::SetEncryptionKeys,
            0x1a => PacketType::SetSignKeys,
            0x1b => PacketType::EnableEncryption,
            0x1c => PacketType::EnableSign,
            0x1d => PacketType::Error,
            0x20 => PacketType::LoadMcuInfo,
            0x21 => PacketType::ProgramMemory,
            0x22 => PacketType::ReadMemory,
            0x23 => PacketType::Memory,
            0x24 => PacketType::Cmd,
            0x40 => PacketType::UartConfiguration,
            0x41 => PacketType::UartData,
            _ => return None,
        };
        Some(t)
    }

    pub const fn group(self) -> PacketGroup {
        let b = self.to_byte();
        if b & 0x40 != 0 {
            PacketGroup::Uart
        } else if b & 0x20 != 0 {
            PacketGroup::Programmer
        } else {
            PacketGroup::Control
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitfield! {
    /// Frame flags. Reserved by the firmware, always sent as zero.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags(u8);
    impl Debug;
    pub compression, set_compression: 0;
    pub encryption, set_encryption: 1;
    pub sign, set_sign: 2;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub flags: Flags,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, hex::encode(&self.payload))
    }
}

impl Packet {
    pub fn new(kind: PacketType, payload: Vec<u8>) -> Self {
        Packet {
            kind,
            flags: Flags::default(),
            payload,
        }
    }

    pub fn empty(kind: PacketType) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Output byte of an ISP instruction echoed back in a CMD reply.
    pub fn cmd_output(&self) -> Result<u8> {
        self.payload
            .get(layout::CMD_REPLY_OUTPUT)
            .copied()
            .ok_or_else(|| {
                Error::MalformedPacket(format!(
                    "CMD reply carries {} bytes, expected 4",
                    self.payload.len()
                ))
            })
    }
}

/// The two frame layouts of the bridge firmware.
///
/// ```text
/// Network: | 0x1B | flags | type | len (u16 BE) | payload ... |
/// Serial:  | total len (u16 BE) | type | payload ... | CRC32 (BE) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Network,
    Serial,
}

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_MPEG_2);
const CRC_SIZE: usize = 4;

impl Framing {
    pub const fn header_len(self) -> usize {
        match self {
            Framing::Network => 5,
            Framing::Serial => 3,
        }
    }

    pub const fn overhead(self) -> usize {
        match self {
            Framing::Network => self.header_len(),
            Framing::Serial => self.header_len() + CRC_SIZE,
        }
    }

    /// Largest payload one frame can carry.
    pub const fn max_payload(self) -> usize {
        match self {
            Framing::Network => NET_MAX_DATA_LENGTH,
            Framing::Serial => SERIAL_MAX_PACKET_SIZE - self.overhead(),
        }
    }

    pub fn encode(self, packet: &Packet) -> Result<Vec<u8>> {
        let len = packet.payload.len();
        if len > self.max_payload() {
            return Err(Error::PacketTooLarge {
                len: len + self.overhead(),
                max: self.max_payload() + self.overhead(),
            });
        }

        let mut buf = vec![0u8; len + self.overhead()];
        match self {
            Framing::Network => {
                buf[0] = START_FRAME_BYTE;
                buf[1] = packet.flags.0;
                buf[2] = packet.kind.to_byte();
                buf.pwrite_with(len as u16, 3, BE)?;
                buf[5..].copy_from_slice(&packet.payload);
            }
            Framing::Serial => {
                let total = buf.len();
                buf.pwrite_with(total as u16, 0, BE)?;
                buf[2] = packet.kind.to_byte();
                buf[3..3 + len].copy_from_slice(&packet.payload);
                let crc = CRC32.checksum(&buf[..total - CRC_SIZE]);
                buf.pwrite_with(crc, total - CRC_SIZE, BE)?;
            }
        }
        Ok(buf)
    }

    /// Total frame length announced by a header of `header_len()` bytes.
    pub fn frame_len(self, header: &[u8]) -> Result<usize> {
        if header.len() < self.header_len() {
            return Err(Error::MalformedPacket(format!(
                "header is {} bytes, expected {}",
                header.len(),
                self.header_len()
            )));
        }
        match self {
            Framing::Network => {
                if header[0] != START_FRAME_BYTE {
                    return Err(Error::MalformedPacket(format!(
                        "bad start byte 0x{:02x}",
                        header[0]
                    )));
                }
                let len = header.pread_with::<u16>(3, BE)? as usize;
                Ok(self.header_len() + len)
            }
            Framing::Serial => {
                let total = header.pread_with::<u16>(0, BE)? as usize;
                if total < self.overhead() {
                    return Err(Error::MalformedPacket(format!(
                        "declared length {} is shorter than the frame overhead",
                        total
                    )));
                }
                Ok(total)
            }
        }
    }

    pub fn decode(self, raw: &[u8]) -> Result<Packet> {
        if raw.len() < self.overhead() {
            return Err(Error::MalformedPacket(format!(
                "{} bytes is less than the {} byte frame overhead",
                raw.len(),
                self.overhead()
            )));
        }
        let declared = self.frame_len(raw)?;
        if declared != raw.len() {
            return Err(Error::MalformedPacket(format!(
                "declared frame length {} but received {} bytes",
                declared,
                raw.len()
            )));
        }

        let (flags, type_byte, payload) = match self {
            Framing::Network => (Flags(raw[1]), raw[2], &raw[5..]),
            Framing::Serial => {
                let body = raw.len() - CRC_SIZE;
                let expected = raw.pread_with::<u32>(body, BE)?;
                let actual = CRC32.checksum(&raw[..body]);
                if expected != actual {
                    return Err(Error::MalformedPacket(format!(
                        "CRC mismatch: frame says 0x{:08x}, computed 0x{:08x}",
                        expected, actual
                    )));
                }
                (Flags::default(), raw[2], &raw[3..body])
            }
        };
        let kind = PacketType::from_byte(type_byte).ok_or_else(|| {
            Error::MalformedPacket(format!("unknown packet type 0x{:02x}", type_byte))
        })?;

        Ok(Packet {
            kind,
            flags,
            payload: payload.to_vec(),
        })
    }
}

/// Requests the host sends to the programmer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Put the bridge into programmer mode.
    ProgrammerInit { programmer: u8 },
    /// Chip-specific patterns, delays and the program-enable instruction.
    LoadMcuInfo { payload: Vec<u8> },
    /// A raw 4-byte ISP instruction.
    Isp([u8; 4]),
    /// Load `data` at `address`: words for flash, bytes for EEPROM.
    ProgramMemory {
        address: u32,
        memory: u8,
        data: Vec<u8>,
    },
    ReadMemory { memory: u8, address: u32, len: u32 },
    Stop,
    CloseConnection,
    /// Switch the bridge into UART passthrough.
    UartInit,
    /// Baudrate, parity, data bits and stop bits selectors.
    UartConfigure([u8; 4]),
    UartData(Vec<u8>),
    UartStop,
}

impl Command {
    /// Reply type the firmware answers this command with.
    pub const fn reply_type(&self) -> Option<PacketType> {
        match self {
            Command::ProgrammerInit { .. } => Some(PacketType::Ack),
            Command::LoadMcuInfo { .. } => Some(PacketType::Cmd),
            Command::Isp(_) => Some(PacketType::Cmd),
            Command::ProgramMemory { .. } => Some(PacketType::Ack),
            Command::ReadMemory { .. } => Some(PacketType::Memory),
            Command::Stop => Some(PacketType::Ack),
            Command::CloseConnection => None,
            Command::UartInit | Command::UartConfigure(_) | Command::UartStop => {
                Some(PacketType::Ack)
            }
            Command::UartData(_) => None,
        }
    }

    pub fn into_packet(self) -> Result<Packet> {
        let packet = match self {
            Command::ProgrammerInit { programmer } => {
                Packet::new(PacketType::ProgrammerInit, vec![programmer])
            }
            Command::LoadMcuInfo { payload } => Packet::new(PacketType::LoadMcuInfo, payload),
            Command::Isp(raw) => Packet::new(PacketType::Cmd, raw.to_vec()),
            Command::ProgramMemory {
                address,
                memory,
                data,
            } => {
                // ADDR, MEM, DATA
                let mut buf = vec![0u8; layout::PROGRAM_MEMORY_HEADER + data.len()];
                buf.pwrite_with(address, 0, BE)?;
                buf[4] = memory;
                buf[5..].copy_from_slice(&data);
                Packet::new(PacketType::ProgramMemory, buf)
            }
            Command::ReadMemory {
                memory,
                address,
                len,
            } => {
                // MEM, ADDR, LEN
                let mut buf = [0u8; layout::READ_MEMORY_REQUEST];
                buf[0] = memory;
                buf.pwrite_with(address, 1, BE)?;
                buf.pwrite_with(len, 5, BE)?;
                Packet::new(PacketType::ReadMemory, buf.to_vec())
            }
            Command::Stop => Packet::empty(PacketType::ProgrammerStop),
            Command::CloseConnection => Packet::empty(PacketType::CloseConnection),
            Command::UartInit => Packet::empty(PacketType::UartInit),
            Command::UartConfigure(config) => {
                Packet::new(PacketType::UartConfiguration, config.to_vec())
            }
            Command::UartData(data) => Packet::new(PacketType::UartData, data),
            Command::UartStop => Packet::empty(PacketType::UartStop),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_table_is_reversible() {
        for t in PacketType::ALL {
            assert_eq!(PacketType::from_byte(t.to_byte()), Some(t));
        }
        assert_eq!(PacketType::from_byte(0x00), None);
        assert_eq!(PacketType::from_byte(0x25), None);
    }

    #[test]
    fn test_uart_commands() {
        let packet = Command::UartConfigure([0xc7, 0xc2, 0xc3, 0xc5])
            .into_packet()
            .unwrap();
        assert_eq!(packet.kind, PacketType::UartConfiguration);
        assert_eq!(packet.payload, [0xc7, 0xc2, 0xc3, 0xc5]);
        assert_eq!(
            Command::UartStop.into_packet().unwrap().kind,
            PacketType::UartStop
        );
        assert_eq!(Command::UartInit.reply_type(), Some(PacketType::Ack));
        assert_eq!(Command::UartData(vec![0x55]).reply_type(), None);
    }

    #[test]
    fn test_packet_groups() {
        assert_eq!(PacketType::Ack.group(), PacketGroup::Control);
        assert_eq!(PacketType::Cmd.group(), PacketGroup::Programmer);
        assert_eq!(PacketType::UartData.group(), PacketGroup::Uart);
    }

    #[test]
    fn test_network_frame_layout() {
        let raw = Framing::Network
            .encode(&Packet::new(PacketType::Cmd, vec![0xac, 0x53, 0x00, 0x00]))
            .unwrap();
        assert_eq!(raw, [0x1b, 0x00, 0x24, 0x00, 0x04, 0xac, 0x53, 0x00, 0x00]);
    }

    #[test]
    fn test_serial_frame_layout() {
        let raw = Framing::Serial
            .encode(&Packet::new(PacketType::Ack, vec![0x01]))
            .unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(&raw[..4], &[0x00, 0x08, 0x15, 0x01]);
        let crc = CRC32.checksum(&raw[..4]);
        assert_eq!(&raw[4..], &crc.to_be_bytes());
    }

    #[test]
    fn test_roundtrip_every_type() {
        for framing in [Framing::Network, Framing::Serial] {
            for t in PacketType::ALL {
                for len in [0, 1, framing.max_payload()] {
                    let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
                    let raw = framing.encode(&Packet::new(t, payload.clone())).unwrap();
                    let packet = framing.decode(&raw).unwrap();
                    assert_eq!(packet.kind, t);
                    assert_eq!(packet.payload, payload);
                }
            }
        }
    }

    #[test]
    fn test_flags_survive_network_roundtrip() {
        let mut packet = Packet::empty(PacketType::Ack);
        packet.flags.set_sign(true);
        let raw = Framing::Network.encode(&packet).unwrap();
        assert_eq!(raw[1], 0b100);
        let decoded = Framing::Network.decode(&raw).unwrap();
        assert!(decoded.flags.sign());
        assert!(!decoded.flags.compression());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        for framing in [Framing::Network, Framing::Serial] {
            let ok = Packet::new(PacketType::Memory, vec![0; framing.max_payload()]);
            assert!(framing.encode(&ok).is_ok());
            let too_big = Packet::new(PacketType::Memory, vec![0; framing.max_payload() + 1]);
            assert!(matches!(
                framing.encode(&too_big),
                Err(Error::PacketTooLarge { .. })
            ));
        }
        assert_eq!(Framing::Network.max_payload(), 1029);
        assert_eq!(Framing::Serial.max_payload() + Framing::Serial.overhead(), 300);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(matches!(
            Framing::Network.decode(&[0x1b, 0x00, 0x15]),
            Err(Error::MalformedPacket(_))
        ));
        assert!(matches!(
            Framing::Serial.decode(&[0x00, 0x07, 0x15]),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut raw = Framing::Network
            .encode(&Packet::new(PacketType::Memory, vec![1, 2, 3]))
            .unwrap();
        raw.pop();
        assert!(matches!(
            Framing::Network.decode(&raw),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut raw = Framing::Serial
            .encode(&Packet::new(PacketType::Memory, vec![1, 2, 3]))
            .unwrap();
        raw[3] ^= 0xff;
        assert!(matches!(
            Framing::Serial.decode(&raw),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let raw = [0x1b, 0x00, 0x99, 0x00, 0x00];
        assert!(matches!(
            Framing::Network.decode(&raw),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_program_memory_shape() {
        let packet = Command::ProgramMemory {
            address: 0x0001_0203,
            memory: 0x01,
            data: vec![0xaa, 0xbb],
        }
        .into_packet()
        .unwrap();
        assert_eq!(packet.kind, PacketType::ProgramMemory);
        assert_eq!(packet.payload, [0x00, 0x01, 0x02, 0x03, 0x01, 0xaa, 0xbb]);
    }

    #[test]
    fn test_read_memory_shape() {
        let packet = Command::ReadMemory {
            memory: 0x00,
            address: 0x40,
            len: 1024,
        }
        .into_packet()
        .unwrap();
        assert_eq!(packet.kind, PacketType::ReadMemory);
        assert_eq!(
            packet.payload,
            [0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x04, 0x00]
        );
    }
}
