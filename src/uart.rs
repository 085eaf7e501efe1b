//! UART passthrough: the bridge forwards the target's serial output.
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::ValueEnum;

use crate::constants::uart;
use crate::error::{Error, Result};
use crate::flashing::check_reply;
use crate::protocol::{Command, Packet, PacketType};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum UartBaudrate {
    #[default]
    #[value(name = "9600")]
    Baud9600,
    #[value(name = "19200")]
    Baud19200,
    #[value(name = "38400")]
    Baud38400,
    #[value(name = "57600")]
    Baud57600,
    #[value(name = "74880")]
    Baud74880,
    #[value(name = "115200")]
    Baud115200,
}

impl UartBaudrate {
    const fn selector(self) -> u8 {
        match self {
            UartBaudrate::Baud9600 => uart::BAUDRATE_9600,
            UartBaudrate::Baud19200 => uart::BAUDRATE_19200,
            UartBaudrate::Baud38400 => uart::BAUDRATE_38400,
            UartBaudrate::Baud57600 => uart::BAUDRATE_57600,
            UartBaudrate::Baud74880 => uart::BAUDRATE_74880,
            UartBaudrate::Baud115200 => uart::BAUDRATE_115200,
        }
    }

    pub const fn bits_per_second(self) -> u32 {
        match self {
            UartBaudrate::Baud9600 => 9600,
            UartBaudrate::Baud19200 => 19200,
            UartBaudrate::Baud38400 => 38400,
            UartBaudrate::Baud57600 => 57600,
            UartBaudrate::Baud74880 => 74880,
            UartBaudrate::Baud115200 => 115200,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Parity {
    #[default]
    #[value(alias = "n")]
    None,
    #[value(alias = "e")]
    Even,
    #[value(alias = "o")]
    Odd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DataBits {
    #[default]
    #[value(name = "8")]
    Eight,
    #[value(name = "9")]
    Nine,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StopBits {
    #[default]
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
}

/// Line settings of the target UART. Defaults to 9600 8N1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UartConfig {
    pub baudrate: UartBaudrate,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl UartConfig {
    /// Payload of the configuration packet.
    pub fn to_bytes(&self) -> [u8; uart::CONFIG_LEN] {
        let mut raw = [0u8; uart::CONFIG_LEN];
        raw[uart::BAUDRATE_OFFSET] = self.baudrate.selector();
        raw[uart::PARITY_OFFSET] = match self.parity {
            Parity::None => uart::PARITY_NONE,
            Parity::Even => uart::PARITY_EVEN,
            Parity::Odd => uart::PARITY_ODD,
        };
        raw[uart::DATA_BITS_OFFSET] = match self.data_bits {
            DataBits::Eight => uart::DATA_BITS_8,
            DataBits::Nine => uart::DATA_BITS_9,
        };
        raw[uart::STOP_BITS_OFFSET] = match self.stop_bits {
            StopBits::One => uart::STOP_BITS_1,
            StopBits::Two => uart::STOP_BITS_2,
        };
        raw
    }
}

impl fmt::Display for UartConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        let data_bits = match self.data_bits {
            DataBits::Eight => 8,
            DataBits::Nine => 9,
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        write!(
            f,
            "{} {}{}{}",
            self.baudrate.bits_per_second(),
            data_bits,
            parity,
            stop_bits
        )
    }
}

/// Error reported by the bridge while in passthrough.
fn uart_error(payload: &[u8]) -> Error {
    let reason = match payload.first() {
        Some(&uart::PARITY_ERROR) => "parity error".to_string(),
        Some(&uart::FRAME_ERROR) => "frame error".to_string(),
        Some(&uart::DATA_BITS_ERROR) => "unsupported data bits".to_string(),
        Some(&uart::STOP_BITS_ERROR) => "unsupported stop bits".to_string(),
        Some(&uart::BAUDRATE_ERROR) => "unsupported baudrate".to_string(),
        _ => format!("error {}", hex::encode(payload)),
    };
    Error::DeviceError(format!("UART {}", reason))
}

/// The bridge in UART passthrough mode. Leaves passthrough when dropped.
pub struct UartSession<T: Transport> {
    transport: T,
    timeout: Duration,
    active: bool,
}

impl<T: Transport> UartSession<T> {
    /// Enter passthrough and configure the line.
    pub fn open(transport: T, config: UartConfig, timeout: Duration) -> Result<Self> {
        let mut session = UartSession {
            transport,
            timeout,
            active: false,
        };
        session.request(Command::UartInit)?;
        session.active = true;
        session.request(Command::UartConfigure(config.to_bytes()))?;
        log::info!("UART passthrough at {}", config);
        Ok(session)
    }

    fn request(&mut self, cmd: Command) -> Result<Packet> {
        let expected = cmd.reply_type().ok_or_else(|| {
            Error::InternalError(format!("{:?} has no reply to wait for", cmd))
        })?;
        let reply = self.transport.transfer(cmd, self.timeout)?;
        if reply.kind == PacketType::Error {
            return Err(uart_error(&reply.payload));
        }
        check_reply(reply, expected)
    }

    /// Copy received data to `out` until `running` is cleared.
    ///
    /// Returns the number of bytes forwarded.
    pub fn forward<W: Write>(
        &mut self,
        out: &mut W,
        running: &AtomicBool,
        poll: Duration,
    ) -> Result<u64> {
        let mut forwarded = 0u64;
        while running.load(Ordering::SeqCst) {
            let packet = match self.transport.recv_packet(poll) {
                Ok(packet) => packet,
                Err(Error::Timeout(_)) => continue,
                Err(e) => return Err(e),
            };
            match packet.kind {
                PacketType::UartData => {
                    out.write_all(&packet.payload)?;
                    out.flush()?;
                    forwarded += packet.payload.len() as u64;
                }
                PacketType::Error => return Err(uart_error(&packet.payload)),
                got => {
                    return Err(Error::WrongPacket {
                        expected: PacketType::UartData,
                        got,
                    });
                }
            }
        }
        Ok(forwarded)
    }

    /// Leave passthrough. Further calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.request(Command::UartStop)?;
        log::debug!("UART passthrough stopped");
        Ok(())
    }
}

impl<T: Transport> Drop for UartSession<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Leaving UART passthrough failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_9600_8n1() {
        let config = UartConfig::default();
        assert_eq!(config.to_bytes(), [0xc7, 0xc2, 0xc3, 0xc5]);
        assert_eq!(config.to_string(), "9600 8N1");
    }

    #[test]
    fn test_config_bytes() {
        let config = UartConfig {
            baudrate: UartBaudrate::Baud115200,
            parity: Parity::Even,
            data_bits: DataBits::Nine,
            stop_bits: StopBits::Two,
        };
        assert_eq!(config.to_bytes(), [0xcc, 0xc0, 0xc4, 0xc6]);
        assert_eq!(config.to_string(), "115200 9E2");
    }

    #[test]
    fn test_parse_line_settings() {
        assert_eq!(
            UartBaudrate::from_str("74880", false).unwrap(),
            UartBaudrate::Baud74880
        );
        assert_eq!(Parity::from_str("o", false).unwrap(), Parity::Odd);
        assert_eq!(StopBits::from_str("2", false).unwrap(), StopBits::Two);
        assert!(UartBaudrate::from_str("4800", false).is_err());
    }

    #[test]
    fn test_uart_error_names() {
        assert!(matches!(
            uart_error(&[0xe1]),
            Error::DeviceError(ref m) if m == "UART frame error"
        ));
        assert!(matches!(
            uart_error(&[0x42]),
            Error::DeviceError(ref m) if m == "UART error 42"
        ));
    }
}
