//! Serial Transportation.
use std::{fmt::Display, io::Read, io::Write, time::Duration};

use clap::{builder::PossibleValue, ValueEnum};
use serialport::SerialPort;

use super::Transport;
use crate::constants::DEFAULT_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::Framing;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    Baud9600,
    Baud57600,
    #[default]
    Baud115200,
    Baud230400,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud9600 => 9600,
            Baudrate::Baud57600 => 57600,
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud230400 => 230400,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Baudrate::Baud9600,
            Baudrate::Baud57600,
            Baudrate::Baud115200,
            Baudrate::Baud230400,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud9600 => Some(PossibleValue::new("9600")),
            Baudrate::Baud57600 => Some(PossibleValue::new("57600")),
            Baudrate::Baud115200 => Some(PossibleValue::new("115200")),
            Baudrate::Baud230400 => Some(PossibleValue::new("230400")),
        }
    }
}

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let serial_port = serialport::new(port, baudrate.into())
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|e| Error::ConnectionError(format!("{}: {}", port, e)))?;
        Ok(SerialTransport { serial_port })
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.serial_port.set_timeout(timeout)?;
        self.serial_port.read_exact(buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(timeout),
            _ => e.into(),
        })
    }
}

impl Transport for SerialTransport {
    fn framing(&self) -> Framing {
        Framing::Serial
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let framing = self.framing();
        // Read the length and type, then everything the length announces
        let mut frame = vec![0u8; framing.header_len()];
        self.read_exact(&mut frame, timeout)?;
        let total = framing.frame_len(&frame)?;

        let header_len = frame.len();
        frame.resize(total, 0);
        self.read_exact(&mut frame[header_len..], timeout)?;
        Ok(frame)
    }

    fn packet_waiting(&mut self) -> bool {
        self.serial_port
            .bytes_to_read()
            .map(|n| n as usize >= self.framing().header_len())
            .unwrap_or(false)
    }
}
