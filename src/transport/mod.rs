//! Abstract programmer bridge transport interface.
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{Command, Framing, Packet};

pub use self::net::{discover, NetTransport};
pub use self::serial::{Baudrate, SerialTransport};

mod net;
mod serial;

/// Abstraction of the link to the programmer bridge.
/// Might be a TCP connection or a serial port.
pub trait Transport {
    /// Frame layout spoken on this link.
    fn framing(&self) -> Framing;

    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    /// Next whole frame, waiting at most `timeout`.
    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>>;
    /// Whether a frame can be received without blocking.
    fn packet_waiting(&mut self) -> bool;

    /// Release the link. Further calls fail.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let raw = self.framing().encode(packet)?;
        log::debug!("=> {}", hex::encode(&raw));
        self.send_raw(&raw)
    }

    fn recv_packet(&mut self, timeout: Duration) -> Result<Packet> {
        let raw = self.recv_raw(timeout)?;
        log::debug!("<= {}", hex::encode(&raw));
        self.framing().decode(&raw)
    }

    /// Send `cmd` and wait for the next packet, whatever its type.
    fn transfer(&mut self, cmd: Command, timeout: Duration) -> Result<Packet> {
        let packet = cmd.into_packet()?;
        self.send_packet(&packet)?;
        self.recv_packet(timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn framing(&self) -> Framing {
        (**self).framing()
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        (**self).recv_raw(timeout)
    }

    fn packet_waiting(&mut self) -> bool {
        (**self).packet_waiting()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
