//! TCP link to the bridge, plus UDP discovery of the bridge address.
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::{net, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{Command, Framing};

use super::Transport;

/// How often the receiver thread checks its stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

type Frame = Result<Vec<u8>>;

pub struct NetTransport {
    stream: TcpStream,
    frames: Option<Receiver<Frame>>,
    pending: Option<Frame>,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl NetTransport {
    pub fn connect(host: IpAddr) -> Result<Self> {
        Self::connect_to(SocketAddr::new(host, net::BRIDGE_PORT))
    }

    pub fn connect_to(addr: SocketAddr) -> Result<Self> {
        log::info!("Connecting to programmer bridge at {}", addr);
        let stream = TcpStream::connect_timeout(&addr, DEFAULT_TIMEOUT * 5)
            .map_err(|e| Error::ConnectionError(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let reader = stream.try_clone()?;
        reader.set_read_timeout(Some(POLL_INTERVAL))?;

        let (tx, frames) = mpsc::sync_channel(net::RECEIVE_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let receiver = thread::Builder::new()
            .name("netprog-rx".into())
            .spawn(move || receive_loop(reader, tx, flag))?;

        Ok(NetTransport {
            stream,
            frames: Some(frames),
            pending: None,
            stop,
            receiver: Some(receiver),
        })
    }

    fn stop_receiver(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        // unblocks a receiver waiting on a full queue
        self.frames = None;
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                log::warn!("Receiver thread panicked");
            }
            log::debug!("Receiver stopped");
        }
    }
}

/// Cut whole frames off the front of `buf`.
fn split_frames(buf: &mut Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let framing = Framing::Network;
    let mut frames = Vec::new();
    while buf.len() >= framing.header_len() {
        let len = framing.frame_len(buf)?;
        if buf.len() < len {
            break;
        }
        frames.push(buf.drain(..len).collect());
    }
    Ok(frames)
}

fn receive_loop(mut stream: TcpStream, tx: SyncSender<Frame>, stop: Arc<AtomicBool>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];
    while !stop.load(Ordering::SeqCst) {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                if !stop.load(Ordering::SeqCst) {
                    let _ = tx.send(Err(Error::ConnectionError(
                        "connection closed by bridge".into(),
                    )));
                }
                return;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                if !stop.load(Ordering::SeqCst) {
                    let _ = tx.send(Err(e.into()));
                }
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);
        match split_frames(&mut buf) {
            Ok(frames) => {
                for frame in frames {
                    if tx.send(Ok(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                // nothing after a broken header can be trusted
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

impl Transport for NetTransport {
    fn framing(&self) -> Framing {
        Framing::Network
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.stream.write_all(raw)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if let Some(frame) = self.pending.take() {
            return frame;
        }
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| Error::ConnectionError("connection closed".into()))?;
        match frames.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::ConnectionError("receiver stopped".into()))
            }
        }
    }

    fn packet_waiting(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.frames.as_ref().map(Receiver::try_recv) {
            Some(Ok(frame)) => {
                self.pending = Some(frame);
                true
            }
            Some(Err(TryRecvError::Empty | TryRecvError::Disconnected)) | None => false,
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.receiver.is_none() {
            return Ok(());
        }
        let result = Command::CloseConnection
            .into_packet()
            .and_then(|p| self.send_packet(&p));
        self.stop_receiver();
        result
    }
}

impl Drop for NetTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Closing connection failed: {}", e);
        }
    }
}

/// Ask the bridge to announce itself and return its address.
///
/// Broadcasts `[0xAD, key, port]` and waits for the single validation byte
/// on `port`, retrying a fixed number of times.
pub fn discover(key: &str, port: u16) -> Result<IpAddr> {
    if key.len() != net::OBSERVER_KEY_SIZE || !key.is_ascii() {
        return Err(Error::InvalidArgument(format!(
            "discovery key must be {} ASCII characters",
            net::OBSERVER_KEY_SIZE
        )));
    }
    let listener = UdpSocket::bind(("0.0.0.0", port))?;
    listener.set_read_timeout(Some(DEFAULT_TIMEOUT))?;

    let mut request = Vec::with_capacity(1 + net::OBSERVER_KEY_SIZE + 4);
    request.push(net::OBSERVER_CONTROL_BYTE);
    request.extend_from_slice(key.as_bytes());
    request.extend_from_slice(&(port as u32).to_be_bytes());

    for attempt in 1..=net::DISCOVERY_RETRIES {
        log::debug!("Discovery attempt {}/{}", attempt, net::DISCOVERY_RETRIES);
        let broadcaster = UdpSocket::bind(("0.0.0.0", 0))?;
        broadcaster.set_broadcast(true)?;
        broadcaster.send_to(&request, ("255.255.255.255", net::BROADCAST_PORT))?;

        let mut answer = [0u8; 1];
        match listener.recv_from(&mut answer) {
            Ok((0, _)) => continue,
            Ok((_, from)) if answer[0] == net::OBSERVER_VALIDATION_BYTE => {
                log::info!("Found programmer bridge at {}", from.ip());
                return Ok(from.ip());
            }
            Ok((_, from)) => {
                return Err(Error::ConnectionError(format!(
                    "wrong validation byte 0x{:02x} from {}",
                    answer[0], from
                )));
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::ConnectionError(
        "no programmer bridge answered the discovery broadcast".into(),
    ))
}
