//! Chip programming session.

use std::{thread::sleep, time::Duration};

use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::{AVR_PROGRAMMER_BYTE, CHIP_ERASE_DELAY, DEFAULT_READ_TIMEOUT, DEFAULT_TIMEOUT};
use crate::device::{Chip, FlashLayout, FuseKind};
use crate::error::{Error, Result};
use crate::memory::{self, Chunk, Memory, MemoryImage};
use crate::pattern::Pattern;
use crate::protocol::{Command, Packet, PacketType};
use crate::transport::Transport;

/// Session states. Every operation starts and ends in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Initialized,
    Ready,
    Erasing,
    Programming,
    FuseOp,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reply timeout of control and programming requests
    pub timeout: Duration,
    /// Reply timeout of bulk memory reads
    pub read_timeout: Duration,
    /// Draw progress bars on the terminal
    pub progress: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            progress: true,
        }
    }
}

/// What a programmer can do with the chip behind it.
pub trait Programmer {
    /// Enter programming mode and check the device signature.
    fn init(&mut self) -> Result<()>;
    fn erase(&mut self) -> Result<()>;
    fn burn_memory(&mut self, memory: Memory, image: &MemoryImage) -> Result<()>;
    /// Dump the whole memory, starting at address 0.
    fn read_memory(&mut self, memory: Memory) -> Result<Vec<u8>>;
    /// Write a fuse and return the value read back.
    fn write_fuse(&mut self, fuse: FuseKind, value: u8) -> Result<u8>;
    fn read_fuse(&mut self, fuse: FuseKind) -> Result<u8>;
    /// Leave programming mode. Safe to call more than once.
    fn stop(&mut self) -> Result<()>;
}

pub struct Flashing<T: Transport> {
    transport: T,
    chip: Chip,
    config: SessionConfig,
    state: State,
}

/// Chip-specific init payload: patterns, settle delays, program enable.
pub fn mcu_info_payload(chip: &Chip) -> Result<Vec<u8>> {
    fn push_pattern(buf: &mut Vec<u8>, pattern: &Pattern) -> Result<()> {
        let text = pattern.compact();
        let len = u8::try_from(text.len()).map_err(|_| {
            Error::InternalError(format!("pattern {} is too long to send", pattern))
        })?;
        buf.push(len);
        buf.extend_from_slice(text.as_bytes());
        Ok(())
    }

    let (write_lo, write_hi, flash_wait) = match &chip.flash.layout {
        FlashLayout::Paged {
            load_lo, load_hi, ..
        } => (load_lo, load_hi, 0),
        FlashLayout::Unpaged {
            write_delay_ms,
            write_lo,
            write_hi,
        } => (write_lo, write_hi, *write_delay_ms),
    };

    let mut buf = Vec::new();
    push_pattern(&mut buf, write_lo)?;
    push_pattern(&mut buf, write_hi)?;
    push_pattern(&mut buf, &chip.flash.read_lo)?;
    push_pattern(&mut buf, &chip.flash.read_hi)?;
    buf.push(flash_wait);
    push_pattern(&mut buf, &chip.eeprom.write)?;
    push_pattern(&mut buf, &chip.eeprom.read)?;
    buf.push(chip.eeprom_write_delay_ms());
    buf.extend_from_slice(&chip.pgm_enable.compile(0)?);
    Ok(buf)
}

impl<T: Transport> Flashing<T> {
    pub fn new(transport: T, chip: Chip, config: SessionConfig) -> Self {
        Flashing {
            transport,
            chip,
            config,
            state: State::Idle,
        }
    }

    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn dump_info(&self) {
        log::info!(
            "Chip: {} (Flash: {}B{}, EEPROM: {}B)",
            self.chip,
            self.chip.flash.size,
            match self.chip.flash.layout {
                FlashLayout::Paged {
                    page_size,
                    num_pages,
                    ..
                } => format!(" in {} pages of {}B", num_pages, page_size),
                FlashLayout::Unpaged { .. } => String::new(),
            },
            self.chip.eeprom.size
        );
    }

    /// Send `cmd` and check the reply type.
    fn request(&mut self, cmd: Command, timeout: Duration) -> Result<Packet> {
        let expected = cmd.reply_type().ok_or_else(|| {
            Error::InternalError(format!("{:?} has no reply to wait for", cmd))
        })?;
        let reply = self.transport.transfer(cmd, timeout)?;
        check_reply(reply, expected)
    }

    fn isp(&mut self, cmd: [u8; 4]) -> Result<Packet> {
        let timeout = self.config.timeout;
        self.request(Command::Isp(cmd), timeout)
    }

    fn require(&self, state: State, op: &str) -> Result<()> {
        if self.state != state {
            return Err(Error::InternalError(format!(
                "cannot {} in state {:?}",
                op, self.state
            )));
        }
        Ok(())
    }

    /// Run `op`; on failure leave programming mode before handing the error on.
    fn guarded<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        match op(self) {
            Ok(r) => Ok(r),
            Err(e) => {
                log::debug!("Operation failed in state {:?}: {}", self.state, e);
                if let Err(stop_err) = self.teardown() {
                    log::warn!("Stopping programmer failed: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        if self.state == State::Stopped {
            return Ok(());
        }
        let timeout = self.config.timeout;
        let result = self.request(Command::Stop, timeout).map(|_| ());
        self.state = State::Stopped;
        result
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }

    pub fn init_programmer(&mut self) -> Result<()> {
        self.require(State::Idle, "initialize programmer")?;
        let timeout = self.config.timeout;
        self.request(
            Command::ProgrammerInit {
                programmer: AVR_PROGRAMMER_BYTE,
            },
            timeout,
        )?;

        let payload = mcu_info_payload(&self.chip)?;
        let reply = self.request(Command::LoadMcuInfo { payload }, timeout)?;
        if reply.payload.first().copied().unwrap_or(0) == 0 {
            return Err(Error::DeviceError("cannot enter programming mode".into()));
        }
        self.state = State::Initialized;
        log::info!("Programmer initialized");
        Ok(())
    }

    pub fn read_signature(&mut self) -> Result<[u8; 3]> {
        let mut signature = [0u8; 3];
        for (i, byte) in signature.iter_mut().enumerate() {
            let cmd = self.chip.read_signature.compile(i as u32)?;
            *byte = self.isp(cmd)?.cmd_output()?;
        }
        Ok(signature)
    }

    pub fn validate_signature(&mut self) -> Result<()> {
        self.require(State::Initialized, "validate signature")?;
        let signature = self.read_signature()?;
        if signature != self.chip.signature {
            return Err(Error::DeviceError(format!(
                "wrong device signature {}, expected {} for {}",
                hex::encode(signature),
                hex::encode(self.chip.signature),
                self.chip.name
            )));
        }
        log::info!(
            "Device signature is: 0x{:02x} 0x{:02x} 0x{:02x}",
            signature[0],
            signature[1],
            signature[2]
        );
        self.state = State::Ready;
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.require(State::Ready, "erase")?;
        self.state = State::Erasing;
        let cmd = self.chip.chip_erase.compile(0)?;
        self.transport
            .send_packet(&Command::Isp(cmd).into_packet()?)?;
        sleep(CHIP_ERASE_DELAY);
        let reply = self.transport.recv_packet(self.config.timeout)?;
        check_reply(reply, PacketType::Cmd)?;
        self.state = State::Ready;
        log::info!("Chip erased");
        Ok(())
    }

    fn program_chunk(&mut self, memory: Memory, chunk: Chunk) -> Result<()> {
        let timeout = self.config.timeout;
        self.request(
            Command::ProgramMemory {
                address: chunk.address,
                memory: memory.selector(),
                data: chunk.data,
            },
            timeout,
        )?;
        Ok(())
    }

    fn burn(&mut self, memory: Memory, image: &MemoryImage) -> Result<()> {
        self.require(State::Ready, "program memory")?;
        if image.is_empty() {
            log::warn!("Nothing to write to {}", memory);
            return Ok(());
        }
        self.state = State::Programming;
        let max_payload = self.transport.framing().max_payload();
        let pb = self.progress_bar(image.len() as u64);

        match (memory, self.chip.flash.layout.clone()) {
            (
                Memory::Flash,
                FlashLayout::Paged {
                    page_size,
                    write_page,
                    ..
                },
            ) => {
                let pages = memory::plan_paged(image, self.chip.flash.size, page_size, max_payload)?;
                log::debug!("Writing {} flash pages", pages.len());
                for page in pages {
                    for chunk in page.chunks {
                        let len = chunk.data.len() as u64;
                        self.program_chunk(memory, chunk)?;
                        pb.inc(len);
                    }
                    let cmd = write_page.compile(page.page_address)?;
                    self.isp(cmd)?;
                }
            }
            (Memory::Flash, FlashLayout::Unpaged { .. }) | (Memory::Eeprom, _) => {
                let size = match memory {
                    Memory::Flash => self.chip.flash.size,
                    Memory::Eeprom => self.chip.eeprom.size,
                };
                for chunk in memory::plan_unpaged(image, memory, size, max_payload)? {
                    let len = chunk.data.len() as u64;
                    self.program_chunk(memory, chunk)?;
                    pb.inc(len);
                }
            }
        }
        pb.finish_and_clear();

        self.state = State::Ready;
        log::info!("Wrote {} bytes to {}", image.len(), memory);
        Ok(())
    }

    fn dump(&mut self, memory: Memory) -> Result<Vec<u8>> {
        self.require(State::Ready, "read memory")?;
        self.state = State::Programming;
        let size = match memory {
            Memory::Flash => self.chip.flash.size,
            Memory::Eeprom => self.chip.eeprom.size,
        };
        let max_payload = self.transport.framing().max_payload();
        let pb = self.progress_bar(size as u64);

        let mut buffer = Vec::with_capacity(size as usize);
        let timeout = self.config.read_timeout;
        for request in memory::plan_read(memory, size, max_payload)? {
            let reply = self.request(
                Command::ReadMemory {
                    memory: memory.selector(),
                    address: request.address,
                    len: request.len,
                },
                timeout,
            )?;
            if reply.payload.len() != request.len as usize {
                return Err(Error::MalformedPacket(format!(
                    "asked for {} bytes of {} at 0x{:04x}, got {}",
                    request.len,
                    memory,
                    request.address,
                    reply.payload.len()
                )));
            }
            buffer.extend_from_slice(&reply.payload);
            pb.set_position(buffer.len() as u64);
        }
        pb.finish_and_clear();

        self.state = State::Ready;
        log::info!("Read {} bytes of {}", buffer.len(), memory);
        Ok(buffer)
    }

    /// Read `memory` back and compare every cell of `image`.
    pub fn verify(&mut self, memory: Memory, image: &MemoryImage) -> Result<()> {
        self.guarded(|s| {
            let dump = s.dump(memory)?;
            memory::verify_image(memory, image, &dump)?;
            log::info!("Verified {} bytes of {}", image.len(), memory);
            Ok(())
        })
    }

    fn fuse_patterns(&self, fuse: FuseKind) -> Result<(Pattern, Pattern)> {
        self.chip
            .fuse(fuse)
            .map(|f| (f.read.clone(), f.write.clone()))
            .ok_or_else(|| {
                Error::DeviceError(format!("{} is not available on {}", fuse, self.chip.name))
            })
    }

    fn fuse_read(&mut self, fuse: FuseKind) -> Result<u8> {
        self.require(State::Ready, "read fuse")?;
        let (read, _) = self.fuse_patterns(fuse)?;
        self.state = State::FuseOp;
        let value = self.isp(read.compile(0)?)?.cmd_output()?;
        self.state = State::Ready;
        log::info!("{} is 0x{:02x}", fuse, value);
        Ok(value)
    }

    fn fuse_write(&mut self, fuse: FuseKind, value: u8) -> Result<u8> {
        self.require(State::Ready, "write fuse")?;
        let (read, write) = self.fuse_patterns(fuse)?;
        self.state = State::FuseOp;
        log::info!("Write {} 0x{:02x}", fuse, value);
        self.isp(write.compile_with_data(0, value)?)?;
        let actual = self.isp(read.compile(0)?)?.cmd_output()?;
        if actual != value {
            return Err(Error::HardwareError(format!(
                "wrong {} was written: 0x{:02x} != 0x{:02x}",
                fuse, value, actual
            )));
        }
        self.state = State::Ready;
        Ok(actual)
    }
}

/// Turn error replies into errors and check the reply type.
pub(crate) fn check_reply(reply: Packet, expected: PacketType) -> Result<Packet> {
    if reply.kind == PacketType::Error && expected != PacketType::Error {
        return Err(Error::DeviceError(format!(
            "programmer reported an error: {}",
            hex::encode(&reply.payload)
        )));
    }
    if reply.kind != expected {
        return Err(Error::WrongPacket {
            expected,
            got: reply.kind,
        });
    }
    Ok(reply)
}

impl<T: Transport> Programmer for Flashing<T> {
    fn init(&mut self) -> Result<()> {
        self.guarded(|s| {
            s.init_programmer()?;
            s.validate_signature()
        })
    }

    fn erase(&mut self) -> Result<()> {
        self.guarded(|s| s.erase_chip())
    }

    fn burn_memory(&mut self, memory: Memory, image: &MemoryImage) -> Result<()> {
        self.guarded(|s| s.burn(memory, image))
    }

    fn read_memory(&mut self, memory: Memory) -> Result<Vec<u8>> {
        self.guarded(|s| s.dump(memory))
    }

    fn write_fuse(&mut self, fuse: FuseKind, value: u8) -> Result<u8> {
        self.guarded(|s| s.fuse_write(fuse, value))
    }

    fn read_fuse(&mut self, fuse: FuseKind) -> Result<u8> {
        self.guarded(|s| s.fuse_read(fuse))
    }

    fn stop(&mut self) -> Result<()> {
        if self.state == State::Stopped {
            return Ok(());
        }
        self.teardown()?;
        log::info!("Programmer stopped");
        Ok(())
    }
}

impl<T: Transport> Drop for Flashing<T> {
    fn drop(&mut self) {
        if matches!(self.state, State::Idle | State::Stopped) {
            return;
        }
        if let Err(e) = self.teardown() {
            log::warn!("Stopping programmer failed: {}", e);
        }
    }
}
