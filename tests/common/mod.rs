//! A simulated programmer bridge with an AVR attached.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

use netprog::device::FlashLayout;
use netprog::protocol::Framing;
use netprog::{Chip, ChipDB, Error, Flashing, Packet, PacketType, Result, SessionConfig, Transport};

static INIT_LOGGER: Once = Once::new();

pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = simplelog::TestLogger::init(
            simplelog::LevelFilter::Debug,
            simplelog::Config::default(),
        );
    });
}

pub fn chip(part: &str) -> Chip {
    ChipDB::load().unwrap().find_chip(part).unwrap()
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        timeout: Duration::from_millis(20),
        read_timeout: Duration::from_millis(20),
        progress: false,
    }
}

/// Device state as the firmware would see it.
pub struct SimDevice {
    pub signature: [u8; 3],
    /// Answer to the chip-specific init, non-zero when programming mode was entered
    pub enter_mode: bool,
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    /// Byte address to value, latched by program-memory packets on paged parts
    pub page_buffer: BTreeMap<u32, u8>,
    pub fuses: HashMap<&'static str, u8>,
    /// ANDed into every fuse value the device stores
    pub fuse_mask: u8,
    /// Reply sent instead of the regular one, once, to a request of that type
    pub override_reply: Option<(PacketType, Packet)>,
    /// Never answer
    pub silent: bool,
    /// Every request received, in order
    pub requests: Vec<Packet>,
    /// Pages committed by write-page instructions, by first word address
    pub committed_pages: Vec<u32>,
    /// Line settings of the passthrough, once configured
    pub uart_config: Option<[u8; 4]>,
    pub uart_active: bool,
    /// Packets pushed to the host without a request, e.g. UART data
    pub unsolicited: VecDeque<Packet>,

    page_words: Option<u32>,
    write_page: HashMap<[u8; 4], u32>,
    fuse_reads: HashMap<[u8; 4], &'static str>,
    fuse_writes: HashMap<[u8; 2], &'static str>,
}

impl SimDevice {
    pub fn new(chip: &Chip) -> Self {
        let (page_words, write_page) = match &chip.flash.layout {
            FlashLayout::Paged {
                page_size,
                num_pages,
                write_page,
                ..
            } => {
                let words = page_size / 2;
                let table = (0..*num_pages)
                    .map(|p| (write_page.compile(p * words).unwrap(), p * words))
                    .collect();
                (Some(words), table)
            }
            FlashLayout::Unpaged { .. } => (None, HashMap::new()),
        };

        let mut fuse_reads = HashMap::new();
        let mut fuse_writes = HashMap::new();
        for (name, fuse) in [
            ("lfuse", &chip.lfuse),
            ("hfuse", &chip.hfuse),
            ("efuse", &chip.efuse),
            ("lock", &chip.lock),
        ] {
            if let Some(fuse) = fuse {
                fuse_reads.insert(fuse.read.compile(0).unwrap(), name);
                let w = fuse.write.compile(0).unwrap();
                fuse_writes.insert([w[0], w[1]], name);
            }
        }

        SimDevice {
            signature: chip.signature,
            enter_mode: true,
            flash: vec![0xff; chip.flash.size as usize],
            eeprom: vec![0xff; chip.eeprom.size as usize],
            page_buffer: BTreeMap::new(),
            fuses: HashMap::from([
                ("lfuse", 0x62),
                ("hfuse", 0xd9),
                ("efuse", 0xff),
                ("lock", 0xff),
            ]),
            fuse_mask: 0xff,
            override_reply: None,
            silent: false,
            requests: Vec::new(),
            committed_pages: Vec::new(),
            uart_config: None,
            uart_active: false,
            unsolicited: VecDeque::new(),
            page_words,
            write_page,
            fuse_reads,
            fuse_writes,
        }
    }

    pub fn count(&self, kind: PacketType) -> usize {
        self.requests.iter().filter(|p| p.kind == kind).count()
    }

    pub fn last_request(&self) -> Option<&Packet> {
        self.requests.last()
    }

    fn handle(&mut self, request: Packet) -> Option<Packet> {
        self.requests.push(request.clone());
        if self.silent {
            return None;
        }
        if let Some((kind, _)) = &self.override_reply {
            if *kind == request.kind {
                return self.override_reply.take().map(|(_, reply)| reply);
            }
        }

        let reply = match request.kind {
            PacketType::ProgrammerInit | PacketType::ProgrammerStop => {
                Packet::empty(PacketType::Ack)
            }
            PacketType::LoadMcuInfo => Packet::new(PacketType::Cmd, vec![self.enter_mode as u8]),
            PacketType::Cmd => {
                let cmd: [u8; 4] = request.payload.as_slice().try_into().ok()?;
                let out = self.instruction(cmd);
                Packet::new(PacketType::Cmd, vec![cmd[0], cmd[1], cmd[2], out])
            }
            PacketType::ProgramMemory => {
                self.program(&request.payload);
                Packet::empty(PacketType::Ack)
            }
            PacketType::ReadMemory => Packet::new(PacketType::Memory, self.read(&request.payload)),
            PacketType::UartInit => {
                self.uart_active = true;
                Packet::empty(PacketType::Ack)
            }
            PacketType::UartConfiguration if self.uart_active => {
                self.uart_config = request.payload.as_slice().try_into().ok();
                Packet::empty(PacketType::Ack)
            }
            PacketType::UartStop => {
                self.uart_active = false;
                Packet::empty(PacketType::Ack)
            }
            PacketType::CloseConnection => return None,
            _ => Packet::new(PacketType::Error, vec![request.kind.to_byte()]),
        };
        Some(reply)
    }

    fn instruction(&mut self, cmd: [u8; 4]) -> u8 {
        if let Some(&page) = self.write_page.get(&cmd) {
            self.commit_page(page);
            return 0;
        }
        if let Some(name) = self.fuse_reads.get(&cmd) {
            return self.fuses[name];
        }
        if let Some(&name) = self.fuse_writes.get(&[cmd[0], cmd[1]]) {
            let unused = if name == "efuse" { 0xf8 } else { 0x00 };
            self.fuses.insert(name, (cmd[3] | unused) & self.fuse_mask);
            return 0;
        }
        match cmd {
            [0x30, _, n, _] => self.signature[(n & 0x03) as usize % 3],
            [0xac, b1, _, _] if b1 & 0xe0 == 0x80 => {
                self.flash.fill(0xff);
                self.eeprom.fill(0xff);
                0
            }
            _ => 0,
        }
    }

    fn commit_page(&mut self, first_word: u32) {
        let words = self.page_words.expect("write page on an unpaged part");
        let range = first_word * 2..(first_word + words) * 2;
        for (addr, value) in std::mem::take(&mut self.page_buffer) {
            assert!(
                range.contains(&addr),
                "byte 0x{:04x} latched outside page at word 0x{:04x}",
                addr,
                first_word
            );
            self.flash[addr as usize] = value;
        }
        self.committed_pages.push(first_word);
    }

    fn program(&mut self, payload: &[u8]) {
        let address = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        let data = &payload[5..];
        match payload[4] {
            0x00 => {
                assert_eq!(data.len() % 2, 0, "flash data splits a word");
                let base = address * 2;
                for (i, &b) in data.iter().enumerate() {
                    let addr = base + i as u32;
                    if self.page_words.is_some() {
                        self.page_buffer.insert(addr, b);
                    } else {
                        self.flash[addr as usize] = b;
                    }
                }
            }
            _ => {
                let base = address as usize;
                self.eeprom[base..base + data.len()].copy_from_slice(data);
            }
        }
    }

    fn read(&self, payload: &[u8]) -> Vec<u8> {
        let address = u32::from_be_bytes(payload[1..5].try_into().unwrap()) as usize;
        let len = u32::from_be_bytes(payload[5..9].try_into().unwrap()) as usize;
        match payload[0] {
            0x00 => self.flash[address * 2..address * 2 + len].to_vec(),
            _ => self.eeprom[address..address + len].to_vec(),
        }
    }
}

/// In-memory link to a [`SimDevice`], speaking real frames.
pub struct SimTransport {
    framing: Framing,
    device: Rc<RefCell<SimDevice>>,
    outbox: VecDeque<Vec<u8>>,
}

impl SimTransport {
    pub fn new(framing: Framing, device: Rc<RefCell<SimDevice>>) -> Self {
        SimTransport {
            framing,
            device,
            outbox: VecDeque::new(),
        }
    }
}

impl Transport for SimTransport {
    fn framing(&self) -> Framing {
        self.framing
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let request = self.framing.decode(raw)?;
        if let Some(reply) = self.device.borrow_mut().handle(request) {
            self.outbox.push_back(self.framing.encode(&reply)?);
        }
        Ok(())
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if let Some(raw) = self.outbox.pop_front() {
            return Ok(raw);
        }
        let pushed = self.device.borrow_mut().unsolicited.pop_front();
        match pushed {
            Some(packet) => self.framing.encode(&packet),
            None => Err(Error::Timeout(timeout)),
        }
    }

    fn packet_waiting(&mut self) -> bool {
        !self.outbox.is_empty() || !self.device.borrow().unsolicited.is_empty()
    }
}

/// A bare link to a simulated m328p bridge.
pub fn link(framing: Framing) -> (SimTransport, Rc<RefCell<SimDevice>>) {
    init_logger();
    let device = Rc::new(RefCell::new(SimDevice::new(&chip("m328p"))));
    (SimTransport::new(framing, device.clone()), device)
}

/// A session on `part` over `framing`, plus a handle on the simulated device.
pub fn session(
    part: &str,
    framing: Framing,
) -> (Flashing<SimTransport>, Rc<RefCell<SimDevice>>) {
    init_logger();
    let chip = chip(part);
    let device = Rc::new(RefCell::new(SimDevice::new(&chip)));
    let transport = SimTransport::new(framing, device.clone());
    (Flashing::new(transport, chip, test_config()), device)
}
