//! Memory transfer engine.
//!
//! Turns a sparse [`MemoryImage`] into wire-sized program-memory chunks and
//! plans the read requests for the opposite direction. Nothing in here talks
//! to a transport, so every plan can be checked on its own.

use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{layout, memory};
use crate::error::{Error, Result};

const UNPROGRAMMED: u8 = 0xff;

/// Memory spaces reachable through program/read memory packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Memory {
    Flash,
    Eeprom,
}

impl Memory {
    /// Selector byte of program/read memory packets.
    pub const fn selector(self) -> u8 {
        match self {
            Memory::Flash => memory::FLASH,
            Memory::Eeprom => memory::EEPROM,
        }
    }

    /// Bytes per address unit at the instruction level.
    pub const fn unit(self) -> u32 {
        match self {
            Memory::Flash => 2,
            Memory::Eeprom => 1,
        }
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Memory::Flash => f.write_str("flash"),
            Memory::Eeprom => f.write_str("eeprom"),
        }
    }
}

/// Sparse byte-addressed memory contents. Unset cells are unprogrammed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    cells: BTreeMap<u32, u8>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image holding `data` contiguously from `base`.
    pub fn from_bytes(base: u32, data: &[u8]) -> Result<Self> {
        let mut image = Self::new();
        image.extend_from_slice(base, data)?;
        Ok(image)
    }

    pub fn insert(&mut self, address: u32, value: u8) {
        self.cells.insert(address, value);
    }

    /// Fails when `data` would run past the 32-bit address space.
    pub fn extend_from_slice(&mut self, base: u32, data: &[u8]) -> Result<()> {
        let overflow = || {
            Error::InvalidArgument(format!(
                "{} bytes at 0x{:08x} exceed the address space",
                data.len(),
                base
            ))
        };
        if let Some(last) = data.len().checked_sub(1) {
            let last = u32::try_from(last).map_err(|_| overflow())?;
            base.checked_add(last).ok_or_else(overflow)?;
        }
        for (offset, &value) in data.iter().enumerate() {
            self.cells.insert(base + offset as u32, value);
        }
        Ok(())
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.cells.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.cells.iter().map(|(&a, &v)| (a, v))
    }

    pub fn max_address(&self) -> Option<u32> {
        self.cells.keys().next_back().copied()
    }

    fn word(&self, word: u32) -> (Option<u8>, Option<u8>) {
        (self.get(word * 2), self.get(word * 2 + 1))
    }

    /// Fails when any cell lies beyond `size` bytes.
    pub fn check_bounds(&self, memory: Memory, size: u32) -> Result<()> {
        match self.max_address() {
            Some(addr) if addr >= size => Err(Error::InternalError(format!(
                "{} address 0x{:04x} is outside the {} byte memory",
                memory, addr, size
            ))),
            _ => Ok(()),
        }
    }
}

/// One program-memory request: start address in instruction units plus data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Contents of one flash page as it is latched into the page buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageData {
    /// Word address of the first emitted word.
    pub data_start_addr: u32,
    /// Bytes in address order, low byte of each word first.
    pub data: Vec<u8>,
}

/// Everything sent for one page: load chunks, then the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWrite {
    pub page: u32,
    /// Word address the write-page instruction is compiled with.
    pub page_address: u32,
    pub chunks: Vec<Chunk>,
}

/// Largest data block one program-memory packet carries, never an odd count.
pub fn chunk_capacity(max_payload: usize) -> usize {
    max_payload.saturating_sub(layout::PROGRAM_MEMORY_HEADER) & !1
}

/// Largest block requested by one read-memory packet.
pub fn read_capacity(max_payload: usize) -> usize {
    max_payload & !1
}

/// Assemble page `page` of `page_words` words.
///
/// Words before the first and after the last programmed cell are left out;
/// missing cells in between read as 0xff. Returns `None` for untouched pages.
pub fn assemble_page(image: &MemoryImage, page: u32, page_words: u32) -> Option<PageData> {
    let first = page * page_words;
    let last = first + page_words - 1;

    let present = |w: u32| {
        let (lo, hi) = image.word(w);
        lo.is_some() || hi.is_some()
    };
    let start = (first..=last).find(|&w| present(w))?;
    let end = (start..=last).rev().find(|&w| present(w))?;

    let mut data = Vec::with_capacity(((end - start + 1) * 2) as usize);
    for w in start..=end {
        let (lo, hi) = image.word(w);
        data.push(lo.unwrap_or(UNPROGRAMMED));
        data.push(hi.unwrap_or(UNPROGRAMMED));
    }
    Some(PageData {
        data_start_addr: start,
        data,
    })
}

/// Plan the paged flash write of `image`.
pub fn plan_paged(
    image: &MemoryImage,
    flash_size: u32,
    page_size: u32,
    max_payload: usize,
) -> Result<Vec<PageWrite>> {
    if page_size < 2 || page_size % 2 != 0 {
        return Err(Error::InternalError(format!(
            "page size {} is not a whole number of words",
            page_size
        )));
    }
    image.check_bounds(Memory::Flash, flash_size)?;
    let capacity = chunk_capacity(max_payload);
    if capacity == 0 {
        return Err(Error::InternalError(format!(
            "payload limit {} leaves no room for data",
            max_payload
        )));
    }

    let page_words = page_size / 2;
    let mut pages: Vec<u32> = image.iter().map(|(a, _)| a / 2 / page_words).collect();
    pages.dedup();

    let mut writes = Vec::with_capacity(pages.len());
    for page in pages {
        let Some(assembled) = assemble_page(image, page, page_words) else {
            continue;
        };
        let mut address = assembled.data_start_addr;
        let chunks = assembled
            .data
            .chunks(capacity)
            .map(|data| {
                let chunk = Chunk {
                    address,
                    data: data.to_vec(),
                };
                address += data.len() as u32 / 2;
                chunk
            })
            .collect();
        writes.push(PageWrite {
            page,
            page_address: page * page_words,
            chunks,
        });
    }
    Ok(writes)
}

/// Plan an unpaged write: contiguous runs, each one program-memory packet.
///
/// Flash runs are whole words addressed in words; a lone byte of a word is
/// completed with 0xff. EEPROM runs are bytes addressed in bytes.
pub fn plan_unpaged(
    image: &MemoryImage,
    memory: Memory,
    size: u32,
    max_payload: usize,
) -> Result<Vec<Chunk>> {
    image.check_bounds(memory, size)?;
    let capacity = chunk_capacity(max_payload);
    if capacity == 0 {
        return Err(Error::InternalError(format!(
            "payload limit {} leaves no room for data",
            max_payload
        )));
    }

    // (unit address, bytes of that unit)
    let units: Vec<(u32, Vec<u8>)> = match memory {
        Memory::Eeprom => image.iter().map(|(a, v)| (a, vec![v])).collect(),
        Memory::Flash => {
            let mut words: Vec<u32> = image.iter().map(|(a, _)| a / 2).collect();
            words.dedup();
            words
                .into_iter()
                .map(|w| {
                    let (lo, hi) = image.word(w);
                    (
                        w,
                        vec![lo.unwrap_or(UNPROGRAMMED), hi.unwrap_or(UNPROGRAMMED)],
                    )
                })
                .collect()
        }
    };

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut prev: Option<u32> = None;
    for (address, bytes) in units {
        let extend = match (chunks.last(), prev) {
            (Some(last), Some(p)) => address - p == 1 && last.data.len() + bytes.len() <= capacity,
            _ => false,
        };
        match chunks.last_mut() {
            Some(last) if extend => last.data.extend_from_slice(&bytes),
            _ => chunks.push(Chunk {
                address,
                data: bytes,
            }),
        }
        prev = Some(address);
    }
    Ok(chunks)
}

/// One read-memory request: start address in instruction units, byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u32,
    pub len: u32,
}

/// Requests covering `size` bytes of `memory`, in address order.
pub fn plan_read(memory: Memory, size: u32, max_payload: usize) -> Result<Vec<ReadRequest>> {
    let capacity = read_capacity(max_payload) as u32;
    if capacity == 0 {
        return Err(Error::InternalError(format!(
            "payload limit {} leaves no room for data",
            max_payload
        )));
    }

    let mut requests = Vec::new();
    let mut done = 0;
    while done < size {
        let len = capacity.min(size - done);
        requests.push(ReadRequest {
            address: done / memory.unit(),
            len,
        });
        done += len;
    }
    Ok(requests)
}

/// Drop the run of erased words at the end of a flash dump.
pub fn trim_flash_tail(buffer: &mut Vec<u8>) {
    if buffer.len() % 2 != 0 {
        return;
    }
    while buffer.ends_with(&[UNPROGRAMMED, UNPROGRAMMED]) {
        buffer.truncate(buffer.len() - 2);
    }
}

/// Compare every programmed cell of `image` with a dump starting at address 0.
pub fn verify_image(memory: Memory, image: &MemoryImage, dump: &[u8]) -> Result<()> {
    for (address, expected) in image.iter() {
        let actual = dump.get(address as usize).copied();
        if actual != Some(expected) {
            return Err(Error::HardwareError(format!(
                "{} verification failed at 0x{:04x}: wrote 0x{:02x}, read {}",
                memory,
                address,
                expected,
                actual.map_or_else(|| "nothing".to_string(), |v| format!("0x{:02x}", v))
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(cells: &[(u32, u8)]) -> MemoryImage {
        let mut image = MemoryImage::new();
        for &(a, v) in cells {
            image.insert(a, v);
        }
        image
    }

    #[test]
    fn test_page_skips_leading_and_trailing_words() {
        // word 2 of a 4-word page
        let img = image(&[(4, 0x12), (5, 0x34)]);
        let page = assemble_page(&img, 0, 4).unwrap();
        assert_eq!(page.data_start_addr, 2);
        assert_eq!(page.data, [0x12, 0x34]);
    }

    #[test]
    fn test_page_fills_inner_gap() {
        let img = image(&[(0, 0xd0), (1, 0xd1), (6, 0xd6), (7, 0xd7)]);
        let page = assemble_page(&img, 0, 4).unwrap();
        assert_eq!(page.data_start_addr, 0);
        assert_eq!(page.data, [0xd0, 0xd1, 0xff, 0xff, 0xff, 0xff, 0xd6, 0xd7]);
    }

    #[test]
    fn test_page_fills_single_missing_byte() {
        let img = image(&[(9, 0xaa), (10, 0xbb)]);
        let page = assemble_page(&img, 1, 4).unwrap();
        assert_eq!(page.data_start_addr, 4);
        assert_eq!(page.data, [0xff, 0xaa, 0xbb, 0xff]);
    }

    #[test]
    fn test_untouched_page_is_none() {
        let img = image(&[(0, 1)]);
        assert!(assemble_page(&img, 1, 4).is_none());
    }

    #[test]
    fn test_paged_plan_addresses() {
        // 8-byte pages, data in pages 0 and 2
        let img = image(&[(2, 1), (3, 2), (16, 3), (17, 4), (19, 5)]);
        let writes = plan_paged(&img, 64, 8, 1029).unwrap();
        assert_eq!(writes.len(), 2);

        assert_eq!(writes[0].page, 0);
        assert_eq!(writes[0].page_address, 0);
        assert_eq!(
            writes[0].chunks,
            [Chunk {
                address: 1,
                data: vec![1, 2]
            }]
        );

        assert_eq!(writes[1].page, 2);
        assert_eq!(writes[1].page_address, 8);
        assert_eq!(
            writes[1].chunks,
            [Chunk {
                address: 8,
                data: vec![3, 4, 0xff, 5]
            }]
        );
    }

    #[test]
    fn test_paged_chunks_never_split_words() {
        let data: Vec<u8> = (0..=255).collect();
        let img = MemoryImage::from_bytes(0, &data).unwrap();
        for max_payload in [8, 9, 10, 11, 64, 100, 293, 1029] {
            let writes = plan_paged(&img, 1024, 256, max_payload).unwrap();
            let mut next = 0;
            let mut sent = Vec::new();
            for chunk in &writes[0].chunks {
                assert_eq!(chunk.data.len() % 2, 0, "max_payload {}", max_payload);
                assert!(chunk.data.len() + layout::PROGRAM_MEMORY_HEADER <= max_payload);
                assert_eq!(chunk.address, next);
                next += chunk.data.len() as u32 / 2;
                sent.extend_from_slice(&chunk.data);
            }
            assert_eq!(sent, data);
        }
    }

    #[test]
    fn test_paged_plan_rejects_out_of_range() {
        let img = image(&[(64, 0)]);
        assert!(matches!(
            plan_paged(&img, 64, 8, 1029),
            Err(Error::InternalError(_))
        ));
    }

    #[test]
    fn test_unpaged_eeprom_runs() {
        let img = image(&[(0, 1), (1, 2), (2, 3), (5, 4), (6, 5)]);
        let chunks = plan_unpaged(&img, Memory::Eeprom, 64, 1029).unwrap();
        assert_eq!(
            chunks,
            [
                Chunk {
                    address: 0,
                    data: vec![1, 2, 3]
                },
                Chunk {
                    address: 5,
                    data: vec![4, 5]
                },
            ]
        );
    }

    #[test]
    fn test_unpaged_run_splits_at_capacity() {
        let img = MemoryImage::from_bytes(0, &[7; 10]).unwrap();
        // 5 header bytes + 4 data bytes
        let chunks = plan_unpaged(&img, Memory::Eeprom, 64, 9).unwrap();
        let lens: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(lens, [4, 4, 2]);
        let addrs: Vec<u32> = chunks.iter().map(|c| c.address).collect();
        assert_eq!(addrs, [0, 4, 8]);
    }

    #[test]
    fn test_unpaged_flash_uses_word_addresses() {
        let img = image(&[(0x20, 0x0c), (0x21, 0x94), (0x22, 0x5c), (0x31, 0x11)]);
        let chunks = plan_unpaged(&img, Memory::Flash, 2048, 1029).unwrap();
        assert_eq!(
            chunks,
            [
                Chunk {
                    address: 0x10,
                    data: vec![0x0c, 0x94, 0x5c, 0xff]
                },
                Chunk {
                    address: 0x18,
                    data: vec![0xff, 0x11]
                },
            ]
        );
    }

    #[test]
    fn test_unpaged_rejects_out_of_range() {
        let img = image(&[(128, 0)]);
        assert!(matches!(
            plan_unpaged(&img, Memory::Eeprom, 128, 1029),
            Err(Error::InternalError(_))
        ));
    }

    #[test]
    fn test_read_plan_flash() {
        let requests = plan_read(Memory::Flash, 2048, 1029).unwrap();
        assert_eq!(
            requests,
            [
                ReadRequest {
                    address: 0,
                    len: 1028
                },
                ReadRequest {
                    address: 514,
                    len: 1020
                },
            ]
        );
    }

    #[test]
    fn test_read_plan_eeprom() {
        let requests = plan_read(Memory::Eeprom, 512, 293).unwrap();
        let addrs: Vec<u32> = requests.iter().map(|r| r.address).collect();
        assert_eq!(addrs, [0, 292]);
        assert_eq!(requests.iter().map(|r| r.len).sum::<u32>(), 512);
    }

    #[test]
    fn test_trim_flash_tail() {
        let mut buf = vec![0x0c, 0x94, 0xff, 0xff, 0x12, 0xff, 0xff, 0xff, 0xff, 0xff];
        trim_flash_tail(&mut buf);
        assert_eq!(buf, [0x0c, 0x94, 0xff, 0xff, 0x12, 0xff]);

        let mut erased = vec![0xff; 8];
        trim_flash_tail(&mut erased);
        assert!(erased.is_empty());

        let mut full = vec![0x00, 0x01];
        trim_flash_tail(&mut full);
        assert_eq!(full, [0x00, 0x01]);
    }

    #[test]
    fn test_verify_image() {
        let img = image(&[(1, 0xaa), (3, 0xbb)]);
        assert!(verify_image(Memory::Eeprom, &img, &[0xff, 0xaa, 0xff, 0xbb]).is_ok());
        let err = verify_image(Memory::Eeprom, &img, &[0xff, 0xaa, 0xff, 0xbc]).unwrap_err();
        assert!(matches!(err, Error::HardwareError(_)));
        assert!(err.to_string().contains("0x0003"));
        assert!(verify_image(Memory::Eeprom, &img, &[0xff, 0xaa]).is_err());
    }
}
