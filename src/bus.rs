//! Paged Bus
//!
//! This module provides the address-space fabric shared by the memory bus and
//! the IO bus. A bus carves its flat address space (width ≤ 32 bits) into
//! uniform, power-of-two blocks and dispatches every access to the block that
//! owns the address:
//!
//! ```text
//! slot(A)   = A >> log2(block_size)
//! offset(A) = A &  (block_size - 1)
//! ```
//!
//! Every slot starts out holding a NONE block (open bus); devices claim
//! windows with [`Bus::add_blocks`], which refuses to overlay populated
//! space. Addresses are masked to the bus width before dispatch, so there is
//! no out-of-range path — a miss is a NONE access, logged at debug level and
//! answered with the all-ones data limit.
//!
//! ## Pair access
//!
//! `read_pair`/`write_pair` honor the bus endianness. A pair at an odd
//! address splits into two byte accesses at `addr` and `(addr + 1) & limit`
//! — wrapping at the top of the address space exactly as an 8080 does — so a
//! pair can straddle two blocks. A pair at an even address stays inside one
//! block and uses the block's direct 16-bit path when no trap or listener
//! needs to observe the individual bytes.
//!
//! ## Flavors
//!
//! A bus is either STATIC (ROM/RAM; storage may be inspected directly) or
//! DYNAMIC (IO; every access runs through dispatch). The distinction exists
//! for future fast paths only — behavior is identical through the public
//! operations, and traps work on both.

use std::fmt;

use tracing::debug;

use crate::memory::{Block, BlockType, TrapFn, PAIR_LIMIT};
use crate::ports::{InputFn, OutputFn, PortError};

/// Bus flavor. See the module docs; semantics do not differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusKind {
    /// Memory-style bus: direct storage access is permitted.
    Static,
    /// IO-style bus: all access is funneled through dispatch.
    Dynamic,
}

/// Bus construction and configuration failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusError {
    /// Address width outside 1..=32.
    InvalidWidth(u32),
    /// Block size not a power of two, or larger than the address space.
    InvalidBlockSize(u32),
    /// The addressed block is not a `Ports` block.
    NotPorts(u32),
    /// Listener registration failed.
    Listener(PortError),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWidth(w) => write!(f, "invalid bus address width: {w}"),
            Self::InvalidBlockSize(b) => write!(f, "invalid bus block size: {b:#x}"),
            Self::NotPorts(addr) => {
                write!(f, "no ports block at address {addr:#06x}")
            }
            Self::Listener(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<PortError> for BusError {
    fn from(e: PortError) -> Self {
        Self::Listener(e)
    }
}

/// A paged address space of uniform blocks.
pub struct Bus {
    kind: BusKind,
    addr_width: u32,
    /// `(1 << addr_width) - 1`; every incoming address is masked with this.
    addr_limit: u32,
    block_size: u32,
    block_shift: u32,
    block_limit: u32,
    little_endian: bool,
    blocks: Vec<Block>,
}

impl Bus {
    /// Creates a bus with every slot unpopulated.
    pub fn new(kind: BusKind, addr_width: u32, block_size: u32) -> Result<Self, BusError> {
        if addr_width == 0 || addr_width > 32 {
            return Err(BusError::InvalidWidth(addr_width));
        }
        let addr_total = 1u64 << addr_width;
        if !block_size.is_power_of_two() || u64::from(block_size) > addr_total {
            return Err(BusError::InvalidBlockSize(block_size));
        }
        let count = (addr_total / u64::from(block_size)) as usize;
        let blocks = (0..count)
            .map(|i| Block::new(i as u32 * block_size, block_size, BlockType::None))
            .collect();
        Ok(Self {
            kind,
            addr_width,
            addr_limit: (addr_total - 1) as u32,
            block_size,
            block_shift: block_size.trailing_zeros(),
            block_limit: block_size - 1,
            little_endian: true,
            blocks,
        })
    }

    /// Bus flavor.
    #[must_use]
    pub const fn kind(&self) -> BusKind {
        self.kind
    }

    /// Address width in bits.
    #[must_use]
    pub const fn addr_width(&self) -> u32 {
        self.addr_width
    }

    /// Highest valid address.
    #[must_use]
    pub const fn addr_limit(&self) -> u32 {
        self.addr_limit
    }

    /// Uniform block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    const fn slot(&self, addr: u32) -> usize {
        (addr >> self.block_shift) as usize
    }

    /// Reads one byte.
    pub fn read_byte(&mut self, addr: u32) -> u8 {
        let a = addr & self.addr_limit;
        let i = self.slot(a);
        let off = a & self.block_limit;
        self.blocks[i].read_byte(a, off)
    }

    /// Writes one byte.
    pub fn write_byte(&mut self, addr: u32, value: u8) {
        let a = addr & self.addr_limit;
        let i = self.slot(a);
        let off = a & self.block_limit;
        self.blocks[i].write_byte(a, off, value);
    }

    /// Reads a 16-bit pair, splitting across blocks at odd addresses.
    /// Wraps to address 0 at the top of the address space.
    pub fn read_pair(&mut self, addr: u32) -> u16 {
        let a = addr & self.addr_limit;
        let i = self.slot(a);
        let off = a & self.block_limit;
        if a & 1 != 0 || self.blocks[i].pair_by_bytes() {
            let b0 = u16::from(self.read_byte(a));
            let b1 = u16::from(self.read_byte(a.wrapping_add(1) & self.addr_limit));
            if self.little_endian {
                b0 | (b1 << 8)
            } else {
                (b0 << 8) | b1
            }
        } else if self.blocks[i].values().is_empty() {
            PAIR_LIMIT
        } else {
            self.blocks[i].read_pair(off, self.little_endian)
        }
    }

    /// Writes a 16-bit pair, splitting across blocks at odd addresses.
    pub fn write_pair(&mut self, addr: u32, value: u16) {
        let a = addr & self.addr_limit;
        let i = self.slot(a);
        let off = a & self.block_limit;
        let (lo, hi) = ((value & 0xFF) as u8, (value >> 8) as u8);
        if a & 1 != 0 || self.blocks[i].pair_by_bytes() {
            let next = a.wrapping_add(1) & self.addr_limit;
            if self.little_endian {
                self.write_byte(a, lo);
                self.write_byte(next, hi);
            } else {
                self.write_byte(a, hi);
                self.write_byte(next, lo);
            }
        } else {
            self.blocks[i].write_pair(off, value, self.little_endian);
        }
    }

    /// Installs blocks of `kind` covering `[addr, addr + size)`, optionally
    /// seeded from `seed`. Returns `false` — leaving the bus untouched — if
    /// the window is misaligned or collides with populated space.
    pub fn add_blocks(&mut self, addr: u32, size: u32, kind: BlockType, seed: Option<&[u8]>) -> bool {
        if size == 0
            || addr & self.block_limit != 0
            || size & self.block_limit != 0
            || u64::from(addr) + u64::from(size) > u64::from(self.addr_limit) + 1
        {
            debug!("add_blocks: misaligned or out-of-range window {addr:#06x}+{size:#x}");
            return false;
        }
        let first = self.slot(addr);
        let count = (size >> self.block_shift) as usize;
        for i in first..first + count {
            if self.blocks[i].kind() != BlockType::None {
                debug!(
                    "add_blocks: window collides with populated block at {:#06x}",
                    self.blocks[i].addr()
                );
                return false;
            }
        }
        for (n, i) in (first..first + count).enumerate() {
            let start = addr + (n as u32) * self.block_size;
            let mut block = Block::new(start, self.block_size, kind);
            if let Some(values) = seed {
                let lo = (n * self.block_size as usize).min(values.len());
                let hi = ((n + 1) * self.block_size as usize).min(values.len());
                block.load(0, &values[lo..hi]);
            }
            self.blocks[i] = block;
        }
        true
    }

    /// Returns `true` iff every block covering `[addr, addr + size)` is
    /// clean, and unconditionally clears their dirty flags.
    pub fn clean_blocks(&mut self, addr: u32, size: u32) -> bool {
        if size == 0 {
            return true;
        }
        let first = self.slot(addr & self.addr_limit);
        let last = self.slot((addr + size - 1) & self.addr_limit);
        let mut all_clean = true;
        for i in first..=last {
            if self.blocks[i].clean() {
                all_clean = false;
            }
        }
        all_clean
    }

    /// Invokes `f` for every block whose type mask intersects `type_mask`;
    /// returns the number visited.
    pub fn enum_blocks(&self, type_mask: u8, mut f: impl FnMut(&Block)) -> u32 {
        let mut count = 0;
        for block in &self.blocks {
            if block.kind().mask() & type_mask != 0 {
                f(block);
                count += 1;
            }
        }
        count
    }

    /// Adds a read trap on the block containing `addr`.
    pub fn trap_read(&mut self, addr: u32, hook: &TrapFn) -> bool {
        let i = self.slot(addr & self.addr_limit);
        self.blocks[i].trap_read(hook)
    }

    /// Adds a write trap on the block containing `addr`.
    pub fn trap_write(&mut self, addr: u32, hook: &TrapFn) -> bool {
        let i = self.slot(addr & self.addr_limit);
        self.blocks[i].trap_write(hook)
    }

    /// Removes one reference to the read trap on the block containing `addr`.
    pub fn untrap_read(&mut self, addr: u32, hook: &TrapFn) -> bool {
        let i = self.slot(addr & self.addr_limit);
        self.blocks[i].untrap_read(hook)
    }

    /// Removes one reference to the write trap on the block containing `addr`.
    pub fn untrap_write(&mut self, addr: u32, hook: &TrapFn) -> bool {
        let i = self.slot(addr & self.addr_limit);
        self.blocks[i].untrap_write(hook)
    }

    /// Registers port listeners on the `Ports` block containing `port`.
    pub fn add_listener(
        &mut self,
        port: u16,
        input: Option<InputFn>,
        output: Option<OutputFn>,
    ) -> Result<(), BusError> {
        let addr = u32::from(port) & self.addr_limit;
        let i = self.slot(addr);
        match self.blocks[i].ports_mut() {
            Some(table) => Ok(table.add_listener(port, input, output)?),
            None => Err(BusError::NotPorts(addr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DATA_LIMIT;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn bus_16() -> Bus {
        Bus::new(BusKind::Static, 16, 0x400).unwrap()
    }

    #[test]
    fn test_rw_ro_none_read_write_law() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x0000, 0x400, BlockType::ReadOnly, Some(&[0x11; 0x400])));
        assert!(bus.add_blocks(0x2000, 0x400, BlockType::ReadWrite, None));

        // READWRITE: read-after-write returns the value.
        bus.write_byte(0x2005, 0xA5);
        assert_eq!(bus.read_byte(0x2005), 0xA5);

        // READONLY: write leaves the value unchanged.
        bus.write_byte(0x0005, 0xA5);
        assert_eq!(bus.read_byte(0x0005), 0x11);

        // NONE: reads the data limit regardless of writes.
        bus.write_byte(0x8000, 0xA5);
        assert_eq!(bus.read_byte(0x8000), DATA_LIMIT);
    }

    #[test]
    fn test_pair_matches_byte_composition() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x2000, 0x800, BlockType::ReadWrite, None));
        bus.write_byte(0x2010, 0x34);
        bus.write_byte(0x2011, 0x12);
        assert_eq!(
            bus.read_pair(0x2010),
            u16::from(bus.read_byte(0x2010)) | (u16::from(bus.read_byte(0x2011)) << 8)
        );
        assert_eq!(bus.read_pair(0x2010), 0x1234);
    }

    #[test]
    fn test_odd_pair_straddles_blocks() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x2000, 0x800, BlockType::ReadWrite, None));
        // 0x23FF is the last byte of one block, 0x2400 the first of the next.
        bus.write_pair(0x23FF, 0xBEEF);
        assert_eq!(bus.read_byte(0x23FF), 0xEF);
        assert_eq!(bus.read_byte(0x2400), 0xBE);
        assert_eq!(bus.read_pair(0x23FF), 0xBEEF);
    }

    #[test]
    fn test_pair_wraps_at_addr_limit() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x0000, 0x400, BlockType::ReadWrite, None));
        assert!(bus.add_blocks(0xFC00, 0x400, BlockType::ReadWrite, None));
        bus.write_pair(0xFFFF, 0xCAFE);
        assert_eq!(bus.read_byte(0xFFFF), 0xFE);
        assert_eq!(bus.read_byte(0x0000), 0xCA);
        assert_eq!(bus.read_pair(0xFFFF), 0xCAFE);
    }

    #[test]
    fn test_add_blocks_rejects_overlap_and_misalignment() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x1000, 0x800, BlockType::ReadWrite, None));
        // Overlapping the tail of the existing window fails...
        assert!(!bus.add_blocks(0x1400, 0x400, BlockType::ReadWrite, None));
        // ...and leaves the original contents intact.
        bus.write_byte(0x1400, 0x77);
        assert_eq!(bus.read_byte(0x1400), 0x77);
        // Misaligned windows fail outright.
        assert!(!bus.add_blocks(0x2001, 0x400, BlockType::ReadWrite, None));
        assert!(!bus.add_blocks(0x2000, 0x200, BlockType::ReadWrite, None));
    }

    #[test]
    fn test_seed_spans_blocks() {
        let mut bus = bus_16();
        let mut seed = vec![0u8; 0x800];
        seed[0x000] = 1;
        seed[0x400] = 2;
        seed[0x7FF] = 3;
        assert!(bus.add_blocks(0x4000, 0x800, BlockType::ReadOnly, Some(&seed)));
        assert_eq!(bus.read_byte(0x4000), 1);
        assert_eq!(bus.read_byte(0x4400), 2);
        assert_eq!(bus.read_byte(0x47FF), 3);
    }

    #[test]
    fn test_clean_blocks_reports_and_clears() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x2000, 0x800, BlockType::ReadWrite, None));
        assert!(bus.clean_blocks(0x2000, 0x800));
        bus.write_byte(0x2400, 1);
        assert!(!bus.clean_blocks(0x2000, 0x800));
        // The side effect cleared every flag.
        assert!(bus.clean_blocks(0x2000, 0x800));
    }

    #[test]
    fn test_enum_blocks_filters_by_mask() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x0000, 0x400, BlockType::ReadOnly, None));
        assert!(bus.add_blocks(0x2000, 0x800, BlockType::ReadWrite, None));
        assert_eq!(bus.enum_blocks(BlockType::ReadOnly.mask(), |_| {}), 1);
        assert_eq!(bus.enum_blocks(BlockType::ReadWrite.mask(), |_| {}), 2);
        let rw_ro = BlockType::ReadOnly.mask() | BlockType::ReadWrite.mask();
        assert_eq!(bus.enum_blocks(rw_ro, |_| {}), 3);
        assert_eq!(bus.enum_blocks(BlockType::None.mask(), |_| {}), 64 - 3);
    }

    #[test]
    fn test_trapped_block_pair_goes_through_bytes() {
        let mut bus = bus_16();
        assert!(bus.add_blocks(0x2000, 0x400, BlockType::ReadWrite, None));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let hook: TrapFn = Rc::new(move |addr, value| log.borrow_mut().push((addr, value)));
        assert!(bus.trap_write(0x2000, &hook));

        bus.write_pair(0x2010, 0x1234);
        assert_eq!(seen.borrow().as_slice(), &[(0x2010, 0x34), (0x2011, 0x12)]);
        assert_eq!(bus.read_pair(0x2010), 0x1234);
    }

    #[test]
    fn test_ports_block_listener_roundtrip() {
        let mut bus = Bus::new(BusKind::Dynamic, 8, 0x100).unwrap();
        assert!(bus.add_blocks(0x00, 0x100, BlockType::Ports, None));
        let latch = Rc::new(RefCell::new(0u8));
        let wr = Rc::clone(&latch);
        let rd = Rc::clone(&latch);
        bus.add_listener(
            0x42,
            Some(Box::new(move |_| *rd.borrow())),
            Some(Box::new(move |_, v| *wr.borrow_mut() = v)),
        )
        .unwrap();

        bus.write_byte(0x42, 0x2F);
        assert_eq!(bus.read_byte(0x42), 0x2F);
        // Unlistened port on the same block floats high.
        assert_eq!(bus.read_byte(0x43), DATA_LIMIT);
        // Second registration collides.
        assert!(bus.add_listener(0x42, Some(Box::new(|_| 0)), None).is_err());
    }
}
