//! VT100 Chip Ensemble
//!
//! The miscellaneous control chips on the VT100 basic video board, gathered
//! behind four IO ports:
//!
//! | Port | Dir | Function                                   |
//! |------|-----|--------------------------------------------|
//! | 0x42 | R   | Composite flags (UART ready, NVR, LBA7)    |
//! | 0x42 | W   | Brightness D/A latch                       |
//! | 0x62 | W   | ER1400 NVR command/data latch              |
//! | 0xA2 | W   | DC012 control (scroll, blink, reverse)     |
//! | 0xC2 | W   | DC011 timing (columns, refresh rate)       |
//!
//! ## LBA7 and the NVR
//!
//! The ER1400 is clocked by LBA7, a video-timing signal the firmware samples
//! through the flags register. Rather than model the video chain, LBA7 is
//! derived from the CPU cycle counter — bit 6, so it toggles every 64 cycles
//! — which is plenty for the ROM's polling cadence. Each rising edge
//! observed across successive flags reads executes the command currently
//! sitting in the NVR latch.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cpu::IntrLine;
use crate::kbd::Keyboard;
use crate::serial::Serial;
use crate::time::Time;
use crate::video::Video;

/// Composite flags register bits (port 0x42 read).
pub mod flags {
    /// Serial transmitter ready.
    pub const UART_XMIT: u8 = 0x01;
    /// No advanced video option installed (always set).
    pub const NO_AVO: u8 = 0x02;
    /// No graphics board installed (always set).
    pub const NO_GFX: u8 = 0x04;
    /// Option present (always clear).
    pub const OPTION: u8 = 0x08;
    /// Even field of interlaced display (always clear).
    pub const NO_EVEN: u8 = 0x10;
    /// Current NVR shift-register output bit.
    pub const NVR_DATA: u8 = 0x20;
    /// Simulated LBA7 clock state.
    pub const NVR_CLK: u8 = 0x40;
    /// Keyboard transmitter ready.
    pub const KBD_XMIT: u8 = 0x80;
}

/// DC011 programming values (port 0xC2 write).
pub mod dc011 {
    pub const COLS80: u8 = 0x00;
    pub const COLS132: u8 = 0x10;
    pub const RATE60: u8 = 0x20;
    pub const RATE50: u8 = 0x30;
}

/// Interrupt level cleared by the DC012 vertical-frequency command and
/// raised by the video refresh tick.
pub const VERTICAL_INTR_LEVEL: u8 = 4;

/// Number of 14-bit words in the ER1400.
pub const NVR_WORDS: usize = 100;

/// Value of an erased (or never written) NVR word.
pub const NVR_ERASED: u16 = 0x3FFF;

/// ER1400 non-volatile RAM: a 20-bit address shift register, a 14-bit data
/// shift register, and 100 words of storage addressed in one-cold decimal.
pub struct Nvr {
    /// 20-bit address shift register.
    addr: u32,
    /// 14-bit data shift register.
    data: u16,
    /// Latched command/data byte, executed on the next LBA7 rising edge.
    latch: u8,
    /// Bit most recently shifted out.
    out_bit: bool,
    words: Vec<u16>,
}

/// ER1400 command opcodes (latch bits 1–3).
mod nvr_cmd {
    pub const ACCEPT_DATA: u8 = 0x0;
    pub const ACCEPT_ADDR: u8 = 0x1;
    pub const SHIFT_OUT: u8 = 0x2;
    pub const WRITE: u8 = 0x4;
    pub const ERASE: u8 = 0x5;
    pub const READ: u8 = 0x6;
    pub const STANDBY: u8 = 0x7;
}

impl Nvr {
    /// Creates the NVR, optionally seeded with persisted words. Missing
    /// words read as erased.
    #[must_use]
    pub fn new(initial: Option<&[u16]>) -> Self {
        let mut words = vec![NVR_ERASED; NVR_WORDS];
        if let Some(values) = initial {
            for (slot, &value) in words.iter_mut().zip(values.iter()) {
                *slot = value & NVR_ERASED;
            }
        }
        Self {
            addr: 0,
            data: 0,
            latch: 0,
            out_bit: false,
            words,
        }
    }

    /// Stores the latch byte; the command executes on the next LBA7 rising
    /// edge.
    pub fn set_latch(&mut self, value: u8) {
        self.latch = value;
    }

    /// The current serial output bit.
    #[must_use]
    pub const fn out_bit(&self) -> bool {
        self.out_bit
    }

    /// Current storage contents, for external persistence.
    #[must_use]
    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// Decodes the one-cold address shift register: the inverted register
    /// splits into two 10-bit digit fields (tens low, ones high), where a
    /// set bit at position p selects digit 9-p.
    fn word_addr(&self) -> usize {
        let inv = !self.addr;
        let mut tens = 0usize;
        let mut ones = 0usize;
        for i in 0..10 {
            if (inv >> i) & 1 != 0 {
                tens = 9 - i;
            }
            if (inv >> (10 + i)) & 1 != 0 {
                ones = 9 - i;
            }
        }
        (tens * 10 + ones).min(NVR_WORDS - 1)
    }

    /// Executes the latched command (one LBA7 rising edge).
    pub fn clock(&mut self) {
        let bit = u16::from(self.latch & 0x01);
        let cmd = (self.latch >> 1) & 0x07;
        match cmd {
            nvr_cmd::ACCEPT_DATA => {
                self.data = ((self.data << 1) | bit) & NVR_ERASED;
            }
            nvr_cmd::ACCEPT_ADDR => {
                self.addr = ((self.addr << 1) | u32::from(bit)) & 0xF_FFFF;
            }
            nvr_cmd::SHIFT_OUT => {
                self.data <<= 1;
                self.out_bit = (self.data >> 14) & 1 != 0;
                self.data &= NVR_ERASED;
            }
            nvr_cmd::WRITE => {
                let addr = self.word_addr();
                self.words[addr] = self.data & NVR_ERASED;
            }
            nvr_cmd::ERASE => {
                let addr = self.word_addr();
                self.words[addr] = NVR_ERASED;
            }
            nvr_cmd::READ => {
                self.data = self.words[self.word_addr()];
            }
            nvr_cmd::STANDBY => {}
            _ => {
                // Unassigned opcode: treated as standby.
                trace!(cmd, "unassigned NVR command");
            }
        }
    }
}

/// Persisted chip-ensemble state.
#[derive(Serialize, Deserialize)]
pub struct ChipsState {
    pub id: String,
    pub version: u32,
    pub brightness: u8,
    pub dc011_cols: u8,
    pub dc011_rate: u8,
    pub scroll: u8,
    pub blink: u8,
    pub reverse: u8,
    pub attr: u8,
    pub nvr_addr: u32,
    pub nvr_data: u16,
    pub nvr_latch: u8,
    pub nvr_out: bool,
    pub nvr_words: Vec<u16>,
}

/// State-format version for [`ChipsState`].
pub const CHIPS_STATE_VERSION: u32 = 1;

/// The chip bank. Owns the NVR and the DC011/DC012 programming state;
/// consults the keyboard and serial UARTs for their ready bits when the
/// flags register is read.
pub struct Chips {
    brightness: u8,
    dc011_cols: u8,
    dc011_rate: u8,
    scroll: u8,
    blink: u8,
    reverse: u8,
    attr: u8,
    nvr: Nvr,
    prev_nvr_clk: bool,
    time: Time,
    intr: IntrLine,
    video: Option<Rc<RefCell<Video>>>,
    kbd: Option<Rc<RefCell<Keyboard>>>,
    serial: Option<Rc<RefCell<Serial>>>,
}

impl Chips {
    #[must_use]
    pub fn new(time: Time, intr: IntrLine, nvr_words: Option<&[u16]>) -> Self {
        Self {
            brightness: 0,
            dc011_cols: dc011::COLS80,
            dc011_rate: dc011::RATE60,
            scroll: 0,
            blink: 0,
            reverse: 0,
            attr: 0,
            nvr: Nvr::new(nvr_words),
            prev_nvr_clk: false,
            time,
            intr,
            video: None,
            kbd: None,
            serial: None,
        }
    }

    // Wired at power-on from the machine's device directory.

    pub fn set_video(&mut self, video: Rc<RefCell<Video>>) {
        self.video = Some(video);
    }

    pub fn set_kbd(&mut self, kbd: Rc<RefCell<Keyboard>>) {
        self.kbd = Some(kbd);
    }

    pub fn set_serial(&mut self, serial: Rc<RefCell<Serial>>) {
        self.serial = Some(serial);
    }

    #[must_use]
    pub const fn brightness(&self) -> u8 {
        self.brightness
    }

    #[must_use]
    pub const fn scroll(&self) -> u8 {
        self.scroll
    }

    #[must_use]
    pub const fn blink(&self) -> u8 {
        self.blink
    }

    #[must_use]
    pub const fn reverse(&self) -> u8 {
        self.reverse
    }

    #[must_use]
    pub const fn attr(&self) -> u8 {
        self.attr
    }

    #[must_use]
    pub fn nvr_words(&self) -> &[u16] {
        self.nvr.words()
    }

    pub fn reset(&mut self) {
        self.brightness = 0;
        self.dc011_cols = dc011::COLS80;
        self.dc011_rate = dc011::RATE60;
        self.scroll = 0;
        self.blink = 0;
        self.reverse = 0;
        self.attr = 0;
        self.prev_nvr_clk = false;
        // NVR contents survive reset.
    }

    // ==================== PORT 0x42 ====================

    /// Composite flags read. Every bit is recomputed on each read; LBA7
    /// rising edges observed here clock the NVR command latch.
    pub fn in_flags(&mut self) -> u8 {
        let clk = (self.time.cycles() >> 6) & 1 != 0;
        if clk && !self.prev_nvr_clk {
            self.nvr.clock();
        }
        self.prev_nvr_clk = clk;

        let mut b = flags::NO_AVO | flags::NO_GFX;
        if clk {
            b |= flags::NVR_CLK;
        }
        if self.nvr.out_bit() {
            b |= flags::NVR_DATA;
        }
        if self
            .serial
            .as_ref()
            .is_some_and(|s| s.borrow().transmitter_ready())
        {
            b |= flags::UART_XMIT;
        }
        if self
            .kbd
            .as_ref()
            .is_some_and(|k| k.borrow().transmitter_ready(self.time.cycles()))
        {
            b |= flags::KBD_XMIT;
        }
        b
    }

    /// Brightness D/A write.
    pub fn out_brightness(&mut self, value: u8) {
        self.brightness = value;
    }

    // ==================== PORT 0x62 ====================

    /// NVR latch write; executed on the next LBA7 rising edge.
    pub fn out_nvr_latch(&mut self, value: u8) {
        self.nvr.set_latch(value);
    }

    // ==================== PORT 0xA2 (DC012) ====================

    /// DC012 command: bits 3:2 select the command, bits 1:0 the option.
    pub fn out_dc012(&mut self, value: u8) {
        let cmd = (value >> 2) & 0x03;
        let opt = value & 0x03;
        match cmd {
            0 => {
                self.scroll = (self.scroll & !0x03) | opt;
            }
            1 => {
                self.scroll = (self.scroll & !0x0C) | (opt << 2);
                let scroll = self.scroll;
                if let Some(video) = &self.video {
                    video.borrow_mut().update_scroll_offset(scroll);
                }
            }
            2 => match opt {
                0 => self.blink ^= 1,
                1 => self.intr.clear_level(VERTICAL_INTR_LEVEL),
                _ => self.reverse = 3 - opt,
            },
            _ => {
                self.attr = opt;
            }
        }
    }

    // ==================== PORT 0xC2 (DC011) ====================

    /// DC011 programming. Bit 5 selects rate-setting; otherwise the write
    /// selects the column mode.
    pub fn out_dc011(&mut self, value: u8) {
        if value & dc011::RATE60 != 0 {
            let rate = value & dc011::RATE50;
            if rate != self.dc011_rate {
                self.dc011_rate = rate;
                let nr = if rate == dc011::RATE50 { 50 } else { 60 };
                debug!(rate = nr, "DC011 refresh rate change");
                if let Some(video) = &self.video {
                    video.borrow_mut().update_rate(nr);
                }
            }
        } else {
            let cols_bits = value & dc011::COLS132;
            if cols_bits != self.dc011_cols {
                self.dc011_cols = cols_bits;
                let cols = if cols_bits == dc011::COLS132 { 132 } else { 80 };
                // Without the AVO's extra RAM only 14 rows fit in 132-column
                // mode; the flags register reports NO_AVO as always set.
                let rows = if cols > 80 { 14 } else { 24 };
                debug!(cols, rows, "DC011 dimension change");
                if let Some(video) = &self.video {
                    video.borrow_mut().update_dimensions(cols, rows);
                }
            }
        }
    }

    // ==================== STATE ====================

    #[must_use]
    pub fn save_state(&self) -> ChipsState {
        ChipsState {
            id: "chips".to_string(),
            version: CHIPS_STATE_VERSION,
            brightness: self.brightness,
            dc011_cols: self.dc011_cols,
            dc011_rate: self.dc011_rate,
            scroll: self.scroll,
            blink: self.blink,
            reverse: self.reverse,
            attr: self.attr,
            nvr_addr: self.nvr.addr,
            nvr_data: self.nvr.data,
            nvr_latch: self.nvr.latch,
            nvr_out: self.nvr.out_bit,
            nvr_words: self.nvr.words.clone(),
        }
    }

    pub fn load_state(&mut self, state: &ChipsState) -> bool {
        if state.id != "chips"
            || state.version != CHIPS_STATE_VERSION
            || state.nvr_words.len() != NVR_WORDS
        {
            return false;
        }
        self.brightness = state.brightness;
        self.dc011_cols = state.dc011_cols;
        self.dc011_rate = state.dc011_rate;
        self.scroll = state.scroll;
        self.blink = state.blink;
        self.reverse = state.reverse;
        self.attr = state.attr;
        self.nvr.addr = state.nvr_addr;
        self.nvr.data = state.nvr_data;
        self.nvr.latch = state.nvr_latch;
        self.nvr.out_bit = state.nvr_out;
        self.nvr.words = state.nvr_words.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeConfig;

    fn test_chips() -> Chips {
        let time = Time::new(&TimeConfig::default());
        let intr = IntrLine::new(time.clone());
        Chips::new(time, intr, None)
    }

    /// Drives one NVR command through the chips: latch the byte, then walk
    /// the LBA7 clock through a full low phase and a rising edge.
    fn nvr_step(chips: &mut Chips, latch: u8) {
        chips.out_nvr_latch(latch);
        while (chips.time.cycles() >> 6) & 1 != 0 {
            chips.time.add_cycles(1);
        }
        chips.in_flags(); // observe the low phase
        while (chips.time.cycles() >> 6) & 1 == 0 {
            chips.time.add_cycles(1);
        }
        chips.in_flags(); // rising edge executes the command
    }

    /// Encodes an ER1400 one-cold address for decimal word `n` and shifts
    /// it in MSB-first.
    fn nvr_send_addr(chips: &mut Chips, n: usize) {
        let tens = n / 10;
        let ones = n % 10;
        let addr = !((1u32 << (9 - tens)) | (1u32 << (10 + 9 - ones))) & 0xF_FFFF;
        for i in (0..20).rev() {
            let bit = ((addr >> i) & 1) as u8;
            nvr_step(chips, bit | (nvr_cmd::ACCEPT_ADDR << 1));
        }
    }

    #[test]
    fn test_nvr_write_read_shift_roundtrip() {
        let mut chips = test_chips();
        let word: u16 = 0x2A5C & NVR_ERASED;

        nvr_send_addr(&mut chips, 42);
        for i in (0..14).rev() {
            let bit = ((word >> i) & 1) as u8;
            nvr_step(&mut chips, bit | (nvr_cmd::ACCEPT_DATA << 1));
        }
        nvr_step(&mut chips, nvr_cmd::WRITE << 1);
        assert_eq!(chips.nvr_words()[42], word);

        // Read it back through the shift-out bit stream.
        nvr_send_addr(&mut chips, 42);
        nvr_step(&mut chips, nvr_cmd::READ << 1);
        let mut got: u16 = 0;
        for _ in 0..14 {
            nvr_step(&mut chips, nvr_cmd::SHIFT_OUT << 1);
            got = (got << 1) | u16::from(chips.nvr.out_bit());
        }
        assert_eq!(got, word);
    }

    #[test]
    fn test_nvr_erase_and_unwritten_words() {
        let mut chips = test_chips();
        assert_eq!(chips.nvr_words()[7], NVR_ERASED);

        nvr_send_addr(&mut chips, 7);
        for _ in 0..14 {
            nvr_step(&mut chips, nvr_cmd::ACCEPT_DATA << 1); // all zero bits
        }
        nvr_step(&mut chips, nvr_cmd::WRITE << 1);
        assert_eq!(chips.nvr_words()[7], 0);

        nvr_step(&mut chips, nvr_cmd::ERASE << 1);
        assert_eq!(chips.nvr_words()[7], NVR_ERASED);
    }

    #[test]
    fn test_nvr_command_gated_on_rising_edge_only() {
        let mut chips = test_chips();
        // Park LBA7 high, then latch a data-shift command.
        while (chips.time.cycles() >> 6) & 1 == 0 {
            chips.time.add_cycles(1);
        }
        chips.in_flags();
        chips.out_nvr_latch(0x01 | (nvr_cmd::ACCEPT_DATA << 1));
        // Repeated reads in the same high phase execute nothing.
        chips.in_flags();
        chips.in_flags();
        assert_eq!(chips.nvr.data, 0);
        // Low phase, then high: exactly one shift.
        while (chips.time.cycles() >> 6) & 1 != 0 {
            chips.time.add_cycles(1);
        }
        chips.in_flags();
        while (chips.time.cycles() >> 6) & 1 == 0 {
            chips.time.add_cycles(1);
        }
        chips.in_flags();
        assert_eq!(chips.nvr.data, 1);
    }

    #[test]
    fn test_flags_composite_bits() {
        let mut chips = test_chips();
        // No UARTs wired: ready bits stay clear, fixed bits read as
        // documented.
        while (chips.time.cycles() >> 6) & 1 != 0 {
            chips.time.add_cycles(1);
        }
        let b = chips.in_flags();
        assert_eq!(b & flags::NO_AVO, flags::NO_AVO);
        assert_eq!(b & flags::NO_GFX, flags::NO_GFX);
        assert_eq!(b & flags::OPTION, 0);
        assert_eq!(b & flags::NO_EVEN, 0);
        assert_eq!(b & flags::NVR_CLK, 0);
        // After 64 more cycles LBA7 has risen.
        chips.time.add_cycles(64);
        let b = chips.in_flags();
        assert_eq!(b & flags::NVR_CLK, flags::NVR_CLK);
    }

    #[test]
    fn test_dc012_scroll_nibbles() {
        let mut chips = test_chips();
        chips.out_dc012(0x03); // scroll low bits
        assert_eq!(chips.scroll(), 0x03);
        chips.out_dc012(0x04 | 0x02); // scroll high bits = 2
        assert_eq!(chips.scroll(), 0x0B);
    }

    #[test]
    fn test_dc012_blink_reverse_attr() {
        let mut chips = test_chips();
        chips.out_dc012(0x08); // toggle blink
        assert_eq!(chips.blink(), 1);
        chips.out_dc012(0x08);
        assert_eq!(chips.blink(), 0);
        chips.out_dc012(0x08 | 0x02); // reverse = 3 - 2 = 1
        assert_eq!(chips.reverse(), 1);
        chips.out_dc012(0x08 | 0x03); // reverse = 0
        assert_eq!(chips.reverse(), 0);
        chips.out_dc012(0x0C | 0x02); // basic attribute
        assert_eq!(chips.attr(), 2);
    }

    #[test]
    fn test_dc012_clears_vertical_interrupt() {
        let mut chips = test_chips();
        chips.intr.request_intr(VERTICAL_INTR_LEVEL);
        assert_ne!(chips.intr.flags() & (1 << VERTICAL_INTR_LEVEL), 0);
        chips.out_dc012(0x08 | 0x01);
        assert_eq!(chips.intr.flags() & (1 << VERTICAL_INTR_LEVEL), 0);
    }

    #[test]
    fn test_brightness_latch() {
        let mut chips = test_chips();
        chips.out_brightness(0x2F);
        assert_eq!(chips.brightness(), 0x2F);
    }

    #[test]
    fn test_chips_state_roundtrip() {
        let mut chips = test_chips();
        chips.out_brightness(0x11);
        chips.out_dc012(0x02);
        chips.out_dc011(dc011::RATE50);
        nvr_send_addr(&mut chips, 3);

        let saved = serde_json::to_string(&chips.save_state()).unwrap();
        let mut other = test_chips();
        assert!(other.load_state(&serde_json::from_str(&saved).unwrap()));
        let again = serde_json::to_string(&other.save_state()).unwrap();
        assert_eq!(saved, again);
        assert_eq!(other.brightness(), 0x11);
        assert_eq!(other.scroll(), 0x02);
    }

    #[test]
    fn test_chips_load_rejects_bad_prefix() {
        let mut chips = test_chips();
        let mut state = chips.save_state();
        state.id = "dc012".to_string();
        assert!(!chips.load_state(&state));
        let mut state = chips.save_state();
        state.nvr_words.pop();
        assert!(!chips.load_state(&state));
    }
}
