//! VT100 Video Processor
//!
//! The VT100 keeps the screen as a *display list* in main memory: a chain of
//! character lines, each terminated by 0x7F followed by a two-byte
//! descriptor. The descriptor carries the next line's address (low byte,
//! high nibble, and a bias selector), the next line's font, and the
//! smooth-scroll flag:
//!
//! ```text
//! terminator:  0x7F
//! attr byte:   [scroll][font:2][bias][addr hi:4]
//! addr byte:   next-line address low 8 bits
//! next addr =  ((attr & 0x0F) << 8 | lo) + (bias ? 0x2000 : 0x4000)
//! ```
//!
//! The walk starts at the frame-buffer base each refresh. The first lines of
//! a frame are *fill lines* — timing padding with nothing to display — and
//! their count depends on the refresh rate: 2 at 60 Hz, 5 at 50 Hz.
//!
//! Rendering is cell-cached: a glyph is pushed to the host surface only when
//! its character or font differs from what is already on screen, and the
//! whole walk is skipped when the frame-buffer blocks are clean. Glyphs come
//! from fonts prebuilt out of the character-generator ROM, with the VT100's
//! dot-stretching (a cleared source bit keeps the previous set bit visible,
//! so line-drawing characters connect).

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bus::Bus;
use crate::chips::VERTICAL_INTR_LEVEL;
use crate::cpu::IntrLine;
use crate::memory::BlockType;
use crate::time::Time;

/// Per-line font codes (attr byte bits 5–6).
pub mod font {
    /// Normal 80/132-column cell.
    pub const NORML: u8 = 0x60;
    /// Double width.
    pub const DWIDE: u8 = 0x40;
    /// Double height, top half.
    pub const DHIGH: u8 = 0x20;
    /// Double height, bottom half.
    pub const DHIGH_BOT: u8 = 0x00;
}

/// Display-list descriptor fields.
pub mod lineattr {
    /// Line terminator byte.
    pub const TERMINATOR: u8 = 0x7F;
    pub const FONTMASK: u8 = 0x60;
    /// High nibble of the next line's address.
    pub const ADDRMASK: u8 = 0x0F;
    /// Address bias selector.
    pub const ADDRBIAS: u8 = 0x10;
    /// Smooth-scroll flag.
    pub const SCROLL: u8 = 0x80;
}

/// Bias applied when [`lineattr::ADDRBIAS`] is set.
pub const ADDRBIAS_LO: u32 = 0x2000;
/// Bias applied when [`lineattr::ADDRBIAS`] is clear.
pub const ADDRBIAS_HI: u32 = 0x4000;

/// Upper bound on one line scan; a corrupt list aborts the walk instead of
/// hanging it.
const LINE_SCAN_LIMIT: u32 = 256;

/// Host drawing surface. Coordinates are pixels; `font` is the prerendered
/// glyph grid the source rectangle indexes into.
pub trait DrawingSurface {
    #[allow(clippy::too_many_arguments)]
    fn draw_image(
        &mut self,
        font: &Font,
        sx: u32,
        sy: u32,
        sw: u32,
        sh: u32,
        dx: u32,
        dy: u32,
        dw: u32,
        dh: u32,
    );

    fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, rgb: u32) {
        let _ = (x, y, w, h, rgb);
    }

    fn clear_rect(&mut self, x: u32, y: u32, w: u32, h: u32) {
        let _ = (x, y, w, h);
    }
}

/// Headless surface.
pub struct NullSurface;

impl DrawingSurface for NullSurface {
    fn draw_image(
        &mut self,
        _font: &Font,
        _sx: u32,
        _sy: u32,
        _sw: u32,
        _sh: u32,
        _dx: u32,
        _dy: u32,
        _dw: u32,
        _dh: u32,
    ) {
    }
}

/// Rendition of codes 0x80–0xFF (the per-character attribute bit) in the
/// prebuilt fonts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overlay {
    Reverse,
    Underline,
}

/// A prerendered glyph grid: 256 cells in a 16×16 layout, codes 0x00–0x7F
/// from the character ROM and 0x80–0xFF with the attribute overlay applied.
pub struct Font {
    cx: u32,
    cy: u32,
    width: u32,
    height: u32,
    pixels: Vec<bool>,
}

impl Font {
    const GLYPHS_PER_ROW: u32 = 16;

    /// Builds a font variation from the character ROM. `rom` holds 128
    /// glyphs of `rom.len() / 128` bytes each, one byte per scan row, MSB
    /// leftmost. Dot-stretching doubles every set bit into its right
    /// neighbor.
    #[must_use]
    pub fn build(
        rom: &[u8],
        cx_cell: u32,
        cy_cell: u32,
        double_wide: bool,
        double_high: bool,
        overlay: Overlay,
    ) -> Self {
        let stride = if rom.is_empty() { 0 } else { rom.len() / 128 };
        let cx = cx_cell * if double_wide { 2 } else { 1 };
        let cy = cy_cell * if double_high { 2 } else { 1 };
        let width = cx * Self::GLYPHS_PER_ROW;
        let height = cy * Self::GLYPHS_PER_ROW;
        let mut pixels = vec![false; (width * height) as usize];

        for code in 0..256u32 {
            let glyph = (code & 0x7F) as usize;
            let inverted = code >= 0x80 && overlay == Overlay::Reverse;
            let underlined = code >= 0x80 && overlay == Overlay::Underline;
            let (gx, gy) = (
                (code % Self::GLYPHS_PER_ROW) * cx,
                (code / Self::GLYPHS_PER_ROW) * cy,
            );
            for row in 0..cy_cell {
                let byte = if stride > 0 && (row as usize) < stride {
                    rom[glyph * stride + row as usize]
                } else {
                    0
                };
                for col in 0..cx_cell {
                    // Dot stretch: this source bit, or the one to its left.
                    let bit = |i: u32| i < 8 && (byte >> (7 - i)) & 1 != 0;
                    let mut on = bit(col) || (col > 0 && bit(col - 1));
                    if underlined && row == cy_cell - 1 {
                        on = true;
                    }
                    if inverted {
                        on = !on;
                    }
                    Self::plot(
                        &mut pixels,
                        width,
                        gx,
                        gy,
                        col,
                        row,
                        on,
                        double_wide,
                        double_high,
                    );
                }
            }
        }
        Self {
            cx,
            cy,
            width,
            height,
            pixels,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn plot(
        pixels: &mut [bool],
        width: u32,
        gx: u32,
        gy: u32,
        col: u32,
        row: u32,
        on: bool,
        double_wide: bool,
        double_high: bool,
    ) {
        let (xs, ys) = (
            if double_wide { 2 } else { 1 },
            if double_high { 2 } else { 1 },
        );
        for dy in 0..ys {
            for dx in 0..xs {
                let x = gx + col * xs + dx;
                let y = gy + row * ys + dy;
                pixels[(y * width + x) as usize] = on;
            }
        }
    }

    /// Glyph cell size in this variation.
    #[must_use]
    pub const fn cell_size(&self) -> (u32, u32) {
        (self.cx, self.cy)
    }

    /// Top-left corner of a glyph cell in the grid.
    #[must_use]
    pub const fn glyph_origin(&self, code: u8) -> (u32, u32) {
        (
            (code as u32 % Self::GLYPHS_PER_ROW) * self.cx,
            (code as u32 / Self::GLYPHS_PER_ROW) * self.cy,
        )
    }

    /// One pixel of the grid.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.pixels[(y * self.width + x) as usize]
    }
}

/// Video configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Frame-buffer base address on the memory bus.
    pub addr_buffer: u32,
    /// Frame-buffer window size (dirty tracking granularity).
    pub size_buffer: u32,
    /// Whether the video device installs the frame-buffer RAM itself.
    pub own_buffer: bool,
    pub cols: u32,
    pub rows: u32,
    /// Cell width in pixels (80-column mode; 132-column narrows to 9).
    pub cx_cell: u32,
    pub cy_cell: u32,
    /// Display refresh callbacks per second.
    pub refresh_rate: u32,
    /// Vertical-retrace interrupt rate; 0 disables the interrupt.
    pub interrupt_rate: u32,
    /// Rendition of the per-character attribute bit.
    pub overlay: Overlay,
    /// Character-generator ROM (128 glyphs).
    pub font_rom: Vec<u8>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            addr_buffer: 0x2000,
            size_buffer: 0x1000,
            own_buffer: false,
            cols: 80,
            rows: 24,
            cx_cell: 10,
            cy_cell: 10,
            refresh_rate: 60,
            interrupt_rate: 60,
            overlay: Overlay::Reverse,
            font_rom: Vec::new(),
        }
    }
}

/// Persisted video state.
#[derive(Serialize, Deserialize)]
pub struct VideoState {
    pub id: String,
    pub version: u32,
    pub rate_monitor: u32,
    pub cols: u32,
    pub rows: u32,
    pub scroll_offset: u8,
}

/// State-format version for [`VideoState`].
pub const VIDEO_STATE_VERSION: u32 = 1;

/// The video processor.
pub struct Video {
    config: VideoConfig,
    bus: Rc<RefCell<Bus>>,
    surface: Rc<RefCell<dyn DrawingSurface>>,
    time: Time,
    intr: IntrLine,
    /// Monitor refresh rate programmed through DC011: 50 or 60.
    rate_monitor: u32,
    n_cols_buffer: u32,
    n_rows_buffer: u32,
    /// Current cell width: `cx_cell`, or 9 past 80 columns.
    cx_cell: u32,
    scroll_offset: u8,
    skip_single_cell_update: bool,
    /// Per-cell `(font << 8) | data`, 0xFFFF while unknown.
    cell_cache: Vec<u16>,
    cache_valid: bool,
    font_norml: Font,
    font_dwide: Font,
    font_dhigh: Font,
    line_buffer: Vec<u8>,
    // Allow dead code: the handle is kept so a later SET-UP surface can
    // retune the refresh cadence.
    #[allow(dead_code)]
    timer_refresh: usize,
    n_screen_updates: u64,
}

impl Video {
    #[must_use]
    pub fn new(
        config: VideoConfig,
        bus: Rc<RefCell<Bus>>,
        surface: Rc<RefCell<dyn DrawingSurface>>,
        time: Time,
        intr: IntrLine,
    ) -> Self {
        let cols = config.cols;
        let rows = config.rows;
        let cx = config.cx_cell;
        let mut video = Self {
            font_norml: Font::build(&config.font_rom, cx, config.cy_cell, false, false, config.overlay),
            font_dwide: Font::build(&config.font_rom, cx, config.cy_cell, true, false, config.overlay),
            font_dhigh: Font::build(&config.font_rom, cx, config.cy_cell, true, true, config.overlay),
            config,
            bus,
            surface,
            time,
            intr,
            rate_monitor: 60,
            n_cols_buffer: cols,
            n_rows_buffer: rows,
            cx_cell: cx,
            scroll_offset: 0,
            skip_single_cell_update: false,
            cell_cache: vec![0xFFFF; (cols * rows) as usize],
            cache_valid: false,
            line_buffer: Vec::new(),
            timer_refresh: 0,
            n_screen_updates: 0,
        };
        video.init_buffer();
        video
    }

    /// Installs the frame-buffer RAM when this device owns it.
    fn init_buffer(&mut self) {
        if !self.config.own_buffer {
            return;
        }
        let (addr, size) = (self.config.addr_buffer, self.config.size_buffer);
        if !self
            .bus
            .borrow_mut()
            .add_blocks(addr, size, BlockType::ReadWrite, None)
        {
            debug!("frame buffer at {addr:#06x} already mapped; using existing RAM");
        }
    }

    /// Registers the refresh timer and animation hook. Must run once the
    /// device is behind its `Rc`.
    pub fn init_timers(this: &Rc<RefCell<Self>>) {
        let (time, ms) = {
            let video = this.borrow();
            let rate = video.config.refresh_rate.max(video.config.interrupt_rate).max(1);
            (video.time.clone(), 1000.0 / f64::from(rate))
        };
        let video = Rc::clone(this);
        let timer = time.add_timer(
            "video-refresh",
            Rc::new(move || video.borrow_mut().on_refresh_timer()),
            Some(ms),
        );
        this.borrow_mut().timer_refresh = timer;

        let video = Rc::clone(this);
        time.add_animation(Rc::new(move |_ms| {
            video.borrow_mut().update_monitor(false);
        }));
    }

    fn on_refresh_timer(&mut self) {
        self.update_monitor(false);
        if self.config.interrupt_rate > 0 {
            self.intr.request_intr(VERTICAL_INTR_LEVEL);
        }
    }

    pub fn reset(&mut self) {
        self.rate_monitor = 60;
        self.n_cols_buffer = self.config.cols;
        self.n_rows_buffer = self.config.rows;
        self.cx_cell = self.config.cx_cell;
        self.scroll_offset = 0;
        self.skip_single_cell_update = false;
        self.invalidate_cache();
    }

    fn invalidate_cache(&mut self) {
        self.cell_cache = vec![0xFFFF; (self.n_cols_buffer * self.n_rows_buffer) as usize];
        self.cache_valid = false;
    }

    /// Number of full display-list walks performed.
    #[must_use]
    pub const fn screen_updates(&self) -> u64 {
        self.n_screen_updates
    }

    /// Current smooth-scroll offset.
    #[must_use]
    pub const fn scroll_offset(&self) -> u8 {
        self.scroll_offset
    }

    /// Current buffer dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> (u32, u32) {
        (self.n_cols_buffer, self.n_rows_buffer)
    }

    /// Current monitor rate.
    #[must_use]
    pub const fn rate(&self) -> u32 {
        self.rate_monitor
    }

    // ==================== DC011 / DC012 NOTIFICATIONS ====================

    /// Refresh-rate change (affects the fill-line count of later walks).
    pub fn update_rate(&mut self, nr: u32) {
        self.rate_monitor = nr;
    }

    /// Column/row mode change. Narrows cells to 9 pixels past 80 columns,
    /// resizes the cache and rebuilds the fonts.
    pub fn update_dimensions(&mut self, cols: u32, rows: u32) {
        debug!(cols, rows, "video dimensions");
        self.n_cols_buffer = cols;
        self.n_rows_buffer = rows;
        self.cx_cell = if cols > 80 { 9 } else { self.config.cx_cell };
        let (cx, cy, overlay) = (self.cx_cell, self.config.cy_cell, self.config.overlay);
        self.font_norml = Font::build(&self.config.font_rom, cx, cy, false, false, overlay);
        self.font_dwide = Font::build(&self.config.font_rom, cx, cy, true, false, overlay);
        self.font_dhigh = Font::build(&self.config.font_rom, cx, cy, true, true, overlay);
        self.invalidate_cache();
    }

    /// Smooth-scroll offset change. A non-zero offset forces an immediate
    /// repaint; the wrap back to zero arms the one-cell-update filter, which
    /// swallows the stale cursor repaint the firmware issues mid-scroll.
    pub fn update_scroll_offset(&mut self, offset: u8) {
        if offset == self.scroll_offset {
            return;
        }
        self.scroll_offset = offset;
        if offset != 0 {
            self.update_monitor(true);
        } else {
            self.skip_single_cell_update = true;
        }
    }

    // ==================== REFRESH ====================

    /// Refresh entry point: walks the display list unless nothing changed.
    pub fn update_monitor(&mut self, forced: bool) {
        let clean = self
            .bus
            .borrow_mut()
            .clean_blocks(self.config.addr_buffer, self.config.size_buffer);
        if !forced && clean && self.cache_valid {
            return;
        }
        self.update_screen();
    }

    /// Walks the display list and pushes stale cells to the surface.
    fn update_screen(&mut self) {
        self.n_screen_updates += 1;
        let mut changed: Vec<(u32, u32, u8, u8)> = Vec::new();
        let mut addr_next = self.config.addr_buffer;
        let mut font_next: i16 = -1;
        let mut n_fill = if self.rate_monitor == 60 { 2 } else { 5 };
        let mut n_rows: u32 = 0;

        {
            let mut bus = self.bus.borrow_mut();
            while n_rows < self.n_rows_buffer {
                let font = if font_next < 0 {
                    font::NORML
                } else {
                    font_next as u8
                };
                let n_cols_visible =
                    self.n_cols_buffer >> u32::from(font != font::NORML);

                self.line_buffer.clear();
                let mut p = addr_next;
                let mut scanned = 0u32;
                loop {
                    let data = bus.read_byte(p);
                    p = p.wrapping_add(1);
                    scanned += 1;
                    if scanned > LINE_SCAN_LIMIT {
                        debug!("display list line at {addr_next:#06x} overran; aborting walk");
                        return;
                    }
                    if data == lineattr::TERMINATOR {
                        let attr = bus.read_byte(p);
                        let lo = bus.read_byte(p.wrapping_add(1));
                        font_next = i16::from(attr & lineattr::FONTMASK);
                        addr_next = (u32::from(attr & lineattr::ADDRMASK) << 8)
                            | u32::from(lo);
                        addr_next += if attr & lineattr::ADDRBIAS != 0 {
                            ADDRBIAS_LO
                        } else {
                            ADDRBIAS_HI
                        };
                        break;
                    }
                    if (self.line_buffer.len() as u32) < n_cols_visible {
                        self.line_buffer.push(data);
                    }
                    // Else: scan on for the terminator without storing.
                }

                if n_fill > 0 {
                    n_fill -= 1;
                    continue;
                }

                while (self.line_buffer.len() as u32) < n_cols_visible {
                    self.line_buffer.push(0);
                }
                for col in 0..n_cols_visible {
                    let data = self.line_buffer[col as usize];
                    let entry = (u16::from(font) << 8) | u16::from(data);
                    let index = (n_rows * self.n_cols_buffer + col) as usize;
                    if self.cell_cache[index] != entry {
                        changed.push((col, n_rows, data, font));
                    }
                }
                n_rows += 1;
            }
        }

        // A single-cell delta right after a scroll wrap is the firmware's
        // stale cursor repaint; drop it.
        if self.skip_single_cell_update && changed.len() == 1 {
            trace!("single-cell update skipped after scroll wrap");
            self.skip_single_cell_update = false;
            return;
        }
        self.skip_single_cell_update = false;

        for &(col, row, data, font) in &changed {
            self.draw_cell(col, row, data, font);
            let entry = (u16::from(font) << 8) | u16::from(data);
            self.cell_cache[(row * self.n_cols_buffer + col) as usize] = entry;
        }
        self.cache_valid = true;
    }

    /// Pushes one glyph cell to the surface. Wide fonts occupy two cell
    /// widths; double-height fonts draw one half of a doubled glyph.
    fn draw_cell(&self, col: u32, row: u32, data: u8, font_code: u8) {
        let cy = self.config.cy_cell;
        let font = match font_code {
            font::DWIDE => &self.font_dwide,
            font::DHIGH | font::DHIGH_BOT => &self.font_dhigh,
            _ => &self.font_norml,
        };
        let (gw, _gh) = font.cell_size();
        let (sx, sy) = font.glyph_origin(data);
        let wide = font_code != font::NORML;
        let dx = col * self.cx_cell * if wide { 2 } else { 1 };
        let dy = row * cy;
        // Double-height lines carry half the doubled glyph per screen row.
        let sy = if font_code == font::DHIGH_BOT { sy + cy } else { sy };
        self.surface
            .borrow_mut()
            .draw_image(font, sx, sy, gw, cy, dx, dy, gw, cy);
    }

    // ==================== STATE ====================

    #[must_use]
    pub fn save_state(&self) -> VideoState {
        VideoState {
            id: "video".to_string(),
            version: VIDEO_STATE_VERSION,
            rate_monitor: self.rate_monitor,
            cols: self.n_cols_buffer,
            rows: self.n_rows_buffer,
            scroll_offset: self.scroll_offset,
        }
    }

    pub fn load_state(&mut self, state: &VideoState) -> bool {
        if state.id != "video" || state.version != VIDEO_STATE_VERSION {
            return false;
        }
        self.rate_monitor = state.rate_monitor;
        if (state.cols, state.rows) != (self.n_cols_buffer, self.n_rows_buffer) {
            self.update_dimensions(state.cols, state.rows);
        }
        self.scroll_offset = state.scroll_offset;
        self.invalidate_cache();
        true
    }
}
