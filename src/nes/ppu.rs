use super::Interrupts;
use super::cpu::INT_NMI;
use super::mapper::Mapper;
use super::palette::ColorMode;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;
pub const DOTS_PER_SCANLINE: u32 = 341;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_VRAM_INC_32: u8 = 0x04;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

pub const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
pub const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
pub const STATUS_VBLANK: u8 = 0x80;

// Draw buffer entry layout: bits 0-1 pixel, bits 2-3 palette, then sprite flags.
const PIXEL_MASK: u8 = 0x03;
const ENTRY_SPRITE: u8 = 0x10;
const ENTRY_SPRITE_ZERO: u8 = 0x20;
const ENTRY_BEHIND_BG: u8 = 0x40;

const ATTR_BEHIND_BG: u8 = 0x20;
const ATTR_FLIP_X: u8 = 0x40;
const ATTR_FLIP_Y: u8 = 0x80;

const MAX_SPRITES_PER_LINE: usize = 8;
const SPRITE_ZERO_HIT_DELAY: u8 = 3;

/// Folds the 32-byte palette address space onto 28 stored entries.
const PALETTE_MIRROR: [usize; 32] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 0, 16, 17, 18, 4, 19, 20, 21, 8, 22,
    23, 24, 12, 25, 26, 27,
];

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,
    oam_addr: u8,
    oam: [u8; 256],
    palettes: [u8; 28],
    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,
    last_2006_write: u8,

    scanline: u16,
    dot: u32,
    line_done: bool,
    pending_dots: u32,
    skip_scroll_update: bool,
    nmi_suppressed: bool,
    sprite_zero_latched: bool,
    sprite_zero_delay: u8,

    bg_column: usize,
    bg_cursor: usize,
    bg_fine_y: u16,
    bg_bit: i8,
    bg_pattern_lo: u8,
    bg_pattern_hi: u8,
    bg_attr: u8,
    bg_attr_shift: u8,

    color_mode: ColorMode,
    draw_buffer: Vec<u8>,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            palettes: [0; 28],
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            last_2006_write: 0,
            scanline: 0,
            dot: 0,
            line_done: false,
            pending_dots: 0,
            skip_scroll_update: false,
            nmi_suppressed: false,
            sprite_zero_latched: false,
            sprite_zero_delay: 0,
            bg_column: FRAME_WIDTH,
            bg_cursor: 0,
            bg_fine_y: 0,
            bg_bit: 7,
            bg_pattern_lo: 0,
            bg_pattern_hi: 0,
            bg_attr: 0,
            bg_attr_shift: 0,
            color_mode: ColorMode::Normal,
            draw_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn dot(&self) -> u32 {
        self.dot
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn vram_addr(&self) -> u16 {
        self.v
    }

    pub fn temp_addr(&self) -> u16 {
        self.t
    }

    pub fn fine_x(&self) -> u8 {
        self.fine_x
    }

    pub fn ctrl(&self) -> u8 {
        self.ctrl
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    pub fn background_enabled(&self) -> bool {
        self.mask & MASK_SHOW_BG != 0
    }

    pub fn sprites_enabled(&self) -> bool {
        self.mask & MASK_SHOW_SPRITES != 0
    }

    pub fn rendering_enabled(&self) -> bool {
        self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES) != 0
    }

    /// Re-asserts the vblank flag while an NMI is held back one instruction.
    pub fn set_vblank(&mut self) {
        self.status |= STATUS_VBLANK;
    }

    pub fn oam(&self) -> &[u8; 256] {
        &self.oam
    }

    /// One byte of a $4014 transfer, placed relative to the OAM address.
    pub fn dma_write(&mut self, offset: u8, value: u8) {
        self.oam[self.oam_addr.wrapping_add(offset) as usize] = value;
    }

    /// Resolves a draw buffer entry to its 6-bit system color.
    pub fn system_color(&self, entry: u8) -> u8 {
        self.palettes[PALETTE_MIRROR[(entry & 0x1F) as usize]]
    }

    pub fn line(&self, line: usize) -> &[u8] {
        let start = line * FRAME_WIDTH;
        &self.draw_buffer[start..start + FRAME_WIDTH]
    }

    pub fn end_frame(&mut self) {
        self.draw_buffer.fill(0);
        self.bg_cursor = 0;
    }

    pub fn read_register(&mut self, addr: u16, mapper: &mut dyn Mapper, op_cycles: u32) -> u8 {
        match addr & 0x0007 {
            0 => (self.ctrl & 0xFC) | ((self.v >> 10) & 0x03) as u8,
            1 => 0xFF,
            2 => {
                let value = self.status;
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                if self.scanline == 240 && self.dot + op_cycles * 3 > DOTS_PER_SCANLINE {
                    self.nmi_suppressed = true;
                }
                value
            }
            3 => self.oam_addr,
            4 => self.oam[self.oam_addr as usize],
            5 => 0,
            6 => self.last_2006_write,
            _ => {
                let addr = self.v & 0x3FFF;
                let value = if addr >= 0x3F00 {
                    self.palettes[PALETTE_MIRROR[(addr & 0x1F) as usize]]
                } else {
                    let buffered = self.read_buffer;
                    self.read_buffer = mapper.ppu_read(addr);
                    buffered
                };
                self.increment_after_data_access();
                value
            }
        }
    }

    pub fn write_register(
        &mut self,
        addr: u16,
        value: u8,
        mapper: &mut dyn Mapper,
        interrupts: &mut Interrupts,
        op_cycles: u32,
    ) {
        match addr & 0x0007 {
            0 => {
                if (241..=260).contains(&self.scanline)
                    && value & CTRL_NMI_ENABLE != 0
                    && self.status & STATUS_VBLANK != 0
                    && self.ctrl & CTRL_NMI_ENABLE == 0
                {
                    interrupts.nmi_delay = true;
                    interrupts.raise(INT_NMI);
                }
                self.ctrl = value;
                self.t = (self.t & 0x73FF) | (((value & 0x03) as u16) << 10);
            }
            1 => {
                if !self.background_enabled()
                    && value & MASK_SHOW_BG != 0
                    && self.dot < 257
                    && self.dot + op_cycles * 3 > 250
                {
                    self.skip_scroll_update = true;
                }
                self.mask = value;
                match (value & 0xE0) >> 5 {
                    0 => self.color_mode = ColorMode::Normal,
                    7 => self.color_mode = ColorMode::Emphasized,
                    _ => {}
                }
                if value & MASK_GRAYSCALE != 0 {
                    self.color_mode = ColorMode::Grayscale;
                }
            }
            2 => {}
            3 => self.oam_addr = value,
            4 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            5 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x7FE0) | (value >> 3) as u16;
                    self.fine_x = value & 0x07;
                } else {
                    self.t = (self.t & 0x0C1F)
                        | (((value & 0x07) as u16) << 12)
                        | (((value & 0xF8) as u16) << 2);
                }
                self.write_toggle = !self.write_toggle;
            }
            6 => {
                self.last_2006_write = value;
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value & 0x3F) as u16) << 8);
                } else {
                    if self.dot == 255 || self.dot == 256 {
                        self.skip_scroll_update = true;
                    }
                    self.t = (self.t & 0x7F00) | value as u16;
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            _ => {
                let addr = self.v & 0x3FFF;
                if addr >= 0x3F00 {
                    self.palettes[PALETTE_MIRROR[(addr & 0x1F) as usize]] = value & 0x3F;
                } else {
                    mapper.ppu_write(addr, value);
                }
                self.increment_after_data_access();
            }
        }
    }

    fn increment_after_data_access(&mut self) {
        if self.rendering_enabled() && (self.scanline < 240 || self.scanline == 261) {
            self.increment_coarse_x();
            self.increment_coarse_y();
        } else {
            let step = if self.ctrl & CTRL_VRAM_INC_32 != 0 { 32 } else { 1 };
            self.v = (self.v + step) & 0x7FFF;
        }
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 0x001F {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    fn increment_coarse_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v += 0x1000;
            return;
        }
        self.v &= !0x7000;
        let mut coarse_y = (self.v & 0x03E0) >> 5;
        if coarse_y == 29 {
            coarse_y = 0;
            self.v ^= 0x0800;
        } else if coarse_y == 31 {
            coarse_y = 0;
        } else {
            coarse_y += 1;
        }
        self.v = (self.v & !0x03E0) | (coarse_y << 5);
    }

    /// Enters a new scanline: lays down its sprites, primes the background
    /// pipeline and runs any dots carried over from the instruction that
    /// finished the previous one.
    pub fn start_scanline(
        &mut self,
        scanline: u16,
        mapper: &mut dyn Mapper,
        interrupts: &mut Interrupts,
    ) {
        self.scanline = scanline;
        self.line_done = false;
        if (scanline as usize) < FRAME_HEIGHT {
            if self.sprites_enabled() {
                self.render_sprites(mapper);
            }
            if self.background_enabled() {
                self.update_bg_line(mapper);
            }
        }
        let carried = std::mem::take(&mut self.pending_dots);
        self.run_dots(carried, mapper, interrupts);
    }

    /// Advances the dot pipeline. Dots past the end of the scanline are
    /// held until `start_scanline`.
    pub fn run_dots(&mut self, dots: u32, mapper: &mut dyn Mapper, interrupts: &mut Interrupts) {
        if self.line_done {
            self.pending_dots += dots;
            return;
        }
        for ran in 1..=dots {
            self.tick_dot(mapper, interrupts);
            if self.dot >= DOTS_PER_SCANLINE {
                self.dot -= DOTS_PER_SCANLINE;
                self.line_done = true;
                self.pending_dots += dots - ran;
                return;
            }
        }
    }

    fn tick_dot(&mut self, mapper: &mut dyn Mapper, interrupts: &mut Interrupts) {
        if self.sprite_zero_delay > 0 {
            self.sprite_zero_delay -= 1;
            if self.sprite_zero_delay == 0 {
                self.status |= STATUS_SPRITE_ZERO_HIT;
            }
        }

        match (self.scanline, self.dot) {
            (241, 1) => {
                self.status |= STATUS_VBLANK;
                if self.ctrl & CTRL_NMI_ENABLE != 0 && !self.nmi_suppressed {
                    interrupts.raise(INT_NMI);
                }
                self.nmi_suppressed = false;
            }
            (261, 1) => {
                self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
                self.sprite_zero_latched = false;
            }
            (_, 256) => {
                if self.skip_scroll_update {
                    self.skip_scroll_update = false;
                } else if self.rendering_enabled() && self.scanline < 240 {
                    self.increment_coarse_y();
                }
            }
            (_, 257) => {
                if self.skip_scroll_update {
                    self.skip_scroll_update = false;
                } else if self.rendering_enabled() && self.scanline < 240 {
                    self.v = (self.v & 0x7BE0) | (self.t & 0x041F);
                    self.oam_addr = 0;
                }
            }
            (261, 304) => {
                if self.rendering_enabled() {
                    self.v = (self.v & 0x841F) | (self.t & 0x7BE0);
                }
            }
            _ => {}
        }

        if self.bg_column < FRAME_WIDTH && self.background_enabled() {
            self.output_background_pixel(mapper);
        }
        self.bg_column = self.bg_column.saturating_add(1);
        self.dot += 1;
    }

    fn output_background_pixel(&mut self, mapper: &mut dyn Mapper) {
        let bit = self.bg_bit as u8;
        let pattern = ((self.bg_pattern_lo >> bit) & 1) | (((self.bg_pattern_hi >> bit) & 1) << 1);

        if pattern != 0 && !(self.bg_column < 8 && self.mask & MASK_SHOW_BG_LEFT == 0) {
            let entry = pattern | (((self.bg_attr >> self.bg_attr_shift) & 0x03) << 2);
            let cursor = self.bg_cursor;
            let existing = self.draw_buffer[cursor];
            if existing & PIXEL_MASK != 0 {
                if existing & ENTRY_SPRITE_ZERO != 0 && !self.sprite_zero_latched {
                    self.sprite_zero_delay = SPRITE_ZERO_HIT_DELAY;
                    self.sprite_zero_latched = true;
                }
                if existing & ENTRY_BEHIND_BG != 0 {
                    self.draw_buffer[cursor] = entry;
                }
            } else {
                self.draw_buffer[cursor] = entry;
            }
        }
        self.bg_cursor += 1;

        self.bg_bit -= 1;
        if self.bg_bit < 0 {
            self.increment_coarse_x();
            self.fetch_background_tile(mapper);
            self.bg_bit = 7;
        }
    }

    fn fetch_background_tile(&mut self, mapper: &mut dyn Mapper) {
        let tile = mapper.ppu_read(0x2000 | (self.v & 0x0FFF)) as u16;
        let base = if self.ctrl & CTRL_BG_TABLE != 0 { 0x1000 } else { 0 };
        let addr = base + 16 * tile + self.bg_fine_y;
        self.bg_pattern_lo = mapper.ppu_read(addr);
        self.bg_pattern_hi = mapper.ppu_read(addr + 8);
        let attr_addr =
            0x23C0 | (self.v & 0x0C00) | ((self.v >> 4) & 0x38) | ((self.v >> 2) & 0x07);
        self.bg_attr = mapper.ppu_read(attr_addr);
        self.bg_attr_shift = ((((self.v & 0x02) >> 1) | ((self.v & 0x40) >> 5)) * 2) as u8;
    }

    fn update_bg_line(&mut self, mapper: &mut dyn Mapper) {
        self.bg_cursor = self.scanline as usize * FRAME_WIDTH;
        self.bg_fine_y = (self.v & 0x7000) >> 12;
        self.fetch_background_tile(mapper);
        self.bg_bit = if self.fine_x == 0 {
            7
        } else {
            7 - self.fine_x as i8
        };
        self.bg_column = 0;
    }

    /// Sprites go into the draw buffer first; the background pass then
    /// resolves priority against them pixel by pixel.
    fn render_sprites(&mut self, mapper: &mut dyn Mapper) {
        let line = self.scanline as usize;
        let height = if self.ctrl & CTRL_SPRITE_SIZE_16 != 0 {
            16
        } else {
            8
        };

        let mut selected = [0usize; MAX_SPRITES_PER_LINE];
        let mut count = 0;
        for index in (0..256).step_by(4) {
            let first_line = self.oam[index] as usize + 1;
            if line < first_line || line >= first_line + height {
                continue;
            }
            if count == MAX_SPRITES_PER_LINE {
                self.status |= STATUS_SPRITE_OVERFLOW;
                break;
            }
            selected[count] = index;
            count += 1;
        }

        // Lower OAM indices are drawn last so they win overlaps.
        for &index in selected[..count].iter().rev() {
            self.draw_sprite(mapper, index, line, height);
        }
    }

    fn draw_sprite(&mut self, mapper: &mut dyn Mapper, index: usize, line: usize, height: usize) {
        let first_line = self.oam[index] as usize + 1;
        let tile = self.oam[index + 1] as u16;
        let attr = self.oam[index + 2];
        let x = self.oam[index + 3] as usize;

        let tile = if height == 16 {
            ((tile & 1) * 256) | (tile & 0xFE)
        } else {
            let base = if self.ctrl & CTRL_SPRITE_TABLE != 0 {
                256
            } else {
                0
            };
            base + tile
        };

        let offset = line - first_line;
        let mut row = if attr & ATTR_FLIP_Y != 0 {
            (height - 1 - offset) as u16
        } else {
            offset as u16
        };
        if row > 7 {
            row += 8;
        }
        let addr = 16 * tile + row;
        let lo = mapper.ppu_read(addr);
        let hi = mapper.ppu_read(addr + 8);

        let pixels = if x > 248 { 256 - x } else { 8 };
        let flags = ENTRY_SPRITE
            | ((attr & 0x03) << 2)
            | if index == 0 { ENTRY_SPRITE_ZERO } else { 0 }
            | if attr & ATTR_BEHIND_BG != 0 {
                ENTRY_BEHIND_BG
            } else {
                0
            };
        let cursor = line * FRAME_WIDTH + x;

        for i in 0..pixels {
            let bit = if attr & ATTR_FLIP_X != 0 { i } else { 7 - i };
            let pixel = ((lo >> bit) & 1) | (((hi >> bit) & 1) << 1);
            if pixel == 0 || (x + i < 8 && self.mask & MASK_SHOW_SPRITE_LEFT == 0) {
                continue;
            }
            self.draw_buffer[cursor + i] = flags | pixel;
        }
    }
}
