use super::cartridge::{Cartridge, PRG_BANK_SIZE};

const NAMETABLE_SIZE: usize = 0x400;
const PRG_RAM_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

impl Mirroring {
    /// Byte offsets of the four logical nametables inside nametable VRAM.
    pub fn nametable_offsets(self) -> [usize; 4] {
        const K: usize = NAMETABLE_SIZE;
        match self {
            Mirroring::Horizontal => [0, 0, K, K],
            Mirroring::Vertical => [0, K, 0, K],
            Mirroring::OneScreenLower => [0, 0, 0, 0],
            Mirroring::OneScreenUpper => [K, K, K, K],
            Mirroring::FourScreen => [0, K, 2 * K, 3 * K],
        }
    }
}

/// Cartridge-side state every board shares: the ROM image, two 16KB PRG
/// windows, work RAM at $6000 and the nametable VRAM behind $2000-$3EFF.
pub struct Board {
    cart: Cartridge,
    prg_ram: Vec<u8>,
    prg_offsets: [usize; 2],
    nametables: Vec<u8>,
    nt_offsets: [usize; 4],
    mirroring: Mirroring,
}

impl Board {
    pub fn new(cart: Cartridge) -> Self {
        let prg_offsets = if cart.prg_banks() == 1 {
            [0, 0]
        } else {
            [0, PRG_BANK_SIZE]
        };
        let vram_size = if cart.four_screen {
            4 * NAMETABLE_SIZE
        } else {
            2 * NAMETABLE_SIZE
        };
        let mirroring = cart.mirroring;
        Self {
            cart,
            prg_ram: vec![0; PRG_RAM_SIZE],
            prg_offsets,
            nametables: vec![0; vram_size],
            nt_offsets: mirroring.nametable_offsets(),
            mirroring,
        }
    }

    pub fn prg_banks(&self) -> usize {
        self.cart.prg_banks().max(1)
    }

    pub fn set_prg_bank(&mut self, slot: usize, bank: usize) {
        self.prg_offsets[slot] = (bank % self.prg_banks()) * PRG_BANK_SIZE;
    }

    pub fn set_mirroring(&mut self, mirroring: Mirroring) {
        if mirroring == Mirroring::FourScreen && self.nametables.len() < 4 * NAMETABLE_SIZE {
            self.nametables.resize(4 * NAMETABLE_SIZE, 0);
        }
        self.mirroring = mirroring;
        self.nt_offsets = mirroring.nametable_offsets();
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    pub fn cpu_read(&self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[addr as usize - 0x6000],
            0x8000..=0xBFFF => self.cart.prg_read(self.prg_offsets[0] + (addr as usize & 0x3FFF)),
            0xC000..=0xFFFF => self.cart.prg_read(self.prg_offsets[1] + (addr as usize & 0x3FFF)),
            _ => 0,
        }
    }

    pub fn write_prg_ram(&mut self, addr: u16, value: u8) {
        if let 0x6000..=0x7FFF = addr {
            self.prg_ram[addr as usize - 0x6000] = value;
        }
    }

    fn nametable_index(&self, addr: u16) -> usize {
        let addr = (addr as usize - 0x2000) & 0x0FFF;
        let slot = addr / NAMETABLE_SIZE;
        (self.nt_offsets[slot] + (addr & 0x3FF)) % self.nametables.len()
    }

    /// Pattern tables and nametables. Palette space is resolved by the PPU.
    pub fn ppu_read(&self, addr: u16) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => self.cart.chr_read(addr as usize),
            0x2000..=0x3EFF => self.nametables[self.nametable_index(addr)],
            _ => 0xFF,
        }
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => self.cart.chr_write(addr as usize, value),
            0x2000..=0x3EFF => {
                let idx = self.nametable_index(addr);
                self.nametables[idx] = value;
            }
            _ => {}
        }
    }
}

pub trait Mapper {
    fn board(&self) -> &Board;
    fn board_mut(&mut self) -> &mut Board;
    fn name(&self) -> &'static str;

    fn cpu_read(&mut self, addr: u16) -> u8 {
        self.board().cpu_read(addr)
    }
    fn cpu_write(&mut self, addr: u16, value: u8) {
        self.board_mut().write_prg_ram(addr, value);
    }
    fn ppu_read(&mut self, addr: u16) -> u8 {
        self.board().ppu_read(addr)
    }
    fn ppu_write(&mut self, addr: u16, value: u8) {
        self.board_mut().ppu_write(addr, value);
    }
    fn mirroring(&self) -> Mirroring {
        self.board().mirroring()
    }
    /// Observes CPU cycles elapsed on the given scanline. Counter-based
    /// boards hook their IRQ logic here.
    fn update(&mut self, _cycles: u32, _scanline: u16) {}
    fn irq_pending(&self) -> bool {
        false
    }
    fn clear_irq(&mut self) {}
}

pub fn mapper_name(mapper_id: u8) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        7 => "AxROM",
        _ => "Unsupported",
    }
}

pub fn is_supported(mapper_id: u8) -> bool {
    matches!(mapper_id, 0 | 2)
}

/// Builds the board for a cartridge. Unknown mapper numbers run as NROM;
/// the caller reports that through `is_supported`.
pub fn create_mapper(cart: Cartridge) -> Box<dyn Mapper> {
    match cart.mapper_id {
        2 => Box::new(Uxrom::new(cart)),
        _ => Box::new(Nrom::new(cart)),
    }
}

/// Mapper 0: PRG fixed, mirrored when only one 16KB bank is present.
pub struct Nrom {
    board: Board,
}

impl Nrom {
    pub fn new(cart: Cartridge) -> Self {
        Self {
            board: Board::new(cart),
        }
    }
}

impl Mapper for Nrom {
    fn board(&self) -> &Board {
        &self.board
    }

    fn board_mut(&mut self) -> &mut Board {
        &mut self.board
    }

    fn name(&self) -> &'static str {
        "NROM"
    }
}

/// Mapper 2: switchable bank at $8000, last bank fixed at $C000.
pub struct Uxrom {
    board: Board,
}

impl Uxrom {
    pub fn new(cart: Cartridge) -> Self {
        let mut board = Board::new(cart);
        let last = board.prg_banks() - 1;
        board.set_prg_bank(1, last);
        Self { board }
    }
}

impl Mapper for Uxrom {
    fn board(&self) -> &Board {
        &self.board
    }

    fn board_mut(&mut self) -> &mut Board {
        &mut self.board
    }

    fn name(&self) -> &'static str {
        "UxROM"
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x8000..=0xFFFF => self.board.set_prg_bank(0, value as usize),
            _ => self.board.write_prg_ram(addr, value),
        }
    }
}
