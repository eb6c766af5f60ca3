pub mod apu;
pub mod cartridge;
pub mod cpu;
pub mod joypad;
pub mod mapper;
pub mod palette;
pub mod ppu;

use anyhow::Result;
use std::{collections::VecDeque, path::Path};

use apu::Apu;
use cartridge::Cartridge;
use cpu::{Cpu, CpuBus, INT_MAPPER_IRQ};
use joypad::Joypad;
use mapper::{Mapper, create_mapper, is_supported, mapper_name};
use palette::ColorMode;
use ppu::{FRAME_WIDTH, Ppu};

pub const SCREEN_WIDTH: usize = 256;
pub const SCREEN_HEIGHT: usize = 224;
/// First draw buffer row copied to the screen; the top and bottom 8 rows
/// are cropped.
const FIRST_SHOWN_LINE: u16 = 8;
const SCANLINES_PER_FRAME: u16 = 262;
/// CPU cycles per scanline, rotated to average 113.67 cycles per line.
const LINE_BUDGETS: [u32; 3] = [114, 114, 113];
const OAM_DMA_CYCLES: u32 = 513;
const MAX_DEBUG_EVENTS: usize = 512;

/// Pending interrupt lines plus the one-instruction NMI and IRQ deferrals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interrupts {
    pub lines: u8,
    pub nmi_delay: bool,
    pub irq_delay: bool,
}

impl Interrupts {
    pub fn raise(&mut self, line: u8) {
        self.lines |= line;
    }

    pub fn clear(&mut self, line: u8) {
        self.lines &= !line;
    }

    pub fn is_raised(&self, line: u8) -> bool {
        self.lines & line != 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleCounters {
    pub frames: u64,
    pub cpu_steps: u64,
    pub nmis: u64,
    pub irqs: u64,
    pub dma_transfers: u64,
    pub unknown_opcodes: u64,
}

/// Outcome of a successful ROM load.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub mapper_name: String,
    /// Set when the cartridge needs a board this emulator does not have.
    pub warning: Option<String>,
}

/// Everything the CPU can reach: work RAM, the PPU and APU register
/// files, the controller ports and the cartridge.
pub struct Bus {
    ram: [u8; 2048],
    ppu: Ppu,
    apu: Apu,
    mapper: Option<Box<dyn Mapper>>,
    joypad: Joypad,
    interrupts: Interrupts,
    scanline: u16,
    op_cycles: u32,
    stall_cycles: u32,
    counters: ConsoleCounters,
    events: VecDeque<String>,
}

impl Bus {
    fn new() -> Self {
        Self {
            ram: [0; 2048],
            ppu: Ppu::new(),
            apu: Apu::new(),
            mapper: None,
            joypad: Joypad::new(),
            interrupts: Interrupts::default(),
            scanline: 0,
            op_cycles: 0,
            stall_cycles: 0,
            counters: ConsoleCounters::default(),
            events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        }
    }

    fn push_event<S: Into<String>>(&mut self, event: S) {
        if self.events.len() >= MAX_DEBUG_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event.into());
    }

    fn start_scanline(&mut self, scanline: u16) {
        self.scanline = scanline;
        if let Some(mapper) = self.mapper.as_mut() {
            self.ppu
                .start_scanline(scanline, mapper.as_mut(), &mut self.interrupts);
        }
    }

    /// Lets the PPU and the cartridge catch up with CPU cycles just spent.
    fn advance(&mut self, cycles: u32) {
        let Some(mapper) = self.mapper.as_mut() else {
            return;
        };
        self.ppu
            .run_dots(cycles * 3, mapper.as_mut(), &mut self.interrupts);
        mapper.update(cycles, self.scanline);
        if mapper.irq_pending() {
            self.interrupts.raise(INT_MAPPER_IRQ);
        }
    }

    fn audio_update(&mut self) {
        if let Some(mapper) = self.mapper.as_mut() {
            self.apu.audio_update(mapper.as_mut(), &mut self.interrupts);
        }
    }

    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        for offset in 0..=255u8 {
            let value = self.read(base | offset as u16);
            self.ppu.dma_write(offset, value);
        }
        self.stall_cycles += OAM_DMA_CYCLES;
        self.counters.dma_transfers += 1;
        self.push_event(format!("OAM DMA page=${page:02X}"));
    }

    /// Side-effect-free view of CPU address space for the debugger.
    fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize & 0x07FF],
            0x6000..=0xFFFF => self
                .mapper
                .as_ref()
                .map_or(0, |mapper| mapper.board().cpu_read(addr)),
            _ => 0,
        }
    }
}

impl CpuBus for Bus {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize & 0x07FF],
            0x2000..=0x3FFF => match self.mapper.as_mut() {
                Some(mapper) => self
                    .ppu
                    .read_register(addr, mapper.as_mut(), self.op_cycles),
                None => 0,
            },
            0x4015 => self.apu.read_status(&mut self.interrupts),
            0x4016 => self.joypad.read(0),
            0x4017 => self.joypad.read(1),
            0x4000..=0x401F => 0,
            _ => self
                .mapper
                .as_mut()
                .map_or(0, |mapper| mapper.cpu_read(addr)),
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize & 0x07FF] = value,
            0x2000..=0x3FFF => {
                if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.write_register(
                        addr,
                        value,
                        mapper.as_mut(),
                        &mut self.interrupts,
                        self.op_cycles,
                    );
                }
            }
            0x4014 => self.oam_dma(value),
            0x4016 => self.joypad.write_strobe(0, value),
            0x4000..=0x4017 => self.apu.write_register(addr, value, &mut self.interrupts),
            0x4018..=0x401F => {}
            _ => {
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.cpu_write(addr, value);
                }
            }
        }
    }

    fn interrupt_lines(&self) -> u8 {
        self.interrupts.lines
    }

    fn acknowledge(&mut self, line: u8) {
        self.interrupts.clear(line);
        if line == INT_MAPPER_IRQ {
            if let Some(mapper) = self.mapper.as_mut() {
                mapper.clear_irq();
            }
        }
    }

    fn take_nmi_delay(&mut self) -> bool {
        std::mem::take(&mut self.interrupts.nmi_delay)
    }

    fn defer_nmi(&mut self) {
        self.ppu.set_vblank();
    }

    fn take_irq_delay(&mut self) -> bool {
        std::mem::take(&mut self.interrupts.irq_delay)
    }

    fn set_irq_delay(&mut self) {
        self.interrupts.irq_delay = true;
    }

    fn begin_opcode(&mut self, base_cycles: u32) {
        self.op_cycles = base_cycles;
    }

    fn take_stall_cycles(&mut self) -> u32 {
        std::mem::take(&mut self.stall_cycles) + self.apu.take_stall_cycles()
    }

    fn interrupt_serviced(&mut self, nmi: bool, vector_target: u16) {
        if nmi {
            self.counters.nmis += 1;
            self.push_event(format!(
                "NMI serviced at scanline {} -> PC=${vector_target:04X}",
                self.scanline
            ));
        } else {
            self.counters.irqs += 1;
            self.push_event(format!("IRQ serviced -> PC=${vector_target:04X}"));
        }
    }

    fn unknown_opcode(&mut self, opcode: u8, pc: u16) {
        self.counters.unknown_opcodes += 1;
        self.push_event(format!("Unknown opcode ${opcode:02X} @ ${pc:04X}"));
    }
}

/// The whole console: CPU plus system bus, advanced scanline by scanline.
pub struct Nes {
    cpu: Cpu,
    bus: Bus,
    screen: Vec<u8>,
    mapper_name: String,
    scanline: u16,
    line_started: bool,
    budget_index: usize,
    cycle_balance: u32,
    halted: bool,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            screen: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
            mapper_name: "No ROM loaded".to_string(),
            scanline: 0,
            line_started: false,
            budget_index: 0,
            cycle_balance: 0,
            halted: false,
        }
    }

    pub fn has_rom(&self) -> bool {
        self.bus.mapper.is_some()
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.bus.ppu
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn counters(&self) -> ConsoleCounters {
        self.bus.counters
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// 256x224 system color indices of the last completed frame.
    pub fn screen(&self) -> &[u8] {
        &self.screen
    }

    pub fn color_mode(&self) -> ColorMode {
        self.bus.ppu.color_mode()
    }

    /// Signed 16-bit mono samples flushed at the end of the last frame.
    pub fn audio_frame(&self) -> &[i16] {
        self.bus.apu.frame()
    }

    pub fn joypad_mut(&mut self) -> &mut Joypad {
        &mut self.bus.joypad
    }

    pub fn set_buttons(&mut self, port: usize, buttons: u8) {
        self.bus.joypad.set_buttons(port, buttons);
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.bus.peek(addr)
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<String> {
        self.bus.events.iter().rev().take(limit).cloned().collect()
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<LoadReport> {
        let cart = Cartridge::from_file(path)?;
        Ok(self.load_cartridge(cart))
    }

    pub fn load_cartridge(&mut self, cart: Cartridge) -> LoadReport {
        let mapper_id = cart.mapper_id;
        let warning = if is_supported(mapper_id) {
            None
        } else {
            let message = format!(
                "Mapper {mapper_id} ({}) is not supported; running as NROM",
                mapper_name(mapper_id)
            );
            self.bus.push_event(format!("Unsupported mapper: {message}"));
            Some(message)
        };

        let mapper = create_mapper(cart);
        self.mapper_name = format!("{} (mapper {mapper_id})", mapper.name());
        self.bus.mapper = Some(mapper);
        self.bus.ram = [0; 2048];
        self.reset();
        self.bus
            .push_event(format!("ROM loaded: {}", self.mapper_name));

        LoadReport {
            mapper_name: self.mapper_name.clone(),
            warning,
        }
    }

    pub fn reset(&mut self) {
        if !self.has_rom() {
            return;
        }
        self.bus.ppu.reset();
        self.bus.apu.reset();
        self.bus.interrupts = Interrupts::default();
        self.bus.stall_cycles = 0;
        self.bus.op_cycles = 0;
        self.screen.fill(0);
        self.scanline = 0;
        self.line_started = false;
        self.budget_index = 0;
        self.cycle_balance = 0;
        self.halted = false;

        self.cpu.reset(&mut self.bus);
        self.bus
            .push_event(format!("CPU reset, PC=${:04X}", self.cpu.pc));
    }

    /// Runs until the next 262-line frame completes. A halted console only
    /// flushes a silent audio frame.
    pub fn run_frame(&mut self) {
        if !self.has_rom() {
            return;
        }
        if self.halted {
            self.bus.apu.flush_frame(true);
            return;
        }
        let frame = self.bus.counters.frames;
        while self.bus.counters.frames == frame {
            self.step_instruction();
        }
    }

    /// Executes one CPU instruction (or interrupt entry) and lets the rest of
    /// the machine catch up. Returns the cycles consumed.
    pub fn step_instruction(&mut self) -> u32 {
        if !self.has_rom() {
            return 0;
        }
        loop {
            if !self.line_started {
                self.bus.start_scanline(self.scanline);
                self.line_started = true;
            }
            if self.cycle_balance < LINE_BUDGETS[self.budget_index] {
                break;
            }
            self.finish_scanline();
        }

        let cycles = self.cpu.step(&mut self.bus);
        self.bus.counters.cpu_steps += 1;
        self.cycle_balance += cycles;
        self.bus.advance(cycles);

        if self.cycle_balance >= LINE_BUDGETS[self.budget_index] {
            self.finish_scanline();
        }
        cycles
    }

    fn finish_scanline(&mut self) {
        self.bus.audio_update();
        self.cycle_balance -= LINE_BUDGETS[self.budget_index];
        self.budget_index = (self.budget_index + 1) % LINE_BUDGETS.len();

        if (FIRST_SHOWN_LINE..FIRST_SHOWN_LINE + SCREEN_HEIGHT as u16).contains(&self.scanline) {
            let row = (self.scanline - FIRST_SHOWN_LINE) as usize * SCREEN_WIDTH;
            let ppu = &self.bus.ppu;
            let line = ppu.line(self.scanline as usize);
            for (pixel, &entry) in self.screen[row..row + FRAME_WIDTH]
                .iter_mut()
                .zip(line)
            {
                *pixel = ppu.system_color(entry);
            }
        }

        self.line_started = false;
        self.scanline += 1;
        if self.scanline == SCANLINES_PER_FRAME {
            self.scanline = 0;
            self.bus.apu.flush_frame(false);
            self.bus.ppu.end_frame();
            self.bus.counters.frames += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::{CHR_BANK_SIZE, PRG_BANK_SIZE};
    use crate::nes::joypad::{BUTTON_A, BUTTON_START};
    use crate::nes::mapper::Mirroring;

    const NMI_HANDLER: u16 = 0x8100;

    /// One 16KB bank mirrored at $8000 and $C000. The program starts at
    /// $8000 and the NMI handler at $8100 increments $10.
    fn make_cart(mapper_id: u8, program: &[u8]) -> Cartridge {
        let mut prg = vec![0xEA; PRG_BANK_SIZE];
        prg[..program.len()].copy_from_slice(program);
        let handler = (NMI_HANDLER & 0x3FFF) as usize;
        prg[handler..handler + 3].copy_from_slice(&[0xE6, 0x10, 0x40]);
        prg[0x3FFA..].copy_from_slice(&[0x00, 0x81, 0x00, 0x80, 0x00, 0x80]);
        Cartridge {
            mapper_id,
            mirroring: Mirroring::Vertical,
            four_screen: false,
            prg_rom: prg,
            chr_data: vec![0; CHR_BANK_SIZE],
            chr_is_ram: true,
        }
    }

    fn booted(program: &[u8]) -> Nes {
        let mut nes = Nes::new();
        let report = nes.load_cartridge(make_cart(0, program));
        assert!(report.warning.is_none());
        nes
    }

    const SPIN: [u8; 3] = [0x4C, 0x00, 0x80];

    #[test]
    fn load_seeds_pc_from_reset_vector_and_logs() {
        let nes = booted(&SPIN);
        assert_eq!(nes.cpu().pc, 0x8000);
        assert_eq!(nes.mapper_name(), "NROM (mapper 0)");
        let events = nes.recent_events(2);
        assert!(events[0].starts_with("ROM loaded"));
        assert!(events[1].contains("PC=$8000"));
    }

    #[test]
    fn unsupported_mapper_loads_as_nrom_with_warning() {
        let mut nes = Nes::new();
        let report = nes.load_cartridge(make_cart(4, &SPIN));
        let warning = report.warning.expect("warning for mapper 4");
        assert!(warning.contains("MMC3"));
        assert_eq!(report.mapper_name, "NROM (mapper 4)");
        assert!(nes.has_rom());
    }

    #[test]
    fn ram_is_mirrored_every_two_kilobytes() {
        // LDA #$42; STA $0800; JMP $8005
        let mut nes = booted(&[0xA9, 0x42, 0x8D, 0x00, 0x08, 0x4C, 0x05, 0x80]);
        nes.step_instruction();
        nes.step_instruction();
        assert_eq!(nes.peek(0x0000), 0x42);
        assert_eq!(nes.peek(0x1800), 0x42);
    }

    #[test]
    fn frame_consumes_scanline_budgets() {
        let mut nes = booted(&SPIN);
        nes.run_frame();
        assert_eq!(nes.counters().frames, 1);
        assert_eq!(nes.scanline(), 0);
        let expected = 87 * (114 + 114 + 113) + 114;
        assert!((expected..expected + 3).contains(&nes.cpu().cycles));
    }

    #[test]
    fn vblank_nmi_runs_handler_once_per_frame() {
        // LDA #$80; STA $2000; JMP $8005
        let mut nes = booted(&[0xA9, 0x80, 0x8D, 0x00, 0x20, 0x4C, 0x05, 0x80]);
        nes.run_frame();
        assert_eq!(nes.peek(0x0010), 1);
        nes.run_frame();
        assert_eq!(nes.peek(0x0010), 2);
        assert_eq!(nes.counters().nmis, 2);
    }

    #[test]
    fn oam_dma_copies_page_and_stalls_cpu() {
        let mut nes = booted(&SPIN);
        for i in 0..256u16 {
            nes.bus.write(0x0300 + i, i as u8);
        }
        nes.bus.write(0x2003, 0x10);
        nes.bus.write(0x4014, 0x03);
        assert_eq!(nes.ppu().oam()[0x10], 0x00);
        assert_eq!(nes.ppu().oam()[0x0F], 0xFF);
        assert_eq!(nes.bus.take_stall_cycles(), OAM_DMA_CYCLES);
        assert_eq!(nes.counters().dma_transfers, 1);
    }

    #[test]
    fn controller_ports_read_serially() {
        let mut nes = booted(&SPIN);
        nes.set_buttons(0, BUTTON_A | BUTTON_START);
        nes.bus.write(0x4016, 1);
        nes.bus.write(0x4016, 0);
        let bits: Vec<u8> = (0..4).map(|_| nes.bus.read(0x4016) & 1).collect();
        assert_eq!(bits, vec![1, 0, 0, 1]);
        assert_eq!(nes.bus.read(0x4017), 0x40);
    }

    #[test]
    fn halted_console_keeps_state_and_outputs_silence() {
        let mut nes = booted(&SPIN);
        nes.run_frame();
        let cycles = nes.cpu().cycles;
        nes.set_halted(true);
        nes.run_frame();
        assert_eq!(nes.cpu().cycles, cycles);
        assert!(nes.audio_frame().iter().all(|&s| s == 0));
        assert_eq!(nes.audio_frame().len(), apu::SAMPLES_PER_FRAME);
    }

    #[test]
    fn unknown_opcode_is_counted_and_logged() {
        let mut nes = booted(&[0x02, 0x4C, 0x01, 0x80]);
        nes.step_instruction();
        assert_eq!(nes.counters().unknown_opcodes, 1);
        assert_eq!(nes.recent_events(1)[0], "Unknown opcode $02 @ $8000");
    }

    #[test]
    fn backdrop_color_reaches_the_screen() {
        // LDA #$3F; STA $2006; LDA #$00; STA $2006; LDA #$21; STA $2007; JMP
        let program = [
            0xA9, 0x3F, 0x8D, 0x06, 0x20, 0xA9, 0x00, 0x8D, 0x06, 0x20, 0xA9, 0x21, 0x8D, 0x07,
            0x20, 0x4C, 0x0F, 0x80,
        ];
        let mut nes = booted(&program);
        nes.run_frame();
        assert_eq!(nes.screen().len(), SCREEN_WIDTH * SCREEN_HEIGHT);
        assert!(nes.screen().iter().all(|&c| c == 0x21));
    }

    #[test]
    fn running_without_rom_is_a_no_op() {
        let mut nes = Nes::new();
        nes.run_frame();
        assert_eq!(nes.step_instruction(), 0);
        assert_eq!(nes.counters().frames, 0);
    }
}
