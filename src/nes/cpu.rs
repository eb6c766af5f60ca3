pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

pub const INT_FRAME_IRQ: u8 = 0x01;
pub const INT_DMC_IRQ: u8 = 0x02;
pub const INT_MAPPER_IRQ: u8 = 0x04;
pub const INT_NMI: u8 = 0x08;
const IRQ_LINES: [u8; 3] = [INT_FRAME_IRQ, INT_DMC_IRQ, INT_MAPPER_IRQ];

const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;

pub const INTERRUPT_CYCLES: u32 = 7;
const UNKNOWN_OPCODE_CYCLES: u32 = 2;

#[rustfmt::skip]
const BASE_CYCLES: [u8; 256] = [
    7, 6, 2, 7, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 7, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 6, 7,
    6, 6, 2, 7, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 7, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 7, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6,
    2, 5, 2, 7, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 7, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6,
    2, 5, 2, 7, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 6, 2, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 5, 2, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4,
    2, 6, 2, 7, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 7, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 7, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 7, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
];

/// Everything the CPU touches outside its own registers. The console's
/// system bus implements this; tests use a flat 64 KB memory.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);

    /// Pending interrupt sources as an `INT_*` bitmask.
    fn interrupt_lines(&self) -> u8;
    fn acknowledge(&mut self, line: u8);

    /// Returns and clears the one-instruction NMI deferral.
    fn take_nmi_delay(&mut self) -> bool;
    /// Called when a pending NMI is held back by the deferral.
    fn defer_nmi(&mut self) {}
    /// Returns and clears the one-instruction IRQ suppression.
    fn take_irq_delay(&mut self) -> bool;
    fn set_irq_delay(&mut self);

    /// Base cycle cost of the opcode about to execute.
    fn begin_opcode(&mut self, _base_cycles: u32) {}
    /// One-shot cycle charges from DMA fetches made during the instruction.
    fn take_stall_cycles(&mut self) -> u32 {
        0
    }

    fn interrupt_serviced(&mut self, _nmi: bool, _vector_target: u16) {}
    fn unknown_opcode(&mut self, _opcode: u8, _pc: u16) {}
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub sp: u8,
    pub pc: u16,
    pub cycles: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            sp: 0xFD,
            pc: 0,
            cycles: 0,
        }
    }

    pub fn reset(&mut self, bus: &mut impl CpuBus) {
        *self = Self::new();
        self.pc = read_u16(bus, RESET_VECTOR);
    }

    /// Services one pending interrupt or executes one instruction and
    /// returns the CPU cycles consumed.
    pub fn step(&mut self, bus: &mut impl CpuBus) -> u32 {
        if let Some(cycles) = self.poll_interrupts(bus) {
            self.cycles += cycles as u64;
            return cycles;
        }

        let opcode_pc = self.pc;
        let opcode = self.fetch_byte(bus);
        let base = BASE_CYCLES[opcode as usize] as u32;
        bus.begin_opcode(base);

        let cycles = match self.execute(bus, opcode) {
            Some(extra) => base + extra,
            None => {
                // Rejected before any bus access.
                bus.begin_opcode(UNKNOWN_OPCODE_CYCLES);
                bus.unknown_opcode(opcode, opcode_pc);
                UNKNOWN_OPCODE_CYCLES
            }
        };
        let cycles = cycles + bus.take_stall_cycles();
        self.cycles += cycles as u64;
        cycles
    }

    fn poll_interrupts(&mut self, bus: &mut impl CpuBus) -> Option<u32> {
        let lines = bus.interrupt_lines();

        if lines & INT_NMI != 0 {
            if bus.take_nmi_delay() {
                bus.defer_nmi();
            } else {
                bus.acknowledge(INT_NMI);
                self.interrupt(bus, NMI_VECTOR);
                bus.interrupt_serviced(true, self.pc);
                return Some(INTERRUPT_CYCLES);
            }
        }

        let delayed = bus.take_irq_delay();
        if delayed || self.get_flag(FLAG_INTERRUPT) {
            return None;
        }
        let line = IRQ_LINES.into_iter().find(|line| lines & line != 0)?;
        bus.acknowledge(line);
        self.interrupt(bus, IRQ_VECTOR);
        bus.interrupt_serviced(false, self.pc);
        Some(INTERRUPT_CYCLES)
    }

    fn interrupt(&mut self, bus: &mut impl CpuBus, vector: u16) {
        self.push_u16(bus, self.pc);
        self.push(bus, (self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = read_u16(bus, vector);
    }

    /// Extra cycles on top of the base table, or `None` for an opcode
    /// outside the supported set.
    fn execute(&mut self, bus: &mut impl CpuBus, opcode: u8) -> Option<u32> {
        if let Some(extra) = self.exec_single_byte(bus, opcode) {
            return Some(extra);
        }

        let cc = opcode & 0x03;
        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;

        match cc {
            0x01 => self.exec_group1(bus, aaa, bbb),
            0x02 => self.exec_group2(bus, aaa, bbb),
            0x00 => self.exec_group0(bus, opcode),
            _ => None,
        }
    }

    fn exec_single_byte(&mut self, bus: &mut impl CpuBus, opcode: u8) -> Option<u32> {
        match opcode {
            0x08 => self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED),
            0x18 => self.set_flag(FLAG_CARRY, false),
            0x28 => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
                bus.set_irq_delay();
            }
            0x38 => self.set_flag(FLAG_CARRY, true),
            0x48 => self.push(bus, self.a),
            0x58 => {
                self.set_flag(FLAG_INTERRUPT, false);
                bus.set_irq_delay();
            }
            0x68 => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
            }
            0x78 => {
                self.set_flag(FLAG_INTERRUPT, true);
                bus.set_irq_delay();
            }
            0x88 => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
            }
            0x8A => {
                self.a = self.x;
                self.update_zn(self.a);
            }
            0x98 => {
                self.a = self.y;
                self.update_zn(self.a);
            }
            0x9A => self.sp = self.x,
            0xA8 => {
                self.y = self.a;
                self.update_zn(self.y);
            }
            0xAA => {
                self.x = self.a;
                self.update_zn(self.x);
            }
            0xB8 => self.set_flag(FLAG_OVERFLOW, false),
            0xBA => {
                self.x = self.sp;
                self.update_zn(self.x);
            }
            0xC8 => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
            }
            0xCA => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
            }
            0xD8 => self.set_flag(FLAG_DECIMAL, false),
            0xE8 => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
            }
            0xEA | 0x1A | 0x3A | 0x5A | 0x7A | 0xDA | 0xFA => {}
            0xF8 => self.set_flag(FLAG_DECIMAL, true),
            // Two-byte immediate NOPs.
            0x80 | 0x82 | 0x89 | 0xC2 | 0xE2 => {
                self.fetch_byte(bus);
            }
            _ => return None,
        }
        Some(0)
    }

    fn exec_group1(&mut self, bus: &mut impl CpuBus, aaa: u8, bbb: u8) -> Option<u32> {
        let is_store = aaa == 4;

        if bbb == 2 {
            if is_store {
                return None;
            }
            let value = self.fetch_byte(bus);
            self.exec_group1_alu(aaa, value);
            return Some(0);
        }

        let (addr, page_crossed) = match bbb {
            0 => (self.addr_indx(bus), false),
            1 => (self.addr_zp(bus), false),
            3 => (self.addr_abs(bus), false),
            4 => self.addr_indy(bus),
            5 => (self.addr_zpx(bus), false),
            6 => self.addr_absy(bus),
            7 => self.addr_absx(bus),
            _ => return None,
        };

        if is_store {
            bus.write(addr, self.a);
            return Some(0);
        }

        let value = bus.read(addr);
        self.exec_group1_alu(aaa, value);
        Some(page_crossed as u32)
    }

    fn exec_group1_alu(&mut self, aaa: u8, value: u8) {
        match aaa {
            0 => self.ora(value),
            1 => self.and(value),
            2 => self.eor(value),
            3 => self.adc(value),
            5 => {
                self.a = value;
                self.update_zn(self.a);
            }
            6 => self.compare(self.a, value),
            7 => self.sbc(value),
            _ => {}
        }
    }

    fn exec_group2(&mut self, bus: &mut impl CpuBus, aaa: u8, bbb: u8) -> Option<u32> {
        match aaa {
            0 => self.exec_rmw(bus, bbb, RmwOp::Asl),
            1 => self.exec_rmw(bus, bbb, RmwOp::Rol),
            2 => self.exec_rmw(bus, bbb, RmwOp::Lsr),
            3 => self.exec_rmw(bus, bbb, RmwOp::Ror),
            4 => self.exec_stx(bus, bbb),
            5 => self.exec_ldx(bus, bbb),
            6 => self.exec_rmw(bus, bbb, RmwOp::Dec),
            _ => self.exec_rmw(bus, bbb, RmwOp::Inc),
        }
    }

    fn exec_stx(&mut self, bus: &mut impl CpuBus, bbb: u8) -> Option<u32> {
        let addr = match bbb {
            1 => self.addr_zp(bus),
            3 => self.addr_abs(bus),
            5 => self.addr_zpy(bus),
            _ => return None,
        };
        bus.write(addr, self.x);
        Some(0)
    }

    fn exec_ldx(&mut self, bus: &mut impl CpuBus, bbb: u8) -> Option<u32> {
        let (value, page) = match bbb {
            0 => (self.fetch_byte(bus), false),
            1 => {
                let addr = self.addr_zp(bus);
                (bus.read(addr), false)
            }
            3 => {
                let addr = self.addr_abs(bus);
                (bus.read(addr), false)
            }
            5 => {
                let addr = self.addr_zpy(bus);
                (bus.read(addr), false)
            }
            7 => {
                let (addr, page) = self.addr_absy(bus);
                (bus.read(addr), page)
            }
            _ => return None,
        };
        self.x = value;
        self.update_zn(self.x);
        Some(page as u32)
    }

    fn exec_rmw(&mut self, bus: &mut impl CpuBus, bbb: u8, op: RmwOp) -> Option<u32> {
        if bbb == 2 {
            if matches!(op, RmwOp::Dec | RmwOp::Inc) {
                return None;
            }
            self.a = self.apply_rmw(op, self.a);
            return Some(0);
        }

        let addr = match bbb {
            1 => self.addr_zp(bus),
            3 => self.addr_abs(bus),
            5 => self.addr_zpx(bus),
            7 => self.addr_absx(bus).0,
            _ => return None,
        };

        let value = bus.read(addr);
        let out = self.apply_rmw(op, value);
        bus.write(addr, out);
        Some(0)
    }

    fn apply_rmw(&mut self, op: RmwOp, value: u8) -> u8 {
        match op {
            RmwOp::Asl => self.asl(value),
            RmwOp::Rol => self.rol(value),
            RmwOp::Lsr => self.lsr(value),
            RmwOp::Ror => self.ror(value),
            RmwOp::Dec => {
                let out = value.wrapping_sub(1);
                self.update_zn(out);
                out
            }
            RmwOp::Inc => {
                let out = value.wrapping_add(1);
                self.update_zn(out);
                out
            }
        }
    }

    fn exec_group0(&mut self, bus: &mut impl CpuBus, opcode: u8) -> Option<u32> {
        match opcode {
            0x00 => {
                let ret = self.pc.wrapping_add(1);
                self.push_u16(bus, ret);
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = read_u16(bus, IRQ_VECTOR);
            }
            0x10 => return Some(self.branch(bus, !self.get_flag(FLAG_NEGATIVE))),
            0x20 => {
                let addr = self.fetch_word(bus);
                self.push_u16(bus, self.pc.wrapping_sub(1));
                self.pc = addr;
            }
            0x24 | 0x2C => {
                let addr = if opcode == 0x24 {
                    self.addr_zp(bus)
                } else {
                    self.addr_abs(bus)
                };
                let value = bus.read(addr);
                self.bit(value);
            }
            0x30 => return Some(self.branch(bus, self.get_flag(FLAG_NEGATIVE))),
            0x40 => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16(bus);
                bus.set_irq_delay();
            }
            0x4C => self.pc = self.fetch_word(bus),
            0x50 => return Some(self.branch(bus, !self.get_flag(FLAG_OVERFLOW))),
            0x60 => self.pc = self.pop_u16(bus).wrapping_add(1),
            0x6C => {
                let ptr = self.fetch_word(bus);
                self.pc = read_u16_page_wrapped(bus, ptr);
            }
            0x70 => return Some(self.branch(bus, self.get_flag(FLAG_OVERFLOW))),
            0x84 | 0x8C | 0x94 => {
                let addr = match opcode {
                    0x84 => self.addr_zp(bus),
                    0x8C => self.addr_abs(bus),
                    _ => self.addr_zpx(bus),
                };
                bus.write(addr, self.y);
            }
            0x90 => return Some(self.branch(bus, !self.get_flag(FLAG_CARRY))),
            0xA0 | 0xA4 | 0xAC | 0xB4 | 0xBC => {
                let (value, page) = match opcode {
                    0xA0 => (self.fetch_byte(bus), false),
                    0xA4 => {
                        let addr = self.addr_zp(bus);
                        (bus.read(addr), false)
                    }
                    0xAC => {
                        let addr = self.addr_abs(bus);
                        (bus.read(addr), false)
                    }
                    0xB4 => {
                        let addr = self.addr_zpx(bus);
                        (bus.read(addr), false)
                    }
                    _ => {
                        let (addr, page) = self.addr_absx(bus);
                        (bus.read(addr), page)
                    }
                };
                self.y = value;
                self.update_zn(self.y);
                return Some(page as u32);
            }
            0xB0 => return Some(self.branch(bus, self.get_flag(FLAG_CARRY))),
            0xC0 | 0xC4 | 0xCC | 0xE0 | 0xE4 | 0xEC => {
                let value = match opcode & 0x0F {
                    0x00 => self.fetch_byte(bus),
                    0x04 => {
                        let addr = self.addr_zp(bus);
                        bus.read(addr)
                    }
                    _ => {
                        let addr = self.addr_abs(bus);
                        bus.read(addr)
                    }
                };
                let register = if opcode < 0xE0 { self.y } else { self.x };
                self.compare(register, value);
            }
            0xD0 => return Some(self.branch(bus, !self.get_flag(FLAG_ZERO))),
            0xF0 => return Some(self.branch(bus, self.get_flag(FLAG_ZERO))),

            0x04 | 0x44 | 0x64 => {
                self.addr_zp(bus);
            }
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => {
                self.addr_zpx(bus);
            }
            0x0C => {
                self.addr_abs(bus);
            }
            0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => {
                let (_, page) = self.addr_absx(bus);
                return Some(page as u32);
            }
            _ => return None,
        }
        Some(0)
    }

    fn fetch_byte(&mut self, bus: &mut impl CpuBus) -> u8 {
        let byte = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn addr_zp(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_byte(bus) as u16
    }

    fn addr_zpx(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_byte(bus).wrapping_add(self.x) as u16
    }

    fn addr_zpy(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_byte(bus).wrapping_add(self.y) as u16
    }

    fn addr_abs(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_word(bus)
    }

    fn addr_absx(&mut self, bus: &mut impl CpuBus) -> (u16, bool) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(self.x as u16);
        (addr, (base & 0xFF00) != (addr & 0xFF00))
    }

    fn addr_absy(&mut self, bus: &mut impl CpuBus) -> (u16, bool) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(self.y as u16);
        (addr, (base & 0xFF00) != (addr & 0xFF00))
    }

    fn addr_indx(&mut self, bus: &mut impl CpuBus) -> u16 {
        let zp = self.fetch_byte(bus).wrapping_add(self.x);
        read_zp_u16(bus, zp)
    }

    fn addr_indy(&mut self, bus: &mut impl CpuBus) -> (u16, bool) {
        let zp = self.fetch_byte(bus);
        let ptr = read_zp_u16(bus, zp);
        let addr = ptr.wrapping_add(self.y as u16);
        (addr, (ptr & 0xFF00) != (addr & 0xFF00))
    }

    fn branch(&mut self, bus: &mut impl CpuBus, condition: bool) -> u32 {
        let offset = self.fetch_byte(bus) as i8;
        if !condition {
            return 0;
        }
        let old_pc = self.pc;
        self.pc = old_pc.wrapping_add(offset as i16 as u16);
        if (old_pc & 0xFF00) != (self.pc & 0xFF00) {
            2
        } else {
            1
        }
    }

    fn push(&mut self, bus: &mut impl CpuBus, value: u8) {
        bus.write(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut impl CpuBus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16)
    }

    fn push_u16(&mut self, bus: &mut impl CpuBus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn ora(&mut self, value: u8) {
        self.a |= value;
        self.update_zn(self.a);
    }

    fn and(&mut self, value: u8) {
        self.a &= value;
        self.update_zn(self.a);
    }

    fn eor(&mut self, value: u8) {
        self.a ^= value;
        self.update_zn(self.a);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    /// Binary only. The decimal flag is stored but never applied.
    fn adc(&mut self, value: u8) {
        let carry_in = self.get_flag(FLAG_CARRY) as u16;
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = self.get_flag(FLAG_CARRY) as u8;
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

fn read_u16(bus: &mut impl CpuBus, addr: u16) -> u16 {
    let lo = bus.read(addr) as u16;
    let hi = bus.read(addr.wrapping_add(1)) as u16;
    (hi << 8) | lo
}

/// JMP ($xxFF) takes its high byte from the start of the same page.
fn read_u16_page_wrapped(bus: &mut impl CpuBus, addr: u16) -> u16 {
    let lo = bus.read(addr) as u16;
    let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
    let hi = bus.read(hi_addr) as u16;
    (hi << 8) | lo
}

fn read_zp_u16(bus: &mut impl CpuBus, addr: u8) -> u16 {
    let lo = bus.read(addr as u16) as u16;
    let hi = bus.read(addr.wrapping_add(1) as u16) as u16;
    (hi << 8) | lo
}

#[derive(Clone, Copy)]
enum RmwOp {
    Asl,
    Rol,
    Lsr,
    Ror,
    Dec,
    Inc,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatBus {
        mem: Vec<u8>,
        lines: u8,
        nmi_delay: bool,
        irq_delay: bool,
        deferred_nmis: u32,
        stall: u32,
        last_base_cycles: u32,
        unknown: Vec<(u8, u16)>,
    }

    impl FlatBus {
        fn with_program(origin: u16, program: &[u8]) -> Self {
            let mut mem = vec![0; 0x10000];
            mem[origin as usize..origin as usize + program.len()].copy_from_slice(program);
            mem[RESET_VECTOR as usize] = origin as u8;
            mem[RESET_VECTOR as usize + 1] = (origin >> 8) as u8;
            Self {
                mem,
                lines: 0,
                nmi_delay: false,
                irq_delay: false,
                deferred_nmis: 0,
                stall: 0,
                last_base_cycles: 0,
                unknown: Vec::new(),
            }
        }

        fn set_vector(&mut self, vector: u16, target: u16) {
            self.mem[vector as usize] = target as u8;
            self.mem[vector as usize + 1] = (target >> 8) as u8;
        }
    }

    impl CpuBus for FlatBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, value: u8) {
            self.mem[addr as usize] = value;
        }

        fn interrupt_lines(&self) -> u8 {
            self.lines
        }

        fn acknowledge(&mut self, line: u8) {
            self.lines &= !line;
        }

        fn take_nmi_delay(&mut self) -> bool {
            std::mem::take(&mut self.nmi_delay)
        }

        fn defer_nmi(&mut self) {
            self.deferred_nmis += 1;
        }

        fn take_irq_delay(&mut self) -> bool {
            std::mem::take(&mut self.irq_delay)
        }

        fn set_irq_delay(&mut self) {
            self.irq_delay = true;
        }

        fn begin_opcode(&mut self, base_cycles: u32) {
            self.last_base_cycles = base_cycles;
        }

        fn take_stall_cycles(&mut self) -> u32 {
            std::mem::take(&mut self.stall)
        }

        fn unknown_opcode(&mut self, opcode: u8, pc: u16) {
            self.unknown.push((opcode, pc));
        }
    }

    fn boot(origin: u16, program: &[u8]) -> (Cpu, FlatBus) {
        let mut bus = FlatBus::with_program(origin, program);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    #[test]
    fn reset_seeds_pc_and_power_on_flags() {
        let (cpu, _) = boot(0x8000, &[0xEA]);
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.sp, 0xFD);
        assert_eq!(cpu.p, FLAG_INTERRUPT | FLAG_UNUSED);
    }

    #[test]
    fn lda_immediate_sets_register_and_flags() {
        let (mut cpu, mut bus) = boot(0x8000, &[0xA9, 0x05, 0xA9, 0x00, 0xA9, 0x80]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.a, 5);
        assert_eq!(cpu.pc, 0x8002);
        assert_eq!(bus.last_base_cycles, 2);
        cpu.step(&mut bus);
        assert!(cpu.get_flag(FLAG_ZERO));
        cpu.step(&mut bus);
        assert!(cpu.get_flag(FLAG_NEGATIVE));
        assert!(!cpu.get_flag(FLAG_ZERO));
    }

    #[test]
    fn absolute_indexed_read_pays_for_page_cross() {
        // LDX #$01; LDA $80FF,X; LDA $8000,X
        let (mut cpu, mut bus) = boot(0x8000, &[0xA2, 0x01, 0xBD, 0xFF, 0x80, 0xBD, 0x00, 0x80]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.step(&mut bus), 4);
    }

    #[test]
    fn indirect_indexed_wraps_pointer_in_zero_page_and_pays_for_page_cross() {
        let (mut cpu, mut bus) = boot(0x8000, &[0xA0, 0x10, 0xB1, 0xFF]);
        bus.mem[0x00FF] = 0xF8;
        bus.mem[0x0000] = 0x02;
        bus.mem[0x0308] = 0x42;
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.a, 0x42);
    }

    #[test]
    fn stores_never_pay_page_cross_penalty() {
        // LDX #$01; STA $02FF,X
        let (mut cpu, mut bus) = boot(0x8000, &[0xA2, 0x01, 0x9D, 0xFF, 0x02]);
        bus.mem[0x0300] = 0;
        cpu.a = 0x11;
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(bus.mem[0x0300], 0x11);
    }

    #[test]
    fn branch_costs_depend_on_taken_and_page_cross() {
        // LDA #$00; BNE +$10 (not taken); BEQ +0 (taken); BEQ +$7F (taken, crosses page)
        let (mut cpu, mut bus) = boot(0x80F0, &[0xA9, 0x00, 0xD0, 0x10, 0xF0, 0x00, 0xF0, 0x7F]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.step(&mut bus), 3);
        assert_eq!(cpu.pc, 0x80F6);
        assert_eq!(cpu.step(&mut bus), 4);
        assert_eq!(cpu.pc, 0x80F8 + 0x7F);
    }

    #[test]
    fn jmp_indirect_reproduces_page_wrap_bug() {
        let (mut cpu, mut bus) = boot(0x8000, &[0x6C, 0xFF, 0x02]);
        bus.mem[0x02FF] = 0x34;
        bus.mem[0x0200] = 0x12;
        bus.mem[0x0300] = 0x99;
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn jsr_and_rts_round_trip() {
        let (mut cpu, mut bus) = boot(0x8000, &[0x20, 0x00, 0x90]);
        bus.mem[0x9000] = 0x60;
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.sp, 0xFD);
    }

    #[test]
    fn adc_and_sbc_set_carry_and_overflow() {
        // CLC; LDA #$7F; ADC #$01; SEC; SBC #$01
        let (mut cpu, mut bus) = boot(0x8000, &[0x18, 0xA9, 0x7F, 0x69, 0x01, 0x38, 0xE9, 0x01]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(!cpu.get_flag(FLAG_CARRY));
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x7F);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(cpu.get_flag(FLAG_CARRY));
    }

    #[test]
    fn decimal_flag_does_not_change_addition() {
        // SED; CLC; LDA #$09; ADC #$01
        let (mut cpu, mut bus) = boot(0x8000, &[0xF8, 0x18, 0xA9, 0x09, 0x69, 0x01]);
        for _ in 0..4 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.a, 0x0A);
        assert!(cpu.get_flag(FLAG_DECIMAL));
    }

    #[test]
    fn read_modify_write_updates_memory() {
        // INC $10; ASL $10; ROR A
        let (mut cpu, mut bus) = boot(0x8000, &[0xE6, 0x10, 0x06, 0x10, 0x6A]);
        bus.mem[0x10] = 0x7F;
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(bus.mem[0x10], 0x80);
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x10], 0x00);
        assert!(cpu.get_flag(FLAG_CARRY));
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x80);
    }

    #[test]
    fn nmi_pushes_state_and_takes_seven_cycles() {
        let (mut cpu, mut bus) = boot(0x8000, &[0xEA]);
        bus.set_vector(NMI_VECTOR, 0x9000);
        bus.lines = INT_NMI;
        assert_eq!(cpu.step(&mut bus), INTERRUPT_CYCLES);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(bus.lines, 0);
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x00);
        assert_eq!(bus.mem[0x01FB] & (FLAG_BREAK | FLAG_UNUSED), FLAG_UNUSED);
        assert!(cpu.get_flag(FLAG_INTERRUPT));
    }

    #[test]
    fn delayed_nmi_waits_one_instruction() {
        let (mut cpu, mut bus) = boot(0x8000, &[0xEA, 0xEA]);
        bus.set_vector(NMI_VECTOR, 0x9000);
        bus.lines = INT_NMI;
        bus.nmi_delay = true;
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(bus.deferred_nmis, 1);
        assert_eq!(cpu.pc, 0x8001);
        assert_eq!(cpu.step(&mut bus), INTERRUPT_CYCLES);
        assert_eq!(cpu.pc, 0x9000);
    }

    #[test]
    fn irq_is_masked_by_interrupt_flag() {
        let (mut cpu, mut bus) = boot(0x8000, &[0xEA]);
        bus.lines = INT_FRAME_IRQ;
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(bus.lines, INT_FRAME_IRQ);
    }

    #[test]
    fn cli_delays_pending_irq_by_one_instruction() {
        // CLI; NOP; NOP
        let (mut cpu, mut bus) = boot(0x8000, &[0x58, 0xEA, 0xEA]);
        bus.set_vector(IRQ_VECTOR, 0xA000);
        bus.lines = INT_DMC_IRQ | INT_MAPPER_IRQ;
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.pc, 0x8002);
        assert_eq!(cpu.step(&mut bus), INTERRUPT_CYCLES);
        assert_eq!(cpu.pc, 0xA000);
        assert_eq!(bus.lines, INT_MAPPER_IRQ);
    }

    #[test]
    fn brk_pushes_pc_plus_two_with_break_flag() {
        let (mut cpu, mut bus) = boot(0x8000, &[0x00, 0xFF]);
        bus.set_vector(IRQ_VECTOR, 0xB000);
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.pc, 0xB000);
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x02);
        assert_eq!(bus.mem[0x01FB] & FLAG_BREAK, FLAG_BREAK);
    }

    #[test]
    fn rti_restores_flags_without_break() {
        let (mut cpu, mut bus) = boot(0x8000, &[0x40]);
        bus.mem[0x01FE] = 0xFF;
        bus.mem[0x01FF] = 0x34;
        bus.mem[0x0100] = 0x12;
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.p & FLAG_BREAK, 0);
        assert_eq!(cpu.pc, 0x1234);
        assert!(bus.irq_delay);
    }

    #[test]
    fn stall_cycles_are_added_to_the_instruction() {
        let (mut cpu, mut bus) = boot(0x8000, &[0xEA]);
        bus.stall = 513;
        assert_eq!(cpu.step(&mut bus), 515);
        assert_eq!(cpu.cycles, 515);
    }

    #[test]
    fn unknown_opcode_is_reported_and_skipped() {
        let (mut cpu, mut bus) = boot(0x8000, &[0x02, 0xA9, 0x07]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(bus.unknown, vec![(0x02, 0x8000)]);
        assert_eq!(cpu.pc, 0x8001);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 7);
    }

    #[test]
    fn unknown_opcode_reports_the_cycles_it_is_charged() {
        // $03 has a 7-cycle slot in the base table but is not executed.
        let (mut cpu, mut bus) = boot(0x8000, &[0x03, 0xEA]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(bus.last_base_cycles, 2);
        assert_eq!(bus.unknown, vec![(0x03, 0x8000)]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(bus.last_base_cycles, 2);
    }

    #[test]
    fn undocumented_nops_consume_their_operands() {
        // NOP $10; NOP #$00; NOP $1234,X; LDA #$01
        let (mut cpu, mut bus) =
            boot(0x8000, &[0x04, 0x10, 0x80, 0x00, 0x1C, 0x34, 0x12, 0xA9, 0x01]);
        assert_eq!(cpu.step(&mut bus), 3);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.step(&mut bus), 4);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 1);
        assert!(bus.unknown.is_empty());
    }
}
