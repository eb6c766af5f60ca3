use super::Interrupts;
use super::cpu::{INT_DMC_IRQ, INT_FRAME_IRQ};
use super::mapper::Mapper;

/// APU ticks run per scanline update.
pub const TICKS_PER_LINE: u32 = 114;
/// Output samples handed to the audio device per video frame (48 kHz / 60).
pub const SAMPLES_PER_FRAME: usize = 800;

const FRAME_SEQUENCER_PERIOD: u32 = 7_467;
const TICKS_PER_SAMPLE: u32 = 37;
const RING_SIZE: usize = SAMPLES_PER_FRAME * 4;
const DMC_FETCH_STALL: u32 = 4;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

const TRI_TABLE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [i32; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [i32; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    sequencer_counter: u32,
    sequencer_step: u8,
    five_step_mode: bool,
    frame_irq_inhibit: bool,
    frame_irq_flag: bool,

    pulse_table: [u32; 31],
    tnd_table: [u32; 203],
    sample_counter: u32,
    pulse_sum: u32,
    tnd_sum: u32,

    ring: Vec<i16>,
    write_cursor: usize,
    read_cursor: usize,
    frame: Vec<i16>,
    skip_frame: bool,
    stall_cycles: u32,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            triangle: TriangleChannel::new(),
            noise: NoiseChannel::new(),
            dmc: DmcChannel::new(),
            sequencer_counter: 0,
            sequencer_step: 0,
            five_step_mode: false,
            frame_irq_inhibit: true,
            frame_irq_flag: false,
            pulse_table: pulse_mix_table(),
            tnd_table: tnd_mix_table(),
            sample_counter: 0,
            pulse_sum: 0,
            tnd_sum: 0,
            ring: vec![0; RING_SIZE],
            write_cursor: 0,
            read_cursor: 0,
            frame: vec![0; SAMPLES_PER_FRAME],
            skip_frame: false,
            stall_cycles: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn write_register(&mut self, addr: u16, value: u8, interrupts: &mut Interrupts) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),

            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),

            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_timer_low(value),
            0x400B => self.triangle.write_timer_high(value),

            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_period(value),
            0x400F => self.noise.write_length(value),

            0x4010 => self.dmc.write_control(value),
            0x4011 => self.dmc.dac = value & 0x7F,
            0x4012 => self.dmc.write_sample_addr(value),
            0x4013 => self.dmc.write_sample_length(value),

            0x4015 => self.write_status(value, interrupts),
            0x4017 => self.write_frame_counter(value, interrupts),
            _ => {}
        }
    }

    pub fn read_status(&mut self, interrupts: &mut Interrupts) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length_counter > 0 {
            status |= 0x04;
        }
        if self.noise.length_counter > 0 {
            status |= 0x08;
        }
        if self.dmc.bytes_remaining > 0 {
            status |= 0x10;
        }
        if self.frame_irq_flag {
            status |= 0x40;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }

        self.frame_irq_flag = false;
        interrupts.clear(INT_FRAME_IRQ);
        status
    }

    fn write_status(&mut self, value: u8, interrupts: &mut Interrupts) {
        self.dmc.irq_flag = false;
        interrupts.clear(INT_DMC_IRQ);

        self.pulse1.set_enabled(value & 0x01 != 0);
        self.pulse2.set_enabled(value & 0x02 != 0);
        self.triangle.set_enabled(value & 0x04 != 0);
        self.noise.set_enabled(value & 0x08 != 0);
        self.dmc.set_enabled(value & 0x10 != 0);
    }

    fn write_frame_counter(&mut self, value: u8, interrupts: &mut Interrupts) {
        self.five_step_mode = value & 0x80 != 0;
        if !self.five_step_mode {
            self.sequencer_step = 0;
            self.sequencer_counter = 0;
        }
        self.frame_irq_inhibit = value & 0x40 != 0;
        if self.frame_irq_inhibit {
            self.frame_irq_flag = false;
            interrupts.clear(INT_FRAME_IRQ);
        }
    }

    /// CPU cycles owed for DMC sample fetches since the last call.
    pub fn take_stall_cycles(&mut self) -> u32 {
        std::mem::take(&mut self.stall_cycles)
    }

    /// The most recently flushed audio frame.
    pub fn frame(&self) -> &[i16] {
        &self.frame
    }

    pub fn frame_skipped(&self) -> bool {
        self.skip_frame
    }

    /// Runs one scanline's worth of ticks. Produces nothing while the
    /// output ring is too far ahead of the audio device.
    pub fn audio_update(&mut self, mapper: &mut dyn Mapper, interrupts: &mut Interrupts) {
        if self.skip_frame {
            return;
        }
        for tick in 0..TICKS_PER_LINE {
            let counter = self.sequencer_counter;
            self.sequencer_counter += 1;
            if counter > FRAME_SEQUENCER_PERIOD {
                self.sequencer_counter = 0;
                self.clock_sequencer(interrupts);
            }

            self.triangle.timer -= 1;
            if self.triangle.timer <= 0 {
                self.triangle.clock_timer();
            }

            self.dmc.timer -= 1;
            if self.dmc.timer < 0 {
                self.clock_dmc(mapper, interrupts);
            }

            if tick % 2 == 1 {
                self.pulse1.timer -= 1;
                self.pulse2.timer -= 1;
                self.noise.timer -= 1;
            }
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();

            self.mix();
        }
    }

    fn clock_dmc(&mut self, mapper: &mut dyn Mapper, interrupts: &mut Interrupts) {
        if self.dmc.clock_timer(mapper) {
            self.stall_cycles += DMC_FETCH_STALL;
        }
        if self.dmc.irq_flag {
            interrupts.raise(INT_DMC_IRQ);
            interrupts.irq_delay = false;
        }
    }

    fn clock_sequencer(&mut self, interrupts: &mut Interrupts) {
        match self.sequencer_step {
            0 | 2 => {
                self.clock_quarter_frame();
                self.sequencer_step += 1;
            }
            1 => {
                self.clock_half_frame();
                self.clock_quarter_frame();
                self.sequencer_step += 1;
            }
            3 if self.five_step_mode => self.sequencer_step += 1,
            3 => {
                self.clock_half_frame();
                self.clock_quarter_frame();
                if !self.frame_irq_inhibit {
                    self.frame_irq_flag = true;
                    interrupts.raise(INT_FRAME_IRQ);
                }
                self.sequencer_step = 0;
            }
            _ => {
                self.clock_half_frame();
                self.clock_quarter_frame();
                self.sequencer_step = 0;
            }
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.clock_envelope();
        self.pulse2.clock_envelope();
        self.noise.clock_envelope();
        self.triangle.clock_linear_counter();
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length();
        self.pulse2.clock_length();
        self.triangle.clock_length();
        self.noise.clock_length();
        self.pulse1.clock_sweep();
        self.pulse2.clock_sweep();
    }

    fn mix(&mut self) {
        let pulse = (self.pulse1.output() + self.pulse2.output()) as usize;
        let tnd = 3 * self.triangle.output as usize
            + 2 * self.noise.output as usize
            + self.dmc.dac as usize;
        self.pulse_sum += self.pulse_table[pulse];
        self.tnd_sum += self.tnd_table[tnd];

        self.sample_counter += 1;
        if self.sample_counter == TICKS_PER_SAMPLE {
            self.sample_counter = 0;
            let average = (self.pulse_sum + self.tnd_sum) / TICKS_PER_SAMPLE;
            self.pulse_sum = 0;
            self.tnd_sum = 0;
            self.ring[self.write_cursor] = ((average ^ 0x8000) & 0xFFFF) as u16 as i16;
            self.write_cursor = (self.write_cursor + 1) % RING_SIZE;
        }
    }

    /// Pulls one frame of samples off the ring. A halted console yields
    /// silence while the cursors still advance.
    pub fn flush_frame(&mut self, halted: bool) -> &[i16] {
        for slot in self.frame.iter_mut() {
            *slot = if halted { 0 } else { self.ring[self.read_cursor] };
            self.read_cursor = (self.read_cursor + 1) % RING_SIZE;
        }
        let ahead = (self.write_cursor + RING_SIZE - self.read_cursor) % RING_SIZE;
        self.skip_frame = ahead > SAMPLES_PER_FRAME;
        &self.frame
    }
}

fn pulse_mix_table() -> [u32; 31] {
    let mut table = [0u32; 31];
    for (n, slot) in table.iter_mut().enumerate().skip(1) {
        *slot = (95.52 / (8128.0 / n as f64 + 100.0) * 65535.0) as u32;
    }
    table
}

fn tnd_mix_table() -> [u32; 203] {
    let mut table = [0u32; 203];
    for (n, slot) in table.iter_mut().enumerate().skip(1) {
        *slot = (163.67 / (24329.0 / n as f64 + 100.0) * 65535.0) as u32;
    }
    table
}

/// Shared decaying-volume unit of the pulse and noise channels.
#[derive(Clone, Copy, Default)]
struct Envelope {
    start: bool,
    looping: bool,
    constant: bool,
    period: u8,
    divider: i16,
    decay: u8,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.looping = value & 0x20 != 0;
        self.constant = value & 0x10 != 0;
        self.period = value & 0x0F;
    }

    fn clock(&mut self) {
        if self.start {
            self.start = false;
            self.divider = self.period as i16 + 1;
            self.decay = 15;
            return;
        }
        self.divider -= 1;
        if self.divider <= 0 {
            self.divider = self.period as i16 + 1;
            if self.decay > 0 {
                self.decay -= 1;
            } else if self.looping {
                self.decay = 15;
            }
        }
    }

    fn volume(&self) -> u8 {
        if self.constant {
            self.period
        } else {
            self.decay
        }
    }
}

#[derive(Clone, Copy)]
struct PulseChannel {
    enabled: bool,
    ones_complement: bool,
    duty: u8,
    duty_step: u8,

    timer_period: u16,
    timer: i32,
    length_counter: u8,
    length_halt: bool,
    envelope: Envelope,

    sweep_enabled: bool,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_period: u8,
    sweep_reload: bool,
    sweep_divider: i16,
}

impl PulseChannel {
    fn new(ones_complement: bool) -> Self {
        Self {
            enabled: false,
            ones_complement,
            duty: 0,
            duty_step: 0,
            timer_period: 0,
            timer: 0,
            length_counter: 0,
            length_halt: false,
            envelope: Envelope::default(),
            sweep_enabled: false,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_period: 0,
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn write_control(&mut self, value: u8) {
        self.duty = value >> 6;
        self.length_halt = value & 0x20 != 0;
        self.envelope.write(value);
    }

    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = value & 0x80 != 0;
        self.sweep_period = (value >> 4) & 0x07;
        self.sweep_negate = value & 0x08 != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
        self.clock_sweep();
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x0700) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        self.duty_step = 0;
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer < 0 {
            self.duty_step = (self.duty_step + 1) & 0x07;
            self.timer = self.timer_period as i32;
        }
    }

    fn clock_envelope(&mut self) {
        self.envelope.clock();
    }

    fn clock_length(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn clock_sweep(&mut self) {
        self.sweep_divider -= 1;
        if self.sweep_divider < 0 {
            self.sweep_divider = self.sweep_period as i16 + 1;
            if self.sweep_enabled && self.timer_period > 7 && self.sweep_shift > 0 {
                let change = self.timer_period >> self.sweep_shift;
                let delta = if !self.sweep_negate {
                    change
                } else if self.ones_complement {
                    !change & 0x0FFF
                } else {
                    (!change).wrapping_add(1) & 0x0FFF
                };
                self.timer_period = self.timer_period.wrapping_add(delta) & 0x0FFF;
            }
        }
        if self.sweep_reload {
            self.sweep_divider = self.sweep_period as i16 + 1;
            self.sweep_reload = false;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_counter == 0 || self.timer <= 7 {
            return 0;
        }
        DUTY_TABLE[self.duty as usize][self.duty_step as usize] * self.envelope.volume()
    }
}

#[derive(Clone, Copy)]
struct TriangleChannel {
    enabled: bool,
    timer_low: u8,
    timer_high: u8,
    timer: i32,
    length_counter: u8,
    length_halt: bool,
    linear_control: bool,
    linear_reload_value: u8,
    linear_reload: bool,
    linear_counter: u8,
    step: u8,
    output: u8,
}

impl TriangleChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            timer_low: 0,
            timer_high: 0,
            timer: 0,
            length_counter: 0,
            length_halt: false,
            linear_control: false,
            linear_reload_value: 0,
            linear_reload: false,
            linear_counter: 0,
            step: 0,
            output: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn write_linear(&mut self, value: u8) {
        self.linear_reload_value = value & 0x7F;
        self.length_halt = value & 0x80 != 0;
        self.linear_control = value & 0x80 != 0;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_low = value;
        self.timer = (self.timer & 0x0700) | value as i32;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_high = value;
        self.timer = ((self.timer & 0x00FF) | (((value & 0x07) as i32) << 8)) + 1;
        self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        self.linear_reload = true;
    }

    fn period(&self) -> i32 {
        self.timer_low as i32 | (((self.timer_high & 0x07) as i32) << 8)
    }

    fn clock_timer(&mut self) {
        self.timer = self.period() + 1;
        if self.linear_counter > 0 && self.length_counter > 0 {
            self.step = (self.step + 1) & 0x1F;
            self.output = if self.timer < 2 {
                1
            } else if self.enabled {
                TRI_TABLE[self.step as usize]
            } else {
                0
            };
        }
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        if !self.linear_control {
            self.linear_reload = false;
        }
    }

    fn clock_length(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }
}

#[derive(Clone, Copy)]
struct NoiseChannel {
    enabled: bool,
    period_index: u8,
    timer: i32,
    length_counter: u8,
    length_halt: bool,
    envelope: Envelope,
    shift_register: u16,
    tap_bit: u8,
    output: u8,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            period_index: 0,
            timer: 0,
            length_counter: 0,
            length_halt: false,
            envelope: Envelope::default(),
            shift_register: 1,
            tap_bit: 1,
            output: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn write_control(&mut self, value: u8) {
        self.length_halt = value & 0x20 != 0;
        self.envelope.write(value);
    }

    fn write_period(&mut self, value: u8) {
        self.tap_bit = if value & 0x80 != 0 { 6 } else { 1 };
        self.period_index = value & 0x0F;
        self.timer = NOISE_PERIOD_TABLE[self.period_index as usize];
    }

    fn write_length(&mut self, value: u8) {
        self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer < 0 {
            let feedback = (self.shift_register ^ (self.shift_register >> self.tap_bit)) & 1;
            self.shift_register = (self.shift_register >> 1) | (feedback << 14);
            self.timer = NOISE_PERIOD_TABLE[self.period_index as usize];
        }
        self.output = if self.enabled && self.length_counter != 0 && self.shift_register & 1 != 0
        {
            self.envelope.volume()
        } else {
            0
        };
    }

    fn clock_envelope(&mut self) {
        self.envelope.clock();
    }

    fn clock_length(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }
}

#[derive(Clone, Copy)]
struct DmcChannel {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    loop_flag: bool,
    rate_index: u8,
    timer: i32,

    sample_addr_reg: u8,
    sample_length_reg: u8,
    start_addr: u32,
    current_addr: u32,
    bytes_remaining: u16,

    shift_register: u8,
    bits_remaining: i8,
    silence: bool,
    dac: u8,
}

impl DmcChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            loop_flag: false,
            rate_index: 0,
            timer: 0,
            sample_addr_reg: 0,
            sample_length_reg: 0,
            start_addr: 0xC000,
            current_addr: 0xC000,
            bytes_remaining: 0,
            shift_register: 0,
            bits_remaining: 7,
            silence: false,
            dac: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            if self.bytes_remaining == 0 {
                self.restart_sample();
            }
        } else {
            self.bytes_remaining = 0;
        }
    }

    fn restart_sample(&mut self) {
        self.current_addr = self.start_addr;
        self.bytes_remaining = self.sample_length_reg as u16 * 16 + 1;
    }

    fn write_control(&mut self, value: u8) {
        self.rate_index = value & 0x0F;
        self.timer = DMC_RATE_TABLE[self.rate_index as usize];
        self.irq_enabled = value & 0x80 != 0;
        if !self.irq_enabled {
            self.irq_flag = false;
        }
        self.loop_flag = value & 0x40 != 0;
    }

    fn write_sample_addr(&mut self, value: u8) {
        self.sample_addr_reg = value;
        self.start_addr = 0xC000 + value as u32 * 64;
        self.current_addr = self.start_addr;
    }

    fn write_sample_length(&mut self, value: u8) {
        self.sample_length_reg = value;
        self.bytes_remaining = value as u16 * 16 + 1;
    }

    /// Shifts one bit into the DAC. Returns true when a sample byte was
    /// fetched from cartridge space.
    fn clock_timer(&mut self, mapper: &mut dyn Mapper) -> bool {
        self.timer = DMC_RATE_TABLE[self.rate_index as usize];
        if !self.enabled {
            return false;
        }
        if !self.silence {
            if self.shift_register & 1 != 0 {
                if self.dac + 1 < 0x7E {
                    self.dac += 2;
                }
            } else if self.dac > 2 {
                self.dac -= 2;
            }
        }
        self.shift_register >>= 1;

        self.bits_remaining -= 1;
        if self.bits_remaining <= 0 {
            self.bits_remaining = 8;
            return self.refill(mapper);
        }
        false
    }

    fn refill(&mut self, mapper: &mut dyn Mapper) -> bool {
        let fetched = self.bytes_remaining > 0;
        if fetched {
            self.shift_register = mapper.cpu_read(self.current_addr as u16);
            self.current_addr += 1;
            if self.current_addr > 0xFFFF {
                self.current_addr = 0x8000;
            }
            self.bytes_remaining -= 1;
            self.silence = false;
        } else {
            self.silence = true;
        }

        if self.bytes_remaining == 0 {
            if self.loop_flag {
                self.restart_sample();
            } else if self.irq_enabled {
                self.irq_flag = true;
            }
        }
        fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::{CHR_BANK_SIZE, Cartridge, PRG_BANK_SIZE};
    use crate::nes::mapper::{Mirroring, Nrom};

    fn sample_mapper() -> Nrom {
        let prg = (0..2 * PRG_BANK_SIZE).map(|i| (i >> 8) as u8).collect();
        Nrom::new(Cartridge {
            mapper_id: 0,
            mirroring: Mirroring::Horizontal,
            four_screen: false,
            prg_rom: prg,
            chr_data: vec![0; CHR_BANK_SIZE],
            chr_is_ram: true,
        })
    }

    #[test]
    fn four_step_sequence_clocks_lengths_twice_and_raises_irq() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        apu.write_register(0x4017, 0x00, &mut irq);
        apu.write_register(0x4015, 0x01, &mut irq);
        apu.write_register(0x4000, 0x00, &mut irq);
        apu.write_register(0x4003, 0x00, &mut irq);
        assert_eq!(apu.pulse1.length_counter, 10);

        for _ in 0..4 {
            apu.clock_sequencer(&mut irq);
        }
        assert_eq!(apu.pulse1.length_counter, 8);
        assert!(irq.is_raised(INT_FRAME_IRQ));
        assert_eq!(apu.sequencer_step, 0);
    }

    #[test]
    fn four_step_cadence_from_scanline_updates() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        let mut mapper = sample_mapper();
        for _ in 0..50 {
            apu.audio_update(&mut mapper, &mut irq);
        }

        apu.write_register(0x4017, 0x00, &mut irq);
        apu.write_register(0x4015, 0x01, &mut irq);
        apu.write_register(0x4000, 0x00, &mut irq);
        apu.write_register(0x4003, 0x00, &mut irq);
        assert_eq!(apu.pulse1.length_counter, 10);

        // Steps land every 7469 ticks: lines 66, 132, 197 and 263.
        let mut lines = 0;
        let mut run_to = |apu: &mut Apu, irq: &mut Interrupts, target: u32| {
            while lines < target {
                apu.audio_update(&mut mapper, irq);
                lines += 1;
            }
        };

        run_to(&mut apu, &mut irq, 131);
        assert_eq!(apu.pulse1.length_counter, 10);
        run_to(&mut apu, &mut irq, 132);
        assert_eq!(apu.pulse1.length_counter, 9);

        run_to(&mut apu, &mut irq, 262);
        assert_eq!(apu.pulse1.length_counter, 9);
        assert_eq!(apu.pulse1.envelope.decay, 13);
        assert!(!irq.is_raised(INT_FRAME_IRQ));

        run_to(&mut apu, &mut irq, 263);
        assert_eq!(apu.pulse1.length_counter, 8);
        assert_eq!(apu.pulse1.envelope.decay, 12);
        assert!(irq.is_raised(INT_FRAME_IRQ));
    }

    #[test]
    fn five_step_sequence_never_raises_frame_irq() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        apu.write_register(0x4017, 0x80, &mut irq);
        apu.write_register(0x4015, 0x08, &mut irq);
        apu.write_register(0x400F, 0x00, &mut irq);

        for _ in 0..5 {
            apu.clock_sequencer(&mut irq);
        }
        assert_eq!(apu.noise.length_counter, 8);
        assert!(!irq.is_raised(INT_FRAME_IRQ));
    }

    #[test]
    fn halted_length_counter_holds() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        apu.write_register(0x4000, 0x20, &mut irq);
        apu.write_register(0x4003, 0x08, &mut irq);
        for _ in 0..8 {
            apu.clock_sequencer(&mut irq);
        }
        assert_eq!(apu.pulse1.length_counter, 254);
    }

    #[test]
    fn status_read_reports_and_clears_frame_irq() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        apu.write_register(0x4017, 0x00, &mut irq);
        apu.write_register(0x400B, 0x00, &mut irq);
        for _ in 0..4 {
            apu.clock_sequencer(&mut irq);
        }
        let status = apu.read_status(&mut irq);
        assert_eq!(status & 0x40, 0x40);
        assert_eq!(status & 0x04, 0x04);
        assert!(!irq.is_raised(INT_FRAME_IRQ));
        assert_eq!(apu.read_status(&mut irq) & 0x40, 0);
    }

    #[test]
    fn inhibit_bit_clears_pending_frame_irq() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        apu.write_register(0x4017, 0x00, &mut irq);
        for _ in 0..4 {
            apu.clock_sequencer(&mut irq);
        }
        assert!(irq.is_raised(INT_FRAME_IRQ));
        apu.write_register(0x4017, 0x40, &mut irq);
        assert!(!irq.is_raised(INT_FRAME_IRQ));
        assert!(!apu.frame_irq_flag);
    }

    #[test]
    fn disabling_channels_zeroes_lengths_and_clears_dmc_irq() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        apu.write_register(0x4003, 0x08, &mut irq);
        apu.write_register(0x400B, 0x08, &mut irq);
        apu.dmc.irq_flag = true;
        irq.raise(INT_DMC_IRQ);

        apu.write_register(0x4015, 0x00, &mut irq);
        assert_eq!(apu.pulse1.length_counter, 0);
        assert_eq!(apu.triangle.length_counter, 0);
        assert!(!apu.dmc.irq_flag);
        assert!(!irq.is_raised(INT_DMC_IRQ));
    }

    #[test]
    fn sweep_negation_differs_between_pulse_channels() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        for base in [0x4000u16, 0x4004] {
            apu.write_register(base + 2, 0x00, &mut irq);
            apu.write_register(base + 3, 0x01, &mut irq);
            apu.write_register(base + 1, 0x89, &mut irq);
        }
        assert_eq!(apu.pulse1.timer_period, 0x7F);
        assert_eq!(apu.pulse2.timer_period, 0x80);
    }

    #[test]
    fn envelope_decays_once_per_period_and_loops() {
        let mut env = Envelope::default();
        env.write(0x21);
        env.start = true;
        env.clock();
        assert_eq!(env.volume(), 15);
        for _ in 0..2 {
            env.clock();
        }
        assert_eq!(env.volume(), 14);

        env.decay = 0;
        env.divider = 1;
        env.clock();
        assert_eq!(env.volume(), 15);
    }

    #[test]
    fn dmc_fetch_stalls_cpu_and_raises_irq_at_end() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        let mut mapper = sample_mapper();
        apu.write_register(0x4010, 0x8F, &mut irq);
        apu.write_register(0x4012, 0x04, &mut irq);
        apu.write_register(0x4013, 0x00, &mut irq);
        apu.write_register(0x4015, 0x10, &mut irq);
        assert_eq!(apu.dmc.bytes_remaining, 1);

        for _ in 0..7 {
            apu.clock_dmc(&mut mapper, &mut irq);
        }
        assert_eq!(apu.dmc.shift_register, 0x41);
        assert_eq!(apu.take_stall_cycles(), 4);
        assert_eq!(apu.take_stall_cycles(), 0);
        assert!(irq.is_raised(INT_DMC_IRQ));
        assert_eq!(apu.read_status(&mut irq) & 0x90, 0x80);
    }

    #[test]
    fn dmc_loop_restarts_sample_instead_of_irq() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        let mut mapper = sample_mapper();
        apu.write_register(0x4010, 0xCF, &mut irq);
        apu.write_register(0x4013, 0x01, &mut irq);
        apu.write_register(0x4015, 0x10, &mut irq);
        apu.dmc.bytes_remaining = 1;

        assert!(apu.dmc.refill(&mut mapper));
        assert_eq!(apu.dmc.bytes_remaining, 17);
        assert_eq!(apu.dmc.current_addr, 0xC000);
        assert!(!apu.dmc.irq_flag);
    }

    #[test]
    fn dmc_address_wraps_to_8000() {
        let mut apu = Apu::new();
        let mut mapper = sample_mapper();
        apu.dmc.current_addr = 0xFFFF;
        apu.dmc.bytes_remaining = 3;
        assert!(apu.dmc.refill(&mut mapper));
        assert_eq!(apu.dmc.shift_register, 0x7F);
        assert_eq!(apu.dmc.current_addr, 0x8000);
        assert!(apu.dmc.refill(&mut mapper));
        assert_eq!(apu.dmc.shift_register, 0x00);
    }

    #[test]
    fn dmc_dac_moves_by_two_and_clamps() {
        let mut dmc = DmcChannel::new();
        let mut mapper = sample_mapper();
        dmc.enabled = true;
        dmc.dac = 0x7D;
        dmc.shift_register = 0xFF;
        dmc.bits_remaining = 8;
        dmc.clock_timer(&mut mapper);
        assert_eq!(dmc.dac, 0x7D);
        dmc.dac = 0x10;
        dmc.clock_timer(&mut mapper);
        assert_eq!(dmc.dac, 0x12);
        dmc.shift_register = 0;
        dmc.dac = 2;
        dmc.clock_timer(&mut mapper);
        assert_eq!(dmc.dac, 2);
    }

    #[test]
    fn mixer_tables_are_monotonic_and_fit_sixteen_bits() {
        let apu = Apu::new();
        assert_eq!(apu.pulse_table[0], 0);
        assert_eq!(apu.tnd_table[0], 0);
        assert!(apu.pulse_table.windows(2).all(|w| w[0] < w[1]));
        assert!(apu.tnd_table.windows(2).all(|w| w[0] < w[1]));
        assert!(apu.pulse_table[30] + apu.tnd_table[202] < 0x1_0000);
        assert_eq!(apu.pulse_table[30], 16_876);
    }

    #[test]
    fn sample_is_window_average_of_mixer_tables() {
        let mut apu = Apu::new();
        apu.pulse1.enabled = true;
        apu.pulse1.length_counter = 10;
        apu.pulse1.timer = 100;
        apu.pulse1.duty = 2;
        apu.pulse1.duty_step = 1;
        apu.pulse1.envelope.write(0x19);
        apu.triangle.output = 7;
        apu.dmc.dac = 40;
        assert_eq!(apu.pulse1.output(), 9);

        for _ in 0..TICKS_PER_SAMPLE {
            apu.mix();
        }
        let steady = apu.pulse_table[9] + apu.tnd_table[3 * 7 + 40];
        assert_eq!(apu.write_cursor, 1);
        assert_eq!(apu.ring[0], (steady ^ 0x8000) as u16 as i16);

        // Output changing mid-window averages both levels.
        for _ in 0..20 {
            apu.mix();
        }
        apu.dmc.dac = 0;
        for _ in 20..TICKS_PER_SAMPLE {
            apu.mix();
        }
        let quiet = apu.pulse_table[9] + apu.tnd_table[3 * 7];
        let average = (20 * steady + 17 * quiet) / TICKS_PER_SAMPLE;
        assert_eq!(apu.ring[1], (average ^ 0x8000) as u16 as i16);
    }

    #[test]
    fn one_frame_of_lines_fills_one_audio_frame() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        let mut mapper = sample_mapper();
        for _ in 0..262 {
            apu.audio_update(&mut mapper, &mut irq);
        }
        assert_eq!(apu.write_cursor, 262 * 114 / 37);
        let frame = apu.flush_frame(false);
        assert_eq!(frame.len(), SAMPLES_PER_FRAME);
        assert!(frame.iter().all(|&s| s == i16::MIN));
        assert!(!apu.frame_skipped());
    }

    #[test]
    fn halted_flush_is_silent() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        let mut mapper = sample_mapper();
        for _ in 0..262 {
            apu.audio_update(&mut mapper, &mut irq);
        }
        assert!(apu.flush_frame(true).iter().all(|&s| s == 0));
        assert_eq!(apu.read_cursor, SAMPLES_PER_FRAME);
    }

    #[test]
    fn overrun_ring_skips_next_frame_of_production() {
        let mut apu = Apu::new();
        let mut irq = Interrupts::default();
        let mut mapper = sample_mapper();
        for _ in 0..600 {
            apu.audio_update(&mut mapper, &mut irq);
        }
        apu.flush_frame(false);
        assert!(apu.frame_skipped());
        let cursor = apu.write_cursor;
        apu.audio_update(&mut mapper, &mut irq);
        assert_eq!(apu.write_cursor, cursor);
        apu.flush_frame(false);
        assert!(!apu.frame_skipped());
    }
}
