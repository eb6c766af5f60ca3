use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use famicore::nes::Nes;
use famicore::nes::cpu::{
    FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW, FLAG_ZERO,
};

const MEM_DUMP_LEN: u16 = 16;
const EVENT_LINES: usize = 16;

fn print_help() {
    println!("Commands:");
    println!("  step [n], s   - Execute n CPU instructions (default 1)");
    println!("  frame [n], f  - Run n whole frames (default 1)");
    println!("  regs          - Show CPU registers");
    println!("  mem <addr>    - Show 16 bytes of CPU memory (hex address)");
    println!("  ppu           - Show PPU state");
    println!("  events [n]    - Show the newest debug events");
    println!("  quit, q       - Exit debugger");
}

fn parse_count(arg: Option<&&str>) -> Result<u32> {
    match arg {
        None => Ok(1),
        Some(text) => text
            .parse::<u32>()
            .with_context(|| format!("invalid count: {text}")),
    }
}

fn parse_addr(text: &str) -> Result<u16> {
    let digits = text.trim_start_matches("0x").trim_start_matches('$');
    u16::from_str_radix(digits, 16).with_context(|| format!("invalid address: {text}"))
}

fn print_regs(nes: &Nes) {
    let cpu = nes.cpu();
    println!(
        "A: ${:02X}  X: ${:02X}  Y: ${:02X}  SP: ${:02X}  PC: ${:04X}",
        cpu.a, cpu.x, cpu.y, cpu.sp, cpu.pc
    );
    println!(
        "P: {:08b} (NV-BDIZC)  N={} V={} D={} I={} Z={} C={}",
        cpu.p,
        cpu.get_flag(FLAG_NEGATIVE),
        cpu.get_flag(FLAG_OVERFLOW),
        cpu.get_flag(FLAG_DECIMAL),
        cpu.get_flag(FLAG_INTERRUPT),
        cpu.get_flag(FLAG_ZERO),
        cpu.get_flag(FLAG_CARRY)
    );
    println!("Cycles: {}  Scanline: {}", cpu.cycles, nes.scanline());
}

fn print_mem(nes: &Nes, addr: u16) {
    let bytes: Vec<String> = (0..MEM_DUMP_LEN)
        .map(|i| format!("{:02X}", nes.peek(addr.wrapping_add(i))))
        .collect();
    println!("{addr:04X}: {}", bytes[..8].join(" "));
    println!("{:04X}: {}", addr.wrapping_add(8), bytes[8..].join(" "));
}

fn print_ppu(nes: &Nes) {
    let ppu = nes.ppu();
    println!("PPU State:");
    println!("  Scanline: {}, Dot: {}", ppu.scanline(), ppu.dot());
    println!("  $2000 (ctrl):   {:08b}", ppu.ctrl());
    println!("  $2001 (mask):   {:08b}", ppu.mask());
    println!("  $2002 (status): {:08b}", ppu.status());
    println!(
        "  v=${:04X} t=${:04X} fine_x={}",
        ppu.vram_addr(),
        ppu.temp_addr(),
        ppu.fine_x()
    );
}

fn run_command(nes: &mut Nes, parts: &[&str]) -> Result<bool> {
    match parts[0] {
        "help" | "h" => print_help(),
        "step" | "s" => {
            let count = parse_count(parts.get(1))?;
            let cycles: u32 = (0..count).map(|_| nes.step_instruction()).sum();
            println!("Executed {count} instruction(s), {cycles} cycles");
            print_regs(nes);
        }
        "frame" | "f" => {
            let count = parse_count(parts.get(1))?;
            for _ in 0..count {
                nes.run_frame();
            }
            println!("Frame {} complete", nes.counters().frames);
            print_regs(nes);
        }
        "regs" | "r" => print_regs(nes),
        "mem" | "m" => {
            let Some(text) = parts.get(1) else {
                bail!("usage: mem <addr>");
            };
            print_mem(nes, parse_addr(text)?);
        }
        "ppu" => print_ppu(nes),
        "events" | "e" => {
            let limit = parts
                .get(1)
                .map(|text| text.parse::<usize>())
                .transpose()
                .context("invalid event count")?
                .unwrap_or(EVENT_LINES);
            let counters = nes.counters();
            println!(
                "frames={} steps={} nmis={} irqs={} dma={} unknown_ops={}",
                counters.frames,
                counters.cpu_steps,
                counters.nmis,
                counters.irqs,
                counters.dma_transfers,
                counters.unknown_opcodes
            );
            for event in nes.recent_events(limit) {
                println!("  {event}");
            }
        }
        "quit" | "q" => return Ok(false),
        other => bail!("unknown command: {other}. Type 'help' for available commands."),
    }
    Ok(true)
}

fn main() -> Result<()> {
    println!("Famicore Debugger");
    println!("=================");
    println!();

    let Some(rom_path) = std::env::args().nth(1) else {
        println!("Usage: famicore_debug <rom.nes>");
        println!();
        print_help();
        return Ok(());
    };

    println!("Loading ROM: {rom_path}");
    let mut nes = Nes::new();
    let report = nes.load_rom_from_path(Path::new(&rom_path))?;
    println!("Mapper: {}", report.mapper_name);
    if let Some(warning) = report.warning {
        println!("Warning: {warning}");
    }
    println!();
    print_regs(&nes);
    println!();
    println!("Type 'help' for commands");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush().ok();

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match run_command(&mut nes, &parts) {
            Ok(true) => {}
            Ok(false) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => println!("{err:#}"),
        }
    }

    Ok(())
}
