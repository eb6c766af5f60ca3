use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use famicore::nes::Nes;
use famicore::nes::palette::to_rgba;
use quick_xml::Reader;
use quick_xml::events::Event;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, Default)]
struct SuiteTest {
    filename: String,
    system: String,
    runframes: u32,
    tvsha1: String,
    recordedinput: String,
}

#[derive(Debug)]
struct RunOutcome {
    rgb_hash: String,
    rgba_hash: String,
    pc: u16,
    frames: u64,
    unknown_opcodes: u64,
    warning: Option<String>,
    result_code: u8,
}

#[derive(Debug, Clone)]
struct RunnerOptions {
    suite: PathBuf,
    rom_root: PathBuf,
    max_tests: usize,
    include_recorded_input: bool,
    include_pal: bool,
    contains: Vec<String>,
    extra_frames: u32,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            suite: PathBuf::from("external/nes-test-roms/test_roms.xml"),
            rom_root: PathBuf::from("external/nes-test-roms"),
            max_tests: 80,
            include_recorded_input: false,
            include_pal: false,
            contains: Vec::new(),
            extra_frames: 0,
        }
    }
}

fn parse_args() -> Result<RunnerOptions> {
    let mut opts = RunnerOptions::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let mut value = |hint: &str| args.next().with_context(|| format!("{arg} requires {hint}"));
        match arg.as_str() {
            "--suite" => opts.suite = PathBuf::from(value("a path to test_roms.xml")?),
            "--rom-root" => opts.rom_root = PathBuf::from(value("a directory")?),
            "--max-tests" => {
                let text = value("an integer")?;
                opts.max_tests = text
                    .parse()
                    .with_context(|| format!("invalid --max-tests value: {text}"))?;
            }
            "--extra-frames" => {
                let text = value("an integer")?;
                opts.extra_frames = text
                    .parse()
                    .with_context(|| format!("invalid --extra-frames value: {text}"))?;
            }
            "--contains" => opts.contains.push(value("a substring")?.to_lowercase()),
            "--include-recorded-input" => opts.include_recorded_input = true,
            "--include-pal" => opts.include_pal = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}\nUse --help to view supported options."),
        }
    }

    Ok(opts)
}

fn print_help() {
    println!(
        "Headless test ROM runner for Famicore\n\n\
Usage:\n\
  rom_test_runner [options]\n\n\
Options:\n\
  --suite <path>                 Path to test_roms.xml\n\
  --rom-root <path>              Root path containing ROM files\n\
  --max-tests <n>                Maximum number of tests to run (default 80)\n\
  --contains <substr>            Only run tests whose filename contains this text (repeatable)\n\
  --extra-frames <n>             Add n frames after the listed runframes (default 0)\n\
  --include-recorded-input       Include tests that need replayed input\n\
  --include-pal                  Include PAL tests\n\
  -h, --help                     Show this help\n"
    );
}

fn element_text(event_text: std::borrow::Cow<'_, str>, test: Option<&mut SuiteTest>, field: Field) {
    let Some(test) = test else {
        return;
    };
    match field {
        Field::Tvsha1 => test.tvsha1.push_str(&event_text),
        Field::RecordedInput => test.recordedinput.push_str(&event_text),
        Field::None => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Tvsha1,
    RecordedInput,
}

fn parse_suite_xml(xml: &str) -> Result<Vec<SuiteTest>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<SuiteTest> = None;
    let mut field = Field::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"test" => {
                    let mut test = SuiteTest::default();
                    for attr in e.attributes().flatten() {
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        match attr.key.as_ref() {
                            b"filename" => test.filename = value,
                            b"system" => test.system = value,
                            b"runframes" => test.runframes = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current = Some(test);
                }
                b"tvsha1" => field = Field::Tvsha1,
                b"recordedinput" => field = Field::RecordedInput,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.decode().unwrap_or_default();
                element_text(text, current.as_mut(), field);
            }
            Ok(Event::CData(e)) => {
                let text = e.decode().unwrap_or_default();
                element_text(text, current.as_mut(), field);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"tvsha1" | b"recordedinput" => field = Field::None,
                b"test" => {
                    if let Some(mut test) = current.take() {
                        test.tvsha1 = test.tvsha1.trim().to_string();
                        test.recordedinput = test.recordedinput.trim().to_string();
                        tests.push(test);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => bail!(
                "failed to parse suite XML at byte {}: {err}",
                reader.buffer_position()
            ),
            _ => {}
        }
    }

    Ok(tests)
}

fn should_run(test: &SuiteTest, opts: &RunnerOptions) -> bool {
    if !opts.include_pal && test.system.eq_ignore_ascii_case("pal") {
        return false;
    }
    if !opts.include_recorded_input && !test.recordedinput.is_empty() {
        return false;
    }
    if opts.contains.is_empty() {
        return true;
    }
    let lower = test.filename.to_lowercase();
    opts.contains.iter().any(|f| lower.contains(f))
}

fn hash_base64(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha1::digest(bytes))
}

fn run_single(test: &SuiteTest, opts: &RunnerOptions) -> Result<RunOutcome> {
    let rom_path = opts.rom_root.join(&test.filename);
    let mut nes = Nes::new();
    let report = nes
        .load_rom_from_path(&rom_path)
        .with_context(|| format!("failed to load ROM {}", rom_path.display()))?;

    for _ in 0..test.runframes.saturating_add(opts.extra_frames) {
        nes.run_frame();
    }

    let mut rgba = Vec::new();
    to_rgba(nes.screen(), nes.color_mode(), &mut rgba);
    let rgb: Vec<u8> = rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();

    Ok(RunOutcome {
        rgb_hash: hash_base64(&rgb),
        rgba_hash: hash_base64(&rgba),
        pc: nes.cpu().pc,
        frames: nes.counters().frames,
        unknown_opcodes: nes.counters().unknown_opcodes,
        warning: report.warning,
        result_code: nes.peek(0x00F8),
    })
}

fn main() -> Result<()> {
    let opts = parse_args()?;
    let start = Instant::now();

    let xml = fs::read_to_string(&opts.suite)
        .with_context(|| format!("failed to read suite XML: {}", opts.suite.display()))?;
    let selected: Vec<SuiteTest> = parse_suite_xml(&xml)?
        .into_iter()
        .filter(|t| should_run(t, &opts))
        .take(opts.max_tests)
        .collect();

    println!(
        "Running {} test(s) from {}",
        selected.len(),
        opts.suite.display()
    );

    let (mut passed, mut failed, mut skipped) = (0usize, 0usize, 0usize);
    for (idx, test) in selected.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, selected.len(), test.filename);
        match run_single(test, &opts) {
            Ok(outcome) if outcome.rgb_hash == test.tvsha1 => {
                passed += 1;
                println!("PASS {label}");
            }
            Ok(outcome) if outcome.rgba_hash == test.tvsha1 => {
                passed += 1;
                println!("PASS {label} [rgba]");
            }
            Ok(outcome) => {
                failed += 1;
                println!(
                    "FAIL {label}\n  expected: {}\n  got rgb : {}\n  got rgba: {}\n  pc=${:04X} frames={} unknown_opcodes={} ram[$00F8]=${:02X}",
                    test.tvsha1,
                    outcome.rgb_hash,
                    outcome.rgba_hash,
                    outcome.pc,
                    outcome.frames,
                    outcome.unknown_opcodes,
                    outcome.result_code
                );
                if let Some(warning) = outcome.warning {
                    println!("  warning: {warning}");
                }
            }
            Err(err) => {
                skipped += 1;
                println!("SKIP {label} -> {err:#}");
            }
        }
    }

    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", start.elapsed().as_secs_f32());

    Ok(())
}
