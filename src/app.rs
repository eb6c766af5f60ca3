use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eframe::egui::{self, ColorImage, Key, TextureHandle, TextureOptions};

use crate::audio::AudioOutput;
use crate::config::{EmulatorConfig, MAX_SCALE, MIN_SCALE};
use crate::nes::palette::to_rgba;
use crate::nes::{Nes, SCREEN_HEIGHT, SCREEN_WIDTH};

pub const NTSC_FRAME_RATE_HZ: f64 = 60.098_813_897_440_515;
const MAX_FRAMES_PER_UPDATE: u32 = 2;
const IDLE_REPAINT: Duration = Duration::from_millis(50);
const DEBUG_EVENT_LINES: usize = 8;
const CHROME_HEIGHT: f32 = 96.0;

pub struct FamicoreApp {
    nes: Nes,
    config: EmulatorConfig,
    config_path: PathBuf,
    frame_texture: Option<TextureHandle>,
    rgba: Vec<u8>,
    status_line: String,
    loaded_rom: Option<PathBuf>,
    audio: Option<AudioOutput>,
    audio_error: Option<String>,
    frame_interval: Duration,
    next_frame_at: Option<Instant>,
    show_debug: bool,
}

/// Window size that fits the screen at `scale` plus menu and status bars.
pub fn window_size(scale: u8) -> egui::Vec2 {
    let scale = f32::from(scale.clamp(MIN_SCALE, MAX_SCALE));
    egui::vec2(
        SCREEN_WIDTH as f32 * scale + 16.0,
        SCREEN_HEIGHT as f32 * scale + CHROME_HEIGHT,
    )
}

impl FamicoreApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: EmulatorConfig,
        config_path: PathBuf,
    ) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let mut app = Self {
            nes: Nes::new(),
            config,
            config_path,
            frame_texture: None,
            rgba: Vec::with_capacity(SCREEN_WIDTH * SCREEN_HEIGHT * 4),
            status_line: "Drop a .nes file or open one from the File menu".to_string(),
            loaded_rom: None,
            audio: None,
            audio_error: None,
            frame_interval: Duration::from_secs_f64(1.0 / NTSC_FRAME_RATE_HZ),
            next_frame_at: None,
            show_debug: false,
        };
        if app.config.audio_enabled {
            app.open_audio();
        }
        app
    }

    fn open_audio(&mut self) {
        match AudioOutput::new() {
            Ok(audio) => {
                self.audio = Some(audio);
                self.audio_error = None;
            }
            Err(err) => {
                self.audio = None;
                self.audio_error = Some(format!("{err:#}"));
            }
        }
    }

    fn save_config(&mut self) {
        if let Err(err) = self.config.save(&self.config_path) {
            self.status_line = format!("Failed to save settings: {err:#}");
        }
    }

    fn load_rom(&mut self, path: &Path) {
        match self.nes.load_rom_from_path(path) {
            Ok(report) => {
                let file_name = path.file_name().and_then(|f| f.to_str()).unwrap_or("ROM");
                self.status_line = match report.warning {
                    Some(warning) => format!("Loaded {file_name}: {warning}"),
                    None => format!("Loaded {file_name} using {}", report.mapper_name),
                };
                self.loaded_rom = Some(path.to_path_buf());
                self.frame_texture = None;
                self.next_frame_at = None;
                if let Some(audio) = &self.audio {
                    audio.clear();
                }

                let dir = path.parent().map(Path::to_path_buf);
                if dir.is_some() && dir != self.config.last_rom_dir {
                    self.config.last_rom_dir = dir;
                    self.save_config();
                }
            }
            Err(err) => {
                self.status_line = format!("Failed to load ROM: {err:#}");
            }
        }
    }

    fn open_rom_dialog(&mut self) {
        let mut dialog = rfd::FileDialog::new()
            .add_filter("NES ROM", &["nes"])
            .set_title("Open NES ROM");
        if let Some(dir) = &self.config.last_rom_dir {
            dialog = dialog.set_directory(dir);
        }
        if let Some(path) = dialog.pick_file() {
            self.load_rom(&path);
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|input| input.raw.dropped_files.clone());
        for file in dropped {
            if let Some(path) = file.path {
                let is_nes = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("nes"))
                    .unwrap_or(false);

                if is_nes {
                    self.load_rom(&path);
                } else {
                    self.status_line = format!("Unsupported file: {}", path.display());
                }
            }
        }
    }

    fn handle_shortcuts(&mut self, ctx: &egui::Context) {
        let (open, reset, pause) = ctx.input(|i| {
            (
                i.modifiers.command && i.key_pressed(Key::O),
                i.modifiers.command && i.key_pressed(Key::R),
                i.key_pressed(Key::P) || i.key_pressed(Key::Escape),
            )
        });
        if open {
            self.open_rom_dialog();
        }
        if reset {
            self.reset();
        }
        if pause {
            self.toggle_pause();
        }
    }

    fn reset(&mut self) {
        if self.nes.has_rom() {
            self.nes.reset();
            self.next_frame_at = None;
            self.status_line = "Reset complete".to_string();
        }
    }

    fn toggle_pause(&mut self) {
        if !self.nes.has_rom() {
            return;
        }
        let halted = !self.nes.halted();
        self.nes.set_halted(halted);
        self.next_frame_at = None;
        self.status_line = if halted { "Paused" } else { "Running" }.to_string();
    }

    fn set_scale(&mut self, ctx: &egui::Context, scale: u8) {
        if self.config.scale == scale {
            return;
        }
        self.config.set_scale(scale);
        ctx.send_viewport_cmd(egui::ViewportCommand::InnerSize(window_size(self.config.scale)));
        self.save_config();
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        self.config.audio_enabled = enabled;
        if enabled {
            self.open_audio();
        } else {
            self.audio = None;
        }
        self.save_config();
    }

    /// Rebuilds controller 1 from the keys currently held.
    fn poll_controller(&mut self, ctx: &egui::Context) {
        let held: Vec<u8> = ctx.input(|input| {
            self.config
                .key_bindings
                .buttons()
                .iter()
                .filter_map(|&(name, bit)| {
                    let key = Key::from_name(name)?;
                    input.key_down(key).then_some(bit)
                })
                .collect()
        });

        let joypad = self.nes.joypad_mut();
        joypad.set_buttons(0, 0);
        for bit in held {
            joypad.press(0, bit);
        }
    }

    fn run_frame_with_audio(&mut self) {
        self.nes.run_frame();
        if let Some(audio) = &mut self.audio {
            audio.write_frame(self.nes.audio_frame());
        }
    }

    fn update_texture(&mut self, ctx: &egui::Context) {
        to_rgba(self.nes.screen(), self.nes.color_mode(), &mut self.rgba);
        let image = ColorImage::from_rgba_unmultiplied([SCREEN_WIDTH, SCREEN_HEIGHT], &self.rgba);
        let options = if self.config.interpolate {
            TextureOptions::LINEAR
        } else {
            TextureOptions::NEAREST
        };

        if let Some(texture) = self.frame_texture.as_mut() {
            texture.set(image, options);
        } else {
            self.frame_texture = Some(ctx.load_texture("famicore-screen", image, options));
        }
    }

    fn pace_frames(&mut self) {
        let now = Instant::now();
        let mut next = self.next_frame_at.unwrap_or(now);
        let mut ran_frames = 0u32;

        while Instant::now() >= next && ran_frames < MAX_FRAMES_PER_UPDATE {
            self.run_frame_with_audio();
            ran_frames += 1;
            next += self.frame_interval;
        }

        if ran_frames == 0 && now > next + self.frame_interval {
            next = now;
        }
        self.next_frame_at = Some(next);
    }

    fn audio_status(&self) -> String {
        match (&self.audio, &self.audio_error) {
            (Some(audio), _) => format!(
                "Audio: {} Hz (queue {} ms)",
                audio.sample_rate(),
                (audio.queued_samples() * 1000) / audio.sample_rate().max(1) as usize
            ),
            (None, _) if !self.config.audio_enabled => "Audio: off".to_string(),
            (None, Some(err)) => format!("Audio: unavailable ({err})"),
            (None, None) => "Audio: unavailable".to_string(),
        }
    }

    fn menu_bar(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::top("menu").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Open ROM...").clicked() {
                        ui.close_menu();
                        self.open_rom_dialog();
                    }
                    if ui.button("Quit").clicked() {
                        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                    }
                });

                ui.menu_button("Emulation", |ui| {
                    let has_rom = self.nes.has_rom();
                    let pause_label = if self.nes.halted() { "Resume" } else { "Pause" };
                    if ui.add_enabled(has_rom, egui::Button::new(pause_label)).clicked() {
                        ui.close_menu();
                        self.toggle_pause();
                    }
                    if ui.add_enabled(has_rom, egui::Button::new("Reset")).clicked() {
                        ui.close_menu();
                        self.reset();
                    }
                });

                ui.menu_button("View", |ui| {
                    for scale in MIN_SCALE..=MAX_SCALE {
                        if ui
                            .radio(self.config.scale == scale, format!("{scale}x"))
                            .clicked()
                        {
                            ui.close_menu();
                            self.set_scale(ctx, scale);
                        }
                    }
                    ui.separator();
                    let mut interpolate = self.config.interpolate;
                    if ui.checkbox(&mut interpolate, "Smooth scaling").changed() {
                        self.config.interpolate = interpolate;
                        self.save_config();
                    }
                    let mut audio_enabled = self.config.audio_enabled;
                    if ui.checkbox(&mut audio_enabled, "Sound").changed() {
                        self.set_audio_enabled(audio_enabled);
                    }
                    ui.checkbox(&mut self.show_debug, "Debug panel");
                });

                if let Some(path) = &self.loaded_rom {
                    ui.separator();
                    ui.label(path.display().to_string());
                }
            });
        });
    }

    fn status_bar(&self, ctx: &egui::Context) {
        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal_wrapped(|ui| {
                ui.label(&self.status_line);
                ui.separator();
                ui.label(format!("Mapper: {}", self.nes.mapper_name()));
                ui.separator();
                ui.label(self.audio_status());
            });

            if !self.show_debug {
                return;
            }
            ui.separator();
            let cpu = self.nes.cpu();
            let ppu = self.nes.ppu();
            let counters = self.nes.counters();
            ui.collapsing("Debug", |ui| {
                ui.monospace(format!(
                    "CPU A={:02X} X={:02X} Y={:02X} P={:02X} SP={:02X} PC={:04X} cycles={}",
                    cpu.a, cpu.x, cpu.y, cpu.p, cpu.sp, cpu.pc, cpu.cycles
                ));
                ui.monospace(format!(
                    "PPU line={} dot={} ctrl={:02X} mask={:02X} status={:02X} v={:04X} t={:04X}",
                    self.nes.scanline(),
                    ppu.dot(),
                    ppu.ctrl(),
                    ppu.mask(),
                    ppu.status(),
                    ppu.vram_addr(),
                    ppu.temp_addr()
                ));
                ui.monospace(format!(
                    "frames={} cpu_steps={} nmis={} irqs={} dma={} unknown_ops={}",
                    counters.frames,
                    counters.cpu_steps,
                    counters.nmis,
                    counters.irqs,
                    counters.dma_transfers,
                    counters.unknown_opcodes
                ));

                let events = self.nes.recent_events(DEBUG_EVENT_LINES);
                if !events.is_empty() {
                    ui.separator();
                    ui.label("Recent events:");
                    for event in events {
                        ui.monospace(event);
                    }
                }
            });
        });
    }
}

impl eframe::App for FamicoreApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_dropped_files(ctx);
        self.handle_shortcuts(ctx);
        self.poll_controller(ctx);

        if self.nes.has_rom() {
            self.pace_frames();
        }
        self.update_texture(ctx);

        self.menu_bar(ctx);
        self.status_bar(ctx);

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                let scale = f32::from(self.config.scale);
                let target = egui::vec2(SCREEN_WIDTH as f32 * scale, SCREEN_HEIGHT as f32 * scale);
                if let Some(texture) = &self.frame_texture {
                    ui.add(egui::Image::new(texture).fit_to_exact_size(target));
                }
            });
        });

        match self.next_frame_at {
            Some(next) if self.nes.has_rom() => {
                ctx.request_repaint_after(next.saturating_duration_since(Instant::now()));
            }
            _ => ctx.request_repaint_after(IDLE_REPAINT),
        }
    }
}
