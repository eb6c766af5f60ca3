use anyhow::{Context, Result, bail};
use std::{fs, path::Path};

use super::mapper::Mirroring;

pub const PRG_BANK_SIZE: usize = 16 * 1024;
pub const CHR_BANK_SIZE: usize = 8 * 1024;
const HEADER_SIZE: usize = 16;
const TRAINER_SIZE: usize = 512;

/// Raw ROM image split into its PRG and CHR areas, plus the header fields
/// the board needs at load time.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let prg_banks = bytes[4] as usize;
        let chr_banks = bytes[5] as usize;
        let flags6 = bytes[6];
        let flags7 = bytes[7];

        if prg_banks == 0 {
            bail!("invalid PRG ROM: header declares zero 16KB banks");
        }

        let mapper_id = (flags6 >> 4) | (flags7 & 0xF0);
        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let mut cursor = HEADER_SIZE;
        if (flags6 & 0x04) != 0 {
            cursor += TRAINER_SIZE;
        }

        let prg_size = prg_banks * PRG_BANK_SIZE;
        if bytes.len() < cursor + prg_size {
            bail!(
                "ROM truncated: expected {} PRG bytes but file ended early",
                prg_size
            );
        }
        let prg_rom = bytes[cursor..cursor + prg_size].to_vec();
        cursor += prg_size;

        let (chr_data, chr_is_ram) = if chr_banks == 0 {
            (vec![0; CHR_BANK_SIZE], true)
        } else {
            let chr_size = chr_banks * CHR_BANK_SIZE;
            if bytes.len() < cursor + chr_size {
                bail!(
                    "ROM truncated: expected {} CHR bytes but file ended early",
                    chr_size
                );
            }
            (bytes[cursor..cursor + chr_size].to_vec(), false)
        };

        Ok(Self {
            mapper_id,
            mirroring,
            four_screen,
            prg_rom,
            chr_data,
            chr_is_ram,
        })
    }

    pub fn prg_banks(&self) -> usize {
        self.prg_rom.len() / PRG_BANK_SIZE
    }

    pub fn chr_banks(&self) -> usize {
        if self.chr_is_ram {
            0
        } else {
            self.chr_data.len() / CHR_BANK_SIZE
        }
    }

    pub fn prg_read(&self, offset: usize) -> u8 {
        self.prg_rom[offset % self.prg_rom.len()]
    }

    pub fn chr_read(&self, offset: usize) -> u8 {
        self.chr_data[offset % self.chr_data.len()]
    }

    /// Only lands when the board carries CHR RAM instead of CHR ROM.
    pub fn chr_write(&mut self, offset: usize, value: u8) {
        if self.chr_is_ram {
            let idx = offset % self.chr_data.len();
            self.chr_data[idx] = value;
        }
    }
}
