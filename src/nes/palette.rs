/// Color lookup the display applies to the screen of 6-bit system colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    #[default]
    Normal,
    Grayscale,
    /// All three emphasis bits set.
    Emphasized,
}

impl ColorMode {
    pub fn table(self) -> &'static [[u8; 3]; 64] {
        match self {
            ColorMode::Normal => &NORMAL_PALETTE,
            ColorMode::Grayscale => &GRAY_PALETTE,
            ColorMode::Emphasized => &EMPHASIS_PALETTE,
        }
    }

    pub fn rgba(self, system_color: u8) -> [u8; 4] {
        let [r, g, b] = self.table()[(system_color & 0x3F) as usize];
        [r, g, b, 0xFF]
    }
}

/// Converts a buffer of system colors into packed RGBA.
pub fn to_rgba(screen: &[u8], mode: ColorMode, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(screen.len() * 4);
    for &color in screen {
        out.extend_from_slice(&mode.rgba(color));
    }
}

pub const NORMAL_PALETTE: [[u8; 3]; 64] = [
    [0x75, 0x75, 0x75], [0x27, 0x1B, 0x8F], [0x00, 0x00, 0xAB], [0x47, 0x00, 0x9F],
    [0x8F, 0x00, 0x77], [0xAB, 0x00, 0x13], [0xA7, 0x00, 0x00], [0x7F, 0x0B, 0x00],
    [0x43, 0x2F, 0x00], [0x00, 0x47, 0x00], [0x00, 0x51, 0x00], [0x00, 0x3F, 0x17],
    [0x1B, 0x3F, 0x5F], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0xBC, 0xBC, 0xBC], [0x00, 0x73, 0xEF], [0x23, 0x3B, 0xEF], [0x83, 0x00, 0xF3],
    [0xBF, 0x00, 0xBF], [0xE7, 0x00, 0x5B], [0xDB, 0x2B, 0x00], [0xCB, 0x4F, 0x0F],
    [0x8B, 0x73, 0x00], [0x00, 0x97, 0x00], [0x00, 0xAB, 0x00], [0x00, 0x93, 0x3B],
    [0x00, 0x83, 0x8B], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0xFF, 0xFF, 0xFF], [0x3F, 0xBF, 0xFF], [0x5F, 0x97, 0xFF], [0xA7, 0x8B, 0xFD],
    [0xF7, 0x7B, 0xFF], [0xFF, 0x77, 0xB7], [0xFF, 0x77, 0x63], [0xFF, 0x9B, 0x3B],
    [0xF3, 0xBF, 0x3F], [0x83, 0xD3, 0x13], [0x4F, 0xDF, 0x4B], [0x58, 0xF8, 0x98],
    [0x00, 0xEB, 0xDB], [0x78, 0x78, 0x78], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0xFF, 0xFF, 0xFF], [0xAB, 0xE7, 0xFF], [0xC7, 0xD7, 0xFF], [0xD7, 0xCB, 0xFF],
    [0xFF, 0xC7, 0xFF], [0xFF, 0xC7, 0xDB], [0xFF, 0xBF, 0xB3], [0xFF, 0xDB, 0xAB],
    [0xFF, 0xE7, 0xA3], [0xE3, 0xFF, 0xA3], [0xAB, 0xF3, 0xBF], [0xB3, 0xFF, 0xCF],
    [0x9F, 0xFF, 0xF3], [0xC4, 0xC4, 0xC4], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
];

pub const GRAY_PALETTE: [[u8; 3]; 64] = [
    [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74],
    [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74],
    [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74],
    [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74], [0x74, 0x74, 0x74],
    [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC],
    [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC],
    [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC],
    [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC], [0xBC, 0xBC, 0xBC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
    [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC], [0xFC, 0xFC, 0xFC],
];

pub const EMPHASIS_PALETTE: [[u8; 3]; 64] = [
    [0x34, 0x34, 0x34], [0x00, 0x02, 0x3C], [0x00, 0x00, 0x51], [0x0D, 0x00, 0x4A],
    [0x2E, 0x00, 0x31], [0x41, 0x00, 0x03], [0x3E, 0x00, 0x00], [0x27, 0x00, 0x00],
    [0x0A, 0x06, 0x00], [0x00, 0x11, 0x00], [0x00, 0x19, 0x00], [0x00, 0x12, 0x00],
    [0x18, 0x0E, 0x1A], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0x67, 0x67, 0x67], [0x00, 0x2E, 0x81], [0x0B, 0x13, 0x86], [0x3A, 0x00, 0x87],
    [0x5E, 0x00, 0x65], [0x77, 0x00, 0x29], [0x70, 0x0C, 0x00], [0x63, 0x1C, 0x0C],
    [0x3C, 0x31, 0x00], [0x00, 0x46, 0x00], [0x00, 0x53, 0x00], [0x00, 0x45, 0x11],
    [0x00, 0x3B, 0x41], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0x96, 0x96, 0x96], [0x1D, 0x66, 0x95], [0x30, 0x4D, 0xA9], [0x71, 0x45, 0xA8],
    [0x8C, 0x3B, 0x95], [0x93, 0x3A, 0x65], [0x92, 0x3B, 0x30], [0x90, 0x51, 0x15],
    [0x85, 0x68, 0x0E], [0x42, 0x75, 0x04], [0x24, 0x7D, 0x1D], [0x27, 0x8D, 0x4D],
    [0x00, 0x81, 0x7A], [0x2C, 0x2C, 0x2C], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0x96, 0x96, 0x96], [0x5F, 0x84, 0x96], [0x71, 0x79, 0x9E], [0x7B, 0x72, 0x9D],
    [0x94, 0x6F, 0x95], [0x94, 0x6F, 0x7D], [0x94, 0x6B, 0x63], [0x93, 0x7C, 0x5C],
    [0x92, 0x84, 0x57], [0x80, 0x93, 0x58], [0x5E, 0x8C, 0x68], [0x62, 0x93, 0x74],
    [0x57, 0x92, 0x8D], [0x6D, 0x6D, 0x6D], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_masks_to_six_bits_and_is_opaque() {
        assert_eq!(ColorMode::Normal.rgba(0x40 | 0x20), ColorMode::Normal.rgba(0x20));
        assert_eq!(ColorMode::Normal.rgba(0x20), [0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn grayscale_collapses_each_row() {
        let row = &GRAY_PALETTE[0x10..0x20];
        assert!(row.iter().all(|c| *c == row[0]));
    }

    #[test]
    fn to_rgba_expands_every_pixel() {
        let mut out = Vec::new();
        to_rgba(&[0x0F, 0x30], ColorMode::Emphasized, &mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(&out[0..4], &[0, 0, 0, 0xFF]);
    }
}
