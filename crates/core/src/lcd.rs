//! G13 LCD framebuffer and text rendering.
//!
//! The panel is 160x43 pixels, 1 bit per pixel. The device expects the image
//! in row blocks: each byte is a vertical strip of 8 pixels, so pixel (x, y)
//! lives in byte `x + (y / 8) * 160` at bit `y % 8`. Six row blocks cover the
//! 43 visible rows; the last five rows of the final block are off-panel.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const LCD_WIDTH: usize = 160;
pub const LCD_HEIGHT: usize = 43;
/// Packed framebuffer size in bytes.
pub const FRAMEBUFFER_LEN: usize = LCD_WIDTH * LCD_HEIGHT.div_ceil(8);

/// Glyph cell width including one column of spacing.
pub const CELL_WIDTH: usize = 6;
/// Text line height; one line per row block.
pub const LINE_HEIGHT: usize = 8;
pub const TEXT_COLUMNS: usize = LCD_WIDTH / CELL_WIDTH;
pub const TEXT_LINES: usize = LCD_HEIGHT.div_ceil(LINE_HEIGHT) - 1;

/// Packed 1-bpp LCD image.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Framebuffer(Vec<u8>);

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lit = self.0.iter().map(|b| b.count_ones()).sum::<u32>();
        write!(f, "Framebuffer({lit} px lit)")
    }
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::blank()
    }
}

impl Framebuffer {
    pub fn blank() -> Self {
        Self(vec![0; FRAMEBUFFER_LEN])
    }

    /// Wrap an already packed image. Must be exactly [`FRAMEBUFFER_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FRAMEBUFFER_LEN {
            return Err(Error::OutOfRange {
                field: "framebuffer length",
                value: bytes.len() as u64,
                min: FRAMEBUFFER_LEN as u64,
                max: FRAMEBUFFER_LEN as u64,
            });
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Set or clear one pixel. Off-panel coordinates are ignored.
    pub fn set_pixel(&mut self, x: usize, y: usize, on: bool) {
        if x >= LCD_WIDTH || y >= LCD_HEIGHT {
            return;
        }
        let idx = x + (y / 8) * LCD_WIDTH;
        let mask = 1u8 << (y % 8);
        if on {
            self.0[idx] |= mask;
        } else {
            self.0[idx] &= !mask;
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> bool {
        if x >= LCD_WIDTH || y >= LCD_HEIGHT {
            return false;
        }
        self.0[x + (y / 8) * LCD_WIDTH] & (1 << (y % 8)) != 0
    }

    /// Render up to [`TEXT_LINES`] lines of text. Characters past
    /// [`TEXT_COLUMNS`] are cut off; characters without a glyph draw as `?`.
    pub fn from_text<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut fb = Self::blank();
        for (line, text) in lines.iter().take(TEXT_LINES).enumerate() {
            for (col, ch) in text.as_ref().chars().take(TEXT_COLUMNS).enumerate() {
                fb.draw_glyph(col * CELL_WIDTH, line, ch);
            }
        }
        fb
    }

    // A line maps onto one row block, so glyph columns copy straight in.
    fn draw_glyph(&mut self, x: usize, line: usize, ch: char) {
        let glyph = glyph(ch);
        let base = line * LCD_WIDTH + x;
        for (i, column) in glyph.iter().enumerate() {
            if x + i < LCD_WIDTH {
                self.0[base + i] = *column;
            }
        }
    }

    /// Text preview of the visible panel, one char per pixel.
    pub fn to_ascii(&self) -> String {
        let mut out = String::with_capacity((LCD_WIDTH + 1) * LCD_HEIGHT);
        for y in 0..LCD_HEIGHT {
            for x in 0..LCD_WIDTH {
                out.push(if self.pixel(x, y) { '#' } else { '.' });
            }
            out.push('\n');
        }
        out
    }
}

impl TryFrom<Vec<u8>> for Framebuffer {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes(&bytes)
    }
}

impl From<Framebuffer> for Vec<u8> {
    fn from(fb: Framebuffer) -> Self {
        fb.0
    }
}

/// Column bitmap for a character, LSB at the top.
pub fn glyph(ch: char) -> &'static [u8; 5] {
    let code = ch as u32;
    if (0x20..=0x7E).contains(&code) {
        &FONT_5X7[(code - 0x20) as usize]
    } else {
        &FONT_5X7[('?' as u32 - 0x20) as usize]
    }
}

static FONT_5X7: [[u8; 5]; 95] = [
    [0x00, 0x00, 0x00, 0x00, 0x00], // ' '
    [0x00, 0x00, 0x5F, 0x00, 0x00], // !
    [0x00, 0x07, 0x00, 0x07, 0x00], // "
    [0x14, 0x7F, 0x14, 0x7F, 0x14], // #
    [0x24, 0x2A, 0x7F, 0x2A, 0x12], // $
    [0x23, 0x13, 0x08, 0x64, 0x62], // %
    [0x36, 0x49, 0x55, 0x22, 0x50], // &
    [0x00, 0x05, 0x03, 0x00, 0x00], // '
    [0x00, 0x1C, 0x22, 0x41, 0x00], // (
    [0x00, 0x41, 0x22, 0x1C, 0x00], // )
    [0x08, 0x2A, 0x1C, 0x2A, 0x08], // *
    [0x08, 0x08, 0x3E, 0x08, 0x08], // +
    [0x00, 0x50, 0x30, 0x00, 0x00], // ,
    [0x08, 0x08, 0x08, 0x08, 0x08], // -
    [0x00, 0x60, 0x60, 0x00, 0x00], // .
    [0x20, 0x10, 0x08, 0x04, 0x02], // /
    [0x3E, 0x51, 0x49, 0x45, 0x3E], // 0
    [0x00, 0x42, 0x7F, 0x40, 0x00], // 1
    [0x42, 0x61, 0x51, 0x49, 0x46], // 2
    [0x21, 0x41, 0x45, 0x4B, 0x31], // 3
    [0x18, 0x14, 0x12, 0x7F, 0x10], // 4
    [0x27, 0x45, 0x45, 0x45, 0x39], // 5
    [0x3C, 0x4A, 0x49, 0x49, 0x30], // 6
    [0x01, 0x71, 0x09, 0x05, 0x03], // 7
    [0x36, 0x49, 0x49, 0x49, 0x36], // 8
    [0x06, 0x49, 0x49, 0x29, 0x1E], // 9
    [0x00, 0x36, 0x36, 0x00, 0x00], // :
    [0x00, 0x56, 0x36, 0x00, 0x00], // ;
    [0x08, 0x14, 0x22, 0x41, 0x00], // <
    [0x14, 0x14, 0x14, 0x14, 0x14], // =
    [0x00, 0x41, 0x22, 0x14, 0x08], // >
    [0x02, 0x01, 0x51, 0x09, 0x06], // ?
    [0x32, 0x49, 0x79, 0x41, 0x3E], // @
    [0x7E, 0x11, 0x11, 0x11, 0x7E], // A
    [0x7F, 0x49, 0x49, 0x49, 0x36], // B
    [0x3E, 0x41, 0x41, 0x41, 0x22], // C
    [0x7F, 0x41, 0x41, 0x22, 0x1C], // D
    [0x7F, 0x49, 0x49, 0x49, 0x41], // E
    [0x7F, 0x09, 0x09, 0x01, 0x01], // F
    [0x3E, 0x41, 0x41, 0x51, 0x32], // G
    [0x7F, 0x08, 0x08, 0x08, 0x7F], // H
    [0x00, 0x41, 0x7F, 0x41, 0x00], // I
    [0x20, 0x40, 0x41, 0x3F, 0x01], // J
    [0x7F, 0x08, 0x14, 0x22, 0x41], // K
    [0x7F, 0x40, 0x40, 0x40, 0x40], // L
    [0x7F, 0x02, 0x04, 0x02, 0x7F], // M
    [0x7F, 0x04, 0x08, 0x10, 0x7F], // N
    [0x3E, 0x41, 0x41, 0x41, 0x3E], // O
    [0x7F, 0x09, 0x09, 0x09, 0x06], // P
    [0x3E, 0x41, 0x51, 0x21, 0x5E], // Q
    [0x7F, 0x09, 0x19, 0x29, 0x46], // R
    [0x46, 0x49, 0x49, 0x49, 0x31], // S
    [0x01, 0x01, 0x7F, 0x01, 0x01], // T
    [0x3F, 0x40, 0x40, 0x40, 0x3F], // U
    [0x1F, 0x20, 0x40, 0x20, 0x1F], // V
    [0x7F, 0x20, 0x18, 0x20, 0x7F], // W
    [0x63, 0x14, 0x08, 0x14, 0x63], // X
    [0x03, 0x04, 0x78, 0x04, 0x03], // Y
    [0x61, 0x51, 0x49, 0x45, 0x43], // Z
    [0x00, 0x00, 0x7F, 0x41, 0x41], // [
    [0x02, 0x04, 0x08, 0x10, 0x20], // backslash
    [0x41, 0x41, 0x7F, 0x00, 0x00], // ]
    [0x04, 0x02, 0x01, 0x02, 0x04], // ^
    [0x40, 0x40, 0x40, 0x40, 0x40], // _
    [0x00, 0x01, 0x02, 0x04, 0x00], // `
    [0x20, 0x54, 0x54, 0x54, 0x78], // a
    [0x7F, 0x48, 0x44, 0x44, 0x38], // b
    [0x38, 0x44, 0x44, 0x44, 0x20], // c
    [0x38, 0x44, 0x44, 0x48, 0x7F], // d
    [0x38, 0x54, 0x54, 0x54, 0x18], // e
    [0x08, 0x7E, 0x09, 0x01, 0x02], // f
    [0x08, 0x14, 0x54, 0x54, 0x3C], // g
    [0x7F, 0x08, 0x04, 0x04, 0x78], // h
    [0x00, 0x44, 0x7D, 0x40, 0x00], // i
    [0x20, 0x40, 0x44, 0x3D, 0x00], // j
    [0x00, 0x7F, 0x10, 0x28, 0x44], // k
    [0x00, 0x41, 0x7F, 0x40, 0x00], // l
    [0x7C, 0x04, 0x18, 0x04, 0x78], // m
    [0x7C, 0x08, 0x04, 0x04, 0x78], // n
    [0x38, 0x44, 0x44, 0x44, 0x38], // o
    [0x7C, 0x14, 0x14, 0x14, 0x08], // p
    [0x08, 0x14, 0x14, 0x18, 0x7C], // q
    [0x7C, 0x08, 0x04, 0x04, 0x08], // r
    [0x48, 0x54, 0x54, 0x54, 0x20], // s
    [0x04, 0x3F, 0x44, 0x40, 0x20], // t
    [0x3C, 0x40, 0x40, 0x20, 0x7C], // u
    [0x1C, 0x20, 0x40, 0x20, 0x1C], // v
    [0x3C, 0x40, 0x30, 0x40, 0x3C], // w
    [0x44, 0x28, 0x10, 0x28, 0x44], // x
    [0x0C, 0x50, 0x50, 0x50, 0x3C], // y
    [0x44, 0x64, 0x54, 0x4C, 0x44], // z
    [0x00, 0x08, 0x36, 0x41, 0x00], // {
    [0x00, 0x00, 0x7F, 0x00, 0x00], // |
    [0x00, 0x41, 0x36, 0x08, 0x00], // }
    [0x10, 0x08, 0x08, 0x10, 0x08], // ~
];
