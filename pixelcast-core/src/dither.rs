//! # Dithering
//!
//! Conversion of RGBA pixels into the palette indices surfaces are made of. The palette is fixed:
//! index 0 is transparent, and indices `1..=216` are a 6x6x6 color cube.

use image::{Rgba, RgbaImage};

/// Number of intensity levels per channel in the cube.
const LEVELS: u8 = 6;
/// Distance between adjacent levels.
const STEP: u8 = 255 / (LEVELS - 1);
/// Alpha below which a pixel is transparent.
const ALPHA_CUTOFF: u8 = 128;

pub struct Palette;
impl Palette {
    pub const TRANSPARENT: u8 = 0;
    pub const LEN: usize = 1 + (LEVELS as usize).pow(3);

    /// Index of the cube entry with the given per-channel levels, each in `0..6`.
    #[must_use]
    pub fn cube(r: u8, g: u8, b: u8) -> u8 {
        debug_assert!(r < LEVELS && g < LEVELS && b < LEVELS);
        1 + r * LEVELS * LEVELS + g * LEVELS + b
    }
    /// Gray of the given level, `0..6`, clamped.
    #[must_use]
    pub fn gray(level: u8) -> u8 {
        let level = level.min(LEVELS - 1);
        Self::cube(level, level, level)
    }
    /// Color of a palette index. `None` for out-of-range indices.
    #[must_use]
    pub fn color(index: u8) -> Option<Rgba<u8>> {
        if index == Self::TRANSPARENT {
            return Some(Rgba([0, 0, 0, 0]));
        }
        if usize::from(index) >= Self::LEN {
            return None;
        }
        let cube = index - 1;
        let r = cube / (LEVELS * LEVELS);
        let g = cube / LEVELS % LEVELS;
        let b = cube % LEVELS;
        Some(Rgba([r * STEP, g * STEP, b * STEP, 255]))
    }
    /// Level closest to a channel value.
    fn level(channel: i32) -> u8 {
        let clamped = channel.clamp(0, 255);
        // Rounded division, result is in 0..LEVELS.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let level = ((clamped + i32::from(STEP) / 2) / i32::from(STEP)) as u8;
        level
    }
    #[must_use]
    pub fn nearest(pixel: Rgba<u8>) -> u8 {
        let [r, g, b, a] = pixel.0;
        if a < ALPHA_CUTOFF {
            return Self::TRANSPARENT;
        }
        Self::cube(
            Self::level(i32::from(r)),
            Self::level(i32::from(g)),
            Self::level(i32::from(b)),
        )
    }
}

/// Maps an image into palette indices, row-major.
pub trait Ditherer: Send + Sync {
    fn dither(&self, image: &RgbaImage) -> Vec<u8>;
}

/// Which ditherer a resource uses. Persisted with the resource.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Debug,
    Default,
    strum::EnumString,
    strum::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum DitherKind {
    /// Each pixel independently mapped to its nearest palette color.
    #[default]
    NearestColor,
    /// Floyd-Steinberg error diffusion.
    ErrorDiffusion,
}
impl DitherKind {
    #[must_use]
    pub fn ditherer(self) -> &'static dyn Ditherer {
        match self {
            Self::NearestColor => &NearestColor,
            Self::ErrorDiffusion => &ErrorDiffusion,
        }
    }
}

pub struct NearestColor;
impl Ditherer for NearestColor {
    fn dither(&self, image: &RgbaImage) -> Vec<u8> {
        image.pixels().map(|pixel| Palette::nearest(*pixel)).collect()
    }
}

pub struct ErrorDiffusion;
impl Ditherer for ErrorDiffusion {
    fn dither(&self, image: &RgbaImage) -> Vec<u8> {
        let width = image.width() as usize;
        let mut out = Vec::with_capacity(image.as_raw().len() / 4);
        // Accumulated error of the current and next row, per channel.
        let mut current = vec![[0i32; 3]; width + 2];
        let mut next = vec![[0i32; 3]; width + 2];
        for row in image.rows() {
            for (x, pixel) in row.enumerate() {
                let [r, g, b, a] = pixel.0;
                if a < ALPHA_CUTOFF {
                    out.push(Palette::TRANSPARENT);
                    continue;
                }
                // Offset by one so x-1 never underflows.
                let cell = x + 1;
                let wanted = [
                    i32::from(r) + current[cell][0] / 16,
                    i32::from(g) + current[cell][1] / 16,
                    i32::from(b) + current[cell][2] / 16,
                ];
                let levels = wanted.map(Palette::level);
                out.push(Palette::cube(levels[0], levels[1], levels[2]));
                for channel in 0..3 {
                    let error = wanted[channel] - i32::from(levels[channel] * STEP);
                    current[cell + 1][channel] += error * 7;
                    next[cell - 1][channel] += error * 3;
                    next[cell][channel] += error * 5;
                    next[cell + 1][channel] += error;
                }
            }
            std::mem::swap(&mut current, &mut next);
            next.iter_mut().for_each(|cell| *cell = [0; 3]);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cube_roundtrip() {
        for index in 1..Palette::LEN {
            let index = index as u8;
            let color = Palette::color(index).unwrap();
            assert_eq!(Palette::nearest(color), index);
        }
        assert_eq!(Palette::color(217), None);
    }
    #[test]
    fn transparency() {
        assert_eq!(Palette::nearest(Rgba([255, 255, 255, 10])), Palette::TRANSPARENT);
        assert_eq!(Palette::nearest(Rgba([0, 0, 0, 255])), Palette::gray(0));
        assert_eq!(Palette::nearest(Rgba([255, 255, 255, 255])), Palette::gray(5));
    }
    #[test]
    fn solid_images_agree() {
        // On exactly representable colors diffusion has no error to spread.
        let image = RgbaImage::from_pixel(8, 8, Rgba([51, 102, 255, 255]));
        let nearest = NearestColor.dither(&image);
        assert_eq!(nearest, ErrorDiffusion.dither(&image));
        assert!(nearest.iter().all(|&i| i == Palette::cube(1, 2, 5)));
    }
    #[test]
    fn diffusion_mixes_levels() {
        // Halfway between two levels - nearest picks one, diffusion alternates.
        let image = RgbaImage::from_pixel(16, 16, Rgba([25, 25, 25, 255]));
        let diffused = ErrorDiffusion.dither(&image);
        assert!(diffused.contains(&Palette::gray(0)));
        assert!(diffused.contains(&Palette::gray(1)));
    }
    #[test]
    fn parse_kind() {
        assert_eq!(
            "error_diffusion".parse::<DitherKind>(),
            Ok(DitherKind::ErrorDiffusion)
        );
        assert_eq!(DitherKind::default(), DitherKind::NearestColor);
    }
}
