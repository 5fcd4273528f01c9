//! # Source media
//!
//! Fetching and decoding of the images resources are built from. Everything here is blocking, and
//! meant to be run from within a creation job or a cache load.

use std::io::Read;
use std::sync::Arc;

use image::{AnimationDecoder, RgbaImage};
use rayon::prelude::*;

use crate::{
    config::Limits,
    dither::Ditherer,
    surface::{SURFACE_BYTES, SURFACE_SIZE},
};

/// GIF delays shorter than this are treated as unset, as browsers do.
const MIN_DELAY_MS: u32 = 20;
const DEFAULT_DELAY_MS: u32 = 100;

#[derive(thiserror::Error, Debug)]
pub enum MediaError {
    #[error("source is larger than the limit of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("couldn't decode source: {0}")]
    Decode(#[from] image::ImageError),
    #[error("animation has more than {limit} frames")]
    TooManyFrames { limit: usize },
    #[error("source contains no frames")]
    Empty,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where the bytes of a new resource come from.
pub enum MediaSource {
    Bytes(Vec<u8>),
    Path(std::path::PathBuf),
    /// Any stream, e.g. a network download. Read on a creation worker.
    Reader(Box<dyn Read + Send>),
}
impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({})", crate::util::bytes(bytes.len())),
            Self::Path(path) => write!(f, "Path({})", path.display()),
            Self::Reader(_) => f.write_str("Reader"),
        }
    }
}

/// Read the whole of `source`, failing as soon as it grows past `limit` bytes.
pub fn read_limited(source: MediaSource, limit: usize) -> Result<Vec<u8>, MediaError> {
    let reader: Box<dyn Read + Send> = match source {
        MediaSource::Bytes(bytes) => {
            return if bytes.len() > limit {
                Err(MediaError::TooLarge { limit })
            } else {
                Ok(bytes)
            };
        }
        MediaSource::Path(path) => Box::new(std::fs::File::open(path)?),
        MediaSource::Reader(reader) => reader,
    };
    let mut bytes = Vec::new();
    // One past the limit, so hitting it is distinguishable from reaching it exactly.
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    reader.take(cap).read_to_end(&mut bytes)?;
    if bytes.len() > limit {
        return Err(MediaError::TooLarge { limit });
    }
    Ok(bytes)
}

/// Number of animation ticks a frame with the given delay is shown for. Always at least one.
#[must_use]
pub fn delay_ticks(delay_ms: u32, ms_per_tick: u32) -> u32 {
    let delay_ms = if delay_ms < MIN_DELAY_MS {
        DEFAULT_DELAY_MS
    } else {
        delay_ms
    };
    let ms_per_tick = ms_per_tick.max(1);
    ((delay_ms + ms_per_tick / 2) / ms_per_tick).max(1)
}

/// Whether `bytes` hold more than one frame.
pub fn is_animated(bytes: &[u8]) -> Result<bool, MediaError> {
    if image::guess_format(bytes)? != image::ImageFormat::Gif {
        return Ok(false);
    }
    let decoder = image::codecs::gif::GifDecoder::new(std::io::Cursor::new(bytes))?;
    Ok(decoder.into_frames().take(2).count() > 1)
}

fn fit(image: RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (target_width, target_height) = (width * SURFACE_SIZE, height * SURFACE_SIZE);
    if image.dimensions() == (target_width, target_height) {
        image
    } else {
        image::imageops::resize(
            &image,
            target_width,
            target_height,
            image::imageops::FilterType::Triangle,
        )
    }
}

/// Decode a single image, scaled to cover `width`x`height` surfaces.
pub fn decode_still(bytes: &[u8], width: u32, height: u32) -> Result<RgbaImage, MediaError> {
    let image = image::load_from_memory(bytes)?.into_rgba8();
    Ok(fit(image, width, height))
}

/// Frames of an animation, each scaled to cover the resource and paired with the number of ticks it is shown for.
pub struct FrameStream {
    frames: image::Frames<'static>,
    width: u32,
    height: u32,
    ms_per_tick: u32,
    max_frames: usize,
    yielded: usize,
}
impl Iterator for FrameStream {
    type Item = Result<(RgbaImage, u32), MediaError>;
    fn next(&mut self) -> Option<Self::Item> {
        let frame = match self.frames.next()? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e.into())),
        };
        if self.yielded == self.max_frames {
            return Some(Err(MediaError::TooManyFrames {
                limit: self.max_frames,
            }));
        }
        self.yielded += 1;
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay_ms = numer / denom.max(1);
        let ticks = delay_ticks(delay_ms, self.ms_per_tick);
        Some(Ok((
            fit(frame.into_buffer(), self.width, self.height),
            ticks,
        )))
    }
}

/// Start decoding an animation. Frames are decoded one at a time as the stream is pulled.
pub fn decode_frames(
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    limits: &Limits,
    ms_per_tick: u32,
) -> Result<FrameStream, MediaError> {
    let decoder = image::codecs::gif::GifDecoder::new(std::io::Cursor::new(bytes))?;
    Ok(FrameStream {
        frames: decoder.into_frames(),
        width,
        height,
        ms_per_tick,
        max_frames: limits.max_frames,
        yielded: 0,
    })
}

/// Cut an image into surface-sized tiles, row-major.
#[must_use]
pub fn split(image: &RgbaImage, width: u32, height: u32) -> Vec<RgbaImage> {
    (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .map(|(x, y)| {
            image::imageops::crop_imm(
                image,
                x * SURFACE_SIZE,
                y * SURFACE_SIZE,
                SURFACE_SIZE,
                SURFACE_SIZE,
            )
            .to_image()
        })
        .collect()
}

/// Dither every tile into a surface buffer.
#[must_use]
pub fn dither_tiles(tiles: &[RgbaImage], ditherer: &dyn Ditherer) -> Vec<Arc<[u8]>> {
    tiles
        .par_iter()
        .map(|tile| {
            let pixels = ditherer.dither(tile);
            debug_assert_eq!(pixels.len(), SURFACE_BYTES);
            Arc::from(pixels)
        })
        .collect()
}
