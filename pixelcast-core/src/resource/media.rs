//! The kinds of media a resource can be made of, and how each turns into surface pixels.

use std::sync::Arc;

use rayon::prelude::*;

use super::{document::MediaDocument, LoadContext, LoadError};
use crate::{
    animation::{AnimationEncoder, AnimationTable},
    dither::DitherKind,
    id::ResourceId,
    lazy::{Blob, Lazy, LazyImage, SourceRef},
    media,
    storage::Storage,
    surface::SURFACE_BYTES,
};

/// Size and dithering of the resource some media belongs to.
#[derive(Copy, Clone, Debug)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub ditherer: DitherKind,
}
impl Geometry {
    #[must_use]
    pub fn tiles(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

pub enum Media {
    /// A still image, kept as one RGBA tile per surface.
    Still { images: Vec<LazyImage> },
    /// The original bytes of an animated GIF.
    Animated {
        source: Lazy<Blob>,
        ms_per_tick: u32,
    },
    /// Pre-dithered surfaces drawn over handles that weren't freshly allocated.
    Overlay { palettes: Vec<Lazy<Blob>> },
    /// Pre-dithered surfaces with no source image to rebuild from.
    Baked { palettes: Vec<Lazy<Blob>> },
}

/// Decoded pixels of a resource.
pub enum ColorCache {
    Still(Vec<Arc<[u8]>>),
    Animated(Arc<AnimationTable>),
}
impl ColorCache {
    /// Pixels currently shown on a surface. For animations, the first frame.
    #[must_use]
    pub fn surface(&self, index: usize) -> Option<Arc<[u8]>> {
        match self {
            Self::Still(surfaces) => surfaces.get(index).cloned(),
            Self::Animated(table) => table.base_pixels(index),
        }
    }
    /// Number of surfaces covered.
    #[must_use]
    pub fn tiles(&self) -> usize {
        match self {
            Self::Still(surfaces) => surfaces.len(),
            Self::Animated(table) => table.tiles(),
        }
    }
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        match self {
            Self::Still(surfaces) => surfaces.iter().map(|s| s.len()).sum(),
            Self::Animated(table) => table.memory_usage(),
        }
    }
}

fn palette(lazy: &Lazy<Blob>, storage: &dyn Storage) -> Result<Arc<[u8]>, LoadError> {
    let blob = lazy.get(storage)?;
    if blob.0.len() != SURFACE_BYTES {
        return Err(LoadError::BadPalette(blob.0.len()));
    }
    Ok(Arc::from(blob.0.as_slice()))
}

/// Decode an animation into a table.
fn encode_animation(
    bytes: Vec<u8>,
    geometry: Geometry,
    ms_per_tick: u32,
    context: &LoadContext,
) -> Result<AnimationTable, LoadError> {
    let ditherer = geometry.ditherer.ditherer();
    let mut encoder = AnimationEncoder::new(&context.ids, geometry.tiles());
    for frame in media::decode_frames(
        bytes,
        geometry.width,
        geometry.height,
        &context.limits,
        ms_per_tick,
    )? {
        let (image, ticks) = frame?;
        let tiles = media::split(&image, geometry.width, geometry.height);
        encoder.push_frame(media::dither_tiles(&tiles, ditherer), ticks)?;
    }
    Ok(encoder.finish()?)
}

fn check_shape(expected: usize, got: usize) -> Result<(), LoadError> {
    if expected == got {
        Ok(())
    } else {
        Err(LoadError::Shape { expected, got })
    }
}

impl Media {
    /// Whether this media needs an animation table and distribution.
    #[must_use]
    pub fn requires_animation(&self) -> bool {
        matches!(self, Self::Animated { .. })
    }
    /// Whether the media can be replaced by a new source.
    #[must_use]
    pub fn is_updatable(&self) -> bool {
        matches!(self, Self::Still { .. } | Self::Animated { .. })
    }
    /// Whether the surfaces should be tombstoned once the resource is deleted. Overlays never
    /// took fresh handles, so they leave them alone.
    #[must_use]
    pub fn tombstones_surfaces(&self) -> bool {
        !matches!(self, Self::Overlay { .. })
    }
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Still { .. } => "still",
            Self::Animated { .. } => "animated",
            Self::Overlay { .. } => "overlay",
            Self::Baked { .. } => "baked",
        }
    }
    /// Check this media fits a resource with the given number of surfaces.
    pub fn check_shape(&self, tiles: usize) -> Result<(), LoadError> {
        match self {
            Self::Still { images } => check_shape(tiles, images.len()),
            Self::Overlay { palettes } | Self::Baked { palettes } => {
                check_shape(tiles, palettes.len())
            }
            Self::Animated { .. } => Ok(()),
        }
    }
    /// Decode every surface.
    pub fn load(&self, geometry: Geometry, context: &LoadContext) -> Result<ColorCache, LoadError> {
        let storage = &*context.storage;
        match self {
            Self::Still { images } => {
                let ditherer = geometry.ditherer.ditherer();
                let surfaces = images
                    .par_iter()
                    .map(|image| -> Result<Arc<[u8]>, LoadError> {
                        let image = image.get(storage)?;
                        Ok(Arc::from(ditherer.dither(&image)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ColorCache::Still(surfaces))
            }
            Self::Animated {
                source,
                ms_per_tick,
            } => {
                let bytes = source.get(storage)?.0.clone();
                let table = encode_animation(bytes, geometry, *ms_per_tick, context)?;
                Ok(ColorCache::Animated(Arc::new(table)))
            }
            Self::Overlay { palettes } | Self::Baked { palettes } => Ok(ColorCache::Still(
                palettes
                    .iter()
                    .map(|lazy| palette(lazy, storage))
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
    /// Decode one surface without building a whole cache. The slow path, for when there's no cache to serve from.
    pub fn load_surface(
        &self,
        index: usize,
        geometry: Geometry,
        context: &LoadContext,
    ) -> Result<Arc<[u8]>, LoadError> {
        let storage = &*context.storage;
        let out_of_range = || LoadError::Shape {
            expected: geometry.tiles(),
            got: index,
        };
        match self {
            Self::Still { images } => {
                let image = images.get(index).ok_or_else(out_of_range)?.get(storage)?;
                Ok(Arc::from(geometry.ditherer.ditherer().dither(&image)))
            }
            Self::Animated {
                source,
                ms_per_tick,
            } => {
                if index >= geometry.tiles() {
                    return Err(out_of_range());
                }
                let bytes = source.get(storage)?.0.clone();
                let (first, _) = media::decode_frames(
                    bytes,
                    geometry.width,
                    geometry.height,
                    &context.limits,
                    *ms_per_tick,
                )?
                .next()
                .ok_or(media::MediaError::Empty)??;
                let tile = media::split(&first, geometry.width, geometry.height)
                    .into_iter()
                    .nth(index)
                    .ok_or_else(out_of_range)?;
                Ok(Arc::from(geometry.ditherer.ditherer().dither(&tile)))
            }
            Self::Overlay { palettes } | Self::Baked { palettes } => {
                palette(palettes.get(index).ok_or_else(out_of_range)?, storage)
            }
        }
    }
    /// Where each persisted source lives. Sources still only in memory are skipped.
    #[must_use]
    pub fn sources(&self) -> Vec<SourceRef> {
        match self {
            Self::Still { images } => images.iter().filter_map(Lazy::source).collect(),
            Self::Animated { source, .. } => source.source().into_iter().collect(),
            Self::Overlay { palettes } | Self::Baked { palettes } => {
                palettes.iter().filter_map(Lazy::source).collect()
            }
        }
    }
    /// Persist every source under `id`, returning the document describing them.
    pub fn save(&self, id: ResourceId, storage: &dyn Storage) -> Result<MediaDocument, LoadError> {
        let names = |lazies: &[Lazy<Blob>]| -> Result<Vec<String>, LoadError> {
            lazies
                .iter()
                .map(|lazy| Ok(lazy.persist(id, storage)?.filename))
                .collect()
        };
        Ok(match self {
            Self::Still { images } => MediaDocument::Still {
                sources: images
                    .iter()
                    .map(|image| Ok(image.persist(id, storage)?.filename))
                    .collect::<Result<_, LoadError>>()?,
            },
            Self::Animated {
                source,
                ms_per_tick,
            } => MediaDocument::Animated {
                source: source.persist(id, storage)?.filename,
                ms_per_tick: *ms_per_tick,
            },
            Self::Overlay { palettes } => MediaDocument::Overlay {
                palettes: names(palettes.as_slice())?,
            },
            Self::Baked { palettes } => MediaDocument::Baked {
                palettes: names(palettes.as_slice())?,
            },
        })
    }
    /// Rebuild from a document. Nothing is read from storage until needed.
    #[must_use]
    pub fn from_document(document: &MediaDocument, id: ResourceId) -> Self {
        let stored = |filename: &String| SourceRef {
            resource: id,
            filename: filename.clone(),
        };
        let blobs =
            |names: &[String]| -> Vec<Lazy<Blob>> { names.iter().map(|n| Lazy::stored(stored(n))).collect() };
        match document {
            MediaDocument::Still { sources } => Self::Still {
                images: sources.iter().map(|n| LazyImage::stored(stored(n))).collect(),
            },
            MediaDocument::Animated {
                source,
                ms_per_tick,
            } => Self::Animated {
                source: Lazy::stored(stored(source)),
                ms_per_tick: *ms_per_tick,
            },
            MediaDocument::Overlay { palettes } => Self::Overlay {
                palettes: blobs(palettes.as_slice()),
            },
            MediaDocument::Baked { palettes } => Self::Baked {
                palettes: blobs(palettes.as_slice()),
            },
        }
    }
    /// An independent copy, not yet persisted anywhere.
    pub fn deep_clone(&self, storage: &dyn Storage) -> Result<Self, LoadError> {
        let blobs = |lazies: &[Lazy<Blob>]| -> Result<Vec<Lazy<Blob>>, LoadError> {
            lazies
                .iter()
                .map(|lazy| Ok(lazy.detach(storage)?))
                .collect()
        };
        Ok(match self {
            Self::Still { images } => Self::Still {
                images: images
                    .iter()
                    .map(|image| Ok(image.detach(storage)?))
                    .collect::<Result<_, LoadError>>()?,
            },
            Self::Animated {
                source,
                ms_per_tick,
            } => Self::Animated {
                source: source.detach(storage)?,
                ms_per_tick: *ms_per_tick,
            },
            Self::Overlay { palettes } => Self::Overlay {
                palettes: blobs(palettes.as_slice())?,
            },
            Self::Baked { palettes } => Self::Baked {
                palettes: blobs(palettes.as_slice())?,
            },
        })
    }
}

impl std::fmt::Debug for Media {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_name())
    }
}
