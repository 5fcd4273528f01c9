//! # Animation tables
//!
//! An animated resource is shown as a sequence of ticks. For each tile, most consecutive ticks show
//! the exact same bytes, either because a frame lasts several ticks or because that region of the image
//! simply doesn't change. The table stores, per tile and per tick, either a fresh [`FrameId`] (the bytes differ
//! from the last emitted ones) or nothing (repeat the previous). Viewers are then sent each distinct frame once
//! and told which one to display thereafter.

use std::sync::Arc;

use crate::id::{FrameId, IdAllocator};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnimationError {
    #[error("frame has {got} tiles, expected {expected}")]
    TileCount { expected: usize, got: usize },
    #[error("animation has no frames")]
    Empty,
}

/// Builds an [`AnimationTable`] one frame at a time, so the decoded frames never need to be in memory all at once.
pub struct AnimationEncoder<'ids> {
    ids: &'ids IdAllocator,
    /// Per tile, per tick.
    slots: Vec<Vec<Option<FrameId>>>,
    /// Per tile, the bytes of the last emitted frame.
    last: Vec<Option<(FrameId, Arc<[u8]>)>>,
    pixels: hashbrown::HashMap<FrameId, Arc<[u8]>>,
}
impl<'ids> AnimationEncoder<'ids> {
    #[must_use]
    pub fn new(ids: &'ids IdAllocator, tiles: usize) -> Self {
        Self {
            ids,
            slots: vec![Vec::new(); tiles],
            last: vec![None; tiles],
            pixels: hashbrown::HashMap::new(),
        }
    }
    /// Append a frame, shown for `repeat_ticks` ticks (at least one).
    pub fn push_frame(
        &mut self,
        tiles: Vec<Arc<[u8]>>,
        repeat_ticks: u32,
    ) -> Result<(), AnimationError> {
        if tiles.len() != self.slots.len() {
            return Err(AnimationError::TileCount {
                expected: self.slots.len(),
                got: tiles.len(),
            });
        }
        let extra_ticks = repeat_ticks.saturating_sub(1) as usize;
        for ((slots, last), tile) in self.slots.iter_mut().zip(&mut self.last).zip(tiles) {
            let repeat = last
                .as_ref()
                .is_some_and(|(_, previous)| **previous == *tile);
            if repeat {
                slots.push(None);
            } else {
                let id = self.ids.next_frame_id();
                self.pixels.insert(id, tile.clone());
                *last = Some((id, tile));
                slots.push(Some(id));
            }
            slots.extend(std::iter::repeat(None).take(extra_ticks));
        }
        Ok(())
    }
    pub fn finish(self) -> Result<AnimationTable, AnimationError> {
        let len = self.slots.first().map_or(0, Vec::len);
        if len == 0 {
            return Err(AnimationError::Empty);
        }
        let base = self
            .slots
            .iter()
            .map(|slots| slots[0])
            .collect::<Option<smallvec::SmallVec<_>>>()
            // First slot is never a repeat.
            .ok_or(AnimationError::Empty)?;
        Ok(AnimationTable {
            len,
            slots: self.slots,
            base,
            pixels: self.pixels,
        })
    }
}

/// Deduplicated frames of every tile of an animated resource.
pub struct AnimationTable {
    len: usize,
    slots: Vec<Vec<Option<FrameId>>>,
    /// Frame shown on tick 0 of each tile.
    base: smallvec::SmallVec<[FrameId; 4]>,
    pixels: hashbrown::HashMap<FrameId, Arc<[u8]>>,
}
impl AnimationTable {
    /// Encode a whole sequence of `(tiles, ticks)` frames.
    pub fn encode(
        frames: impl IntoIterator<Item = (Vec<Arc<[u8]>>, u32)>,
        tiles: usize,
        ids: &IdAllocator,
    ) -> Result<Self, AnimationError> {
        let mut encoder = AnimationEncoder::new(ids, tiles);
        for (frame, ticks) in frames {
            encoder.push_frame(frame, ticks)?;
        }
        encoder.finish()
    }
    /// Length of the animation, in ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    #[must_use]
    pub fn tiles(&self) -> usize {
        self.slots.len()
    }
    /// Number of distinct frames across every tile.
    #[must_use]
    pub fn distinct_frames(&self) -> usize {
        self.pixels.len()
    }
    /// Frame a tile shows at `tick`. Ticks past the end wrap around.
    ///
    /// Without `lookbehind`, ticks that repeat the previous frame resolve to `None`. With it, they resolve
    /// to the frame being repeated.
    #[must_use]
    pub fn frame_id(&self, tick: u64, tile: usize, lookbehind: bool) -> Option<FrameId> {
        let slots = self.slots.get(tile)?;
        // len is nonzero and fits in usize, so the remainder does too.
        #[allow(clippy::cast_possible_truncation)]
        let index = (tick % self.len as u64) as usize;
        match slots[index] {
            Some(id) => Some(id),
            None if lookbehind => slots[..index].iter().rev().find_map(|slot| *slot),
            None => None,
        }
    }
    #[must_use]
    pub fn pixels_for(&self, frame: FrameId) -> Option<Arc<[u8]>> {
        self.pixels.get(&frame).cloned()
    }
    /// Bytes of a tile on the first tick.
    #[must_use]
    pub fn base_pixels(&self, tile: usize) -> Option<Arc<[u8]>> {
        self.base.get(tile).and_then(|id| self.pixels_for(*id))
    }
    /// Approximate heap size of the table.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        let pixels: usize = self.pixels.values().map(|p| p.len()).sum();
        let slots = self.len * self.slots.len() * std::mem::size_of::<Option<FrameId>>();
        pixels + slots
    }
}
impl std::fmt::Debug for AnimationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationTable")
            .field("len", &self.len)
            .field("tiles", &self.tiles())
            .field("distinct_frames", &self.distinct_frames())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tile(byte: u8) -> Arc<[u8]> {
        Arc::from(vec![byte; 16])
    }

    #[test]
    fn dedupes_consecutive() {
        let ids = IdAllocator::new();
        let (a, b) = (tile(1), tile(2));
        let frames = [&a, &a, &a, &b, &b, &a].map(|t| (vec![t.clone()], 1));
        let table = AnimationTable::encode(frames, 1, &ids).unwrap();

        assert_eq!(table.len(), 6);
        assert_eq!(table.distinct_frames(), 3);
        let raw: Vec<_> = (0..6).map(|tick| table.frame_id(tick, 0, false)).collect();
        assert!(raw[0].is_some() && raw[3].is_some() && raw[5].is_some());
        assert!(raw[1].is_none() && raw[2].is_none() && raw[4].is_none());
        // All distinct.
        assert_ne!(raw[0], raw[3]);
        assert_ne!(raw[0], raw[5]);
        assert_ne!(raw[3], raw[5]);

        assert_eq!(table.frame_id(2, 0, true), raw[0]);
        assert_eq!(table.frame_id(4, 0, true), raw[3]);
        // Wraps.
        assert_eq!(table.frame_id(6, 0, false), raw[0]);
        assert_eq!(table.frame_id(8, 0, true), raw[0]);
    }
    #[test]
    fn tiles_independent() {
        let ids = IdAllocator::new();
        // Tile 0 changes, tile 1 is static.
        let frames = vec![
            (vec![tile(1), tile(9)], 1),
            (vec![tile(2), tile(9)], 1),
            (vec![tile(3), tile(9)], 1),
        ];
        let table = AnimationTable::encode(frames, 2, &ids).unwrap();
        assert_eq!(table.distinct_frames(), 4);
        for tick in 1..3 {
            assert!(table.frame_id(tick, 0, false).is_some());
            assert!(table.frame_id(tick, 1, false).is_none());
            assert_eq!(table.frame_id(tick, 1, true), table.frame_id(0, 1, false));
        }
        assert_eq!(table.frame_id(0, 2, true), None);
    }
    #[test]
    fn long_frames_expand() {
        let ids = IdAllocator::new();
        let table =
            AnimationTable::encode(vec![(vec![tile(1)], 3), (vec![tile(2)], 2)], 1, &ids).unwrap();
        assert_eq!(table.len(), 5);
        let first = table.frame_id(0, 0, false).unwrap();
        let second = table.frame_id(3, 0, false).unwrap();
        assert_eq!(table.frame_id(2, 0, true), Some(first));
        assert_eq!(table.frame_id(4, 0, true), Some(second));
        assert_eq!(*table.pixels_for(second).unwrap(), *tile(2));
        assert_eq!(*table.base_pixels(0).unwrap(), *tile(1));
    }
    #[test]
    fn errors() {
        let ids = IdAllocator::new();
        assert_eq!(
            AnimationTable::encode(Vec::new(), 1, &ids).unwrap_err(),
            AnimationError::Empty
        );
        let mut encoder = AnimationEncoder::new(&ids, 2);
        assert_eq!(
            encoder.push_frame(vec![tile(0)], 1),
            Err(AnimationError::TileCount {
                expected: 2,
                got: 1
            })
        );
    }
    #[test]
    fn frame_ids_never_resource_ids() {
        let ids = IdAllocator::new();
        let table = AnimationTable::encode(vec![(vec![tile(1)], 1)], 1, &ids).unwrap();
        let id = table.frame_id(0, 0, false).unwrap();
        assert!(crate::id::ResourceId::new(id.get()).is_none());
    }
}
