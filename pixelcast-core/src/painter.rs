//! # Tombstone painting
//!
//! Surfaces of a deleted resource would otherwise keep showing its last content. Instead they are repainted with a
//! neutral gray pattern, seeded by the surface handle so a given surface always looks the same.

use std::sync::Arc;

use crate::{
    dither::Palette,
    registry::Registry,
    schedule::{Scheduler, TaskHandle},
    sink::DeliverySink,
    surface::{SurfaceHandle, SURFACE_BYTES, SURFACE_SIZE},
};

/// Surfaces repainted per tick at most.
const PAINT_BUDGET: usize = 64;
/// Side length of one block of the pattern, in pixels.
const BLOCK: u32 = 16;

/// Sending half of the painter's queue.
#[derive(Clone)]
pub struct PaintQueue {
    sender: crossbeam::channel::Sender<SurfaceHandle>,
}
impl PaintQueue {
    pub fn schedule(&self, surfaces: &[SurfaceHandle]) {
        for surface in surfaces {
            if self.sender.send(*surface).is_err() {
                log::debug!("Tombstone painter gone, {surface} stays as is");
                return;
            }
        }
    }
}

/// Create a paint queue and its receiving end.
#[must_use]
pub fn paint_channel() -> (PaintQueue, crossbeam::channel::Receiver<SurfaceHandle>) {
    let (sender, receiver) = crossbeam::channel::unbounded();
    (PaintQueue { sender }, receiver)
}

/// The placeholder a tombstoned surface shows.
#[must_use]
pub fn tombstone_pattern(surface: SurfaceHandle) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(u64::from(surface.0));
    let blocks = SURFACE_SIZE / BLOCK;
    let shades: Vec<u8> = (0..blocks * blocks)
        .map(|_| Palette::gray(rng.u8(1..=3)))
        .collect();
    let mut pixels = Vec::with_capacity(SURFACE_BYTES);
    for y in 0..SURFACE_SIZE {
        for x in 0..SURFACE_SIZE {
            pixels.push(shades[((y / BLOCK) * blocks + x / BLOCK) as usize]);
        }
    }
    pixels
}

pub struct TombstonePainter {
    receiver: crossbeam::channel::Receiver<SurfaceHandle>,
    sink: Arc<dyn DeliverySink>,
    registry: Arc<Registry>,
}
impl TombstonePainter {
    #[must_use]
    pub fn new(
        receiver: crossbeam::channel::Receiver<SurfaceHandle>,
        sink: Arc<dyn DeliverySink>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            receiver,
            sink,
            registry,
        }
    }
    /// Paint up to the per-tick budget of queued surfaces. Returns how many were painted.
    pub fn tick(&self) -> usize {
        let mut painted = 0;
        for surface in self.receiver.try_iter().take(PAINT_BUDGET) {
            // Claimed again since (by an overlay, say), the new owner draws it.
            if self.registry.lookup_by_surface(surface).is_some() {
                continue;
            }
            match self.sink.repaint(surface, &tombstone_pattern(surface), &[]) {
                Ok(()) => painted += 1,
                Err(e) => log::warn!("Failed to paint tombstone on {surface}: {e}"),
            }
        }
        painted
    }
    pub fn start(self, scheduler: &dyn Scheduler, period: std::time::Duration) -> TaskHandle {
        scheduler.every(
            period,
            Box::new(move || {
                self.tick();
            }),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pattern_deterministic() {
        let a = tombstone_pattern(SurfaceHandle(17));
        assert_eq!(a.len(), SURFACE_BYTES);
        assert_eq!(a, tombstone_pattern(SurfaceHandle(17)));
        assert_ne!(a, tombstone_pattern(SurfaceHandle(18)));
        let grays = [Palette::gray(1), Palette::gray(2), Palette::gray(3)];
        assert!(a.iter().all(|p| grays.contains(p)));
    }
    #[test]
    fn budgeted() {
        use crate::sink::test::{RecordingSink, Sent};
        let (queue, receiver) = paint_channel();
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(Registry::new(
            Arc::new(crate::storage::MemoryStorage::new()),
            Arc::new(crate::id::IdAllocator::new()),
            queue.clone(),
        ));
        let painter = TombstonePainter::new(receiver, sink.clone(), registry);
        let surfaces: Vec<_> = (0..100).map(SurfaceHandle).collect();
        queue.schedule(&surfaces);
        assert_eq!(painter.tick(), PAINT_BUDGET);
        assert_eq!(painter.tick(), 100 - PAINT_BUDGET);
        assert_eq!(painter.tick(), 0);
        assert_eq!(sink.take()[0], Sent::Repaint(SurfaceHandle(0)));
    }
}
