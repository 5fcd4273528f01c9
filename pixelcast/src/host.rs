//! Stand-ins for the network side of a deployment: every watching viewer sees every resource, and deliveries are
//! only logged.

use pixelcast_core::{
    id::FrameId,
    marker::Marker,
    resource::Resource,
    sink::{DeliveryError, DeliverySink, Presence, ViewerId},
    surface::SurfaceHandle,
};

#[derive(Default)]
pub struct Watchers {
    viewers: parking_lot::RwLock<hashbrown::HashSet<ViewerId>>,
}
impl Watchers {
    pub fn connect(&self, viewer: ViewerId) {
        self.viewers.write().insert(viewer);
    }
    pub fn disconnect(&self, viewer: ViewerId) -> bool {
        self.viewers.write().remove(&viewer)
    }
}
impl Presence for Watchers {
    fn viewers_of(&self, _: &Resource) -> Vec<ViewerId> {
        self.viewers.read().iter().copied().collect()
    }
    fn has_viewers(&self, _: &Resource) -> bool {
        !self.viewers.read().is_empty()
    }
}

/// Logs every delivery, and counts the bytes that would have gone out.
#[derive(Default)]
pub struct LogSink {
    sent_bytes: std::sync::atomic::AtomicU64,
}
impl LogSink {
    fn count(&self, pixels: &[u8]) -> String {
        let len = pixels.len() as u64;
        let total = self
            .sent_bytes
            .fetch_add(len, std::sync::atomic::Ordering::Relaxed)
            + len;
        // Precision loss is fine for display.
        #[allow(clippy::cast_precision_loss)]
        human_bytes::human_bytes(total as f64)
    }
    #[must_use]
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(std::sync::atomic::Ordering::Relaxed)
    }
}
impl DeliverySink for LogSink {
    fn repaint(
        &self,
        surface: SurfaceHandle,
        pixels: &[u8],
        cursors: &[Marker],
    ) -> Result<(), DeliveryError> {
        let total = self.count(pixels);
        log::debug!(
            "repaint {surface} with {} cursors ({total} total)",
            cursors.len()
        );
        Ok(())
    }
    fn reset_viewer(
        &self,
        viewer: ViewerId,
        surface: SurfaceHandle,
        pixels: &[u8],
        _: &[Marker],
    ) -> Result<(), DeliveryError> {
        let total = self.count(pixels);
        log::debug!("reset {surface} for {viewer} ({total} total)");
        Ok(())
    }
    fn push_frame(
        &self,
        viewer: ViewerId,
        frame: FrameId,
        tile: usize,
        pixels: &[u8],
    ) -> Result<(), DeliveryError> {
        let total = self.count(pixels);
        log::trace!("push {frame} (tile {tile}) to {viewer} ({total} total)");
        Ok(())
    }
    fn show_frame(
        &self,
        viewer: ViewerId,
        surface: SurfaceHandle,
        frame: FrameId,
    ) -> Result<(), DeliveryError> {
        log::trace!("show {frame} on {surface} for {viewer}");
        Ok(())
    }
}
