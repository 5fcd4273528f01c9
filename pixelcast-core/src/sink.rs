//! Interfaces to the outside world: who is looking at what, and how pixels reach them.

use crate::{id::FrameId, marker::Marker, resource::Resource, surface::SurfaceHandle};

pub type ViewerId = uuid::Uuid;
pub type OwnerId = uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("viewer {0} is gone")]
    Disconnected(ViewerId),
    #[error("outbound channel failed: {0}")]
    Channel(String),
}

/// Which viewers can currently see a resource.
pub trait Presence: Send + Sync {
    fn viewers_of(&self, resource: &Resource) -> Vec<ViewerId>;
    fn has_viewers(&self, resource: &Resource) -> bool {
        !self.viewers_of(resource).is_empty()
    }
    /// Whether `viewer` is previewing a live edit of `resource`.
    fn is_editing(&self, _viewer: ViewerId, _resource: &Resource) -> bool {
        false
    }
}

/// Where pixels are sent.
pub trait DeliverySink: Send + Sync {
    /// Redraw a surface for everyone.
    fn repaint(
        &self,
        surface: SurfaceHandle,
        pixels: &[u8],
        cursors: &[Marker],
    ) -> Result<(), DeliveryError>;
    /// Redraw a surface for one viewer only.
    fn reset_viewer(
        &self,
        viewer: ViewerId,
        surface: SurfaceHandle,
        pixels: &[u8],
        cursors: &[Marker],
    ) -> Result<(), DeliveryError>;
    /// Upload an animation frame to a viewer, to be displayed later by [`Self::show_frame`].
    fn push_frame(
        &self,
        viewer: ViewerId,
        frame: FrameId,
        tile: usize,
        pixels: &[u8],
    ) -> Result<(), DeliveryError>;
    /// Display an already uploaded frame on a surface.
    fn show_frame(
        &self,
        viewer: ViewerId,
        surface: SurfaceHandle,
        frame: FrameId,
    ) -> Result<(), DeliveryError>;
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum Sent {
        Repaint(SurfaceHandle),
        Reset(ViewerId, SurfaceHandle),
        Push(ViewerId, FrameId, usize),
        Show(ViewerId, SurfaceHandle, FrameId),
    }

    /// Records everything, optionally failing pushes.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: parking_lot::Mutex<Vec<Sent>>,
        pub fail_pushes: std::sync::atomic::AtomicBool,
    }
    impl RecordingSink {
        pub fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock())
        }
        pub fn pushes(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|sent| matches!(sent, Sent::Push(..)))
                .count()
        }
    }
    impl DeliverySink for RecordingSink {
        fn repaint(&self, surface: SurfaceHandle, _: &[u8], _: &[Marker]) -> Result<(), DeliveryError> {
            self.sent.lock().push(Sent::Repaint(surface));
            Ok(())
        }
        fn reset_viewer(
            &self,
            viewer: ViewerId,
            surface: SurfaceHandle,
            _: &[u8],
            _: &[Marker],
        ) -> Result<(), DeliveryError> {
            self.sent.lock().push(Sent::Reset(viewer, surface));
            Ok(())
        }
        fn push_frame(
            &self,
            viewer: ViewerId,
            frame: FrameId,
            tile: usize,
            _: &[u8],
        ) -> Result<(), DeliveryError> {
            if self.fail_pushes.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(DeliveryError::Channel("test".to_owned()));
            }
            self.sent.lock().push(Sent::Push(viewer, frame, tile));
            Ok(())
        }
        fn show_frame(
            &self,
            viewer: ViewerId,
            surface: SurfaceHandle,
            frame: FrameId,
        ) -> Result<(), DeliveryError> {
            self.sent.lock().push(Sent::Show(viewer, surface, frame));
            Ok(())
        }
    }

    /// The same set of viewers sees every resource.
    #[derive(Default)]
    pub(crate) struct TestPresence {
        pub viewers: parking_lot::Mutex<Vec<ViewerId>>,
        pub editing: parking_lot::Mutex<Vec<ViewerId>>,
    }
    impl TestPresence {
        pub fn set(&self, viewers: &[ViewerId]) {
            *self.viewers.lock() = viewers.to_vec();
        }
    }
    impl Presence for TestPresence {
        fn viewers_of(&self, _: &Resource) -> Vec<ViewerId> {
            self.viewers.lock().clone()
        }
        fn is_editing(&self, viewer: ViewerId, _: &Resource) -> bool {
            self.editing.lock().contains(&viewer)
        }
    }
}
