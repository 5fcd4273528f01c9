//! Image resources for a tile-based display grid: decoding, dithering, animation encoding, persistence,
//! cache governance, and per-viewer frame distribution.

pub mod animation;
pub mod cache;
pub mod config;
pub mod creation;
pub mod dither;
pub mod distribution;
pub mod id;
pub mod lazy;
pub mod marker;
pub mod media;
pub mod painter;
pub mod permission;
pub mod pipeline;
pub mod registry;
pub mod resource;
pub mod schedule;
pub mod sink;
pub mod storage;
pub mod surface;
pub mod util;

pub use config::Config;
pub use id::{FrameId, ResourceId};
pub use pipeline::{Collaborators, CreateRequest, MediaKind, Pipeline};
