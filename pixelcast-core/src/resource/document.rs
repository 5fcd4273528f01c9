//! Persisted form of a resource.

use std::collections::BTreeMap;

use crate::{
    dither::DitherKind, id::ResourceId, marker::Marker, permission::PermissionLevel,
    surface::SurfaceHandle,
};

use super::Playback;

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceDocument {
    pub version: u32,
    pub id: ResourceId,
    pub name: String,
    pub owner: uuid::Uuid,
    pub creation_time: chrono::DateTime<chrono::Utc>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub ditherer: DitherKind,
    pub surfaces: Vec<SurfaceHandle>,
    /// Per surface. Missing or empty means no markers at all.
    #[serde(default)]
    pub markers: Vec<Vec<Marker>>,
    /// Explicit grants only, the owner is implied.
    #[serde(default)]
    pub access: BTreeMap<uuid::Uuid, PermissionLevel>,
    #[serde(default)]
    pub playback: Playback,
    pub media: MediaDocument,
}

/// Source filenames of each kind of media, relative to the resource's storage.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaDocument {
    Still {
        sources: Vec<String>,
    },
    Animated {
        source: String,
        ms_per_tick: u32,
    },
    Overlay {
        palettes: Vec<String>,
    },
    Baked {
        palettes: Vec<String>,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tolerant_of_missing_optional_fields() {
        let json = r#"{
            "version": 1,
            "id": 12,
            "name": "sunset",
            "owner": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "creation_time": "2024-03-01T12:00:00Z",
            "width": 1,
            "height": 1,
            "surfaces": [40],
            "media": {"type": "animated", "source": "abc.bin", "ms_per_tick": 50}
        }"#;
        let document: ResourceDocument = serde_json::from_str(json).unwrap();
        assert_eq!(document.id.get(), 12);
        assert_eq!(document.ditherer, DitherKind::NearestColor);
        assert!(document.markers.is_empty());
        assert!(document.access.is_empty());
        assert_eq!(document.playback, Playback::default());
        assert_eq!(
            document.media,
            MediaDocument::Animated {
                source: "abc.bin".to_owned(),
                ms_per_tick: 50
            }
        );
    }
    #[test]
    fn base_level_unrepresentable() {
        let json = r#"{"00000000-0000-0000-0000-000000000000": "BASE"}"#;
        assert!(serde_json::from_str::<BTreeMap<uuid::Uuid, PermissionLevel>>(json).is_err());
        let json = r#"{"00000000-0000-0000-0000-000000000000": "EDIT_CLONE"}"#;
        assert!(serde_json::from_str::<BTreeMap<uuid::Uuid, PermissionLevel>>(json).is_ok());
    }
}
