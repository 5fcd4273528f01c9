//! # Access control
//!
//! Permission levels form a small inheritance lattice:
//! `GET ⊂ {ADJUST_PLAYBACK, MARKER} ⊂ EDIT ⊂ EDIT_CLONE ⊂ ALL`.
//!
//! There's also the synthetic [`PermissionLevel::Base`] level (spelled `NONE` by users), which contains every other level.
//! It is never stored - assigning it to a viewer clears their entry, so they fall back to the owner/everyone rule.

use hashbrown::HashMap;

/// Key under which the permission granted to every viewer is stored.
pub const EVERYONE: uuid::Uuid = uuid::Uuid::nil();

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    strum::EnumIter,
    strum::EnumString,
    strum::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    Get,
    AdjustPlayback,
    Marker,
    Edit,
    EditClone,
    All,
    #[strum(to_string = "NONE", serialize = "BASE")]
    #[serde(skip)]
    Base,
}
impl PermissionLevel {
    /// The levels directly inherited by this one.
    #[must_use]
    pub fn inherits(self) -> &'static [PermissionLevel] {
        use PermissionLevel as P;
        match self {
            P::Get => &[],
            P::AdjustPlayback | P::Marker => &[P::Get],
            P::Edit => &[P::AdjustPlayback, P::Marker],
            P::EditClone => &[P::Edit],
            P::All => &[P::EditClone],
            P::Base => &[
                P::Get,
                P::AdjustPlayback,
                P::Marker,
                P::Edit,
                P::EditClone,
                P::All,
            ],
        }
    }
    /// Whether `other` is reachable from this level through the inheritance lattice.
    #[must_use]
    pub fn contains_permission(self, other: PermissionLevel) -> bool {
        self == other
            || self
                .inherits()
                .iter()
                .any(|inherited| inherited.contains_permission(other))
    }
}

/// Explicit permission grants of one resource. The owner isn't listed - they implicitly hold
/// [`PermissionLevel::All`], and that rule is never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessControl {
    entries: HashMap<uuid::Uuid, PermissionLevel>,
}
impl AccessControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Build from persisted entries. Stray `Base` entries are dropped.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = (uuid::Uuid, PermissionLevel)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .filter(|(_, level)| *level != PermissionLevel::Base)
                .collect(),
        }
    }
    /// Entries, sorted by key for stable output.
    #[must_use]
    pub fn entries(&self) -> std::collections::BTreeMap<uuid::Uuid, PermissionLevel> {
        self.entries.iter().map(|(k, v)| (*k, *v)).collect()
    }
    /// Set the level of `key` (a viewer, or [`EVERYONE`]). `Base` removes the entry.
    /// Returns the previous explicit level.
    pub fn set(&mut self, key: uuid::Uuid, level: PermissionLevel) -> Option<PermissionLevel> {
        if level == PermissionLevel::Base {
            self.entries.remove(&key)
        } else {
            self.entries.insert(key, level)
        }
    }
    /// The explicit entry for `key`, ignoring fallbacks.
    #[must_use]
    pub fn explicit(&self, key: uuid::Uuid) -> Option<PermissionLevel> {
        self.entries.get(&key).copied()
    }
    /// Effective level of `viewer`: the owner holds everything, then an explicit entry, then the everyone entry.
    #[must_use]
    pub fn level_of(&self, owner: uuid::Uuid, viewer: uuid::Uuid) -> Option<PermissionLevel> {
        if viewer == owner {
            return Some(PermissionLevel::All);
        }
        self.explicit(viewer).or_else(|| self.explicit(EVERYONE))
    }
    #[must_use]
    pub fn has_permission(
        &self,
        owner: uuid::Uuid,
        viewer: uuid::Uuid,
        permission: PermissionLevel,
    ) -> bool {
        self.level_of(owner, viewer)
            .is_some_and(|level| level.contains_permission(permission))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn lattice() {
        use PermissionLevel as P;
        assert!(P::All.contains_permission(P::Marker));
        assert!(P::Edit.contains_permission(P::Get));
        assert!(P::EditClone.contains_permission(P::AdjustPlayback));
        assert!(!P::Get.contains_permission(P::Edit));
        assert!(!P::Marker.contains_permission(P::AdjustPlayback));
        assert!(!P::All.contains_permission(P::Base));
    }
    #[test]
    fn base_contains_all() {
        for level in PermissionLevel::iter() {
            assert!(PermissionLevel::Base.contains_permission(level));
        }
    }
    #[test]
    fn owner_always_allowed() {
        let owner = uuid::Uuid::new_v4();
        let mut access = AccessControl::new();
        // Even an explicit (silly) entry for the owner doesn't restrict them.
        access.set(owner, PermissionLevel::Get);
        for level in PermissionLevel::iter().filter(|l| *l != PermissionLevel::Base) {
            assert!(access.has_permission(owner, owner, level));
        }
    }
    #[test]
    fn explicit_then_everyone() {
        let owner = uuid::Uuid::new_v4();
        let viewer = uuid::Uuid::new_v4();
        let mut access = AccessControl::new();
        assert!(!access.has_permission(owner, viewer, PermissionLevel::Get));

        access.set(EVERYONE, PermissionLevel::Get);
        assert!(access.has_permission(owner, viewer, PermissionLevel::Get));
        assert!(!access.has_permission(owner, viewer, PermissionLevel::Marker));

        access.set(viewer, PermissionLevel::Edit);
        assert!(access.has_permission(owner, viewer, PermissionLevel::Marker));

        // NONE clears the override, falling back to everyone.
        let previous = access.set(viewer, PermissionLevel::Base);
        assert_eq!(previous, Some(PermissionLevel::Edit));
        assert_eq!(access.level_of(owner, viewer), Some(PermissionLevel::Get));
    }
    #[test]
    fn parse_names() {
        assert_eq!(
            "edit_clone".parse::<PermissionLevel>(),
            Ok(PermissionLevel::EditClone)
        );
        assert_eq!("NONE".parse::<PermissionLevel>(), Ok(PermissionLevel::Base));
        assert_eq!(PermissionLevel::AdjustPlayback.to_string(), "ADJUST_PLAYBACK");
    }
    #[test]
    fn base_never_persisted() {
        let access =
            AccessControl::from_entries([(EVERYONE, PermissionLevel::Base), (EVERYONE, PermissionLevel::Get)]);
        assert_eq!(access.entries().len(), 1);
    }
}
