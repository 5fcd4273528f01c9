//! Named cursors drawn on top of a surface.

/// Kind of icon drawn for a marker. Interpreted by the delivery sink.
pub type MarkerKind = u8;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Marker {
    pub name: String,
    /// Position relative to the surface center, in half-pixels.
    pub x: i8,
    pub y: i8,
    /// Rotation in sixteenths of a full turn.
    pub direction: u8,
    pub kind: MarkerKind,
    pub caption: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkerError {
    #[error("direction {0} out of range 0..16")]
    BadDirection(u8),
    #[error("marker name is empty")]
    EmptyName,
    #[error("a marker named {0:?} already exists")]
    NameTaken(String),
    #[error("no marker named {0:?}")]
    Unknown(String),
    #[error("surface index {index} out of range for {count} surfaces")]
    SurfaceIndex { index: usize, count: usize },
}

impl Marker {
    pub fn validate(&self) -> Result<(), MarkerError> {
        if self.name.trim().is_empty() {
            return Err(MarkerError::EmptyName);
        }
        if self.direction >= 16 {
            return Err(MarkerError::BadDirection(self.direction));
        }
        Ok(())
    }
}

/// Per-surface marker lists. Names are unique across *all* surfaces of a resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkerSets {
    sets: Vec<Vec<Marker>>,
}
impl MarkerSets {
    /// Empty marker sets for `count` surfaces.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            sets: vec![Vec::new(); count],
        }
    }
    #[must_use]
    pub fn from_sets(sets: Vec<Vec<Marker>>) -> Self {
        Self { sets }
    }
    #[must_use]
    pub fn sets(&self) -> &[Vec<Marker>] {
        &self.sets
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
    /// Markers of one surface. Empty if out of range.
    #[must_use]
    pub fn on(&self, surface_index: usize) -> &[Marker] {
        self.sets.get(surface_index).map_or(&[], Vec::as_slice)
    }
    /// Find which surface holds the marker with the given name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(usize, &Marker)> {
        self.sets.iter().enumerate().find_map(|(index, set)| {
            set.iter()
                .find(|marker| crate::util::names_match(&marker.name, name))
                .map(|marker| (index, marker))
        })
    }
    pub fn add(&mut self, surface_index: usize, marker: Marker) -> Result<(), MarkerError> {
        marker.validate()?;
        if self.find(&marker.name).is_some() {
            return Err(MarkerError::NameTaken(marker.name));
        }
        let count = self.sets.len();
        let set = self
            .sets
            .get_mut(surface_index)
            .ok_or(MarkerError::SurfaceIndex {
                index: surface_index,
                count,
            })?;
        set.push(marker);
        Ok(())
    }
    /// Remove by name, returning the surface it was on and the marker.
    pub fn remove(&mut self, name: &str) -> Result<(usize, Marker), MarkerError> {
        let (index, _) = self
            .find(name)
            .ok_or_else(|| MarkerError::Unknown(name.to_owned()))?;
        let set = &mut self.sets[index];
        // Found above, position is present.
        let position = set
            .iter()
            .position(|marker| crate::util::names_match(&marker.name, name))
            .ok_or_else(|| MarkerError::Unknown(name.to_owned()))?;
        Ok((index, set.remove(position)))
    }
    pub fn clear(&mut self) {
        self.sets.iter_mut().for_each(Vec::clear);
    }
}
