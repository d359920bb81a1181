//! World vocabulary - positions, partitions, objects, and snapshots

use serde::{Deserialize, Serialize};
use std::fmt;

/// Edge length of a partition in world units
pub const DEFAULT_PARTITION_SIZE: u32 = 16;

/// A point in world space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// East-west axis
    pub x: f64,
    /// Vertical axis
    pub y: f64,
    /// North-south axis
    pub z: f64,
}

impl Position {
    /// Create a new position
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another position
    pub fn distance_to(&self, other: &Position) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Squared Euclidean distance
    pub fn distance_squared(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1})", self.x, self.y, self.z)
    }
}

/// A fixed-size spatial cell of the world, addressed on the horizontal plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId {
    /// Cell index along x
    pub x: i32,
    /// Cell index along z
    pub z: i32,
}

impl PartitionId {
    /// Create a partition id from cell indices
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The partition containing `position` for the given cell size
    ///
    /// # Examples
    ///
    /// ```
    /// use sweeper_domain::{PartitionId, Position};
    ///
    /// let p = PartitionId::containing(&Position::new(-1.0, 64.0, 17.0), 16);
    /// assert_eq!(p, PartitionId::new(-1, 1));
    /// ```
    pub fn containing(position: &Position, partition_size: u32) -> Self {
        let size = f64::from(partition_size.max(1));
        Self {
            x: (position.x / size).floor() as i32,
            z: (position.z / size).floor() as i32,
        }
    }

    /// All partitions whose cells intersect the square `center ± radius`
    pub fn covering(center: &Position, radius: f64, partition_size: u32) -> Vec<PartitionId> {
        let radius = radius.max(0.0);
        let min = Self::containing(
            &Position::new(center.x - radius, center.y, center.z - radius),
            partition_size,
        );
        let max = Self::containing(
            &Position::new(center.x + radius, center.y, center.z + radius),
            partition_size,
        );

        let mut cells = Vec::new();
        for x in min.x..=max.x {
            for z in min.z..=max.z {
                cells.push(PartitionId::new(x, z));
            }
        }
        cells
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Identity of a world object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u128);

impl ObjectId {
    /// Generate a fresh object id
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().as_u128())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_u128(self.0))
    }
}

/// Broad category of a removable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Dropped item lying on the ground
    Item,
    /// Mobile actor (animals, creatures)
    Actor,
}

impl ObjectKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Item => "item",
            ObjectKind::Actor => "actor",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a live world object, as listed by the world adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object identity
    pub id: ObjectId,

    /// Broad category
    pub kind: ObjectKind,

    /// Concrete type key, e.g. `"stone"` or `"sheep"`
    pub type_key: String,

    /// Current position
    pub position: Position,

    /// Partition the object was listed from
    pub partition: PartitionId,

    /// Ticks the object has existed
    pub age_ticks: u64,

    /// Named, tamed, breeding or otherwise exempt from density culling
    #[serde(default)]
    pub protected: bool,
}

/// Which object kinds a listing should return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectQuery {
    /// Kinds to include; empty means nothing matches
    pub kinds: Vec<ObjectKind>,
}

impl ObjectQuery {
    /// Match every kind
    pub fn all() -> Self {
        Self {
            kinds: vec![ObjectKind::Item, ObjectKind::Actor],
        }
    }

    /// Match only the given kind
    pub fn only(kind: ObjectKind) -> Self {
        Self { kinds: vec![kind] }
    }

    /// Whether an object passes this query
    pub fn matches(&self, object: &ObjectRef) -> bool {
        self.kinds.contains(&object.kind)
    }

    /// True when no kind is selected
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for ObjectQuery {
    fn default() -> Self {
        Self::all()
    }
}

/// Serialized state of a removed object, sufficient to respawn it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// Broad category of the removed object
    pub object_kind: ObjectKind,

    /// Identity the object had when removed
    pub object_id: ObjectId,

    /// Position at removal time
    pub position: Position,

    /// World or dimension the object lived in
    pub domain_key: String,

    /// Opaque adapter-defined state
    pub serialized_state: Vec<u8>,
}
