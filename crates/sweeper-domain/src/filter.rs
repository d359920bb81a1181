//! Per-kind eligibility filters
//!
//! Filters run before any strategy and encode the rules an operator never
//! wants broken: young items survive, keep-listed item types survive, and
//! protected actors are never culled.

use crate::{ObjectKind, ObjectRef};
use std::collections::HashSet;

/// Eligibility rules for dropped items
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Items younger than this are left alone
    pub min_age_ticks: u64,

    /// Item type keys that are never removed
    pub keep_types: HashSet<String>,
}

impl ItemFilter {
    /// Create an item filter
    pub fn new(min_age_ticks: u64, keep_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            min_age_ticks,
            keep_types: keep_types.into_iter().collect(),
        }
    }

    /// Whether a single object is an eligible item
    pub fn accepts(&self, object: &ObjectRef) -> bool {
        object.kind == ObjectKind::Item
            && object.age_ticks >= self.min_age_ticks
            && !self.keep_types.contains(&object.type_key)
    }

    /// Keep only eligible items
    pub fn select(&self, objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
        objects.into_iter().filter(|o| self.accepts(o)).collect()
    }
}

/// Culls actors from over-populated partitions
#[derive(Debug, Clone)]
pub struct ActorDensityFilter {
    /// Actors allowed per partition before culling starts
    pub threshold: usize,

    /// Never select protected actors
    pub protect_flagged: bool,
}

impl ActorDensityFilter {
    /// Create a density filter
    pub fn new(threshold: usize, protect_flagged: bool) -> Self {
        Self {
            threshold,
            protect_flagged,
        }
    }

    /// Select the excess actors of one partition, oldest first
    ///
    /// Protected actors still count toward the population but are never
    /// selected when `protect_flagged` is set.
    ///
    /// # Examples
    ///
    /// ```
    /// use sweeper_domain::ActorDensityFilter;
    ///
    /// let filter = ActorDensityFilter::new(10, true);
    /// assert!(filter.select(Vec::new()).is_empty());
    /// ```
    pub fn select(&self, objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
        let actors: Vec<ObjectRef> = objects
            .into_iter()
            .filter(|o| o.kind == ObjectKind::Actor)
            .collect();
        if actors.len() <= self.threshold {
            return Vec::new();
        }

        let excess = actors.len() - self.threshold;
        let mut eligible: Vec<ObjectRef> = actors
            .into_iter()
            .filter(|o| !(self.protect_flagged && o.protected))
            .collect();
        eligible.sort_by(|a, b| b.age_ticks.cmp(&a.age_ticks).then(a.id.cmp(&b.id)));
        eligible.truncate(excess);
        eligible
    }
}

impl Default for ActorDensityFilter {
    fn default() -> Self {
        Self::new(10, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectId, PartitionId, Position};

    fn make(kind: ObjectKind, type_key: &str, age: u64, protected: bool) -> ObjectRef {
        ObjectRef {
            id: ObjectId::new(),
            kind,
            type_key: type_key.to_string(),
            position: Position::default(),
            partition: PartitionId::new(0, 0),
            age_ticks: age,
            protected,
        }
    }

    #[test]
    fn test_item_filter_age_and_keep_list() {
        let filter = ItemFilter::new(100, vec!["diamond".to_string()]);
        let selected = filter.select(vec![
            make(ObjectKind::Item, "stone", 150, false),
            make(ObjectKind::Item, "stone", 50, false),
            make(ObjectKind::Item, "diamond", 500, false),
            make(ObjectKind::Actor, "sheep", 500, false),
        ]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].age_ticks, 150);
    }

    #[test]
    fn test_density_under_threshold_selects_nothing() {
        let filter = ActorDensityFilter::new(3, true);
        let actors = (0..3)
            .map(|i| make(ObjectKind::Actor, "cow", i, false))
            .collect();
        assert!(filter.select(actors).is_empty());
    }

    #[test]
    fn test_density_selects_oldest_excess() {
        let filter = ActorDensityFilter::new(2, true);
        let actors = vec![
            make(ObjectKind::Actor, "cow", 10, false),
            make(ObjectKind::Actor, "cow", 40, false),
            make(ObjectKind::Actor, "cow", 30, false),
            make(ObjectKind::Actor, "cow", 20, false),
        ];
        let ages: Vec<u64> = filter.select(actors).iter().map(|o| o.age_ticks).collect();
        assert_eq!(ages, vec![40, 30]);
    }

    #[test]
    fn test_density_never_selects_protected() {
        let filter = ActorDensityFilter::new(1, true);
        let actors = vec![
            make(ObjectKind::Actor, "horse", 90, true),
            make(ObjectKind::Actor, "horse", 80, true),
            make(ObjectKind::Actor, "cow", 5, false),
        ];
        let selected = filter.select(actors);
        assert_eq!(selected.len(), 1);
        assert!(!selected[0].protected);

        let unprotected = ActorDensityFilter::new(1, false);
        let actors = vec![
            make(ObjectKind::Actor, "horse", 90, true),
            make(ObjectKind::Actor, "cow", 5, false),
        ];
        assert!(unprotected.select(actors)[0].protected);
    }
}
