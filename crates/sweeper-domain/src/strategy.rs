//! Cleaning strategies - pluggable rules narrowing a candidate set
//!
//! A strategy never mutates anything. It receives the objects that passed the
//! per-kind filters and returns the subset that should actually be removed.

use crate::{ObjectRef, Position};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Selection rule applied after filtering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CleaningStrategy {
    /// Remove objects at least `min_age_ticks` old
    TimeBased {
        /// Minimum age in ticks
        min_age_ticks: u64,
    },

    /// Remove objects further than `max_distance` from `origin`
    DistanceBased {
        /// Reference point, usually a player or spawn
        origin: Position,
        /// Objects within this distance are kept
        max_distance: f64,
    },

    /// Remove the oldest objects of any grid cell holding more than `threshold`
    DensityBased {
        /// Edge length of a density cell
        cell_size: f64,
        /// Objects allowed per cell
        threshold: usize,
    },
}

impl CleaningStrategy {
    /// Short identifier used in logs and statistics
    pub fn name(&self) -> &'static str {
        match self {
            CleaningStrategy::TimeBased { .. } => "time_based",
            CleaningStrategy::DistanceBased { .. } => "distance_based",
            CleaningStrategy::DensityBased { .. } => "density_based",
        }
    }

    /// Human readable description
    pub fn description(&self) -> String {
        match self {
            CleaningStrategy::TimeBased { min_age_ticks } => {
                format!("Remove objects older than {} ticks", min_age_ticks)
            }
            CleaningStrategy::DistanceBased {
                origin,
                max_distance,
            } => format!(
                "Remove objects further than {:.1} from {}",
                max_distance, origin
            ),
            CleaningStrategy::DensityBased {
                cell_size,
                threshold,
            } => format!(
                "Keep at most {} objects per {:.1}-wide cell",
                threshold, cell_size
            ),
        }
    }

    /// Narrow `candidates` to the objects this strategy selects for removal
    ///
    /// # Examples
    ///
    /// ```
    /// use sweeper_domain::CleaningStrategy;
    ///
    /// let strategy = CleaningStrategy::TimeBased { min_age_ticks: 100 };
    /// assert!(strategy.apply(Vec::new()).is_empty());
    /// ```
    pub fn apply(&self, candidates: Vec<ObjectRef>) -> Vec<ObjectRef> {
        match self {
            CleaningStrategy::TimeBased { min_age_ticks } => candidates
                .into_iter()
                .filter(|o| o.age_ticks >= *min_age_ticks)
                .collect(),
            CleaningStrategy::DistanceBased {
                origin,
                max_distance,
            } => {
                let limit = max_distance * max_distance;
                candidates
                    .into_iter()
                    .filter(|o| o.position.distance_squared(origin) > limit)
                    .collect()
            }
            CleaningStrategy::DensityBased {
                cell_size,
                threshold,
            } => select_dense(candidates, *cell_size, *threshold),
        }
    }
}

fn select_dense(candidates: Vec<ObjectRef>, cell_size: f64, threshold: usize) -> Vec<ObjectRef> {
    let size = if cell_size > 0.0 { cell_size } else { 1.0 };
    let mut cells: BTreeMap<(i64, i64), Vec<ObjectRef>> = BTreeMap::new();
    for object in candidates {
        let key = (
            (object.position.x / size).floor() as i64,
            (object.position.z / size).floor() as i64,
        );
        cells.entry(key).or_default().push(object);
    }

    let mut selected = Vec::new();
    for (_, mut members) in cells {
        if members.len() <= threshold {
            continue;
        }
        let excess = members.len() - threshold;
        // Oldest first; id breaks ties so the choice is reproducible
        members.sort_by(|a, b| b.age_ticks.cmp(&a.age_ticks).then(a.id.cmp(&b.id)));
        selected.extend(members.into_iter().take(excess));
    }
    selected
}
