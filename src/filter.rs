use crate::catalog::Item;
use crate::domain::{EventId, PhaseFilter};
use crate::error::StormsightError;
use crate::geometry::Region;

/// Search predicates; built per search, validated before evaluation.
#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    pub region: Option<Region>,
    pub event: Option<EventId>,
    pub phase: PhaseFilter,
}

impl FilterCriteria {
    pub fn validate(&self) -> Result<(), StormsightError> {
        if let Some(region) = &self.region {
            region.validate()?;
        }
        Ok(())
    }
}

/// Applies the criteria over an immutable item snapshot.
///
/// The spatial predicate is exact geometry intersection, not bbox overlap,
/// so thin diagonal footprints do not match queries near the corners of
/// their bounding boxes. Items without a footprint pass the spatial
/// predicate: a catalog gap must not hide a scene from the operator.
///
/// Output order is deterministic: timestamp ascending, item id as the
/// tie-break, so identical searches render identically.
pub fn apply(items: &[Item], criteria: &FilterCriteria) -> Result<Vec<Item>, StormsightError> {
    criteria.validate()?;
    let mut matched: Vec<Item> = items
        .iter()
        .filter(|item| matches(item, criteria))
        .cloned()
        .collect();
    order_items(&mut matched);
    Ok(matched)
}

fn matches(item: &Item, criteria: &FilterCriteria) -> bool {
    if let Some(event) = &criteria.event {
        if &item.collection != event {
            return false;
        }
    }
    if !criteria.phase.matches(item.phase) {
        return false;
    }
    if let Some(region) = &criteria.region {
        if let Some(footprint) = &item.footprint {
            if !footprint.intersects(region) {
                return false;
            }
        }
    }
    true
}

pub fn order_items(items: &mut [Item]) {
    items.sort_by(|a, b| {
        a.datetime
            .cmp(&b.datetime)
            .then_with(|| a.id.cmp(&b.id))
    });
}
