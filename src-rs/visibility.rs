use crate::overlay::OverlayItem;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayGroup {
    Legend,
    AxisDots,
    AxisBar,
    ProcessLines,
    ProcessBar,
    ProcessContours,
    RbcContours,
    NucContours,
    StatsBanner,
}

impl OverlayGroup {
    pub const ALL: [OverlayGroup; 9] = [
        OverlayGroup::Legend,
        OverlayGroup::AxisDots,
        OverlayGroup::AxisBar,
        OverlayGroup::ProcessLines,
        OverlayGroup::ProcessBar,
        OverlayGroup::ProcessContours,
        OverlayGroup::RbcContours,
        OverlayGroup::NucContours,
        OverlayGroup::StatsBanner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OverlayGroup::Legend => "legend",
            OverlayGroup::AxisDots => "axis-dots",
            OverlayGroup::AxisBar => "axis-bar",
            OverlayGroup::ProcessLines => "process-lines",
            OverlayGroup::ProcessBar => "process-bar",
            OverlayGroup::ProcessContours => "process-contours",
            OverlayGroup::RbcContours => "rbc-contours",
            OverlayGroup::NucContours => "nuc-contours",
            OverlayGroup::StatsBanner => "stats-banner",
        }
    }
}

impl fmt::Display for OverlayGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayGroup {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase().replace('_', "-");
        OverlayGroup::ALL
            .into_iter()
            .find(|g| g.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = OverlayGroup::ALL.iter().map(|g| g.as_str()).collect();
                format!("unknown overlay group `{raw}` (expected one of: {})", names.join(", "))
            })
    }
}

/// Show/hide state per group. Groups never mentioned are shown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Toggles(BTreeMap<OverlayGroup, bool>);

impl Toggles {
    pub fn is_visible(&self, group: OverlayGroup) -> bool {
        self.0.get(&group).copied().unwrap_or(true)
    }

    pub fn set(&mut self, group: OverlayGroup, visible: bool) {
        self.0.insert(group, visible);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(u64);

/// Registry of grouped overlay items plus the shared drawing surface they are shown on.
///
/// The surface holds item identities in paint order. A group's members are added or
/// removed together, so a group is always either fully on the surface or fully off it.
#[derive(Debug, Default)]
pub struct OverlayScene {
    next_id: u64,
    items: BTreeMap<ItemId, (OverlayGroup, OverlayItem)>,
    groups: BTreeMap<OverlayGroup, Vec<ItemId>>,
    surface: Vec<ItemId>,
}

impl OverlayScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every current member of `group` (from the surface too) and register `items`
    /// in its place. The new members go on the surface; call `apply_all` afterwards.
    pub fn replace_group(&mut self, group: OverlayGroup, items: Vec<OverlayItem>) -> Vec<ItemId> {
        self.clear_group(group);
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = ItemId(self.next_id);
            self.next_id += 1;
            self.items.insert(id, (group, item));
            self.surface.push(id);
            ids.push(id);
        }
        self.groups.insert(group, ids.clone());
        ids
    }

    pub fn clear_group(&mut self, group: OverlayGroup) {
        let Some(old) = self.groups.remove(&group) else {
            return;
        };
        let old: BTreeSet<ItemId> = old.into_iter().collect();
        self.surface.retain(|id| !old.contains(id));
        self.items.retain(|id, _| !old.contains(id));
    }

    pub fn set_group_visible(&mut self, group: OverlayGroup, visible: bool) {
        let members: Vec<ItemId> = self.groups.get(&group).cloned().unwrap_or_default();
        if members.is_empty() {
            return;
        }
        let member_set: BTreeSet<ItemId> = members.iter().copied().collect();
        self.surface.retain(|id| !member_set.contains(id));
        if !visible {
            return;
        }
        for id in members {
            if !self.surface.contains(&id) {
                self.surface.push(id);
            }
        }
    }

    pub fn apply_all(&mut self, toggles: &Toggles) {
        for group in OverlayGroup::ALL {
            self.set_group_visible(group, toggles.is_visible(group));
        }
    }

    pub fn members(&self, group: OverlayGroup) -> &[ItemId] {
        self.groups.get(&group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_on_surface(&self, id: ItemId) -> bool {
        self.surface.contains(&id)
    }

    pub fn surface_len(&self) -> usize {
        self.surface.len()
    }

    /// Groups with at least one member on the surface.
    pub fn visible_groups(&self) -> Vec<OverlayGroup> {
        OverlayGroup::ALL
            .into_iter()
            .filter(|g| self.members(*g).iter().any(|id| self.is_on_surface(*id)))
            .collect()
    }

    /// Surface contents in paint order.
    pub fn visible_items(&self) -> impl Iterator<Item = &OverlayItem> + '_ {
        self.surface
            .iter()
            .filter_map(|id| self.items.get(id).map(|(_, item)| item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{LayerScope, OverlayItem, Primitive, Shape};
    use image::Rgba;

    fn dot(x: f64) -> OverlayItem {
        OverlayItem {
            primitive: Primitive::Shape {
                shape: Shape::Disc {
                    cx: x,
                    cy: 1.0,
                    radius: 1.0,
                },
                fill: Rgba([1, 2, 3, 255]),
            },
            scope: LayerScope::OverlayOnly,
        }
    }

    fn scene_with_two_groups() -> OverlayScene {
        let mut scene = OverlayScene::new();
        // Identical values: identity, not equality, must decide membership.
        scene.replace_group(OverlayGroup::AxisDots, vec![dot(1.0), dot(1.0), dot(2.0)]);
        scene.replace_group(OverlayGroup::Legend, vec![dot(1.0)]);
        scene
    }

    #[test]
    fn showing_twice_keeps_one_copy() {
        let mut scene = scene_with_two_groups();
        scene.set_group_visible(OverlayGroup::AxisDots, true);
        scene.set_group_visible(OverlayGroup::AxisDots, true);
        assert_eq!(scene.surface_len(), 4);
        for id in scene.members(OverlayGroup::AxisDots) {
            assert_eq!(scene.surface.iter().filter(|s| *s == id).count(), 1);
        }
    }

    #[test]
    fn hiding_twice_leaves_none() {
        let mut scene = scene_with_two_groups();
        scene.set_group_visible(OverlayGroup::AxisDots, false);
        scene.set_group_visible(OverlayGroup::AxisDots, false);
        assert_eq!(scene.surface_len(), 1);
        assert!(scene
            .members(OverlayGroup::AxisDots)
            .iter()
            .all(|id| !scene.is_on_surface(*id)));
        assert!(scene.is_on_surface(scene.members(OverlayGroup::Legend)[0]));
    }

    #[test]
    fn apply_all_is_idempotent() {
        let mut scene = scene_with_two_groups();
        let mut toggles = Toggles::default();
        toggles.set(OverlayGroup::Legend, false);
        scene.apply_all(&toggles);
        let first: Vec<ItemId> = scene.surface.clone();
        scene.apply_all(&toggles);
        assert_eq!(scene.surface, first);
        assert_eq!(scene.visible_groups(), vec![OverlayGroup::AxisDots]);
    }

    #[test]
    fn replacing_a_group_removes_stale_members() {
        let mut scene = scene_with_two_groups();
        let old = scene.members(OverlayGroup::AxisDots).to_vec();
        scene.replace_group(OverlayGroup::AxisDots, vec![dot(5.0)]);
        assert!(old.iter().all(|id| !scene.is_on_surface(*id)));
        assert_eq!(scene.members(OverlayGroup::AxisDots).len(), 1);
        assert_eq!(scene.surface_len(), 2);
    }

    #[test]
    fn toggles_default_to_visible() {
        let mut toggles = Toggles::default();
        assert!(toggles.is_visible(OverlayGroup::StatsBanner));
        toggles.set(OverlayGroup::StatsBanner, false);
        assert!(!toggles.is_visible(OverlayGroup::StatsBanner));
    }

    #[test]
    fn parses_group_names() {
        assert_eq!("axis_dots".parse::<OverlayGroup>(), Ok(OverlayGroup::AxisDots));
        assert_eq!("Stats-Banner".parse::<OverlayGroup>(), Ok(OverlayGroup::StatsBanner));
        assert!("dots".parse::<OverlayGroup>().is_err());
    }
}
