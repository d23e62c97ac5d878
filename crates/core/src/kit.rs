//! Kit configuration and the slot planner.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::template::SharedTemplate;
use crate::types::ScanReport;

/// Highest quantity the shop's counter can show.
pub const MAX_QUANTITY: u32 = 10;

/// Default slots of an item: explicit indices or a count allocated right
/// after the previous item's slots.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SlotAllocation {
    Explicit(Vec<usize>),
    Count(usize),
}

#[derive(Debug, Clone, Deserialize)]
pub struct KitItemConfig {
    pub name: String,
    pub template: String,
    pub quantity: u32,
    #[serde(default)]
    pub first_slot_quantity: Option<u32>,
    pub slots: SlotAllocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KitConfig {
    pub name: String,
    pub items: Vec<KitItemConfig>,
}

#[derive(Debug, Clone)]
pub struct KitItem {
    pub name: String,
    pub template: SharedTemplate,
    pub quantity: u32,
    pub first_slot_quantity: u32,
    /// 1-based, ascending.
    pub slots: Vec<usize>,
}

/// Validated kit. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct KitConfiguration {
    pub name: String,
    pub items: Vec<KitItem>,
}

/// One planned fill: put `quantity` of `item` into `slot`.
#[derive(Debug, Clone)]
pub struct SlotAssignment {
    pub slot: usize,
    pub item: String,
    pub template: SharedTemplate,
    pub quantity: u32,
}

impl KitConfiguration {
    /// Resolve template ids and slot allocations against a layout of
    /// `slot_count` slots.
    pub fn resolve(
        config: &KitConfig,
        templates: &HashMap<String, SharedTemplate>,
        slot_count: usize,
    ) -> Result<Self, ConfigError> {
        if config.items.is_empty() {
            return Err(ConfigError::invalid(format!("kit '{}' has no items", config.name)));
        }
        let mut taken = HashSet::new();
        let mut next = 1;
        let mut items = Vec::with_capacity(config.items.len());
        for item in &config.items {
            let template = templates
                .get(&item.template)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownTemplate(item.template.clone()))?;
            let first_slot_quantity = item.first_slot_quantity.unwrap_or(item.quantity);
            for q in [item.quantity, first_slot_quantity] {
                if !(1..=MAX_QUANTITY).contains(&q) {
                    return Err(ConfigError::invalid(format!(
                        "item '{}': quantity {} outside 1..={}",
                        item.name, q, MAX_QUANTITY
                    )));
                }
            }
            let mut slots: Vec<usize> = match &item.slots {
                SlotAllocation::Explicit(list) => list.clone(),
                SlotAllocation::Count(n) => (next..next + n).collect(),
            };
            slots.sort_unstable();
            slots.dedup();
            if slots.is_empty() {
                return Err(ConfigError::invalid(format!("item '{}' has no slots", item.name)));
            }
            for &slot in &slots {
                if slot == 0 || slot > slot_count {
                    return Err(ConfigError::invalid(format!(
                        "item '{}': slot {} outside 1..={}",
                        item.name, slot, slot_count
                    )));
                }
                if !taken.insert(slot) {
                    return Err(ConfigError::invalid(format!("slot {} assigned to more than one item", slot)));
                }
            }
            next = next.max(slots[slots.len() - 1] + 1);
            items.push(KitItem {
                name: item.name.clone(),
                template,
                quantity: item.quantity,
                first_slot_quantity,
                slots,
            });
        }
        Ok(Self { name: config.name.clone(), items })
    }

    /// The lowest slot index across every item's default slots.
    pub fn first_slot(&self) -> Option<usize> {
        self.items.iter().filter_map(|i| i.slots.first().copied()).min()
    }

    pub fn default_slots(&self) -> BTreeSet<usize> {
        self.items.iter().flat_map(|i| i.slots.iter().copied()).collect()
    }

    /// Total units per item when every default slot gets filled.
    pub fn planned_units(&self) -> Vec<(String, u32)> {
        let first = self.first_slot();
        self.items
            .iter()
            .map(|item| {
                let units: u32 = item
                    .slots
                    .iter()
                    .map(|&s| if Some(s) == first { item.first_slot_quantity } else { item.quantity })
                    .sum();
                (item.name.clone(), units)
            })
            .collect()
    }

    /// Assign kit items to the slots `report` found empty. Items keep their
    /// order; within an item slots go ascending. Empty slots outside the
    /// kit's default set are left alone.
    pub fn plan(&self, report: &ScanReport) -> Vec<SlotAssignment> {
        let empty: HashSet<usize> = report.empty.iter().copied().collect();
        let first = self.first_slot();
        let mut plan = Vec::new();
        for item in &self.items {
            for &slot in item.slots.iter().filter(|s| empty.contains(s)) {
                let quantity = if Some(slot) == first { item.first_slot_quantity } else { item.quantity };
                plan.push(SlotAssignment {
                    slot,
                    item: item.name.clone(),
                    template: item.template.clone(),
                    quantity,
                });
            }
        }
        let defaults = self.default_slots();
        let ignored: Vec<usize> = report.empty.iter().copied().filter(|s| !defaults.contains(s)).collect();
        if !ignored.is_empty() {
            tracing::debug!(target: "orchestrator", kit = %self.name, ?ignored, "empty slots outside the kit");
        }
        plan
    }
}
