//! Declarative action steps and the shop's fill sequence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{GameState, Point};

fn default_attempts() -> u32 {
    3
}

/// One step of a per-state action list, as written in a profile:
/// `{"type": "find_and_click", "template": "shop_sign", "max_attempts": 5}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionStep {
    Click { x: i32, y: i32 },
    Wait { ms: u64 },
    FindAndClick {
        template: String,
        #[serde(default = "default_attempts")]
        max_attempts: u32,
    },
    AdjustQuantity { target: u32 },
    /// Continue only once the classifier reports `state`.
    ExpectState {
        state: GameState,
        #[serde(default = "default_attempts")]
        max_attempts: u32,
    },
}

impl ActionStep {
    pub fn click(at: Point) -> Self {
        ActionStep::Click { x: at.x, y: at.y }
    }

    pub fn wait(ms: u64) -> Self {
        ActionStep::Wait { ms }
    }
}

impl fmt::Display for ActionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStep::Click { x, y } => write!(f, "click ({x}, {y})"),
            ActionStep::Wait { ms } => write!(f, "wait {ms}ms"),
            ActionStep::FindAndClick { template, max_attempts } => {
                write!(f, "find_and_click {template} (x{max_attempts})")
            }
            ActionStep::AdjustQuantity { target } => write!(f, "adjust_quantity {target}"),
            ActionStep::ExpectState { state, max_attempts } => write!(f, "expect_state {state} (x{max_attempts})"),
        }
    }
}

fn default_item_attempts() -> u32 {
    3
}

fn default_shop_settle() -> u64 {
    120
}

/// Fixed controls of the sell dialog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShopLayout {
    pub item_picker: Point,
    pub max_price: Point,
    pub confirm: Point,
    #[serde(default = "default_item_attempts")]
    pub item_attempts: u32,
    /// Pause after confirming a sale.
    #[serde(default = "default_shop_settle")]
    pub settle_ms: u64,
}

impl ShopLayout {
    /// Steps that put `quantity` of the item matched by `template` up for
    /// sale in the slot tapped at `slot`.
    pub fn fill_steps(&self, slot: Point, template: &str, quantity: u32) -> Vec<ActionStep> {
        vec![
            ActionStep::click(slot),
            ActionStep::wait(20),
            ActionStep::click(self.item_picker),
            ActionStep::wait(130),
            ActionStep::FindAndClick { template: template.to_string(), max_attempts: self.item_attempts },
            ActionStep::wait(100),
            ActionStep::AdjustQuantity { target: quantity },
            ActionStep::click(self.max_price),
            ActionStep::wait(50),
            ActionStep::click(self.confirm),
            ActionStep::wait(self.settle_ms),
        ]
    }
}
