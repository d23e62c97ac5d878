//! Profile loading.
//!
//! A profile is one JSON file describing what the bot sees and does:
//! templates, state rules, per-state actions, slot geometry, the sell
//! dialog, the quantity counter and the kit. Everything is validated here,
//! before any thread starts; nothing downstream re-checks references.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::action::{ActionStep, ShopLayout};
use crate::classifier::StateRule;
use crate::error::ConfigError;
use crate::kit::{KitConfig, KitConfiguration, MAX_QUANTITY};
use crate::quantity::QuantityLayout;
use crate::scanner::{SlotLayout, SlotRegion};
use crate::template::{default_mask_path, MatchPolicy, SharedTemplate, TemplateDescriptor, TemplateImage};
use crate::types::{GameState, Point, Rect};

fn default_threshold() -> f32 {
    0.8
}

fn default_working_state() -> GameState {
    GameState::ShopInterior
}

fn default_interruption_state() -> GameState {
    GameState::TutorialOverlay
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub mask: Option<PathBuf>,
    /// Look for `<stem>mask.<ext>` next to the image.
    #[serde(default)]
    pub use_mask: bool,
    #[serde(default)]
    pub roi: Rect,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub policy: MatchPolicy,
}

impl TemplateSpec {
    /// Load the image (and mask) with relative paths taken from `base`.
    pub fn load_image(&self, base: &Path) -> Result<TemplateImage, ConfigError> {
        let path = base.join(&self.path);
        let mask = match (&self.mask, self.use_mask) {
            (Some(mask), _) => Some(base.join(mask)),
            (None, true) => Some(default_mask_path(&path)),
            (None, false) => None,
        };
        TemplateImage::load(&self.id, &path, mask.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateSpec {
    pub state: GameState,
    #[serde(default)]
    pub display_name: Option<String>,
    pub templates: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotsSpec {
    pub sold_template: String,
    pub empty_template: String,
    pub regions: Vec<SlotRegion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuantitySpec {
    pub roi: Rect,
    pub increase: Point,
    pub decrease: Point,
    pub digits: Vec<String>,
}

/// The profile as written on disk, before references are resolved.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileFile {
    pub templates: Vec<TemplateSpec>,
    pub states: Vec<StateSpec>,
    #[serde(default = "default_working_state")]
    pub working_state: GameState,
    #[serde(default = "default_interruption_state")]
    pub interruption_state: GameState,
    #[serde(default)]
    pub actions: HashMap<String, Vec<ActionStep>>,
    pub slots: SlotsSpec,
    pub shop: ShopLayout,
    pub quantity: QuantitySpec,
    pub kit: KitConfig,
}

/// Validated profile. Read-only for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct Profile {
    pub templates: HashMap<String, SharedTemplate>,
    /// In priority order: the first rule that matches wins.
    pub rules: Vec<StateRule>,
    pub working_state: GameState,
    pub interruption_state: GameState,
    pub actions: HashMap<GameState, Vec<ActionStep>>,
    pub slots: Arc<SlotLayout>,
    pub shop: ShopLayout,
    pub quantity: Arc<QuantityLayout>,
    pub kit: KitConfiguration,
}

impl Profile {
    /// Read, parse and validate a profile. Template paths are relative to
    /// the profile's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let file: ProfileFile =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let profile = file.resolve(|spec| spec.load_image(&base))?;
        tracing::info!(
            target: "runtime",
            path = %path.display(),
            templates = profile.templates.len(),
            states = profile.rules.len(),
            slots = profile.slots.len(),
            kit = %profile.kit.name,
            "profile loaded"
        );
        Ok(profile)
    }

    pub fn actions_for(&self, state: &GameState) -> &[ActionStep] {
        self.actions.get(state).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn template(&self, id: &str) -> Result<&SharedTemplate, ConfigError> {
        self.templates.get(id).ok_or_else(|| ConfigError::UnknownTemplate(id.to_string()))
    }
}

impl ProfileFile {
    /// Validate and resolve every reference. `load` supplies the pixels for
    /// each template entry (from disk, or from memory in tests).
    pub fn resolve<F>(self, mut load: F) -> Result<Profile, ConfigError>
    where
        F: FnMut(&TemplateSpec) -> Result<TemplateImage, ConfigError>,
    {
        let mut templates = HashMap::with_capacity(self.templates.len());
        for spec in &self.templates {
            if !(spec.threshold > 0.0 && spec.threshold <= 1.0) {
                return Err(ConfigError::invalid(format!(
                    "template '{}': threshold {} outside (0, 1]",
                    spec.id, spec.threshold
                )));
            }
            check_roi(&format!("template '{}'", spec.id), spec.roi)?;
            let descriptor = TemplateDescriptor {
                id: spec.id.clone(),
                image: load(spec)?,
                roi: spec.roi,
                threshold: spec.threshold,
                policy: spec.policy,
            };
            if templates.insert(spec.id.clone(), Arc::new(descriptor)).is_some() {
                return Err(ConfigError::invalid(format!("duplicate template id '{}'", spec.id)));
            }
        }
        let lookup = |id: &str| templates.get(id).cloned().ok_or_else(|| ConfigError::UnknownTemplate(id.to_string()));

        let mut declared = HashSet::new();
        let mut rules = Vec::with_capacity(self.states.len());
        for spec in &self.states {
            if spec.state.is_unknown() {
                return Err(ConfigError::invalid("'unknown' is the fallback state and cannot have a rule"));
            }
            if !declared.insert(spec.state.clone()) {
                return Err(ConfigError::invalid(format!("state '{}' declared twice", spec.state)));
            }
            if spec.templates.is_empty() {
                return Err(ConfigError::invalid(format!("state '{}' has no templates", spec.state)));
            }
            let resolved = spec.templates.iter().map(|id| lookup(id)).collect::<Result<Vec<_>, _>>()?;
            let mut rule = StateRule::new(spec.state.clone(), resolved);
            if let Some(name) = &spec.display_name {
                rule = rule.with_display_name(name.clone());
            }
            rules.push(rule);
        }
        let known = |state: &GameState| -> Result<(), ConfigError> {
            if state.is_unknown() || declared.contains(state) {
                Ok(())
            } else {
                Err(ConfigError::UnknownState(state.id().to_string()))
            }
        };
        known(&self.working_state)?;
        known(&self.interruption_state)?;

        let mut actions = HashMap::with_capacity(self.actions.len());
        for (key, steps) in self.actions {
            let state: GameState = key.parse().map_err(ConfigError::Invalid)?;
            known(&state)?;
            for step in &steps {
                match step {
                    ActionStep::FindAndClick { template, max_attempts } => {
                        lookup(template)?;
                        check_attempts(&state, *max_attempts)?;
                    }
                    ActionStep::ExpectState { state: expected, max_attempts } => {
                        known(expected)?;
                        check_attempts(&state, *max_attempts)?;
                    }
                    ActionStep::AdjustQuantity { target } if !(1..=MAX_QUANTITY).contains(target) => {
                        return Err(ConfigError::invalid(format!("{}: quantity target {} outside 1..={}", state, target, MAX_QUANTITY)));
                    }
                    _ => {}
                }
            }
            actions.insert(state, steps);
        }

        if self.slots.regions.is_empty() {
            return Err(ConfigError::invalid("slot layout has no regions"));
        }
        for (i, region) in self.slots.regions.iter().enumerate() {
            check_roi(&format!("slot {}", i + 1), region.roi)?;
        }
        let slots = Arc::new(SlotLayout {
            sold: lookup(&self.slots.sold_template)?,
            empty: lookup(&self.slots.empty_template)?,
            regions: self.slots.regions,
        });

        check_roi("quantity", self.quantity.roi)?;
        if self.quantity.digits.len() != MAX_QUANTITY as usize {
            return Err(ConfigError::invalid(format!(
                "quantity needs {} digit templates, got {}",
                MAX_QUANTITY,
                self.quantity.digits.len()
            )));
        }
        let quantity = Arc::new(QuantityLayout {
            roi: self.quantity.roi,
            increase: self.quantity.increase,
            decrease: self.quantity.decrease,
            digits: self.quantity.digits.iter().map(|id| lookup(id)).collect::<Result<_, _>>()?,
        });

        if self.shop.item_attempts == 0 {
            return Err(ConfigError::invalid("shop.item_attempts must be at least 1"));
        }
        let kit = KitConfiguration::resolve(&self.kit, &templates, slots.len())?;

        Ok(Profile {
            templates,
            rules,
            working_state: self.working_state,
            interruption_state: self.interruption_state,
            actions,
            slots,
            shop: self.shop,
            quantity,
            kit,
        })
    }
}

fn check_roi(owner: &str, roi: Rect) -> Result<(), ConfigError> {
    if !roi.is_addressable() {
        return Err(ConfigError::invalid(format!("{}: roi {:?} reaches past the pixel range", owner, roi)));
    }
    Ok(())
}

fn check_attempts(state: &GameState, attempts: u32) -> Result<(), ConfigError> {
    if attempts == 0 {
        return Err(ConfigError::invalid(format!("{}: max_attempts must be at least 1", state)));
    }
    Ok(())
}
