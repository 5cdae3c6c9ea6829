use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Named optional component of a composite record.
///
/// Declaration order is the fan-out order: `Ord` follows it, and the
/// standard registry lists one table per slot in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentSlot {
    Vitals,
    Location,
    Stats,
    Equipment,
    Inventory,
    Prayers,
    Spells,
    World,
    Combat,
    Hitsplats,
    Animations,
    Interactions,
    #[serde(alias = "nearby-players")]
    NearbyPlayers,
    #[serde(alias = "nearby-npcs")]
    NearbyNpcs,
    Input,
    #[serde(alias = "click-context")]
    ClickContext,
    #[serde(alias = "key-presses")]
    KeyPresses,
    #[serde(alias = "mouse-buttons")]
    MouseButtons,
    #[serde(alias = "social")]
    Chat,
    Interface,
    #[serde(alias = "bank")]
    Banking,
    #[serde(alias = "system-metrics")]
    SystemMetrics,
    #[serde(alias = "ground-items")]
    GroundItems,
    #[serde(alias = "objects")]
    GameObjects,
    Projectiles,
}

impl ComponentSlot {
    /// Every slot, in fan-out order.
    pub const ALL: [ComponentSlot; 25] = [
        ComponentSlot::Vitals,
        ComponentSlot::Location,
        ComponentSlot::Stats,
        ComponentSlot::Equipment,
        ComponentSlot::Inventory,
        ComponentSlot::Prayers,
        ComponentSlot::Spells,
        ComponentSlot::World,
        ComponentSlot::Combat,
        ComponentSlot::Hitsplats,
        ComponentSlot::Animations,
        ComponentSlot::Interactions,
        ComponentSlot::NearbyPlayers,
        ComponentSlot::NearbyNpcs,
        ComponentSlot::Input,
        ComponentSlot::ClickContext,
        ComponentSlot::KeyPresses,
        ComponentSlot::MouseButtons,
        ComponentSlot::Chat,
        ComponentSlot::Interface,
        ComponentSlot::Banking,
        ComponentSlot::SystemMetrics,
        ComponentSlot::GroundItems,
        ComponentSlot::GameObjects,
        ComponentSlot::Projectiles,
    ];

    /// Wire name of the slot.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentSlot::Vitals => "vitals",
            ComponentSlot::Location => "location",
            ComponentSlot::Stats => "stats",
            ComponentSlot::Equipment => "equipment",
            ComponentSlot::Inventory => "inventory",
            ComponentSlot::Prayers => "prayers",
            ComponentSlot::Spells => "spells",
            ComponentSlot::World => "world",
            ComponentSlot::Combat => "combat",
            ComponentSlot::Hitsplats => "hitsplats",
            ComponentSlot::Animations => "animations",
            ComponentSlot::Interactions => "interactions",
            ComponentSlot::NearbyPlayers => "nearby_players",
            ComponentSlot::NearbyNpcs => "nearby_npcs",
            ComponentSlot::Input => "input",
            ComponentSlot::ClickContext => "click_context",
            ComponentSlot::KeyPresses => "key_presses",
            ComponentSlot::MouseButtons => "mouse_buttons",
            ComponentSlot::Chat => "chat",
            ComponentSlot::Interface => "interface",
            ComponentSlot::Banking => "banking",
            ComponentSlot::SystemMetrics => "system_metrics",
            ComponentSlot::GroundItems => "ground_items",
            ComponentSlot::GameObjects => "game_objects",
            ComponentSlot::Projectiles => "projectiles",
        }
    }
}

impl fmt::Display for ComponentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot name that matches no known component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown component slot '{0}'")]
pub struct UnknownSlot(pub String);

impl FromStr for ComponentSlot {
    type Err = UnknownSlot;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ComponentSlot::ALL
            .iter()
            .copied()
            .find(|slot| slot.as_str() == normalized)
            .ok_or_else(|| UnknownSlot(s.to_string()))
    }
}
