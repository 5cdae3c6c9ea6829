//! Registry of component tables.
//!
//! Each [`ComponentSlot`] maps to one [`ComponentTable`]: a table name, a
//! row shape and the scalar columns lifted out of the JSON payload. The
//! fan-out loop only iterates this registry, so a new slot needs a new
//! entry here and nothing else in the engine.

use super::{ColumnValue, ComponentRow};
use crate::error::{StoreError, StoreResult};
use crate::queue::QueuedRecord;
use crate::record::{ComponentSlot, CorrelationKey};
use serde_json::Value;

/// Storage type of an extracted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    /// Stored as 0/1
    Bool,
}

impl ColumnKind {
    /// SQL column type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Integer | ColumnKind::Bool => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }
}

/// One scalar column extracted from a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name
    pub name: &'static str,
    /// Dotted path into the payload object
    pub key: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, key: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec { name, key, kind }
}

/// How a payload becomes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// One JSON object, one row
    Single,
    /// A JSON array of objects, one row per element
    PerElement,
}

/// Writer description for one component slot.
#[derive(Debug, Clone)]
pub struct ComponentTable {
    pub slot: ComponentSlot,
    pub table: &'static str,
    pub shape: RowShape,
    pub columns: Vec<ColumnSpec>,
}

impl ComponentTable {
    /// Rows for one record, or an empty vector when the slot is absent.
    pub fn build_rows(
        &self,
        record: &QueuedRecord,
        key: CorrelationKey,
    ) -> StoreResult<Vec<ComponentRow>> {
        let Some(payload) = record.record.component(self.slot) else {
            return Ok(Vec::new());
        };

        match self.shape {
            RowShape::Single => {
                let row = self.build_row(record, key, None, payload)?;
                Ok(vec![row])
            }
            RowShape::PerElement => {
                let elements = payload.as_array().ok_or_else(|| StoreError::MalformedPayload {
                    table: self.table.to_string(),
                    message: format!(
                        "expected a list for sequence {}",
                        record.sequence_number
                    ),
                })?;
                elements
                    .iter()
                    .enumerate()
                    .map(|(index, element)| {
                        let index = u32::try_from(index).map_err(|_| {
                            StoreError::MalformedPayload {
                                table: self.table.to_string(),
                                message: "too many elements".into(),
                            }
                        })?;
                        self.build_row(record, key, Some(index), element)
                    })
                    .collect()
            }
        }
    }

    fn build_row(
        &self,
        record: &QueuedRecord,
        key: CorrelationKey,
        element_index: Option<u32>,
        payload: &Value,
    ) -> StoreResult<ComponentRow> {
        if !payload.is_object() {
            return Err(StoreError::MalformedPayload {
                table: self.table.to_string(),
                message: format!(
                    "expected an object for sequence {}",
                    record.sequence_number
                ),
            });
        }

        let values = self
            .columns
            .iter()
            .map(|spec| extract(self.table, spec, payload))
            .collect::<StoreResult<Vec<_>>>()?;

        let payload = serde_json::to_string(payload).map_err(|e| StoreError::MalformedPayload {
            table: self.table.to_string(),
            message: e.to_string(),
        })?;

        Ok(ComponentRow {
            session_id: record.session_id,
            key,
            sequence_number: record.sequence_number,
            captured_at: record.record.captured_at(),
            element_index,
            values,
            payload,
        })
    }
}

fn lookup<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(payload, |value, part| value.get(part))
        .filter(|v| !v.is_null())
}

fn extract(table: &str, spec: &ColumnSpec, payload: &Value) -> StoreResult<ColumnValue> {
    let Some(value) = lookup(payload, spec.key) else {
        return Ok(ColumnValue::Null);
    };

    let converted = match spec.kind {
        ColumnKind::Integer => value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(ColumnValue::Integer),
        ColumnKind::Real => value.as_f64().map(ColumnValue::Real),
        ColumnKind::Text => match value {
            Value::String(s) => Some(ColumnValue::Text(s.clone())),
            Value::Number(n) => Some(ColumnValue::Text(n.to_string())),
            _ => None,
        },
        ColumnKind::Bool => value
            .as_bool()
            .map(|b| ColumnValue::Integer(i64::from(b))),
    };

    converted.ok_or_else(|| StoreError::MalformedPayload {
        table: table.to_string(),
        message: format!("column {} cannot hold {}", spec.name, value),
    })
}

/// Ordered set of component tables.
#[derive(Debug, Clone)]
pub struct ComponentRegistry {
    tables: Vec<ComponentTable>,
}

impl ComponentRegistry {
    /// Build a registry. Tables are kept in slot order, one per slot.
    pub fn new(mut tables: Vec<ComponentTable>) -> Self {
        tables.sort_by_key(|t| t.slot);
        tables.dedup_by_key(|t| t.slot);
        Self { tables }
    }

    /// Tables in fan-out order.
    pub fn tables(&self) -> &[ComponentTable] {
        &self.tables
    }

    /// Writer for a slot.
    #[cfg(test)]
    pub(crate) fn table_for(&self, slot: ComponentSlot) -> Option<&ComponentTable> {
        self.tables.iter().find(|t| t.slot == slot)
    }

    /// Component table names in fan-out order.
    pub(crate) fn table_names(&self) -> Vec<&'static str> {
        self.tables.iter().map(|t| t.table).collect()
    }

    /// The collector's table layout.
    pub fn standard() -> Self {
        use ColumnKind::{Bool, Integer, Real, Text};
        use ComponentSlot as S;
        use RowShape::{PerElement, Single};

        let table = |slot, table, shape, columns: &[ColumnSpec]| ComponentTable {
            slot,
            table,
            shape,
            columns: columns.to_vec(),
        };

        Self::new(vec![
            table(S::Vitals, "player_vitals", Single, &[
                col("current_hitpoints", "hp", Integer),
                col("max_hitpoints", "max_hp", Integer),
                col("current_prayer", "prayer", Integer),
                col("max_prayer", "max_prayer", Integer),
                col("run_energy", "run_energy", Integer),
                col("special_attack_percent", "special_attack", Integer),
                col("weight", "weight", Integer),
                col("poisoned", "poisoned", Bool),
            ]),
            table(S::Location, "player_location", Single, &[
                col("world_x", "world_x", Integer),
                col("world_y", "world_y", Integer),
                col("plane", "plane", Integer),
                col("region_id", "region_id", Integer),
                col("area_name", "area_name", Text),
                col("in_wilderness", "in_wilderness", Bool),
            ]),
            table(S::Stats, "player_stats", Single, &[
                col("combat_level", "combat_level", Integer),
                col("total_level", "total_level", Integer),
                col("total_experience", "total_experience", Integer),
            ]),
            table(S::Equipment, "player_equipment", Single, &[
                col("weapon_id", "weapon.id", Integer),
                col("weapon_type", "weapon.type", Text),
                col("helmet_id", "helmet_id", Integer),
                col("body_id", "body_id", Integer),
                col("legs_id", "legs_id", Integer),
                col("shield_id", "shield_id", Integer),
                col("total_value", "total_value", Integer),
            ]),
            table(S::Inventory, "player_inventory", Single, &[
                col("used_slots", "used_slots", Integer),
                col("free_slots", "free_slots", Integer),
                col("total_quantity", "total_quantity", Integer),
                col("total_value", "total_value", Integer),
            ]),
            table(S::Prayers, "player_prayers", Single, &[
                col("active_count", "active_count", Integer),
                col("quick_prayers_active", "quick_prayers_active", Bool),
                col("drain_rate", "drain_rate", Real),
            ]),
            table(S::Spells, "player_spells", Single, &[
                col("spellbook", "spellbook", Text),
                col("selected_spell", "selected_spell", Text),
                col("autocast_enabled", "autocast_enabled", Bool),
            ]),
            table(S::World, "world_environment", Single, &[
                col("world_id", "world_id", Integer),
                col("base_x", "base_x", Integer),
                col("base_y", "base_y", Integer),
                col("nearby_player_count", "nearby_player_count", Integer),
                col("nearby_npc_count", "nearby_npc_count", Integer),
                col("environment_type", "environment_type", Text),
            ]),
            table(S::Combat, "combat_data", Single, &[
                col("in_combat", "in_combat", Bool),
                col("target_name", "target.name", Text),
                col("target_type", "target.type", Text),
                col("target_combat_level", "target.combat_level", Integer),
                col("attack_style", "attack_style", Text),
                col("damage_dealt", "damage_dealt", Integer),
                col("damage_received", "damage_received", Integer),
            ]),
            table(S::Hitsplats, "hitsplats_data", PerElement, &[
                col("amount", "amount", Integer),
                col("hitsplat_type", "type", Text),
                col("is_mine", "is_mine", Bool),
            ]),
            table(S::Animations, "animations_data", Single, &[
                col("animation_id", "animation_id", Integer),
                col("pose_animation", "pose_animation", Integer),
                col("animation_type", "animation_type", Text),
            ]),
            table(S::Interactions, "interactions_data", Single, &[
                col("interacting_with", "interacting_with", Text),
                col("interaction_type", "interaction_type", Text),
                col("target_index", "target_index", Integer),
            ]),
            table(S::NearbyPlayers, "nearby_players_data", Single, &[
                col("player_count", "player_count", Integer),
                col("friend_count", "friend_count", Integer),
                col("clan_count", "clan_count", Integer),
                col("average_combat_level", "average_combat_level", Real),
            ]),
            table(S::NearbyNpcs, "nearby_npcs_data", Single, &[
                col("npc_count", "npc_count", Integer),
                col("aggressive_count", "aggressive_count", Integer),
                col("combat_npc_count", "combat_npc_count", Integer),
                col("most_common_npc", "most_common_npc", Text),
            ]),
            table(S::Input, "input_data", Single, &[
                col("mouse_x", "mouse_x", Integer),
                col("mouse_y", "mouse_y", Integer),
                col("mouse_idle_ms", "mouse_idle_ms", Integer),
                col("key_press_count", "key_press_count", Integer),
                col("camera_yaw", "camera_yaw", Integer),
                col("camera_pitch", "camera_pitch", Integer),
            ]),
            table(S::ClickContext, "click_context", Single, &[
                col("click_type", "click_type", Text),
                col("menu_action", "menu_action", Text),
                col("menu_option", "menu_option", Text),
                col("menu_target", "menu_target", Text),
                col("target_id", "target_id", Integer),
                col("screen_x", "screen_x", Integer),
                col("screen_y", "screen_y", Integer),
            ]),
            table(S::KeyPresses, "key_presses", PerElement, &[
                col("key_code", "key_code", Integer),
                col("key_name", "key_name", Text),
                col("duration_ms", "duration_ms", Integer),
                col("is_function_key", "is_function_key", Bool),
            ]),
            table(S::MouseButtons, "mouse_buttons", PerElement, &[
                col("button", "button", Text),
                col("press_duration_ms", "press_duration_ms", Integer),
                col("screen_x", "screen_x", Integer),
                col("screen_y", "screen_y", Integer),
            ]),
            table(S::Chat, "chat_messages", PerElement, &[
                col("message_type", "type", Text),
                col("sender", "sender", Text),
                col("message", "message", Text),
            ]),
            table(S::Interface, "interface_data", Single, &[
                col("open_interface_count", "open_interface_count", Integer),
                col("current_tab", "current_tab", Text),
                col("bank_open", "bank_open", Bool),
                col("shop_open", "shop_open", Bool),
            ]),
            table(S::Banking, "bank_data", Single, &[
                col("unique_items", "unique_items", Integer),
                col("used_slots", "used_slots", Integer),
                col("total_value", "total_value", Integer),
                col("current_tab", "current_tab", Integer),
            ]),
            table(S::SystemMetrics, "system_metrics", Single, &[
                col("used_memory_mb", "used_memory_mb", Integer),
                col("max_memory_mb", "max_memory_mb", Integer),
                col("cpu_usage_percent", "cpu_usage_percent", Real),
                col("client_fps", "client_fps", Integer),
                col("thread_count", "thread_count", Integer),
            ]),
            table(S::GroundItems, "ground_items_data", Single, &[
                col("total_items", "total_items", Integer),
                col("unique_item_types", "unique_item_types", Integer),
                col("total_value", "total_value", Integer),
                col("highest_value_item", "highest_value_item", Text),
            ]),
            table(S::GameObjects, "game_objects_data", Single, &[
                col("object_count", "object_count", Integer),
                col("unique_object_types", "unique_object_types", Integer),
                col("interactable_objects", "interactable_objects", Integer),
                col("closest_object_name", "closest_object_name", Text),
            ]),
            table(S::Projectiles, "projectiles_data", Single, &[
                col("active_projectiles", "active_projectiles", Integer),
                col("friendly_projectiles", "friendly_projectiles", Integer),
                col("hostile_projectiles", "hostile_projectiles", Integer),
                col("most_common_projectile_id", "most_common_projectile_id", Integer),
            ]),
        ])
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
