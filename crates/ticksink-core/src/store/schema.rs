//! Table layout shared by the backends.
//!
//! DDL is generated from the [`ComponentRegistry`] so the registry stays
//! the single description of every component table.

use super::registry::{ComponentRegistry, ComponentTable, RowShape};

/// Session table name.
pub const SESSIONS_TABLE: &str = "sessions";

/// Root table name.
pub const ROOT_TABLE: &str = "game_ticks";

/// Columns every component row carries ahead of its extracted columns.
pub const COMMON_COLUMNS: [&str; 4] = ["session_id", "tick_id", "tick_number", "captured_at"];

/// Every table the engine writes, in creation order.
pub fn required_tables(registry: &ComponentRegistry) -> Vec<&'static str> {
    let mut tables = vec![SESSIONS_TABLE, ROOT_TABLE];
    tables.extend(registry.table_names());
    tables
}

/// `CREATE TABLE IF NOT EXISTS` for the sessions table.
pub fn sessions_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {SESSIONS_TABLE} (
            session_id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_uuid TEXT NOT NULL UNIQUE,
            player_name TEXT,
            activity_type TEXT,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL CHECK (status IN ('ACTIVE', 'COMPLETED')),
            total_recorded INTEGER NOT NULL DEFAULT 0
        )"
    )
}

/// `CREATE TABLE IF NOT EXISTS` for the root table.
pub fn root_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {ROOT_TABLE} (
            tick_id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES {SESSIONS_TABLE}(session_id),
            tick_number INTEGER NOT NULL,
            captured_at TEXT NOT NULL,
            capture_duration_ns INTEGER NOT NULL,
            component_count INTEGER NOT NULL,
            processing_time_ms INTEGER NOT NULL,
            UNIQUE (session_id, tick_number)
        )"
    )
}

/// `CREATE TABLE IF NOT EXISTS` plus index for one component table.
pub fn component_ddl(table: &ComponentTable) -> Vec<String> {
    let mut columns = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "session_id INTEGER NOT NULL".to_string(),
        format!("tick_id INTEGER NOT NULL REFERENCES {ROOT_TABLE}(tick_id)"),
        "tick_number INTEGER NOT NULL".to_string(),
        "captured_at TEXT NOT NULL".to_string(),
    ];
    if table.shape == RowShape::PerElement {
        columns.push("element_index INTEGER NOT NULL".to_string());
    }
    for spec in &table.columns {
        columns.push(format!("{} {}", spec.name, spec.kind.sql_type()));
    }
    columns.push("payload TEXT NOT NULL".to_string());

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            table.table,
            columns.join(",\n    ")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_tick ON {0} (session_id, tick_number)",
            table.table
        ),
    ]
}

/// Parameterized insert for one component table, columns in row order.
pub fn component_insert_sql(table: &ComponentTable) -> String {
    let mut columns: Vec<&str> = COMMON_COLUMNS.to_vec();
    if table.shape == RowShape::PerElement {
        columns.push("element_index");
    }
    columns.extend(table.columns.iter().map(|c| c.name));
    columns.push("payload");

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Full schema in creation order.
pub fn ddl_statements(registry: &ComponentRegistry) -> Vec<String> {
    let mut statements = vec![sessions_ddl(), root_ddl()];
    for table in registry.tables() {
        statements.extend(component_ddl(table));
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ComponentSlot;

    #[test]
    fn test_required_tables_order() {
        let registry = ComponentRegistry::standard();
        let tables = required_tables(&registry);
        assert_eq!(tables[0], "sessions");
        assert_eq!(tables[1], "game_ticks");
        assert_eq!(tables[2], "player_vitals");
        assert_eq!(tables.len(), 2 + ComponentSlot::ALL.len());
    }

    #[test]
    fn test_component_insert_sql_per_element() {
        let registry = ComponentRegistry::standard();
        let table = registry.table_for(ComponentSlot::Chat).unwrap();
        let sql = component_insert_sql(table);
        assert!(sql.starts_with(
            "INSERT INTO chat_messages (session_id, tick_id, tick_number, captured_at, element_index, message_type"
        ));
        assert!(sql.ends_with("?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"));
    }

    #[test]
    fn test_ddl_applies_to_sqlite() {
        let registry = ComponentRegistry::standard();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        for statement in ddl_statements(&registry) {
            conn.execute_batch(&statement).unwrap();
        }
        // Idempotent
        for statement in ddl_statements(&registry) {
            conn.execute_batch(&statement).unwrap();
        }
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name != 'sqlite_sequence'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count as usize, required_tables(&registry).len());
    }
}
