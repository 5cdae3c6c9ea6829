//! CLI subcommand implementations.

pub mod ingest;
pub mod schema;
pub mod sessions;
pub mod status;
