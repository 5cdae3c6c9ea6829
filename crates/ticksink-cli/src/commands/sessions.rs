//! Session listing command.

use anyhow::{Context, Result};
use ticksink_core::store::{open_factory, StoredSession};
use ticksink_core::Config;

/// Print the most recent sessions, newest first.
pub async fn list(config: Config, limit: usize) -> Result<()> {
    let factory = open_factory(&config.store);
    let sessions = tokio::task::spawn_blocking(move || -> ticksink_core::Result<_> {
        let mut conn = factory.connect()?;
        Ok(conn.recent_sessions(limit)?)
    })
    .await
    .context("session query task failed")??;

    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<9}  {:>8}  {:<20}  {:<20}  {:<16}  {}",
        "ID", "STATUS", "RECORDED", "STARTED", "ENDED", "PLAYER", "ACTIVITY"
    );
    for session in &sessions {
        println!("{}", format_row(session));
    }
    Ok(())
}

fn format_row(session: &StoredSession) -> String {
    let ended = session
        .ended_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>6}  {:<9}  {:>8}  {:<20}  {:<20}  {:<16}  {}",
        session.id,
        session.status.as_str(),
        session.total_recorded,
        session.started_at.format("%Y-%m-%d %H:%M:%S"),
        ended,
        session.player_name.as_deref().unwrap_or("-"),
        session.activity_type.as_deref().unwrap_or("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ticksink_core::store::SessionStatus;
    use ticksink_core::SessionId;

    #[test]
    fn test_format_row_for_active_session() {
        let session = StoredSession {
            id: SessionId(12),
            uuid: uuid::Uuid::nil(),
            player_name: Some("Zezima".into()),
            activity_type: None,
            started_at: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            ended_at: None,
            status: SessionStatus::Active,
            total_recorded: 0,
        };

        let row = format_row(&session);
        assert!(row.contains("ACTIVE"));
        assert!(row.contains("2024-05-01 12:00:00"));
        assert!(row.contains("Zezima"));
        assert!(row.trim_end().ends_with('-'));
    }
}
