//! Session history commands.

use chrono::{DateTime, Local, Utc};

use steady_core::config::SessionBackend;

use crate::{AppContext, HistoryAction};

fn format_time(dt: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = dt.with_timezone(&Local);
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub async fn handle(action: HistoryAction, ctx: &AppContext) -> anyhow::Result<()> {
    if ctx.config.session.backend == SessionBackend::Memory {
        println!("Note: the memory backend does not persist between runs.");
    }

    match action {
        HistoryAction::Show { id } => {
            let messages = ctx.sessions.get_history(&id).await;
            if ctx.sessions.is_degraded() {
                println!("Session store unavailable; showing local fallback data.");
            }
            if messages.is_empty() {
                println!("No messages in session {}", id);
                return Ok(());
            }

            println!("Session {} ({} messages)", id, messages.len());
            for message in &messages {
                println!(
                    "[{}] {:>9}: {}",
                    format_time(&message.timestamp),
                    message.role,
                    message.content
                );
            }
        }
        HistoryAction::Clear { id } => {
            ctx.sessions.clear_session(&id).await;
            if ctx.sessions.is_degraded() {
                println!("Session store unavailable; cleared local fallback data only.");
            } else {
                println!("Cleared session {}", id);
            }
        }
    }
    Ok(())
}
