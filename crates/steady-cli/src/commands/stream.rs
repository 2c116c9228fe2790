//! Streaming query command.

use std::io::{self, Write};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use steady_client::{HttpRequest, StreamEvent};
use steady_core::{Error, Message};
use steady_session::text_delta;

use crate::AppContext;

/// Streamed exchanges recorded in a session share that session's rate limit.
fn stream_request(url: &str, data: Option<&str>, session: Option<&str>) -> anyhow::Result<HttpRequest> {
    let request = super::build_request(url, data, None)?;
    Ok(match session {
        Some(id) => request.with_rate_key(id),
        None => request,
    })
}

pub async fn run(
    ctx: &AppContext,
    url: &str,
    data: Option<&str>,
    session: Option<String>,
    message: Option<String>,
    raw: bool,
) -> anyhow::Result<()> {
    let request = stream_request(url, data, session.as_deref())?;

    if let (Some(id), Some(text)) = (&session, message) {
        ctx.sessions
            .append_message(id, Message::user(text).with_generated_id())
            .await;
    }

    // Ctrl-C stops decoding and closes the connection
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let events = ctx
        .executor
        .execute_streaming_with_cancel(&request, cancel.clone())
        .await
        .map_err(Error::from)?;
    let mut events = match &session {
        Some(id) => ctx.sessions.capture_stream(id.clone(), events),
        None => events,
    };

    let mut stdout = io::stdout();
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Data(value) => {
                if raw {
                    writeln!(stdout, "{}", value)?;
                } else if let Some(text) = text_delta(&value) {
                    write!(stdout, "{}", text)?;
                    stdout.flush()?;
                }
            }
            StreamEvent::DecodeFailure { raw, message } => {
                eprintln!("\n[undecodable: {}] {}", message, raw);
            }
            StreamEvent::RateLimited { retry_after } => match retry_after {
                Some(delay) => eprintln!("\nRate limited mid-stream, retry in {:.1}s", delay.as_secs_f64()),
                None => eprintln!("\nRate limited mid-stream"),
            },
            StreamEvent::Error(e) => eprintln!("\nError: {}", e),
            StreamEvent::Cancelled => {}
        }
    }
    interrupt.abort();

    if !raw {
        println!();
    }
    if cancel.is_cancelled() {
        eprintln!("Cancelled");
    }
    Ok(())
}
