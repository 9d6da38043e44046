// Binary entry point: runs one sync session until Ctrl-C.
use anyhow::{Context, Result};
use roomcal::backend::{CalendarBackend, GraphBackend};
use roomcal::channel::WsChannel;
use roomcal::cli::{CliArgs, print_help};
use roomcal::config::Config;
use roomcal::context::{AppContext, StandardContext};
use roomcal::model::CalendarEvent;
use roomcal::scheduler::SessionClock;
use roomcal::sync::{Inbox, Notice, SyncActor, SyncSettings};
use roomcal::token::provider_from_config;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cli = CliArgs::parse(&args);

    if cli.help {
        print_help("roomcal");
        return Ok(());
    }

    let ctx = StandardContext::new(cli.root.clone());
    let mut config = match Config::load(&ctx) {
        Ok(c) => c,
        Err(e) if Config::is_missing_config_error(&e) => {
            let path = Config::get_path_string(&ctx)?;
            Config::default()
                .save(&ctx)
                .with_context(|| format!("Failed to write default config to {}", path))?;
            eprintln!("Wrote a default config to {}; fill in user_id, channel_url and a token.", path);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    roomcal::logging::init(&ctx, config.log_level_filter())?;
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let tokens = provider_from_config(&config);
    let backend = Arc::new(GraphBackend::new(
        &config.graph_url,
        tokens.clone(),
        config.scopes.clone(),
    )?);

    if cli.list {
        for cal in backend.list_calendars().await? {
            println!("{:>3}  {}  {}", cal.index, cal.id, cal.name);
        }
        return Ok(());
    }

    if config.channel_url.is_empty() {
        anyhow::bail!(
            "channel_url is not set in {}",
            Config::get_path_string(&ctx)?
        );
    }

    for id in &cli.select {
        if !config.default_calendars.contains(id) {
            config.default_calendars.push(id.clone());
        }
    }
    config.select_all_on_start |= cli.select_all;

    let inbox = Inbox::default();
    let channel = Arc::new(WsChannel::connect(
        config.channel_url.clone(),
        inbox.inbound(),
        config.reconnect.clone(),
    ));

    let (handle, task) = SyncActor::spawn(
        SyncSettings::from_config(&config),
        backend,
        channel.clone(),
        tokens,
        inbox,
        SessionClock::new(),
    );

    let mut view = handle.subscribe_view();
    let mut notices = handle.notices();
    log::info!("Logging to {:?}", ctx.log_file()?);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let events = view.borrow_and_update().clone();
                print_summary(&events);
            }
            notice = notices.recv() => match notice {
                Ok(Notice::Error(e)) => eprintln!("error: {}", e),
                Ok(other) => eprintln!("{}", other),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} notice(s)", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                log::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    handle.shutdown().await.ok();
    task.await.context("Sync actor panicked")?;
    // Leave frames queued by the actor's teardown go out before the socket closes.
    if tokio::time::timeout(Duration::from_secs(5), channel.shutdown())
        .await
        .is_err()
    {
        log::warn!("Channel did not close in time");
    }
    Ok(())
}

fn print_summary(events: &[CalendarEvent]) {
    let next = events
        .iter()
        .find(|e| e.end > chrono::Utc::now())
        .map(|e| format!("next: {} at {} ({})", e.title, e.start.format("%Y-%m-%d %H:%M"), e.organizer))
        .unwrap_or_else(|| "nothing upcoming".to_string());
    println!("{} event(s); {}", events.len(), next);
}
