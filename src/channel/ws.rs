// File: src/channel/ws.rs
// WebSocket adapter for the real-time channel.
use crate::channel::{Inbound, Outbound, RealtimeChannel};
use crate::config::ReconnectConfig;
use crate::error::{SyncError, SyncResult};
use crate::sync::InboundSender;
use futures::{SinkExt, StreamExt};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay(),
            max: config.max_delay(),
            current: config.initial_delay(),
        }
    }

    /// Returns the delay to wait now and doubles the next one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Real-time channel over a WebSocket carrying `{"event", "data"}` JSON frames.
///
/// A background task owns the socket. [`RealtimeChannel::emit`] only queues,
/// inbound frames are posted into the sync actor's inbox, and every successful
/// reconnect after the first connection posts [`Inbound::Reconnect`].
#[derive(Debug)]
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    /// Spawns the connection task. Must be called from within a tokio runtime.
    pub fn connect(url: impl Into<String>, inbound: InboundSender, reconnect: ReconnectConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_connection(
            url.into(),
            inbound,
            outbound_rx,
            Backoff::new(&reconnect),
            shutdown_rx,
        ));
        Self {
            outbound,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Signals the connection task to stop. Frames already queued are still
    /// written before the socket is closed.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Closes the channel and waits for the connection task to finish.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            log::warn!("Channel task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_none_or(JoinHandle::is_finished))
            .unwrap_or(true)
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl RealtimeChannel for WsChannel {
    fn emit(&self, message: Outbound) -> SyncResult<()> {
        log::debug!("Queueing {}", message.event_name());
        self.outbound
            .send(message)
            .map_err(|_| SyncError::ChannelClosed)
    }
}

async fn run_connection(
    url: String,
    inbound: InboundSender,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut backoff: Backoff,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connected_before = false;

    'outer: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        log::info!("Connecting to {}", url);
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                backoff.reset();
                log::info!("Connected to {}", url);
                stream
            }
            Err(e) => {
                let delay = backoff.next_delay();
                log::warn!("Connection to {} failed: {} (retrying in {:?})", url, e, delay);
                tokio::select! {
                    () = tokio::time::sleep(delay) => continue,
                    _ = shutdown_rx.changed() => break,
                }
            }
        };

        if connected_before {
            // Membership and token are rebuilt by the actor on reconnect.
            let mut dropped = 0;
            while outbound_rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                log::debug!("Dropped {} message(s) queued while disconnected", dropped);
            }
            if inbound.send(Inbound::Reconnect).await.is_err() {
                break;
            }
        }
        connected_before = true;

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                biased;

                out = outbound_rx.recv() => match out {
                    Some(msg) => {
                        if !write_frame(&mut write, &msg).await {
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        break 'outer;
                    }
                },
                _ = shutdown_rx.changed() => {
                    while let Ok(msg) = outbound_rx.try_recv() {
                        if !write_frame(&mut write, &msg).await {
                            break;
                        }
                    }
                    let _ = write.send(WsMessage::Close(None)).await;
                    break 'outer;
                }
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match Inbound::parse(text.as_str()) {
                        Ok(msg) => {
                            if inbound.send(msg).await.is_err() {
                                break 'outer;
                            }
                        }
                        Err(e) => log::warn!("Ignoring channel message: {}", e),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket read error: {}", e);
                        break;
                    }
                },
            }
        }

        let delay = backoff.next_delay();
        log::warn!("Disconnected from {} (reconnecting in {:?})", url, delay);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    log::debug!("Channel task for {} finished", url);
}

/// Encodes and writes one frame. Returns `false` once the socket is unusable.
async fn write_frame<S>(write: &mut S, msg: &Outbound) -> bool
where
    S: futures::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = match serde_json::to_string(msg) {
        Ok(t) => t,
        Err(e) => {
            log::error!("Cannot encode {}: {}", msg.event_name(), e);
            return true;
        }
    };
    match write.send(WsMessage::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("WebSocket write error: {}", e);
            false
        }
    }
}
