use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use shared::protocol::{PushCommand, PushEvent};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::session::SessionContext;

const SIGNAL_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSignal {
    Connected,
    Disconnected { reason: String },
    Event(PushEvent),
}

/// Outbound side of the realtime channel as seen by the sync controller.
pub trait PushOutbox: Send + Sync {
    fn send(&self, command: PushCommand);
}

/// Used when no realtime endpoint is configured; commands go nowhere.
pub struct DetachedPushOutbox;

impl PushOutbox for DetachedPushOutbox {
    fn send(&self, command: PushCommand) {
        debug!(?command, "push: no realtime channel; dropping command");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// One long-lived websocket per session, re-established with exponential
/// backoff whenever it drops.
pub struct WsPushChannel {
    commands: mpsc::UnboundedSender<PushCommand>,
    task: JoinHandle<()>,
}

impl WsPushChannel {
    pub fn spawn(
        push_url: &str,
        session: Arc<SessionContext>,
        policy: ReconnectPolicy,
    ) -> Result<(Arc<Self>, mpsc::Receiver<PushSignal>)> {
        let push_url =
            Url::parse(push_url).with_context(|| format!("invalid push url '{push_url}'"))?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let task = tokio::spawn(run_push_loop(
            push_url,
            session,
            policy,
            commands_rx,
            signals_tx,
        ));
        Ok((
            Arc::new(Self {
                commands: commands_tx,
                task,
            }),
            signals_rx,
        ))
    }
}

impl PushOutbox for WsPushChannel {
    fn send(&self, command: PushCommand) {
        let _ = self.commands.send(command);
    }
}

impl Drop for WsPushChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum LinkExit {
    Dropped(String),
    Shutdown,
}

async fn run_push_loop(
    push_url: Url,
    session: Arc<SessionContext>,
    policy: ReconnectPolicy,
    mut commands: mpsc::UnboundedReceiver<PushCommand>,
    signals: mpsc::Sender<PushSignal>,
) {
    let mut delay = policy.initial;
    let mut reported_down = false;
    // One immediate retry after a credential refresh; later rejections back off.
    let mut fresh_token_retry_used = false;

    loop {
        let token = session.access_token().await;
        let url = connection_url(&push_url, token.as_deref());
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(url = %push_url, "push: connected");
                delay = policy.initial;
                reported_down = false;
                fresh_token_retry_used = false;
                // Anything queued while offline is stale; the controller re-joins.
                while commands.try_recv().is_ok() {}
                if signals.send(PushSignal::Connected).await.is_err() {
                    return;
                }
                match pump(stream, &mut commands, &signals).await {
                    LinkExit::Shutdown => return,
                    LinkExit::Dropped(reason) => {
                        warn!(%reason, "push: link dropped");
                        if !report_down(&signals, &mut reported_down, reason).await {
                            return;
                        }
                    }
                }
            }
            Err(tungstenite::Error::Http(response))
                if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED =>
            {
                warn!("push: handshake rejected credentials; refreshing");
                if !report_down(&signals, &mut reported_down, "unauthorized".into()).await {
                    return;
                }
                let refreshed = session.refresh_credentials(token.as_deref()).await.is_ok();
                if refreshed && !fresh_token_retry_used {
                    fresh_token_retry_used = true;
                    continue;
                }
            }
            Err(err) => {
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "push: connect failed");
                if !report_down(&signals, &mut reported_down, err.to_string()).await {
                    return;
                }
            }
        }

        if signals.is_closed() {
            return;
        }
        tokio::time::sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}

/// Sends `Disconnected` once per outage. Returns `false` when nobody listens anymore.
async fn report_down(
    signals: &mpsc::Sender<PushSignal>,
    reported_down: &mut bool,
    reason: String,
) -> bool {
    if *reported_down {
        return true;
    }
    *reported_down = true;
    signals
        .send(PushSignal::Disconnected { reason })
        .await
        .is_ok()
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    commands: &mut mpsc::UnboundedReceiver<PushCommand>,
    signals: &mpsc::Sender<PushSignal>,
) -> LinkExit {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<PushEvent>(&text) {
                    Ok(event) => {
                        if signals.send(PushSignal::Event(event)).await.is_err() {
                            return LinkExit::Shutdown;
                        }
                    }
                    Err(err) => warn!(error = %err, "push: ignoring malformed frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return LinkExit::Dropped("closed by server".into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return LinkExit::Dropped(err.to_string()),
            },
            outgoing = commands.recv() => match outgoing {
                Some(command) => {
                    let frame = match serde_json::to_string(&command) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "push: failed to encode command");
                            continue;
                        }
                    };
                    if let Err(err) = writer.send(Message::Text(frame)).await {
                        return LinkExit::Dropped(err.to_string());
                    }
                }
                None => {
                    let _ = writer.close().await;
                    return LinkExit::Shutdown;
                }
            },
        }
    }
}

fn connection_url(base: &Url, token: Option<&str>) -> Url {
    let mut url = base.clone();
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    url
}
