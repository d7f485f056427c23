use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::traits::change_feed::{ChangeEvent, ChangeFeed, ChangeKind, ChangeStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Routes = Arc<DashMap<String, UnboundedSender<ChangeEvent>>>;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

enum WsCommand {
    Send(Value),
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// Change feed over the Supabase realtime websocket (Phoenix channel frames)
pub struct SupabaseRealtime {
    endpoint: String,
    access_token: Option<String>,
    commands: Mutex<Option<UnboundedSender<WsCommand>>>,
    routes: Routes,
    next_ref: AtomicU64,
}

impl SupabaseRealtime {
    /// `endpoint` is the full websocket url including the `apikey` query parameter
    pub fn new(endpoint: String, access_token: Option<String>) -> Self {
        Self {
            endpoint,
            access_token,
            commands: Mutex::new(None),
            routes: Arc::new(DashMap::new()),
            next_ref: AtomicU64::new(1),
        }
    }

    /// Build the websocket url from the project url, e.g. `https://x.supabase.co`
    pub fn endpoint_for(project_url: &str, anon_key: &str) -> String {
        let base = project_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/realtime/v1/websocket?apikey={anon_key}&vsn=1.0.0")
    }

    fn topic(channel: &str) -> String {
        format!("realtime:{channel}")
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Connect on first use; a dropped socket is replaced on the next subscribe
    async fn sender(&self) -> anyhow::Result<UnboundedSender<WsCommand>> {
        let mut commands = self.commands.lock().await;
        if let Some(sender) = commands.as_ref().filter(|sender| !sender.is_closed()) {
            return Ok(sender.clone());
        }

        let (socket, _) = connect_async(self.endpoint.as_str())
            .await
            .context("failed to connect to realtime websocket")?;
        info!("realtime websocket connected");

        let (command_tx, command_rx) = unbounded_channel();
        let routes = self.routes.clone();
        tokio::spawn(async move {
            if let Err(err) = run_ws_loop(socket, command_rx, routes.clone()).await {
                error!("realtime websocket loop exited: {:#}", err);
            }
            // ends every routed stream; subscribers rejoin through `subscribe`,
            // which reconnects once it sees the command channel closed
            routes.clear();
        });
        *commands = Some(command_tx.clone());
        Ok(command_tx)
    }
}

#[async_trait]
impl ChangeFeed for SupabaseRealtime {
    async fn subscribe(&self, channel: &str, table: &str) -> anyhow::Result<ChangeStream> {
        let sender = self.sender().await?;
        let topic = Self::topic(channel);
        let (event_tx, event_rx) = unbounded_channel();
        self.routes.insert(topic.clone(), event_tx);

        let join = json!({
            "topic": topic,
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [{ "event": "*", "schema": "public", "table": table }]
                },
                "access_token": self.access_token,
            },
            "ref": self.next_ref(),
        });
        sender
            .send(WsCommand::Send(join))
            .map_err(|_| anyhow!("realtime connection closed"))?;
        debug!(topic = %topic, table, "joined realtime channel");
        Ok(event_rx)
    }

    async fn remove_channel(&self, channel: &str) -> anyhow::Result<()> {
        let topic = Self::topic(channel);
        self.routes.remove(&topic);
        let sender = self.commands.lock().await.clone();
        if let Some(sender) = sender {
            let leave = json!({ "topic": topic, "event": "phx_leave", "payload": {}, "ref": self.next_ref() });
            // a closed connection has already left every channel
            let _ = sender.send(WsCommand::Send(leave));
        }
        Ok(())
    }
}

impl Drop for SupabaseRealtime {
    fn drop(&mut self) {
        if let Some(sender) = self.commands.get_mut().take() {
            let _ = sender.send(WsCommand::Shutdown);
        }
    }
}

async fn run_ws_loop(mut socket: WsStream, mut commands: UnboundedReceiver<WsCommand>, routes: Routes) -> anyhow::Result<()> {
    let mut heartbeat = interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat_ref: u64 = 0;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(WsCommand::Send(frame)) => socket.send(Message::Text(frame.to_string())).await?,
                    Some(WsCommand::Shutdown) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_frame(&text, &routes),
                    Some(Ok(Message::Ping(payload))) => socket.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "realtime websocket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                heartbeat_ref += 1;
                let beat = json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": format!("hb-{heartbeat_ref}") });
                socket.send(Message::Text(beat.to_string())).await?;
            }
        }
    }
    Ok(())
}

fn route_frame(text: &str, routes: &Routes) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("unparseable realtime frame: {}", e);
            return;
        }
    };
    match frame.event.as_str() {
        "postgres_changes" => {}
        "phx_reply" | "presence_state" | "presence_diff" | "system" => {
            debug!(topic = %frame.topic, event = %frame.event, "realtime control frame");
            return;
        }
        "phx_error" | "phx_close" => {
            warn!(topic = %frame.topic, event = %frame.event, "realtime channel closed by server");
            routes.remove(&frame.topic);
            return;
        }
        _ => return,
    }

    let Some(data) = frame.payload.get("data").cloned() else {
        return;
    };
    let change: PostgresChange = match serde_json::from_value(data) {
        Ok(change) => change,
        Err(e) => {
            warn!(topic = %frame.topic, "unexpected postgres_changes payload: {}", e);
            return;
        }
    };

    let event = ChangeEvent {
        table: change.table,
        kind: change.kind,
        record: change.record.or(change.old_record),
    };
    let delivered = routes
        .get(&frame.topic)
        .map(|route| route.send(event).is_ok());
    if delivered == Some(false) {
        routes.remove(&frame.topic);
    }
}
