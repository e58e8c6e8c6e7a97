//! Minimal Chrome DevTools Protocol client over WebSocket.
//!
//! One client per endpoint (browser or page target). A writer task owns the
//! socket sink, a reader task routes command responses back to their callers
//! and fans events out to subscribers.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type Listeners = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    event_listeners: Listeners,
    closed: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self, String> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| format!("Failed to connect to CDP endpoint {}: {}", ws_url, e))?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let event_listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!(error = %e, "CDP WebSocket write error");
                    break;
                }
            }
        });

        let pending_r = pending.clone();
        let events_r = event_listeners.clone();
        let closed_r = closed.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending_r.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let mut listeners = events_r.lock().await;
                            if let Some(senders) = listeners.get_mut(method) {
                                senders.retain(|tx| !tx.is_closed());
                                let params = val.get("params").cloned().unwrap_or(Value::Null);
                                for tx in senders {
                                    let _ = tx.try_send(params.clone());
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "CDP WebSocket read error");
                        break;
                    }
                    _ => {}
                }
            }
            closed_r.store(true, Ordering::SeqCst);
            // Fail in-flight commands now rather than at their timeout.
            pending_r.lock().await.clear();
            events_r.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            closed,
            reader_handle,
            writer_handle,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its `result`. Protocol errors come back as
    /// the `error.message` text.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, String> {
        if self.is_closed() {
            return Err("Target closed".to_string());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| format!("Failed to send CDP command: {}", e))?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(err) => Err(err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string())),
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err("Target closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(format!("CDP command '{}' timed out after {}s", method, COMMAND_TIMEOUT.as_secs()))
            }
        }
    }

    /// Receiver of the `params` of every future `method` event.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        self.event_listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<(), String> {
        self.send_command(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<Value, String> {
        self.send_command("Page.navigate", json!({ "url": url })).await
    }

    /// Evaluate `expression` and return its JSON value. A thrown exception is an error.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value, String> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .or_else(|| details.get("text").and_then(|t| t.as_str()))
                .unwrap_or("JavaScript exception");
            return Err(text.to_string());
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// New page target, optionally inside a browser context.
    pub async fn create_target(&self, url: &str, browser_context_id: Option<&str>) -> Result<String, String> {
        let mut params = json!({ "url": url });
        if let Some(ctx) = browser_context_id {
            params["browserContextId"] = json!(ctx);
        }
        let result = self.send_command("Target.createTarget", params).await?;
        result
            .get("targetId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| "No targetId returned from createTarget".to_string())
    }

    pub async fn close_target(&self, target_id: &str) -> Result<(), String> {
        self.send_command("Target.closeTarget", json!({ "targetId": target_id }))
            .await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
