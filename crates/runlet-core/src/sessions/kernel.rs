//! Kernel-protocol language sessions.
//!
//! Instead of owning a child process, this strategy talks to an
//! interactive kernel through a Jupyter-compatible kernel gateway: kernels
//! are created and destroyed over REST, and execution traffic flows over
//! the kernel's WebSocket channel. Kernel-native message types (stream
//! output, errors, execution results, status transitions) are translated
//! into the same output events the subprocess strategy produces, including
//! synthesized terminal sentinels, so everything downstream of a session
//! is strategy-agnostic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::{KernelEndpoint, LanguageProfile};
use crate::errors::EngineError;
use crate::markers::MarkerToken;
use crate::output::{OutputEvent, StreamOrigin};

use super::{LanguageSession, OutputEvents, SessionState, StateCell};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// A language session backed by a kernel gateway connection.
pub struct KernelSession {
    language: String,
    endpoint: KernelEndpoint,
    kernel_id: String,
    client_session: String,
    token: MarkerToken,
    state: Arc<StateCell>,
    executions: AtomicU64,
    closed: Arc<AtomicBool>,
    http: reqwest::Client,
    sink: Arc<Mutex<WsSink>>,
    inbox: Arc<Mutex<UnboundedReceiver<KernelMessage>>>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Deserialize)]
struct KernelHandle {
    id: String,
}

/// The envelope of one kernel channel message.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct KernelMessage {
    #[serde(default)]
    header: MessageHeader,
    #[serde(default)]
    parent_header: MessageHeader,
    #[serde(default)]
    content: serde_json::Value,
    #[serde(default)]
    channel: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MessageHeader {
    #[serde(default)]
    msg_id: String,
    #[serde(default)]
    msg_type: String,
}

impl KernelSession {
    /// Create a kernel through the gateway and attach to its channel.
    pub async fn start(profile: LanguageProfile) -> Result<Self, EngineError> {
        profile.validate()?;
        let language = profile.name.clone();
        let endpoint = profile.kernel.clone().ok_or_else(|| {
            EngineError::ConfigError(format!("language '{}' has no kernel endpoint", language))
        })?;

        let http = reqwest::Client::new();
        let mut request = http
            .post(format!("{}/api/kernels", endpoint.base_url))
            .json(&json!({ "name": endpoint.kernel_name }));
        if let Some(token) = &endpoint.token {
            request = request.header("Authorization", format!("token {}", token));
        }

        let handle: KernelHandle = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| spawn_failed(&language, &err))?
            .json()
            .await
            .map_err(|err| {
                EngineError::KernelProtocol(format!("invalid kernel creation response: {}", err))
            })?;

        log::info!("started {} kernel {}", language, handle.id);

        let client_session = Uuid::new_v4().to_string();
        let url = channel_url(&endpoint, &handle.id, &client_session);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| spawn_failed(&language, &err))?;
        let (sink, mut stream) = ws.split();

        let (tx, rx) = unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let pump_closed = Arc::clone(&closed);
        let pump_language = language.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<KernelMessage>(&text) {
                            Ok(parsed) => {
                                if tx.send(parsed).is_err() {
                                    break;
                                }
                            }
                            Err(err) => log::debug!("unparseable kernel message: {}", err),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("{} kernel channel failed: {}", pump_language, err);
                        break;
                    }
                }
            }
            pump_closed.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            language,
            endpoint,
            kernel_id: handle.id,
            client_session,
            token: MarkerToken::generate(),
            state: Arc::new(StateCell::new()),
            executions: AtomicU64::new(0),
            closed,
            http,
            sink: Arc::new(Mutex::new(sink)),
            inbox: Arc::new(Mutex::new(rx)),
            tasks: vec![pump],
        })
    }

    fn kernel_api(&self, suffix: &str) -> String {
        format!(
            "{}/api/kernels/{}{}",
            self.endpoint.base_url, self.kernel_id, suffix
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.token {
            Some(token) => request.header("Authorization", format!("token {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl LanguageSession for KernelSession {
    fn language(&self) -> &str {
        &self.language
    }

    fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            return SessionState::Terminated;
        }
        self.state.get()
    }

    fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    fn marker_token(&self) -> &MarkerToken {
        &self.token
    }

    async fn execute(&self, code: &str) -> Result<OutputEvents, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            self.state.set(SessionState::Terminated);
            return Err(EngineError::ProcessCrashed {
                language: self.language.clone(),
                message: "the kernel channel is closed".to_string(),
            });
        }

        self.state.begin().map_err(|blocked| match blocked {
            SessionState::Executing => EngineError::SessionBusy {
                language: self.language.clone(),
            },
            _ => EngineError::ProcessCrashed {
                language: self.language.clone(),
                message: "the session has been terminated".to_string(),
            },
        })?;

        self.executions.fetch_add(1, Ordering::SeqCst);

        let msg_id = Uuid::new_v4().to_string();
        let request = json!({
            "header": {
                "msg_id": msg_id,
                "msg_type": "execute_request",
                "session": self.client_session,
                "username": "runlet",
                "version": "5.3",
                "date": chrono::Utc::now().to_rfc3339(),
            },
            "parent_header": {},
            "metadata": {},
            "content": {
                "code": code,
                "silent": false,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            },
            "channel": "shell",
        });

        {
            let mut inbox = self.inbox.lock().await;
            while inbox.try_recv().is_ok() {}
        }

        {
            let mut sink = self.sink.lock().await;
            if let Err(err) = sink.send(WsMessage::Text(request.to_string())).await {
                self.state.set(SessionState::Terminated);
                return Err(EngineError::ProcessCrashed {
                    language: self.language.clone(),
                    message: format!("failed to submit execute request: {}", err),
                });
            }
        }

        let (exec_tx, exec_rx) = unbounded_channel();
        let inbox = Arc::clone(&self.inbox);
        let state = Arc::clone(&self.state);
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut inbox = inbox.lock().await;
            let mut errored = false;
            let mut forwarding = true;

            loop {
                match inbox.recv().await {
                    Some(message) => {
                        if message.parent_header.msg_id != msg_id {
                            continue;
                        }
                        if is_idle(&message) {
                            let sentinel = if errored { token.error() } else { token.done() };
                            if forwarding {
                                let _ = exec_tx.send(OutputEvent::new(
                                    StreamOrigin::Stdout,
                                    format!("{}\n", sentinel),
                                ));
                            }
                            state.finish();
                            break;
                        }
                        for event in translate_message(&message, &mut errored) {
                            if forwarding && exec_tx.send(event).is_err() {
                                forwarding = false;
                            }
                        }
                    }
                    None => {
                        state.set(SessionState::Terminated);
                        break;
                    }
                }
            }
        });

        Ok(exec_rx)
    }

    async fn terminate(&self) {
        self.state.set(SessionState::Terminated);

        let interrupt = self.authorize(self.http.post(self.kernel_api("/interrupt")));
        if let Err(err) = interrupt.send().await {
            log::debug!("kernel interrupt failed: {}", err);
        }
        let delete = self.authorize(self.http.delete(self.kernel_api("")));
        if let Err(err) = delete.send().await {
            log::warn!("kernel delete failed: {}", err);
        }

        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
        self.closed.store(true, Ordering::SeqCst);
        log::info!("terminated {} kernel {}", self.language, self.kernel_id);
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_failed(language: &str, err: &dyn std::fmt::Display) -> EngineError {
    EngineError::ProcessSpawnFailed {
        language: language.to_string(),
        message: err.to_string(),
    }
}

/// WebSocket URL of a kernel's channel endpoint.
fn channel_url(endpoint: &KernelEndpoint, kernel_id: &str, client_session: &str) -> String {
    let ws_base = endpoint.base_url.replacen("http", "ws", 1);
    let mut url = format!(
        "{}/api/kernels/{}/channels?session_id={}",
        ws_base, kernel_id, client_session
    );
    if let Some(token) = &endpoint.token {
        url.push_str(&format!("&token={}", token));
    }
    url
}

/// Whether this message reports our execution going idle (the kernel's
/// end-of-execution signal).
fn is_idle(message: &KernelMessage) -> bool {
    message.header.msg_type == "status"
        && message.channel != "shell"
        && message.content["execution_state"] == "idle"
}

/// Translate one kernel message into output events.
pub(crate) fn translate_message(message: &KernelMessage, errored: &mut bool) -> Vec<OutputEvent> {
    match message.header.msg_type.as_str() {
        "stream" => {
            let origin = if message.content["name"] == "stderr" {
                StreamOrigin::Stderr
            } else {
                StreamOrigin::Stdout
            };
            let text = message.content["text"].as_str().unwrap_or_default();
            vec![OutputEvent::new(origin, text)]
        }
        "error" => {
            *errored = true;
            let traceback = message.content["traceback"]
                .as_array()
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(|line| line.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_else(|| {
                    format!(
                        "{}: {}",
                        message.content["ename"].as_str().unwrap_or("error"),
                        message.content["evalue"].as_str().unwrap_or_default()
                    )
                });
            vec![OutputEvent::new(
                StreamOrigin::Stderr,
                format!("{}\n", strip_ansi(&traceback)),
            )]
        }
        "execute_result" | "display_data" => {
            match message.content["data"]["text/plain"].as_str() {
                Some(text) => vec![OutputEvent::new(StreamOrigin::Stdout, format!("{}\n", text))],
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

/// Kernel tracebacks arrive colored; the engine streams plain text.
fn strip_ansi(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi pattern is valid"));
    pattern.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(json: serde_json::Value) -> KernelMessage {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_stream_message_translation() {
        let msg = message(json!({
            "header": {"msg_id": "a", "msg_type": "stream"},
            "parent_header": {"msg_id": "req"},
            "content": {"name": "stdout", "text": "hello\n"},
            "channel": "iopub",
        }));

        let mut errored = false;
        let events = translate_message(&msg, &mut errored);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, StreamOrigin::Stdout);
        assert_eq!(events[0].text, "hello\n");
        assert!(!errored);
    }

    #[test]
    fn test_error_message_sets_errored_and_strips_ansi() {
        let msg = message(json!({
            "header": {"msg_type": "error"},
            "parent_header": {"msg_id": "req"},
            "content": {
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["\u{1b}[0;31mZeroDivisionError\u{1b}[0m: division by zero"],
            },
            "channel": "iopub",
        }));

        let mut errored = false;
        let events = translate_message(&msg, &mut errored);
        assert!(errored);
        assert_eq!(events[0].origin, StreamOrigin::Stderr);
        assert_eq!(events[0].text, "ZeroDivisionError: division by zero\n");
    }

    #[test]
    fn test_execute_result_uses_plain_text() {
        let msg = message(json!({
            "header": {"msg_type": "execute_result"},
            "parent_header": {"msg_id": "req"},
            "content": {"data": {"text/plain": "42", "text/html": "<b>42</b>"}},
            "channel": "iopub",
        }));

        let mut errored = false;
        let events = translate_message(&msg, &mut errored);
        assert_eq!(events[0].text, "42\n");
    }

    #[test]
    fn test_idle_status_detection() {
        let idle = message(json!({
            "header": {"msg_type": "status"},
            "parent_header": {"msg_id": "req"},
            "content": {"execution_state": "idle"},
            "channel": "iopub",
        }));
        let busy = message(json!({
            "header": {"msg_type": "status"},
            "parent_header": {"msg_id": "req"},
            "content": {"execution_state": "busy"},
            "channel": "iopub",
        }));

        assert!(is_idle(&idle));
        assert!(!is_idle(&busy));
    }

    #[test]
    fn test_channel_url_swaps_scheme_and_carries_token() {
        let endpoint = KernelEndpoint {
            base_url: "https://gateway:8888".to_string(),
            kernel_name: "python3".to_string(),
            token: Some("secret".to_string()),
        };
        let url = channel_url(&endpoint, "k1", "s1");
        assert!(url.starts_with("wss://gateway:8888/api/kernels/k1/channels"));
        assert!(url.contains("session_id=s1"));
        assert!(url.contains("token=secret"));
    }

    #[test]
    fn test_unknown_message_types_produce_nothing() {
        let msg = message(json!({
            "header": {"msg_type": "comm_msg"},
            "parent_header": {"msg_id": "req"},
            "content": {},
            "channel": "iopub",
        }));
        let mut errored = false;
        assert!(translate_message(&msg, &mut errored).is_empty());
    }
}
