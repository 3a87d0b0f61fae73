//! The single live gateway connection.
//!
//! Outbound calls share one write half behind a mutex; one spawned task owns
//! the read half and only classifies frames and hands them off.

use crate::correlation::CorrelationTable;
use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::traits::GatewayClient;
use crate::types::{Action, ActionFrame, ActionReply, ChatEvent, InboundFrame, decode_frame};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request, header};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(200);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub access_token: Option<String>,
    pub call_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_access_token(mut self, access_token: Option<String>) -> Self {
        self.access_token = access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    fn client_request(&self) -> Result<Request<()>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::Connect(format!("invalid gateway url {:?}: {e}", self.url)))?;
        if let Some(token) = self.access_token.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GatewayError::Connect(format!("invalid access token: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }
        Ok(request)
    }
}

pub struct Transport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: Arc<CorrelationTable>,
    call_timeout: Duration,
    shutdown: CancellationToken,
}

impl Transport {
    /// Opens the connection and starts the read loop. Inbound events go to
    /// `dispatcher`; replies go to whichever `call` is waiting on their echo.
    #[tracing::instrument(level = "info", skip_all, fields(url = %config.url))]
    pub async fn connect(config: TransportConfig, dispatcher: Arc<Dispatcher>) -> Result<Arc<Self>> {
        let request = config.client_request()?;
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();

        let pending = Arc::new(CorrelationTable::new());
        let shutdown = CancellationToken::new();
        tokio::spawn(read_loop(
            stream,
            pending.clone(),
            dispatcher,
            shutdown.clone(),
        ));

        tracing::info!(call_timeout = ?config.call_timeout, "gateway connected");
        Ok(Arc::new(Self {
            sink: Mutex::new(sink),
            pending,
            call_timeout: config.call_timeout,
            shutdown,
        }))
    }

    pub fn is_connected(&self) -> bool {
        !self.pending.is_closed()
    }

    pub fn outstanding_calls(&self) -> usize {
        self.pending.outstanding()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(action = action.name()))]
    pub async fn call(&self, action: Action) -> Result<ActionReply> {
        let echo = Uuid::new_v4().to_string();
        let slot = self.pending.register(echo.clone())?;

        let frame = match serde_json::to_string(&ActionFrame {
            action: &action,
            echo: &echo,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.cancel(slot);
                return Err(e.into());
            }
        };

        let written = {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(frame.into())).await
        };
        if let Err(e) = written {
            self.pending.cancel(slot);
            return Err(GatewayError::Write(e.to_string()));
        }

        tracing::debug!(echo = %echo, "action sent; awaiting reply");
        self.pending.wait(slot, self.call_timeout).await
    }

    /// Stops the read loop and closes the socket. Outstanding calls fail with `Closed`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(%e, "gateway close handshake failed");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl GatewayClient for Transport {
    async fn call(&self, action: Action) -> Result<ActionReply> {
        Transport::call(self, action).await
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pending: Arc<CorrelationTable>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("gateway read loop shutting down");
                break;
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => route_frame(text.as_str(), &pending, &dispatcher),
            Some(Ok(Message::Close(frame))) => {
                tracing::warn!(?frame, "gateway closed the connection");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!(%e, "gateway read failed");
                break;
            }
            None => {
                tracing::warn!("gateway stream ended");
                break;
            }
        }
    }
    pending.close_all();
}

fn route_frame(text: &str, pending: &CorrelationTable, dispatcher: &Dispatcher) {
    match decode_frame(text) {
        Ok(InboundFrame::Reply { reply, raw }) => {
            let echo = reply.echo.clone();
            if pending.deliver(&echo, reply) {
                return;
            }
            tracing::debug!(echo = %echo, "reply matched no outstanding call; routing as event");
            match serde_json::from_value::<ChatEvent>(raw) {
                Ok(event) => {
                    dispatcher.dispatch(event);
                }
                Err(e) => tracing::warn!(%e, echo = %echo, "unmatched reply is not an event"),
            }
        }
        Ok(InboundFrame::Event(event)) => {
            dispatcher.dispatch(event);
        }
        Err(e) => {
            tracing::warn!(%e, frame = %preview(text), "undecodable gateway frame");
        }
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(256) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::EventHandler;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
    };

    /// In-process gateway: forwards client frames to `requests`, writes `replies` back.
    struct FakeGateway {
        url: String,
        requests: mpsc::UnboundedReceiver<Value>,
        replies: mpsc::UnboundedSender<Message>,
        authorization: oneshot::Receiver<Option<String>>,
    }

    async fn spawn_gateway() -> FakeGateway {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (replies, mut replies_rx) = mpsc::unbounded_channel::<Message>();
        let (auth_tx, authorization) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let ws = tokio_tungstenite::accept_hdr_async(
                tcp,
                move |req: &HandshakeRequest,
                      resp: HandshakeResponse|
                      -> std::result::Result<HandshakeResponse, ErrorResponse> {
                    let header = req
                        .headers()
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let _ = auth_tx.send(header);
                    Ok(resp)
                },
            )
            .await
            .expect("handshake");
            let (mut sink, mut stream) = ws.split();
            loop {
                tokio::select! {
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let v: Value = serde_json::from_str(text.as_str()).expect("client json");
                            let _ = requests_tx.send(v);
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    outbound = replies_rx.recv() => match outbound {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                }
            }
        });

        FakeGateway {
            url: format!("ws://{addr}"),
            requests,
            replies,
            authorization,
        }
    }

    fn reply_for(request: &Value, data: Value) -> Message {
        let frame = json!({
            "status": "ok",
            "retcode": 0,
            "data": data,
            "echo": request["echo"],
        });
        Message::Text(frame.to_string().into())
    }

    struct Collect(mpsc::UnboundedSender<ChatEvent>);

    #[async_trait]
    impl EventHandler for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn handle(&self, event: Arc<ChatEvent>) -> anyhow::Result<()> {
            let _ = self.0.send((*event).clone());
            Ok(())
        }
    }

    async fn next_request(gateway: &mut FakeGateway) -> Value {
        tokio::time::timeout(Duration::from_secs(5), gateway.requests.recv())
            .await
            .expect("request in time")
            .expect("gateway alive")
    }

    #[tokio::test]
    async fn call_receives_its_correlated_reply_and_sends_bearer_token() {
        let mut gateway = spawn_gateway().await;
        let config = TransportConfig::new(&gateway.url).with_access_token(Some("s3cret".into()));
        let transport = Transport::connect(config, Arc::new(Dispatcher::new()))
            .await
            .expect("connect");

        let auth = (&mut gateway.authorization).await.expect("handshake seen");
        assert_eq!(auth.as_deref(), Some("Bearer s3cret"));

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .call(Action::GetForwardMsg {
                        message_id: "7391".to_string(),
                    })
                    .await
            })
        };

        let request = next_request(&mut gateway).await;
        assert_eq!(request["action"], "get_forward_msg");
        assert_eq!(request["params"]["message_id"], "7391");
        assert!(request["echo"].as_str().is_some_and(|e| !e.is_empty()));

        gateway
            .replies
            .send(reply_for(&request, json!({ "messages": [] })))
            .expect("reply queued");

        let reply = call.await.expect("join").expect("reply");
        assert!(reply.is_ok());
        assert_eq!(reply.data, json!({ "messages": [] }));
        assert_eq!(transport.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_are_matched_when_replies_arrive_out_of_order() {
        let mut gateway = spawn_gateway().await;
        let transport = Transport::connect(
            TransportConfig::new(&gateway.url),
            Arc::new(Dispatcher::new()),
        )
        .await
        .expect("connect");

        let mut calls = Vec::new();
        for group in ["1", "2", "3"] {
            let transport = transport.clone();
            calls.push(tokio::spawn(async move {
                transport.call(Action::group_text(group, "hi")).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(next_request(&mut gateway).await);
        }
        for request in requests.iter().rev() {
            let group = request["params"]["group_id"].clone();
            gateway
                .replies
                .send(reply_for(request, json!({ "group": group })))
                .expect("reply queued");
        }

        for (call, group) in calls.into_iter().zip(["1", "2", "3"]) {
            let reply = call.await.expect("join").expect("reply");
            assert_eq!(reply.data["group"], group);
        }
    }

    #[tokio::test]
    async fn events_are_dispatched_and_bad_frames_do_not_stop_the_loop() {
        let mut gateway = spawn_gateway().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register_handler(Arc::new(Collect(tx)));
        let transport = Transport::connect(TransportConfig::new(&gateway.url), dispatcher)
            .await
            .expect("connect");

        gateway
            .replies
            .send(Message::Text("{this is not json".into()))
            .expect("queued");
        gateway
            .replies
            .send(Message::Text(
                json!({
                    "post_type": "message",
                    "self_id": 1,
                    "sender": { "user_id": 2, "nickname": "alice" },
                    "message": [{ "type": "text", "data": { "text": "hello" } }],
                    "raw_message": "hello"
                })
                .to_string()
                .into(),
            ))
            .expect("queued");

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("handler alive");
        assert_eq!(event.raw_message, "hello");
        assert_eq!(event.sender.nickname, "alice");

        // A matched reply is delivered to its caller, not to handlers.
        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.call(Action::private_text("2", "pong")).await })
        };
        let request = next_request(&mut gateway).await;
        gateway
            .replies
            .send(reply_for(&request, json!({ "message_id": 5 })))
            .expect("queued");
        call.await.expect("join").expect("reply");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err(), "reply must not reach handlers");
    }

    #[tokio::test]
    async fn call_times_out_and_the_late_reply_goes_to_handlers() {
        let mut gateway = spawn_gateway().await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register_handler(Arc::new(Collect(tx)));
        let transport = Transport::connect(
            TransportConfig::new(&gateway.url).with_call_timeout(Duration::from_millis(100)),
            dispatcher,
        )
        .await
        .expect("connect");

        let err = transport
            .call(Action::group_text("1", "anyone?"))
            .await
            .expect_err("no reply");
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert_eq!(transport.outstanding_calls(), 0);
        let request = next_request(&mut gateway).await;

        gateway
            .replies
            .send(reply_for(&request, Value::Null))
            .expect("queued");
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("late reply dispatched")
            .expect("handler alive");
        assert!(event.post_type.is_empty());
        assert!(!event.is_message());
    }

    #[tokio::test]
    async fn dropped_call_releases_its_slot() {
        let mut gateway = spawn_gateway().await;
        let transport = Transport::connect(
            TransportConfig::new(&gateway.url),
            Arc::new(Dispatcher::new()),
        )
        .await
        .expect("connect");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            transport.call(Action::group_text("1", "slow")),
        )
        .await;
        assert!(abandoned.is_err(), "caller gave up first");
        let _request = next_request(&mut gateway).await;
        assert_eq!(transport.outstanding_calls(), 0);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn closed_connection_fails_outstanding_calls() {
        let mut gateway = spawn_gateway().await;
        let transport = Transport::connect(
            TransportConfig::new(&gateway.url),
            Arc::new(Dispatcher::new()),
        )
        .await
        .expect("connect");

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.call(Action::group_text("1", "bye")).await })
        };
        let _request = next_request(&mut gateway).await;
        drop(gateway);

        let err = call.await.expect("join").expect_err("connection closed");
        assert!(matches!(err, GatewayError::Closed));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = Transport::connect(
            TransportConfig::new(format!("ws://{addr}")),
            Arc::new(Dispatcher::new()),
        )
        .await
        .err()
        .expect("nothing listening");
        assert!(matches!(err, GatewayError::Connect(_)));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        assert_eq!(preview(&long).chars().count(), 256);
        assert_eq!(preview("short"), "short");
    }
}
