use crate::error::StreamError;
use crate::peer::PeerConnectionManager;
use crate::session::SessionRegistry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lumen_protocol::{AgentCommand, SignalEnvelope, SignalReply, SignalRequest, SignalResponse};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// Shared context for the relay WebSocket connection.
pub(crate) struct SignalingCtx<'a> {
    pub server_url: &'a str,
    pub agent_id: &'a str,
    pub agent_token: Option<&'a str>,
    pub tls_cert_path: Option<&'a str>,
    pub manager: &'a Arc<PeerConnectionManager>,
    pub sessions: &'a Arc<SessionRegistry>,
}

/// Runs until the relay sends `shutdown`. Errors and closed sockets
/// reconnect with exponential backoff.
pub(crate) async fn run_signaling(ctx: &SignalingCtx<'_>) {
    if ctx.server_url.is_empty() {
        info!("No signaling server configured, idling");
        std::future::pending::<()>().await;
        return;
    }

    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);
    loop {
        info!(url = ctx.server_url, "Connecting to signaling server");

        match connect_and_handle(ctx, &mut backoff).await {
            Ok(()) => {
                info!("Shutdown requested by signaling server");
                break;
            }
            Err(e) => {
                warn!("Signaling connection error: {e:#}");
                info!("Reconnecting in {} seconds...", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

/// System roots plus an optional pinned certificate.
fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Could not load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned server certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to read TLS cert from {cert_path}: {e}, falling back to system roots"
                );
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

fn relay_url(server_url: &str, agent_id: &str, agent_token: Option<&str>) -> String {
    let base = server_url.trim_end_matches('/');
    match agent_token {
        Some(token) => format!(
            "{base}/ws/agent/{agent_id}?token={}",
            urlencoding::encode(token)
        ),
        None => format!("{base}/ws/agent/{agent_id}"),
    }
}

async fn connect_and_handle(ctx: &SignalingCtx<'_>, backoff: &mut Duration) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};

    let url = relay_url(ctx.server_url, ctx.agent_id, ctx.agent_token);
    let connector = build_tls_connector(ctx.tls_cert_path);
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(65_536);
    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        &url,
        Some(ws_config),
        false,
        Some(connector),
    )
    .await
    .context("WebSocket connection failed")?;

    info!("Connected to signaling server");
    *backoff = Duration::from_secs(2);
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Requests run concurrently (offers wait for ICE); replies funnel here.
    let (reply_tx, mut reply_rx) = mpsc::channel::<SignalReply>(32);
    let mut dedup = OfferDedup::default();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match classify(msg) {
                    RelayEvent::Request(envelope) => {
                        if let SignalRequest::AcceptOffer { sdp } = &envelope.request
                            && dedup.is_duplicate(sdp)
                        {
                            info!("Ignoring duplicate SDP offer (same ICE ufrag)");
                            continue;
                        }
                        let manager = Arc::clone(ctx.manager);
                        let sessions = Arc::clone(ctx.sessions);
                        let tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let reply = dispatch(&manager, &sessions, envelope).await;
                            let _ = tx.send(reply).await;
                        });
                    }
                    RelayEvent::Shutdown => {
                        info!("Received shutdown command");
                        return Ok(());
                    }
                    RelayEvent::Disconnected(reason) => {
                        anyhow::bail!("Signaling connection lost: {reason}");
                    }
                    RelayEvent::Ignored => {}
                }
            }
            Some(reply) = reply_rx.recv() => {
                let text = serde_json::to_string(&reply)?;
                ws_tx.send(Message::Text(text.into())).await?;
            }
        }
    }
}

/// What one read from the relay socket means for the connection.
#[derive(Debug)]
enum RelayEvent {
    Request(SignalEnvelope),
    Shutdown,
    Disconnected(String),
    Ignored,
}

fn classify(msg: Option<Result<Message, tungstenite::Error>>) -> RelayEvent {
    match msg {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentCommand>(&text) {
            Ok(AgentCommand::Signal(envelope)) => RelayEvent::Request(envelope),
            Ok(AgentCommand::Shutdown) => RelayEvent::Shutdown,
            Err(e) => {
                warn!("Invalid message from server: {e}");
                RelayEvent::Ignored
            }
        },
        Some(Ok(Message::Close(Some(frame)))) => RelayEvent::Disconnected(format!(
            "closed by server (code {}, {:?})",
            u16::from(frame.code),
            &*frame.reason
        )),
        Some(Ok(Message::Close(None))) => RelayEvent::Disconnected("closed by server".into()),
        Some(Ok(_)) => RelayEvent::Ignored,
        Some(Err(e)) => RelayEvent::Disconnected(e.to_string()),
        None => RelayEvent::Disconnected("stream ended".into()),
    }
}

/// Browsers retry offers with identical ICE credentials before the answer
/// arrives; answering twice leaves the viewer holding a dead connection.
#[derive(Default)]
struct OfferDedup {
    last_ufrag: Option<String>,
}

impl OfferDedup {
    fn is_duplicate(&mut self, sdp: &str) -> bool {
        let ufrag = sdp
            .lines()
            .find_map(|l| l.strip_prefix("a=ice-ufrag:"))
            .map(|u| u.trim().to_string());
        if ufrag.is_some() && ufrag == self.last_ufrag {
            return true;
        }
        self.last_ufrag = ufrag;
        false
    }
}

fn error_response(e: &StreamError) -> SignalResponse {
    SignalResponse::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}

/// Executes one signaling request and builds the reply, echoing the
/// request id.
pub(crate) async fn dispatch(
    manager: &Arc<PeerConnectionManager>,
    sessions: &SessionRegistry,
    envelope: SignalEnvelope,
) -> SignalReply {
    let SignalEnvelope {
        request_id,
        request,
    } = envelope;
    debug!(?request_id, "Signaling request");

    let response = match request {
        SignalRequest::CreateOffer => match manager.create_offer().await {
            Ok((sdp, connection_id)) => SignalResponse::Offer { connection_id, sdp },
            Err(e) => error_response(&e),
        },
        SignalRequest::AcceptAnswer { connection_id, sdp } => {
            match manager.accept_answer(connection_id, &sdp).await {
                Ok(()) => SignalResponse::Accepted { connection_id },
                Err(e) => error_response(&e),
            }
        }
        SignalRequest::AcceptOffer { sdp } => match manager.accept_offer(&sdp).await {
            Ok((sdp, connection_id)) => SignalResponse::Answer { connection_id, sdp },
            Err(e) => error_response(&e),
        },
        SignalRequest::Close { connection_id } => {
            manager.close(connection_id).await;
            SignalResponse::Closed { connection_id }
        }
        SignalRequest::OpenSession {
            session_id,
            client_info,
        } => match session_id {
            Some(id) => match sessions.resume(id) {
                Ok(view) => view.into(),
                Err(e) => error_response(&e),
            },
            None => sessions.create(client_info).into(),
        },
    };

    if let SignalResponse::Error { kind, message } = &response {
        warn!(?request_id, ?kind, "Signaling request failed: {message}");
    }
    SignalReply {
        request_id,
        response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::tests::harness;
    use lumen_protocol::ErrorKind;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn envelope(request_id: &str, request: SignalRequest) -> SignalEnvelope {
        SignalEnvelope {
            request_id: Some(request_id.to_string()),
            request,
        }
    }

    #[tokio::test]
    async fn offer_answer_close_round() {
        let h = harness(true, false);
        let sessions = SessionRegistry::new(Duration::from_secs(3600));

        let reply = dispatch(&h.manager, &sessions, envelope("r1", SignalRequest::CreateOffer)).await;
        assert_eq!(reply.request_id.as_deref(), Some("r1"));
        let SignalResponse::Offer { connection_id, sdp } = reply.response else {
            panic!("expected offer, got {:?}", reply.response);
        };
        assert!(sdp.starts_with("v=0 offer"));

        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope(
                "r2",
                SignalRequest::AcceptAnswer {
                    connection_id,
                    sdp: "v=0 answer".into(),
                },
            ),
        )
        .await;
        assert!(matches!(reply.response, SignalResponse::Accepted { connection_id: id } if id == connection_id));

        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope("r3", SignalRequest::Close { connection_id }),
        )
        .await;
        assert!(matches!(reply.response, SignalResponse::Closed { .. }));
        assert!(h.manager.live_connections().is_empty());

        // Closing again is still answered.
        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope("r4", SignalRequest::Close { connection_id }),
        )
        .await;
        assert!(matches!(reply.response, SignalResponse::Closed { .. }));
    }

    #[tokio::test]
    async fn answer_for_unknown_connection_is_invalid_state() {
        let h = harness(true, false);
        let sessions = SessionRegistry::new(Duration::from_secs(3600));
        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope(
                "r1",
                SignalRequest::AcceptAnswer {
                    connection_id: Uuid::new_v4(),
                    sdp: "v=0".into(),
                },
            ),
        )
        .await;
        assert!(matches!(
            reply.response,
            SignalResponse::Error {
                kind: ErrorKind::InvalidState,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn accept_offer_replies_with_answer() {
        let h = harness(true, false);
        let sessions = SessionRegistry::new(Duration::from_secs(3600));
        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope(
                "r1",
                SignalRequest::AcceptOffer {
                    sdp: "v=0 remote".into(),
                },
            ),
        )
        .await;
        assert!(matches!(reply.response, SignalResponse::Answer { ref sdp, .. } if sdp.starts_with("v=0 answer")));
        h.manager.close_all().await;
    }

    #[tokio::test]
    async fn open_session_creates_and_resumes() {
        let h = harness(true, false);
        let sessions = SessionRegistry::new(Duration::from_secs(3600));
        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope(
                "s1",
                SignalRequest::OpenSession {
                    session_id: None,
                    client_info: HashMap::new(),
                },
            ),
        )
        .await;
        let SignalResponse::Session { session_id, .. } = reply.response else {
            panic!("expected session");
        };

        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope(
                "s2",
                SignalRequest::OpenSession {
                    session_id: Some(session_id),
                    client_info: HashMap::new(),
                },
            ),
        )
        .await;
        assert!(matches!(
            reply.response,
            SignalResponse::Session {
                connection_count: 2,
                ..
            }
        ));

        let reply = dispatch(
            &h.manager,
            &sessions,
            envelope(
                "s3",
                SignalRequest::OpenSession {
                    session_id: Some(Uuid::new_v4()),
                    client_info: HashMap::new(),
                },
            ),
        )
        .await;
        assert!(matches!(
            reply.response,
            SignalResponse::Error {
                kind: ErrorKind::SessionNotFound,
                ..
            }
        ));
    }

    #[test]
    fn relay_url_encodes_token() {
        assert_eq!(
            relay_url("wss://relay.example.com/", "host-1", Some("a b&c")),
            "wss://relay.example.com/ws/agent/host-1?token=a%20b%26c"
        );
        assert_eq!(
            relay_url("ws://localhost:8080", "host-1", None),
            "ws://localhost:8080/ws/agent/host-1"
        );
    }

    #[test]
    fn relay_close_and_eof_reconnect() {
        assert!(matches!(
            classify(Some(Ok(Message::Close(None)))),
            RelayEvent::Disconnected(_)
        ));
        let frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::Away,
            reason: "restarting".into(),
        };
        let RelayEvent::Disconnected(reason) = classify(Some(Ok(Message::Close(Some(frame)))))
        else {
            panic!("close frame must not end the agent");
        };
        assert!(reason.contains("1001"));
        assert!(matches!(classify(None), RelayEvent::Disconnected(_)));
        assert!(matches!(
            classify(Some(Err(tungstenite::Error::ConnectionClosed))),
            RelayEvent::Disconnected(_)
        ));
    }

    #[test]
    fn only_shutdown_command_ends_signaling() {
        assert!(matches!(
            classify(Some(Ok(Message::text(r#"{"cmd":"shutdown"}"#)))),
            RelayEvent::Shutdown
        ));
        assert!(matches!(
            classify(Some(Ok(Message::text(
                r#"{"cmd":"signal","data":{"type":"create_offer","request_id":"r1"}}"#
            )))),
            RelayEvent::Request(SignalEnvelope {
                request: SignalRequest::CreateOffer,
                ..
            })
        ));
        assert!(matches!(
            classify(Some(Ok(Message::text("not json")))),
            RelayEvent::Ignored
        ));
        assert!(matches!(
            classify(Some(Ok(Message::Ping(Vec::new().into())))),
            RelayEvent::Ignored
        ));
    }

    #[test]
    fn duplicate_offers_detected_by_ufrag() {
        let mut dedup = OfferDedup::default();
        let offer = "v=0\r\na=ice-ufrag:abcd\r\na=ice-pwd:x\r\n";
        assert!(!dedup.is_duplicate(offer));
        assert!(dedup.is_duplicate(offer));
        assert!(!dedup.is_duplicate("v=0\r\na=ice-ufrag:efgh\r\n"));
        // No ufrag: never treated as a duplicate.
        assert!(!dedup.is_duplicate("v=0"));
        assert!(!dedup.is_duplicate("v=0"));
    }
}
