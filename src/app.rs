use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{
    sink::SinkExt,
    stream::{SplitStream, StreamExt},
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    auth::{bearer_token, Identity, IdentityResolver, PgIdentityResolver, StaticIdentityResolver},
    channel::channel_id,
    config::{Config, StoreBackend},
    error::{ChatError, ChatResult},
    hub::{ChatHub, HubOptions},
    recommendation::{CatalogClient, RecommendationPipeline},
    router::ConnectionHandle,
    store::{MemoryMessageStore, MessageStore, PgMessageStore},
    types::{
        AuthOk, AuthRequest, ChannelHistory, ChannelRef, ConversationsQuery,
        DeleteConversationEvent, EventEnvelopeIn, HistoryQuery, HistoryRequest, MessageAck,
        MessageWarning, PresenceStatus, PresenceUpdate, PublishBody, SendMessageEvent,
        ServerEvent, StatusBody, Topic, TopicFilter, WsQuery,
    },
};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AppState {
    pub hub: ChatHub,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn decode<T: DeserializeOwned>(data: Value) -> ChatResult<T> {
    serde_json::from_value(data).map_err(|err| ChatError::validation(err.to_string()))
}

fn parse_filter(raw: Option<&str>) -> ChatResult<Option<TopicFilter>> {
    raw.map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::parse::<TopicFilter>)
        .transpose()
}

async fn auth_from_headers(state: &AppState, headers: &HeaderMap) -> ChatResult<Identity> {
    let token = bearer_token(headers).ok_or(ChatError::Unauthenticated)?;
    state.hub.authenticate(&token).await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn get_messages(
    Path((topic, customer_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ChatError> {
    let identity = auth_from_headers(&state, &headers).await?;
    let topic = topic.parse::<Topic>()?;
    let messages = state
        .hub
        .fetch_history(&identity, topic, &customer_id, query.limit)
        .await?;
    Ok(Json(json!({
        "channelId": channel_id(topic, &customer_id)?,
        "messages": messages,
    })))
}

async fn post_message(
    Path((topic, customer_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PublishBody>,
) -> Result<Response, ChatError> {
    let identity = auth_from_headers(&state, &headers).await?;
    let topic = topic.parse::<Topic>()?;
    let published = state
        .hub
        .publish(&identity, topic, &customer_id, body)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": published.message,
            "delivered": published.delivered,
            "warning": published.warning.map(|err| err.to_string()),
        })),
    )
        .into_response())
}

async fn post_read(
    Path((topic, customer_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ChatError> {
    let identity = auth_from_headers(&state, &headers).await?;
    let topic = topic.parse::<Topic>()?;
    let conversation = state.hub.mark_read(&identity, topic, &customer_id).await?;
    Ok(Json(json!({ "ok": true, "conversation": conversation })))
}

async fn list_conversations(
    Query(query): Query<ConversationsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ChatError> {
    let identity = auth_from_headers(&state, &headers).await?;
    let filter = parse_filter(query.topic.as_deref())?;
    let conversations = state.hub.list_conversations(&identity, filter).await?;
    Ok(Json(json!({ "conversations": conversations })))
}

async fn delete_conversation(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ChatError> {
    let identity = auth_from_headers(&state, &headers).await?;
    state.hub.delete_conversation(&identity, &channel_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ChatError> {
    auth_from_headers(&state, &headers).await?;
    let status = state.hub.presence().await;
    Ok(Json(json!({ "status": status })))
}

async fn put_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ChatError> {
    let identity = auth_from_headers(&state, &headers).await?;
    let status = body.status.parse::<PresenceStatus>()?;
    let status = state.hub.set_presence(&identity, status).await?;
    Ok(Json(json!({ "status": status })))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let token = bearer_token(&headers).or(query.token);
    let identity = match token {
        Some(token) => match state.hub.authenticate(&token).await {
            Ok(identity) => Some(identity),
            Err(err) => return err.into_response(),
        },
        None => None,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Waits for the first `auth` event on a socket opened without a token.
async fn await_auth(
    state: &AppState,
    ws_receiver: &mut SplitStream<WebSocket>,
) -> ChatResult<Identity> {
    loop {
        let next = tokio::time::timeout(AUTH_TIMEOUT, ws_receiver.next())
            .await
            .map_err(|_| ChatError::Unauthenticated)?;
        let text = match next {
            Some(Ok(WsMessage::Text(text))) => text.to_string(),
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                return Err(ChatError::Transport("closed before auth".into()))
            }
            Some(Ok(_)) => continue,
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        match envelope.event.as_str() {
            "auth" => {
                let request: AuthRequest = decode(envelope.data)?;
                return state.hub.authenticate(&request.token).await;
            }
            "ping" => continue,
            _ => return Err(ChatError::Unauthenticated),
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Option<Identity>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let identity = match identity {
        Some(identity) => identity,
        None => match await_auth(&state, &mut ws_receiver).await {
            Ok(identity) => identity,
            Err(err) => {
                debug!(error = %err, "socket closed without authenticating");
                if let Some(payload) = ServerEvent::error(&err).to_json() {
                    let _ = ws_sender.send(WsMessage::Text(payload.into())).await;
                }
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                return;
            }
        },
    };

    let (conn, mut rx) = state.hub.connect(identity);
    conn.send(ServerEvent::AuthOk(AuthOk {
        user_id: conn.identity().user_id.clone(),
        role: conn.role(),
    }));

    let closed = conn.closed().clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(payload) = event.to_json() else { continue };
                    if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.send(WsMessage::Close(None)).await;
    });

    loop {
        let next = tokio::select! {
            _ = conn.closed().cancelled() => break,
            next = ws_receiver.next() => next,
        };
        let text = match next {
            Some(Ok(WsMessage::Text(text))) => text.to_string(),
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        if let Err(err) = handle_event(&state, &conn, envelope).await {
            if matches!(err, ChatError::Authorization(_)) {
                warn!(connection = conn.id(), error = %err, "rejected");
            }
            conn.send(ServerEvent::error(&err));
        }
    }

    state.hub.disconnect(&conn).await;
    send_task.abort();
}

async fn handle_event(
    state: &AppState,
    conn: &ConnectionHandle,
    envelope: EventEnvelopeIn,
) -> ChatResult<()> {
    let hub = &state.hub;
    match envelope.event.as_str() {
        "channel:join" => {
            let target: ChannelRef = decode(envelope.data)?;
            hub.subscribe(conn, target.topic.parse::<Topic>()?, &target.customer_id)
                .await?;
        }
        "channel:leave" => {
            let target: ChannelRef = decode(envelope.data)?;
            hub.leave(conn, target.topic.parse::<Topic>()?, &target.customer_id)
                .await?;
        }
        "channel:history" => {
            let request: HistoryRequest = decode(envelope.data)?;
            let topic = request.topic.parse::<Topic>()?;
            let messages = hub
                .fetch_history(conn.identity(), topic, &request.customer_id, request.limit)
                .await?;
            conn.send(ServerEvent::ChannelHistory(ChannelHistory {
                channel_id: channel_id(topic, &request.customer_id)?,
                messages,
            }));
        }
        "message:send" => {
            let send: SendMessageEvent = decode(envelope.data)?;
            let topic = send.topic.parse::<Topic>()?;
            let published = hub
                .publish(conn.identity(), topic, &send.customer_id, send.body)
                .await?;
            let channel_id = published.message.channel_id.clone();
            let id = published.message.id.clone();
            conn.send(ServerEvent::MessageAck(MessageAck {
                channel_id: channel_id.clone(),
                id: id.clone(),
            }));
            if let Some(err) = published.warning {
                conn.send(ServerEvent::MessageWarning(MessageWarning {
                    channel_id,
                    id,
                    message: err.to_string(),
                }));
            }
        }
        "channel:read" => {
            let target: ChannelRef = decode(envelope.data)?;
            hub.mark_read(conn.identity(), target.topic.parse::<Topic>()?, &target.customer_id)
                .await?;
        }
        "directory:join" => {
            let query: ConversationsQuery = decode(envelope.data).unwrap_or_default();
            let filter = parse_filter(query.topic.as_deref())?;
            hub.watch_directory(conn, filter).await?;
        }
        "presence:set" => {
            let body: StatusBody = decode(envelope.data)?;
            let status = hub
                .set_presence(conn.identity(), body.status.parse::<PresenceStatus>()?)
                .await?;
            conn.send(ServerEvent::PresenceStatus(PresenceUpdate { status }));
        }
        "conversation:delete" => {
            let target: DeleteConversationEvent = decode(envelope.data)?;
            hub.delete_conversation(conn.identity(), &target.channel_id)
                .await?;
        }
        "ping" => {
            conn.send(ServerEvent::Pong);
        }
        // Already authenticated; a repeated auth is a no-op.
        "auth" => {}
        other => debug!(connection = conn.id(), event = %other, "ignoring unknown event"),
    }
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/channels/{topic}/{customer_id}/messages",
            get(get_messages).post(post_message),
        )
        .route("/api/channels/{topic}/{customer_id}/read", post(post_read))
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/{channel_id}",
            axum::routing::delete(delete_conversation),
        )
        .route("/api/presence", get(get_presence).put(put_presence))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn static_identities(config: &Config) -> anyhow::Result<StaticIdentityResolver> {
    let resolver = config
        .static_tokens
        .as_deref()
        .map(StaticIdentityResolver::parse)
        .transpose()
        .context("invalid CHAT_STATIC_TOKENS")?
        .unwrap_or_default();
    Ok(resolver)
}

/// Wires the hub and its collaborators from configuration.
pub async fn build_hub(config: &Config) -> anyhow::Result<ChatHub> {
    let (store, identities): (Arc<dyn MessageStore>, Arc<dyn IdentityResolver>) =
        match config.store {
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .context("postgres store needs DATABASE_URL or POSTGRES_* settings")?;
                let db = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("failed to connect to postgres")?;
                let store = PgMessageStore::new(db.clone());
                store.migrate().await.context("failed to run migrations")?;
                let identities: Arc<dyn IdentityResolver> = if config.static_tokens.is_some() {
                    Arc::new(static_identities(config)?)
                } else {
                    Arc::new(PgIdentityResolver::new(db))
                };
                (Arc::new(store), identities)
            }
            StoreBackend::Memory => {
                let identities = static_identities(config)?;
                if identities.is_empty() {
                    warn!("in-memory store without CHAT_STATIC_TOKENS; every connection will be rejected");
                }
                (Arc::new(MemoryMessageStore::new()), Arc::new(identities))
            }
        };

    let catalog = config
        .catalog_base_url
        .as_deref()
        .map(|url| CatalogClient::new(url))
        .transpose()
        .context("failed to build catalog client")?;

    let hub = ChatHub::new(
        store,
        identities,
        RecommendationPipeline::new(catalog),
        HubOptions {
            queue_capacity: config.outbound_queue_capacity,
            history_limit: config.history_limit,
            presence_auto_offline: config.presence_auto_offline,
        },
    );
    hub.load_directory()
        .await
        .context("failed to load conversation directory")?;
    Ok(hub)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

pub async fn run() -> anyhow::Result<()> {
    let config = Config::from_env();
    let state = Arc::new(AppState {
        hub: build_hub(&config).await?,
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        port = config.port,
        store = ?config.store,
        auto_offline = config.presence_auto_offline,
        "storefront chat listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failure")?;
    Ok(())
}
