//! WebSocket transport and request dispatch

use axum::{
    extract::{ws::{Message, WebSocket}, ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cipherpost_shared::{
    ClientFrame, ErrorKind, GroupId, Notice, Outcome, Request, Response, ServerFrame, UserId, WireError,
};

use crate::auth::{challenge_message, verify_challenge};
use crate::config::ServerConfig;
use crate::db::DatabaseBackend;
use crate::envelopes::{GroupCipher, Payload};
use crate::error::{CoreError, CoreResult};
use crate::groups::RosterUpdate;

/// Outbound frames buffered per connection before sends start failing
const OUTBOUND_BUFFER: usize = 64;

/// Room for MessagePack framing around a maximum-size ciphertext
pub const FRAME_OVERHEAD: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Simple token-bucket rate limiter (not shared across threads)
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: std::time::Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: std::time::Instant::now(),
        }
    }

    /// Try to consume one token. Returns false if rate limit exceeded.
    pub fn try_consume(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection state
// ---------------------------------------------------------------------------

struct Connection {
    user: Option<UserId>,
    tx: mpsc::Sender<Vec<u8>>,
    auth_challenge: Vec<u8>,
    /// 30 burst, 10/s refill
    rate_limiter: RateLimiter,
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// Server state shared across connections
pub struct ServerState {
    pub db: Arc<dyn DatabaseBackend>,
    pub config: ServerConfig,
    /// Authenticated user → outbound frame channel
    pub connections: dashmap::DashMap<UserId, mpsc::Sender<Vec<u8>>>,
    /// Current total connection count (for enforcing max_connections)
    connection_count: AtomicUsize,
    /// Per-IP connection counts (for enforcing max_connections_per_ip)
    ip_connections: dashmap::DashMap<IpAddr, AtomicUsize>,
}

impl ServerState {
    pub fn new(db: Arc<dyn DatabaseBackend>, config: ServerConfig) -> Self {
        Self {
            db,
            config,
            connections: dashmap::DashMap::new(),
            connection_count: AtomicUsize::new(0),
            ip_connections: dashmap::DashMap::new(),
        }
    }

    /// Open WebSocket connections, authenticated or not
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Try to acquire a connection slot. Returns false if limits are exceeded.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> bool {
        let max_global = self.config.max_connections;
        let max_per_ip = self.config.max_connections_per_ip;

        // 0 = unlimited
        if max_global > 0 && self.connection_count.load(Ordering::Relaxed) >= max_global {
            return false;
        }

        if max_per_ip > 0 {
            let entry = self.ip_connections.entry(ip).or_insert_with(|| AtomicUsize::new(0));
            if entry.value().load(Ordering::Relaxed) >= max_per_ip {
                return false;
            }
            entry.value().fetch_add(1, Ordering::Relaxed);
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a connection slot.
    pub fn release_connection(&self, ip: IpAddr) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.ip_connections.get(&ip) {
            let prev = entry.value().fetch_sub(1, Ordering::Relaxed);
            if prev <= 1 {
                drop(entry);
                self.ip_connections.remove(&ip);
            }
        }
    }

    /// Push a payload-free hint to `user` if they are online.
    ///
    /// Never blocks: a full outbound buffer drops the hint, and the client
    /// still finds the data on its next poll.
    pub fn notify(&self, user: &UserId, notice: Notice) {
        let Some(entry) = self.connections.get(user) else {
            return;
        };
        if let Some(frame) = encode_frame(&ServerFrame::Notice { notice }) {
            if entry.value().try_send(frame).is_err() {
                debug!("Dropped notice for {} (buffer full or closed)", user.short());
            }
        }
    }

    fn notify_roster(&self, caller: &UserId, group_id: &GroupId, update: &RosterUpdate) {
        if update.position.is_none() {
            return;
        }
        for member in update.notify.iter().filter(|m| *m != caller) {
            self.notify(
                member,
                Notice::RosterChanged {
                    group_id: group_id.clone(),
                    epoch: update.epoch,
                },
            );
        }
    }

    /// Largest inbound WebSocket message accepted on a connection
    pub fn frame_limit(&self) -> usize {
        self.config.max_message_size.saturating_add(FRAME_OVERHEAD)
    }

    fn check_size(&self, field: &str, len: usize) -> CoreResult<()> {
        if len > self.config.max_message_size {
            return Err(CoreError::validation(format!(
                "{field} exceeds {} bytes",
                self.config.max_message_size
            )));
        }
        Ok(())
    }
}

fn encode_frame(frame: &ServerFrame) -> Option<Vec<u8>> {
    match rmp_serde::to_vec_named(frame) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("Failed to encode server frame: {}", e);
            None
        }
    }
}

fn reply(id: u64, outcome: Outcome) -> Option<Vec<u8>> {
    encode_frame(&ServerFrame::Reply { id, outcome })
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Handle WebSocket upgrade, enforcing connection limits before accepting
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();

    if !state.try_acquire_connection(ip) {
        warn!("Connection rejected for {}: limit exceeded", ip);
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let frame_limit = state.frame_limit();
    ws.max_message_size(frame_limit)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, addr: SocketAddr) {
    let ip = addr.ip();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);

    let auth_challenge: Vec<u8> = {
        use rand::rngs::OsRng;
        use rand::RngCore;
        let mut nonce = vec![0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        nonce
    };

    let mut conn = Connection {
        user: None,
        tx: tx.clone(),
        auth_challenge: auth_challenge.clone(),
        rate_limiter: RateLimiter::new(30.0, 10.0),
    };

    info!("New WebSocket connection from {}", addr);

    let challenge = encode_frame(&ServerFrame::AuthChallenge {
        nonce: auth_challenge,
    });
    let sent = match challenge {
        Some(frame) => ws_sender.send(Message::Binary(frame)).await.is_ok(),
        None => false,
    };
    if !sent {
        error!("Failed to send auth challenge to {}", addr);
        state.release_connection(ip);
        return;
    }

    // Forward outbound frames and send periodic pings
    let ping_interval_secs = state.config.ws_ping_interval;
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker =
            tokio::time::interval(std::time::Duration::from_secs(ping_interval_secs));
        ping_ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(data) => {
                            if ws_sender.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let auth_timeout = std::time::Duration::from_secs(state.config.auth_timeout_seconds);
    let auth_deadline = tokio::time::Instant::now() + auth_timeout;

    loop {
        let next_msg = if conn.user.is_none() {
            match tokio::time::timeout_at(auth_deadline, ws_receiver.next()).await {
                Ok(msg) => msg,
                Err(_) => {
                    warn!("Auth timeout for {}, dropping connection", addr);
                    break;
                }
            }
        } else {
            ws_receiver.next().await
        };

        match next_msg {
            Some(Ok(msg)) => match msg {
                Message::Binary(data) => {
                    if let Some(frame) = handle_binary_message(&data, &mut conn, &state).await {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Text(_) => { /* ignore text frames */ }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => { /* axum auto-responds to pings */ }
            },
            Some(Err(e)) => {
                debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            None => break,
        }
    }

    if let Some(ref user) = conn.user {
        // A newer connection of the same user may have replaced ours
        state
            .connections
            .remove_if(user, |_, sender| sender.same_channel(&conn.tx));
        info!("User {} disconnected ({})", user.short(), addr);
    }

    state.release_connection(ip);
    forward_task.abort();
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// Decode one client frame and produce the encoded reply.
async fn handle_binary_message(
    data: &[u8],
    conn: &mut Connection,
    state: &Arc<ServerState>,
) -> Option<Vec<u8>> {
    let frame: ClientFrame = match rmp_serde::from_slice(data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Malformed frame: {}", e);
            return reply(
                0,
                Outcome::Err(WireError::new(ErrorKind::Validation, "malformed frame")),
            );
        }
    };
    let id = frame.id;

    if !matches!(frame.request, Request::Ping | Request::Auth { .. })
        && !conn.rate_limiter.try_consume()
    {
        return reply(
            id,
            Outcome::Err(WireError::new(ErrorKind::Conflict, "rate limit exceeded, slow down")),
        );
    }

    let outcome = match frame.request {
        Request::Auth { pubkey, signature } => {
            if conn.user.is_some() {
                Err(CoreError::validation("connection is already authenticated"))
            } else {
                handle_auth(&pubkey, &signature, conn, state).await
            }
        }
        Request::Ping => Ok(Response::Pong),
        request => match conn.user.as_ref() {
            None => Err(CoreError::permission("not authenticated")),
            Some(user) => {
                let name = request.name();
                let result = dispatch(state, user, request).await;
                match &result {
                    Err(e @ CoreError::Storage(_)) => {
                        error!("{} from {} failed: {}", name, user.short(), e)
                    }
                    Err(e) => debug!("{} from {} rejected: {}", name, user.short(), e),
                    Ok(_) => {}
                }
                result
            }
        },
    };

    let outcome = match outcome {
        Ok(response) => Outcome::Ok(response),
        Err(e) => Outcome::Err(e.to_wire()),
    };
    reply(id, outcome)
}

async fn handle_auth(
    pubkey: &[u8],
    signature: &[u8],
    conn: &mut Connection,
    state: &Arc<ServerState>,
) -> CoreResult<Response> {
    if !verify_challenge(pubkey, signature, &challenge_message(&conn.auth_challenge)) {
        return Err(CoreError::permission("invalid authentication signature"));
    }

    let user = UserId::from_pubkey(pubkey);
    state.db.store_user(&user, Some(pubkey)).await?;
    let pending = state.db.pending_count(&user).await?;

    state.connections.insert(user.clone(), conn.tx.clone());
    conn.user = Some(user.clone());

    info!("User {} authenticated ({} pending)", user.short(), pending);
    Ok(Response::AuthSuccess {
        user_id: user,
        pending,
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Execute one request on behalf of an authenticated `caller`.
///
/// Independent of any socket so it can be driven directly. Side effects
/// beyond the store are limited to best-effort notices for online users.
pub async fn dispatch(
    state: &ServerState,
    caller: &UserId,
    request: Request,
) -> CoreResult<Response> {
    let db = &state.db;

    match request {
        Request::Auth { .. } => Err(CoreError::validation("connection is already authenticated")),
        Request::Ping => Ok(Response::Pong),

        // -- Key directory ---------------------------------------------------
        Request::UploadBundle {
            identity_key,
            signed_pre_key,
            one_time_pre_keys,
            registration_id,
        } => {
            let stored_count = db
                .upload_bundle(
                    caller,
                    &identity_key,
                    &signed_pre_key,
                    &one_time_pre_keys,
                    registration_id,
                    state.config.max_one_time_prekeys,
                )
                .await?;
            Ok(Response::BundleStored { stored_count })
        }
        Request::FetchBundle { user_id } => {
            let bundle = db.fetch_bundle(&user_id).await?;
            Ok(Response::Bundle { bundle })
        }
        Request::CheckBundleHealth => {
            let health = db
                .check_bundle_health(caller, state.config.prekey_low_water_mark)
                .await?;
            Ok(Response::BundleHealth { health })
        }

        // -- Envelopes and delivery ------------------------------------------
        Request::SendDirect {
            recipient_id,
            ciphertext,
            content_type,
            session_id,
            ephemeral_timer,
            expires_at,
            reply_to,
        } => {
            state.check_size("ciphertext", ciphertext.len())?;
            let payload = Payload {
                ciphertext,
                content_type,
                session_id,
                ephemeral_timer: ephemeral_timer.unwrap_or(0),
                expires_at,
                reply_to,
            };
            let (envelope_id, sent_at) = db.submit_direct(caller, &recipient_id, &payload).await?;
            state.notify(&recipient_id, Notice::PendingDeliveries);
            Ok(Response::Sent {
                envelope_id,
                sent_at,
            })
        }
        Request::PollPending { limit } => {
            let envelopes = db.drain_and_mark(caller, limit).await?;
            Ok(Response::Pending { envelopes })
        }
        Request::MarkRead { envelope_id } => {
            let changed = db.mark_read(envelope_id, caller).await?;
            Ok(Response::ReadMarked { changed })
        }
        Request::Destroy { envelope_id } => {
            let destroyed = db.destroy(envelope_id, Some(caller)).await?;
            Ok(Response::Destroyed { destroyed })
        }
        Request::GetEnvelope { envelope_id } => {
            let envelope = db.get_envelope(envelope_id, caller).await?;
            Ok(Response::Envelope { envelope })
        }

        // -- Groups ----------------------------------------------------------
        Request::CreateGroup {
            group_id,
            name,
            member_ids,
            description,
            only_admins_post,
        } => {
            let update = db
                .create_group(
                    &group_id,
                    &name,
                    caller,
                    &member_ids,
                    description.as_deref(),
                    only_admins_post,
                )
                .await?;
            state.notify_roster(caller, &group_id, &update);
            Ok(Response::GroupCreated { group_id })
        }
        Request::AddMember {
            group_id,
            user_id,
            admin,
        } => {
            let update = db.add_member(&group_id, caller, &user_id, admin).await?;
            state.notify_roster(caller, &group_id, &update);
            Ok(Response::GroupUpdated {
                group_id,
                epoch: update.epoch,
            })
        }
        Request::RemoveMember { group_id, user_id } => {
            let update = db.remove_member(&group_id, caller, &user_id).await?;
            state.notify_roster(caller, &group_id, &update);
            Ok(Response::GroupUpdated {
                group_id,
                epoch: update.epoch,
            })
        }
        Request::LeaveGroup { group_id } => {
            let update = db.leave_group(&group_id, caller).await?;
            state.notify_roster(caller, &group_id, &update);
            Ok(Response::GroupUpdated {
                group_id,
                epoch: update.epoch,
            })
        }
        Request::SetAdmin {
            group_id,
            user_id,
            admin,
        } => {
            let update = db.set_admin(&group_id, caller, &user_id, admin).await?;
            state.notify_roster(caller, &group_id, &update);
            Ok(Response::GroupUpdated {
                group_id,
                epoch: update.epoch,
            })
        }
        Request::SetPostingPolicy {
            group_id,
            only_admins_post,
        } => {
            let update = db
                .set_posting_policy(&group_id, caller, only_admins_post)
                .await?;
            state.notify_roster(caller, &group_id, &update);
            Ok(Response::GroupUpdated {
                group_id,
                epoch: update.epoch,
            })
        }
        Request::GetGroup { group_id } => {
            let group = db.get_group(&group_id, caller).await?;
            Ok(Response::Group { group })
        }
        Request::ListMembers { group_id } => {
            let members = db.list_members(&group_id, caller).await?;
            Ok(Response::Members { group_id, members })
        }
        Request::DistributeSenderKey {
            group_id,
            recipient_id,
            encrypted_key,
            message_type,
            epoch,
        } => {
            state.check_size("encrypted_key", encrypted_key.len())?;
            db.distribute_sender_key(
                &group_id,
                caller,
                &recipient_id,
                &encrypted_key,
                message_type,
                epoch,
            )
            .await?;
            Ok(Response::SenderKeyStored { ok: true })
        }
        Request::FetchSenderKeys { group_id } => {
            let records = db.fetch_sender_keys(&group_id, caller).await?;
            Ok(Response::SenderKeys { records })
        }
        Request::DesynchronizedMembers { group_id } => {
            let (epoch, members) = db.desynchronized_members(&group_id, caller).await?;
            Ok(Response::Desynchronized {
                group_id,
                epoch,
                members,
            })
        }
        Request::SendGroupMessage {
            group_id,
            ciphertext,
            sender_key_id,
            iteration,
            iv,
            content_type,
            ephemeral_timer,
            expires_at,
            reply_to,
        } => {
            state.check_size("ciphertext", ciphertext.len())?;
            let cipher = GroupCipher {
                sender_key_id,
                iteration,
                iv,
            };
            let payload = Payload {
                ciphertext,
                content_type,
                session_id: None,
                ephemeral_timer: ephemeral_timer.unwrap_or(0),
                expires_at,
                reply_to,
            };
            let (message_id, sent_at) = db
                .send_group_message(&group_id, caller, &cipher, &payload)
                .await?;
            Ok(Response::GroupMessageSent {
                message_id,
                sent_at,
            })
        }
        Request::ReadGroupStream {
            group_id,
            after_id,
            limit,
        } => {
            let messages = db
                .read_group_stream(&group_id, caller, after_id, limit)
                .await?;
            Ok(Response::GroupStream { group_id, messages })
        }

        // -- Device linking --------------------------------------------------
        Request::IssueDeviceCode => {
            let (code, expires_at) = db
                .issue_device_code(caller, state.config.device_code_ttl_seconds)
                .await?;
            Ok(Response::DeviceCode { code, expires_at })
        }
        Request::RedeemDeviceCode { code } => {
            let user_id = db.redeem_device_code(&code, caller).await?;
            Ok(Response::DeviceLinked { user_id })
        }
    }
}
