//! The session/protocol server.
//!
//! One task per accepted connection runs the multiplexer accept loop; one
//! task per sub-stream handles a single request/response. Per-session state
//! tracks in-flight deliveries, owned ephemeral mailboxes, and last-will
//! messages; cleanup runs exactly once on Close, EOF, or server shutdown,
//! nacking everything the session still held.

use crate::core::duration::parse_duration;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::net::mux::{BoxedIo, MuxSession, MuxStream, Side};
use crate::net::tls::TlsServerConfig;
use crate::proto::{self, FrameTag};
use crate::registry::{Backend, Delivery};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

pub struct Server {
    backend: Arc<dyn Backend>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Bind the listener; serving starts with [`Server::spawn`] or
    /// [`Server::serve`].
    pub async fn bind(
        addr: &str,
        backend: Arc<dyn Backend>,
        tls: Option<TlsServerConfig>,
    ) -> Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        Server::from_listener(listener, backend, tls)
    }

    /// Wrap an already-bound listener.
    pub fn from_listener(
        listener: TcpListener,
        backend: Arc<dyn Backend>,
        tls: Option<TlsServerConfig>,
    ) -> Result<Server> {
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Server {
            backend,
            listener: Mutex::new(Some(listener)),
            local_addr,
            tls: tls.map(|t| t.acceptor()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop on a background task.
    pub fn spawn(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        tokio::spawn(accept_loop(
            listener,
            self.backend.clone(),
            self.tls.clone(),
            self.shutdown.subscribe(),
        ));
    }

    /// Run the accept loop on the current task until shutdown.
    pub async fn serve(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        accept_loop(
            listener,
            self.backend.clone(),
            self.tls.clone(),
            self.shutdown.subscribe(),
        )
        .await;
    }

    /// Stop accepting and unwind every live session.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    backend: Arc<dyn Backend>,
    tls: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let conn = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.changed() => break,
        };
        let (stream, peer) = match conn {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "accept failed");
                break;
            }
        };
        debug!(%peer, "accepted connection");

        let backend = backend.clone();
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let io: BoxedIo = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => Box::new(tls_stream),
                    Err(err) => {
                        warn!(%peer, error = %err, "tls handshake failed");
                        return;
                    }
                },
                None => Box::new(stream),
            };
            handle_connection(io, backend, shutdown).await;
            debug!(%peer, "session ended");
        });
    }
}

/// Per-connection state guarded by the session lock.
#[derive(Default)]
struct SessionState {
    inflight: HashMap<String, Delivery>,
    ephemerals: Vec<String>,
    ephemeral_lwts: HashMap<String, Message>,
    lwt: Option<Message>,
    closed: bool,
}

struct Session {
    backend: Arc<dyn Backend>,
    state: Mutex<SessionState>,
    /// Fired once when the session unwinds; cancels outstanding long-polls.
    cancel: watch::Sender<bool>,
}

impl Session {
    fn new(backend: Arc<dyn Backend>) -> Session {
        let (cancel, _) = watch::channel(false);
        Session {
            backend,
            state: Mutex::new(SessionState::default()),
            cancel,
        }
    }

    fn cancel_token(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Session teardown, at most once: inject the session LWT, nack every
    /// in-flight delivery, then abandon owned ephemerals (emitting their
    /// LWTs). Nacks come first so an ephemeral's own backlog is discarded
    /// cleanly by the abandon that follows.
    async fn cleanup(&self) {
        let (lwt, inflight, ephemerals, mut ephemeral_lwts) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.lwt.take(),
                std::mem::take(&mut state.inflight),
                std::mem::take(&mut state.ephemerals),
                std::mem::take(&mut state.ephemeral_lwts),
            )
        };
        let _ = self.cancel.send(true);

        if let Some(lwt) = lwt {
            self.inject_lwt(lwt).await;
        }

        for (id, delivery) in inflight {
            if let Err(err) = delivery.nack().await {
                warn!(id = %id, error = %err, "nack on session death failed");
            }
        }

        for name in ephemerals {
            if let Err(err) = self.backend.abandon(&name).await {
                warn!(name = %name, error = %err, "abandon of ephemeral failed");
            }
            if let Some(lwt) = ephemeral_lwts.remove(&name) {
                self.inject_lwt(lwt).await;
            }
        }
    }

    /// Deliver a last-will message to its reply-to mailbox, clearing the
    /// reply-to. A missing mailbox is not an error: a death notification
    /// into a mailbox that has itself gone is simply dropped.
    async fn inject_lwt(&self, mut lwt: Message) {
        let target = std::mem::take(&mut lwt.reply_to);
        if target.is_empty() {
            return;
        }
        match self.backend.push(&target, &lwt).await {
            Ok(()) | Err(Error::NoMailbox) => {}
            Err(err) => warn!(target = %target, error = %err, "lwt injection failed"),
        }
    }

    /// Record a delivery as in-flight for this session. A delivery that
    /// races session teardown is nacked immediately: cleanup has already
    /// drained the map and would never see it.
    async fn track_delivery(&self, delivery: Delivery) -> Message {
        let msg = delivery.message.clone();
        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(delivery)
            } else {
                state
                    .inflight
                    .insert(msg.message_id.as_str().to_string(), delivery);
                None
            }
        };
        if let Some(delivery) = rejected {
            if let Err(err) = delivery.nack().await {
                warn!(error = %err, "nack of post-close delivery failed");
            }
        }
        msg
    }
}

async fn handle_connection(
    io: BoxedIo,
    backend: Arc<dyn Backend>,
    mut server_shutdown: watch::Receiver<bool>,
) {
    let mux = Arc::new(MuxSession::new(io, Side::Server));
    let session = Arc::new(Session::new(backend));

    loop {
        let stream = tokio::select! {
            stream = mux.accept() => stream,
            _ = server_shutdown.changed() => break,
        };
        let Some(stream) = stream else { break };
        tokio::spawn(handle_stream(stream, session.clone(), mux.clone()));
    }

    session.cleanup().await;
    mux.close();
}

async fn handle_stream(mut stream: MuxStream, session: Arc<Session>, mux: Arc<MuxSession>) {
    let Some(frame) = stream.recv().await else {
        return;
    };

    let parsed = proto::split_frame(&frame).map(|(tag, body)| (tag, body.to_vec()));
    let (tag, body) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            send_error(&mut stream, &err).await;
            return;
        }
    };

    // Close replies before the session is torn down underneath it.
    if tag == FrameTag::Close {
        session.cleanup().await;
        let _ = stream.send(proto::encode_bare(FrameTag::Success)).await;
        let _ = stream.finish().await;
        mux.close();
        return;
    }

    match dispatch(tag, &body, &session).await {
        Ok(reply) => {
            if stream.send(reply).await.is_ok() {
                let _ = stream.finish().await;
            }
        }
        Err(err) => send_error(&mut stream, &err).await,
    }
}

/// Tagged Error reply on the stream; the multiplexer stays up.
async fn send_error(stream: &mut MuxStream, err: &Error) {
    let body = proto::ErrorBody {
        error: err.to_string(),
    };
    if let Ok(frame) = proto::encode_frame(FrameTag::Error, &body) {
        if stream.send(frame).await.is_ok() {
            let _ = stream.finish().await;
        }
    }
}

async fn dispatch(tag: FrameTag, body: &[u8], session: &Arc<Session>) -> Result<Bytes> {
    match tag {
        FrameTag::Declare => {
            let req: proto::Declare = proto::decode_body(body)?;
            session.backend.declare(&req.name).await?;
            Ok(proto::encode_bare(FrameTag::Success))
        }
        FrameTag::EphemeralDeclare => {
            let req: proto::Declare = proto::decode_body(body)?;
            session.backend.declare(&req.name).await?;
            let mut state = session.state.lock();
            if !state.ephemerals.iter().any(|n| *n == req.name) {
                state.ephemerals.push(req.name);
            }
            Ok(proto::encode_bare(FrameTag::Success))
        }
        FrameTag::Abandon => {
            let req: proto::Abandon = proto::decode_body(body)?;
            session.backend.abandon(&req.name).await?;
            let lwt = {
                let mut state = session.state.lock();
                state.ephemerals.retain(|n| *n != req.name);
                state.ephemeral_lwts.remove(&req.name)
            };
            if let Some(lwt) = lwt {
                session.inject_lwt(lwt).await;
            }
            Ok(proto::encode_bare(FrameTag::Success))
        }
        FrameTag::Poll => {
            let req: proto::Poll = proto::decode_body(body)?;
            let result = if req.name == ":lwt" {
                // Peek at the session-level last will.
                proto::PollResult {
                    message: session.state.lock().lwt.clone(),
                }
            } else {
                match session.backend.poll(&req.name).await? {
                    Some(delivery) => proto::PollResult {
                        message: Some(session.track_delivery(delivery).await),
                    },
                    None => proto::PollResult::default(),
                }
            };
            proto::encode_frame(FrameTag::PollResult, &result)
        }
        FrameTag::LongPoll => {
            let req: proto::LongPoll = proto::decode_body(body)?;
            let wait = parse_duration(&req.duration)?;
            let cancel = session.cancel_token();
            let result = match session
                .backend
                .long_poll_cancelable(&req.name, wait, cancel)
                .await?
            {
                Some(delivery) => proto::PollResult {
                    message: Some(session.track_delivery(delivery).await),
                },
                None => proto::PollResult::default(),
            };
            proto::encode_frame(FrameTag::PollResult, &result)
        }
        FrameTag::Push => {
            let req: proto::Push = proto::decode_body(body)?;
            handle_push(session, &req.name, req.message).await?;
            Ok(proto::encode_bare(FrameTag::Success))
        }
        FrameTag::Ack => {
            let req: proto::Ack = proto::decode_body(body)?;
            settle(session, req.message_id.as_str(), true).await?;
            Ok(proto::encode_bare(FrameTag::Success))
        }
        FrameTag::Nack => {
            let req: proto::Nack = proto::decode_body(body)?;
            settle(session, req.message_id.as_str(), false).await?;
            Ok(proto::encode_bare(FrameTag::Success))
        }
        FrameTag::Stats => {
            let in_flight = session.state.lock().inflight.len() as u64;
            proto::encode_frame(FrameTag::StatsResult, &proto::StatsResult { in_flight })
        }
        _ => Err(Error::Protocol(format!(
            "unexpected request tag {}",
            tag.as_u8()
        ))),
    }
}

async fn handle_push(session: &Arc<Session>, name: &str, msg: Message) -> Result<()> {
    if !name.starts_with(':') {
        return session.backend.push(name, &msg).await;
    }

    match name {
        ":lwt" => {
            let mut state = session.state.lock();
            if msg.correlation_id.is_empty() {
                // Session-wide last will.
                state.lwt = Some(msg);
            } else {
                // Per-ephemeral last will; the target must be an ephemeral
                // this session declared.
                let target = msg.correlation_id.clone();
                if !state.ephemerals.iter().any(|n| *n == target) {
                    return Err(Error::NoMailbox);
                }
                state.ephemeral_lwts.insert(target, msg);
            }
            Ok(())
        }
        ":subscribe" | ":publish" => session.backend.push(name, &msg).await,
        _ => Err(Error::UnknownSystemMailbox(name.to_string())),
    }
}

async fn settle(session: &Arc<Session>, id: &str, ack: bool) -> Result<()> {
    let delivery = session.state.lock().inflight.remove(id);
    let Some(delivery) = delivery else {
        return Err(Error::UnknownMessage);
    };
    let settled = if ack {
        delivery.ack().await
    } else {
        delivery.nack().await
    };
    match settled {
        Ok(()) => Ok(()),
        Err(err) => {
            // Keep the delivery so session cleanup can still nack it.
            session
                .state
                .lock()
                .inflight
                .insert(id.to_string(), delivery);
            Err(err)
        }
    }
}
