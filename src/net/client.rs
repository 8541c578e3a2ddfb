//! The reconnecting client and the feature client built on top of it.
//!
//! A [`Client`] lazily dials a multiplexed session; any call that finds the
//! session absent or dead re-dials. Each protocol call opens a fresh
//! sub-stream, writes one request, reads exactly one reply, and closes the
//! sub-stream. Server-reported errors surface as [`Error::Remote`].

use crate::core::duration::format_duration;
use crate::core::ids::{random_mailbox_name, MessageId};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::net::mux::{BoxedIo, MuxSession, Side};
use crate::net::tls::TlsClientConfig;
use crate::proto::{self, FrameTag};
use crate::registry::{cancel_fired, AckSource, Delivery};
use crate::router::Pusher;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// Client-side hint: names with this suffix are declared ephemerally.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Cycle length of the user-space long-poll loops in [`FeatureClient`].
const RECEIVE_CYCLE: Duration = Duration::from_secs(60);

struct ClientInner {
    addr: String,
    tls: Option<TlsClientConfig>,
    session: Mutex<Option<Arc<MuxSession>>>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// A client for `addr`. Nothing is dialed until the first call.
    pub fn new(addr: impl Into<String>) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                addr: addr.into(),
                tls: None,
                session: Mutex::new(None),
            }),
        }
    }

    /// Dial over TLS. Applies only before the first call.
    pub fn with_tls(self, tls: TlsClientConfig) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                addr: self.inner.addr.clone(),
                tls: Some(tls),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    async fn session(&self) -> Result<Arc<MuxSession>> {
        let mut guard = self.inner.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_alive() {
                return Ok(session.clone());
            }
        }

        let stream = TcpStream::connect(&self.inner.addr).await?;
        let io: BoxedIo = match &self.inner.tls {
            Some(tls) => {
                let (connector, server_name) = tls.connector()?;
                Box::new(
                    connector
                        .connect(server_name, stream)
                        .await
                        .map_err(|e| Error::Tls(e.to_string()))?,
                )
            }
            None => Box::new(stream),
        };
        let session = Arc::new(MuxSession::new(io, Side::Client));
        *guard = Some(session.clone());
        debug!(addr = %self.inner.addr, "dialed session");
        Ok(session)
    }

    /// Drop the session handle so the next call reconnects.
    async fn forget(&self) {
        *self.inner.session.lock().await = None;
    }

    async fn call(&self, request: Bytes) -> Result<(FrameTag, Vec<u8>)> {
        let session = self.session().await?;
        let mut stream = session.open()?;

        let outcome = async {
            stream.send(request).await?;
            let Some(reply) = stream.recv().await else {
                return Err(Error::Disconnected);
            };
            let (tag, body) = proto::split_frame(&reply)?;
            Ok((tag, body.to_vec()))
        }
        .await;
        let _ = stream.finish().await;

        match outcome {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if err.is_disconnect() {
                    self.forget().await;
                }
                Err(err)
            }
        }
    }

    fn expect_success(reply: (FrameTag, Vec<u8>)) -> Result<()> {
        match reply.0 {
            FrameTag::Success => Ok(()),
            FrameTag::Error => {
                let body: proto::ErrorBody = proto::decode_body(&reply.1)?;
                Err(Error::Remote(body.error))
            }
            other => Err(Error::Protocol(format!(
                "unexpected reply tag {}",
                other.as_u8()
            ))),
        }
    }

    fn poll_result(&self, reply: (FrameTag, Vec<u8>)) -> Result<Option<Delivery>> {
        match reply.0 {
            FrameTag::PollResult => {
                let result: proto::PollResult = proto::decode_body(&reply.1)?;
                Ok(result.message.map(|msg| {
                    Delivery::new(
                        msg,
                        Arc::new(ClientAckSource {
                            client: self.clone(),
                        }),
                    )
                }))
            }
            FrameTag::Error => {
                let body: proto::ErrorBody = proto::decode_body(&reply.1)?;
                Err(Error::Remote(body.error))
            }
            other => Err(Error::Protocol(format!(
                "unexpected reply tag {}",
                other.as_u8()
            ))),
        }
    }

    pub async fn declare(&self, name: &str) -> Result<()> {
        let req = proto::encode_frame(
            FrameTag::Declare,
            &proto::Declare { name: name.into() },
        )?;
        Self::expect_success(self.call(req).await?)
    }

    pub async fn ephemeral_declare(&self, name: &str) -> Result<()> {
        let req = proto::encode_frame(
            FrameTag::EphemeralDeclare,
            &proto::Declare { name: name.into() },
        )?;
        Self::expect_success(self.call(req).await?)
    }

    pub async fn abandon(&self, name: &str) -> Result<()> {
        let req = proto::encode_frame(
            FrameTag::Abandon,
            &proto::Abandon { name: name.into() },
        )?;
        Self::expect_success(self.call(req).await?)
    }

    pub async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        let req = proto::encode_frame(
            FrameTag::Push,
            &proto::Push {
                name: name.into(),
                message: msg.clone(),
            },
        )?;
        Self::expect_success(self.call(req).await?)
    }

    pub async fn poll(&self, name: &str) -> Result<Option<Delivery>> {
        let req = proto::encode_frame(FrameTag::Poll, &proto::Poll { name: name.into() })?;
        let reply = self.call(req).await?;
        self.poll_result(reply)
    }

    pub async fn long_poll(&self, name: &str, wait: Duration) -> Result<Option<Delivery>> {
        let req = proto::encode_frame(
            FrameTag::LongPoll,
            &proto::LongPoll {
                name: name.into(),
                duration: format_duration(wait),
            },
        )?;
        let reply = self.call(req).await?;
        self.poll_result(reply)
    }

    /// Long-poll that also completes when `cancel` fires. On cancellation
    /// the sub-stream is abandoned without waiting for the server's reply;
    /// the server delivers that reply into a dead stream, which the
    /// multiplexer tolerates.
    pub async fn long_poll_cancelable(
        &self,
        name: &str,
        wait: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<Option<Delivery>> {
        let req = proto::encode_frame(
            FrameTag::LongPoll,
            &proto::LongPoll {
                name: name.into(),
                duration: format_duration(wait),
            },
        )?;
        let session = self.session().await?;
        let mut stream = session.open()?;
        stream.send(req).await?;

        let mut outcome = None;
        tokio::select! {
            reply = stream.recv() => outcome = Some(reply),
            () = cancel_fired(cancel) => {}
        }
        let Some(reply) = outcome else {
            // Abandon the sub-stream without reading the reply.
            drop(stream);
            return Ok(None);
        };

        let Some(reply) = reply else {
            self.forget().await;
            return Err(Error::Disconnected);
        };
        let (tag, body) = proto::split_frame(&reply)?;
        let result = self.poll_result((tag, body.to_vec()));
        let _ = stream.finish().await;
        result
    }

    pub async fn ack(&self, id: &MessageId) -> Result<()> {
        let req = proto::encode_frame(
            FrameTag::Ack,
            &proto::Ack {
                message_id: id.clone(),
            },
        )?;
        Self::expect_success(self.call(req).await?)
    }

    pub async fn nack(&self, id: &MessageId) -> Result<()> {
        let req = proto::encode_frame(
            FrameTag::Nack,
            &proto::Nack {
                message_id: id.clone(),
            },
        )?;
        Self::expect_success(self.call(req).await?)
    }

    /// This session's in-flight count as the server sees it.
    pub async fn stats(&self) -> Result<proto::StatsResult> {
        let reply = self.call(proto::encode_bare(FrameTag::Stats)).await?;
        match reply.0 {
            FrameTag::StatsResult => proto::decode_body(&reply.1),
            FrameTag::Error => {
                let body: proto::ErrorBody = proto::decode_body(&reply.1)?;
                Err(Error::Remote(body.error))
            }
            other => Err(Error::Protocol(format!(
                "unexpected reply tag {}",
                other.as_u8()
            ))),
        }
    }

    /// Graceful close: the server unwinds the session (nacking in-flight
    /// deliveries, abandoning ephemerals) before the connection drops.
    pub async fn close(&self) -> Result<()> {
        if self.inner.session.lock().await.is_none() {
            return Ok(());
        }
        let outcome = self.call(proto::encode_bare(FrameTag::Close)).await;
        if let Some(session) = self.inner.session.lock().await.take() {
            session.close();
        }
        match outcome {
            Ok(reply) => Self::expect_success(reply),
            // The server may tear the connection before the reply lands.
            Err(Error::Disconnected) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Pusher for Client {
    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        Client::push(self, name, msg).await
    }
}

struct ClientAckSource {
    client: Client,
}

#[async_trait]
impl AckSource for ClientAckSource {
    async fn ack(&self, id: &MessageId) -> Result<()> {
        self.client.ack(id).await
    }

    async fn nack(&self, id: &MessageId) -> Result<()> {
        self.client.nack(id).await
    }
}

/// High-level behaviors built on the basic client: ephemeral naming
/// conventions, reply queues, and request/response helpers.
pub struct FeatureClient {
    client: Client,
    local_queue: Mutex<Option<String>>,
}

impl FeatureClient {
    pub fn new(client: Client) -> FeatureClient {
        FeatureClient {
            client,
            local_queue: Mutex::new(None),
        }
    }

    /// A feature client for `addr`; dials lazily like [`Client`].
    pub fn dial(addr: impl Into<String>) -> FeatureClient {
        FeatureClient::new(Client::new(addr))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A sibling over the same underlying client, for use from another task.
    pub fn sibling(&self) -> FeatureClient {
        FeatureClient::new(self.client.clone())
    }

    /// Declare `name`, ephemerally when it carries the `#ephemeral` suffix.
    pub async fn declare(&self, name: &str) -> Result<()> {
        if name.ends_with(EPHEMERAL_SUFFIX) {
            self.client.ephemeral_declare(name).await
        } else {
            self.client.declare(name).await
        }
    }

    /// The name of an ephemeral reply queue owned by this instance,
    /// declared on first use.
    pub async fn local_queue(&self) -> Result<String> {
        let mut guard = self.local_queue.lock().await;
        if let Some(name) = guard.as_ref() {
            return Ok(name.clone());
        }
        let name = random_mailbox_name();
        self.client.ephemeral_declare(&name).await?;
        *guard = Some(name.clone());
        Ok(name)
    }

    /// Push `msg` with our reply queue as its reply-to and wait for the
    /// response.
    pub async fn request(&self, name: &str, msg: Message) -> Result<Delivery> {
        let mut msg = msg;
        msg.reply_to = self.local_queue().await?;
        let reply_queue = msg.reply_to.clone();
        self.client.push(name, &msg).await?;

        loop {
            if let Some(delivery) = self.client.long_poll(&reply_queue, RECEIVE_CYCLE).await? {
                return Ok(delivery);
            }
        }
    }

    /// Serve requests on `name`: each polled message is handed to `handler`,
    /// its reply (if any) pushed to the message's reply-to, then acked.
    pub async fn handle_requests<H>(&self, name: &str, handler: H) -> Result<()>
    where
        H: Fn(&Message) -> Option<Message>,
    {
        loop {
            let Some(delivery) = self.client.long_poll(name, RECEIVE_CYCLE).await? else {
                continue;
            };
            if let Some(reply) = handler(&delivery.message) {
                if !delivery.message.reply_to.is_empty() {
                    self.client.push(&delivery.message.reply_to, &reply).await?;
                }
            }
            delivery.ack().await?;
        }
    }

    /// Stream deliveries from `name` on a background task. The loop ends
    /// when the receiver is dropped or a call fails.
    pub fn receive(&self, name: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(1);
        let client = self.client.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                match client.long_poll(&name, RECEIVE_CYCLE).await {
                    Ok(Some(delivery)) => {
                        if tx.send(delivery).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(name = %name, error = %err, "receive loop ended");
                        return;
                    }
                }
            }
        });
        rx
    }
}
