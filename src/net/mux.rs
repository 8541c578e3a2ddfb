//! Stream multiplexer.
//!
//! Many short-lived sub-streams ride one ordered connection. Wire frames are
//! `[u32 payload length][u32 stream id][u8 flags][payload]`; a `SYN` flag
//! opens a stream and `FIN` closes it. The opening side allocates odd ids,
//! the accepting side would allocate even ones (the mailbox protocol never
//! opens server-side streams). Frames for a stream the local side has
//! already dropped are discarded: a peer may legitimately reply into a
//! stream whose opener walked away.

use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

/// Anything a session can ride on: plain TCP or a TLS stream.
pub trait SessionIo: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> SessionIo for T {}

/// Boxed connection handed to the multiplexer.
pub type BoxedIo = Box<dyn SessionIo + Unpin + Send>;

const FLAG_SYN: u8 = 0x1;
const FLAG_FIN: u8 = 0x2;

const FRAME_HEADER_LEN: usize = 9;

/// Upper bound on one frame's payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Channel depth for per-stream inbound frames and the shared writer.
const CHANNEL_DEPTH: usize = 32;

#[derive(Debug)]
struct WireFrame {
    stream: u32,
    flags: u8,
    payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// One multiplexed connection. Cheap to share behind an `Arc`.
pub struct MuxSession {
    next_stream: AtomicU32,
    outgoing: mpsc::Sender<WireFrame>,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>,
    accept: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    alive: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
}

impl MuxSession {
    pub fn new(io: BoxedIo, side: Side) -> MuxSession {
        let (read_half, write_half) = tokio::io::split(io);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_DEPTH);
        let streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(write_loop(
            write_half,
            out_rx,
            alive.clone(),
            closed_rx.clone(),
        ));
        tokio::spawn(read_loop(ReadLoop {
            read_half,
            streams: streams.clone(),
            accept_tx,
            outgoing: out_tx.clone(),
            alive: alive.clone(),
            closed: closed_rx,
            side,
        }));

        MuxSession {
            next_stream: AtomicU32::new(match side {
                Side::Client => 1,
                Side::Server => 2,
            }),
            outgoing: out_tx,
            streams,
            accept: tokio::sync::Mutex::new(accept_rx),
            alive,
            closed: closed_tx,
        }
    }

    /// Open a fresh sub-stream. The SYN rides the first frame sent on it.
    pub fn open(&self) -> Result<MuxStream> {
        if !self.is_alive() {
            return Err(Error::Disconnected);
        }
        let id = self.next_stream.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.streams.lock().insert(id, tx);
        Ok(MuxStream {
            id,
            incoming: rx,
            outgoing: self.outgoing.clone(),
            opener: true,
            sent_syn: false,
            sent_fin: false,
        })
    }

    /// Next inbound sub-stream; `None` once the connection is gone.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.accept.lock().await.recv().await
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Tear the connection down; all streams and the accept loop complete.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.closed.send(true);
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        // Dropping the last handle tears the connection; the peer sees EOF
        // and runs its session cleanup.
        self.close();
    }
}

/// One sub-stream carrying framed payloads.
pub struct MuxStream {
    id: u32,
    incoming: mpsc::Receiver<Bytes>,
    outgoing: mpsc::Sender<WireFrame>,
    opener: bool,
    sent_syn: bool,
    sent_fin: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        let mut flags = 0;
        if self.opener && !self.sent_syn {
            flags |= FLAG_SYN;
            self.sent_syn = true;
        }
        self.outgoing
            .send(WireFrame {
                stream: self.id,
                flags,
                payload,
            })
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Next inbound frame; `None` when the peer finished the stream or the
    /// connection died.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Close our half cleanly.
    pub async fn finish(&mut self) -> Result<()> {
        if self.sent_fin {
            return Ok(());
        }
        self.sent_fin = true;
        let mut flags = FLAG_FIN;
        if self.opener && !self.sent_syn {
            flags |= FLAG_SYN;
            self.sent_syn = true;
        }
        self.outgoing
            .send(WireFrame {
                stream: self.id,
                flags,
                payload: Bytes::new(),
            })
            .await
            .map_err(|_| Error::Disconnected)
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        // Abandoned streams still tell the peer; best effort only.
        if !self.sent_fin {
            let _ = self.outgoing.try_send(WireFrame {
                stream: self.id,
                flags: FLAG_FIN,
                payload: Bytes::new(),
            });
        }
    }
}

async fn write_loop(
    mut write_half: WriteHalf<BoxedIo>,
    mut out_rx: mpsc::Receiver<WireFrame>,
    alive: Arc<AtomicBool>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        // Biased: queued frames drain before a close takes effect, so a
        // reply enqueued just before teardown still reaches the peer.
        let frame = tokio::select! {
            biased;
            frame = out_rx.recv() => frame,
            _ = closed.changed() => None,
        };
        let Some(frame) = frame else { break };

        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        header[4..8].copy_from_slice(&frame.stream.to_be_bytes());
        header[8] = frame.flags;
        if write_half.write_all(&header).await.is_err()
            || write_half.write_all(&frame.payload).await.is_err()
            || write_half.flush().await.is_err()
        {
            break;
        }
    }
    alive.store(false, Ordering::SeqCst);
}

struct ReadLoop {
    read_half: ReadHalf<BoxedIo>,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>,
    accept_tx: mpsc::Sender<MuxStream>,
    outgoing: mpsc::Sender<WireFrame>,
    alive: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
    side: Side,
}

async fn read_loop(mut ctx: ReadLoop) {
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let read = tokio::select! {
            res = ctx.read_half.read_exact(&mut header) => res,
            _ = ctx.closed.changed() => break,
        };
        if read.is_err() {
            break;
        }

        let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        let stream = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let flags = header[8];
        if len > MAX_FRAME_SIZE {
            warn!(len, "oversized frame, tearing session");
            break;
        }

        let mut payload = vec![0u8; len];
        if ctx.read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        let payload = Bytes::from(payload);

        let is_syn = flags & FLAG_SYN != 0;
        let is_fin = flags & FLAG_FIN != 0;
        let sender = ctx.streams.lock().get(&stream).cloned();

        match sender {
            Some(tx) => {
                if !payload.is_empty() && tx.send(payload).await.is_err() {
                    trace!(stream, "frame for dropped stream discarded");
                }
                if is_fin {
                    ctx.streams.lock().remove(&stream);
                }
            }
            None if is_syn && ctx.side == Side::Server => {
                let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
                if !payload.is_empty() {
                    let _ = tx.send(payload).await;
                }
                if !is_fin {
                    ctx.streams.lock().insert(stream, tx);
                }
                let accepted = MuxStream {
                    id: stream,
                    incoming: rx,
                    outgoing: ctx.outgoing.clone(),
                    opener: false,
                    sent_syn: true,
                    sent_fin: false,
                };
                if ctx.accept_tx.send(accepted).await.is_err() {
                    break;
                }
            }
            None => {
                trace!(stream, "frame for unknown stream discarded");
            }
        }
    }
    ctx.alive.store(false, Ordering::SeqCst);
    ctx.streams.lock().clear();
}
