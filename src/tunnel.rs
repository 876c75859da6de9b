//! Many TCP connections multiplexed over one.
//!
//! Every frame on the shared connection is `[id: i64 LE][len: u16 LE][payload]`, and a frame
//! with `len == 0` closes `id`. The [`TunnelClientService`] accepts local connections and tags
//! each with a fresh id; the [`TunnelServerService`] hands each tunnel connection to a
//! [`TunnelServerSession`], which opens one upstream connection per id it has not seen
//! before.
//!
//! Each demultiplexed connection runs on its own task, so a slow connect or a slow peer on
//! one id never holds up the others.

use std::{collections::HashMap, fmt, future::Future};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, trace, warn, Instrument};

mod client;
mod frame;
mod server;
mod service;

pub use client::TunnelClientService;
pub use frame::{encode, encode_close, FrameDecoder, TunnelFrame, HEADER_LEN};
pub use server::TunnelServerSession;
pub use service::TunnelServerService;

use crate::socks5_session::BUFFER_SIZE;

/// Reads the link tasks may have queued for the shared connection before they stop reading.
const EVENT_QUEUE: usize = 64;

#[derive(Debug)]
enum LinkEvent {
    Data(i64, Vec<u8>),
    Closed(i64),
}

fn event_channel() -> (mpsc::Sender<LinkEvent>, mpsc::Receiver<LinkEvent>) {
    mpsc::channel(EVENT_QUEUE)
}

/// One demultiplexed connection. Its task opens the connection, writes queued payloads in
/// order and reports what it reads back as [`LinkEvent`]s.
struct Link {
    payloads: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl Link {
    fn spawn<F, R, W, E>(id: i64, open: F, events: mpsc::Sender<LinkEvent>) -> Self
    where
        F: Future<Output = Result<(R, W), E>> + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (payloads, queue) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve_link(id, open, queue, events).in_current_span());
        Link { payloads, task }
    }

    /// Queues `payload`. Returns `false` once the link task has finished.
    fn send(&self, payload: Vec<u8>) -> bool {
        self.payloads.send(payload).is_ok()
    }
}

/// Open links by id.
///
/// Removing a link lets its task write out what is already queued and then close the
/// connection. Dropping the table aborts every link still in it.
#[derive(Default)]
struct Links(HashMap<i64, Link>);

impl Links {
    fn get(&self, id: i64) -> Option<&Link> {
        self.0.get(&id)
    }

    fn contains(&self, id: i64) -> bool {
        self.0.contains_key(&id)
    }

    fn insert(&mut self, id: i64, link: Link) {
        if let Some(old) = self.0.insert(id, link) {
            old.task.abort();
        }
    }

    fn remove(&mut self, id: i64) -> bool {
        self.0.remove(&id).is_some()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn abort_all(&mut self) {
        for (_, link) in self.0.drain() {
            link.task.abort();
        }
    }
}

impl Drop for Links {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn serve_link<F, R, W, E>(
    id: i64,
    open: F,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<LinkEvent>,
) where
    F: Future<Output = Result<(R, W), E>>,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: fmt::Display,
{
    match open.await {
        Ok((reader, writer)) => {
            tokio::select! {
                _ = pump(id, reader, &events) => trace!(id, "Link reader finished"),
                _ = write_queued(id, writer, &mut queue) => trace!(id, "Link writer finished"),
            }
        }
        Err(err) => warn!(id, "{}", err),
    }
    let _ = events.send(LinkEvent::Closed(id)).await;
}

/// Waits for room in the event queue before reading again, so a slow shared connection
/// slows the link down instead of buffering without bound.
async fn pump<R>(id: i64, mut reader: R, events: &mpsc::Sender<LinkEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if events.send(LinkEvent::Data(id, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_queued<W>(id: i64, mut writer: W, queue: &mut mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = queue.recv().await {
        if let Err(err) = writer.write_all(&payload).await {
            debug!(id, "Write failed: {}", err);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
