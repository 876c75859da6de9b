//! Write queues for the relay loops.
//!
//! A relay loop never awaits a full write to one side while the other side waits to be read.
//! Bytes for each destination go into that destination's [`Outbox`], and the loop polls the
//! outbox as one more `select!` branch. Reads that feed a destination pause while its outbox
//! is full, so a slow peer pushes back on the fast one instead of growing the queue.

use std::{collections::VecDeque, future, io};

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Queued bytes above which the loop stops reading from the source side.
pub(crate) const HIGH_WATER: usize = 256 * 1024;

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
    queued: usize,
    written: u64,
}

impl Outbox {
    pub(crate) fn push(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.queued += bytes.len();
        self.chunks.push_back(bytes);
    }

    pub(crate) fn len(&self) -> usize {
        self.queued
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queued == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.queued >= HIGH_WATER
    }

    /// Bytes handed to the writer so far.
    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    /// Drops whatever is still queued.
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.offset = 0;
        self.queued = 0;
    }

    /// Writes once from the front of the queue and flushes when the queue runs empty.
    ///
    /// Pends forever while the queue is empty or there is no writer. Dropping the future
    /// before it completes loses nothing, because a write that did not complete wrote
    /// nothing.
    pub(crate) async fn write_to<W>(&mut self, writer: Option<&mut W>) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let (Some(writer), Some(front)) = (writer, self.chunks.front()) else {
            return future::pending().await;
        };

        let n = writer.write(&front[self.offset..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.advance(n);

        if self.is_empty() {
            writer.flush().await?;
        }
        Ok(())
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
        self.queued -= n;
        self.written += n as u64;
        if self.chunks.front().is_some_and(|front| self.offset == front.len()) {
            self.chunks.pop_front();
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[tokio::test]
    async fn writes_in_order_across_partial_writes() {
        let (mut reader, mut writer) = duplex(3);
        let mut outbox = Outbox::default();
        outbox.push(b"hello".to_vec());
        outbox.push(Vec::new());
        outbox.push(b" world".to_vec());
        assert_eq!(outbox.len(), 11);

        let drain = async {
            while !outbox.is_empty() {
                outbox.write_to(Some(&mut writer)).await.unwrap();
            }
            outbox.written()
        };
        let read = async {
            let mut buf = [0u8; 11];
            reader.read_exact(&mut buf).await.unwrap();
            buf
        };
        let (written, read) = tokio::join!(drain, read);
        assert_eq!(written, 11);
        assert_eq!(&read, b"hello world");
    }

    #[tokio::test]
    async fn pends_without_a_writer() {
        let mut outbox = Outbox::default();
        outbox.push(vec![1; HIGH_WATER]);
        assert!(outbox.is_full());

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            outbox.write_to(None::<&mut tokio::io::DuplexStream>),
        );
        assert!(pending.await.is_err());

        outbox.clear();
        assert!(outbox.is_empty());
        assert_eq!(outbox.written(), 0);
    }
}
