//! Length driven reassembly of a fragmented byte stream.
//!
//! An [`Unpacker`] queues whatever chunks the socket hands over and releases exactly `n`
//! bytes once `n` bytes are buffered. What happens with those bytes is decided by the
//! continuation registered together with `n`. Continuations are plain values (usually an
//! enum naming the next protocol state), and [`Unpacker::drive`] hands each completed frame
//! to a single dispatch function together with the continuation it was expected for.
//!
//! ```
//! use ranger::unpacker::Unpacker;
//!
//! #[derive(Debug)]
//! enum Frame {
//!     Length,
//!     Body,
//! }
//!
//! let mut unpacker = Unpacker::new();
//! unpacker.expect(1, Frame::Length);
//!
//! let mut bodies = Vec::new();
//! for chunk in [&[3u8, b'a'][..], &b"bc"[..]] {
//!     unpacker.feed(chunk.to_vec(), |unpacker, frame, bytes| {
//!         match frame {
//!             Frame::Length => unpacker.expect(bytes[0] as usize, Frame::Body),
//!             Frame::Body => {
//!                 bodies.push(bytes);
//!                 unpacker.expect(1, Frame::Length);
//!             }
//!         }
//!         true
//!     });
//! }
//! assert_eq!(bodies, vec![b"abc".to_vec()]);
//! ```

use std::collections::VecDeque;

#[derive(Debug)]
pub struct Unpacker<K> {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes held by `chunks`, including the consumed prefix of the front chunk.
    buffered: usize,
    /// Consumed prefix of the front chunk.
    offset: usize,
    expected: Option<(usize, K)>,
}

impl<K> Default for Unpacker<K> {
    fn default() -> Self {
        Unpacker {
            chunks: VecDeque::new(),
            buffered: 0,
            offset: 0,
            expected: None,
        }
    }
}

impl<K> Unpacker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a chunk. Nothing is released until the next [`Unpacker::drive`].
    pub fn append(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.buffered += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Registers that the next `len` bytes belong to `continuation`, replacing any previous
    /// expectation.
    pub fn expect(&mut self, len: usize, continuation: K) {
        self.expected = Some((len, continuation));
    }

    /// Drops the current expectation; buffered bytes stay queued.
    pub fn clear_expectation(&mut self) -> Option<K> {
        self.expected.take().map(|(_, continuation)| continuation)
    }

    pub fn is_expecting(&self) -> bool {
        self.expected.is_some()
    }

    /// Bytes buffered but not yet handed out.
    pub fn available(&self) -> usize {
        self.buffered - self.offset
    }

    /// [`Unpacker::append`] followed by [`Unpacker::drive`].
    pub fn feed<F>(&mut self, chunk: Vec<u8>, handler: F)
    where
        F: FnMut(&mut Self, K, Vec<u8>) -> bool,
    {
        self.append(chunk);
        self.drive(handler);
    }

    /// Releases frames while the current expectation can be satisfied.
    ///
    /// `handler` receives the unpacker itself so it can register the next expectation. It
    /// returns `true` to keep consuming in this pass, or `false` to stop even if further
    /// frames are already buffered (the expectation it left behind, if any, is kept for the
    /// next call). A handler that registers nothing ends the pass as well.
    pub fn drive<F>(&mut self, mut handler: F)
    where
        F: FnMut(&mut Self, K, Vec<u8>) -> bool,
    {
        loop {
            let ready = matches!(self.expected, Some((len, _)) if len <= self.available());
            if !ready {
                break;
            }
            let Some((len, continuation)) = self.expected.take() else {
                break;
            };

            let frame = self.take(len);
            if !handler(self, continuation, frame) {
                break;
            }
        }
    }

    /// Hands out everything still buffered, leaving the unpacker empty. Used when a stream
    /// stops being framed and the rest is raw payload.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let len = self.available();
        self.take(len)
    }

    fn take(&mut self, len: usize) -> Vec<u8> {
        let mut frame = Vec::with_capacity(len);
        let mut missing = len;

        while missing > 0 {
            let Some(front) = self.chunks.front() else {
                break;
            };

            let rest = &front[self.offset..];
            if missing < rest.len() {
                frame.extend_from_slice(&rest[..missing]);
                self.offset += missing;
                missing = 0;
            } else {
                frame.extend_from_slice(rest);
                missing -= rest.len();
                self.buffered -= front.len();
                self.offset = 0;
                self.chunks.pop_front();
            }
        }

        frame
    }
}

#[cfg(test)]
mod tests {
    use super::Unpacker;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Header,
        Body,
    }

    /// A length-prefixed record stream: 1 byte length then that many bytes.
    fn records(chunks: &[Vec<u8>]) -> Vec<(Step, Vec<u8>)> {
        let mut unpacker = Unpacker::new();
        unpacker.expect(1, Step::Header);
        let mut seen = Vec::new();

        for chunk in chunks {
            unpacker.feed(chunk.clone(), |unpacker, step, bytes| {
                seen.push((step, bytes.clone()));
                match step {
                    Step::Header => unpacker.expect(bytes[0] as usize, Step::Body),
                    Step::Body => unpacker.expect(1, Step::Header),
                }
                true
            });
        }
        seen
    }

    fn stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        for (i, body) in ["hello", "", "a", "fragmented world", "xyz"].iter().enumerate() {
            bytes.push(body.len() as u8);
            bytes.extend_from_slice(body.as_bytes());
            bytes.push(i as u8 + 1);
            bytes.extend(std::iter::repeat(b'#').take(i + 1));
        }
        bytes
    }

    #[test]
    fn chunking_does_not_change_frames() {
        let bytes = stream();
        let whole = records(&[bytes.clone()]);
        let single: Vec<Vec<u8>> = bytes.iter().map(|b| vec![*b]).collect();
        assert_eq!(records(&single), whole);

        for split in [2, 3, 5, 7, 11] {
            let chunks: Vec<Vec<u8>> = bytes.chunks(split).map(|c| c.to_vec()).collect();
            assert_eq!(records(&chunks), whole, "split {}", split);
        }

        let uneven = vec![
            bytes[..1].to_vec(),
            bytes[1..9].to_vec(),
            Vec::new(),
            bytes[9..10].to_vec(),
            bytes[10..].to_vec(),
        ];
        assert_eq!(records(&uneven), whole);
    }

    #[test]
    fn zero_length_expectation_fires_without_input() {
        let mut unpacker: Unpacker<Step> = Unpacker::new();
        unpacker.expect(0, Step::Body);
        let mut fired = Vec::new();
        unpacker.drive(|_, step, bytes| {
            fired.push((step, bytes));
            true
        });
        assert_eq!(fired, vec![(Step::Body, Vec::new())]);
        assert!(!unpacker.is_expecting());
    }

    #[test]
    fn returning_false_pauses_with_frames_pending() {
        let mut unpacker = Unpacker::new();
        unpacker.expect(2, Step::Header);
        let mut count = 0;
        unpacker.feed(vec![1, 2, 3, 4, 5, 6], |unpacker, _, _| {
            count += 1;
            unpacker.expect(2, Step::Header);
            false
        });
        assert_eq!(count, 1);
        assert_eq!(unpacker.available(), 4);

        unpacker.drive(|unpacker, _, bytes| {
            count += 1;
            assert_eq!(bytes, vec![3, 4]);
            unpacker.clear_expectation();
            true
        });
        assert_eq!(count, 2);
        assert_eq!(unpacker.take_remaining(), vec![5, 6]);
        assert_eq!(unpacker.available(), 0);
    }

    #[test]
    fn frames_span_chunks() {
        let mut unpacker = Unpacker::new();
        unpacker.append(vec![1, 2]);
        unpacker.append(vec![3]);
        unpacker.append(vec![4, 5, 6]);
        unpacker.expect(5, ());
        let mut frames = Vec::new();
        unpacker.drive(|_, _, bytes| {
            frames.push(bytes);
            true
        });
        assert_eq!(frames, vec![vec![1, 2, 3, 4, 5]]);
        assert_eq!(unpacker.take_remaining(), vec![6]);
    }
}
