use crate::unpacker::Unpacker;

/// `[id: i64 LE][len: u16 LE]`
pub const HEADER_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFrame {
    Data { id: i64, payload: Vec<u8> },
    /// A zero length frame: the connection `id` is gone.
    Close { id: i64 },
}

/// Frames carrying `payload` for `id`. Payloads longer than a frame can hold are split;
/// an empty payload produces nothing since a zero length frame means close.
pub fn encode(id: i64, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + HEADER_LEN);
    for chunk in payload.chunks(u16::MAX as usize) {
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
        bytes.extend_from_slice(chunk);
    }
    bytes
}

pub fn encode_close(id: i64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN);
    bytes.extend_from_slice(&id.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes
}

#[derive(Debug)]
enum Step {
    Header,
    Payload { id: i64 },
}

/// Splits a multiplexed byte stream back into frames.
#[derive(Debug)]
pub struct FrameDecoder {
    unpacker: Unpacker<Step>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        let mut unpacker = Unpacker::new();
        unpacker.expect(HEADER_LEN, Step::Header);
        FrameDecoder { unpacker }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: Vec<u8>) -> Vec<TunnelFrame> {
        let mut frames = Vec::new();
        self.unpacker.feed(bytes, |unpacker, step, frame| {
            match step {
                Step::Header => {
                    let mut id = [0u8; 8];
                    id.copy_from_slice(&frame[..8]);
                    let id = i64::from_le_bytes(id);
                    let len = u16::from_le_bytes([frame[8], frame[9]]) as usize;

                    if len == 0 {
                        frames.push(TunnelFrame::Close { id });
                        unpacker.expect(HEADER_LEN, Step::Header);
                    } else {
                        unpacker.expect(len, Step::Payload { id });
                    }
                }
                Step::Payload { id } => {
                    frames.push(TunnelFrame::Data { id, payload: frame });
                    unpacker.expect(HEADER_LEN, Step::Header);
                }
            }
            true
        });
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(
            encode(1, b"ab"),
            vec![1, 0, 0, 0, 0, 0, 0, 0, 2, 0, b'a', b'b']
        );
        assert_eq!(encode_close(-1), vec![0xFF; 8].into_iter().chain([0, 0]).collect::<Vec<u8>>());
        assert!(encode(3, b"").is_empty());
    }

    #[test]
    fn decodes_interleaved_frames_byte_by_byte() {
        let mut stream = encode(7, b"hello");
        stream.extend(encode(-2, b"x"));
        stream.extend(encode_close(7));

        let mut decoder = FrameDecoder::new();
        let frames: Vec<TunnelFrame> = stream
            .iter()
            .flat_map(|byte| decoder.feed(vec![*byte]))
            .collect();
        assert_eq!(
            frames,
            vec![
                TunnelFrame::Data { id: 7, payload: b"hello".to_vec() },
                TunnelFrame::Data { id: -2, payload: b"x".to_vec() },
                TunnelFrame::Close { id: 7 },
            ]
        );
    }

    #[test]
    fn oversized_payload_is_split() {
        let payload = vec![9u8; u16::MAX as usize + 10];
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(encode(1, &payload));
        assert_eq!(frames.len(), 2);
        let total: usize = frames
            .iter()
            .map(|frame| match frame {
                TunnelFrame::Data { payload, .. } => payload.len(),
                TunnelFrame::Close { .. } => 0,
            })
            .sum();
        assert_eq!(total, payload.len());
    }
}
