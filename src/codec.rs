// Labmesh - Peer-to-peer instant-messaging and file-sharing overlay for LAN classrooms over a minimal framed protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use nom::number::complete::le_u16;

use serde::Serialize;
use serde_json::Value;

use crate::error::{LabmeshError, LabmeshResult};

/// Largest JSON payload a single frame can carry.
///
/// The length prefix is an unsigned 16-bit integer, so anything larger
/// cannot be framed and is rejected at encode time.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Upper bound on bytes parked in the residual buffer.
///
/// A tail that outgrows a maximum frame plus its prefix means the
/// stream has desynchronized and is discarded.
pub const BUF_SIZE: usize = MAX_FRAME_LEN + 2;

/// Serialize `msg` into a single `u16 little-endian length || JSON` frame.
pub fn encode<T: Serialize>(msg: &T) -> LabmeshResult<Bytes> {
    let payload = serde_json::to_vec(msg)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(LabmeshError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 2);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Reassembles length-prefixed JSON frames out of raw socket chunks.
///
/// Bytes past the last complete frame stay parked here until the next
/// chunk arrives, or until a service swap drains them with `take_remain`.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame.
    ///
    /// Frames whose payload fails to parse are skipped; their length is
    /// known, so the stream stays aligned. Partial tails are retained
    /// for the next read.
    pub fn next(&mut self) -> Option<Value> {
        loop {
            if self.buf.len() < 2 {
                return None;
            }

            let parsed: nom::IResult<&[u8], u16> = le_u16(&self.buf[..2]);
            let msg_len = match parsed {
                Ok((_, len)) => len as usize,
                Err(_) => return None,
            };

            if self.buf.len() < msg_len + 2 {
                if self.buf.len() > BUF_SIZE {
                    debug!(
                        "Discarding desynchronized stream tail (length = {})",
                        self.buf.len()
                    );
                    self.buf.clear();
                }

                return None;
            }

            self.buf.advance(2);
            let payload = self.buf.split_to(msg_len);

            match serde_json::from_slice(&payload) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    debug!("Skipping unparseable frame (length = {}): {}", msg_len, e);
                }
            }
        }
    }

    /// Drain everything buffered past the last consumed frame.
    ///
    /// Used on a service swap: the tail belongs to the incoming service.
    pub fn take_remain(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn encode_decode_roundtrip() {
        let msg = json!({
            "family": "Chat",
            "action": "Text",
            "data": { "source": "R1", "dest": "M7", "body": "hello lab" },
        });

        let bytes = encode(&msg).unwrap();

        let mut reader = FrameReader::new();
        reader.extend(&bytes);

        assert_eq!(reader.next(), Some(msg));
        assert_eq!(reader.next(), None);
        assert!(reader.is_empty());
    }

    #[test]
    fn decode_is_chunking_independent() {
        let msgs: Vec<_> = (0..16)
            .map(|i| json!({ "family": "Chat", "action": "Text", "data": { "seq": i } }))
            .collect();

        let mut stream = Vec::new();
        for m in &msgs {
            stream.extend_from_slice(&encode(m).unwrap());
        }

        // Feed the same byte stream at several awkward chunk sizes.
        for chunk_size in &[1usize, 2, 3, 7, 64, stream.len()] {
            let mut reader = FrameReader::new();
            let mut decoded = Vec::new();

            for chunk in stream.chunks(*chunk_size) {
                reader.extend(chunk);
                while let Some(m) = reader.next() {
                    decoded.push(m);
                }
            }

            assert_eq!(decoded, msgs, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let msg = json!({ "blob": "x".repeat(MAX_FRAME_LEN) });

        match encode(&msg) {
            Err(LabmeshError::FrameTooLarge(_)) => (),
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn unparseable_frame_is_skipped() {
        let good = json!({ "family": "Chat" });

        let mut stream = BytesMut::new();
        stream.put_u16_le(7);
        stream.put_slice(b"not]son");
        stream.put_slice(&encode(&good).unwrap());

        let mut reader = FrameReader::new();
        reader.extend(&stream);

        assert_eq!(reader.next(), Some(good));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn remain_carries_bytes_past_frame_boundary() {
        let header = json!({ "serviceName": "PicTransferService" });

        let mut stream = BytesMut::new();
        stream.put_slice(&encode(&header).unwrap());
        stream.put_slice(b"raw picture bytes");

        let mut reader = FrameReader::new();
        reader.extend(&stream);

        assert_eq!(reader.next(), Some(header));
        assert_eq!(&reader.take_remain()[..], b"raw picture bytes");
        assert!(reader.is_empty());
    }
}
