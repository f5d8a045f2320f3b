//! Newline-delimited JSON codec.
//!
//! Each `\n`-terminated record is parsed on its own, so a malformed record
//! yields one `Err` item and leaves the stream intact for the next record.
//! Works over any AsyncRead/AsyncWrite (TCP, duplex pipes, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

pub const DELIMITER: u8 = b'\n';

/// Codec that splits on `\n` and parses each record with serde_json.
///
/// Decodes to `Result<T, serde_json::Error>`; the outer `io::Error` is reserved
/// for framing failures (oversized record, socket errors).
pub struct JsonLinesCodec<T> {
    /// Where the next delimiter scan resumes, so partial tails are not rescanned.
    next_index: usize,
    max_length: usize,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_length: usize::MAX,
            _phantom: PhantomData,
        }
    }

    /// Bound the pending buffer. A record longer than `max_length` bytes
    /// (delimiter excluded) fails decoding with `InvalidData`.
    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            ..Self::new()
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, serde_json::Error>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len().min(self.max_length.saturating_add(1));
        let delimiter = src[self.next_index..read_to]
            .iter()
            .position(|b| *b == DELIMITER);

        match delimiter {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;
                let record = src.split_to(end + 1);
                let record = &record[..end];
                tracing::trace!(record_bytes = record.len(), "Decoded record");
                Ok(Some(serde_json::from_slice(record)))
            }
            None if src.len() > self.max_length => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record exceeds {} bytes without a delimiter", self.max_length),
            )),
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        if !buf.is_empty() {
            tracing::debug!(
                discarded_bytes = buf.len(),
                "Discarding unterminated record at end of stream"
            );
            buf.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl<T, U: Serialize> Encoder<U> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: U, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding record");
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.extend_from_slice(&[DELIMITER]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::{Value, json};
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::bridge::protocol::{AuthAck, Command};

    fn drain<T: DeserializeOwned>(
        codec: &mut JsonLinesCodec<T>,
        buf: &mut BytesMut,
    ) -> Vec<Result<T, serde_json::Error>> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn partial_tail_is_kept_across_appends() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b"[..]);

        let first = drain(&mut codec, &mut buf);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap(), &json!({"a": 1}));
        assert_eq!(&buf[..], b"{\"b");

        buf.extend_from_slice(b"\":2}\n");
        let second = drain(&mut codec, &mut buf);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].as_ref().unwrap(), &json!({"b": 2}));
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_at_a_time_yields_only_complete_records() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::new();
        let mut records = Vec::new();

        for byte in b"{\"n\":1}\n{\"n\":2}\n{\"n\":3" {
            buf.extend_from_slice(&[*byte]);
            records.extend(drain(&mut codec, &mut buf));
        }

        let values: Vec<Value> = records.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(&buf[..], b"{\"n\":3");
    }

    #[test]
    fn malformed_record_yields_one_error_and_stream_recovers() {
        let mut codec = JsonLinesCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\nnot json\n{\"c\":3}\n"[..]);

        let items = drain(&mut codec, &mut buf);
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert_eq!(items[2].as_ref().unwrap(), &json!({"c": 3}));
    }

    #[test]
    fn empty_and_non_object_records_are_malformed_commands() {
        let mut codec = JsonLinesCodec::<Command>::new();
        let mut buf = BytesMut::from(&b"\n[1]\n{\"auth\":true}\r\n"[..]);

        let items = drain(&mut codec, &mut buf);
        assert_eq!(items.len(), 3);
        assert!(items[0].is_err());
        assert!(items[1].is_err());
        assert!(items[2].is_ok());
    }

    #[test]
    fn oversized_record_is_a_framing_error() {
        let mut codec = JsonLinesCodec::<Value>::new_with_max_length(8);
        let mut buf = BytesMut::from(&b"{\"a\":1}\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_ok());

        buf.extend_from_slice(b"{\"abcdefgh\":1}");
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn record_at_max_length_is_accepted() {
        let mut codec = JsonLinesCodec::<Value>::new_with_max_length(7);
        let mut buf = BytesMut::from(&b"{\"a\":1}\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn encode_appends_delimiter() {
        let mut codec = JsonLinesCodec::<Command>::new();
        let mut buf = BytesMut::new();
        codec.encode(AuthAck::granted(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"auth\":true}\n");
    }

    #[tokio::test]
    async fn unterminated_tail_is_dropped_at_eof() {
        let input: &[u8] = b"{\"a\":1}\n{\"b\":2}";
        let mut reader = FramedRead::new(input, JsonLinesCodec::<Value>::new());

        let first = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(first, json!({"a": 1}));
        assert!(reader.next().await.is_none());
    }
}
