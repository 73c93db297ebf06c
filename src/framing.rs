//! Length-prefixed message framing
//!
//! The response body is a sequence of frames, each a 4-byte big-endian
//! length followed by that many bytes of an encoded protobuf message.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::transport::ByteStream;

const LENGTH_FIELD_SIZE: usize = 4;

/// Decode a byte stream into a stream of messages
///
/// Frames may be split across or packed into arbitrary body chunks.
/// Truncated or oversized frames end the stream with `Error::Framing`.
pub fn deframed<M>(body: ByteStream, max_frame_length: usize) -> impl Stream<Item = Result<M>> + Send
where
    M: prost::Message + Default + 'static,
{
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_FIELD_SIZE)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec();

    FramedRead::new(StreamReader::new(body), codec).map(|frame| {
        let frame = frame.map_err(map_io_error)?;
        Ok(M::decode(frame.freeze())?)
    })
}

/// Encode one message as a frame
pub fn encode_frame<M: prost::Message>(message: &M) -> Bytes {
    let len = message.encoded_len();
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + len);
    buf.put_u32(len as u32);
    // BytesMut grows on demand, so encoding cannot run out of capacity
    let _ = message.encode(&mut buf);
    buf.freeze()
}

// Body read failures surface here too; both end the batch the same way
fn map_io_error(e: io::Error) -> Error {
    Error::Framing(e.to_string())
}
