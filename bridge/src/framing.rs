// Length-delimited framing over any byte stream
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

pub type FrameReader<S> = FramedRead<ReadHalf<S>, LengthDelimitedCodec>;
pub type FrameWriter<S> = FramedWrite<WriteHalf<S>, LengthDelimitedCodec>;

/// Splits `stream` into a frame reader and writer. Each frame is a 4-byte
/// big-endian length followed by the body.
pub fn split<S>(stream: S, max_frame_length: usize) -> (FrameReader<S>, FrameWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let codec = || {
        LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec()
    };
    let (read, write) = tokio::io::split(stream);
    (FramedRead::new(read, codec()), FramedWrite::new(write, codec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_frames_survive_a_duplex_pipe() {
        let (left, right) = tokio::io::duplex(1024);
        let (_left_reader, mut left_writer) = split(left, 1024);
        let (mut right_reader, _right_writer) = split(right, 1024);

        left_writer.send(Bytes::from_static(b"one")).await.unwrap();
        left_writer.send(Bytes::from_static(b"")).await.unwrap();
        left_writer.send(Bytes::from_static(b"three")).await.unwrap();

        assert_eq!(&right_reader.next().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&right_reader.next().await.unwrap().unwrap()[..], b"");
        assert_eq!(&right_reader.next().await.unwrap().unwrap()[..], b"three");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_an_error() {
        let (left, right) = tokio::io::duplex(4096);
        let (_l, mut writer) = split(left, 4096);
        let (mut reader, _w) = split(right, 16);

        writer.send(Bytes::from(vec![0u8; 64])).await.unwrap();
        assert!(reader.next().await.unwrap().is_err());
    }
}
