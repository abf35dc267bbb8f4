use std::io::{self, ErrorKind};

use rmp_serde::{from_slice, Serializer};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode_frame<T: Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    // Reserve 4 bytes for the length prefix and serialize directly into the output frame.
    let mut framed = Vec::with_capacity(256);
    framed.extend_from_slice(&[0u8; 4]);
    msg.serialize(&mut Serializer::new(&mut framed).with_struct_map())
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let payload_len = framed
        .len()
        .checked_sub(4)
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "missing frame payload"))?;
    if payload_len > MAX_FRAME_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "frame too large"));
    }
    let len = u32::try_from(payload_len)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "frame too large"))?;
    framed[..4].copy_from_slice(&len.to_be_bytes());
    Ok(framed)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    if bytes.len() < 4 {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "missing frame header"));
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < 4 + len {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "incomplete frame"));
    }
    decode_body(&bytes[4..4 + len])
}

/// Reads one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated frame header"));
        }
        filled += read;
    }
    let len = frame_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = encode_frame(msg)?;
    writer.write_all(&framed).await?;
    writer.flush().await
}

fn frame_len(header: [u8; 4]) -> io::Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
        ));
    }
    Ok(len)
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> io::Result<T> {
    from_slice(body).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}
