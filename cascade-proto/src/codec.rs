//! Envelope codec over any [`AsyncRead`]/[`AsyncWrite`] stream.
//!
//! Each frame is `varint(length)` followed by the postcard-encoded
//! envelope. Encode/decode failures surface as
//! [`std::io::ErrorKind::InvalidData`] so transport and decode errors can
//! be told apart from stream closure.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::varint;

/// Sends one envelope as a length-prefixed frame and flushes.
pub async fn send(w: &mut (impl AsyncWrite + Unpin), msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    varint::write_frame(w, &payload).await?;
    w.flush().await
}

/// Receives and decodes one length-prefixed envelope.
pub async fn recv<T: for<'de> Deserialize<'de>>(r: &mut (impl AsyncRead + Unpin)) -> io::Result<T> {
    let payload = varint::read_frame(r).await?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
