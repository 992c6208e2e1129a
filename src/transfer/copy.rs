//! Buffered copy path.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Sink, Source, Transfer};

/// Copy through one reusable buffer until `src` hits end of stream,
/// adding every byte delivered to `written`.
pub(super) async fn copy<R: Source, W: Sink>(
    transfer: &Transfer,
    src: &mut R,
    dst: &mut W,
    buffer_size: usize,
    written: &mut u64,
) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(buffer_size);

    loop {
        buffer.clear();
        let n = src.read_buf(&mut buffer).await?;
        if n == 0 {
            return dst.flush().await;
        }

        transfer.account(n as u64).await;
        dst.write_all(&buffer).await?;
        *written += n as u64;
    }
}
