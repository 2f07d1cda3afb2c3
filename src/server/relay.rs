//! Bidirectional relay
//!
//! Copies both directions with pooled buffers. The first direction to
//! finish (error or EOF) wins the race; dropping the halves closes both
//! sockets, which unblocks the other direction.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool::RELAY_POOL;

pub async fn relay<A, B>(a: A, b: B) -> std::io::Result<u64>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    tokio::select! {
        copied = copy_pooled(&mut a_read, &mut b_write) => copied,
        copied = copy_pooled(&mut b_read, &mut a_write) => copied,
    }
}

async fn copy_pooled<R, W>(src: &mut R, dst: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = RELAY_POOL.acquire();
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
