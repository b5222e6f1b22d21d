/// 批量 I/O 辅助模块
///
/// CONNECT 请求头由多个切片拼成，使用 write_vectored 减少系统调用；
/// 响应头读取设有硬上限，防止异常代理撑爆内存
use std::io::{self, IoSlice};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// HTTP 响应头最大大小（8KB）
pub const DEFAULT_MAX_HEAD_SIZE: usize = 8 * 1024;

/// 批量写入辅助函数 - 使用 write_vectored 减少系统调用
pub async fn write_vectored_all<W>(writer: &mut W, bufs: &[&[u8]]) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if bufs.is_empty() {
        return Ok(());
    }

    // 只有一个缓冲区时直接 write_all
    if bufs.len() == 1 {
        return writer.write_all(bufs[0]).await;
    }

    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut written = 0usize;

    while written < total {
        // 跳过已完整写出的切片，对部分写出的切片做偏移
        let mut remaining = written;
        let mut io_slices: Vec<IoSlice> = Vec::with_capacity(bufs.len());
        for buf in bufs {
            if remaining >= buf.len() {
                remaining -= buf.len();
                continue;
            }
            io_slices.push(IoSlice::new(&buf[remaining..]));
            remaining = 0;
        }

        let n = writer.write_vectored(&io_slices).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write CONNECT head",
            ));
        }
        written += n;
    }

    Ok(())
}

/// 读取一个 HTTP 响应/请求头（到空行为止）
///
/// 返回头部字节（含结尾的 CRLFCRLF）以及头部之后多读到的字节。
/// 超过 `max_size` 仍未见到空行时报错。
pub async fn read_http_head<R>(reader: &mut R, max_size: usize) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        if buf.len() >= max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("HTTP head exceeds {} bytes", max_size),
            ));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before HTTP head completed",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
    }
}

/// 查找 CRLFCRLF 结束位置（返回头部结束后的偏移）
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
