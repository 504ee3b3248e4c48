//! Reader and writer tasks of one socket.
//!
//! Both run as local tasks on the socket's owning worker, so every event they raise is already
//! on the right thread. Teardown flips the shared stop signal, which ends whichever task is
//! still running.

use super::socket::{Outbound, Socket, SocketInner, SocketIo};
use super::stream::ConnStream;
use crate::error::NetError;
use bytes::BytesMut;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

const READ_CHUNK: usize = 8 * 1024;
const FILE_CHUNK: usize = 64 * 1024;

/// Starts the driver tasks. Must be called on the socket's owning worker.
pub(crate) fn spawn(socket: &Socket, stream: ConnStream, io: SocketIo) {
    let (reader, writer) = tokio::io::split(stream);
    let inner = Arc::clone(socket.inner());
    tokio::task::spawn_local(read_loop(Arc::clone(&inner), reader, io.stop.clone()));
    tokio::task::spawn_local(write_loop(inner, writer, io.outbound, io.stop));
}

async fn read_loop(
    socket: Arc<SocketInner>,
    mut reader: ReadHalf<ConnStream>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                socket.on_remote_end();
                return;
            }
            Ok(n) => {
                trace!(socket = %socket.id(), len = n, "Read");
                socket.on_data(buf.split().freeze());
            }
            Err(e) => {
                socket.teardown(Some(NetError::Io(e)));
                return;
            }
        }
    }
}

async fn write_loop(
    socket: Arc<SocketInner>,
    mut writer: WriteHalf<ConnStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return,
            next = outbound.recv() => next,
        };
        let Some(next) = next else {
            return;
        };

        match next {
            Outbound::Data { bytes, done } => {
                let len = bytes.len();
                let written = tokio::select! {
                    biased;
                    _ = stop.wait_for(|stopped| *stopped) => return,
                    written = write_chunk(&mut writer, &bytes) => written,
                };
                if let Err(e) = written {
                    socket.teardown(Some(NetError::Io(e)));
                    return;
                }
                socket.on_written(len);
                if let Some(done) = done {
                    socket.guarded("write completion", move || {
                        done();
                        Ok(())
                    });
                }
            }
            Outbound::File(path) => match stream_file(&mut writer, &path, &mut stop).await {
                Ok(FileOutcome::Sent(total)) => {
                    debug!(socket = %socket.id(), path = %path.display(), bytes = total, "File sent");
                }
                Ok(FileOutcome::Stopped) => return,
                Err(FileFailure::Read(e)) => socket.report(NetError::Io(e)),
                Err(FileFailure::Write(e)) => {
                    socket.teardown(Some(NetError::Io(e)));
                    return;
                }
            },
            Outbound::Close => {
                if let Err(e) = writer.shutdown().await {
                    trace!(socket = %socket.id(), error = %e, "Shutdown of write side failed");
                }
                socket.teardown(None);
                return;
            }
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

enum FileOutcome {
    Sent(u64),
    Stopped,
}

enum FileFailure {
    /// The file could not be opened or read. The connection is unaffected.
    Read(io::Error),
    Write(io::Error),
}

async fn stream_file<W: AsyncWrite + Unpin>(
    writer: &mut W,
    path: &Path,
    stop: &mut watch::Receiver<bool>,
) -> Result<FileOutcome, FileFailure> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(FileFailure::Read)?;
    let mut buf = vec![0u8; FILE_CHUNK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(FileFailure::Read)?;
        if n == 0 {
            return Ok(FileOutcome::Sent(total));
        }
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return Ok(FileOutcome::Stopped),
            written = write_chunk(writer, &buf[..n]) => written.map_err(FileFailure::Write)?,
        }
        total += n as u64;
    }
}
