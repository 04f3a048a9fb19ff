//! Bulk transfer adapter: one-sided reads and writes between pre-sized
//! memory regions on two nodes.
//!
//! Replication and recovery move opaque byte arrays whose layout is
//! irrelevant to the peer, so the initiator addresses the remote region
//! directly by offset. A handshake registers the local region, exchanges
//! region descriptors (address, access key, queue id, locator) over the
//! control connection, drives the channel through
//! Reset → Init → ReadyToReceive → ReadyToSend, and ends with a one-byte
//! synchronization exchange.
//!
//! The data path here is the same reliable TCP stream as the control channel,
//! preserving the adapter contract: exact-length delivery, payload bytes land
//! directly in the pre-registered region, the receiving side allocates before
//! any data moves, and the initiator observes one explicit completion per
//! chunk. Transfers are chunked at [`CHUNK_SIZE`]; each chunk's completion is
//! polled with exponential back-off before the next chunk starts.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::{CHUNK_SIZE, POLL_MAX, POLL_MIN};
use crate::memory::Region;
use crate::wire::Conn;

const OP_WRITE: u64 = 1;
const OP_READ: u64 = 2;
const OP_TOKEN: u64 = 3;
const OP_ACK: u64 = 4;
const OP_DESCRIPTOR: u64 = 5;
const OP_SYNC: u64 = 6;

/// Ack status for an operation that arrived with the wrong access key or
/// out-of-bounds range.
const STATUS_REJECTED: u64 = 1;
/// Distinguished status when the channel is in an abnormal state.
const STATUS_CHANNEL_ABNORMAL: u64 = 99;

const SYNC_BYTE: u8 = b'Q';

/// Channel state machine driven during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

impl ChannelState {
    /// Step to `next`, refusing transitions outside the legal chain.
    fn advance(self, next: ChannelState) -> Result<ChannelState> {
        let legal = matches!(
            (self, next),
            (ChannelState::Reset, ChannelState::Init)
                | (ChannelState::Init, ChannelState::ReadyToReceive)
                | (ChannelState::ReadyToReceive, ChannelState::ReadyToSend)
        );
        if !legal {
            bail!("illegal channel transition {self:?} -> {next:?}");
        }
        Ok(next)
    }
}

/// Identifiers for a registered region, exchanged over the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionDescriptor {
    addr: u64,
    rkey: u32,
    queue_id: u32,
    locator: [u8; 16],
}

impl RegionDescriptor {
    /// Register a region: mint the identifiers the peer needs to address it.
    fn register(region: &Region) -> Self {
        let entry = region.entry();
        let rkey = (entry.address as u32)
            ^ ((entry.address >> 32) as u32)
            ^ (region.len() as u32)
            ^ (entry.pid as u32);
        let mut locator = [0u8; 16];
        locator[..4].copy_from_slice(&entry.pid.to_le_bytes());
        locator[4..12].copy_from_slice(&entry.address.to_le_bytes());
        locator[12..].copy_from_slice(&(entry.memfd as u32).to_le_bytes());
        RegionDescriptor {
            addr: entry.address,
            rkey,
            queue_id: entry.memfd as u32,
            locator,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(OP_DESCRIPTOR);
        buf.put_u64_le(self.addr);
        buf.put_u32_le(self.rkey);
        buf.put_u32_le(self.queue_id);
        buf.put_slice(&self.locator);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 8 + 8 + 4 + 4 + 16 {
            bail!("region descriptor frame truncated");
        }
        let op = buf.get_u64_le();
        if op != OP_DESCRIPTOR {
            bail!("expected region descriptor, got op {op}");
        }
        let addr = buf.get_u64_le();
        let rkey = buf.get_u32_le();
        let queue_id = buf.get_u32_le();
        let mut locator = [0u8; 16];
        buf.copy_to_slice(&mut locator);
        Ok(RegionDescriptor {
            addr,
            rkey,
            queue_id,
            locator,
        })
    }
}

struct ChunkHeader {
    op: u64,
    rkey: u32,
    offset: u64,
    len: u64,
}

impl ChunkHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.op);
        buf.put_u32_le(self.rkey);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.len);
    }

    fn decode(op: u64, buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 4 + 8 + 8 {
            bail!("chunk header truncated");
        }
        Ok(ChunkHeader {
            op,
            rkey: buf.get_u32_le(),
            offset: buf.get_u64_le(),
            len: buf.get_u64_le(),
        })
    }
}

/// An established bulk channel bound to one local region.
pub struct BulkSession<'a> {
    conn: &'a mut Conn,
    region: Arc<Region>,
    local: RegionDescriptor,
    remote: RegionDescriptor,
    chunk_size: u64,
}

/// Register `region` and connect the bulk channel over `conn`.
///
/// Both sides call this with their role; a failure at any step surfaces an
/// error and leaves no session behind.
pub async fn handshake<'a>(
    conn: &'a mut Conn,
    is_server: bool,
    region: Arc<Region>,
) -> Result<BulkSession<'a>> {
    let state = ChannelState::Reset;

    // Registration moves the channel out of Reset.
    let local = RegionDescriptor::register(&region);
    let state = state.advance(ChannelState::Init)?;

    // Exchange identifiers over the control socket. Both sides send first and
    // then read; the frames are small enough never to deadlock.
    let mut buf = BytesMut::with_capacity(40);
    local.encode(&mut buf);
    conn.send(buf.freeze())
        .await
        .context("send region descriptor")?;
    let frame = conn
        .next()
        .await
        .context("connection closed during handshake")?
        .context("read region descriptor")?;
    let remote = RegionDescriptor::decode(&mut frame.freeze())?;
    let state = state.advance(ChannelState::ReadyToReceive)?;

    // With the peer's identifiers applied the channel may send.
    let state = state.advance(ChannelState::ReadyToSend)?;

    // One-byte synchronization so neither side starts before both are ready.
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u64_le(OP_SYNC);
    buf.put_u8(SYNC_BYTE);
    conn.send(buf.freeze()).await.context("send sync token")?;
    let frame = conn
        .next()
        .await
        .context("connection closed during sync")?
        .context("read sync token")?;
    let mut frame = frame.freeze();
    if frame.remaining() != 9 || frame.get_u64_le() != OP_SYNC || frame.get_u8() != SYNC_BYTE {
        bail!("bulk channel sync mismatch");
    }

    if state != ChannelState::ReadyToSend {
        bail!("channel not ready after handshake, state {state:?}");
    }
    tracing::debug!(
        server = is_server,
        local_addr = local.addr,
        remote_addr = remote.addr,
        "bulk channel handshake complete"
    );
    Ok(BulkSession {
        conn,
        region,
        local,
        remote,
        chunk_size: CHUNK_SIZE,
    })
}

impl<'a> BulkSession<'a> {
    #[cfg(test)]
    fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    async fn write_raw(&mut self, offset: usize, len: usize) -> Result<()> {
        let region = self.region.clone();
        let src = region.bytes(offset, len)?;
        let io = self.conn.get_mut();
        io.write_all(src).await.context("stream chunk payload")?;
        io.flush().await.context("flush chunk payload")?;
        Ok(())
    }

    async fn read_raw(&mut self, offset: usize, len: usize) -> Result<()> {
        let region = self.region.clone();
        let dst = region.bytes_mut(offset, len)?;
        let mut filled = 0;
        // The codec may have read ahead past the last frame; drain that first.
        {
            let buffered = self.conn.read_buffer_mut();
            let take = buffered.len().min(len);
            if take > 0 {
                dst[..take].copy_from_slice(&buffered.split_to(take));
                filled = take;
            }
        }
        if filled < len {
            self.conn
                .get_mut()
                .read_exact(&mut dst[filled..])
                .await
                .context("read chunk payload")?;
        }
        Ok(())
    }

    async fn send_header(&mut self, op: u64, remote_offset: u64, len: u64) -> Result<()> {
        let header = ChunkHeader {
            op,
            rkey: self.remote.rkey,
            offset: remote_offset,
            len,
        };
        let mut buf = BytesMut::with_capacity(28);
        header.encode(&mut buf);
        self.conn.send(buf.freeze()).await.context("send chunk header")?;
        Ok(())
    }

    async fn send_ack(&mut self, status: u64) -> Result<()> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64_le(OP_ACK);
        buf.put_u64_le(status);
        self.conn.send(buf.freeze()).await.context("send ack")?;
        Ok(())
    }

    /// Wait for the peer's completion signal for one in-flight chunk,
    /// polling with exponential back-off instead of a CPU spin.
    async fn poll_completion(&mut self) -> Result<()> {
        let mut wait = POLL_MIN;
        loop {
            match tokio::time::timeout(wait, self.conn.next()).await {
                Ok(maybe) => {
                    let frame = maybe
                        .context("bulk channel closed before completion")?
                        .context("read completion")?;
                    let mut frame = frame.freeze();
                    if frame.remaining() < 16 || frame.get_u64_le() != OP_ACK {
                        bail!("expected completion frame");
                    }
                    return match frame.get_u64_le() {
                        0 => Ok(()),
                        STATUS_CHANNEL_ABNORMAL => {
                            Err(anyhow!("bulk channel in abnormal state"))
                        }
                        status => Err(anyhow!("chunk failed with status {status}")),
                    };
                }
                Err(_) => {
                    wait = (wait * 2).min(POLL_MAX);
                }
            }
        }
    }

    /// Push `len` bytes from the local region into the remote region.
    /// Returns the number of completions observed.
    pub async fn remote_write(
        &mut self,
        local_offset: u64,
        remote_offset: u64,
        len: u64,
    ) -> Result<u64> {
        let mut written = 0u64;
        let mut completions = 0u64;
        while written < len {
            let chunk = (len - written).min(self.chunk_size);
            self.send_header(OP_WRITE, remote_offset + written, chunk)
                .await?;
            self.write_raw((local_offset + written) as usize, chunk as usize)
                .await?;
            self.poll_completion().await?;
            completions += 1;
            written += chunk;
        }
        tracing::debug!(bytes = len, completions, "remote write complete");
        Ok(completions)
    }

    /// Pull `len` bytes from the remote region into the local region.
    /// Returns the number of completions observed.
    pub async fn remote_read(
        &mut self,
        local_offset: u64,
        remote_offset: u64,
        len: u64,
    ) -> Result<u64> {
        if len == 0 {
            bail!("remote read length must be positive");
        }
        let mut read = 0u64;
        let mut completions = 0u64;
        while read < len {
            let chunk = (len - read).min(self.chunk_size);
            self.send_header(OP_READ, remote_offset + read, chunk).await?;
            self.read_raw((local_offset + read) as usize, chunk as usize)
                .await?;
            self.poll_completion().await?;
            completions += 1;
            read += chunk;
        }
        tracing::debug!(bytes = len, completions, "remote read complete");
        Ok(completions)
    }

    /// Serve one-sided operations against the local region until the
    /// initiator's token message arrives; returns that token.
    pub async fn serve(mut self) -> Result<String> {
        loop {
            let frame = self
                .conn
                .next()
                .await
                .context("bulk channel closed while serving")?
                .context("read bulk frame")?;
            let mut frame = frame.freeze();
            if frame.remaining() < 8 {
                bail!("short bulk frame");
            }
            match frame.get_u64_le() {
                OP_WRITE => {
                    let header = ChunkHeader::decode(OP_WRITE, &mut frame)?;
                    if header.rkey != self.local.rkey {
                        self.send_ack(STATUS_REJECTED).await?;
                        bail!("write chunk carries a foreign access key");
                    }
                    match self
                        .read_raw(header.offset as usize, header.len as usize)
                        .await
                    {
                        Ok(()) => self.send_ack(0).await?,
                        Err(err) => {
                            self.send_ack(STATUS_CHANNEL_ABNORMAL).await?;
                            return Err(err);
                        }
                    }
                }
                OP_READ => {
                    let header = ChunkHeader::decode(OP_READ, &mut frame)?;
                    if header.rkey != self.local.rkey {
                        self.send_ack(STATUS_REJECTED).await?;
                        bail!("read chunk carries a foreign access key");
                    }
                    match self
                        .write_raw(header.offset as usize, header.len as usize)
                        .await
                    {
                        Ok(()) => self.send_ack(0).await?,
                        Err(err) => {
                            self.send_ack(STATUS_CHANNEL_ABNORMAL).await?;
                            return Err(err);
                        }
                    }
                }
                OP_TOKEN => {
                    let token = crate::wire::get_string(&mut frame)?;
                    return Ok(token);
                }
                op => bail!("unexpected bulk op {op}"),
            }
        }
    }
}

/// Send the token message that closes a transfer ("W" after a write, "R"
/// after a read).
pub async fn send_token(conn: &mut Conn, token: &str) -> Result<()> {
    let mut buf = BytesMut::new();
    buf.put_u64_le(OP_TOKEN);
    crate::wire::put_string(&mut buf, token);
    conn.send(buf.freeze()).await.context("send transfer token")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMonitor;
    use crate::types::{CheckpointState, Metadata};
    use crate::wire::framed;
    use tokio::net::{TcpListener, TcpStream};

    fn metadata(filename: &str, size: u64) -> Metadata {
        Metadata {
            job: "j".into(),
            filename: filename.into(),
            node_rank: 0,
            iteration: "1".into(),
            state: CheckpointState::Cached,
            size,
        }
    }

    async fn socket_pair() -> (Conn, Conn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (framed(client.unwrap()), framed(server.unwrap().0))
    }

    #[tokio::test]
    async fn write_then_read_moves_the_bytes() {
        let monitor = MemoryMonitor::new(Some(1 << 20));
        let src = monitor.try_allocate(&metadata("src", 4096)).unwrap();
        let dst = monitor.try_allocate(&metadata("dst", 4096)).unwrap();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        src.write_at(0, &payload).unwrap();

        let (mut client_conn, mut server_conn) = socket_pair().await;
        let dst_clone = dst.clone();
        let server = tokio::spawn(async move {
            let session = handshake(&mut server_conn, true, dst_clone).await.unwrap();
            session.serve().await.unwrap()
        });

        let mut session = handshake(&mut client_conn, false, src.clone()).await.unwrap();
        let completions = session.remote_write(0, 0, 4096).await.unwrap();
        assert_eq!(completions, 1);
        send_token(&mut client_conn, "W").await.unwrap();

        let token = server.await.unwrap();
        assert_eq!(token, "W");
        let mut out = vec![0u8; 4096];
        dst.read_at(0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn transfers_larger_than_a_chunk_observe_one_completion_each() {
        let monitor = MemoryMonitor::new(Some(1 << 20));
        let src = monitor.try_allocate(&metadata("src", 10_000)).unwrap();
        let dst = monitor.try_allocate(&metadata("dst", 10_000)).unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
        src.write_at(0, &payload).unwrap();

        let (mut client_conn, mut server_conn) = socket_pair().await;
        let dst_clone = dst.clone();
        let server = tokio::spawn(async move {
            let session = handshake(&mut server_conn, true, dst_clone).await.unwrap();
            session.serve().await.unwrap()
        });

        let mut session = handshake(&mut client_conn, false, src.clone())
            .await
            .unwrap()
            .with_chunk_size(4096);
        // ceil(10_000 / 4096) chunks, each with its own completion.
        let completions = session.remote_write(0, 0, 10_000).await.unwrap();
        assert_eq!(completions, 3);
        send_token(&mut client_conn, "W").await.unwrap();
        server.await.unwrap();

        let mut out = vec![0u8; 10_000];
        dst.read_at(0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn remote_read_pulls_from_the_serving_region() {
        let monitor = MemoryMonitor::new(Some(1 << 20));
        let remote = monitor.try_allocate(&metadata("remote", 2048)).unwrap();
        let local = monitor.try_allocate(&metadata("local", 2048)).unwrap();
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 13) as u8).collect();
        remote.write_at(0, &payload).unwrap();

        let (mut client_conn, mut server_conn) = socket_pair().await;
        let remote_clone = remote.clone();
        let server = tokio::spawn(async move {
            let session = handshake(&mut server_conn, true, remote_clone).await.unwrap();
            session.serve().await.unwrap()
        });

        let mut session = handshake(&mut client_conn, false, local.clone()).await.unwrap();
        let completions = session.remote_read(0, 0, 2048).await.unwrap();
        assert_eq!(completions, 1);
        send_token(&mut client_conn, "R").await.unwrap();
        assert_eq!(server.await.unwrap(), "R");

        let mut out = vec![0u8; 2048];
        local.read_at(0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn zero_length_read_is_refused() {
        let monitor = MemoryMonitor::new(Some(1 << 20));
        let local = monitor.try_allocate(&metadata("local", 64)).unwrap();
        let (mut client_conn, mut server_conn) = socket_pair().await;
        let serve_region = monitor.try_allocate(&metadata("serve", 64)).unwrap();
        let server = tokio::spawn(async move {
            let session = handshake(&mut server_conn, true, serve_region).await.unwrap();
            session.serve().await
        });
        let mut session = handshake(&mut client_conn, false, local).await.unwrap();
        assert!(session.remote_read(0, 0, 0).await.is_err());
        send_token(&mut client_conn, "R").await.unwrap();
        let _ = server.await.unwrap();
    }
}
