//! Peer protocol codecs and framing.
//!
//! Every message on the inter-node control channel is one frame:
//! `u64 little-endian length | payload`. Inside a payload, integers are
//! 64-bit little-endian, booleans are a single byte, and strings are
//! `u64 length | bytes | NUL` with the length counting the trailing NUL.
//! Little-endian is canonical for every field; there is no host-order data on
//! the wire.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::types::{BatchFilter, CheckpointState, DataEntry, Metadata};

/// Upper bound for one control frame. Control frames carry metadata lists at
/// most; checkpoint payloads move over the bulk channel, never in a frame.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A framed peer connection.
pub type Conn = Framed<TcpStream, LengthDelimitedCodec>;

/// Wrap a connected socket in the protocol framing.
pub fn framed(stream: TcpStream) -> Conn {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(8)
        .max_frame_length(MAX_FRAME_BYTES)
        .new_framed(stream)
}

/// Request id sent as the first frame of every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routine {
    Backup = 1,
    Load = 2,
    BatchLoad = 3,
    NotifyBackup = 4,
}

impl Routine {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            1 => Routine::Backup,
            2 => Routine::Load,
            3 => Routine::BatchLoad,
            4 => Routine::NotifyBackup,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Routine::Backup => "BACKUP",
            Routine::Load => "LOAD",
            Routine::BatchLoad => "BATCH_LOAD",
            Routine::NotifyBackup => "NOTIFY_BACKUP",
        };
        f.write_str(name)
    }
}

/// Field-composable codec. Messages encode themselves into a frame payload
/// and decode from one.
pub trait Wire: Sized {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self>;
}

pub fn put_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64_le(value);
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        bail!("frame truncated reading u64");
    }
    Ok(buf.get_u64_le())
}

pub fn put_i64(buf: &mut BytesMut, value: i64) {
    buf.put_i64_le(value);
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        bail!("frame truncated reading i64");
    }
    Ok(buf.get_i64_le())
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool> {
    if buf.remaining() < 1 {
        bail!("frame truncated reading bool");
    }
    Ok(buf.get_u8() != 0)
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    // Length counts the trailing NUL.
    buf.put_u64_le(value.len() as u64 + 1);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_u64(buf)? as usize;
    if len == 0 {
        bail!("string length must count the trailing NUL");
    }
    if buf.remaining() < len {
        bail!("frame truncated reading string of {len} bytes");
    }
    let mut raw = buf.split_to(len);
    let nul = raw.split_off(len - 1);
    if nul[0] != 0 {
        bail!("string missing trailing NUL");
    }
    String::from_utf8(raw.to_vec()).context("string is not valid UTF-8")
}

impl Wire for Metadata {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.job);
        put_string(buf, &self.filename);
        put_i64(buf, self.node_rank);
        put_string(buf, &self.iteration);
        put_i64(buf, self.state.as_i64());
        put_u64(buf, self.size);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let job = get_string(buf)?;
        let filename = get_string(buf)?;
        let node_rank = get_i64(buf)?;
        let iteration = get_string(buf)?;
        let raw_state = get_i64(buf)?;
        let state = CheckpointState::from_i64(raw_state)
            .with_context(|| format!("unknown checkpoint state {raw_state}"))?;
        let size = get_u64(buf)?;
        Ok(Metadata {
            job,
            filename,
            node_rank,
            iteration,
            state,
            size,
        })
    }
}

impl Wire for DataEntry {
    fn encode(&self, buf: &mut BytesMut) {
        put_u64(buf, self.address);
        put_i64(buf, i64::from(self.pid));
        put_i64(buf, i64::from(self.memfd));
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let address = get_u64(buf)?;
        let pid = get_i64(buf)? as i32;
        let memfd = get_i64(buf)? as i32;
        Ok(DataEntry { address, pid, memfd })
    }
}

impl Wire for BatchFilter {
    fn encode(&self, buf: &mut BytesMut) {
        put_i64(buf, self.node_rank.unwrap_or(-1));
        put_string(buf, self.iteration.as_deref().unwrap_or(""));
        put_i64(buf, self.state.map_or(-1, CheckpointState::as_i64));
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let rank = get_i64(buf)?;
        let iteration = get_string(buf)?;
        let raw_state = get_i64(buf)?;
        Ok(BatchFilter {
            node_rank: (rank >= 0).then_some(rank),
            iteration: (!iteration.is_empty()).then_some(iteration),
            state: CheckpointState::from_i64(raw_state),
        })
    }
}

/// Replicate a checkpoint to the ring successor. With `only_metadata` the
/// request carries no payload; the receiver just enqueues the filename.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRequest {
    pub metadata: Metadata,
    pub entry: DataEntry,
    pub only_metadata: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackupResponse {
    pub code: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    /// Only job and filename are required.
    pub metadata: Metadata,
    pub only_metadata: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadResponse {
    pub metadata: Metadata,
    pub entry: DataEntry,
    pub code: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchLoadRequest {
    pub filter: BatchFilter,
    pub only_metadata: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchLoadResponse {
    pub items: Vec<LoadResponse>,
    pub code: i64,
}

/// NOTIFY_BACKUP carries no request body; the response is just a code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotifyBackupResponse {
    pub code: i64,
}

impl Wire for BackupRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.metadata.encode(buf);
        self.entry.encode(buf);
        put_bool(buf, self.only_metadata);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(BackupRequest {
            metadata: Metadata::decode(buf)?,
            entry: DataEntry::decode(buf)?,
            only_metadata: get_bool(buf)?,
        })
    }
}

impl Wire for BackupResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_i64(buf, self.code);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(BackupResponse { code: get_i64(buf)? })
    }
}

impl Wire for LoadRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.metadata.encode(buf);
        put_bool(buf, self.only_metadata);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(LoadRequest {
            metadata: Metadata::decode(buf)?,
            only_metadata: get_bool(buf)?,
        })
    }
}

impl Wire for LoadResponse {
    fn encode(&self, buf: &mut BytesMut) {
        self.metadata.encode(buf);
        self.entry.encode(buf);
        put_i64(buf, self.code);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(LoadResponse {
            metadata: Metadata::decode(buf)?,
            entry: DataEntry::decode(buf)?,
            code: get_i64(buf)?,
        })
    }
}

impl Wire for BatchLoadRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.filter.encode(buf);
        put_bool(buf, self.only_metadata);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(BatchLoadRequest {
            filter: BatchFilter::decode(buf)?,
            only_metadata: get_bool(buf)?,
        })
    }
}

impl Wire for BatchLoadResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_u64(buf, self.items.len() as u64);
        for item in &self.items {
            item.metadata.encode(buf);
            item.entry.encode(buf);
        }
        put_i64(buf, self.code);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let count = get_u64(buf)?;
        let mut items = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let metadata = Metadata::decode(buf)?;
            let entry = DataEntry::decode(buf)?;
            items.push(LoadResponse {
                metadata,
                entry,
                code: 0,
            });
        }
        Ok(BatchLoadResponse {
            items,
            code: get_i64(buf)?,
        })
    }
}

impl Wire for NotifyBackupResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_i64(buf, self.code);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(NotifyBackupResponse { code: get_i64(buf)? })
    }
}

/// Send one message as one frame.
pub async fn send<T: Wire>(conn: &mut Conn, msg: &T) -> Result<()> {
    let mut buf = BytesMut::new();
    msg.encode(&mut buf);
    conn.send(buf.freeze()).await.context("send frame")?;
    Ok(())
}

/// Receive one message from one frame. A closed connection is reported as an
/// error without further ceremony; callers decide whether it is noteworthy.
pub async fn recv<T: Wire>(conn: &mut Conn) -> Result<T> {
    let frame = conn
        .next()
        .await
        .context("connection closed")?
        .context("read frame")?;
    let mut buf = frame.freeze();
    T::decode(&mut buf)
}

/// Send the routine id that opens an exchange.
pub async fn send_routine(conn: &mut Conn, routine: Routine) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64_le(routine as u64);
    conn.send(buf.freeze()).await.context("send routine")?;
    Ok(())
}

/// Read the next routine id, or `None` when the peer hung up cleanly.
pub async fn recv_routine(conn: &mut Conn) -> Result<Option<u64>> {
    let Some(frame) = conn.next().await else {
        return Ok(None);
    };
    let frame = frame.context("read routine frame")?;
    if frame.len() != 8 {
        bail!(
            "expect 8 bytes holding the routine id, got {} bytes",
            frame.len()
        );
    }
    let mut buf = frame.freeze();
    Ok(Some(buf.get_u64_le()))
}
