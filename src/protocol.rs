//! Replication wire framing.
//!
//! Minimal binary framing for the replication commands the worker emits.
//! The transport below delivers framed byte sequences reliably and in
//! order per stream; this module only defines how a command and its fields
//! are laid out inside such a sequence.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Magic prefix of every frame.
pub const PROTOCOL_MAGIC: u32 = 0x4155_4D52;

/// Frame header size: magic + command + payload length.
pub const HEADER_SIZE: usize = 4 + 2 + 4;

/// On-wire size of a block interval header.
pub const BLOCK_HEADER_SIZE: usize = 8 + 8 + 4;

/// Block id telling the peer the interval verified in sync.
pub const ID_IN_SYNC: u64 = u64::MAX - 1;
/// Block id telling the peer the interval verified out of sync.
pub const ID_OUT_OF_SYNC: u64 = u64::MAX - 2;

/// Replication commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Mirrored application write, payload attached
    Data = 0x01,
    /// Reply to a peer read, payload attached
    DataReply = 0x02,
    /// Reply to a resync read, payload attached
    RsDataReply = 0x03,
    /// Primary read request
    DataRequest = 0x04,
    /// Resync read request
    RsDataRequest = 0x05,
    /// Resync read request carrying a digest
    CsumRsRequest = 0x06,
    /// Online-verify request
    OvRequest = 0x07,
    /// Online-verify reply carrying a digest
    OvReply = 0x08,
    /// Online-verify result ack
    OvResult = 0x09,
    /// Write-ordering barrier
    Barrier = 0x0a,
    /// Barrier acknowledgement
    BarrierAck = 0x0b,
    /// Flush hint for the peer's request queue
    UnplugRemote = 0x0c,
    /// Interval marked out of sync without payload
    OutOfSync = 0x0d,
    /// Keepalive probe
    Ping = 0x0e,
    /// Keepalive answer
    PingAck = 0x0f,
    /// Negative reply to a primary read
    NegDReply = 0x10,
    /// Negative reply to a resync read
    NegRsDReply = 0x11,
    /// Checksum matched, interval already in sync
    RsIsInSync = 0x12,
    /// Resync request cancelled (congestion mode)
    RsCancel = 0x13,
    /// Sync generation UUID
    SyncUuid = 0x14,
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        use MessageType::*;
        Ok(match value {
            0x01 => Data,
            0x02 => DataReply,
            0x03 => RsDataReply,
            0x04 => DataRequest,
            0x05 => RsDataRequest,
            0x06 => CsumRsRequest,
            0x07 => OvRequest,
            0x08 => OvReply,
            0x09 => OvResult,
            0x0a => Barrier,
            0x0b => BarrierAck,
            0x0c => UnplugRemote,
            0x0d => OutOfSync,
            0x0e => Ping,
            0x0f => PingAck,
            0x10 => NegDReply,
            0x11 => NegRsDReply,
            0x12 => RsIsInSync,
            0x13 => RsCancel,
            0x14 => SyncUuid,
            other => return Err(Error::protocol(format!("unknown command 0x{other:02x}"))),
        })
    }
}

/// Block interval fields shared by requests, replies, and acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// First sector of the interval
    pub sector: u64,
    /// Request correlation id
    pub block_id: u64,
    /// Interval size in bytes
    pub size: u32,
}

fn frame(msg: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
    buf.put_u32(PROTOCOL_MAGIC);
    buf.put_u16(msg as u16);
    buf.put_u32(payload_len as u32);
    buf
}

fn put_block_header(buf: &mut BytesMut, bh: &BlockHeader) {
    buf.put_u64(bh.sector);
    buf.put_u64(bh.block_id);
    buf.put_u32(bh.size);
}

/// Encode a command with no payload (ping, unplug, ...).
pub fn encode_empty(msg: MessageType) -> BytesMut {
    frame(msg, 0)
}

/// Encode a block request or ack: interval fields, no payload.
pub fn encode_block_request(msg: MessageType, bh: &BlockHeader) -> BytesMut {
    let mut buf = frame(msg, BLOCK_HEADER_SIZE);
    put_block_header(&mut buf, bh);
    buf
}

/// Encode a request carrying a digest (checksum resync, verify reply).
pub fn encode_digest_request(msg: MessageType, bh: &BlockHeader, digest: &[u8]) -> BytesMut {
    let mut buf = frame(msg, BLOCK_HEADER_SIZE + digest.len());
    put_block_header(&mut buf, bh);
    buf.put_slice(digest);
    buf
}

/// Encode the header of a data-bearing command; the payload pages follow
/// through the transport's page path.
pub fn encode_data_header(msg: MessageType, bh: &BlockHeader) -> BytesMut {
    let mut buf = frame(msg, BLOCK_HEADER_SIZE + bh.size as usize);
    put_block_header(&mut buf, bh);
    buf
}

/// Encode a barrier frame.
pub fn encode_barrier(msg: MessageType, barrier_nr: u32) -> BytesMut {
    let mut buf = frame(msg, 4);
    buf.put_u32(barrier_nr);
    buf
}

/// Encode a sync UUID frame.
pub fn encode_sync_uuid(uuid: u64) -> BytesMut {
    let mut buf = frame(MessageType::SyncUuid, 8);
    buf.put_u64(uuid);
    buf
}

/// A decoded frame, for the receive side and for tests.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Command
    pub msg: MessageType,
    /// Interval fields when the command carries them
    pub block: Option<BlockHeader>,
    /// Trailing payload (digest bytes or block data)
    pub payload: Bytes,
    /// Barrier number for barrier frames
    pub barrier_nr: Option<u32>,
    /// UUID for sync-uuid frames
    pub uuid: Option<u64>,
}

/// Decode one frame from `buf`. The buffer must hold the complete frame.
pub fn decode(buf: &mut impl Buf) -> Result<Frame> {
    if buf.remaining() < HEADER_SIZE {
        return Err(Error::protocol("truncated frame header"));
    }
    let magic = buf.get_u32();
    if magic != PROTOCOL_MAGIC {
        return Err(Error::protocol(format!("bad magic 0x{magic:08x}")));
    }
    let msg = MessageType::try_from(buf.get_u16())?;
    let length = buf.get_u32() as usize;
    if buf.remaining() < length {
        return Err(Error::protocol("truncated frame payload"));
    }

    use MessageType::*;
    let mut frame = Frame {
        msg,
        block: None,
        payload: Bytes::new(),
        barrier_nr: None,
        uuid: None,
    };
    match msg {
        Ping | PingAck | UnplugRemote => {}
        Barrier | BarrierAck => {
            frame.barrier_nr = Some(buf.get_u32());
        }
        SyncUuid => {
            frame.uuid = Some(buf.get_u64());
        }
        _ => {
            if length < BLOCK_HEADER_SIZE {
                return Err(Error::protocol("frame too short for block header"));
            }
            let bh = BlockHeader {
                sector: buf.get_u64(),
                block_id: buf.get_u64(),
                size: buf.get_u32(),
            };
            let trailing = length - BLOCK_HEADER_SIZE;
            frame.payload = buf.copy_to_bytes(trailing);
            frame.block = Some(bh);
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_request_round_trip() {
        let bh = BlockHeader {
            sector: 800,
            block_id: crate::requests::ID_SYNCER,
            size: 16384,
        };
        let mut buf = encode_block_request(MessageType::RsDataRequest, &bh).freeze();
        let frame = decode(&mut buf).unwrap();
        assert_eq!(frame.msg, MessageType::RsDataRequest);
        assert_eq!(frame.block, Some(bh));
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_digest_request_carries_payload() {
        let bh = BlockHeader {
            sector: 0,
            block_id: crate::requests::ID_SYNCER,
            size: 4096,
        };
        let digest = [1u8, 2, 3, 4];
        let mut buf = encode_digest_request(MessageType::CsumRsRequest, &bh, &digest).freeze();
        let frame = decode(&mut buf).unwrap();
        assert_eq!(frame.msg, MessageType::CsumRsRequest);
        assert_eq!(&frame.payload[..], &digest);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = encode_empty(MessageType::Ping);
        buf[0] ^= 0xFF;
        assert!(decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_barrier_round_trip() {
        let mut buf = encode_barrier(MessageType::Barrier, 42).freeze();
        let frame = decode(&mut buf).unwrap();
        assert_eq!(frame.barrier_nr, Some(42));
    }
}
