//! Tuya wire protocol implementation.
//! Handles 55AA packet framing, header parsing, and CRC verification.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

/// Prefix(4) + Seq(4) + Cmd(4) + Len(4)
pub const HEADER_LEN: usize = 16;
/// CRC(4) + Suffix(4)
pub const FOOTER_LEN: usize = 8;
pub const RETCODE_LEN: usize = 4;
/// `"3.x"` followed by 12 zero bytes.
pub const VERSION_HEADER_LEN: usize = 15;
/// Upper bound on the declared length field; anything larger is treated as garbage.
pub const MAX_PAYLOAD_LEN: u32 = 0x10000;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

define_command_type! {
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
}

define_version! {
    V3_1 = "3.1",
    V3_3 = "3.3",
}

/// Commands sent without the 15-byte version header under v3.3.
pub const NO_PROTOCOL_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::UpdateDps as u32,
    CommandType::HeartBeat as u32,
];

/// Commands whose payload is encrypted and signed under v3.1.
pub const V31_SIGNED_CMDS: &[u32] = &[CommandType::Control as u32, CommandType::Status as u32];

/// Raw Tuya frame with an undecoded payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code, present on frames sent by the device
    pub retcode: Option<u32>,
    /// Encrypted, signed or plain payload bytes
    pub payload: Vec<u8>,
}

/// Tuya protocol header structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuyaHeader {
    /// Protocol prefix
    pub prefix: u32,
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Length field: retcode + payload + CRC + suffix
    pub payload_len: u32,
    /// Total frame length (header + payload_len)
    pub total_length: u32,
}

/// Pack TuyaMessage into binary data with a CRC-32 footer.
pub fn pack_message(msg: &TuyaMessage) -> Result<Vec<u8>> {
    let retcode_len = if msg.retcode.is_some() { RETCODE_LEN } else { 0 };
    let payload_len = retcode_len + msg.payload.len() + FOOTER_LEN;
    if payload_len as u64 > MAX_PAYLOAD_LEN as u64 {
        return Err(TuyaError::DecodeError(format!(
            "Payload too large ({} bytes)",
            msg.payload.len()
        )));
    }

    let mut data = Vec::with_capacity(HEADER_LEN + payload_len);
    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(msg.seqno)?;
    data.write_u32::<BigEndian>(msg.cmd)?;
    data.write_u32::<BigEndian>(payload_len as u32)?;

    if let Some(rc) = msg.retcode {
        data.write_u32::<BigEndian>(rc)?;
    }
    data.extend_from_slice(&msg.payload);

    let crc_val = CRC32.checksum(&data);
    data.write_u32::<BigEndian>(crc_val)?;
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;

    Ok(data)
}

/// Parse Tuya header from binary data.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN {
        return Err(TuyaError::DecodeError("Header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;
    if prefix != PREFIX_55AA {
        return Err(TuyaError::InvalidHeader);
    }

    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;

    if payload_len < FOOTER_LEN as u32 || payload_len > MAX_PAYLOAD_LEN {
        return Err(TuyaError::DecodeError(format!(
            "Declared length {} out of range",
            payload_len
        )));
    }

    Ok(TuyaHeader {
        prefix,
        seqno,
        cmd,
        payload_len,
        total_length: payload_len + HEADER_LEN as u32,
    })
}

/// Unpack binary data into a TuyaMessage, verifying length, suffix and CRC.
///
/// The retcode is split off when the payload layout shows one (see [`split_retcode`]).
pub fn unpack_message(data: &[u8], version: Version) -> Result<TuyaMessage> {
    let header = parse_header(data)?;
    let msg_len = header.total_length as usize;

    if data.len() < msg_len {
        return Err(TuyaError::DecodeError(format!(
            "Data shorter than declared length ({} < {})",
            data.len(),
            msg_len
        )));
    }

    let payload_end = msg_len - FOOTER_LEN;
    let footer = &data[payload_end..msg_len];

    if BigEndian::read_u32(&footer[4..]) != SUFFIX_55AA {
        return Err(TuyaError::DecodeError("Suffix magic mismatch".into()));
    }

    let calc_crc = CRC32.checksum(&data[..payload_end]);
    let recv_crc = BigEndian::read_u32(&footer[..4]);
    if calc_crc != recv_crc {
        return Err(TuyaError::CrcMismatch);
    }

    let (retcode, payload) = split_retcode(&data[HEADER_LEN..payload_end], version);

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload: payload.to_vec(),
    })
}

/// Separates the optional 4-byte return code from a frame payload.
///
/// Device frames carry a retcode, client frames do not. A payload that already
/// starts with JSON or the version string has none. Otherwise a retcode is
/// present when the bytes after it are empty, JSON, a version header or a
/// whole number of cipher blocks, or when the payload starts with a zero byte
/// and is not itself a whole ciphertext.
pub fn split_retcode(payload: &[u8], version: Version) -> (Option<u32>, &[u8]) {
    let version_bytes = version.as_bytes();
    if payload.is_empty() || payload[0] == b'{' || payload.starts_with(version_bytes) {
        return (None, payload);
    }
    if payload.len() < RETCODE_LEN {
        return (None, payload);
    }

    let rest = &payload[RETCODE_LEN..];
    let looks_json = rest.first() == Some(&b'{') && rest.last() == Some(&b'}');
    let encrypted_blocks = version == Version::V3_3 && rest.len().is_multiple_of(16);
    // Error replies carry plain text, e.g. "json obj data unvalid".
    let leading_zero =
        payload[0] == 0 && !(version == Version::V3_3 && payload.len().is_multiple_of(16));
    if rest.is_empty()
        || looks_json
        || rest.starts_with(version_bytes)
        || encrypted_blocks
        || leading_zero
    {
        (Some(BigEndian::read_u32(&payload[..RETCODE_LEN])), rest)
    } else {
        (None, payload)
    }
}

/// Prefixes a payload with `"3.x"` and 12 zero bytes.
pub fn add_version_header(payload: &[u8], version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERSION_HEADER_LEN + payload.len());
    out.extend_from_slice(version.as_bytes());
    out.extend_from_slice(&[0u8; VERSION_HEADER_LEN - 3]);
    out.extend_from_slice(payload);
    out
}

/// Whether `payload` starts with a 15-byte version header for `version`.
pub fn has_version_header(payload: &[u8], version: Version) -> bool {
    payload.len() >= VERSION_HEADER_LEN && payload.starts_with(version.as_bytes())
}
