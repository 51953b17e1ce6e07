//! Packet codec: JSON payloads in, framed/encrypted bytes out, and back.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{
    NO_PROTOCOL_HEADER_CMDS, TuyaMessage, V31_SIGNED_CMDS, VERSION_HEADER_LEN, Version,
    add_version_header, has_version_header, pack_message, unpack_message,
};
use log::trace;
use serde_json::Value;

/// Length of the hex signature that follows `"3.1"` in signed payloads.
const V31_SIGNATURE_LEN: usize = 16;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub seqno: u32,
    pub cmd: u32,
    /// Present on frames sent by the device; zero means success.
    pub retcode: Option<u32>,
    /// JSON payload; `Value::Null` for an empty payload.
    pub payload: Value,
}

/// Encodes and decodes frames for one device key and protocol version.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    version: Version,
    cipher: TuyaCipher,
}

impl PacketCodec {
    pub fn new(local_key: &[u8], version: Version) -> Result<Self> {
        Ok(Self {
            version,
            cipher: TuyaCipher::new(local_key)?,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Encodes a client frame (no retcode).
    pub fn encode(&self, seqno: u32, cmd: u32, payload: &Value) -> Result<Vec<u8>> {
        self.encode_packet(&Packet {
            seqno,
            cmd,
            retcode: None,
            payload: payload.clone(),
        })
    }

    /// Encodes any frame, including device-side frames that carry a retcode.
    pub fn encode_packet(&self, packet: &Packet) -> Result<Vec<u8>> {
        let plain = match &packet.payload {
            Value::Null => Vec::new(),
            v => serde_json::to_vec(v)?,
        };
        let payload = if plain.is_empty() {
            plain
        } else {
            self.seal(packet.cmd, &plain)?
        };
        trace!(
            "Encoding frame: cmd=0x{:02X}, seqno={}, payload_len={}",
            packet.cmd,
            packet.seqno,
            payload.len()
        );

        pack_message(&TuyaMessage {
            seqno: packet.seqno,
            cmd: packet.cmd,
            retcode: packet.retcode,
            payload,
        })
    }

    /// Decodes one complete frame. Magic, length and CRC are checked before
    /// any decryption is attempted.
    pub fn decode(&self, data: &[u8]) -> Result<Packet> {
        let msg = unpack_message(data, self.version)?;
        let rejected = msg.retcode.is_some_and(|code| code != 0);
        let payload = match self.open_json(&msg.payload) {
            Ok(payload) => payload,
            Err(e) if rejected => {
                trace!("Keeping undecodable body of rejected frame as text: {}", e);
                Value::String(String::from_utf8_lossy(&msg.payload).into_owned())
            }
            Err(e) => return Err(e),
        };

        Ok(Packet {
            seqno: msg.seqno,
            cmd: msg.cmd,
            retcode: msg.retcode,
            payload,
        })
    }

    fn open_json(&self, payload: &[u8]) -> Result<Value> {
        if payload.is_empty() {
            return Ok(Value::Null);
        }
        let plain = self.open(payload.to_vec())?;
        if plain.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_slice(&plain)?)
        }
    }

    fn seal(&self, cmd: u32, plain: &[u8]) -> Result<Vec<u8>> {
        match self.version {
            Version::V3_3 => {
                let encrypted = self.cipher.encrypt(plain, false)?;
                if NO_PROTOCOL_HEADER_CMDS.contains(&cmd) {
                    Ok(encrypted)
                } else {
                    Ok(add_version_header(&encrypted, self.version))
                }
            }
            Version::V3_1 => {
                if !V31_SIGNED_CMDS.contains(&cmd) {
                    return Ok(plain.to_vec());
                }
                let b64 = self.cipher.encrypt(plain, true)?;
                let signature = self.cipher.signature(&b64, self.version.as_bytes());
                let mut out = Vec::with_capacity(3 + V31_SIGNATURE_LEN + b64.len());
                out.extend_from_slice(self.version.as_bytes());
                out.extend_from_slice(&signature);
                out.extend_from_slice(&b64);
                Ok(out)
            }
        }
    }

    fn open(&self, mut payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.version {
            Version::V3_3 => {
                if has_version_header(&payload, self.version) {
                    payload.drain(..VERSION_HEADER_LEN);
                }
                if payload.first() == Some(&b'{') {
                    return Ok(payload);
                }
                let mut decrypted = self.cipher.decrypt(&payload, false)?;
                if has_version_header(&decrypted, self.version) {
                    decrypted.drain(..VERSION_HEADER_LEN);
                }
                Ok(decrypted)
            }
            Version::V3_1 => {
                if payload.first() == Some(&b'{') {
                    return Ok(payload);
                }
                let prefix_len = 3 + V31_SIGNATURE_LEN;
                if !payload.starts_with(self.version.as_bytes()) || payload.len() <= prefix_len {
                    return Err(TuyaError::DecodeError(
                        "Unrecognised v3.1 payload layout".into(),
                    ));
                }
                let b64 = &payload[prefix_len..];
                let expected = self.cipher.signature(b64, self.version.as_bytes());
                if payload[3..prefix_len] != expected {
                    return Err(TuyaError::SignatureMismatch);
                }
                self.cipher.decrypt(b64, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandType, HEADER_LEN};
    use serde_json::json;

    const KEY: &[u8] = b"0123456789abcdef";

    fn codec(version: Version) -> PacketCodec {
        PacketCodec::new(KEY, version).unwrap()
    }

    #[test]
    fn test_empty_dp_query_v33() {
        let codec = codec(Version::V3_3);
        let bytes = codec
            .encode(1, CommandType::DpQuery as u32, &json!({}))
            .unwrap();
        let packet = codec.decode(&bytes).unwrap();
        assert_eq!(packet.payload, json!({}));
        assert_eq!(packet.seqno, 1);
        assert_eq!(packet.cmd, CommandType::DpQuery as u32);
        assert_eq!(packet.retcode, None);
    }

    #[test]
    fn test_round_trip_both_versions() {
        let payloads = [
            json!({}),
            json!({"devId": "abc", "dps": {"1": true, "27": "strong", "39": 80}}),
            json!({"t": "1700000000", "uid": "x".repeat(300)}),
        ];
        let cmds = [
            CommandType::Control,
            CommandType::Status,
            CommandType::DpQuery,
            CommandType::HeartBeat,
        ];
        for version in [Version::V3_1, Version::V3_3] {
            let codec = codec(version);
            for payload in &payloads {
                for cmd in cmds {
                    let bytes = codec.encode(42, cmd as u32, payload).unwrap();
                    let decoded = codec.decode(&bytes).unwrap();
                    assert_eq!(&decoded.payload, payload, "{} {:?}", version, cmd);
                }
            }
        }
    }

    #[test]
    fn test_payload_bit_flip_is_checksum_error() {
        for version in [Version::V3_1, Version::V3_3] {
            let codec = codec(version);
            let bytes = codec
                .encode(3, CommandType::Control as u32, &json!({"dps": {"1": true}}))
                .unwrap();
            let payload_end = bytes.len() - 8;
            for byte in HEADER_LEN..payload_end {
                for bit in 0..8 {
                    let mut corrupted = bytes.clone();
                    corrupted[byte] ^= 1 << bit;
                    assert_eq!(codec.decode(&corrupted), Err(TuyaError::CrcMismatch));
                }
            }
        }
    }

    #[test]
    fn test_device_frame_with_retcode_and_header() {
        let codec = codec(Version::V3_3);
        let packet = Packet {
            seqno: 0,
            cmd: CommandType::Status as u32,
            retcode: Some(0),
            payload: json!({"dps": {"15": "docked"}}),
        };
        let bytes = codec.encode_packet(&packet).unwrap();
        // retcode, then the version header in clear
        assert_eq!(&bytes[HEADER_LEN + 4..HEADER_LEN + 7], b"3.3");
        assert_eq!(codec.decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_empty_ack_has_null_payload() {
        let codec = codec(Version::V3_3);
        let ack = Packet {
            seqno: 9,
            cmd: CommandType::Control as u32,
            retcode: Some(0),
            payload: Value::Null,
        };
        assert_eq!(codec.decode(&codec.encode_packet(&ack).unwrap()).unwrap(), ack);
    }

    #[test]
    fn test_rejection_with_text_body() {
        for version in [Version::V3_3, Version::V3_1] {
            let codec = codec(version);
            let bytes = pack_message(&TuyaMessage {
                seqno: 4,
                cmd: CommandType::Control as u32,
                retcode: Some(1),
                payload: b"json obj data unvalid".to_vec(),
            })
            .unwrap();
            let packet = codec.decode(&bytes).unwrap();
            assert_eq!(packet.seqno, 4);
            assert_eq!(packet.retcode, Some(1));
            assert_eq!(packet.payload, json!("json obj data unvalid"));
        }
    }

    #[test]
    fn test_success_frame_with_garbage_body_is_error() {
        let codec = codec(Version::V3_3);
        let bytes = pack_message(&TuyaMessage {
            seqno: 4,
            cmd: CommandType::Status as u32,
            retcode: Some(0),
            payload: vec![0x5A; 32],
        })
        .unwrap();
        let err = codec.decode(&bytes).unwrap_err();
        assert!(err.is_crypto_error() || matches!(err, TuyaError::Json(_)));
    }

    #[test]
    fn test_wrong_key_is_crypto_error() {
        let sender = codec(Version::V3_3);
        let receiver = PacketCodec::new(b"fedcba9876543210", Version::V3_3).unwrap();
        let bytes = sender
            .encode(1, CommandType::DpQuery as u32, &json!({"devId": "abc"}))
            .unwrap();
        let err = receiver.decode(&bytes).unwrap_err();
        assert!(err.is_crypto_error() || matches!(err, TuyaError::Json(_)));
    }

    #[test]
    fn test_v31_signature_checked() {
        let sender = codec(Version::V3_1);
        let receiver = PacketCodec::new(b"fedcba9876543210", Version::V3_1).unwrap();
        let bytes = sender
            .encode(1, CommandType::Control as u32, &json!({"dps": {"1": true}}))
            .unwrap();
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 3], b"3.1");
        assert_eq!(receiver.decode(&bytes), Err(TuyaError::SignatureMismatch));
    }

    #[test]
    fn test_v31_query_is_plaintext() {
        let codec = codec(Version::V3_1);
        let bytes = codec
            .encode(1, CommandType::DpQuery as u32, &json!({"gwId": "abc"}))
            .unwrap();
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 1], b"{");
    }

    #[test]
    fn test_v33_plaintext_reply_accepted() {
        let codec = codec(Version::V3_3);
        let raw = pack_message(&TuyaMessage {
            seqno: 5,
            cmd: CommandType::DpQuery as u32,
            retcode: Some(0),
            payload: br#"{"dps":{"1":false}}"#.to_vec(),
        })
        .unwrap();
        let packet = codec.decode(&raw).unwrap();
        assert_eq!(packet.payload, json!({"dps": {"1": false}}));
    }
}
