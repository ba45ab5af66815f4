//! Tunnel wire protocol
//!
//! Every message is `[type: u8][length: u16 BE][payload]`. Authentication
//! messages are only valid before a session is established; frames, pings
//! and goodbyes only after.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Size of the authentication nonce
pub const NONCE_LEN: usize = 16;

/// Size of the authentication proof (HMAC-SHA256)
pub const PROOF_LEN: usize = 32;

/// Largest payload a single message can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const HEADER_LEN: usize = 3;

const MSG_CHALLENGE: u8 = 0x01;
const MSG_IDENTIFY: u8 = 0x02;
const MSG_ACCEPTED: u8 = 0x03;
const MSG_REJECTED: u8 = 0x04;
const MSG_FRAME: u8 = 0x10;
const MSG_PING: u8 = 0x11;
const MSG_GOODBYE: u8 = 0x12;

/// Messages exchanged over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // ========== Authentication ==========
    /// Fresh nonce the peer must bind its proof to
    Challenge { nonce: [u8; NONCE_LEN] },

    /// Claimed identity and proof of knowledge of its pre-shared key
    Identify { address: Ipv4Addr, proof: [u8; PROOF_LEN] },

    /// The peer's identity was verified
    Accepted,

    /// The peer's identity was refused
    Rejected,

    // ========== Established session ==========
    /// One Ethernet frame
    Frame(Bytes),

    /// Keepalive, never delivered to the device
    Ping { seq: u64, timestamp_ms: i64 },

    /// Orderly session close
    Goodbye,
}

impl Message {
    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Challenge { .. } => "Challenge",
            Message::Identify { .. } => "Identify",
            Message::Accepted => "Accepted",
            Message::Rejected => "Rejected",
            Message::Frame(_) => "Frame",
            Message::Ping { .. } => "Ping",
            Message::Goodbye => "Goodbye",
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Message::Challenge { .. } => MSG_CHALLENGE,
            Message::Identify { .. } => MSG_IDENTIFY,
            Message::Accepted => MSG_ACCEPTED,
            Message::Rejected => MSG_REJECTED,
            Message::Frame(_) => MSG_FRAME,
            Message::Ping { .. } => MSG_PING,
            Message::Goodbye => MSG_GOODBYE,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Challenge { .. } => NONCE_LEN,
            Message::Identify { .. } => 4 + PROOF_LEN,
            Message::Frame(frame) => frame.len(),
            Message::Ping { .. } => 16,
            Message::Accepted | Message::Rejected | Message::Goodbye => 0,
        }
    }

    fn decode_payload(kind: u8, mut payload: Bytes) -> Result<Self> {
        let message = match kind {
            MSG_CHALLENGE => {
                expect_len(kind, &payload, NONCE_LEN)?;
                let mut nonce = [0u8; NONCE_LEN];
                payload.copy_to_slice(&mut nonce);
                Message::Challenge { nonce }
            }
            MSG_IDENTIFY => {
                expect_len(kind, &payload, 4 + PROOF_LEN)?;
                let address = Ipv4Addr::from(payload.get_u32());
                let mut proof = [0u8; PROOF_LEN];
                payload.copy_to_slice(&mut proof);
                Message::Identify { address, proof }
            }
            MSG_ACCEPTED => {
                expect_len(kind, &payload, 0)?;
                Message::Accepted
            }
            MSG_REJECTED => {
                expect_len(kind, &payload, 0)?;
                Message::Rejected
            }
            MSG_FRAME => {
                if payload.is_empty() {
                    return Err(Error::Protocol("empty frame".into()));
                }
                Message::Frame(payload)
            }
            MSG_PING => {
                expect_len(kind, &payload, 16)?;
                let seq = payload.get_u64();
                let timestamp_ms = payload.get_i64();
                Message::Ping { seq, timestamp_ms }
            }
            MSG_GOODBYE => {
                expect_len(kind, &payload, 0)?;
                Message::Goodbye
            }
            other => return Err(Error::Protocol(format!("unknown message type {:#04x}", other))),
        };
        Ok(message)
    }
}

fn expect_len(kind: u8, payload: &Bytes, len: usize) -> Result<()> {
    if payload.len() != len {
        return Err(Error::Protocol(format!(
            "message type {:#04x} carries {} bytes, expected {}",
            kind,
            payload.len(),
            len
        )));
    }
    Ok(())
}

/// Length-prefixed codec for `Message`
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelCodec;

impl Decoder for TunnelCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = src[0];
        let length = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Message::decode_payload(kind, payload).map(Some)
    }
}

impl Encoder<Message> for TunnelCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let length = message.payload_len();
        if length > MAX_PAYLOAD {
            return Err(Error::Protocol(format!("{} of {} bytes exceeds the wire limit", message.type_name(), length)));
        }

        dst.reserve(HEADER_LEN + length);
        dst.put_u8(message.type_byte());
        dst.put_u16(length as u16);
        match message {
            Message::Challenge { nonce } => dst.put_slice(&nonce),
            Message::Identify { address, proof } => {
                dst.put_u32(u32::from(address));
                dst.put_slice(&proof);
            }
            Message::Frame(frame) => dst.put_slice(&frame),
            Message::Ping { seq, timestamp_ms } => {
                dst.put_u64(seq);
                dst.put_i64(timestamp_ms);
            }
            Message::Accepted | Message::Rejected | Message::Goodbye => {}
        }
        Ok(())
    }
}
