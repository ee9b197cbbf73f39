//! Binary framing and session-message encode/decode for FIXP.
//!
//! Frames start with a Simple Open Framing Header: `MessageLength: u16 BE`
//! (the length of the SOFH itself plus the payload) followed by
//! `EncodingType: u16 BE == 0xCB01` (SBE 1.0 little-endian, per the FIXP
//! binary entry point convention). The payload is a `u16` template id
//! followed by fixed-width little-endian fields, mirroring SBE's own
//! encoding; a generated SBE schema compiler is an out-of-scope
//! collaborator, so only the session templates the state machine needs are
//! implemented here.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

pub const SOFH_ENCODING_TYPE: u16 = 0xCB01;
pub const SOFH_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TemplateId {
    Negotiate = 1,
    NegotiateResponse = 2,
    NegotiateReject = 3,
    Establish = 4,
    EstablishAck = 5,
    EstablishReject = 6,
    Sequence = 7,
    NotApplied = 8,
    RetransmitRequest = 9,
    Retransmission = 10,
    RetransmitReject = 11,
    FinishedSending = 12,
    FinishedReceiving = 13,
    Terminate = 14,
}

impl TemplateId {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Negotiate,
            2 => Self::NegotiateResponse,
            3 => Self::NegotiateReject,
            4 => Self::Establish,
            5 => Self::EstablishAck,
            6 => Self::EstablishReject,
            7 => Self::Sequence,
            8 => Self::NotApplied,
            9 => Self::RetransmitRequest,
            10 => Self::Retransmission,
            11 => Self::RetransmitReject,
            12 => Self::FinishedSending,
            13 => Self::FinishedReceiving,
            14 => Self::Terminate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixPParseError {
    TooShort,
    BadEncodingType(u16),
    UnknownTemplate(u16),
    LengthMismatch,
}

impl fmt::Display for FixPParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixPParseError::TooShort => write!(f, "frame shorter than SOFH"),
            FixPParseError::BadEncodingType(t) => write!(f, "unexpected encoding type {t:#06x}"),
            FixPParseError::UnknownTemplate(t) => write!(f, "unknown template id {t}"),
            FixPParseError::LengthMismatch => write!(f, "SOFH message length does not match frame"),
        }
    }
}

impl std::error::Error for FixPParseError {}

/// A decoded FIXP session message. Business-message templates are passed
/// through the engine untouched and are not represented here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixPMessage {
    Negotiate {
        session_id: u64,
        session_ver_id: u64,
        timestamp: u64,
    },
    NegotiateResponse {
        session_id: u64,
        request_timestamp: u64,
    },
    NegotiateReject {
        session_id: u64,
        reason: NegotiateRejectCode,
    },
    Establish {
        session_id: u64,
        keep_alive_interval_ms: u32,
        timestamp: u64,
    },
    EstablishAck {
        next_seq_no: u64,
        prev_seq_no: u64,
    },
    EstablishReject {
        reason: EstablishRejectCode,
    },
    Sequence {
        next_seq_no: u64,
    },
    NotApplied {
        from_seq_no: u64,
        count: u64,
    },
    RetransmitRequest {
        session_id: u64,
        from_seq_no: u64,
        count: u64,
    },
    Retransmission {
        from_seq_no: u64,
        count: u64,
    },
    RetransmitReject {
        reason: RetransmitRejectCode,
    },
    FinishedSending {
        last_seq_no: u64,
    },
    FinishedReceiving,
    Terminate {
        reason_code: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateRejectCode {
    DuplicateId,
    Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishRejectCode {
    Unnegotiated,
    Credentials,
    AlreadyEstablished,
    KeepaliveInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitRejectCode {
    OutOfRange,
    InvalidSession,
    RequestLimitExceeded,
}

fn code_to_u16<T: Copy + PartialEq>(value: T, table: &[(T, u16)]) -> u16 {
    table.iter().find(|(v, _)| *v == value).map(|(_, c)| *c).unwrap_or(0)
}

fn code_from_u16<T: Copy>(code: u16, table: &[(T, u16)]) -> Option<T> {
    table.iter().find(|(_, c)| *c == code).map(|(v, _)| *v)
}

const NEGOTIATE_REJECT_CODES: &[(NegotiateRejectCode, u16)] = &[
    (NegotiateRejectCode::DuplicateId, 1),
    (NegotiateRejectCode::Credentials, 2),
];
const ESTABLISH_REJECT_CODES: &[(EstablishRejectCode, u16)] = &[
    (EstablishRejectCode::Unnegotiated, 1),
    (EstablishRejectCode::Credentials, 2),
    (EstablishRejectCode::AlreadyEstablished, 3),
    (EstablishRejectCode::KeepaliveInterval, 4),
];
const RETRANSMIT_REJECT_CODES: &[(RetransmitRejectCode, u16)] = &[
    (RetransmitRejectCode::OutOfRange, 1),
    (RetransmitRejectCode::InvalidSession, 2),
    (RetransmitRejectCode::RequestLimitExceeded, 3),
];

impl FixPMessage {
    /// Encodes this message with its SOFH, ready to write to the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let template = self.template_id();
        body.extend_from_slice(&(template as u16).to_le_bytes());

        match self {
            FixPMessage::Negotiate {
                session_id,
                session_ver_id,
                timestamp,
            } => {
                put_u64(&mut body, *session_id);
                put_u64(&mut body, *session_ver_id);
                put_u64(&mut body, *timestamp);
            }
            FixPMessage::NegotiateResponse {
                session_id,
                request_timestamp,
            } => {
                put_u64(&mut body, *session_id);
                put_u64(&mut body, *request_timestamp);
            }
            FixPMessage::NegotiateReject { session_id, reason } => {
                put_u64(&mut body, *session_id);
                body.extend_from_slice(&code_to_u16(*reason, NEGOTIATE_REJECT_CODES).to_le_bytes());
            }
            FixPMessage::Establish {
                session_id,
                keep_alive_interval_ms,
                timestamp,
            } => {
                put_u64(&mut body, *session_id);
                body.extend_from_slice(&keep_alive_interval_ms.to_le_bytes());
                put_u64(&mut body, *timestamp);
            }
            FixPMessage::EstablishAck { next_seq_no, prev_seq_no } => {
                put_u64(&mut body, *next_seq_no);
                put_u64(&mut body, *prev_seq_no);
            }
            FixPMessage::EstablishReject { reason } => {
                body.extend_from_slice(&code_to_u16(*reason, ESTABLISH_REJECT_CODES).to_le_bytes());
            }
            FixPMessage::Sequence { next_seq_no } => put_u64(&mut body, *next_seq_no),
            FixPMessage::NotApplied { from_seq_no, count } => {
                put_u64(&mut body, *from_seq_no);
                put_u64(&mut body, *count);
            }
            FixPMessage::RetransmitRequest {
                session_id,
                from_seq_no,
                count,
            } => {
                put_u64(&mut body, *session_id);
                put_u64(&mut body, *from_seq_no);
                put_u64(&mut body, *count);
            }
            FixPMessage::Retransmission { from_seq_no, count } => {
                put_u64(&mut body, *from_seq_no);
                put_u64(&mut body, *count);
            }
            FixPMessage::RetransmitReject { reason } => {
                body.extend_from_slice(&code_to_u16(*reason, RETRANSMIT_REJECT_CODES).to_le_bytes());
            }
            FixPMessage::FinishedSending { last_seq_no } => put_u64(&mut body, *last_seq_no),
            FixPMessage::FinishedReceiving => {}
            FixPMessage::Terminate { reason_code } => body.extend_from_slice(&reason_code.to_le_bytes()),
        }

        let mut framed = Vec::with_capacity(SOFH_LEN + body.len());
        let message_length = (SOFH_LEN + body.len()) as u16;
        framed.extend_from_slice(&message_length.to_be_bytes());
        framed.extend_from_slice(&SOFH_ENCODING_TYPE.to_be_bytes());
        framed.extend_from_slice(&body);
        framed
    }

    fn template_id(&self) -> TemplateId {
        match self {
            FixPMessage::Negotiate { .. } => TemplateId::Negotiate,
            FixPMessage::NegotiateResponse { .. } => TemplateId::NegotiateResponse,
            FixPMessage::NegotiateReject { .. } => TemplateId::NegotiateReject,
            FixPMessage::Establish { .. } => TemplateId::Establish,
            FixPMessage::EstablishAck { .. } => TemplateId::EstablishAck,
            FixPMessage::EstablishReject { .. } => TemplateId::EstablishReject,
            FixPMessage::Sequence { .. } => TemplateId::Sequence,
            FixPMessage::NotApplied { .. } => TemplateId::NotApplied,
            FixPMessage::RetransmitRequest { .. } => TemplateId::RetransmitRequest,
            FixPMessage::Retransmission { .. } => TemplateId::Retransmission,
            FixPMessage::RetransmitReject { .. } => TemplateId::RetransmitReject,
            FixPMessage::FinishedSending { .. } => TemplateId::FinishedSending,
            FixPMessage::FinishedReceiving => TemplateId::FinishedReceiving,
            FixPMessage::Terminate { .. } => TemplateId::Terminate,
        }
    }

    /// Decodes one complete framed message (SOFH + payload).
    pub fn decode(frame: &[u8]) -> Result<Self, FixPParseError> {
        if frame.len() < SOFH_LEN + 2 {
            return Err(FixPParseError::TooShort);
        }
        let message_length = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        if message_length != frame.len() {
            return Err(FixPParseError::LengthMismatch);
        }
        let encoding_type = u16::from_be_bytes([frame[2], frame[3]]);
        if encoding_type != SOFH_ENCODING_TYPE {
            return Err(FixPParseError::BadEncodingType(encoding_type));
        }
        let body = &frame[SOFH_LEN..];
        let template_raw = LittleEndian::read_u16(&body[0..2]);
        let template = TemplateId::from_u16(template_raw).ok_or(FixPParseError::UnknownTemplate(template_raw))?;
        let mut rest = &body[2..];

        Ok(match template {
            TemplateId::Negotiate => FixPMessage::Negotiate {
                session_id: take_u64(&mut rest),
                session_ver_id: take_u64(&mut rest),
                timestamp: take_u64(&mut rest),
            },
            TemplateId::NegotiateResponse => FixPMessage::NegotiateResponse {
                session_id: take_u64(&mut rest),
                request_timestamp: take_u64(&mut rest),
            },
            TemplateId::NegotiateReject => FixPMessage::NegotiateReject {
                session_id: take_u64(&mut rest),
                reason: code_from_u16(take_u16(&mut rest), NEGOTIATE_REJECT_CODES)
                    .unwrap_or(NegotiateRejectCode::Credentials),
            },
            TemplateId::Establish => FixPMessage::Establish {
                session_id: take_u64(&mut rest),
                keep_alive_interval_ms: take_u32(&mut rest),
                timestamp: take_u64(&mut rest),
            },
            TemplateId::EstablishAck => FixPMessage::EstablishAck {
                next_seq_no: take_u64(&mut rest),
                prev_seq_no: take_u64(&mut rest),
            },
            TemplateId::EstablishReject => FixPMessage::EstablishReject {
                reason: code_from_u16(take_u16(&mut rest), ESTABLISH_REJECT_CODES)
                    .unwrap_or(EstablishRejectCode::Credentials),
            },
            TemplateId::Sequence => FixPMessage::Sequence {
                next_seq_no: take_u64(&mut rest),
            },
            TemplateId::NotApplied => FixPMessage::NotApplied {
                from_seq_no: take_u64(&mut rest),
                count: take_u64(&mut rest),
            },
            TemplateId::RetransmitRequest => FixPMessage::RetransmitRequest {
                session_id: take_u64(&mut rest),
                from_seq_no: take_u64(&mut rest),
                count: take_u64(&mut rest),
            },
            TemplateId::Retransmission => FixPMessage::Retransmission {
                from_seq_no: take_u64(&mut rest),
                count: take_u64(&mut rest),
            },
            TemplateId::RetransmitReject => FixPMessage::RetransmitReject {
                reason: code_from_u16(take_u16(&mut rest), RETRANSMIT_REJECT_CODES)
                    .unwrap_or(RetransmitRejectCode::InvalidSession),
            },
            TemplateId::FinishedSending => FixPMessage::FinishedSending {
                last_seq_no: take_u64(&mut rest),
            },
            TemplateId::FinishedReceiving => FixPMessage::FinishedReceiving,
            TemplateId::Terminate => FixPMessage::Terminate {
                reason_code: take_u32(&mut rest),
            },
        })
    }
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn take_u64(rest: &mut &[u8]) -> u64 {
    let v = LittleEndian::read_u64(&rest[0..8]);
    *rest = &rest[8..];
    v
}

fn take_u32(rest: &mut &[u8]) -> u32 {
    let v = LittleEndian::read_u32(&rest[0..4]);
    *rest = &rest[4..];
    v
}

fn take_u16(rest: &mut &[u8]) -> u16 {
    let v = LittleEndian::read_u16(&rest[0..2]);
    *rest = &rest[2..];
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_round_trips() {
        let msg = FixPMessage::Negotiate {
            session_id: 42,
            session_ver_id: 1,
            timestamp: 123456789,
        };
        let frame = msg.encode();
        let decoded = FixPMessage::decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn establish_ack_round_trips() {
        let msg = FixPMessage::EstablishAck {
            next_seq_no: 5,
            prev_seq_no: 4,
        };
        assert_eq!(FixPMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn bad_encoding_type_is_rejected() {
        let mut frame = FixPMessage::Sequence { next_seq_no: 1 }.encode();
        frame[2] = 0x00;
        frame[3] = 0x00;
        assert!(matches!(
            FixPMessage::decode(&frame),
            Err(FixPParseError::BadEncodingType(_))
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut frame = FixPMessage::FinishedReceiving.encode();
        frame.push(0xff);
        assert_eq!(FixPMessage::decode(&frame), Err(FixPParseError::LengthMismatch));
    }
}
