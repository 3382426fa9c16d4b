use crate::error::Error;
use crate::lowlevel::{FastcgiLowlevelCodec, Record};
use crate::params::{decode_pairs, encode_pairs};
use crate::s11n::*;

use bytes::{Bytes, BytesMut};
use enum_primitive::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FastcgiRecord {
    pub request_id: u16,
    pub body: FastcgiRecordBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FastcgiRecordBody {
    BeginRequest(BeginRequest),
    AbortRequest,
    EndRequest(EndRequest),
    /// A chunk of the params stream. Pairs may straddle chunks, so this is left encoded.
    Params(Bytes),
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Data(Bytes),
    GetValues(Vec<Bytes>),
    GetValuesResult(Vec<(Bytes, Bytes)>),
    UnknownTypeResponse(u8),
    UnknownType(u8, Bytes), // this one is the incoming record of a type we don't know
}

impl FastcgiRecordBody {
    pub fn record_type(&self) -> Option<RecordType> {
        Some(match *self {
            FastcgiRecordBody::BeginRequest(_) => RecordType::BeginRequest,
            FastcgiRecordBody::AbortRequest => RecordType::AbortRequest,
            FastcgiRecordBody::EndRequest(_) => RecordType::EndRequest,
            FastcgiRecordBody::Params(_) => RecordType::Params,
            FastcgiRecordBody::Stdin(_) => RecordType::Stdin,
            FastcgiRecordBody::Stdout(_) => RecordType::Stdout,
            FastcgiRecordBody::Stderr(_) => RecordType::Stderr,
            FastcgiRecordBody::Data(_) => RecordType::Data,
            FastcgiRecordBody::GetValues(_) => RecordType::GetValues,
            FastcgiRecordBody::GetValuesResult(_) => RecordType::GetValuesResult,
            FastcgiRecordBody::UnknownTypeResponse(_) => RecordType::UnknownType,
            FastcgiRecordBody::UnknownType(..) => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeginRequest {
    /// The role code as sent; see `role()`.
    pub role_code: u16,
    pub keep_connection: bool,
}

impl BeginRequest {
    pub fn new(role: Role, keep_connection: bool) -> BeginRequest {
        BeginRequest { role_code: role as u16, keep_connection }
    }

    /// `None` for role codes this crate doesn't know; those get `FCGI_UNKNOWN_ROLE`.
    pub fn role(&self) -> Option<Role> {
        Role::from_u16(self.role_code)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

/// Typed records on top of `FastcgiLowlevelCodec`.
///
/// Both directions are understood so the same codec serves the application side and
/// test clients; which record types are legal from a peer is the connection's business.
/// Encoded records are padded to a multiple of 8 bytes.
#[derive(Debug, Default)]
pub struct FastcgiCodec {
    inner: FastcgiLowlevelCodec,
}

fn malformed<T>(msg: String) -> Result<T, Error> {
    error!("{}", msg);
    Err(Error::MalformedRecord(msg))
}

fn parse_body(record: Record) -> Result<FastcgiRecordBody, Error> {
    let record_type = match RecordType::from_u8(record.record_type) {
        Some(t) => t,
        None => {
            warn!("unknown record type {}", record.record_type);
            return Ok(FastcgiRecordBody::UnknownType(record.record_type, record.content));
        }
    };

    let content = record.content;
    let body = match record_type {
        RecordType::BeginRequest => {
            let raw = match BeginRequestBody::from_bytes(&content) {
                Some(raw) => raw,
                None => return malformed(format!("BeginRequest body of {} bytes", content.len())),
            };
            FastcgiRecordBody::BeginRequest(BeginRequest {
                role_code: raw.role,
                keep_connection: (raw.flags & FCGI_KEEP_CONN) == FCGI_KEEP_CONN,
            })
        },
        RecordType::AbortRequest => FastcgiRecordBody::AbortRequest,
        RecordType::EndRequest => {
            let raw = match EndRequestBody::from_bytes(&content) {
                Some(raw) => raw,
                None => return malformed(format!("EndRequest body of {} bytes", content.len())),
            };
            let protocol_status = match ProtocolStatus::from_u8(raw.protocol_status) {
                Some(status) => status,
                None => return malformed(format!("unknown protocol status {}", raw.protocol_status)),
            };
            FastcgiRecordBody::EndRequest(EndRequest { app_status: raw.app_status, protocol_status })
        },
        RecordType::Params => FastcgiRecordBody::Params(content),
        RecordType::Stdin => FastcgiRecordBody::Stdin(content),
        RecordType::Stdout => FastcgiRecordBody::Stdout(content),
        RecordType::Stderr => FastcgiRecordBody::Stderr(content),
        RecordType::Data => FastcgiRecordBody::Data(content),
        RecordType::GetValues => {
            let names = decode_pairs(content)?.into_iter().map(|(name, _value)| name).collect();
            FastcgiRecordBody::GetValues(names)
        },
        RecordType::GetValuesResult => FastcgiRecordBody::GetValuesResult(decode_pairs(content)?),
        RecordType::UnknownType => {
            match UnknownTypeBody::from_bytes(&content) {
                Some(raw) => FastcgiRecordBody::UnknownTypeResponse(raw.record_type),
                None => return malformed(format!("UnknownType body of {} bytes", content.len())),
            }
        },
    };
    Ok(body)
}

fn write_body(body: FastcgiRecordBody) -> Result<(u8, Bytes), Error> {
    let record_type = body.record_type();
    let content = match body {
        FastcgiRecordBody::BeginRequest(begin) => {
            let raw = BeginRequestBody {
                role: begin.role_code,
                flags: if begin.keep_connection { FCGI_KEEP_CONN } else { 0 },
                reserved: [0u8; 5],
            };
            Bytes::copy_from_slice(&raw.to_bytes())
        },
        FastcgiRecordBody::AbortRequest => Bytes::new(),
        FastcgiRecordBody::EndRequest(end) => {
            let raw = EndRequestBody {
                app_status: end.app_status,
                protocol_status: end.protocol_status as u8,
                reserved: [0u8; 3],
            };
            Bytes::copy_from_slice(&raw.to_bytes())
        },
        FastcgiRecordBody::Params(buf)
            | FastcgiRecordBody::Stdin(buf)
            | FastcgiRecordBody::Stdout(buf)
            | FastcgiRecordBody::Stderr(buf)
            | FastcgiRecordBody::Data(buf) => buf,
        FastcgiRecordBody::GetValues(names) => {
            let mut out = BytesMut::new();
            encode_pairs(names.iter().map(|n| (n.as_ref(), &b""[..])), &mut out)?;
            out.freeze()
        },
        FastcgiRecordBody::GetValuesResult(values) => {
            let mut out = BytesMut::new();
            encode_pairs(values.iter().map(|(n, v)| (n.as_ref(), v.as_ref())), &mut out)?;
            out.freeze()
        },
        FastcgiRecordBody::UnknownTypeResponse(typ) => {
            let raw = UnknownTypeBody { record_type: typ, reserved: [0u8; 7] };
            Bytes::copy_from_slice(&raw.to_bytes())
        },
        FastcgiRecordBody::UnknownType(typ, buf) => return Ok((typ, buf)),
    };
    // Every variant but UnknownType has a record type.
    let record_type = record_type.map(|t| t as u8).unwrap_or_default();
    Ok((record_type, content))
}

impl Decoder for FastcgiCodec {
    type Item = FastcgiRecord;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FastcgiRecord>, Error> {
        match self.inner.decode(buf)? {
            Some(record) => {
                let request_id = record.request_id;
                let body = parse_body(record)?;
                Ok(Some(FastcgiRecord { request_id, body }))
            },
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<FastcgiRecord>, Error> {
        match self.inner.decode_eof(buf)? {
            Some(record) => {
                let request_id = record.request_id;
                let body = parse_body(record)?;
                Ok(Some(FastcgiRecord { request_id, body }))
            },
            None => Ok(None),
        }
    }
}

impl Encoder<FastcgiRecord> for FastcgiCodec {
    type Error = Error;

    fn encode(&mut self, msg: FastcgiRecord, buf: &mut BytesMut) -> Result<(), Error> {
        let (record_type, content) = write_body(msg.body)?;
        let record = Record {
            record_type,
            request_id: msg.request_id,
            padding: padding_for(content.len()),
            content,
        };
        self.inner.encode(record, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(record: FastcgiRecord) -> FastcgiRecord {
        let mut codec = FastcgiCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(record, &mut buf).unwrap();
        assert_eq!(buf.len() % 8, 0, "records are padded");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn begin_request_flags() {
        let record = FastcgiRecord {
            request_id: 3,
            body: FastcgiRecordBody::BeginRequest(BeginRequest::new(Role::Authorizer, true)),
        };
        let decoded = round_trip(record.clone());
        assert_eq!(decoded, record);
        match decoded.body {
            FastcgiRecordBody::BeginRequest(begin) => {
                assert_eq!(begin.role(), Some(Role::Authorizer));
                assert!(begin.keep_connection);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_role_decodes() {
        let begin = BeginRequest { role_code: 42, keep_connection: false };
        let decoded = round_trip(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::BeginRequest(begin),
        });
        assert_eq!(decoded.body, FastcgiRecordBody::BeginRequest(begin));
        assert_eq!(begin.role(), None);
    }

    #[test]
    fn end_request_wire_format() {
        let mut buf = BytesMut::new();
        FastcgiCodec::default().encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::EndRequest(EndRequest {
                app_status: 0,
                protocol_status: ProtocolStatus::CantMultiplexConnections,
            }),
        }, &mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 3, 0, 1, 0, 8, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn management_records() {
        let names = vec![Bytes::from(FCGI_MAX_CONNS), Bytes::from(FCGI_MPXS_CONNS)];
        let decoded = round_trip(FastcgiRecord {
            request_id: 0,
            body: FastcgiRecordBody::GetValues(names.clone()),
        });
        assert_eq!(decoded.body, FastcgiRecordBody::GetValues(names));

        let values = vec![(Bytes::from(FCGI_MAX_REQS), Bytes::from("10"))];
        let decoded = round_trip(FastcgiRecord {
            request_id: 0,
            body: FastcgiRecordBody::GetValuesResult(values.clone()),
        });
        assert_eq!(decoded.body, FastcgiRecordBody::GetValuesResult(values));

        let decoded = round_trip(FastcgiRecord {
            request_id: 0,
            body: FastcgiRecordBody::UnknownTypeResponse(99),
        });
        assert_eq!(decoded.body, FastcgiRecordBody::UnknownTypeResponse(99));
    }

    #[test]
    fn unknown_type_passes_through() {
        let mut buf = BytesMut::new();
        FastcgiLowlevelCodec.encode(Record {
            record_type: 77,
            request_id: 0,
            content: Bytes::from_static(b"??"),
            padding: 0,
        }, &mut buf).unwrap();
        let decoded = FastcgiCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.body, FastcgiRecordBody::UnknownType(77, Bytes::from_static(b"??")));
    }

    #[test]
    fn short_begin_request_is_malformed() {
        let mut buf = BytesMut::new();
        FastcgiLowlevelCodec.encode(Record::new(RecordType::BeginRequest, 1,
                                                Bytes::from_static(&[0, 1])), &mut buf).unwrap();
        match FastcgiCodec::default().decode(&mut buf) {
            Err(Error::MalformedRecord(_)) => (),
            other => panic!("expected MalformedRecord, got {:?}", other),
        }
    }
}
