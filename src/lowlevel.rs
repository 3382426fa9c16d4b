//! Raw record framing: header, content and padding, with no interpretation of the content.

use crate::error::Error;
use crate::s11n::*;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One record as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Raw type byte; see `RecordType` for the ones this crate understands.
    pub record_type: u8,
    pub request_id: u16,
    pub content: Bytes,
    /// Number of padding bytes following the content.
    pub padding: u8,
}

impl Record {
    /// A record padded so its total length is a multiple of 8.
    pub fn new(record_type: RecordType, request_id: u16, content: Bytes) -> Record {
        let padding = padding_for(content.len());
        Record { record_type: record_type as u8, request_id, content, padding }
    }

    pub fn is_management(&self) -> bool {
        self.request_id == MANAGEMENT_REQUEST_ID
    }
}

#[derive(Debug, Default)]
pub struct FastcgiLowlevelCodec;

fn peek_header(buf: &BytesMut) -> Option<FastcgiRecordHeader> {
    let bytes: &[u8; FastcgiRecordHeader::LEN] = buf.get(..FastcgiRecordHeader::LEN)?
        .try_into()
        .ok()?;
    Some(FastcgiRecordHeader::from_bytes(bytes))
}

impl Decoder for FastcgiLowlevelCodec {
    type Item = Record;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, Error> {
        // Only borrow from the buffer until the whole record is there.
        let header = match peek_header(buf) {
            Some(header) => header,
            None => {
                debug!("insufficient buffer for header: {} bytes", buf.len());
                return Ok(None);
            }
        };

        if header.version != FASTCGI_VERSION {
            let msg = format!("unexpected FCGI version {}", header.version);
            error!("{}", msg);
            return Err(Error::MalformedRecord(msg));
        }

        let record_len = header.record_len();
        if buf.len() < record_len {
            buf.reserve(record_len - buf.len());
            debug!("insufficient buffer for record: have {}, need {}", buf.len(), record_len);
            return Ok(None);
        }

        // Consume from the buffer now.
        buf.advance(FastcgiRecordHeader::LEN);
        let content = buf.split_to(header.content_length as usize).freeze();
        buf.advance(header.padding_length as usize);

        debug!("request id: {}; record type: {}, {} bytes of content, {} of padding",
               header.request_id, header.record_type, content.len(), header.padding_length);

        Ok(Some(Record {
            record_type: header.record_type,
            request_id: header.request_id,
            content,
            padding: header.padding_length,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, Error> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None if buf.is_empty() => Ok(None),
            None => {
                let msg = format!("stream ended inside a record ({} bytes left over)", buf.len());
                error!("{}", msg);
                Err(Error::MalformedRecord(msg))
            }
        }
    }
}

impl Encoder<Record> for FastcgiLowlevelCodec {
    type Error = Error;

    fn encode(&mut self, record: Record, buf: &mut BytesMut) -> Result<(), Error> {
        if record.content.len() > MAX_CONTENT_LENGTH {
            let msg = format!("type {} record is too long: {}",
                              record.record_type, record.content.len());
            error!("{}", msg);
            return Err(Error::MalformedRecord(msg));
        }

        let header = FastcgiRecordHeader {
            version: FASTCGI_VERSION,
            record_type: record.record_type,
            request_id: record.request_id,
            content_length: record.content.len() as u16,
            padding_length: record.padding,
            reserved: 0,
        };
        buf.reserve(header.record_len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&record.content);
        buf.extend_from_slice(&[0u8; 255][..record.padding as usize]);

        Ok(())
    }
}
