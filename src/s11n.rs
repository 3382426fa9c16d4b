//! s11n == serialization. Structs that match the bytes that make up FastCGI messages.

use byteorder::{ByteOrder, NetworkEndian};

pub const FASTCGI_VERSION: u8 = 1;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = 0xFFFF;

/// Request id of management records.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

// Variables for the RecordType::GetValues and GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// Bit 0 of `BeginRequestBody::flags`.
pub const FCGI_KEEP_CONN: u8 = 1;

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RecordType {
        BeginRequest = 1,
        AbortRequest = 2,
        EndRequest = 3,
        Params = 4,
        Stdin = 5,
        Stdout = 6,
        Stderr = 7,
        Data = 8,
        GetValues = 9,
        GetValuesResult = 10,
        UnknownType = 11,
    }
}

enum_from_primitive! {
    #[repr(u16)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Role {
        Responder = 1,
        Authorizer = 2,
        Filter = 3,
    }
}

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ProtocolStatus {
        RequestComplete = 0,
        CantMultiplexConnections = 1,
        Overloaded = 2,
        UnknownRole = 3,
    }
}

/// The fixed 8-byte header in front of every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FastcgiRecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl FastcgiRecordHeader {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> FastcgiRecordHeader {
        FastcgiRecordHeader {
            version: bytes[0],
            record_type: bytes[1],
            request_id: NetworkEndian::read_u16(&bytes[2..4]),
            content_length: NetworkEndian::read_u16(&bytes[4..6]),
            padding_length: bytes[6],
            reserved: bytes[7],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.version;
        out[1] = self.record_type;
        NetworkEndian::write_u16(&mut out[2..4], self.request_id);
        NetworkEndian::write_u16(&mut out[4..6], self.content_length);
        out[6] = self.padding_length;
        out[7] = self.reserved;
        out
    }

    /// Length of the whole record on the wire, header included.
    pub fn record_len(&self) -> usize {
        Self::LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// Padding that brings a record with `content_len` bytes of content to a multiple of 8.
pub fn padding_for(content_len: usize) -> u8 {
    ((8 - (content_len % 8)) % 8) as u8
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
    pub reserved: [u8; 5],
}

impl BeginRequestBody {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: &[u8]) -> Option<BeginRequestBody> {
        if bytes.len() < Self::LEN {
            return None;
        }
        let mut reserved = [0u8; 5];
        reserved.copy_from_slice(&bytes[3..8]);
        Some(BeginRequestBody {
            role: NetworkEndian::read_u16(&bytes[0..2]),
            flags: bytes[2],
            reserved,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        NetworkEndian::write_u16(&mut out[0..2], self.role);
        out[2] = self.flags;
        out[3..8].copy_from_slice(&self.reserved);
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
    pub reserved: [u8; 3],
}

impl EndRequestBody {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: &[u8]) -> Option<EndRequestBody> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(EndRequestBody {
            app_status: NetworkEndian::read_u32(&bytes[0..4]),
            protocol_status: bytes[4],
            reserved: [bytes[5], bytes[6], bytes[7]],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        NetworkEndian::write_u32(&mut out[0..4], self.app_status);
        out[4] = self.protocol_status;
        out[5..8].copy_from_slice(&self.reserved);
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownTypeBody {
    pub record_type: u8,
    pub reserved: [u8; 7],
}

impl UnknownTypeBody {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: &[u8]) -> Option<UnknownTypeBody> {
        if bytes.len() < Self::LEN {
            return None;
        }
        let mut reserved = [0u8; 7];
        reserved.copy_from_slice(&bytes[1..8]);
        Some(UnknownTypeBody { record_type: bytes[0], reserved })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.record_type;
        out[1..8].copy_from_slice(&self.reserved);
        out
    }
}
