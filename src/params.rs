//! The name-value pair encoding shared by `FCGI_PARAMS`, `FCGI_GET_VALUES` and
//! `FCGI_GET_VALUES_RESULT`.

use crate::error::Error;

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use std::collections::HashMap;
use std::fmt;

const LONG_LENGTH_FLAG: u32 = 0x8000_0000;

fn read_len(buf: &mut Bytes) -> Result<usize, Error> {
    let first_byte = match buf.first() {
        Some(&b) => b,
        None => return Err(Error::InvalidParamsEncoding("missing length".to_owned())),
    };
    if first_byte < 0x80 {
        buf.advance(1);
        Ok(first_byte as usize)
    } else if buf.len() < 4 {
        Err(Error::InvalidParamsEncoding(format!(
            "truncated 4-byte length ({} bytes left)", buf.len())))
    } else {
        let len = NetworkEndian::read_u32(&buf[..4]) & !LONG_LENGTH_FLAG;
        buf.advance(4);
        Ok(len as usize)
    }
}

fn write_len(buf: &mut BytesMut, len: usize) -> Result<(), Error> {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len < LONG_LENGTH_FLAG as usize {
        buf.put_u32(len as u32 | LONG_LENGTH_FLAG);
    } else {
        return Err(Error::InvalidParamsEncoding(format!(
            "un-encodable name-value pair length: {:#x}", len)));
    }
    Ok(())
}

/// Decodes a complete name-value pair stream.
pub fn decode_pairs(mut buf: Bytes) -> Result<Vec<(Bytes, Bytes)>, Error> {
    let mut pairs = vec![];
    while !buf.is_empty() {
        let name_len = read_len(&mut buf)?;
        let value_len = read_len(&mut buf)?;
        if buf.len() < name_len + value_len {
            return Err(Error::InvalidParamsEncoding(format!(
                "pair wants {} + {} bytes, only {} left", name_len, value_len, buf.len())));
        }
        let name = buf.split_to(name_len);
        let value = buf.split_to(value_len);
        debug!("param ({}, {})",
               String::from_utf8_lossy(&name),
               String::from_utf8_lossy(&value));
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Appends the encoded form of each pair to `out`.
pub fn encode_pairs<'a, I>(pairs: I, out: &mut BytesMut) -> Result<(), Error>
    where I: IntoIterator<Item = (&'a [u8], &'a [u8])>
{
    for (name, value) in pairs {
        write_len(out, name.len())?;
        write_len(out, value.len())?;
        out.extend_from_slice(name);
        out.extend_from_slice(value);
    }
    Ok(())
}

/// The CGI environment of a request.
///
/// Pairs keep the order they arrived in. Inserting a name that is already present
/// replaces its value in place, matching CGI's last-write-wins semantics.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(Bytes, Bytes)>,
    /// Position of each name in `pairs`.
    index: HashMap<Bytes, usize>,
}

impl Params {
    pub fn new() -> Params {
        Params::default()
    }

    /// Decodes a complete `FCGI_PARAMS` stream.
    pub fn decode(buf: Bytes) -> Result<Params, Error> {
        let mut params = Params::new();
        for (name, value) in decode_pairs(buf)? {
            params.insert(name, value);
        }
        Ok(params)
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), Error> {
        encode_pairs(self.pairs.iter().map(|(n, v)| (n.as_ref(), v.as_ref())), out)
    }

    pub fn insert<N: Into<Bytes>, V: Into<Bytes>>(&mut self, name: N, value: V) {
        let name = name.into();
        let value = value.into();
        match self.index.get(&name) {
            Some(&idx) => self.pairs[idx].1 = value,
            None => {
                self.index.insert(name.clone(), self.pairs.len());
                self.pairs.push((name, value));
            }
        }
    }

    pub fn remove<N: AsRef<[u8]>>(&mut self, name: N) -> Option<Bytes> {
        let idx = self.index.remove(name.as_ref())?;
        let (_, value) = self.pairs.remove(idx);
        for later in self.index.values_mut() {
            if *later > idx {
                *later -= 1;
            }
        }
        Some(value)
    }

    pub fn get_bytes<N: AsRef<[u8]>>(&self, name: N) -> Option<&Bytes> {
        let idx = *self.index.get(name.as_ref())?;
        self.pairs.get(idx).map(|(_, v)| v)
    }

    /// Returns the value as a string, or `None` if it is absent or not UTF-8.
    pub fn get<N: AsRef<[u8]>>(&self, name: N) -> Option<&str> {
        self.get_bytes(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains<N: AsRef<[u8]>>(&self, name: N) -> bool {
        self.get_bytes(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.pairs.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.pairs.iter().map(|(n, v)| {
                (String::from_utf8_lossy(n), String::from_utf8_lossy(v))
            }))
            .finish()
    }
}

impl<N: Into<Bytes>, V: Into<Bytes>> FromIterator<(N, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Params {
        let mut params = Params::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(pairs: &[(&[u8], &[u8])]) -> Bytes {
        let mut out = BytesMut::new();
        encode_pairs(pairs.iter().copied(), &mut out).unwrap();
        out.freeze()
    }

    #[test]
    fn short_and_long_lengths() {
        let long_value = vec![b'x'; 300];
        let buf = encoded(&[(b"SCRIPT_NAME", b"/index.php"), (b"LONG", &long_value)]);

        // 1-byte lengths for the first pair
        assert_eq!(&buf[..2], &[11, 10]);
        // 1-byte name length, 4-byte value length with the high bit set
        let second = 2 + 11 + 10;
        assert_eq!(&buf[second..second + 5], &[4, 0x80, 0, 1, 44]);

        let pairs = decode_pairs(buf).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "SCRIPT_NAME");
        assert_eq!(pairs[0].1, "/index.php");
        assert_eq!(pairs[1].1.len(), 300);
    }

    #[test]
    fn decode_keeps_order() {
        let buf = encoded(&[(b"B", b"2"), (b"A", b"1"), (b"C", b"")]);
        let params = Params::decode(buf).unwrap();
        let names: Vec<_> = params.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
        assert_eq!(params.get("C"), Some(""));
    }

    #[test]
    fn duplicate_names_last_write_wins() {
        let buf = encoded(&[(b"X", b"first"), (b"Y", b"y"), (b"X", b"second")]);
        let params = Params::decode(buf).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("X"), Some("second"));
        assert_eq!(params.iter().next().map(|(n, _)| n.clone()), Some(Bytes::from("X")));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let buf = encoded(&[(b"NAME", b"value")]);
        for cut in 1..buf.len() {
            match decode_pairs(buf.slice(..cut)) {
                Err(Error::InvalidParamsEncoding(_)) => (),
                other => panic!("cut at {}: expected InvalidParamsEncoding, got {:?}", cut, other),
            }
        }
        // A long-form length with fewer than 4 bytes available.
        assert!(decode_pairs(Bytes::from_static(&[0x80, 0])).is_err());
    }

    #[test]
    fn remove_and_lookup() {
        let mut params: Params = vec![("CONTENT_LENGTH", "3"), ("HTTP_HOST", "example.org")]
            .into_iter()
            .collect();
        assert_eq!(params.remove("CONTENT_LENGTH"), Some(Bytes::from("3")));
        assert_eq!(params.remove("CONTENT_LENGTH"), None);
        assert!(params.contains(b"HTTP_HOST"));
        assert_eq!(params.get_bytes("HTTP_HOST").map(|v| v.len()), Some(11));

        let mut out = BytesMut::new();
        params.encode(&mut out).unwrap();
        assert_eq!(Params::decode(out.freeze()).unwrap(), params);
    }

    #[test]
    fn remove_from_the_middle_keeps_later_names() {
        let mut params: Params = vec![("A", "1"), ("B", "2"), ("C", "3")].into_iter().collect();
        params.remove("A");
        assert_eq!(params.get("B"), Some("2"));
        assert_eq!(params.get("C"), Some("3"));
        params.insert("C", "30");
        params.insert("D", "4");
        let pairs: Vec<_> = params.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
        assert_eq!(pairs, vec![
            (Bytes::from("B"), Bytes::from("2")),
            (Bytes::from("C"), Bytes::from("30")),
            (Bytes::from("D"), Bytes::from("4")),
        ]);
    }

    #[test]
    fn many_pairs() {
        let names: Vec<String> = (0..50_000).map(|i| format!("N{}", i)).collect();
        let mut out = BytesMut::new();
        encode_pairs(names.iter().map(|n| (n.as_bytes(), &b"v"[..])), &mut out).unwrap();
        let params = Params::decode(out.freeze()).unwrap();
        assert_eq!(params.len(), 50_000);
        assert_eq!(params.get("N49999"), Some("v"));
    }

    #[test]
    fn non_utf8_values() {
        let params: Params = vec![(&b"RAW"[..], &b"\xff\xfe"[..])].into_iter()
            .map(|(n, v)| (Bytes::from_static(n), Bytes::from_static(v)))
            .collect();
        assert_eq!(params.get("RAW"), None);
        assert_eq!(params.get_bytes("RAW").map(|v| v.as_ref()), Some(&b"\xff\xfe"[..]));
    }
}
