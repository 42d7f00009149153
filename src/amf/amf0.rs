//! AMF0 serialization
//!
//! Only what RTMP command and data messages carry is supported. Movie clip,
//! record set and AVM+ markers are rejected; the "unsupported" marker
//! decodes to `Undefined`.

use bytes::{BufMut, BytesMut};

use super::value::{AmfObject, AmfValue};
use crate::error::AmfError;

const NUMBER: u8 = 0x00;
const BOOLEAN: u8 = 0x01;
const STRING: u8 = 0x02;
const OBJECT: u8 = 0x03;
const NULL: u8 = 0x05;
const UNDEFINED: u8 = 0x06;
const REFERENCE: u8 = 0x07;
const ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: u8 = 0x09;
const STRICT_ARRAY: u8 = 0x0A;
const DATE: u8 = 0x0B;
const LONG_STRING: u8 = 0x0C;
const UNSUPPORTED: u8 = 0x0D;
const XML_DOCUMENT: u8 = 0x0F;
const TYPED_OBJECT: u8 = 0x10;

const MAX_DEPTH: usize = 64;

/// Decoded values allowed per input byte; only references can exceed one
const EXPANSION_FACTOR: usize = 8;
/// Floor of the value budget for short payloads
const MIN_VALUE_BUDGET: usize = 1024;

/// Decode every value in `data`
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut reader = Reader::new(data);
    let mut values = Vec::new();
    while !reader.is_empty() {
        values.push(reader.value()?);
    }
    Ok(values)
}

/// Decode the first value in `data`
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    Reader::new(data).value()
}

/// Append the encoding of `value` to `out`
pub fn encode_into(out: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => {
            out.put_u8(NUMBER);
            out.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            out.put_u8(BOOLEAN);
            out.put_u8(u8::from(*b));
        }
        AmfValue::String(s) if s.len() > usize::from(u16::MAX) => {
            out.put_u8(LONG_STRING);
            put_long_utf8(out, s);
        }
        AmfValue::String(s) => {
            out.put_u8(STRING);
            put_utf8(out, s);
        }
        AmfValue::Object(props) => {
            out.put_u8(OBJECT);
            put_properties(out, props);
        }
        AmfValue::Null => out.put_u8(NULL),
        AmfValue::Undefined => out.put_u8(UNDEFINED),
        AmfValue::EcmaArray(props) => {
            out.put_u8(ECMA_ARRAY);
            out.put_u32(props.len() as u32);
            put_properties(out, props);
        }
        AmfValue::StrictArray(items) => {
            out.put_u8(STRICT_ARRAY);
            out.put_u32(items.len() as u32);
            for item in items {
                encode_into(out, item);
            }
        }
        AmfValue::Date(millis) => {
            out.put_u8(DATE);
            out.put_f64(*millis);
            out.put_i16(0);
        }
        AmfValue::Xml(s) => {
            out.put_u8(XML_DOCUMENT);
            put_long_utf8(out, s);
        }
        AmfValue::TypedObject {
            class_name,
            properties,
        } => {
            out.put_u8(TYPED_OBJECT);
            put_utf8(out, class_name);
            put_properties(out, properties);
        }
    }
}

fn put_utf8(out: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(usize::from(u16::MAX))];
    out.put_u16(bytes.len() as u16);
    out.put_slice(bytes);
}

fn put_long_utf8(out: &mut BytesMut, s: &str) {
    out.put_u32(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn put_properties(out: &mut BytesMut, props: &AmfObject) {
    for (key, value) in props.iter() {
        put_utf8(out, key);
        encode_into(out, value);
    }
    out.put_u16(0);
    out.put_u8(OBJECT_END);
}

/// Cursor over an AMF0 byte slice
struct Reader<'a> {
    data: &'a [u8],
    depth: usize,
    /// Complex values in order of appearance with their size in values,
    /// for 0x07 references
    references: Vec<(AmfValue, usize)>,
    /// Values produced so far, counting every copy a reference makes
    values: usize,
    budget: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            depth: 0,
            references: Vec::new(),
            values: 0,
            budget: data
                .len()
                .saturating_mul(EXPANSION_FACTOR)
                .max(MIN_VALUE_BUDGET),
        }
    }

    /// Account for `n` more decoded values
    fn charge(&mut self, n: usize) -> Result<(), AmfError> {
        self.values = self.values.saturating_add(n);
        if self.values > self.budget {
            return Err(AmfError::ExpansionLimit(self.budget));
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AmfError> {
        if self.data.len() < n {
            return Err(AmfError::UnexpectedEof);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, AmfError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AmfError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, AmfError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, AmfError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_be_bytes(raw))
    }

    fn utf8(&mut self, len: usize) -> Result<String, AmfError> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| AmfError::InvalidUtf8)
    }

    fn short_string(&mut self) -> Result<String, AmfError> {
        let len = self.u16()?;
        self.utf8(usize::from(len))
    }

    fn long_string(&mut self) -> Result<String, AmfError> {
        let len = self.u32()?;
        self.utf8(len as usize)
    }

    fn value(&mut self) -> Result<AmfValue, AmfError> {
        if self.depth >= MAX_DEPTH {
            return Err(AmfError::NestingTooDeep);
        }
        self.charge(1)?;
        let start = self.values;
        self.depth += 1;
        let result = self.value_inner(start);
        self.depth -= 1;
        result
    }

    /// `start` is the value count before this value, used to size it
    fn value_inner(&mut self, start: usize) -> Result<AmfValue, AmfError> {
        let marker = self.u8()?;
        let value = match marker {
            NUMBER => AmfValue::Number(self.f64()?),
            BOOLEAN => AmfValue::Boolean(self.u8()? != 0),
            STRING => AmfValue::String(self.short_string()?),
            LONG_STRING => AmfValue::String(self.long_string()?),
            NULL => AmfValue::Null,
            UNDEFINED | UNSUPPORTED => AmfValue::Undefined,
            XML_DOCUMENT => AmfValue::Xml(self.long_string()?),
            DATE => {
                let millis = self.f64()?;
                self.take(2)?;
                AmfValue::Date(millis)
            }
            REFERENCE => {
                let index = self.u16()?;
                let size = self
                    .references
                    .get(usize::from(index))
                    .map(|(_, size)| *size)
                    .ok_or(AmfError::InvalidReference(index))?;
                // Charged before cloning so a hostile chain never allocates
                self.charge(size)?;
                return Ok(self.references[usize::from(index)].0.clone());
            }
            OBJECT => {
                let props = self.properties()?;
                self.remember(AmfValue::Object(props), start)
            }
            ECMA_ARRAY => {
                // Count is only a hint; the property list is end-marker terminated.
                self.u32()?;
                let props = self.properties()?;
                self.remember(AmfValue::EcmaArray(props), start)
            }
            TYPED_OBJECT => {
                let class_name = self.short_string()?;
                let properties = self.properties()?;
                self.remember(
                    AmfValue::TypedObject {
                        class_name,
                        properties,
                    },
                    start,
                )
            }
            STRICT_ARRAY => {
                let count = self.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(self.data.len()));
                for _ in 0..count {
                    items.push(self.value()?);
                }
                self.remember(AmfValue::StrictArray(items), start)
            }
            other => return Err(AmfError::UnknownMarker(other)),
        };
        Ok(value)
    }

    fn remember(&mut self, value: AmfValue, start: usize) -> AmfValue {
        // The value itself plus everything decoded inside it
        let size = self.values - start + 1;
        self.references.push((value.clone(), size));
        value
    }

    fn properties(&mut self) -> Result<AmfObject, AmfError> {
        let mut props = AmfObject::new();
        loop {
            // Some encoders end the last object of a message without the
            // 00 00 09 terminator.
            if self.data.is_empty() {
                return Ok(props);
            }
            let key = self.short_string()?;
            if key.is_empty() {
                match self.data.first() {
                    Some(&OBJECT_END) => {
                        self.take(1)?;
                        return Ok(props);
                    }
                    None => return Ok(props),
                    Some(_) => {}
                }
            }
            let value = self.value()?;
            props.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &AmfValue) -> BytesMut {
        let mut out = BytesMut::new();
        encode_into(&mut out, value);
        out
    }

    #[test]
    fn test_scalar_wire_format() {
        assert_eq!(
            &encode(&AmfValue::Number(1.0))[..],
            &[0x00, 0x3F, 0xF0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(&encode(&AmfValue::Boolean(true))[..], &[0x01, 0x01]);
        assert_eq!(&encode(&AmfValue::from("ab"))[..], &[0x02, 0x00, 0x02, b'a', b'b']);
        assert_eq!(&encode(&AmfValue::Null)[..], &[0x05]);
    }

    #[test]
    fn test_connect_command_roundtrip() {
        let values = vec![
            AmfValue::from("connect"),
            AmfValue::Number(1.0),
            AmfValue::Object(
                AmfObject::new()
                    .with("app", "live")
                    .with("type", "nonprivate")
                    .with("flashVer", "FMLE/3.0")
                    .with("tcUrl", "rtmp://localhost/live")
                    .with("fpad", false)
                    .with("audioCodecs", 3575.0)
                    .with("objectEncoding", 0.0),
            ),
        ];

        let mut out = BytesMut::new();
        for v in &values {
            encode_into(&mut out, v);
        }
        let decoded = decode_all(&out).unwrap();

        assert_eq!(decoded, values);
        assert_eq!(decoded[2].get_string("tcUrl"), Some("rtmp://localhost/live"));
    }

    #[test]
    fn test_metadata_shapes_roundtrip() {
        let values = vec![
            AmfValue::EcmaArray(
                AmfObject::new()
                    .with("width", 1280.0)
                    .with("encoder", "obs"),
            ),
            AmfValue::StrictArray(vec![AmfValue::Null, AmfValue::Boolean(false)]),
            AmfValue::Date(1_700_000_000_000.0),
            AmfValue::Xml("<a/>".into()),
            AmfValue::TypedObject {
                class_name: "Point".into(),
                properties: AmfObject::new().with("x", 3.0),
            },
            AmfValue::Undefined,
        ];

        let mut out = BytesMut::new();
        for v in &values {
            encode_into(&mut out, v);
        }
        assert_eq!(decode_all(&out).unwrap(), values);
    }

    #[test]
    fn test_long_string_form() {
        let long = "x".repeat(70_000);
        let out = encode(&AmfValue::String(long.clone()));
        assert_eq!(out[0], LONG_STRING);
        assert_eq!(decode(&out).unwrap().as_str(), Some(long.as_str()));
    }

    #[test]
    fn test_missing_object_end_tolerated() {
        // { "a": null } with no 00 00 09 terminator
        let data = [0x03, 0x00, 0x01, b'a', 0x05];
        let value = decode(&data).unwrap();
        assert_eq!(value.get("a"), Some(&AmfValue::Null));
    }

    #[test]
    fn test_reference_marker() {
        // Object {"k": 1.0}, then a reference to it
        let mut out = encode(&AmfValue::Object(AmfObject::new().with("k", 1.0)));
        out.extend_from_slice(&[REFERENCE, 0x00, 0x00]);
        let values = decode_all(&out).unwrap();
        assert_eq!(values[0], values[1]);

        assert_eq!(
            decode(&[REFERENCE, 0x00, 0x03]),
            Err(AmfError::InvalidReference(3))
        );
    }

    #[test]
    fn test_reference_chain_rejected() {
        // connect, then levels of [ref(prev), ref(prev)] doubling in size
        let mut out = BytesMut::new();
        encode_into(&mut out, &AmfValue::from("connect"));
        encode_into(&mut out, &AmfValue::Number(1.0));
        encode_into(&mut out, &AmfValue::Object(AmfObject::new().with("app", "live")));
        for level in 0u16..24 {
            out.put_u8(STRICT_ARRAY);
            out.put_u32(2);
            for _ in 0..2 {
                out.put_u8(REFERENCE);
                out.put_u16(level);
            }
        }
        assert!(out.len() < 400);

        let started = std::time::Instant::now();
        assert!(matches!(
            decode_all(&out),
            Err(AmfError::ExpansionLimit(_))
        ));
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[test]
    fn test_small_reference_reuse_allowed() {
        // A few references to a small object stay within budget
        let mut out = encode(&AmfValue::Object(AmfObject::new().with("k", 1.0)));
        for _ in 0..4 {
            out.extend_from_slice(&[REFERENCE, 0x00, 0x00]);
        }
        let values = decode_all(&out).unwrap();
        assert_eq!(values.len(), 5);
        assert!(values.iter().all(|v| v == &values[0]));
    }

    #[test]
    fn test_malformed_input() {
        assert_eq!(decode(&[]), Err(AmfError::UnexpectedEof));
        assert_eq!(decode(&[0x00, 0x01]), Err(AmfError::UnexpectedEof));
        assert_eq!(decode(&[0x02, 0x00, 0x05, b'a']), Err(AmfError::UnexpectedEof));
        assert_eq!(decode(&[0x02, 0x00, 0x01, 0xFF]), Err(AmfError::InvalidUtf8));
        assert_eq!(decode(&[0x11]), Err(AmfError::UnknownMarker(0x11)));
    }

    #[test]
    fn test_nesting_limit() {
        let mut value = AmfValue::Null;
        for _ in 0..(MAX_DEPTH + 1) {
            value = AmfValue::StrictArray(vec![value]);
        }
        assert_eq!(decode(&encode(&value)), Err(AmfError::NestingTooDeep));
    }
}
