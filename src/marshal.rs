// File: src/marshal.rs
//
// The .pyc container reader: parses the file header, resolves the magic
// word to an interpreter version, and deserializes the marshal stream into
// an Object graph rooted at a CodeObject.
//
// Code object field layout changed repeatedly across releases; every
// version-dependent read below is gated on the module version resolved
// from the magic word.

use tracing::debug;

use crate::code::{CodeFlags, CodeObject, Object};
use crate::errors::{DecompileError, Result};
use crate::version::{header_trailer_len, version_from_magic, PythonVersion};

/// Type-byte flag (3.4+) requesting registration in the back-reference
/// table; the type code proper is the low seven bits.
const FLAG_REF: u8 = 0x80;

/// Parse a whole .pyc file: header, then the root code object.
pub fn load_pyc(data: &[u8]) -> Result<(PythonVersion, CodeObject)> {
    if data.len() < 4 {
        return Err(DecompileError::truncated(0, "pyc magic"));
    }
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let version = version_from_magic(magic)?;
    let body_start = 4 + header_trailer_len(version);
    if data.len() < body_start {
        return Err(DecompileError::truncated(data.len(), "pyc header"));
    }
    debug!(%version, "resolved pyc magic");

    let mut reader = MarshalReader::new(&data[body_start..], version);
    match reader.read_object()? {
        Object::Code(code) => Ok((version, *code)),
        other => Err(DecompileError::bad_marshal(
            body_start,
            format!("root marshal object is not code: {:?}", other),
        )),
    }
}

/// Recursive-descent reader over a marshal byte stream.
pub struct MarshalReader<'a> {
    data: &'a [u8],
    pos: usize,
    version: PythonVersion,
    /// Back-reference table for the 3.4+ FLAG_REF mechanism.
    refs: Vec<Object>,
    /// Interned-string table for the py2 't'/'R' mechanism.
    interned: Vec<String>,
}

impl<'a> MarshalReader<'a> {
    pub fn new(data: &'a [u8], version: PythonVersion) -> Self {
        Self { data, pos: 0, version, refs: Vec::new(), interned: Vec::new() }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| DecompileError::truncated(self.pos, what))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        Ok(self.read_u32(what)? as i32)
    }

    fn read_i64(&mut self, what: &str) -> Result<i64> {
        let b = self.take(8, what)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn read_f64(&mut self, what: &str) -> Result<f64> {
        let b = self.take(8, what)?;
        Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Length-prefixed ASCII float repr, as written by marshal version 0.
    fn read_float_str(&mut self) -> Result<f64> {
        let len = self.read_u8("float length")? as usize;
        let bytes = self.take(len, "float repr")?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| DecompileError::bad_marshal(self.pos, "non-ascii float repr".into()))?;
        text.parse::<f64>()
            .map_err(|_| DecompileError::bad_marshal(self.pos, format!("bad float repr {:?}", text)))
    }

    fn bad(&self, message: String) -> DecompileError {
        DecompileError::bad_marshal(self.pos, message)
    }

    /// Reserve a back-reference slot before reading a container's children,
    /// then patch it with `commit_ref` once the value is complete.
    fn reserve_ref(&mut self, flagged: bool) -> Option<usize> {
        if flagged {
            self.refs.push(Object::None);
            Some(self.refs.len() - 1)
        } else {
            None
        }
    }

    fn commit_ref(&mut self, slot: Option<usize>, value: &Object) {
        if let Some(index) = slot {
            self.refs[index] = value.clone();
        }
    }

    /// Register a leaf value after the fact (no children to recurse into).
    fn register_ref(&mut self, flagged: bool, value: &Object) {
        if flagged {
            self.refs.push(value.clone());
        }
    }

    pub fn read_object(&mut self) -> Result<Object> {
        self.read_object_or_null()?
            .ok_or_else(|| self.bad("unexpected NULL outside dict".into()))
    }

    /// One marshal value, or None for the '0' NULL marker that terminates
    /// dict entries.
    fn read_object_or_null(&mut self) -> Result<Option<Object>> {
        let raw = self.read_u8("type code")?;
        let flagged = self.version >= PythonVersion::new(3, 4) && raw & FLAG_REF != 0;
        let code = (raw & !FLAG_REF) as char;

        let value = match code {
            '0' => return Ok(None),
            'N' => Object::None,
            '.' => Object::Ellipsis,
            'S' => Object::StopIteration,
            'F' => Object::Bool(false),
            'T' => Object::Bool(true),
            'i' => Object::Int(i64::from(self.read_i32("int32")?)),
            'I' => Object::Int(self.read_i64("int64")?),
            'l' => self.read_long()?,
            'f' => Object::Float(self.read_float_str()?),
            'g' => Object::Float(self.read_f64("float")?),
            'x' => {
                let real = self.read_float_str()?;
                let imag = self.read_float_str()?;
                Object::Complex(real, imag)
            }
            'y' => {
                let real = self.read_f64("complex real")?;
                let imag = self.read_f64("complex imag")?;
                Object::Complex(real, imag)
            }
            's' => {
                let len = self.read_u32("string length")? as usize;
                let bytes = self.take(len, "string body")?.to_vec();
                if self.version.is_py3() {
                    Object::Bytes(bytes)
                } else {
                    Object::Str(bytes.iter().map(|&b| b as char).collect())
                }
            }
            't' => {
                let len = self.read_u32("interned length")? as usize;
                let bytes = self.take(len, "interned body")?;
                let text: String = if self.version.is_py3() {
                    String::from_utf8_lossy(bytes).into_owned()
                } else {
                    bytes.iter().map(|&b| b as char).collect()
                };
                if !self.version.is_py3() {
                    self.interned.push(text.clone());
                }
                Object::Str(text)
            }
            'R' => {
                let index = self.read_u32("stringref")? as usize;
                let text = self
                    .interned
                    .get(index)
                    .cloned()
                    .ok_or_else(|| self.bad(format!("stringref {} out of range", index)))?;
                Object::Str(text)
            }
            'u' => {
                let len = self.read_u32("unicode length")? as usize;
                let bytes = self.take(len, "unicode body")?;
                Object::Str(String::from_utf8_lossy(bytes).into_owned())
            }
            'a' | 'A' => {
                let len = self.read_u32("ascii length")? as usize;
                let bytes = self.take(len, "ascii body")?;
                Object::Str(String::from_utf8_lossy(bytes).into_owned())
            }
            'z' | 'Z' => {
                let len = self.read_u8("short ascii length")? as usize;
                let bytes = self.take(len, "short ascii body")?;
                Object::Str(String::from_utf8_lossy(bytes).into_owned())
            }
            '(' | ')' => {
                let count = if code == ')' {
                    self.read_u8("small tuple size")? as usize
                } else {
                    self.read_u32("tuple size")? as usize
                };
                let slot = self.reserve_ref(flagged);
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.read_object()?);
                }
                let value = Object::Tuple(items);
                self.commit_ref(slot, &value);
                return Ok(Some(value));
            }
            '[' => {
                let count = self.read_u32("list size")? as usize;
                let slot = self.reserve_ref(flagged);
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.read_object()?);
                }
                let value = Object::List(items);
                self.commit_ref(slot, &value);
                return Ok(Some(value));
            }
            '{' => {
                let slot = self.reserve_ref(flagged);
                let mut pairs = Vec::new();
                while let Some(key) = self.read_object_or_null()? {
                    let val = self.read_object()?;
                    pairs.push((key, val));
                }
                let value = Object::Dict(pairs);
                self.commit_ref(slot, &value);
                return Ok(Some(value));
            }
            '<' | '>' => {
                let count = self.read_u32("set size")? as usize;
                let slot = self.reserve_ref(flagged);
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(self.read_object()?);
                }
                let value = if code == '<' {
                    Object::Set(items)
                } else {
                    Object::FrozenSet(items)
                };
                self.commit_ref(slot, &value);
                return Ok(Some(value));
            }
            'c' => {
                let slot = self.reserve_ref(flagged);
                let value = Object::Code(Box::new(self.read_code()?));
                self.commit_ref(slot, &value);
                return Ok(Some(value));
            }
            'r' => {
                let index = self.read_u32("object ref")? as usize;
                self.refs
                    .get(index)
                    .cloned()
                    .ok_or_else(|| self.bad(format!("object ref {} out of range", index)))?
            }
            other => {
                return Err(self.bad(format!("unknown marshal type code {:?}", other)));
            }
        };

        self.register_ref(flagged, &value);
        Ok(Some(value))
    }

    /// Marshal long: signed 15-bit digit count, then the digits.
    fn read_long(&mut self) -> Result<Object> {
        let count = self.read_i32("long size")?;
        let negative = count < 0;
        let count = count.unsigned_abs() as usize;
        let mut digits = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            digits.push(self.read_u16("long digit")?);
        }
        let long = Object::Long { negative, digits };
        // Fold into a machine int when it fits; keeps printing simple.
        match long.long_value() {
            Some(v) if v >= i64::MIN as i128 && v <= i64::MAX as i128 => Ok(Object::Int(v as i64)),
            _ => Ok(long),
        }
    }

    /// Argument counts were 16-bit until 2.3.
    fn read_count(&mut self, what: &str) -> Result<u32> {
        if self.version < PythonVersion::new(2, 3) {
            Ok(u32::from(self.read_u16(what)?))
        } else {
            self.read_u32(what)
        }
    }

    fn read_string_payload(&mut self, what: &str) -> Result<Vec<u8>> {
        match self.read_object()? {
            Object::Bytes(b) => Ok(b),
            Object::Str(s) => Ok(s.into_bytes()),
            other => Err(self.bad(format!("expected string for {}, got {:?}", what, other))),
        }
    }

    fn read_str_tuple(&mut self, what: &str) -> Result<Vec<String>> {
        match self.read_object()? {
            Object::Tuple(items) => items
                .into_iter()
                .map(|item| match item {
                    Object::Str(s) => Ok(s),
                    Object::Bytes(b) => Ok(b.iter().map(|&c| c as char).collect()),
                    other => Err(self.bad(format!("non-string in {}: {:?}", what, other))),
                })
                .collect(),
            other => Err(self.bad(format!("expected tuple for {}, got {:?}", what, other))),
        }
    }

    fn read_str_field(&mut self, what: &str) -> Result<String> {
        match self.read_object()? {
            Object::Str(s) => Ok(s),
            Object::Bytes(b) => Ok(b.iter().map(|&c| c as char).collect()),
            other => Err(self.bad(format!("expected string for {}, got {:?}", what, other))),
        }
    }

    /// Code object body, minus the 'c' type byte.
    fn read_code(&mut self) -> Result<CodeObject> {
        let v = self.version;
        let mut code = CodeObject::empty();

        if v >= PythonVersion::new(3, 11) {
            code.argcount = self.read_u32("argcount")?;
            code.posonlyargcount = self.read_u32("posonlyargcount")?;
            code.kwonlyargcount = self.read_u32("kwonlyargcount")?;
            code.stacksize = self.read_u32("stacksize")?;
            code.flags = CodeFlags::from_bits_retain(self.read_u32("flags")?);
            code.code = self.read_string_payload("code")?;
            code.consts = match self.read_object()? {
                Object::Tuple(items) => items,
                other => return Err(self.bad(format!("consts is not a tuple: {:?}", other))),
            };
            code.names = self.read_str_tuple("names")?;
            let localsplus = self.read_str_tuple("localsplusnames")?;
            let kinds = self.read_string_payload("localspluskinds")?;
            for (name, kind) in localsplus.into_iter().zip(kinds) {
                // CO_FAST_LOCAL 0x20, CO_FAST_CELL 0x40, CO_FAST_FREE 0x80
                if kind & 0x80 != 0 {
                    code.freevars.push(name);
                } else if kind & 0x40 != 0 {
                    code.cellvars.push(name);
                } else {
                    code.varnames.push(name);
                }
            }
            code.nlocals = code.varnames.len() as u32;
            code.filename = self.read_str_field("filename")?;
            code.name = self.read_str_field("name")?;
            code.qualname = self.read_str_field("qualname")?;
            code.firstlineno = self.read_u32("firstlineno")?;
            code.linetable = self.read_string_payload("linetable")?;
            code.exceptiontable = self.read_string_payload("exceptiontable")?;
            return Ok(code);
        }

        if v >= PythonVersion::new(1, 3) {
            code.argcount = self.read_count("argcount")?;
            if v >= PythonVersion::new(3, 8) {
                code.posonlyargcount = self.read_u32("posonlyargcount")?;
            }
            if v.is_py3() {
                code.kwonlyargcount = self.read_u32("kwonlyargcount")?;
            }
            code.nlocals = self.read_count("nlocals")?;
            code.stacksize = self.read_count("stacksize")?;
            code.flags = CodeFlags::from_bits_retain(self.read_count("flags")?);
        }
        code.code = self.read_string_payload("code")?;
        code.consts = match self.read_object()? {
            Object::Tuple(items) => items,
            other => return Err(self.bad(format!("consts is not a tuple: {:?}", other))),
        };
        code.names = self.read_str_tuple("names")?;
        if v >= PythonVersion::new(1, 3) {
            code.varnames = self.read_str_tuple("varnames")?;
        }
        if v >= PythonVersion::new(2, 1) {
            code.freevars = self.read_str_tuple("freevars")?;
            code.cellvars = self.read_str_tuple("cellvars")?;
        }
        code.filename = self.read_str_field("filename")?;
        code.name = self.read_str_field("name")?;
        code.qualname = code.name.clone();
        if v >= PythonVersion::new(1, 5) {
            code.firstlineno = if v < PythonVersion::new(2, 3) {
                u32::from(self.read_u16("firstlineno")?)
            } else {
                self.read_u32("firstlineno")?
            };
            code.linetable = self.read_string_payload("lnotab")?;
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: &[u8], major: u8, minor: u8) -> MarshalReader {
        MarshalReader::new(bytes, PythonVersion::new(major, minor))
    }

    #[test]
    fn test_simple_values() {
        let mut r = reader(b"N", 3, 8);
        assert_eq!(r.read_object().unwrap(), Object::None);

        let mut r = reader(b"T", 3, 8);
        assert_eq!(r.read_object().unwrap(), Object::Bool(true));

        let mut r = reader(&[b'i', 0x2a, 0, 0, 0], 3, 8);
        assert_eq!(r.read_object().unwrap(), Object::Int(42));
    }

    #[test]
    fn test_short_ascii_and_tuple() {
        // small tuple of two short-ascii strings
        let bytes = [b')', 2, b'z', 1, b'a', b'z', 1, b'b'];
        let mut r = reader(&bytes, 3, 8);
        assert_eq!(
            r.read_object().unwrap(),
            Object::Tuple(vec![Object::Str("a".into()), Object::Str("b".into())])
        );
    }

    #[test]
    fn test_back_reference() {
        // FLAG_REF'd string, then a ref to it
        let bytes = [b'z' | FLAG_REF, 1, b'x', b'r', 0, 0, 0, 0];
        let mut r = reader(&bytes, 3, 8);
        assert_eq!(r.read_object().unwrap(), Object::Str("x".into()));
        assert_eq!(r.read_object().unwrap(), Object::Str("x".into()));
    }

    #[test]
    fn test_dict_null_terminated() {
        let bytes = [b'{', b'z', 1, b'k', b'i', 1, 0, 0, 0, b'0'];
        let mut r = reader(&bytes, 3, 8);
        assert_eq!(
            r.read_object().unwrap(),
            Object::Dict(vec![(Object::Str("k".into()), Object::Int(1))])
        );
    }

    #[test]
    fn test_long_folds_to_int() {
        // 'l' with two digits: 1 + 2*2^15 = 65537
        let bytes = [b'l', 2, 0, 0, 0, 1, 0, 2, 0];
        let mut r = reader(&bytes, 2, 7);
        assert_eq!(r.read_object().unwrap(), Object::Int(65537));
    }

    #[test]
    fn test_truncated_stream() {
        let mut r = reader(&[b'i', 0x2a], 3, 8);
        assert!(r.read_object().is_err());
    }

    #[test]
    fn test_py2_string_is_str() {
        let bytes = [b's', 2, 0, 0, 0, b'h', b'i'];
        let mut r = reader(&bytes, 2, 7);
        assert_eq!(r.read_object().unwrap(), Object::Str("hi".into()));
    }
}
