// File: src/code.rs
//
// Code records and constant objects for the depyc decompiler.
// An Object is any value the marshal stream can carry; a CodeObject is the
// compiled representation of one module, function, or class scope.

use bitflags::bitflags;
use serde::Serialize;

use crate::errors::{BytePos, DecompileError, ErrorKind, Result};

bitflags! {
    /// CPython code object flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED = 0x1;
        const NEWLOCALS = 0x2;
        const VARARGS = 0x4;
        const VARKEYWORDS = 0x8;
        const NESTED = 0x10;
        const GENERATOR = 0x20;
        const NOFREE = 0x40;
        const COROUTINE = 0x80;
        const ITERABLE_COROUTINE = 0x100;
        const ASYNC_GENERATOR = 0x200;
    }
}

/// A value decoded from the marshal stream.
///
/// Arbitrary-precision integers keep their 15-bit marshal digits; small
/// ones are folded to `Int` by the reader when they fit.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Ellipsis,
    StopIteration,
    Bool(bool),
    Int(i64),
    Long { negative: bool, digits: Vec<u16> },
    Float(f64),
    Complex(f64, f64),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    Dict(Vec<(Object, Object)>),
    Set(Vec<Object>),
    FrozenSet(Vec<Object>),
    Code(Box<CodeObject>),
}

impl Object {
    pub fn is_none(&self) -> bool {
        matches!(self, Object::None)
    }

    /// The string payload, for name tuples and docstrings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&CodeObject> {
        match self {
            Object::Code(code) => Some(code),
            _ => None,
        }
    }

    /// The value of a marshal long when it fits in an i128.
    pub fn long_value(&self) -> Option<i128> {
        match self {
            Object::Long { negative, digits } => {
                let mut value: i128 = 0;
                for &digit in digits.iter().rev() {
                    value = value.checked_mul(1 << 15)?.checked_add(i128::from(digit))?;
                }
                Some(if *negative { -value } else { value })
            }
            _ => None,
        }
    }
}

/// The compiled representation of a single callable or module scope.
///
/// Immutable once produced by the marshal reader. Nested scopes appear as
/// `Object::Code` entries in `consts`.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub code: Vec<u8>,
    pub consts: Vec<Object>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
    pub filename: String,
    pub name: String,
    pub qualname: String,
    pub firstlineno: u32,
    /// Raw line-number table (lnotab / linetable); kept for --info only.
    pub linetable: Vec<u8>,
    /// Raw 3.11+ exception table; the engine does not interpret it.
    pub exceptiontable: Vec<u8>,
}

impl CodeObject {
    /// An empty record; the marshal reader fills in what the stream has.
    pub fn empty() -> Self {
        Self {
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 0,
            flags: CodeFlags::default(),
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            freevars: Vec::new(),
            cellvars: Vec::new(),
            filename: String::new(),
            name: String::new(),
            qualname: String::new(),
            firstlineno: 0,
            linetable: Vec::new(),
            exceptiontable: Vec::new(),
        }
    }

    fn pool_miss(&self, pool: &str, index: usize) -> DecompileError {
        DecompileError::new(
            ErrorKind::BadPoolIndex,
            format!("{} index {} out of range", pool, index),
            BytePos::in_scope(0, self.name.clone()),
        )
    }

    pub fn const_at(&self, index: usize) -> Result<&Object> {
        self.consts.get(index).ok_or_else(|| self.pool_miss("const", index))
    }

    pub fn name_at(&self, index: usize) -> Result<&str> {
        self.names
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.pool_miss("name", index))
    }

    pub fn varname_at(&self, index: usize) -> Result<&str> {
        self.varnames
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.pool_miss("varname", index))
    }

    /// Cell and free variables share one index space: cells first.
    pub fn cellname_at(&self, index: usize) -> Result<&str> {
        let name = if index < self.cellvars.len() {
            self.cellvars.get(index)
        } else {
            self.freevars.get(index - self.cellvars.len())
        };
        name.map(String::as_str).ok_or_else(|| self.pool_miss("cellvar", index))
    }

    pub fn is_lambda(&self) -> bool {
        self.name == "<lambda>"
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    pub fn is_coroutine(&self) -> bool {
        self.flags.contains(CodeFlags::COROUTINE)
    }

    /// The comprehension kind encoded in a synthesized scope name, if any.
    pub fn comprehension_kind(&self) -> Option<ComprehensionKind> {
        match self.name.as_str() {
            "<listcomp>" => Some(ComprehensionKind::List),
            "<setcomp>" => Some(ComprehensionKind::Set),
            "<dictcomp>" => Some(ComprehensionKind::Dict),
            "<genexpr>" => Some(ComprehensionKind::Generator),
            _ => None,
        }
    }

    /// Summarize this record (and nested records) for the --info output.
    pub fn info(&self) -> CodeInfo {
        CodeInfo {
            name: self.name.clone(),
            filename: self.filename.clone(),
            argcount: self.argcount,
            posonlyargcount: self.posonlyargcount,
            kwonlyargcount: self.kwonlyargcount,
            stacksize: self.stacksize,
            flags: self.flags.bits(),
            code_len: self.code.len(),
            consts: self.consts.len(),
            names: self.names.clone(),
            varnames: self.varnames.clone(),
            firstlineno: self.firstlineno,
            nested: self
                .consts
                .iter()
                .filter_map(|c| c.as_code())
                .map(CodeObject::info)
                .collect(),
        }
    }
}

/// JSON-serializable metadata summary printed by `depyc --info`.
#[derive(Debug, Serialize)]
pub struct CodeInfo {
    pub name: String,
    pub filename: String,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub stacksize: u32,
    pub flags: u32,
    pub code_len: usize,
    pub consts: usize,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub firstlineno: u32,
    pub nested: Vec<CodeInfo>,
}

/// The four comprehension scopes the compiler synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_value() {
        let obj = Object::Long { negative: false, digits: vec![1, 2] };
        // 1 + 2 * 2^15
        assert_eq!(obj.long_value(), Some(65537));

        let neg = Object::Long { negative: true, digits: vec![5] };
        assert_eq!(neg.long_value(), Some(-5));
    }

    #[test]
    fn test_pool_bounds() {
        let mut code = CodeObject::empty();
        code.names.push("x".to_string());
        assert_eq!(code.name_at(0).unwrap(), "x");
        assert!(code.name_at(1).is_err());
    }

    #[test]
    fn test_cell_then_free_lookup() {
        let mut code = CodeObject::empty();
        code.cellvars.push("a".to_string());
        code.freevars.push("b".to_string());
        assert_eq!(code.cellname_at(0).unwrap(), "a");
        assert_eq!(code.cellname_at(1).unwrap(), "b");
        assert!(code.cellname_at(2).is_err());
    }

    #[test]
    fn test_comprehension_kind() {
        let mut code = CodeObject::empty();
        code.name = "<listcomp>".to_string();
        assert_eq!(code.comprehension_kind(), Some(ComprehensionKind::List));
        code.name = "f".to_string();
        assert_eq!(code.comprehension_kind(), None);
    }
}
