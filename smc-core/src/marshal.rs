//! Tagged recursive serialization of script object graphs
//!
//! Every value starts with a single tag byte followed by a tag-specific body.
//! Integers in bodies are little endian, sizes are 4-byte signed. Code objects
//! embed their instruction stream as a byte string, optionally passed through
//! an [`OpcodeMap`] on the way out.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{Cursor, Read, Write};

use indexmap::{IndexMap, IndexSet};

use crate::error::{Error, Result};

const TYPE_NULL: u8 = b'0';
const TYPE_NONE: u8 = b'N';
const TYPE_FALSE: u8 = b'F';
const TYPE_TRUE: u8 = b'T';
const TYPE_STOPITER: u8 = b'S';
const TYPE_ELLIPSIS: u8 = b'.';
const TYPE_INT: u8 = b'i';
const TYPE_INT64: u8 = b'I';
const TYPE_FLOAT: u8 = b'f';
const TYPE_COMPLEX: u8 = b'x';
const TYPE_BINARY_FLOAT: u8 = b'g';
const TYPE_BINARY_COMPLEX: u8 = b'y';
const TYPE_LONG: u8 = b'l';
const TYPE_STRING: u8 = b's';
const TYPE_INTERNED: u8 = b't';
const TYPE_STRINGREF: u8 = b'R';
const TYPE_TUPLE: u8 = b'(';
const TYPE_LIST: u8 = b'[';
const TYPE_DICT: u8 = b'{';
const TYPE_CODE: u8 = b'c';
const TYPE_UNICODE: u8 = b'u';
const TYPE_SET: u8 = b'<';
const TYPE_FROZENSET: u8 = b'>';

/// Opcodes at or above this value carry a 2-byte argument
pub const HAVE_ARGUMENT: u8 = 90;

/// Upper bound on speculative allocation driven by an untrusted count
const PREALLOC_LIMIT: usize = 4096;

/// Deepest value nesting either direction will follow
///
/// Compiled scripts stay a few dozen levels deep; the cap keeps hostile input
/// from exhausting the native stack.
pub const MAX_DEPTH: usize = 128;

/// Arbitrary-precision integer kept as sign plus base-2^15 digits
///
/// Digits are least significant first and never carry trailing zero digits,
/// so two equal numbers always compare equal. Zero has no digits and is never
/// negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LongInt {
    negative: bool,
    digits: Vec<u16>,
}

impl LongInt {
    pub const DIGIT_BITS: u32 = 15;
    const DIGIT_MASK: u16 = (1 << Self::DIGIT_BITS) - 1;

    pub fn from_digits(negative: bool, mut digits: Vec<u16>) -> Result<Self> {
        if let Some(&bad) = digits.iter().find(|&&d| d > Self::DIGIT_MASK) {
            return Err(Error::InvalidLongDigit(bad));
        }
        while digits.last() == Some(&0) {
            digits.pop();
        }
        let negative = negative && !digits.is_empty();
        Ok(Self { negative, digits })
    }

    pub fn from_u128(mut magnitude: u128) -> Self {
        let mut digits = Vec::new();
        while magnitude != 0 {
            digits.push((magnitude & u128::from(Self::DIGIT_MASK)) as u16);
            magnitude >>= Self::DIGIT_BITS;
        }
        Self {
            negative: false,
            digits,
        }
    }

    pub fn from_i128(value: i128) -> Self {
        let mut long = Self::from_u128(value.unsigned_abs());
        long.negative = value < 0;
        long
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn digits(&self) -> &[u16] {
        &self.digits
    }

    /// Value as `i128`, `None` if it does not fit
    pub fn to_i128(&self) -> Option<i128> {
        let mut magnitude: u128 = 0;
        for &d in self.digits.iter().rev() {
            if magnitude.leading_zeros() < Self::DIGIT_BITS {
                return None;
            }
            magnitude = (magnitude << Self::DIGIT_BITS) | u128::from(d);
        }

        if self.negative {
            if magnitude > i128::MAX as u128 + 1 {
                return None;
            }
            Some((magnitude as i128).wrapping_neg())
        } else {
            i128::try_from(magnitude).ok()
        }
    }
}

impl From<i64> for LongInt {
    fn from(value: i64) -> Self {
        Self::from_i128(i128::from(value))
    }
}

impl From<u64> for LongInt {
    fn from(value: u64) -> Self {
        Self::from_u128(u128::from(value))
    }
}

/// One compiled executable unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeObject {
    pub argcount: i32,
    pub nlocals: i32,
    pub stacksize: i32,
    pub flags: i32,
    pub code: Vec<u8>,
    /// Constant and name pools are tuples or lists, kept as decoded
    pub consts: Value,
    pub names: Value,
    pub varnames: Value,
    pub freevars: Value,
    pub cellvars: Value,
    pub filename: Value,
    pub name: Value,
    pub firstlineno: i32,
    pub lnotab: Vec<u8>,
}

/// A node of the serialized object graph
///
/// Floats compare by bit pattern, so `-0.0 != 0.0` and a NaN equals itself.
/// Mappings and sets keep insertion order but compare like the unordered
/// collections they model.
#[derive(Debug, Clone)]
pub enum Value {
    /// Terminator of a mapping body; decodable but never encodable
    Null,
    None,
    Bool(bool),
    StopIteration,
    Ellipsis,
    Int(i64),
    Long(LongInt),
    Float(f64),
    Complex(f64, f64),
    Bytes(Vec<u8>),
    /// Byte string registered in the intern table
    Interned(Vec<u8>),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(IndexMap<Value, Value>),
    Set(IndexSet<Value>),
    FrozenSet(IndexSet<Value>),
    Code(Box<CodeObject>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::StopIteration => "stop-iteration",
            Value::Ellipsis => "ellipsis",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Complex(..) => "complex",
            Value::Bytes(_) => "bytes",
            Value::Interned(_) => "interned",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Code(_) => "code",
        }
    }

    /// Elements of a tuple or list
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&CodeObject> {
        match self {
            Value::Code(code) => Some(code.as_ref()),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null)
            | (Value::None, Value::None)
            | (Value::StopIteration, Value::StopIteration)
            | (Value::Ellipsis, Value::Ellipsis) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Complex(ar, ai), Value::Complex(br, bi)) => {
                ar.to_bits() == br.to_bits() && ai.to_bits() == bi.to_bits()
            }
            (Value::Bytes(a), Value::Bytes(b)) | (Value::Interned(a), Value::Interned(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Set(a), Value::Set(b)) | (Value::FrozenSet(a), Value::FrozenSet(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null | Value::None | Value::StopIteration | Value::Ellipsis => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Long(l) => l.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Complex(re, im) => {
                re.to_bits().hash(state);
                im.to_bits().hash(state);
            }
            Value::Bytes(b) | Value::Interned(b) => b.hash(state),
            Value::Str(s) => s.hash(state),
            Value::Tuple(items) | Value::List(items) => items.hash(state),
            // Order-insensitive equality, so only the size goes in
            Value::Dict(map) => map.len().hash(state),
            Value::Set(set) | Value::FrozenSet(set) => set.len().hash(state),
            Value::Code(code) => code.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<LongInt> for Value {
    fn from(l: LongInt) -> Self {
        Value::Long(l)
    }
}

impl From<CodeObject> for Value {
    fn from(code: CodeObject) -> Self {
        Value::Code(Box::new(code))
    }
}

/// Instruction byte substitution applied to code objects on encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeMap {
    table: [u8; 256],
}

impl Default for OpcodeMap {
    fn default() -> Self {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = i as u8;
        }
        Self { table }
    }
}

impl OpcodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: u8, to: u8) {
        self.table[usize::from(from)] = to;
    }

    pub fn get(&self, opcode: u8) -> u8 {
        self.table[usize::from(opcode)]
    }

    /// Remap every opcode of `code`, stepping over argument bytes
    ///
    /// Instruction width is decided by the remapped opcode, not the original.
    pub fn remap(&self, code: &[u8]) -> Vec<u8> {
        let mut out = code.to_vec();
        let mut c = 0;
        while c < out.len() {
            let n = self.get(out[c]);
            out[c] = n;
            c += if n < HAVE_ARGUMENT { 1 } else { 3 };
        }
        out
    }
}

impl FromIterator<(u8, u8)> for OpcodeMap {
    fn from_iter<I: IntoIterator<Item = (u8, u8)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (from, to) in iter {
            map.insert(from, to);
        }
        map
    }
}

/// Decode-session table of interned byte strings
#[derive(Debug, Default)]
pub struct InternTable {
    entries: Vec<Vec<u8>>,
}

impl InternTable {
    pub fn push(&mut self, entry: Vec<u8>) {
        self.entries.push(entry);
    }

    pub fn get(&self, index: i32) -> Result<&[u8]> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(Vec::as_slice)
            .ok_or(Error::InvalidBackReference {
                index,
                len: self.entries.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonical decimal text of a float: shortest round-trip digits, positional
/// between 1e-4 and 1e16, scientific with a signed two-digit exponent outside
pub fn float_repr(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let sci = format!("{x:e}");
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|&c| c != '.').collect();

    if (-4..16).contains(&exp) {
        let point = exp + 1;
        if point <= 0 {
            let zeros = "0".repeat(point.unsigned_abs() as usize);
            format!("{sign}0.{zeros}{digits}")
        } else {
            let point = point as usize;
            if point >= digits.len() {
                let zeros = "0".repeat(point - digits.len());
                format!("{sign}{digits}{zeros}.0")
            } else {
                format!("{sign}{}.{}", &digits[..point], &digits[point..])
            }
        }
    } else {
        let exp_sign = if exp < 0 { '-' } else { '+' };
        let exp = exp.unsigned_abs();
        if digits.len() == 1 {
            format!("{sign}{digits}e{exp_sign}{exp:02}")
        } else {
            format!("{sign}{}.{}e{exp_sign}{exp:02}", &digits[..1], &digits[1..])
        }
    }
}

fn parse_float_text(raw: &[u8]) -> Result<f64> {
    let invalid = || Error::InvalidFloat(String::from_utf8_lossy(raw).into_owned());
    let text = std::str::from_utf8(raw).map_err(|_| invalid())?.trim();

    match text.to_ascii_lowercase().as_str() {
        "nan" | "+nan" | "-nan" => Ok(f64::NAN),
        "inf" | "+inf" | "infinity" | "+infinity" => Ok(f64::INFINITY),
        "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
        _ => text.parse::<f64>().map_err(|_| invalid()),
    }
}

/// Streaming encoder
///
/// On error the writer may already hold a prefix of the output; callers that
/// need all-or-nothing should encode into a buffer (see [`dumps`]).
pub struct Marshaller<'a, W> {
    writer: W,
    opcodes: Option<&'a OpcodeMap>,
    interned: HashMap<Vec<u8>, i32>,
    depth: usize,
}

impl<'a, W: Write> Marshaller<'a, W> {
    pub fn new(writer: W, opcodes: Option<&'a OpcodeMap>) -> Self {
        Self {
            writer,
            opcodes,
            interned: HashMap::new(),
            depth: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn dump(&mut self, value: &Value) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::NestingTooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = self.dump_value(value);
        self.depth -= 1;
        result
    }

    fn dump_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => return Err(Error::UnmarshallableValue("null sentinel")),
            Value::None => self.w_tag(TYPE_NONE)?,
            Value::Bool(true) => self.w_tag(TYPE_TRUE)?,
            Value::Bool(false) => self.w_tag(TYPE_FALSE)?,
            Value::StopIteration => self.w_tag(TYPE_STOPITER)?,
            Value::Ellipsis => self.w_tag(TYPE_ELLIPSIS)?,
            Value::Int(x) => self.dump_int(*x)?,
            Value::Long(x) => self.dump_long(x)?,
            Value::Float(x) => {
                self.w_tag(TYPE_FLOAT)?;
                self.w_float_text(*x)?;
            }
            Value::Complex(re, im) => {
                self.w_tag(TYPE_COMPLEX)?;
                self.w_float_text(*re)?;
                self.w_float_text(*im)?;
            }
            Value::Bytes(b) => self.dump_bytes(b)?,
            Value::Interned(b) => self.dump_interned(b)?,
            Value::Str(s) => {
                self.w_tag(TYPE_UNICODE)?;
                self.w_len(s.len())?;
                self.writer.write_all(s.as_bytes())?;
            }
            Value::Tuple(items) => self.dump_seq(TYPE_TUPLE, items)?,
            Value::List(items) => self.dump_seq(TYPE_LIST, items)?,
            Value::Dict(map) => {
                self.w_tag(TYPE_DICT)?;
                for (key, value) in map {
                    self.dump(key)?;
                    self.dump(value)?;
                }
                self.w_tag(TYPE_NULL)?;
            }
            Value::Set(set) => self.dump_set(TYPE_SET, set)?,
            Value::FrozenSet(set) => self.dump_set(TYPE_FROZENSET, set)?,
            Value::Code(code) => self.dump_code(code)?,
        }
        Ok(())
    }

    fn w_tag(&mut self, tag: u8) -> Result<()> {
        self.writer.write_all(&[tag])?;
        Ok(())
    }

    fn w_long(&mut self, x: i32) -> Result<()> {
        self.writer.write_all(&x.to_le_bytes())?;
        Ok(())
    }

    fn w_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| Error::UnmarshallableValue("object too large"))?;
        self.w_long(len)
    }

    fn w_float_text(&mut self, x: f64) -> Result<()> {
        let text = float_repr(x);
        // repr output is at most a couple dozen characters
        self.writer.write_all(&[text.len() as u8])?;
        self.writer.write_all(text.as_bytes())?;
        Ok(())
    }

    fn dump_int(&mut self, x: i64) -> Result<()> {
        let y = x >> 31;
        if y == 0 || y == -1 {
            self.w_tag(TYPE_INT)?;
            self.w_long(x as i32)
        } else {
            self.w_tag(TYPE_INT64)?;
            self.writer.write_all(&x.to_le_bytes())?;
            Ok(())
        }
    }

    fn dump_long(&mut self, x: &LongInt) -> Result<()> {
        self.w_tag(TYPE_LONG)?;
        let size = i32::try_from(x.digits().len())
            .map_err(|_| Error::UnmarshallableValue("long too large"))?;
        self.w_long(if x.is_negative() { -size } else { size })?;
        for d in x.digits() {
            self.writer.write_all(&d.to_le_bytes())?;
        }
        Ok(())
    }

    fn dump_bytes(&mut self, b: &[u8]) -> Result<()> {
        self.w_tag(TYPE_STRING)?;
        self.w_len(b.len())?;
        self.writer.write_all(b)?;
        Ok(())
    }

    fn dump_interned(&mut self, b: &[u8]) -> Result<()> {
        if let Some(&index) = self.interned.get(b) {
            self.w_tag(TYPE_STRINGREF)?;
            return self.w_long(index);
        }

        let index = i32::try_from(self.interned.len())
            .map_err(|_| Error::UnmarshallableValue("intern table full"))?;
        self.interned.insert(b.to_vec(), index);
        self.w_tag(TYPE_INTERNED)?;
        self.w_len(b.len())?;
        self.writer.write_all(b)?;
        Ok(())
    }

    fn dump_seq(&mut self, tag: u8, items: &[Value]) -> Result<()> {
        self.w_tag(tag)?;
        self.w_len(items.len())?;
        for item in items {
            self.dump(item)?;
        }
        Ok(())
    }

    fn dump_set(&mut self, tag: u8, set: &IndexSet<Value>) -> Result<()> {
        self.w_tag(tag)?;
        self.w_len(set.len())?;
        for item in set {
            self.dump(item)?;
        }
        Ok(())
    }

    fn dump_code(&mut self, code: &CodeObject) -> Result<()> {
        self.w_tag(TYPE_CODE)?;
        self.w_long(code.argcount)?;
        self.w_long(code.nlocals)?;
        self.w_long(code.stacksize)?;
        self.w_long(code.flags)?;

        match self.opcodes {
            Some(map) => self.dump_bytes(&map.remap(&code.code))?,
            None => self.dump_bytes(&code.code)?,
        }

        self.dump_pool("consts", &code.consts)?;
        self.dump_pool("names", &code.names)?;
        self.dump_pool("varnames", &code.varnames)?;
        self.dump_pool("freevars", &code.freevars)?;
        self.dump_pool("cellvars", &code.cellvars)?;
        self.dump(&code.filename)?;
        self.dump(&code.name)?;
        self.w_long(code.firstlineno)?;
        self.dump_bytes(&code.lnotab)
    }

    fn dump_pool(&mut self, field: &'static str, pool: &Value) -> Result<()> {
        if pool.as_seq().is_none() {
            return Err(Error::InvalidCodeField {
                field,
                found: pool.kind_name(),
            });
        }
        self.dump(pool)
    }
}

/// Streaming decoder owning its intern table
pub struct Unmarshaller<R> {
    reader: R,
    strings: InternTable,
    depth: usize,
}

impl<R: Read> Unmarshaller<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            strings: InternTable::default(),
            depth: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn load(&mut self) -> Result<Value> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::NestingTooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = self.load_value();
        self.depth -= 1;
        result
    }

    fn load_value(&mut self) -> Result<Value> {
        let tag = self.r_byte()?;
        let value = match tag {
            TYPE_NULL => Value::Null,
            TYPE_NONE => Value::None,
            TYPE_TRUE => Value::Bool(true),
            TYPE_FALSE => Value::Bool(false),
            TYPE_STOPITER => Value::StopIteration,
            TYPE_ELLIPSIS => Value::Ellipsis,
            TYPE_INT => Value::Int(i64::from(self.r_long()?)),
            TYPE_INT64 => Value::Int(i64::from_le_bytes(self.r_array()?)),
            TYPE_LONG => Value::Long(self.load_long()?),
            TYPE_FLOAT => Value::Float(self.r_float_text()?),
            TYPE_COMPLEX => {
                let re = self.r_float_text()?;
                let im = self.r_float_text()?;
                Value::Complex(re, im)
            }
            TYPE_BINARY_FLOAT => Value::Float(f64::from_le_bytes(self.r_array()?)),
            TYPE_BINARY_COMPLEX => {
                let re = f64::from_le_bytes(self.r_array()?);
                let im = f64::from_le_bytes(self.r_array()?);
                Value::Complex(re, im)
            }
            TYPE_STRING => Value::Bytes(self.r_sized()?),
            TYPE_INTERNED => {
                let s = self.r_sized()?;
                self.strings.push(s.clone());
                Value::Interned(s)
            }
            TYPE_STRINGREF => {
                let index = self.r_long()?;
                Value::Interned(self.strings.get(index)?.to_vec())
            }
            TYPE_UNICODE => {
                let raw = self.r_sized()?;
                Value::Str(String::from_utf8(raw).map_err(|_| Error::InvalidUtf8)?)
            }
            TYPE_TUPLE => Value::Tuple(self.load_items()?),
            TYPE_LIST => Value::List(self.load_items()?),
            TYPE_DICT => {
                let mut map = IndexMap::new();
                loop {
                    let key = self.load()?;
                    if matches!(key, Value::Null) {
                        break;
                    }
                    let value = self.load()?;
                    map.insert(key, value);
                }
                Value::Dict(map)
            }
            TYPE_SET => Value::Set(self.load_items()?.into_iter().collect()),
            TYPE_FROZENSET => Value::FrozenSet(self.load_items()?.into_iter().collect()),
            TYPE_CODE => Value::Code(Box::new(self.load_code()?)),
            other => return Err(Error::BadFormatTag(other)),
        };
        Ok(value)
    }

    fn r_byte(&mut self) -> Result<u8> {
        let [b] = self.r_array()?;
        Ok(b)
    }

    fn r_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn r_long(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.r_array()?))
    }

    fn r_count(&mut self) -> Result<usize> {
        let n = self.r_long()?;
        usize::try_from(n).map_err(|_| Error::InvalidLength(n))
    }

    /// Length-prefixed byte run
    fn r_sized(&mut self) -> Result<Vec<u8>> {
        let n = self.r_count()?;
        self.r_bytes(n)
    }

    fn r_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(n.min(PREALLOC_LIMIT));
        (&mut self.reader).take(n as u64).read_to_end(&mut buf)?;
        if buf.len() != n {
            return Err(Error::TruncatedInput);
        }
        Ok(buf)
    }

    fn r_float_text(&mut self) -> Result<f64> {
        let n = self.r_byte()?;
        let raw = self.r_bytes(usize::from(n))?;
        parse_float_text(&raw)
    }

    fn load_long(&mut self) -> Result<LongInt> {
        let size = self.r_long()?;
        let count = size.unsigned_abs() as usize;
        let mut digits = Vec::with_capacity(count.min(PREALLOC_LIMIT));
        for _ in 0..count {
            digits.push(u16::from_le_bytes(self.r_array()?));
        }
        LongInt::from_digits(size < 0, digits)
    }

    fn load_items(&mut self) -> Result<Vec<Value>> {
        let n = self.r_count()?;
        let mut items = Vec::with_capacity(n.min(PREALLOC_LIMIT));
        for _ in 0..n {
            items.push(self.load()?);
        }
        Ok(items)
    }

    fn load_code(&mut self) -> Result<CodeObject> {
        let argcount = self.r_long()?;
        let nlocals = self.r_long()?;
        let stacksize = self.r_long()?;
        let flags = self.r_long()?;
        let code = expect_bytes("code", self.load()?)?;
        let consts = expect_seq("consts", self.load()?)?;
        let names = expect_seq("names", self.load()?)?;
        let varnames = expect_seq("varnames", self.load()?)?;
        let freevars = expect_seq("freevars", self.load()?)?;
        let cellvars = expect_seq("cellvars", self.load()?)?;
        let filename = self.load()?;
        let name = self.load()?;
        let firstlineno = self.r_long()?;
        let lnotab = expect_bytes("lnotab", self.load()?)?;

        Ok(CodeObject {
            argcount,
            nlocals,
            stacksize,
            flags,
            code,
            consts,
            names,
            varnames,
            freevars,
            cellvars,
            filename,
            name,
            firstlineno,
            lnotab,
        })
    }
}

fn expect_bytes(field: &'static str, value: Value) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(b) | Value::Interned(b) => Ok(b),
        other => Err(Error::InvalidCodeField {
            field,
            found: other.kind_name(),
        }),
    }
}

fn expect_seq(field: &'static str, value: Value) -> Result<Value> {
    match value {
        Value::Tuple(_) | Value::List(_) => Ok(value),
        other => Err(Error::InvalidCodeField {
            field,
            found: other.kind_name(),
        }),
    }
}

/// Encode `value` into `writer`
pub fn dump<W: Write>(value: &Value, writer: W, opcodes: Option<&OpcodeMap>) -> Result<()> {
    Marshaller::new(writer, opcodes).dump(value)
}

/// Encode `value` into a fresh buffer
pub fn dumps(value: &Value, opcodes: Option<&OpcodeMap>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    dump(value, &mut out, opcodes)?;
    Ok(out)
}

/// Decode one value from `reader`
pub fn load<R: Read>(reader: R) -> Result<Value> {
    Unmarshaller::new(reader).load()
}

/// Decode one value from the start of `data`, ignoring anything after it
pub fn loads(data: &[u8]) -> Result<Value> {
    load(data)
}

/// Decode one value from the start of `data` and report how many bytes it used
pub fn loads_prefix(data: &[u8]) -> Result<(Value, usize)> {
    let mut cursor = Cursor::new(data);
    let value = load(&mut cursor)?;
    Ok((value, cursor.position() as usize))
}
