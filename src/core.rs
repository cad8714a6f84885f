use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Name of the context variable holding the current frame.
pub const FRAME: &str = "frame";
/// Name of the context variable holding the first frame of the document.
pub const FRAME_RANGE_START: &str = "frameRange:start";
/// Name of the context variable holding the last frame of the document.
pub const FRAME_RANGE_END: &str = "frameRange:end";
/// Name of the context variable advertising the job directory of a dispatch.
pub const JOB_DIRECTORY: &str = "dispatcher:jobDirectory";

/// A 32-byte BLAKE3 hash used as the identity of a unit of work.
///
/// Two requests that hash to the same value for the same node are considered the
/// same work and end up in the same batch. The all-zero value is reserved: a task
/// that hashes to it is a no-op and is never executed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// The null digest, marking a task that has nothing to do.
    pub const NULL: Hash32 = Hash32([0; 32]);

    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Order independent combination of two digests, used to fold unordered sets.
    pub(crate) fn wrapping_add(self, other: Hash32) -> Hash32 {
        let mut out = [0u8; 32];
        let mut carry = 0u16;
        for i in (0..32).rev() {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        Hash32(out)
    }

    pub fn to_hex(self) -> String {
        let mut acc = String::with_capacity(64);
        for byte in self.0 {
            // Writing into a String cannot fail.
            let _ = write!(acc, "{byte:02x}");
        }
        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Incremental hasher producing a [`Hash32`].
///
/// Implements [`std::hash::Hasher`] so anything deriving `Hash` can be fed into it.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// A single value stored in a [`Context`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    fn feed(&self, hasher: &mut Blake3Hasher) {
        match self {
            Value::Bool(v) => hasher.update(&[0, *v as u8]),
            Value::Int(v) => hasher.update(&[1]).update(&v.to_le_bytes()),
            Value::Float(v) => hasher.update(&[2]).update(&v.to_bits().to_le_bytes()),
            Value::Str(v) => hasher
                .update(&[3])
                .update(&(v.len() as u64).to_le_bytes())
                .update(v.as_bytes()),
        };
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Bool(v) => Some(*v as i64),
            Value::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// An immutable set of named values a task is evaluated in.
///
/// The current frame is stored like any other variable under [`FRAME`]. Every
/// modifying method returns a new `Context` and leaves the original untouched,
/// cloning is cheap because the variables are shared.
#[derive(Clone, Default, PartialEq)]
pub struct Context {
    vars: Arc<BTreeMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Returns a copy of this context with `name` set to `value`.
    pub fn with(&self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut vars = (*self.vars).clone();
        vars.insert(name.into(), value.into());
        Self {
            vars: Arc::new(vars),
        }
    }

    /// Returns a copy of this context without `name`.
    pub fn without(&self, name: &str) -> Self {
        if !self.vars.contains_key(name) {
            return self.clone();
        }
        let mut vars = (*self.vars).clone();
        vars.remove(name);
        Self {
            vars: Arc::new(vars),
        }
    }

    /// The current frame, 1 when the context doesn't define one.
    pub fn frame(&self) -> i64 {
        self.get_int(FRAME).unwrap_or(1)
    }

    pub fn with_frame(&self, frame: i64) -> Self {
        self.with(FRAME, frame)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Hash of every variable in the context.
    pub fn hash(&self) -> Hash32 {
        self.hash_vars(self.vars.keys().map(String::as_str))
    }

    /// Hash of the named variables only. Missing variables still contribute their
    /// name, so "absent" and "present" never collide.
    pub fn hash_vars<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        for name in names {
            hasher
                .update(&(name.len() as u64).to_le_bytes())
                .update(name.as_bytes());
            match self.vars.get(name) {
                Some(value) => value.feed(&mut hasher),
                None => {
                    hasher.update(&[0xff]);
                }
            }
        }
        hasher.into()
    }

    /// Expands `${name}` references and runs of `#` in `text`.
    ///
    /// A run of `#` is replaced by the current frame padded with zeros to the
    /// length of the run. Unknown variables expand to an empty string.
    pub fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '$' if chars.peek() == Some(&'{') => {
                    chars.next();
                    let mut name = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        name.push(c);
                    }
                    if let Some(value) = self.get(&name) {
                        let _ = write!(out, "{value}");
                    }
                }
                '#' => {
                    let mut width = 1;
                    while chars.peek() == Some(&'#') {
                        chars.next();
                        width += 1;
                    }
                    let frame = self.frame();
                    if frame < 0 {
                        let _ = write!(out, "-{:0width$}", frame.unsigned_abs());
                    } else {
                        let _ = write!(out, "{frame:0width$}");
                    }
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                _ => out.push(c),
            }
        }

        out
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.vars.iter()).finish()
    }
}
