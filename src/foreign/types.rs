//! Value and type descriptors for calls into the foreign runtime
//!
//! One call path replaces the per-primitive family of call wrappers:
//! arguments travel as a slice of tagged `JValue`s and the expected result
//! shape is a `JType`.

use crate::errors::CallError;
use std::fmt;
use std::num::NonZeroUsize;

/// Opaque, non-null reference to an object in the foreign heap
///
/// Two `RawRef`s naming the same object can differ (a local and a global
/// reference to one object are distinct values), so equality of `RawRef`
/// says nothing about object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawRef(NonZeroUsize);

impl RawRef {
    #[inline]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
        Self::from_addr(ptr as usize)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }
}

impl fmt::Display for RawRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Method identifier issued by the foreign runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(NonZeroUsize);

impl MethodId {
    #[inline]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
        Self::from_addr(ptr as usize)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }
}

/// Reference type as reported by the foreign runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    Local,
    Global,
    Weak,
}

/// Static or instance member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Instance,
    Static,
}

/// Foreign type descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JType {
    Void,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object,
}

impl JType {
    /// Size of the value in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
            Self::Object => core::mem::size_of::<usize>(),
        }
    }

    #[inline]
    pub const fn is_primitive(self) -> bool {
        !matches!(self, Self::Void | Self::Object)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Descriptor character used in method signatures
    pub const fn descriptor(self) -> char {
        match self {
            Self::Void => 'V',
            Self::Boolean => 'Z',
            Self::Byte => 'B',
            Self::Char => 'C',
            Self::Short => 'S',
            Self::Int => 'I',
            Self::Long => 'J',
            Self::Float => 'F',
            Self::Double => 'D',
            Self::Object => 'L',
        }
    }

    /// Zero value returned when a call yields no usable result
    pub const fn zero(self) -> JValue {
        match self {
            Self::Void => JValue::Void,
            Self::Boolean => JValue::Boolean(false),
            Self::Byte => JValue::Byte(0),
            Self::Char => JValue::Char(0),
            Self::Short => JValue::Short(0),
            Self::Int => JValue::Int(0),
            Self::Long => JValue::Long(0),
            Self::Float => JValue::Float(0.0),
            Self::Double => JValue::Double(0.0),
            Self::Object => JValue::Object(None),
        }
    }
}

impl fmt::Display for JType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Void => "void",
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// Tagged call argument or result
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JValue {
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Option<RawRef>),
}

impl JValue {
    #[inline]
    pub const fn null() -> Self {
        Self::Object(None)
    }

    #[inline]
    pub const fn object(raw: RawRef) -> Self {
        Self::Object(Some(raw))
    }

    pub const fn ty(&self) -> JType {
        match self {
            Self::Void => JType::Void,
            Self::Boolean(_) => JType::Boolean,
            Self::Byte(_) => JType::Byte,
            Self::Char(_) => JType::Char,
            Self::Short(_) => JType::Short,
            Self::Int(_) => JType::Int,
            Self::Long(_) => JType::Long,
            Self::Float(_) => JType::Float,
            Self::Double(_) => JType::Double,
            Self::Object(_) => JType::Object,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Boolean(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match *self {
            Self::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match *self {
            Self::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Object reference carried by this value (`None` for null or primitives)
    pub fn as_object(&self) -> Option<RawRef> {
        match *self {
            Self::Object(v) => v,
            _ => None,
        }
    }
}

impl From<bool> for JValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for JValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for JValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for JValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<RawRef> for JValue {
    fn from(v: RawRef) -> Self {
        Self::Object(Some(v))
    }
}

/// Receiver of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Virtual dispatch on the object's runtime class
    Instance(RawRef),
    /// Dispatch to the implementation declared by `class`
    Nonvirtual { object: RawRef, class: RawRef },
    /// Static method of `class`
    Static(RawRef),
}

impl CallTarget {
    pub const fn kind(&self) -> MemberKind {
        match self {
            Self::Instance(_) | Self::Nonvirtual { .. } => MemberKind::Instance,
            Self::Static(_) => MemberKind::Static,
        }
    }
}

/// Parsed method descriptor, e.g. `(ILjava/lang/String;)V`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<JType>,
    pub ret: JType,
}

impl Signature {
    pub fn parse(descriptor: &str) -> Result<Self, CallError> {
        let bad = || CallError::BadSignature {
            signature: descriptor.to_string(),
        };

        let bytes = descriptor.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(bad());
        }

        let mut pos = 1;
        let mut params = Vec::new();
        while pos < bytes.len() && bytes[pos] != b')' {
            let (ty, next) = parse_field(bytes, pos).ok_or_else(bad)?;
            params.push(ty);
            pos = next;
        }
        if pos >= bytes.len() {
            return Err(bad());
        }
        pos += 1;

        let ret = if bytes.get(pos) == Some(&b'V') {
            pos += 1;
            JType::Void
        } else {
            let (ty, next) = parse_field(bytes, pos).ok_or_else(bad)?;
            pos = next;
            ty
        };

        if pos != bytes.len() {
            return Err(bad());
        }
        Ok(Self { params, ret })
    }
}

/// Parse one field descriptor starting at `pos`; returns the type and the
/// position just past it.
fn parse_field(bytes: &[u8], pos: usize) -> Option<(JType, usize)> {
    let ty = match *bytes.get(pos)? {
        b'Z' => JType::Boolean,
        b'B' => JType::Byte,
        b'C' => JType::Char,
        b'S' => JType::Short,
        b'I' => JType::Int,
        b'J' => JType::Long,
        b'F' => JType::Float,
        b'D' => JType::Double,
        b'L' => {
            let end = bytes[pos..].iter().position(|&b| b == b';')?;
            if end < 2 {
                return None;
            }
            return Some((JType::Object, pos + end + 1));
        }
        b'[' => {
            let (_, next) = parse_field(bytes, pos + 1)?;
            return Some((JType::Object, next));
        }
        _ => return None,
    };
    Some((ty, pos + 1))
}

/// Method resolved against a class, ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub id: MethodId,
    pub kind: MemberKind,
    pub name: String,
    pub signature: Signature,
}

impl Method {
    /// Check a call against this method's declaration before it reaches the
    /// foreign runtime.
    pub fn validate(&self, target: &CallTarget, args: &[JValue]) -> Result<(), CallError> {
        if target.kind() != self.kind {
            return Err(CallError::TargetMismatch {
                method: self.name.clone(),
                expected: self.kind,
            });
        }

        if args.len() != self.signature.params.len() {
            return Err(CallError::ArgCountMismatch {
                method: self.name.clone(),
                expected: self.signature.params.len(),
                got: args.len(),
            });
        }

        for (index, (arg, expected)) in args.iter().zip(&self.signature.params).enumerate() {
            if arg.ty() != *expected {
                return Err(CallError::ArgTypeMismatch {
                    method: self.name.clone(),
                    index,
                    expected: *expected,
                    got: arg.ty(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_parse() {
        let sig = Signature::parse("(ILjava/lang/String;[J)V").unwrap();
        assert_eq!(sig.params, vec![JType::Int, JType::Object, JType::Object]);
        assert_eq!(sig.ret, JType::Void);

        let sig = Signature::parse("()Ljava/lang/Object;").unwrap();
        assert!(sig.params.is_empty());
        assert_eq!(sig.ret, JType::Object);

        let sig = Signature::parse("([[Ljava/lang/String;D)[I").unwrap();
        assert_eq!(sig.params, vec![JType::Object, JType::Double]);
        assert_eq!(sig.ret, JType::Object);
    }

    #[test]
    fn test_signature_rejects_malformed() {
        for bad in ["", "I", "(I", "(Q)V", "(L;)V", "(I)", "(I)VV", "(V)V"] {
            assert!(Signature::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_jtype_sizes() {
        assert_eq!(JType::Boolean.size(), 1);
        assert_eq!(JType::Char.size(), 2);
        assert_eq!(JType::Int.size(), 4);
        assert_eq!(JType::Long.size(), 8);
        assert_eq!(JType::Void.size(), 0);
        assert!(JType::Double.is_float());
        assert!(!JType::Object.is_primitive());
    }

    #[test]
    fn test_validate_arguments() {
        let method = Method {
            id: MethodId::from_addr(1).unwrap(),
            kind: MemberKind::Instance,
            name: "add".into(),
            signature: Signature::parse("(IJ)I").unwrap(),
        };
        let obj = RawRef::from_addr(0x10).unwrap();
        let target = CallTarget::Instance(obj);

        assert!(method.validate(&target, &[JValue::Int(1), JValue::Long(2)]).is_ok());
        assert!(matches!(
            method.validate(&target, &[JValue::Int(1)]),
            Err(CallError::ArgCountMismatch { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            method.validate(&target, &[JValue::Int(1), JValue::Int(2)]),
            Err(CallError::ArgTypeMismatch { index: 1, .. })
        ));
        assert!(matches!(
            method.validate(&CallTarget::Static(obj), &[JValue::Int(1), JValue::Long(2)]),
            Err(CallError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn test_raw_ref_nonzero() {
        assert!(RawRef::from_addr(0).is_none());
        let r = RawRef::from_addr(0x1000).unwrap();
        assert_eq!(r.addr(), 0x1000);
        assert_eq!(r.to_string(), "0x1000");
    }
}
