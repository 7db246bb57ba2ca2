use std::fmt;
use std::num::NonZeroU32;

/// A compressed reference to a heap object.
///
/// References are 32-bit ids; 0 is reserved for null, so `Option<ObjRef>`
/// is the nullable reference type and has the same size as `u32`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(NonZeroU32);

impl ObjRef {
    /// Decode a raw field or register value. 0 decodes to null.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ObjRef)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }

    /// Encode a nullable reference as stored in heap fields.
    pub fn encode(r: Option<ObjRef>) -> u32 {
        r.map_or(0, ObjRef::raw)
    }

    pub(crate) fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    pub(crate) fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index + 1).ok().and_then(Self::from_raw)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.0)
    }
}

/// A value crossing the boundary between the host and managed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JValue {
    #[default]
    Void,
    Int(i32),
    Wide(i64),
    Ref(Option<ObjRef>),
}

impl JValue {
    pub fn null() -> Self {
        JValue::Ref(None)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, JValue::Void)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            JValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_wide(&self) -> Option<i64> {
        match self {
            JValue::Wide(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            JValue::Ref(r) => *r,
            _ => None,
        }
    }

    /// Number of virtual registers the value occupies.
    pub fn register_width(&self) -> usize {
        match self {
            JValue::Void => 0,
            JValue::Wide(_) => 2,
            _ => 1,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JValue::Void => "void",
            JValue::Int(_) => "int",
            JValue::Wide(_) => "long",
            JValue::Ref(_) => "reference",
        }
    }
}

impl fmt::Display for JValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JValue::Void => write!(f, "void"),
            JValue::Int(n) => write!(f, "{}", n),
            JValue::Wide(n) => write!(f, "{}", n),
            JValue::Ref(None) => write!(f, "null"),
            JValue::Ref(Some(r)) => write!(f, "@{}", r.raw()),
        }
    }
}

/// One virtual register.
///
/// The 32 value bits are what arithmetic sees. `reference` is the shadow
/// the collector scans; it is set only by instructions that produce a
/// reference, so an integer that happens to look like an object id is never
/// treated as a root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Register {
    bits: u32,
    reference: Option<ObjRef>,
}

impl Register {
    pub fn from_int(value: i32) -> Self {
        Self {
            bits: value as u32,
            reference: None,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            reference: None,
        }
    }

    pub fn from_ref(r: Option<ObjRef>) -> Self {
        Self {
            bits: ObjRef::encode(r),
            reference: r,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn int(&self) -> i32 {
        self.bits as i32
    }

    pub fn reference(&self) -> Option<ObjRef> {
        self.reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_encoding() {
        assert_eq!(ObjRef::from_raw(0), None);
        assert_eq!(ObjRef::encode(None), 0);
        let r = ObjRef::from_raw(7).unwrap();
        assert_eq!(ObjRef::encode(Some(r)), 7);
        assert_eq!(std::mem::size_of::<Option<ObjRef>>(), 4);
    }

    #[test]
    fn test_index_mapping() {
        let r = ObjRef::from_index(0).unwrap();
        assert_eq!(r.raw(), 1);
        assert_eq!(r.index(), 0);
    }

    #[test]
    fn test_int_register_is_not_a_root() {
        let reg = Register::from_int(5);
        assert_eq!(reg.int(), 5);
        assert_eq!(reg.reference(), None);

        let r = ObjRef::from_raw(5);
        let reg = Register::from_ref(r);
        assert_eq!(reg.bits(), 5);
        assert_eq!(reg.reference(), r);
    }

    #[test]
    fn test_jvalue_display() {
        assert_eq!(JValue::Int(-3).to_string(), "-3");
        assert_eq!(JValue::Wide(1 << 40).to_string(), "1099511627776");
        assert_eq!(JValue::null().to_string(), "null");
        assert_eq!(JValue::Ref(ObjRef::from_raw(9)).to_string(), "@9");
    }
}
