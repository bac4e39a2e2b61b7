use core::fmt;

pub const LOG_MIN_OBJECT_ALIGNMENT: usize = 4;
/// Every object starts on a granule of this many bytes. The low bits of an object address are
/// therefore free for task flags.
pub const MIN_OBJECT_ALIGNMENT: usize = 1 << LOG_MIN_OBJECT_ALIGNMENT;

/// Address of a heap object. Zero is the null reference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ObjectRef(usize);

impl ObjectRef {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn from_address(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn to_address(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & (MIN_OBJECT_ALIGNMENT - 1) == 0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Strength of a `java.lang.ref`-style reference object.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ReferenceType {
    Soft,
    Weak,
    Final,
    Phantom,
}

impl ReferenceType {
    pub const ALL: [ReferenceType; 4] = [Self::Soft, Self::Weak, Self::Final, Self::Phantom];

    pub const fn index(self) -> usize {
        match self {
            Self::Soft => 0,
            Self::Weak => 1,
            Self::Final => 2,
            Self::Phantom => 3,
        }
    }
}

/// Shape of an object as far as tracing is concerned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectKind {
    /// Plain object, every slot is a strong reference.
    Instance,
    /// Reference object. Its referent slot is handed to the reference processor instead of being
    /// traced.
    Reference(ReferenceType),
    /// Array of references.
    ObjArray { length: usize },
    /// Array of primitives.
    TypeArray,
}
