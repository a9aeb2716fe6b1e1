#![forbid(unsafe_code)]

//! In-memory footprint estimation for buffered shuffle output.
//!
//! Values describe their own shape through [`Estimate`]; the
//! [`SizeEstimator`] walks the resulting reference graph and the
//! [`SizeTracker`] amortizes repeated estimates over a growing buffer.

use std::any::TypeId;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::{Result, SpillwayError};

/// Reference-graph traversal and the per-shape layout cache.
pub mod estimator;
/// Composed per-shape layouts.
pub mod layout;
/// Amortized size tracking over an append-only buffer.
pub mod tracker;

pub use estimator::{sample_indices, EstimatorOptions, SizeEstimator, VisitedSet};
pub use layout::{ClassLayout, LayoutCache};
pub use tracker::{Sample, SizeTracker, TrackerOptions};

/// Scalar kinds with a fixed in-memory width.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PrimitiveKind {
    /// `bool`
    Bool,
    /// `u8` / `i8`
    Byte,
    /// `u16` / `i16`
    Short,
    /// `char`
    Char,
    /// `u32` / `i32`
    Int,
    /// `f32`
    Float,
    /// `u64` / `i64` / `usize` / `isize`
    Long,
    /// `f64`
    Double,
}

impl PrimitiveKind {
    /// Width in bytes of one value of this kind.
    pub const fn width(self) -> u64 {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::Byte => 1,
            PrimitiveKind::Short => 2,
            PrimitiveKind::Char | PrimitiveKind::Int | PrimitiveKind::Float => 4,
            PrimitiveKind::Long | PrimitiveKind::Double => 8,
        }
    }
}

/// Storage class of a declared member.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    /// Stored inline with a fixed width.
    Primitive(PrimitiveKind),
    /// Points at another value that is traversed separately.
    Reference,
}

/// One declared member of a [`Shape`].
#[derive(Debug)]
pub struct Field {
    /// Member name, passed back to [`Estimate::reference`].
    pub name: &'static str,
    /// Storage class of the member.
    pub kind: FieldKind,
}

impl Field {
    /// Declares an inline scalar member.
    pub const fn primitive(name: &'static str, kind: PrimitiveKind) -> Self {
        Field {
            name,
            kind: FieldKind::Primitive(kind),
        }
    }

    /// Declares a member that references another value.
    pub const fn reference(name: &'static str) -> Self {
        Field {
            name,
            kind: FieldKind::Reference,
        }
    }
}

/// Static description of an object type.
///
/// Shapes compose: a shape with a `parent` inherits every member of the
/// parent before its own. Shapes must live in `static` items because the
/// layout cache keys on their address.
#[derive(Debug)]
pub struct Shape {
    /// Human-readable type name used in errors.
    pub name: &'static str,
    /// Shape whose members precede this shape's own members.
    pub parent: Option<&'static Shape>,
    /// Members declared by this shape itself.
    pub fields: &'static [Field],
}

impl Shape {
    /// Declares a shape with no parent.
    pub const fn root(name: &'static str, fields: &'static [Field]) -> Self {
        Shape {
            name,
            parent: None,
            fields,
        }
    }

    /// Declares a shape extending `parent`.
    pub const fn extends(
        name: &'static str,
        parent: &'static Shape,
        fields: &'static [Field],
    ) -> Self {
        Shape {
            name,
            parent: Some(parent),
            fields,
        }
    }
}

/// How the estimator treats a value.
#[derive(Copy, Clone, Debug)]
pub enum Kind {
    /// A composite with a declared shape.
    Object(&'static Shape),
    /// A scalar; no traversal.
    Primitive(PrimitiveKind),
    /// A homogeneous sequence exposed through [`Estimate::element`].
    Sequence,
    /// A smart pointer whose target is [`Estimate::element`]`(0)`.
    ///
    /// The pointer itself costs nothing beyond the slot its owner already
    /// pays for; the target is counted once however many pointers share it.
    Pointer,
    /// Type metadata; zero cost and never traversed.
    Metadata,
}

/// A value whose in-memory footprint can be estimated.
pub trait Estimate: 'static {
    /// Describes how this value is laid out.
    fn kind(&self) -> Kind;

    /// Reads a reference member declared by this value's [`Shape`].
    ///
    /// `Ok(None)` means the member is currently empty. An unknown member is
    /// an error, never a silent zero.
    fn reference(&self, field: &Field) -> Result<Option<&dyn Estimate>> {
        Err(SpillwayError::FieldAccess {
            shape: std::any::type_name::<Self>(),
            field: field.name,
        })
    }

    /// Number of elements of a sequence.
    fn element_count(&self) -> usize {
        0
    }

    /// Element at `index` of a sequence, or the target of a pointer.
    fn element(&self, _index: usize) -> Option<&dyn Estimate> {
        None
    }

    /// Concrete type of the value, used together with its address as identity.
    fn type_key(&self) -> TypeId {
        TypeId::of::<Self>()
    }
}

macro_rules! impl_primitive {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Estimate for $ty {
                fn kind(&self) -> Kind {
                    Kind::Primitive(PrimitiveKind::$kind)
                }
            }
        )*
    };
}

impl_primitive! {
    bool => Bool,
    u8 => Byte,
    i8 => Byte,
    u16 => Short,
    i16 => Short,
    char => Char,
    u32 => Int,
    i32 => Int,
    f32 => Float,
    u64 => Long,
    i64 => Long,
    usize => Long,
    isize => Long,
    f64 => Double,
}

impl Estimate for String {
    fn kind(&self) -> Kind {
        Kind::Sequence
    }

    fn element_count(&self) -> usize {
        self.len()
    }

    fn element(&self, index: usize) -> Option<&dyn Estimate> {
        self.as_bytes().get(index).map(|b| b as &dyn Estimate)
    }
}

impl Estimate for &'static str {
    fn kind(&self) -> Kind {
        Kind::Metadata
    }
}

impl Estimate for TypeId {
    fn kind(&self) -> Kind {
        Kind::Metadata
    }
}

impl Estimate for Shape {
    fn kind(&self) -> Kind {
        Kind::Metadata
    }
}

impl<T: Estimate> Estimate for Vec<T> {
    fn kind(&self) -> Kind {
        Kind::Sequence
    }

    fn element_count(&self) -> usize {
        self.len()
    }

    fn element(&self, index: usize) -> Option<&dyn Estimate> {
        self.get(index).map(|e| e as &dyn Estimate)
    }
}

impl<T: Estimate> Estimate for VecDeque<T> {
    fn kind(&self) -> Kind {
        Kind::Sequence
    }

    fn element_count(&self) -> usize {
        self.len()
    }

    fn element(&self, index: usize) -> Option<&dyn Estimate> {
        self.get(index).map(|e| e as &dyn Estimate)
    }
}

impl<T: Estimate> Estimate for Box<T> {
    fn kind(&self) -> Kind {
        Kind::Pointer
    }

    fn element(&self, index: usize) -> Option<&dyn Estimate> {
        (index == 0).then(|| &**self as &dyn Estimate)
    }
}

impl<T: Estimate> Estimate for Arc<T> {
    fn kind(&self) -> Kind {
        Kind::Pointer
    }

    fn element(&self, index: usize) -> Option<&dyn Estimate> {
        (index == 0).then(|| &**self as &dyn Estimate)
    }
}

impl<T: Estimate> Estimate for Option<T> {
    fn kind(&self) -> Kind {
        Kind::Pointer
    }

    fn element(&self, index: usize) -> Option<&dyn Estimate> {
        match (index, self) {
            (0, Some(value)) => Some(value as &dyn Estimate),
            _ => None,
        }
    }
}
