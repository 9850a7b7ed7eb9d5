//! Minimal type tags: `int` and `pointer-to T`.
//!
//! Types are informational. Nothing rejects a mismatch; the parser consults
//! them to scale pointer arithmetic and to type dereferences.

/// Size in bytes of every scalar value and local slot.
pub const SLOT_SIZE: i64 = 8;

/// Stack frames are rounded up to this boundary.
pub const STACK_ALIGN: i64 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
  Int,
  Ptr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
  pub kind: TypeKind,
  pub base: Option<Box<Type>>,
}

impl Type {
  pub fn int() -> Self {
    Self {
      kind: TypeKind::Int,
      base: None,
    }
  }

  pub fn pointer_to(base: Type) -> Self {
    Self {
      kind: TypeKind::Ptr,
      base: Some(Box::new(base)),
    }
  }

  pub fn is_pointer(&self) -> bool {
    matches!(self.kind, TypeKind::Ptr)
  }

  pub fn base(&self) -> Option<&Type> {
    self.base.as_deref()
  }

  pub fn size(&self) -> i64 {
    match self.kind {
      TypeKind::Int => SLOT_SIZE,
      TypeKind::Ptr => SLOT_SIZE,
    }
  }
}

/// Round `n` up to the next multiple of `align`, which must be a power of two.
pub fn align_to(n: i64, align: i64) -> i64 {
  debug_assert!(align > 0 && align & (align - 1) == 0);
  (n + align - 1) & !(align - 1)
}
