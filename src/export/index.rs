//! Symbolic generation-time indices.
//!
//! An [Index] is an affine expression `name * factor + offset` (or a plain
//! literal) that names a loop counter of the generated code. All index
//! arithmetic happens at generation time; the emitted text contains the
//! folded expression.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A symbolic index expression used when addressing exported buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Index {
    /// A value fully known at generation time
    Literal(i64),
    /// An affine expression over a named loop counter
    Symbolic {
        name: String,
        factor: i64,
        offset: i64,
    },
}

impl Index {
    /// Create a symbolic index over a named counter (`name * 1 + 0`)
    pub fn named(name: impl Into<String>) -> Self {
        Index::Symbolic {
            name: name.into(),
            factor: 1,
            offset: 0,
        }
    }

    /// Create a literal index
    pub fn literal(value: i64) -> Self {
        Index::Literal(value)
    }

    /// Whether the index is fully known at generation time
    pub fn is_literal(&self) -> bool {
        matches!(self, Index::Literal(_))
    }

    /// The literal value, if known
    pub fn value(&self) -> Option<i64> {
        match self {
            Index::Literal(v) => Some(*v),
            Index::Symbolic { .. } => None,
        }
    }

    /// The index shifted by a constant
    pub fn shifted(&self, delta: i64) -> Self {
        match self {
            Index::Literal(v) => Index::Literal(v + delta),
            Index::Symbolic {
                name,
                factor,
                offset,
            } => Index::Symbolic {
                name: name.clone(),
                factor: *factor,
                offset: offset + delta,
            },
        }
    }

    /// The index scaled by a constant
    pub fn scaled(&self, scale: i64) -> Self {
        match self {
            Index::Literal(v) => Index::Literal(v * scale),
            Index::Symbolic {
                name,
                factor,
                offset,
            } => Index::Symbolic {
                name: name.clone(),
                factor: factor * scale,
                offset: offset * scale,
            },
        }
    }

    /// The name of the underlying counter, if symbolic
    pub fn counter(&self) -> Option<&str> {
        match self {
            Index::Literal(_) => None,
            Index::Symbolic { name, .. } => Some(name.as_str()),
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Literal(v) => write!(f, "{}", v),
            Index::Symbolic {
                name,
                factor,
                offset,
            } => {
                if *factor == 0 {
                    return write!(f, "{}", offset);
                }
                if *factor == 1 {
                    write!(f, "{}", name)?;
                } else {
                    write!(f, "{} * {}", name, factor)?;
                }
                if *offset > 0 {
                    write!(f, " + {}", offset)?;
                } else if *offset < 0 {
                    write!(f, " - {}", -offset)?;
                }
                Ok(())
            }
        }
    }
}
