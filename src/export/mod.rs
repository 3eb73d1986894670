//! The code-export layer: variable descriptors, the fused arithmetic
//! statement IR, statement blocks and exported routines.
//!
//! Everything in this module operates at generation time. The only side
//! effect of any emission entry point is a write into the caller-supplied
//! output target; a failed call writes nothing.

pub mod block;
pub mod function;
pub mod index;
pub mod statement;
pub mod variable;

use serde::{Deserialize, Serialize};

pub use block::{Statement, StatementBlock};
pub use function::{ArgKind, Function, FunctionArg};
pub use index::Index;
pub use statement::{ArithmeticStatement, Operator};
pub use variable::{Element, Variable};

/// Options adjusting the appearance of exported code.
///
/// Declarations and code for the same entity must be emitted under the same
/// options to stay consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Identifier used to declare real-valued data
    pub real_type: String,
    /// Identifier used to declare integer data
    pub int_type: String,
    /// Significant decimal digits for embedded numeric constants
    pub precision: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            real_type: "real_t".to_string(),
            int_type: "int".to_string(),
            precision: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_survive_a_serde_round_trip() {
        let options = ExportOptions {
            real_type: "double".to_string(),
            int_type: "int32_t".to_string(),
            precision: 8,
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: ExportOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn default_options_target_the_embedded_typedefs() {
        let options = ExportOptions::default();
        assert_eq!(options.real_type, "real_t");
        assert_eq!(options.precision, 16);
    }
}
