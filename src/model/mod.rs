//! Model-side inputs to the code generator: integration grids and the
//! narrow handles through which the external symbolic engine and externally
//! compiled model routines are consumed.

pub mod grid;
pub mod rhs;

pub use grid::Grid;
pub use rhs::{ModelRhs, Output, OutputRhs, SymbolicFunction};
