//! odegen exports tailored, loop-unrolled integrator code for embedded
//! model predictive control.
//!
//! A model (symbolic, externally compiled, or polynomial NARX) plus an
//! integration grid go in; self-contained target-language routines come
//! out, with every loop over grid intervals, Runge-Kutta stages and matrix
//! entries unrolled at generation time. Linear parts of the dynamics are
//! folded into constant one-step maps, structural zeros never produce a
//! statement, and forward sensitivities are carried right inside the state
//! vector of the generated code.
//!
//! ```no_run
//! use odegen::*;
//!
//! # fn main() -> Result<(), CodegenError> {
//! let mut export = IntegratorRegistry::with_default_schemes()
//!     .create(IntegratorKind::ExplicitRungeKutta4)?;
//! export.set_differential_equation(
//!     SymbolicFunction::new("acado_rhs", 3, 2),
//!     SymbolicFunction::new("acado_diffs", 3, 6),
//! )?;
//! export.set_dimensions(2, 1)?;
//! export.set_grid(Grid::equidistant(0.0, 1.0, 10)?)?;
//! export.setup()?;
//!
//! let mut code = StatementBlock::new();
//! export.get_data_declarations(&mut code)?;
//! export.get_function_declarations(&mut code)?;
//! export.get_code(&mut code)?;
//! println!("{}", code.render_code(&ExportOptions::default())?);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod export;
pub mod integrator;
pub mod model;

pub use crate::error::CodegenError;
pub use crate::export::{
    ArgKind, ArithmeticStatement, Element, ExportOptions, Function, FunctionArg, Index, Operator,
    Statement, StatementBlock, Variable,
};
pub use crate::integrator::{
    ButcherTableau, IntegratorExport, IntegratorKind, IntegratorRegistry, SensitivityMode,
};
pub use crate::model::{Grid, ModelRhs, Output, OutputRhs, SymbolicFunction};
pub use nalgebra::{dmatrix, DMatrix, DVector};
