//! Discrete-time state map.

use crate::error::CodegenError;
use crate::export::{ArithmeticStatement, StatementBlock};

use super::{
    offset_arg, ButcherTableau, Config, Dims, SchemeGenerator, StepCtx,
};

/// Code generator for an already-discrete state transition
/// `x2+ = f(x1, x2, u)`.
///
/// No tableau, no stage loop: one right-hand-side call per step, with the
/// Jacobian written straight into the local sensitivity buffer. The linear
/// partitions still apply, with their matrices read as the one-step
/// transition itself.
pub struct DiscreteScheme;

impl DiscreteScheme {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DiscreteScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemeGenerator for DiscreteScheme {
    fn name(&self) -> &'static str {
        "discrete time"
    }

    fn num_stages(&self) -> usize {
        0
    }

    fn tableau(&self) -> Option<&ButcherTableau> {
        None
    }

    fn check(&self, cfg: &Config, dims: &Dims) -> Result<(), CodegenError> {
        if cfg.rhs.is_none() && dims.nx2 > 0 {
            return Err(CodegenError::ModelNotAssigned);
        }
        Ok(())
    }

    fn rhs_names(&self, cfg: &Config) -> Result<(String, String), CodegenError> {
        let rhs = cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
        Ok((rhs.name().to_string(), rhs.diffs_name().to_string()))
    }

    fn update_implicit_system(
        &self,
        ctx: &StepCtx,
        cfg: &Config,
        block: &mut StatementBlock,
    ) -> Result<(), CodegenError> {
        let d = &ctx.dims;
        let b = ctx.bufs;
        // the transition reads the step-start linear-input rows
        if d.nx1 > 0 {
            block.add_arithmetic(ArithmeticStatement::assign(
                b.xxx().block(0, 0, d.nx1, 1),
                b.xtmp().block(0, 0, d.nx1, 1),
            ));
        }
        if d.nx2 == 0 {
            if d.nx3 > 0 && d.nx12() > 0 {
                block.add_arithmetic(ArithmeticStatement::assign(
                    b.stage_x().row(0),
                    b.xxx().block(0, 0, d.nx12(), 1).transposed(),
                ));
            }
            return Ok(());
        }
        let rhs = cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
        block.add_arithmetic(ArithmeticStatement::assign(
            b.xxx().block(d.nx1, 0, d.nx2, 1),
            b.eta_x2(),
        ));
        if d.nx3 > 0 {
            block.add_arithmetic(ArithmeticStatement::assign(
                b.stage_x().row(0),
                b.xxx().block(0, 0, d.nx12(), 1).transposed(),
            ));
        }
        block.add_function_call(
            rhs.name(),
            vec!["rk_xxx".to_string(), offset_arg("rk_kkk", 0)],
        );
        if ctx.forward {
            block.add_function_call(
                rhs.diffs_name(),
                vec!["rk_xxx".to_string(), "rk_diffsNew2".to_string()],
            );
        }
        block.add_arithmetic(ArithmeticStatement::assign(
            b.eta_x2(),
            b.kkk().row(0).transposed(),
        ));
        Ok(())
    }
}
