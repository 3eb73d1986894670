//! Explicit Runge-Kutta stage algebra.

use crate::error::CodegenError;
use crate::export::{ArithmeticStatement, Operator, StatementBlock};

use super::{
    emit_implicit_update_tail, emit_stage_sensitivity, emit_stage_state, input_stage_seed,
    offset_arg, ButcherTableau, Config, Dims, SchemeGenerator, StepCtx,
};

/// Code generator for explicit Runge-Kutta schemes.
///
/// The stage loop is fully unrolled: each stage evaluates the right-hand
/// side at a state assembled from constant tableau rows, and with forward
/// sensitivities enabled chains the Jacobian through the stage-state
/// sensitivities into `rk_diffK`.
pub struct ErkScheme {
    tableau: ButcherTableau,
}

impl ErkScheme {
    pub fn new(tableau: ButcherTableau) -> Self {
        Self { tableau }
    }
}

impl SchemeGenerator for ErkScheme {
    fn name(&self) -> &'static str {
        "explicit Runge-Kutta"
    }

    fn num_stages(&self) -> usize {
        self.tableau.num_stages()
    }

    fn tableau(&self) -> Option<&ButcherTableau> {
        Some(&self.tableau)
    }

    fn check(&self, cfg: &Config, dims: &Dims) -> Result<(), CodegenError> {
        if !self.tableau.is_explicit() {
            return Err(CodegenError::UnsupportedConfiguration(
                "the tableau is not lower triangular".into(),
            ));
        }
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
        if d.nx2 == 0 {
            // only the stage states are needed, for the output partition
            if d.nx3 > 0 {
                for i in 0..self.tableau.num_stages() {
                    emit_stage_state(ctx, &self.tableau, i, block);
                    if d.nx12() > 0 {
                        block.add_arithmetic(ArithmeticStatement::assign(
                            b.stage_x().row(i),
                            b.xxx().block(0, 0, d.nx12(), 1).transposed(),
                        ));
                    }
                }
            }
            return Ok(());
        }
        let rhs = cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
        let (rhs_name, diffs_name) = (rhs.name(), rhs.diffs_name());
        for i in 0..self.tableau.num_stages() {
            emit_stage_state(ctx, &self.tableau, i, block);
            if d.nx3 > 0 && d.nx12() > 0 {
                block.add_arithmetic(ArithmeticStatement::assign(
                    b.stage_x().row(i),
                    b.xxx().block(0, 0, d.nx12(), 1).transposed(),
                ));
            }
            block.add_function_call(
                rhs_name,
                vec![
                    "rk_xxx".to_string(),
                    offset_arg("rk_kkk", i * d.nx2),
                ],
            );
            if ctx.forward {
                block.add_function_call(
                    diffs_name,
                    vec![
                        "rk_xxx".to_string(),
                        offset_arg("rk_diffsTemp2", i * d.nx2 * d.nvars2),
                    ],
                );
                let jac = b.diffs_temp2_stage(i);
                let stage_sens = emit_stage_sensitivity(ctx, &self.tableau, i, block);
                let dk = b.diff_k_stage(i);
                // dK_i/d(x,u) through the linear-input stage map, the
                // implicit stage sensitivities, and the direct controls
                let mut assigned = false;
                if d.nx1 > 0 {
                    if let Some(map) = ctx.input {
                        block.add_arithmetic(ArithmeticStatement::product(
                            dk.clone(),
                            Operator::Assign,
                            jac.block(0, 0, d.nx2, d.nx1),
                            input_stage_seed(map, i, d),
                        ));
                        assigned = true;
                    }
                }
                block.add_arithmetic(ArithmeticStatement::product(
                    dk.clone(),
                    if assigned {
                        Operator::AddAssign
                    } else {
                        Operator::Assign
                    },
                    jac.block(0, d.nx1, d.nx2, d.nx2),
                    stage_sens,
                ));
                if d.nu > 0 {
                    block.add_arithmetic(ArithmeticStatement::add_assign(
                        dk.block(0, d.nx1 + d.nx2, d.nx2, d.nu),
                        jac.block(0, d.nx1 + d.nx2, d.nx2, d.nu),
                    ));
                }
            }
        }
        emit_implicit_update_tail(ctx, &self.tableau, block);
        Ok(())
    }
}
