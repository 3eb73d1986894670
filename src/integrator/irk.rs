//! Implicit Runge-Kutta stage algebra.

use nalgebra::DMatrix;

use crate::error::CodegenError;
use crate::export::{
    ArithmeticStatement, Function, FunctionArg, Operator, StatementBlock, Variable,
};

use super::{
    emit_stage_state, offset_arg, zero_fill_loop, Buffers, ButcherTableau, Config, Dims,
    SchemeGenerator, StepCtx,
};

/// Newton iterations unrolled per step.
const NEWTON_ITERATIONS: usize = 3;

/// Code generator for implicit Runge-Kutta schemes, including the
/// diagonally implicit ones.
///
/// Each step runs a fixed number of unrolled simplified-Newton iterations
/// on the stage system. The Newton matrix is assembled and factorized once
/// per step; later iterations and the sensitivity solves reuse the
/// factorization through the exported `_reuse` solver.
pub struct IrkScheme {
    tableau: ButcherTableau,
}

impl IrkScheme {
    pub fn new(tableau: ButcherTableau) -> Self {
        Self { tableau }
    }

    /// Emit the stage states of every stage and, when the output partition
    /// consumes them, copy each into its `rk_stageX` row.
    fn emit_all_stage_states(&self, ctx: &StepCtx, block: &mut StatementBlock) {
        let d = &ctx.dims;
        let b = ctx.bufs;
        for i in 0..self.tableau.num_stages() {
            emit_stage_state(ctx, &self.tableau, i, block);
            if d.nx3 > 0 && d.nx12() > 0 {
                block.add_arithmetic(ArithmeticStatement::assign(
                    b.stage_x().row(i),
                    b.xxx().block(0, 0, d.nx12(), 1).transposed(),
                ));
            }
        }
    }

    /// One Newton iteration: stage states, residual, solve, increment.
    fn emit_newton_iteration(
        &self,
        ctx: &StepCtx,
        cfg: &Config,
        first: bool,
        block: &mut StatementBlock,
    ) -> Result<(), CodegenError> {
        let d = &ctx.dims;
        let b = ctx.bufs;
        let s = self.tableau.num_stages();
        let rhs = cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
        for i in 0..s {
            emit_stage_state(ctx, &self.tableau, i, block);
            block.add_function_call(
                rhs.name(),
                vec![
                    "rk_xxx".to_string(),
                    offset_arg("rk_rhsTemp2", i * d.nx2),
                ],
            );
            if first {
                block.add_function_call(
                    rhs.diffs_name(),
                    vec![
                        "rk_xxx".to_string(),
                        offset_arg("rk_diffsTemp2", i * d.nx2 * d.nvars2),
                    ],
                );
            }
        }
        if first {
            self.emit_newton_matrix(ctx, block);
        }
        for i in 0..s {
            block.add_arithmetic(ArithmeticStatement::elementwise(
                b.lin_b().block(i * d.nx2, 0, d.nx2, 1),
                Operator::Assign,
                b.rhs_temp2().row(i).transposed(),
                Operator::Subtract,
                b.kkk().row(i).transposed(),
            ));
        }
        let solver = if first {
            b.solver_name()
        } else {
            format!("{}_reuse", b.solver_name())
        };
        block.add_function_call(
            solver,
            vec!["rk_A".to_string(), "rk_b".to_string(), b.perm_name()],
        );
        block.add_arithmetic(ArithmeticStatement::add_assign(
            b.kkk_flat(),
            b.lin_b(),
        ));
        Ok(())
    }

    /// Assemble the nonzero blocks of `I - h * (A (x) J)` into `rk_A`.
    /// The zero blocks were filled once in the prologue and never touched.
    fn emit_newton_matrix(&self, ctx: &StepCtx, block: &mut StatementBlock) {
        let d = &ctx.dims;
        let b = ctx.bufs;
        let s = self.tableau.num_stages();
        for i in 0..s {
            for j in 0..s {
                let aij = self.tableau.a(i, j);
                if aij == 0.0 {
                    continue;
                }
                let blk = b.lin_a().block(i * d.nx2, j * d.nx2, d.nx2, d.nx2);
                block.add_arithmetic(ArithmeticStatement::product(
                    blk,
                    Operator::Assign,
                    Variable::literal(-ctx.h * aij),
                    b.diffs_temp2_stage(i).block(0, d.nx1, d.nx2, d.nx2),
                ));
            }
            block.add_arithmetic(ArithmeticStatement::add_assign(
                b.lin_a().block(i * d.nx2, i * d.nx2, d.nx2, d.nx2),
                Variable::identity(d.nx2, d.nx2),
            ));
        }
    }

    /// Column `c` of the derivative of the stage-`i` input state with
    /// respect to the step-start variables, at fixed stage derivatives.
    fn stage_input_seed_column(&self, ctx: &StepCtx, stage: usize, c: usize) -> Variable {
        let d = &ctx.dims;
        let mut col = DMatrix::zeros(d.nvars2, 1);
        if c < d.nx1 {
            if let Some(map) = ctx.input {
                for r in 0..d.nx1 {
                    col[(r, 0)] = map.stage_phi[stage][(r, c)];
                }
            }
        } else if c < d.nx1 + d.nx2 {
            col[(c, 0)] = 1.0;
        } else {
            let uc = c - d.nx1 - d.nx2;
            if let Some(map) = ctx.input {
                for r in 0..d.nx1 {
                    col[(r, 0)] = map.stage_gamma[stage][(r, uc)];
                }
            }
            col[(c, 0)] = 1.0;
        }
        Variable::constant("dseed", &col)
    }
}

impl SchemeGenerator for IrkScheme {
    fn name(&self) -> &'static str {
        "implicit Runge-Kutta"
    }

    fn num_stages(&self) -> usize {
        self.tableau.num_stages()
    }

    fn tableau(&self) -> Option<&ButcherTableau> {
        Some(&self.tableau)
    }

    fn check(&self, cfg: &Config, dims: &Dims) -> Result<(), CodegenError> {
        for i in 0..self.tableau.num_stages() {
            if self.tableau.a(i, i) == 0.0 {
                return Err(CodegenError::UnsupportedConfiguration(
                    "the tableau diagonal has a zero entry".into(),
                ));
            }
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

    fn extra_declarations(&self, bufs: &Buffers) -> Vec<Variable> {
        vec![bufs.rhs_temp2(), bufs.lin_a(), bufs.lin_b()]
    }

    fn extra_int_declarations(&self, bufs: &Buffers) -> Vec<(String, usize)> {
        vec![(bufs.perm_name(), bufs.stages * bufs.dims.nx2)]
    }

    fn extra_externals(&self, bufs: &Buffers) -> Vec<Function> {
        let args = || {
            vec![
                FunctionArg::output("A"),
                FunctionArg::output("b"),
                FunctionArg::int_output("perm"),
            ]
        };
        vec![
            Function::new(bufs.solver_name(), args()),
            Function::new(format!("{}_reuse", bufs.solver_name()), args()),
        ]
    }

    /// Warm-started stage derivatives and a zeroed Newton matrix; the
    /// assembly only ever writes the nonzero tableau blocks.
    fn prologue(&self, ctx: &StepCtx, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let d = &ctx.dims;
        let s = self.tableau.num_stages();
        block.add_statement(zero_fill_loop("rk_kkk", 0, s * d.nx2));
        block.add_statement(zero_fill_loop("rk_A", 0, (s * d.nx2) * (s * d.nx2)));
        Ok(())
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
            if d.nx3 > 0 {
                self.emit_all_stage_states(ctx, block);
            }
            return Ok(());
        }
        for iter in 0..NEWTON_ITERATIONS {
            self.emit_newton_iteration(ctx, cfg, iter == 0, block)?;
        }
        if d.nx3 > 0 {
            self.emit_all_stage_states(ctx, block);
        }
        if ctx.forward {
            let rhs = cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
            let s = self.tableau.num_stages();
            // Jacobians and Newton matrix at the converged stage values
            for i in 0..s {
                emit_stage_state(ctx, &self.tableau, i, block);
                block.add_function_call(
                    rhs.diffs_name(),
                    vec![
                        "rk_xxx".to_string(),
                        offset_arg("rk_diffsTemp2", i * d.nx2 * d.nvars2),
                    ],
                );
            }
            self.emit_newton_matrix(ctx, block);
            for c in 0..d.nvars2 {
                for i in 0..s {
                    block.add_arithmetic(ArithmeticStatement::product(
                        b.lin_b().block(i * d.nx2, 0, d.nx2, 1),
                        Operator::Assign,
                        b.diffs_temp2_stage(i),
                        self.stage_input_seed_column(ctx, i, c),
                    ));
                }
                let solver = if c == 0 {
                    b.solver_name()
                } else {
                    format!("{}_reuse", b.solver_name())
                };
                block.add_function_call(
                    solver,
                    vec!["rk_A".to_string(), "rk_b".to_string(), b.perm_name()],
                );
                for i in 0..s {
                    block.add_arithmetic(ArithmeticStatement::assign(
                        b.diff_k_stage(i).block(0, c, d.nx2, 1),
                        b.lin_b().block(i * d.nx2, 0, d.nx2, 1),
                    ));
                }
            }
        }
        super::emit_implicit_update_tail(ctx, &self.tableau, block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportOptions, StatementBlock};
    use crate::model::ModelRhs;

    fn dims(nx2: usize) -> Dims {
        Dims {
            nx1: 0,
            nx2,
            nx3: 0,
            nx: nx2,
            nu: 0,
            nvars: nx2,
            nvars2: nx2,
        }
    }

    fn external_cfg() -> Config {
        let mut cfg = Config::default();
        cfg.rhs = Some(ModelRhs::External {
            name: "ode_rhs".into(),
            diffs_name: "ode_diffs".into(),
        });
        cfg
    }

    #[test]
    fn rejects_zero_diagonal_tableau() {
        let scheme = IrkScheme::new(ButcherTableau::erk4());
        assert!(matches!(
            scheme.check(&external_cfg(), &dims(1)),
            Err(CodegenError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn first_iteration_factorizes_later_ones_reuse() {
        let scheme = IrkScheme::new(ButcherTableau::gauss_legendre(4).unwrap());
        let bufs = Buffers::new(dims(1), 2, false);
        let ctx = StepCtx {
            dims: bufs.dims,
            bufs: &bufs,
            h: 0.1,
            input: None,
            output: None,
            forward: false,
        };
        let cfg = external_cfg();
        let mut block = StatementBlock::new();
        scheme.update_implicit_system(&ctx, &cfg, &mut block).unwrap();
        let code = block.render_code(&ExportOptions::default()).unwrap();
        assert_eq!(code.matches("acado_solve_dim2_system(").count(), 1);
        assert_eq!(code.matches("acado_solve_dim2_system_reuse(").count(), 2);
        assert_eq!(code.matches("ode_diffs(").count(), 2);
    }

    #[test]
    fn newton_matrix_diagonal_gets_the_identity() {
        let scheme = IrkScheme::new(ButcherTableau::radau_iia(1).unwrap());
        let bufs = Buffers::new(dims(2), 1, false);
        let ctx = StepCtx {
            dims: bufs.dims,
            bufs: &bufs,
            h: 0.5,
            input: None,
            output: None,
            forward: false,
        };
        let mut block = StatementBlock::new();
        scheme.emit_newton_matrix(&ctx, &mut block);
        let code = block.render_code(&ExportOptions::default()).unwrap();
        assert!(code.contains("rk_A[0] += "));
        assert!(code.contains("rk_A[3] += "));
        assert!(!code.contains("rk_A[1] += "));
    }

    #[test]
    fn solver_externals_carry_the_system_dimension() {
        let scheme = IrkScheme::new(ButcherTableau::gauss_legendre(6).unwrap());
        let bufs = Buffers::new(dims(3), 3, true);
        let externals = scheme.extra_externals(&bufs);
        assert_eq!(externals.len(), 2);
        assert_eq!(externals[0].name(), "acado_solve_dim9_system");
        assert_eq!(externals[1].name(), "acado_solve_dim9_system_reuse");
        assert_eq!(
            scheme.extra_int_declarations(&bufs),
            vec![("rk_dim9_perm".to_string(), 9)]
        );
    }
}
