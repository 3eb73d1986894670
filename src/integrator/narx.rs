//! NARX model export.

use nalgebra::DMatrix;

use crate::error::CodegenError;
use crate::export::{
    ArithmeticStatement, Function, FunctionArg, Operator, StatementBlock, Variable,
};

use super::{ButcherTableau, Config, Dims, SchemeGenerator, StepCtx};

/// Code generator for a NARX (nonlinear autoregressive) model.
///
/// The state stacks `delay` lagged samples of the modelled signal; one step
/// evaluates the map on the newest samples and shifts the lags. With a
/// polynomial model attached, the map and its Jacobian are generated in
/// closed form; with a named model the generated code calls the external
/// routines on the full state instead.
pub struct NarxScheme {
    order: usize,
}

impl NarxScheme {
    pub fn new(order: usize) -> Self {
        Self { order }
    }
}

/// All monomial exponent multisets over `nvars` variables with degree
/// between one and `order`, as non-decreasing index lists in a fixed
/// deterministic order.
pub(crate) fn monomials(nvars: usize, order: usize) -> Vec<Vec<usize>> {
    fn extend(nvars: usize, left: usize, prefix: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if left == 0 {
            out.push(prefix.clone());
            return;
        }
        let start = prefix.last().copied().unwrap_or(0);
        for v in start..nvars {
            prefix.push(v);
            extend(nvars, left - 1, prefix, out);
            prefix.pop();
        }
    }
    let mut out = Vec::new();
    for degree in 1..=order {
        extend(nvars, degree, &mut Vec::new(), &mut out);
    }
    out
}

/// Write the first `count` monomial products into the scratch buffer, one
/// line per product. The products carry no coefficients, those stay in the
/// constant matrices until emission.
fn emit_monomials(body: &mut StatementBlock, terms: &[Vec<usize>], count: usize) {
    for (m, vars) in terms.iter().take(count).enumerate() {
        let product = vars
            .iter()
            .map(|v| format!("in[{}]", v))
            .collect::<Vec<_>>()
            .join("*");
        body.add_raw(format!("narx_mem[{}] = {};", m, product));
    }
}

impl SchemeGenerator for NarxScheme {
    fn name(&self) -> &'static str {
        "polynomial NARX"
    }

    fn num_stages(&self) -> usize {
        0
    }

    fn tableau(&self) -> Option<&ButcherTableau> {
        None
    }

    fn check(&self, cfg: &Config, dims: &Dims) -> Result<(), CodegenError> {
        if dims.nx1 > 0 || dims.nx3 > 0 {
            return Err(CodegenError::UnsupportedConfiguration(
                "a NARX model admits no linear partitions".into(),
            ));
        }
        if dims.nu != 0 {
            return Err(CodegenError::UnsupportedConfiguration(
                "control inputs are not part of the NARX map".into(),
            ));
        }
        let Some(model) = &cfg.narx else {
            // externally compiled map over the full state
            cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
            return Ok(());
        };
        let expected = monomials(dims.nx, self.order).len();
        if model.coefficients.ncols() != expected {
            return Err(CodegenError::InconsistentPartitionDimensions {
                partition: "NARX",
                expected: format!(
                    "{} monomial coefficients per component for order {}",
                    expected, self.order
                ),
                got: format!("{}", model.coefficients.ncols()),
            });
        }
        Ok(())
    }

    fn rhs_names(&self, cfg: &Config) -> Result<(String, String), CodegenError> {
        if cfg.narx.is_some() {
            return Ok(("acado_narx_rhs".to_string(), "acado_narx_diffs".to_string()));
        }
        let rhs = cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
        Ok((rhs.name().to_string(), rhs.diffs_name().to_string()))
    }

    fn generated_functions(
        &self,
        cfg: &Config,
        dims: &Dims,
    ) -> Result<Vec<Function>, CodegenError> {
        let Some(model) = &cfg.narx else {
            return Ok(Vec::new());
        };
        let n = model.coefficients.nrows();
        let terms = monomials(dims.nx, self.order);
        let lower = if self.order > 1 {
            monomials(dims.nx, self.order - 1).len()
        } else {
            0
        };
        let io = vec![FunctionArg::input("in"), FunctionArg::output("out")];
        let zero = DMatrix::zeros(1, 1);

        // map: out = parms * m(x), with the monomial vector m staged in a
        // local scratch so the coefficients render at emission precision
        let mut rhs = Function::new("acado_narx_rhs", io.clone());
        let out = Variable::vector("out", n);
        if !terms.is_empty() {
            let mem = Variable::vector("narx_mem", terms.len());
            rhs.add_local(mem.clone());
            emit_monomials(rhs.body_mut(), &terms, terms.len());
            rhs.body_mut().add_arithmetic(ArithmeticStatement::product(
                out.clone(),
                Operator::Assign,
                Variable::constant("narx_parms", &model.coefficients),
                mem,
            ));
        }
        for i in 0..n {
            if model.coefficients.row(i).iter().all(|&c| c == 0.0) {
                rhs.body_mut().add_arithmetic(ArithmeticStatement::assign(
                    out.element(i, 0),
                    Variable::dense_constant("narx_zero", &zero),
                ));
            }
        }

        // Jacobian by the power rule: for each variable the multiplicities
        // fold into one constant matrix over the lower-degree monomials plus
        // a constant column from the linear terms
        let mut diffs = Function::new("acado_narx_diffs", io);
        let dout = Variable::new("out", n, dims.nx);
        let dmem = Variable::vector("narx_mem", lower);
        if lower > 0 {
            diffs.add_local(dmem.clone());
            emit_monomials(diffs.body_mut(), &terms, lower);
        }
        for v in 0..dims.nx {
            let mut cmat = DMatrix::zeros(n, lower);
            let mut cvec = DMatrix::zeros(n, 1);
            for (m, vars) in terms.iter().enumerate() {
                let mult = vars.iter().filter(|&&w| w == v).count();
                if mult == 0 {
                    continue;
                }
                let mut rest = vars.clone();
                if let Some(pos) = rest.iter().position(|&w| w == v) {
                    rest.remove(pos);
                }
                for i in 0..n {
                    let c = model.coefficients[(i, m)];
                    if c == 0.0 {
                        continue;
                    }
                    if rest.is_empty() {
                        cvec[(i, 0)] += c * mult as f64;
                    } else if let Some(idx) = terms.iter().position(|t| *t == rest) {
                        cmat[(i, idx)] += c * mult as f64;
                    }
                }
            }
            let col = dout.col(v);
            diffs
                .body_mut()
                .add_arithmetic(ArithmeticStatement::multiply_add(
                    col.clone(),
                    Operator::Assign,
                    Variable::constant("narx_dparms", &cmat),
                    dmem.clone(),
                    Operator::Add,
                    Variable::constant("narx_dconst", &cvec),
                ));
            for i in 0..n {
                if cvec[(i, 0)] == 0.0 && cmat.row(i).iter().all(|&c| c == 0.0) {
                    diffs.body_mut().add_arithmetic(ArithmeticStatement::assign(
                        col.element(i, 0),
                        Variable::dense_constant("narx_zero", &zero),
                    ));
                }
            }
        }
        Ok(vec![rhs, diffs])
    }

    fn update_implicit_system(
        &self,
        ctx: &StepCtx,
        cfg: &Config,
        block: &mut StatementBlock,
    ) -> Result<(), CodegenError> {
        let d = &ctx.dims;
        let b = ctx.bufs;
        let dn = d.nx;
        // external maps produce the full next state, no lag shift remains
        let n = match &cfg.narx {
            Some(model) => model.coefficients.nrows(),
            None => dn,
        };
        let (rhs_name, diffs_name) = self.rhs_names(cfg)?;
        // snapshot the lags, the state rows are overwritten below
        block.add_arithmetic(ArithmeticStatement::assign(
            b.xxx().block(0, 0, dn, 1),
            b.eta_x(),
        ));
        block.add_function_call(rhs_name, vec!["rk_xxx".to_string(), "rk_kkk".to_string()]);
        if ctx.forward {
            block.add_function_call(
                diffs_name,
                vec!["rk_xxx".to_string(), "rk_diffsNew2".to_string()],
            );
            if dn > n {
                // lag shift rows: an identity landing one block lower
                let mut shift = DMatrix::zeros(dn - n, dn);
                for r in 0..dn - n {
                    shift[(r, r)] = 1.0;
                }
                block.add_arithmetic(ArithmeticStatement::assign(
                    b.diffs_new2().block(n, 0, dn - n, dn),
                    Variable::dense_constant("shift", &shift),
                ));
            }
        }
        block.add_arithmetic(ArithmeticStatement::assign(
            b.eta_x().block(0, 0, n, 1),
            b.kkk().block(0, 0, 1, n).transposed(),
        ));
        if dn > n {
            block.add_arithmetic(ArithmeticStatement::assign(
                b.eta_x().block(n, 0, dn - n, 1),
                b.xxx().block(0, 0, dn - n, 1),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ExportOptions;
    use crate::integrator::{Buffers, NarxModel};
    use nalgebra::dmatrix;

    #[test]
    fn monomial_census_two_variables_order_two() {
        // x0, x1, x0^2, x0*x1, x1^2
        let m = monomials(2, 2);
        assert_eq!(m.len(), 5);
        assert_eq!(m[0], vec![0]);
        assert_eq!(m[1], vec![1]);
        assert_eq!(m[2], vec![0, 0]);
        assert_eq!(m[3], vec![0, 1]);
        assert_eq!(m[4], vec![1, 1]);
    }

    #[test]
    fn monomial_count_grows_with_order() {
        assert_eq!(monomials(3, 1).len(), 3);
        assert_eq!(monomials(3, 2).len(), 9);
        assert_eq!(monomials(1, 4).len(), 4);
    }

    #[test]
    fn generated_rhs_stages_monomials_and_skips_zero_coefficients() {
        let scheme = NarxScheme::new(2);
        let mut cfg = Config::default();
        cfg.narx = Some(NarxModel {
            delay: 2,
            coefficients: dmatrix![
                0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0;
                0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0
            ],
        });
        let dims = Dims {
            nx1: 0,
            nx2: 4,
            nx3: 0,
            nx: 4,
            nu: 0,
            nvars: 4,
            nvars2: 4,
        };
        scheme.check(&cfg, &dims).unwrap();
        let funcs = scheme.generated_functions(&cfg, &dims).unwrap();
        assert_eq!(funcs.len(), 2);
        let mut code = String::new();
        funcs[0]
            .export_code(&mut code, &ExportOptions::default())
            .unwrap();
        assert!(code.contains("real_t narx_mem[14];"));
        assert!(code.contains("narx_mem[0] = in[0];"));
        assert!(code.contains("narx_mem[4] = in[0]*in[0];"));
        assert!(code.contains("out[0] = 5.000000000000000e-1*narx_mem[0];"));
        assert!(code.contains("out[1] = narx_mem[4];"));
    }

    #[test]
    fn jacobian_applies_the_power_rule() {
        let scheme = NarxScheme::new(2);
        let mut cfg = Config::default();
        // single signal, delay one: monomials x0, x0^2
        cfg.narx = Some(NarxModel {
            delay: 1,
            coefficients: dmatrix![2.0, 3.0],
        });
        let dims = Dims {
            nx1: 0,
            nx2: 1,
            nx3: 0,
            nx: 1,
            nu: 0,
            nvars: 1,
            nvars2: 1,
        };
        let funcs = scheme.generated_functions(&cfg, &dims).unwrap();
        let mut code = String::new();
        funcs[1]
            .export_code(&mut code, &ExportOptions::default())
            .unwrap();
        // d/dx (2x + 3x^2) = 6x + 2
        assert!(code.contains("narx_mem[0] = in[0];"));
        assert!(code.contains(
            "out[0] = 6.000000000000000e0*narx_mem[0] + 2.000000000000000e0;"
        ));
    }

    #[test]
    fn generated_constants_follow_the_requested_precision() {
        let scheme = NarxScheme::new(1);
        let mut cfg = Config::default();
        cfg.narx = Some(NarxModel {
            delay: 1,
            coefficients: dmatrix![0.9],
        });
        let dims = Dims {
            nx1: 0,
            nx2: 1,
            nx3: 0,
            nx: 1,
            nu: 0,
            nvars: 1,
            nvars2: 1,
        };
        let funcs = scheme.generated_functions(&cfg, &dims).unwrap();
        let options = ExportOptions {
            precision: 3,
            ..ExportOptions::default()
        };
        let mut code = String::new();
        funcs[0].export_code(&mut code, &options).unwrap();
        assert!(code.contains("out[0] = 9.00e-1*narx_mem[0];"));
        assert!(!code.contains("9.000000000000000e-1"));
    }

    #[test]
    fn zero_jacobian_rows_are_still_written() {
        let scheme = NarxScheme::new(1);
        let mut cfg = Config::default();
        // second component never feeds back
        cfg.narx = Some(NarxModel {
            delay: 1,
            coefficients: dmatrix![1.0, 0.0; 0.0, 0.0],
        });
        let dims = Dims {
            nx1: 0,
            nx2: 2,
            nx3: 0,
            nx: 2,
            nu: 0,
            nvars: 2,
            nvars2: 2,
        };
        let funcs = scheme.generated_functions(&cfg, &dims).unwrap();
        let mut code = String::new();
        funcs[0]
            .export_code(&mut code, &ExportOptions::default())
            .unwrap();
        assert!(code.contains("out[1] = 0.000000000000000e0;"));
        let mut jac = String::new();
        funcs[1]
            .export_code(&mut jac, &ExportOptions::default())
            .unwrap();
        assert!(jac.contains("out[2] = 0.000000000000000e0;"));
        assert!(jac.contains("out[3] = 0.000000000000000e0;"));
    }

    #[test]
    fn external_model_runs_on_the_full_state() {
        let scheme = NarxScheme::new(3);
        let mut cfg = Config::default();
        cfg.rhs = Some(crate::model::ModelRhs::External {
            name: "narx_f".to_string(),
            diffs_name: "narx_df".to_string(),
        });
        let dims = Dims {
            nx1: 0,
            nx2: 2,
            nx3: 0,
            nx: 2,
            nu: 0,
            nvars: 2,
            nvars2: 2,
        };
        scheme.check(&cfg, &dims).unwrap();
        assert!(scheme.generated_functions(&cfg, &dims).unwrap().is_empty());
        let bufs = Buffers::new(dims, 0, true);
        let ctx = StepCtx {
            dims,
            bufs: &bufs,
            h: 1.0,
            input: None,
            output: None,
            forward: true,
        };
        let mut block = StatementBlock::new();
        scheme.update_implicit_system(&ctx, &cfg, &mut block).unwrap();
        let code = block.render_code(&ExportOptions::default()).unwrap();
        assert!(code.contains("narx_f( rk_xxx, rk_kkk );"));
        assert!(code.contains("narx_df( rk_xxx, rk_diffsNew2 );"));
        // the map covers the full state, nothing shifts
        assert!(code.contains("rk_eta[0] = rk_kkk[0];"));
        assert!(code.contains("rk_eta[1] = rk_kkk[1];"));
        assert!(!code.contains("rk_eta[1] = rk_xxx[0];"));
    }

    #[test]
    fn update_shifts_the_lagged_samples() {
        let scheme = NarxScheme::new(1);
        let mut cfg = Config::default();
        cfg.narx = Some(NarxModel {
            delay: 2,
            coefficients: dmatrix![1.0, 0.0; 0.0, 1.0],
        });
        let dims = Dims {
            nx1: 0,
            nx2: 4,
            nx3: 0,
            nx: 4,
            nu: 0,
            nvars: 4,
            nvars2: 4,
        };
        let bufs = Buffers::new(dims, 0, false);
        let ctx = StepCtx {
            dims,
            bufs: &bufs,
            h: 1.0,
            input: None,
            output: None,
            forward: false,
        };
        let mut block = StatementBlock::new();
        scheme.update_implicit_system(&ctx, &cfg, &mut block).unwrap();
        let code = block.render_code(&ExportOptions::default()).unwrap();
        assert!(code.contains("rk_xxx[0] = rk_eta[0];"));
        assert!(code.contains("rk_eta[0] = rk_kkk[0];"));
        assert!(code.contains("rk_eta[2] = rk_xxx[0];"));
        assert!(code.contains("rk_eta[3] = rk_xxx[1];"));
    }
}
