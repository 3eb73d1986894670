//! Integrator code export.
//!
//! An [IntegratorExport] is configured with a model, an integration grid and
//! optional linear partitions, then materializes two exported routines via
//! [IntegratorExport::setup]: `acado_full_rhs` (the assembled state
//! derivative) and `acado_integrate` (the loop-unrolled one-interval
//! simulation with forward sensitivities). Emission entry points append
//! statement nodes to caller-supplied blocks and never mutate the export.
//!
//! The state space is partitioned into a linear-input subsystem (`NX1`,
//! matrices `M1/A1/B1`), a nonlinear core (`NX2`) and a linear-output
//! subsystem (`NX3`, matrices `M3/A3` plus a coupling term). Every step of
//! the generated code advances the partitions in the fixed order
//! input, implicit, output, and within each partition the state update is
//! emitted strictly before the sensitivity propagation that reads it.

pub mod discrete;
pub mod erk;
pub mod irk;
pub mod narx;
pub mod registry;
pub mod tableau;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::CodegenError;
use crate::export::{
    ArithmeticStatement, Function, FunctionArg, Index, Operator, Statement, StatementBlock,
    Variable,
};
use crate::model::{Grid, ModelRhs, Output, OutputRhs, SymbolicFunction};

pub use discrete::DiscreteScheme;
pub use erk::ErkScheme;
pub use irk::IrkScheme;
pub use narx::NarxScheme;
pub use registry::IntegratorRegistry;
pub use tableau::ButcherTableau;

/// Tags of the integrator schemes resolvable through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegratorKind {
    ExplicitEuler,
    ExplicitRungeKutta2,
    ExplicitRungeKutta3,
    ExplicitRungeKutta4,
    GaussLegendre2,
    GaussLegendre4,
    GaussLegendre6,
    GaussLegendre8,
    RadauIIA1,
    RadauIIA3,
    RadauIIA5,
    DiagonallyImplicitRk3,
    DiagonallyImplicitRk4,
    DiagonallyImplicitRk5,
    DiscreteTime,
    Narx,
}

/// Which derivative information the generated integrator carries along.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensitivityMode {
    /// Primal simulation only
    None,
    /// First-order forward sensitivities with respect to states and controls
    #[default]
    Forward,
    /// Adjoint sensitivities (not generated by any scheme in this crate)
    Backward,
    /// Forward-over-backward second-order sensitivities (not generated)
    ForwardOverBackward,
}

/// The linear-input partition `M1 * dx1 = A1 * x1 + B1 * u`.
#[derive(Debug, Clone)]
pub(crate) struct LinearInput {
    pub m: DMatrix<f64>,
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
}

/// The linear-output partition `M3 * dx3 = A3 * x3 + f3(x1, x2, u)`.
#[derive(Debug, Clone)]
pub(crate) struct LinearOutput {
    pub m: DMatrix<f64>,
    pub a: DMatrix<f64>,
    pub rhs: ModelRhs,
}

/// Coefficients of a polynomial NARX model.
#[derive(Debug, Clone)]
pub(crate) struct NarxModel {
    pub delay: usize,
    pub coefficients: DMatrix<f64>,
}

/// Accumulated configuration of an export, mutable until `setup()`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Config {
    pub nx: Option<usize>,
    pub nu: usize,
    pub rhs: Option<ModelRhs>,
    pub input: Option<LinearInput>,
    pub output: Option<LinearOutput>,
    pub narx: Option<NarxModel>,
    pub grid: Option<Grid>,
    pub num_steps: Vec<usize>,
    pub sensitivity: SensitivityMode,
    pub outputs: Vec<Output>,
}

/// Partition sizes resolved at setup time.
///
/// `nvars` is the column count of the shared sensitivity matrix (states plus
/// controls); `nvars2` the column count of the implicit-core Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub nx1: usize,
    pub nx2: usize,
    pub nx3: usize,
    pub nx: usize,
    pub nu: usize,
    pub nvars: usize,
    pub nvars2: usize,
}

impl Dims {
    fn nx12(&self) -> usize {
        self.nx1 + self.nx2
    }
}

/// Descriptors of the global buffers of the generated code.
///
/// All descriptors address fixed global arrays; views created here share the
/// backing buffers of the declared variables.
#[derive(Debug, Clone)]
pub(crate) struct Buffers {
    pub dims: Dims,
    pub stages: usize,
    pub forward: bool,
    /// Length of the right-hand-side input buffer `rk_xxx`
    pub xlen: usize,
}

impl Buffers {
    fn new(dims: Dims, stages: usize, forward: bool) -> Self {
        Self {
            dims,
            stages: stages.max(1),
            forward,
            xlen: dims.nx12() + dims.nu,
        }
    }

    pub fn eta_len(&self) -> usize {
        let d = &self.dims;
        let sens = if self.forward { d.nx * d.nvars } else { 0 };
        d.nx + d.nu + sens
    }

    pub fn eta(&self) -> Variable {
        Variable::new("rk_eta", 1, self.eta_len())
    }

    /// The full state as a column view.
    pub fn eta_x(&self) -> Variable {
        self.eta().block(0, 0, 1, self.dims.nx).transposed()
    }

    pub fn eta_x1(&self) -> Variable {
        self.eta().block(0, 0, 1, self.dims.nx1).transposed()
    }

    pub fn eta_x2(&self) -> Variable {
        self.eta()
            .block(0, self.dims.nx1, 1, self.dims.nx2)
            .transposed()
    }

    pub fn eta_x2_row(&self) -> Variable {
        self.eta().block(0, self.dims.nx1, 1, self.dims.nx2)
    }

    pub fn eta_x3(&self) -> Variable {
        self.eta()
            .block(0, self.dims.nx12(), 1, self.dims.nx3)
            .transposed()
    }

    pub fn eta_u(&self) -> Variable {
        self.eta().block(0, self.dims.nx, 1, self.dims.nu).transposed()
    }

    /// The shared sensitivity matrix, a 2D view into the tail of `rk_eta`.
    pub fn eta_sens(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_eta", d.nx, d.nvars)
            .indexed(Index::literal((d.nx + d.nu) as i64))
    }

    pub fn eta_sens_rows(&self, first: usize, count: usize) -> Variable {
        self.eta_sens().block(first, 0, count, self.dims.nvars)
    }

    /// Input buffer of the exported right-hand-side calls, `[x1 x2 u]`.
    pub fn xxx(&self) -> Variable {
        Variable::vector("rk_xxx", self.xlen)
    }

    /// Scratch copy of the state at the start of the step.
    pub fn xtmp(&self) -> Variable {
        Variable::vector("rk_xtmp", self.dims.nx)
    }

    /// Stage derivatives, one row per stage.
    pub fn kkk(&self) -> Variable {
        Variable::new("rk_kkk", self.stages, self.dims.nx2)
    }

    pub fn kkk_flat(&self) -> Variable {
        Variable::vector("rk_kkk", self.stages * self.dims.nx2)
    }

    /// Stage states of the implicit core, consumed by the output partition.
    pub fn stage_x(&self) -> Variable {
        Variable::new("rk_stageX", self.stages, self.dims.nx12())
    }

    /// Sensitivity of one stage state, recomputed per stage.
    pub fn stage_sens(&self) -> Variable {
        Variable::new("rk_stageSens", self.dims.nx2, self.dims.nvars2)
    }

    pub fn stage_sens_flat(&self) -> Variable {
        Variable::new("rk_stageSens", 1, self.dims.nx2 * self.dims.nvars2)
    }

    /// Stage derivative sensitivities, one row per stage.
    pub fn diff_k_flat(&self) -> Variable {
        Variable::new("rk_diffK", self.stages, self.dims.nx2 * self.dims.nvars2)
    }

    pub fn diff_k_stage(&self, stage: usize) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffK", self.stages * d.nx2, d.nvars2).block(
            stage * d.nx2,
            0,
            d.nx2,
            d.nvars2,
        )
    }

    /// Jacobian of the nonlinear right-hand side at one stage state.
    pub fn diffs_temp2_stage(&self, stage: usize) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsTemp2", self.stages * d.nx2, d.nvars2).block(
            stage * d.nx2,
            0,
            d.nx2,
            d.nvars2,
        )
    }

    /// Right-hand-side values at the stage states (implicit schemes).
    pub fn rhs_temp2(&self) -> Variable {
        Variable::new("rk_rhsTemp2", self.stages, self.dims.nx2)
    }

    /// Newton matrix of the implicit stage system.
    pub fn lin_a(&self) -> Variable {
        let n = self.stages * self.dims.nx2;
        Variable::new("rk_A", n, n)
    }

    /// Residual / solution vector of the implicit stage system.
    pub fn lin_b(&self) -> Variable {
        Variable::vector("rk_b", self.stages * self.dims.nx2)
    }

    pub fn perm_name(&self) -> String {
        format!("rk_dim{}_perm", self.stages * self.dims.nx2)
    }

    pub fn solver_name(&self) -> String {
        format!("acado_solve_dim{}_system", self.stages * self.dims.nx2)
    }

    pub fn diffs_new1(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsNew1", d.nx1, d.nx1 + d.nu)
    }

    pub fn diffs_prev1(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsPrev1", d.nx1, d.nvars)
    }

    pub fn diffs_new2(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsNew2", d.nx2, d.nvars2)
    }

    pub fn diffs_new2_flat(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsNew2", 1, d.nx2 * d.nvars2)
    }

    pub fn diffs_prev2(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsPrev2", d.nx12(), d.nvars)
    }

    pub fn diffs_new3(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsNew3", d.nx3, d.nvars)
    }

    pub fn diffs_prev3(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsPrev3", d.nx, d.nvars)
    }

    /// Coupling-term value at one stage state.
    pub fn rhs_temp3(&self) -> Variable {
        Variable::vector("rk_rhsTemp3", self.dims.nx3)
    }

    /// Accumulated weighted coupling values of the output partition.
    pub fn out3_acc(&self) -> Variable {
        Variable::vector("rk_out3Acc", self.dims.nx3)
    }

    /// Jacobian of the coupling term at one stage state.
    pub fn diffs_temp3(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_diffsTemp3", d.nx3, d.nx12() + d.nu)
    }

    /// Chained coupling-term sensitivity at one stage.
    pub fn aux3(&self) -> Variable {
        let d = &self.dims;
        Variable::new("rk_aux3", d.nx3, d.nvars2)
    }
}

/// The linear-input partition folded into one-step constants for a fixed
/// step size: `x1_new = phi * x1 + gamma * u`, with per-stage maps for the
/// stage states of the implicit core.
#[derive(Debug, Clone)]
pub(crate) struct InputMap {
    pub phi: DMatrix<f64>,
    pub gamma: DMatrix<f64>,
    pub stage_phi: Vec<DMatrix<f64>>,
    pub stage_gamma: Vec<DMatrix<f64>>,
}

/// The linear-output partition folded into one-step constants:
/// `x3_new = phi * x3 + sum_i weights[i] * f3(stage_i)`.
#[derive(Debug, Clone)]
pub(crate) struct OutputMap {
    pub phi: DMatrix<f64>,
    pub weights: Vec<DMatrix<f64>>,
}

/// Per-interval generation data: the inner step size and the folded linear
/// partition maps at that step size.
#[derive(Debug, Clone)]
pub(crate) struct IntervalMaps {
    pub h: f64,
    pub steps: usize,
    pub input: Option<InputMap>,
    pub output: Option<OutputMap>,
}

/// Everything a partition emitter needs about the current step.
pub(crate) struct StepCtx<'a> {
    pub dims: Dims,
    pub bufs: &'a Buffers,
    pub h: f64,
    pub input: Option<&'a InputMap>,
    pub output: Option<&'a OutputMap>,
    pub forward: bool,
}

/// The narrow capability interface one scheme family implements.
///
/// The base export drives the step protocol and the linear partitions; a
/// scheme only supplies the stage algebra of the implicit core plus its
/// extra workspace and external routines.
pub(crate) trait SchemeGenerator {
    fn name(&self) -> &'static str;

    /// Number of stages, zero for single-shot discrete maps.
    fn num_stages(&self) -> usize;

    /// The Butcher tableau driving the stage algebra, if any.
    fn tableau(&self) -> Option<&ButcherTableau>;

    /// Reject configurations this scheme cannot generate code for.
    fn check(&self, cfg: &Config, dims: &Dims) -> Result<(), CodegenError>;

    /// Names of the (rhs, diffs) routines the generated code calls for the
    /// nonlinear core.
    fn rhs_names(&self, cfg: &Config) -> Result<(String, String), CodegenError>;

    /// Routines the scheme generates itself rather than importing.
    fn generated_functions(
        &self,
        cfg: &Config,
        dims: &Dims,
    ) -> Result<Vec<Function>, CodegenError> {
        let _ = (cfg, dims);
        Ok(Vec::new())
    }

    /// Extra global real buffers of the scheme.
    fn extra_declarations(&self, bufs: &Buffers) -> Vec<Variable> {
        let _ = bufs;
        Vec::new()
    }

    /// Extra global integer buffers of the scheme, as (name, length).
    fn extra_int_declarations(&self, bufs: &Buffers) -> Vec<(String, usize)> {
        let _ = bufs;
        Vec::new()
    }

    /// Extra externally supplied routines (e.g. linear solvers).
    fn extra_externals(&self, bufs: &Buffers) -> Vec<Function> {
        let _ = bufs;
        Vec::new()
    }

    /// One-time statements at the top of the integrate routine.
    fn prologue(&self, ctx: &StepCtx, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let _ = (ctx, block);
        Ok(())
    }

    /// Stage algebra and state update of the nonlinear core for one step.
    fn update_implicit_system(
        &self,
        ctx: &StepCtx,
        cfg: &Config,
        block: &mut StatementBlock,
    ) -> Result<(), CodegenError>;

    /// Chain the core's local sensitivities into the shared buffer.
    fn propagate_implicit_system(
        &self,
        ctx: &StepCtx,
        block: &mut StatementBlock,
    ) -> Result<(), CodegenError> {
        let d = &ctx.dims;
        if d.nx2 == 0 || !ctx.forward {
            return Ok(());
        }
        emit_sensitivity_chain(
            block,
            ctx.bufs.eta_sens_rows(d.nx1, d.nx2),
            ctx.bufs.diffs_new2(),
            ctx.bufs.diffs_prev2(),
            d.nx12(),
            d,
        );
        Ok(())
    }
}

/// Closed set of scheme families.
pub(crate) enum Scheme {
    ExplicitRungeKutta(ErkScheme),
    ImplicitRungeKutta(IrkScheme),
    DiscreteTime(DiscreteScheme),
    Narx(NarxScheme),
}

impl Scheme {
    fn generator(&self) -> &dyn SchemeGenerator {
        match self {
            Scheme::ExplicitRungeKutta(s) => s,
            Scheme::ImplicitRungeKutta(s) => s,
            Scheme::DiscreteTime(s) => s,
            Scheme::Narx(s) => s,
        }
    }
}

/// Routine bodies and buffer layout materialized by `setup()`.
pub(crate) struct Workspace {
    pub bufs: Buffers,
    pub intervals: Vec<IntervalMaps>,
    pub declarations: Vec<Variable>,
    pub int_declarations: Vec<(String, usize)>,
    pub externals: Vec<Function>,
    pub generated: Vec<Function>,
    pub full_rhs: Function,
    pub integrate: Function,
}

/// A configurable exporter of tailored integrator code.
pub struct IntegratorExport {
    scheme: Scheme,
    cfg: Config,
    work: Option<Workspace>,
}

impl IntegratorExport {
    pub(crate) fn with_scheme(scheme: Scheme) -> Self {
        Self {
            scheme,
            cfg: Config::default(),
            work: None,
        }
    }

    /// An exporter for an explicit Runge-Kutta scheme with the given tableau.
    pub fn explicit_runge_kutta(tableau: ButcherTableau) -> Self {
        Self::with_scheme(Scheme::ExplicitRungeKutta(ErkScheme::new(tableau)))
    }

    /// An exporter for an implicit Runge-Kutta scheme with the given tableau.
    pub fn implicit_runge_kutta(tableau: ButcherTableau) -> Self {
        Self::with_scheme(Scheme::ImplicitRungeKutta(IrkScheme::new(tableau)))
    }

    /// An exporter for a discrete-time state map.
    pub fn discrete_time() -> Self {
        Self::with_scheme(Scheme::DiscreteTime(DiscreteScheme::new()))
    }

    /// An exporter for a NARX model. Attach either a polynomial model via
    /// [`set_narx_model`](Self::set_narx_model) or externally compiled
    /// routines via [`set_model`](Self::set_model).
    pub fn narx(degree: usize) -> Self {
        Self::with_scheme(Scheme::Narx(NarxScheme::new(degree)))
    }

    pub fn scheme_name(&self) -> &'static str {
        self.scheme.generator().name()
    }

    /// Names of the (rhs, diffs) routines the generated code calls for the
    /// nonlinear core.
    pub fn rhs_names(&self) -> Result<(String, String), CodegenError> {
        self.scheme.generator().rhs_names(&self.cfg)
    }

    /// Names and dimensions of the registered output functions, in
    /// registration order.
    pub fn output_descriptors(&self) -> Vec<(&str, usize)> {
        self.cfg
            .outputs
            .iter()
            .map(|o| (o.rhs.name(), o.rhs.dim()))
            .collect()
    }

    pub fn is_setup(&self) -> bool {
        self.work.is_some()
    }

    fn require_unconfigured(&self, what: &str) -> Result<(), CodegenError> {
        if self.work.is_some() {
            return Err(CodegenError::InvalidStateTransition(format!(
                "{} after setup()",
                what
            )));
        }
        Ok(())
    }

    fn require_setup(&self) -> Result<&Workspace, CodegenError> {
        self.work.as_ref().ok_or_else(|| {
            CodegenError::InvalidStateTransition("emission before setup()".into())
        })
    }

    /// Attach a symbolic right-hand side and its Jacobian.
    pub fn set_differential_equation(
        &mut self,
        rhs: SymbolicFunction,
        diffs: SymbolicFunction,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("set_differential_equation()")?;
        self.cfg.rhs = Some(ModelRhs::Symbolic { rhs, diffs });
        Ok(())
    }

    /// Attach an externally compiled right-hand side by name.
    pub fn set_model(
        &mut self,
        name: impl Into<String>,
        diffs_name: impl Into<String>,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("set_model()")?;
        self.cfg.rhs = Some(ModelRhs::External {
            name: name.into(),
            diffs_name: diffs_name.into(),
        });
        Ok(())
    }

    /// Attach a polynomial NARX model: `delay` lagged samples and one
    /// coefficient row per state component.
    pub fn set_narx_model(
        &mut self,
        delay: usize,
        coefficients: DMatrix<f64>,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("set_narx_model()")?;
        if delay == 0 || coefficients.nrows() == 0 {
            return Err(CodegenError::UnsupportedConfiguration(
                "a NARX model needs a positive delay and at least one state".into(),
            ));
        }
        self.cfg.narx = Some(NarxModel {
            delay,
            coefficients,
        });
        Ok(())
    }

    /// Declare the linear-input partition `M1 * dx1 = A1 * x1 + B1 * u`.
    pub fn set_linear_input(
        &mut self,
        m1: DMatrix<f64>,
        a1: DMatrix<f64>,
        b1: DMatrix<f64>,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("set_linear_input()")?;
        let n = m1.nrows();
        if m1.ncols() != n || a1.nrows() != n || a1.ncols() != n || b1.nrows() != n {
            return Err(CodegenError::InconsistentPartitionDimensions {
                partition: "linear input",
                expected: format!("M1 {0}x{0}, A1 {0}x{0}, B1 with {0} rows", n),
                got: format!(
                    "M1 {}x{}, A1 {}x{}, B1 {}x{}",
                    m1.nrows(),
                    m1.ncols(),
                    a1.nrows(),
                    a1.ncols(),
                    b1.nrows(),
                    b1.ncols()
                ),
            });
        }
        self.cfg.input = Some(LinearInput { m: m1, a: a1, b: b1 });
        Ok(())
    }

    /// Declare the linear-output partition with a symbolic coupling term.
    pub fn set_linear_output(
        &mut self,
        m3: DMatrix<f64>,
        a3: DMatrix<f64>,
        rhs: SymbolicFunction,
        diffs: SymbolicFunction,
    ) -> Result<(), CodegenError> {
        self.set_linear_output_rhs(m3, a3, ModelRhs::Symbolic { rhs, diffs })
    }

    /// Declare the linear-output partition with a named coupling term.
    pub fn set_linear_output_named(
        &mut self,
        m3: DMatrix<f64>,
        a3: DMatrix<f64>,
        name: impl Into<String>,
        diffs_name: impl Into<String>,
    ) -> Result<(), CodegenError> {
        self.set_linear_output_rhs(
            m3,
            a3,
            ModelRhs::External {
                name: name.into(),
                diffs_name: diffs_name.into(),
            },
        )
    }

    fn set_linear_output_rhs(
        &mut self,
        m3: DMatrix<f64>,
        a3: DMatrix<f64>,
        rhs: ModelRhs,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("set_linear_output()")?;
        let n = m3.nrows();
        if m3.ncols() != n || a3.nrows() != n || a3.ncols() != n {
            return Err(CodegenError::InconsistentPartitionDimensions {
                partition: "linear output",
                expected: format!("M3 {0}x{0}, A3 {0}x{0}", n),
                got: format!(
                    "M3 {}x{}, A3 {}x{}",
                    m3.nrows(),
                    m3.ncols(),
                    a3.nrows(),
                    a3.ncols()
                ),
            });
        }
        self.cfg.output = Some(LinearOutput { m: m3, a: a3, rhs });
        Ok(())
    }

    /// Declare the full state and control dimensions. Required for external
    /// right-hand sides; validated against the symbolic ones.
    pub fn set_dimensions(&mut self, nx: usize, nu: usize) -> Result<(), CodegenError> {
        self.require_unconfigured("set_dimensions()")?;
        self.cfg.nx = Some(nx);
        self.cfg.nu = nu;
        Ok(())
    }

    /// Install the integration breakpoints.
    pub fn set_grid(&mut self, grid: Grid) -> Result<(), CodegenError> {
        self.require_unconfigured("set_grid()")?;
        self.cfg.grid = Some(grid);
        Ok(())
    }

    /// Install the per-interval inner step counts. Defaults to one step per
    /// interval when not called.
    pub fn set_num_steps(&mut self, steps: Vec<usize>) -> Result<(), CodegenError> {
        self.require_unconfigured("set_num_steps()")?;
        if steps.iter().any(|&s| s == 0) {
            return Err(CodegenError::InvalidGrid(
                "every interval needs at least one step".into(),
            ));
        }
        self.cfg.num_steps = steps;
        Ok(())
    }

    pub fn set_sensitivity_mode(&mut self, mode: SensitivityMode) -> Result<(), CodegenError> {
        self.require_unconfigured("set_sensitivity_mode()")?;
        self.cfg.sensitivity = mode;
        Ok(())
    }

    /// Register auxiliary output functions from symbolic expressions, one
    /// per grid. Replaces any previously registered outputs.
    pub fn setup_output(
        &mut self,
        grids: Vec<Grid>,
        functions: Vec<(SymbolicFunction, SymbolicFunction)>,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("setup_output()")?;
        if grids.len() != functions.len() {
            return Err(CodegenError::InconsistentPartitionDimensions {
                partition: "output",
                expected: format!("{} output functions", grids.len()),
                got: format!("{}", functions.len()),
            });
        }
        self.cfg.outputs = grids
            .into_iter()
            .zip(functions)
            .map(|(grid, (rhs, diffs))| Output {
                grid,
                rhs: OutputRhs::Symbolic { rhs, diffs },
            })
            .collect();
        Ok(())
    }

    /// Register auxiliary output functions by name. Replaces any previously
    /// registered outputs.
    pub fn setup_output_named(
        &mut self,
        grids: Vec<Grid>,
        names: Vec<String>,
        diffs_names: Vec<String>,
        dims: Vec<usize>,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("setup_output_named()")?;
        if names.len() != grids.len() || diffs_names.len() != grids.len() || dims.len() != grids.len()
        {
            return Err(CodegenError::InconsistentPartitionDimensions {
                partition: "output",
                expected: format!("{} names, derivative names and dimensions", grids.len()),
                got: format!("{}/{}/{}", names.len(), diffs_names.len(), dims.len()),
            });
        }
        self.cfg.outputs = grids
            .into_iter()
            .zip(names)
            .zip(diffs_names)
            .zip(dims)
            .map(|(((grid, name), diffs_name), dim)| Output {
                grid,
                rhs: OutputRhs::External {
                    name,
                    diffs_name,
                    dim,
                },
            })
            .collect();
        Ok(())
    }

    /// Register auxiliary output functions by name with explicit dependency
    /// matrices. Replaces any previously registered outputs.
    pub fn setup_output_with_dependencies(
        &mut self,
        grids: Vec<Grid>,
        names: Vec<String>,
        diffs_names: Vec<String>,
        dims: Vec<usize>,
        dependencies: Vec<DMatrix<f64>>,
    ) -> Result<(), CodegenError> {
        self.require_unconfigured("setup_output_with_dependencies()")?;
        if names.len() != grids.len()
            || diffs_names.len() != grids.len()
            || dims.len() != grids.len()
            || dependencies.len() != grids.len()
        {
            return Err(CodegenError::InconsistentPartitionDimensions {
                partition: "output",
                expected: format!("{} descriptors of each kind", grids.len()),
                got: format!(
                    "{}/{}/{}/{}",
                    names.len(),
                    diffs_names.len(),
                    dims.len(),
                    dependencies.len()
                ),
            });
        }
        for (dim, deps) in dims.iter().zip(&dependencies) {
            if deps.nrows() != *dim {
                return Err(CodegenError::InconsistentPartitionDimensions {
                    partition: "output",
                    expected: format!("dependency matrix with {} rows", dim),
                    got: format!("{} rows", deps.nrows()),
                });
            }
        }
        self.cfg.outputs = grids
            .into_iter()
            .zip(names)
            .zip(diffs_names)
            .zip(dims)
            .zip(dependencies)
            .map(|((((grid, name), diffs_name), dim), deps)| Output {
                grid,
                rhs: OutputRhs::ExternalWithDependencies {
                    name,
                    diffs_name,
                    dim,
                    dependencies: deps,
                },
            })
            .collect();
        Ok(())
    }

    /// Resolved partition sizes, available after `setup()`.
    pub fn dims(&self) -> Result<Dims, CodegenError> {
        Ok(self.require_setup()?.bufs.dims)
    }

    /// Resolve the configuration and build the exported routine bodies.
    ///
    /// Terminal transition: setters fail afterwards and the emission entry
    /// points become available.
    pub fn setup(&mut self) -> Result<(), CodegenError> {
        self.require_unconfigured("setup()")?;
        let grid = self
            .cfg
            .grid
            .as_ref()
            .ok_or_else(|| {
                CodegenError::InvalidStateTransition("setup() before set_grid()".into())
            })?
            .clone();
        let dims = self.resolve_dims()?;
        let gen = self.scheme.generator();
        gen.check(&self.cfg, &dims)?;
        match self.cfg.sensitivity {
            SensitivityMode::None | SensitivityMode::Forward => {}
            mode => return Err(CodegenError::UnsupportedSensitivityMode(mode)),
        }
        let num_steps = if self.cfg.num_steps.is_empty() {
            vec![1; grid.num_intervals()]
        } else if self.cfg.num_steps.len() == grid.num_intervals() {
            self.cfg.num_steps.clone()
        } else {
            return Err(CodegenError::InvalidGrid(format!(
                "{} step counts for {} grid intervals",
                self.cfg.num_steps.len(),
                grid.num_intervals()
            )));
        };
        let forward = self.cfg.sensitivity == SensitivityMode::Forward;
        let bufs = Buffers::new(dims, gen.num_stages(), forward);

        let mut intervals = Vec::with_capacity(grid.num_intervals());
        for i in 0..grid.num_intervals() {
            let h = grid.step_size(i) / num_steps[i] as f64;
            let input = match &self.cfg.input {
                Some(lin) => Some(fold_input_map(gen.tableau(), h, lin)?),
                None => None,
            };
            let output = match &self.cfg.output {
                Some(lin) => Some(fold_output_map(gen.tableau(), h, lin)?),
                None => None,
            };
            intervals.push(IntervalMaps {
                h,
                steps: num_steps[i],
                input,
                output,
            });
        }

        let (rhs_name, _diffs_name) = gen.rhs_names(&self.cfg)?;
        let generated = gen.generated_functions(&self.cfg, &dims)?;
        let full_rhs = build_full_rhs(&self.cfg, &bufs, &rhs_name)?;
        let integrate = build_integrate(&self.cfg, &self.scheme, &bufs, &intervals, &grid)?;
        let declarations = collect_declarations(&self.cfg, gen, &bufs);
        let int_declarations = gen.extra_int_declarations(&bufs);
        let externals = collect_externals(&self.cfg, gen, &bufs, &generated);

        self.work = Some(Workspace {
            bufs,
            intervals,
            declarations,
            int_declarations,
            externals,
            generated,
            full_rhs,
            integrate,
        });
        Ok(())
    }

    fn resolve_dims(&self) -> Result<Dims, CodegenError> {
        let cfg = &self.cfg;
        if let Some(narx) = &cfg.narx {
            let n = narx.coefficients.nrows();
            let nx = narx.delay * n;
            if cfg.input.is_some() || cfg.output.is_some() {
                return Err(CodegenError::UnsupportedConfiguration(
                    "a NARX model admits no linear partitions".into(),
                ));
            }
            if cfg.nu != 0 {
                return Err(CodegenError::UnsupportedConfiguration(
                    "control inputs are not part of the polynomial NARX map".into(),
                ));
            }
            return Ok(Dims {
                nx1: 0,
                nx2: nx,
                nx3: 0,
                nx,
                nu: 0,
                nvars: nx,
                nvars2: nx,
            });
        }
        let rhs = cfg.rhs.as_ref().ok_or(CodegenError::ModelNotAssigned)?;
        let nx1 = cfg.input.as_ref().map_or(0, |p| p.m.nrows());
        let nx3 = cfg.output.as_ref().map_or(0, |p| p.m.nrows());
        let nu = cfg.nu;
        let nx2 = match (rhs.dimension(), cfg.nx) {
            (Some(n2), Some(nx)) => {
                if nx != nx1 + n2 + nx3 {
                    return Err(CodegenError::InconsistentPartitionDimensions {
                        partition: "state",
                        expected: format!("NX = NX1 + NX2 + NX3 = {}", nx1 + n2 + nx3),
                        got: format!("{}", nx),
                    });
                }
                n2
            }
            (Some(n2), None) => n2,
            (None, Some(nx)) => nx.checked_sub(nx1 + nx3).ok_or_else(|| {
                CodegenError::InconsistentPartitionDimensions {
                    partition: "state",
                    expected: format!("NX >= NX1 + NX3 = {}", nx1 + nx3),
                    got: format!("{}", nx),
                }
            })?,
            (None, None) => {
                return Err(CodegenError::InvalidStateTransition(
                    "set_dimensions() is required with an external model".into(),
                ))
            }
        };
        let nx = nx1 + nx2 + nx3;
        if let Some(lin) = &cfg.input {
            if lin.b.ncols() != nu {
                return Err(CodegenError::InconsistentPartitionDimensions {
                    partition: "linear input",
                    expected: format!("B1 with {} columns", nu),
                    got: format!("{}", lin.b.ncols()),
                });
            }
        }
        if let ModelRhs::Symbolic { rhs: f, diffs } = rhs {
            let nin = nx1 + nx2 + nu;
            if f.inputs() != nin {
                return Err(CodegenError::InconsistentPartitionDimensions {
                    partition: "implicit",
                    expected: format!("a right-hand side over {} arguments", nin),
                    got: format!("{}", f.inputs()),
                });
            }
            if diffs.outputs() != nx2 * nin {
                return Err(CodegenError::InconsistentPartitionDimensions {
                    partition: "implicit",
                    expected: format!("a Jacobian of {} entries", nx2 * nin),
                    got: format!("{}", diffs.outputs()),
                });
            }
        }
        if let Some(lin) = &cfg.output {
            if let ModelRhs::Symbolic { rhs: f, .. } = &lin.rhs {
                if f.outputs() != nx3 {
                    return Err(CodegenError::InconsistentPartitionDimensions {
                        partition: "linear output",
                        expected: format!("a coupling term of dimension {}", nx3),
                        got: format!("{}", f.outputs()),
                    });
                }
            }
        }
        Ok(Dims {
            nx1,
            nx2,
            nx3,
            nx,
            nu,
            nvars: nx + nu,
            nvars2: nx1 + nx2 + nu,
        })
    }

    fn step_ctx<'a>(&'a self, ws: &'a Workspace) -> StepCtx<'a> {
        let maps = &ws.intervals[0];
        StepCtx {
            dims: ws.bufs.dims,
            bufs: &ws.bufs,
            h: maps.h,
            input: maps.input.as_ref(),
            output: maps.output.as_ref(),
            forward: ws.bufs.forward,
        }
    }

    /// Append the declarations of every global buffer of the generated code.
    pub fn get_data_declarations(&self, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        for var in &ws.declarations {
            block.add_declaration(var.clone());
        }
        for (name, len) in &ws.int_declarations {
            block.add_raw(format!("int {}[{}];", name, len));
        }
        Ok(())
    }

    /// Append the forward declarations of every routine the generated code
    /// defines or calls.
    pub fn get_function_declarations(
        &self,
        block: &mut StatementBlock,
    ) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        for f in &ws.externals {
            block.add_statement(Statement::FunctionDeclaration(f.clone()));
        }
        for f in &ws.generated {
            block.add_statement(Statement::FunctionDeclaration(f.clone()));
        }
        block.add_statement(Statement::FunctionDeclaration(ws.full_rhs.clone()));
        block.add_statement(Statement::FunctionDeclaration(ws.integrate.clone()));
        Ok(())
    }

    /// Append the definitions of every generated routine.
    pub fn get_code(&self, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        for f in &ws.generated {
            block.add_statement(Statement::Function(f.clone()));
        }
        block.add_statement(Statement::Function(ws.full_rhs.clone()));
        block.add_statement(Statement::Function(ws.integrate.clone()));
        Ok(())
    }

    /// Append the state update and local sensitivity contribution of the
    /// linear-input partition for one step. No-op when the partition is
    /// empty.
    pub fn update_input_system(&self, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        emit_update_input(&self.step_ctx(ws), block)
    }

    /// Append the sensitivity chaining of the linear-input partition.
    pub fn propagate_input_system(&self, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        emit_propagate_input(&self.step_ctx(ws), block)
    }

    /// Append the stage algebra and state update of the nonlinear core.
    pub fn update_implicit_system(&self, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        self.scheme
            .generator()
            .update_implicit_system(&self.step_ctx(ws), &self.cfg, block)
    }

    /// Append the sensitivity chaining of the nonlinear core.
    pub fn propagate_implicit_system(
        &self,
        block: &mut StatementBlock,
    ) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        self.scheme
            .generator()
            .propagate_implicit_system(&self.step_ctx(ws), block)
    }

    /// Append the state update and local sensitivity contribution of the
    /// linear-output partition. No-op when the partition is empty.
    pub fn update_output_system(&self, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        emit_update_output(&self.step_ctx(ws), &self.cfg, &self.scheme, block)
    }

    /// Append the sensitivity chaining of the linear-output partition.
    pub fn propagate_output_system(&self, block: &mut StatementBlock) -> Result<(), CodegenError> {
        let ws = self.require_setup()?;
        emit_propagate_output(&self.step_ctx(ws), block)
    }
}

/// `x <- inverse(M) * A`, reported as a partition inconsistency when `M` is
/// singular.
fn inverted(
    m: &DMatrix<f64>,
    partition: &'static str,
) -> Result<DMatrix<f64>, CodegenError> {
    m.clone()
        .try_inverse()
        .ok_or(CodegenError::InconsistentPartitionDimensions {
            partition,
            expected: "an invertible mass matrix".into(),
            got: "a singular one".into(),
        })
}

/// Solve the stacked stage system `(I - h * A (x) ahat) * K = R` for the
/// given per-stage right-hand-side blocks.
fn solve_stacked(
    tableau: &ButcherTableau,
    h: f64,
    ahat: &DMatrix<f64>,
    rhs_blocks: &[DMatrix<f64>],
    partition: &'static str,
) -> Result<Vec<DMatrix<f64>>, CodegenError> {
    let s = tableau.num_stages();
    let n = ahat.nrows();
    let m = rhs_blocks[0].ncols();
    let mut big = DMatrix::<f64>::identity(s * n, s * n);
    for i in 0..s {
        for j in 0..s {
            let aij = tableau.a(i, j);
            if aij == 0.0 {
                continue;
            }
            for r in 0..n {
                for c in 0..n {
                    big[(i * n + r, j * n + c)] -= h * aij * ahat[(r, c)];
                }
            }
        }
    }
    let mut rhs = DMatrix::<f64>::zeros(s * n, m);
    for (i, blk) in rhs_blocks.iter().enumerate() {
        rhs.view_mut((i * n, 0), (n, m)).copy_from(blk);
    }
    let sol = big
        .lu()
        .solve(&rhs)
        .ok_or(CodegenError::InconsistentPartitionDimensions {
            partition,
            expected: "a solvable stage system".into(),
            got: "a singular one".into(),
        })?;
    Ok((0..s)
        .map(|i| sol.view((i * n, 0), (n, m)).into_owned())
        .collect())
}

/// Fold the linear-input partition into one-step constants for step size `h`.
pub(crate) fn fold_input_map(
    tableau: Option<&ButcherTableau>,
    h: f64,
    lin: &LinearInput,
) -> Result<InputMap, CodegenError> {
    let n = lin.m.nrows();
    let ahat = inverted(&lin.m, "linear input")? * &lin.a;
    let bhat = inverted(&lin.m, "linear input")? * &lin.b;
    let Some(tableau) = tableau else {
        // discrete-time map: the matrices are the one-step transition itself
        return Ok(InputMap {
            phi: ahat,
            gamma: bhat,
            stage_phi: vec![DMatrix::identity(n, n)],
            stage_gamma: vec![DMatrix::zeros(n, lin.b.ncols())],
        });
    };
    let s = tableau.num_stages();
    let p = solve_stacked(tableau, h, &ahat, &vec![ahat.clone(); s], "linear input")?;
    let q = solve_stacked(tableau, h, &ahat, &vec![bhat.clone(); s], "linear input")?;
    let mut phi = DMatrix::identity(n, n);
    let mut gamma = DMatrix::zeros(n, lin.b.ncols());
    for i in 0..s {
        phi += h * tableau.b(i) * &p[i];
        gamma += h * tableau.b(i) * &q[i];
    }
    let mut stage_phi = Vec::with_capacity(s);
    let mut stage_gamma = Vec::with_capacity(s);
    for i in 0..s {
        let mut sp = DMatrix::identity(n, n);
        let mut sg = DMatrix::zeros(n, lin.b.ncols());
        for j in 0..s {
            let aij = tableau.a(i, j);
            if aij == 0.0 {
                continue;
            }
            sp += h * aij * &p[j];
            sg += h * aij * &q[j];
        }
        stage_phi.push(sp);
        stage_gamma.push(sg);
    }
    Ok(InputMap {
        phi,
        gamma,
        stage_phi,
        stage_gamma,
    })
}

/// Fold the linear-output partition into one-step constants for step size
/// `h`: the homogeneous transition and one weight matrix per stage applied
/// to the coupling-term values.
pub(crate) fn fold_output_map(
    tableau: Option<&ButcherTableau>,
    h: f64,
    lin: &LinearOutput,
) -> Result<OutputMap, CodegenError> {
    let n = lin.m.nrows();
    let minv = inverted(&lin.m, "linear output")?;
    let ahat = &minv * &lin.a;
    let Some(tableau) = tableau else {
        return Ok(OutputMap {
            phi: ahat,
            weights: vec![minv],
        });
    };
    let s = tableau.num_stages();
    let p = solve_stacked(tableau, h, &ahat, &vec![ahat.clone(); s], "linear output")?;
    let mut phi = DMatrix::identity(n, n);
    for i in 0..s {
        phi += h * tableau.b(i) * &p[i];
    }
    let mut weights = Vec::with_capacity(s);
    for j in 0..s {
        let seeds: Vec<DMatrix<f64>> = (0..s)
            .map(|i| {
                if i == j {
                    minv.clone()
                } else {
                    DMatrix::zeros(n, n)
                }
            })
            .collect();
        let q = solve_stacked(tableau, h, &ahat, &seeds, "linear output")?;
        let mut w = DMatrix::zeros(n, n);
        for i in 0..s {
            w += h * tableau.b(i) * &q[i];
        }
        weights.push(w);
    }
    Ok(OutputMap { phi, weights })
}

/// The constant seed `[0 I 0]` of the implicit core's local sensitivities,
/// shaped `nx2 x nvars2`.
pub(crate) fn implicit_seed_2d(dims: &Dims) -> Variable {
    let mut m = DMatrix::zeros(dims.nx2, dims.nvars2);
    for i in 0..dims.nx2 {
        m[(i, dims.nx1 + i)] = 1.0;
    }
    Variable::constant("seed", &m)
}

/// The same seed flattened row major, shaped `1 x (nx2 * nvars2)`.
pub(crate) fn implicit_seed_flat(dims: &Dims) -> Variable {
    let mut m = DMatrix::zeros(1, dims.nx2 * dims.nvars2);
    for i in 0..dims.nx2 {
        m[(0, i * dims.nvars2 + dims.nx1 + i)] = 1.0;
    }
    Variable::constant("seed", &m)
}

/// The constant stage-state sensitivity of the linear-input rows,
/// `[stage_phi | 0 | stage_gamma]`, shaped `nx1 x nvars2`.
pub(crate) fn input_stage_seed(map: &InputMap, stage: usize, dims: &Dims) -> Variable {
    let mut m = DMatrix::zeros(dims.nx1, dims.nvars2);
    m.view_mut((0, 0), (dims.nx1, dims.nx1))
        .copy_from(&map.stage_phi[stage]);
    if dims.nu > 0 {
        m.view_mut((0, dims.nx1 + dims.nx2), (dims.nx1, dims.nu))
            .copy_from(&map.stage_gamma[stage]);
    }
    Variable::constant("seed1", &m)
}

/// Chain a partition's local sensitivities into the shared buffer:
/// `rows = local[:, 0..wx] * prev`, then the direct control columns.
pub(crate) fn emit_sensitivity_chain(
    block: &mut StatementBlock,
    eta_rows: Variable,
    local: Variable,
    prev: Variable,
    wx: usize,
    dims: &Dims,
) {
    let p = eta_rows.rows();
    block.add_arithmetic(ArithmeticStatement::product(
        eta_rows.clone(),
        Operator::Assign,
        local.block(0, 0, p, wx),
        prev,
    ));
    if dims.nu > 0 {
        block.add_arithmetic(ArithmeticStatement::add_assign(
            eta_rows.block(0, dims.nx, p, dims.nu),
            local.block(0, wx, p, dims.nu),
        ));
    }
}

/// One statement zero-filling `len` consecutive slots of a buffer inside a
/// generated counting loop.
pub(crate) fn zero_fill_loop(buffer: &str, offset: usize, len: usize) -> Statement {
    let mut body = StatementBlock::new();
    body.add_arithmetic(ArithmeticStatement::assign(
        Variable::new(buffer, 1, 1).indexed(Index::named("run").shifted(offset as i64)),
        Variable::dense_constant("zero", &DMatrix::from_element(1, 1, 0.0)),
    ));
    Statement::Loop {
        index: Index::named("run"),
        limit: len,
        body,
    }
}

/// Argument text for a call writing at a fixed offset into a buffer.
pub(crate) fn offset_arg(name: &str, offset: usize) -> String {
    if offset == 0 {
        name.to_string()
    } else {
        format!("&{}[ {} ]", name, offset)
    }
}

/// Emit the stage state of stage `i` into `rk_xxx`.
///
/// The linear-input rows come from their folded constant stage maps applied
/// to the step-start state saved in `rk_xtmp`; the implicit rows accumulate
/// the tableau row over the stage derivatives.
pub(crate) fn emit_stage_state(
    ctx: &StepCtx,
    tableau: &ButcherTableau,
    stage: usize,
    block: &mut StatementBlock,
) {
    let d = &ctx.dims;
    let b = ctx.bufs;
    if d.nx1 > 0 {
        if let Some(map) = ctx.input {
            block.add_arithmetic(ArithmeticStatement::product(
                b.xxx().block(0, 0, d.nx1, 1),
                Operator::Assign,
                Variable::constant("sphi", &map.stage_phi[stage]),
                b.xtmp().block(0, 0, d.nx1, 1),
            ));
            if d.nu > 0 {
                block.add_arithmetic(ArithmeticStatement::product(
                    b.xxx().block(0, 0, d.nx1, 1),
                    Operator::AddAssign,
                    Variable::constant("sgam", &map.stage_gamma[stage]),
                    b.eta_u(),
                ));
            }
        }
    }
    if d.nx2 > 0 {
        let row = Variable::constant("arow", &tableau.stage_row(stage, ctx.h));
        block.add_arithmetic(ArithmeticStatement::multiply_add(
            b.xxx().block(d.nx1, 0, d.nx2, 1).transposed(),
            Operator::Assign,
            row,
            b.kkk(),
            Operator::Add,
            b.eta_x2_row(),
        ));
    }
}

/// The sensitivity of the stage state of stage `i` with respect to the
/// step-start state and controls, shaped `nx2 x nvars2`.
///
/// For a stage whose tableau row is all zero the seed constant is returned
/// directly; otherwise the recurrence over `rk_diffK` is emitted into the
/// stage-sensitivity buffer and a view of it returned.
pub(crate) fn emit_stage_sensitivity(
    ctx: &StepCtx,
    tableau: &ButcherTableau,
    stage: usize,
    block: &mut StatementBlock,
) -> Variable {
    let d = &ctx.dims;
    let b = ctx.bufs;
    let row_is_zero = (0..tableau.num_stages()).all(|j| tableau.a(stage, j) == 0.0);
    if row_is_zero {
        return implicit_seed_2d(d);
    }
    let row = Variable::constant("arow", &tableau.stage_row(stage, ctx.h));
    block.add_arithmetic(ArithmeticStatement::multiply_add(
        b.stage_sens_flat(),
        Operator::Assign,
        row,
        b.diff_k_flat(),
        Operator::Add,
        implicit_seed_flat(d),
    ));
    b.stage_sens()
}

/// Emit the shared final update of the implicit core: the weighted stage
/// derivatives added to the state, and the local sensitivity block.
pub(crate) fn emit_implicit_update_tail(
    ctx: &StepCtx,
    tableau: &ButcherTableau,
    block: &mut StatementBlock,
) {
    let d = &ctx.dims;
    let b = ctx.bufs;
    let weights = Variable::constant("brow", &tableau.weight_row(ctx.h));
    block.add_arithmetic(ArithmeticStatement::multiply_add(
        b.eta_x2_row(),
        Operator::Assign,
        weights.clone(),
        b.kkk(),
        Operator::Add,
        b.eta_x2_row(),
    ));
    if ctx.forward {
        block.add_arithmetic(ArithmeticStatement::multiply_add(
            b.diffs_new2_flat(),
            Operator::Assign,
            weights,
            b.diff_k_flat(),
            Operator::Add,
            implicit_seed_flat(d),
        ));
    }
}

/// State update and local sensitivity contribution of the linear-input
/// partition for one step.
pub(crate) fn emit_update_input(
    ctx: &StepCtx,
    block: &mut StatementBlock,
) -> Result<(), CodegenError> {
    let d = &ctx.dims;
    let b = ctx.bufs;
    if d.nx1 == 0 {
        return Ok(());
    }
    let Some(map) = ctx.input else {
        return Ok(());
    };
    // keep the step-start value available for the stage states
    block.add_arithmetic(ArithmeticStatement::assign(
        b.xtmp().block(0, 0, d.nx1, 1),
        b.eta_x1(),
    ));
    block.add_arithmetic(ArithmeticStatement::product(
        b.eta_x1(),
        Operator::Assign,
        Variable::constant("phi1", &map.phi),
        b.xtmp().block(0, 0, d.nx1, 1),
    ));
    if d.nu > 0 {
        block.add_arithmetic(ArithmeticStatement::product(
            b.eta_x1(),
            Operator::AddAssign,
            Variable::constant("gam1", &map.gamma),
            b.eta_u(),
        ));
    }
    if ctx.forward {
        let mut local = DMatrix::zeros(d.nx1, d.nx1 + d.nu);
        local.view_mut((0, 0), (d.nx1, d.nx1)).copy_from(&map.phi);
        if d.nu > 0 {
            local
                .view_mut((0, d.nx1), (d.nx1, d.nu))
                .copy_from(&map.gamma);
        }
        block.add_arithmetic(ArithmeticStatement::assign(
            b.diffs_new1(),
            Variable::dense_constant("new1", &local),
        ));
    }
    Ok(())
}

/// Sensitivity chaining of the linear-input partition.
pub(crate) fn emit_propagate_input(
    ctx: &StepCtx,
    block: &mut StatementBlock,
) -> Result<(), CodegenError> {
    let d = &ctx.dims;
    if d.nx1 == 0 || !ctx.forward || ctx.input.is_none() {
        return Ok(());
    }
    emit_sensitivity_chain(
        block,
        ctx.bufs.eta_sens_rows(0, d.nx1),
        ctx.bufs.diffs_new1(),
        ctx.bufs.diffs_prev1(),
        d.nx1,
        d,
    );
    Ok(())
}

/// State update and local sensitivity contribution of the linear-output
/// partition. Reads the stage states the implicit core left in
/// `rk_stageX`.
pub(crate) fn emit_update_output(
    ctx: &StepCtx,
    cfg: &Config,
    scheme: &Scheme,
    block: &mut StatementBlock,
) -> Result<(), CodegenError> {
    let d = &ctx.dims;
    let b = ctx.bufs;
    if d.nx3 == 0 {
        return Ok(());
    }
    let (Some(map), Some(lin)) = (ctx.output, cfg.output.as_ref()) else {
        return Ok(());
    };
    let gen = scheme.generator();
    let stages = gen.num_stages().max(1);
    let in_var = b.xxx();
    let in_name = in_var.name().to_string();
    let nx12 = d.nx12();
    for i in 0..stages {
        // coupling term at the stage state
        if nx12 > 0 {
            block.add_arithmetic(ArithmeticStatement::assign(
                in_var.block(0, 0, nx12, 1),
                b.stage_x().row(i).transposed(),
            ));
        }
        block.add_function_call(
            lin.rhs.name(),
            vec![in_name.clone(), b.rhs_temp3().name().to_string()],
        );
        let op = if i == 0 {
            Operator::Assign
        } else {
            Operator::AddAssign
        };
        block.add_arithmetic(ArithmeticStatement::product(
            b.out3_acc(),
            op,
            Variable::constant("w3", &map.weights[i]),
            b.rhs_temp3(),
        ));
        if ctx.forward {
            block.add_function_call(
                lin.rhs.diffs_name(),
                vec![in_name.clone(), b.diffs_temp3().name().to_string()],
            );
            let j3 = b.diffs_temp3();
            // chain the coupling Jacobian through the stage-state
            // sensitivities; control columns enter directly
            let mut assigned = false;
            if d.nx1 > 0 {
                if let Some(imap) = ctx.input {
                    block.add_arithmetic(ArithmeticStatement::product(
                        b.aux3(),
                        Operator::Assign,
                        j3.block(0, 0, d.nx3, d.nx1),
                        input_stage_seed(imap, i.min(imap.stage_phi.len() - 1), d),
                    ));
                    assigned = true;
                }
            }
            if d.nx2 > 0 {
                let stage_sens = match gen.tableau() {
                    Some(t) => emit_stage_sensitivity(ctx, t, i, block),
                    None => implicit_seed_2d(d),
                };
                block.add_arithmetic(ArithmeticStatement::product(
                    b.aux3(),
                    if assigned {
                        Operator::AddAssign
                    } else {
                        Operator::Assign
                    },
                    j3.block(0, d.nx1, d.nx3, d.nx2),
                    stage_sens,
                ));
                assigned = true;
            }
            if !assigned {
                block.add_arithmetic(ArithmeticStatement::assign(
                    b.aux3(),
                    Variable::dense_constant(
                        "zero3",
                        &DMatrix::zeros(d.nx3, d.nvars2),
                    ),
                ));
            }
            if d.nu > 0 {
                block.add_arithmetic(ArithmeticStatement::add_assign(
                    b.aux3().block(0, nx12, d.nx3, d.nu),
                    j3.block(0, nx12, d.nx3, d.nu),
                ));
            }
            let w = Variable::constant("w3", &map.weights[i]);
            if nx12 > 0 {
                block.add_arithmetic(ArithmeticStatement::product(
                    b.diffs_new3().block(0, 0, d.nx3, nx12),
                    op,
                    w.clone(),
                    b.aux3().block(0, 0, d.nx3, nx12),
                ));
            }
            if d.nu > 0 {
                block.add_arithmetic(ArithmeticStatement::product(
                    b.diffs_new3().block(0, d.nx, d.nx3, d.nu),
                    op,
                    w,
                    b.aux3().block(0, nx12, d.nx3, d.nu),
                ));
            }
        }
    }
    if ctx.forward {
        // the homogeneous transition occupies the partition's own columns
        block.add_arithmetic(ArithmeticStatement::assign(
            b.diffs_new3().block(0, nx12, d.nx3, d.nx3),
            Variable::dense_constant("phi3", &map.phi),
        ));
    }
    // state update, reading the step-start value saved in the scratch copy
    block.add_arithmetic(ArithmeticStatement::assign(
        b.xtmp().block(nx12, 0, d.nx3, 1),
        b.eta_x3(),
    ));
    block.add_arithmetic(ArithmeticStatement::multiply_add(
        b.eta_x3(),
        Operator::Assign,
        Variable::constant("phi3", &map.phi),
        b.xtmp().block(nx12, 0, d.nx3, 1),
        Operator::Add,
        b.out3_acc(),
    ));
    Ok(())
}

/// Sensitivity chaining of the linear-output partition.
pub(crate) fn emit_propagate_output(
    ctx: &StepCtx,
    block: &mut StatementBlock,
) -> Result<(), CodegenError> {
    let d = &ctx.dims;
    if d.nx3 == 0 || !ctx.forward || ctx.output.is_none() {
        return Ok(());
    }
    emit_sensitivity_chain(
        block,
        ctx.bufs.eta_sens_rows(d.nx12(), d.nx3),
        ctx.bufs.diffs_new3(),
        ctx.bufs.diffs_prev3(),
        d.nx,
        d,
    );
    Ok(())
}

/// Assemble `acado_full_rhs`: the complete state derivative `[f1 f2 f3]`
/// from an input vector `[x u]`.
fn build_full_rhs(
    cfg: &Config,
    bufs: &Buffers,
    rhs_name: &str,
) -> Result<Function, CodegenError> {
    let d = &bufs.dims;
    let mut f = Function::new(
        "acado_full_rhs",
        vec![FunctionArg::input("in"), FunctionArg::output("out")],
    );
    let input = Variable::vector("in", d.nx + d.nu);
    let out = Variable::vector("out", d.nx);
    let body = f.body_mut();
    // the nonlinear core reads [x1 x2 u] contiguously
    if d.nx12() > 0 {
        body.add_arithmetic(ArithmeticStatement::assign(
            bufs.xxx().block(0, 0, d.nx12(), 1),
            input.block(0, 0, d.nx12(), 1),
        ));
    }
    if d.nu > 0 {
        body.add_arithmetic(ArithmeticStatement::assign(
            bufs.xxx().block(d.nx12(), 0, d.nu, 1),
            input.block(d.nx, 0, d.nu, 1),
        ));
    }
    if let Some(lin) = &cfg.input {
        let ahat = inverted(&lin.m, "linear input")? * &lin.a;
        let bhat = inverted(&lin.m, "linear input")? * &lin.b;
        body.add_arithmetic(ArithmeticStatement::product(
            out.block(0, 0, d.nx1, 1),
            Operator::Assign,
            Variable::constant("a1", &ahat),
            input.block(0, 0, d.nx1, 1),
        ));
        if d.nu > 0 {
            body.add_arithmetic(ArithmeticStatement::product(
                out.block(0, 0, d.nx1, 1),
                Operator::AddAssign,
                Variable::constant("b1", &bhat),
                input.block(d.nx, 0, d.nu, 1),
            ));
        }
    }
    if d.nx2 > 0 {
        body.add_function_call(
            rhs_name,
            vec!["rk_xxx".to_string(), offset_arg("out", d.nx1)],
        );
    }
    if let Some(narx) = &cfg.narx {
        // the generated map writes the newest samples; the lags shift down
        let n = narx.coefficients.nrows();
        if d.nx > n {
            body.add_arithmetic(ArithmeticStatement::assign(
                out.block(n, 0, d.nx - n, 1),
                input.block(0, 0, d.nx - n, 1),
            ));
        }
    }
    if let Some(lin) = &cfg.output {
        let minv = inverted(&lin.m, "linear output")?;
        let ahat = &minv * &lin.a;
        body.add_function_call(
            lin.rhs.name(),
            vec![
                bufs.xxx().name().to_string(),
                bufs.rhs_temp3().name().to_string(),
            ],
        );
        body.add_arithmetic(ArithmeticStatement::product(
            out.block(d.nx12(), 0, d.nx3, 1),
            Operator::Assign,
            Variable::constant("a3", &ahat),
            input.block(d.nx12(), 0, d.nx3, 1),
        ));
        body.add_arithmetic(ArithmeticStatement::product(
            out.block(d.nx12(), 0, d.nx3, 1),
            Operator::AddAssign,
            Variable::constant("m3i", &minv),
            bufs.rhs_temp3(),
        ));
    }
    Ok(f)
}

/// Assemble `acado_integrate`: the fully unrolled simulation of the grid,
/// step by step, with the partition protocol applied in fixed order.
fn build_integrate(
    cfg: &Config,
    scheme: &Scheme,
    bufs: &Buffers,
    intervals: &[IntervalMaps],
    grid: &Grid,
) -> Result<Function, CodegenError> {
    let d = &bufs.dims;
    let gen = scheme.generator();
    let mut f = Function::new("acado_integrate", vec![FunctionArg::output("rk_eta")]);
    let needs_run = bufs.forward || matches!(scheme, Scheme::ImplicitRungeKutta(_));
    if needs_run {
        f.add_local_index(Index::named("run"));
    }
    if intervals.iter().any(|m| m.steps > 1) {
        f.add_local_index(Index::named("run1"));
    }

    // prologue: controls into the call buffer, sensitivity seed, scheme
    // specific initialization
    {
        let body = f.body_mut();
        if d.nu > 0 {
            body.add_arithmetic(ArithmeticStatement::assign(
                bufs.xxx().block(d.nx12(), 0, d.nu, 1),
                bufs.eta_u(),
            ));
        }
        if bufs.forward {
            body.add_statement(zero_fill_loop("rk_eta", d.nx + d.nu, d.nx * d.nvars));
            for i in 0..d.nx {
                body.add_arithmetic(ArithmeticStatement::assign(
                    bufs.eta_sens().element(i, i),
                    Variable::literal(1.0),
                ));
            }
        }
    }
    {
        let maps = &intervals[0];
        let ctx = StepCtx {
            dims: *d,
            bufs,
            h: maps.h,
            input: maps.input.as_ref(),
            output: maps.output.as_ref(),
            forward: bufs.forward,
        };
        let mut pro = StatementBlock::new();
        gen.prologue(&ctx, &mut pro)?;
        f.body_mut().append(pro);
    }

    for (i, maps) in intervals.iter().enumerate() {
        let ctx = StepCtx {
            dims: *d,
            bufs,
            h: maps.h,
            input: maps.input.as_ref(),
            output: maps.output.as_ref(),
            forward: bufs.forward,
        };
        let mut step = StatementBlock::new();
        // save the previous-step sensitivities before any partition
        // overwrites its rows
        if bufs.forward {
            if d.nx1 > 0 {
                step.add_arithmetic(ArithmeticStatement::assign(
                    bufs.diffs_prev1(),
                    bufs.eta_sens_rows(0, d.nx1),
                ));
            }
            if d.nx2 > 0 {
                step.add_arithmetic(ArithmeticStatement::assign(
                    bufs.diffs_prev2(),
                    bufs.eta_sens_rows(0, d.nx12()),
                ));
            }
            if d.nx3 > 0 {
                step.add_arithmetic(ArithmeticStatement::assign(
                    bufs.diffs_prev3(),
                    bufs.eta_sens(),
                ));
            }
        }
        emit_update_input(&ctx, &mut step)?;
        emit_propagate_input(&ctx, &mut step)?;
        gen.update_implicit_system(&ctx, cfg, &mut step)?;
        gen.propagate_implicit_system(&ctx, &mut step)?;
        emit_update_output(&ctx, cfg, scheme, &mut step)?;
        emit_propagate_output(&ctx, &mut step)?;

        let body = f.body_mut();
        body.add_comment(format!("interval {}", i));
        if maps.steps > 1 {
            body.add_statement(Statement::Loop {
                index: Index::named("run1"),
                limit: maps.steps,
                body: step,
            });
        } else {
            body.append(step);
        }
        emit_interval_outputs(cfg, bufs, grid, i, body)?;
    }
    Ok(f)
}

/// Evaluate the registered output functions whose grid points fall inside
/// interval `interval` of the main grid, at the interval-end state.
fn emit_interval_outputs(
    cfg: &Config,
    bufs: &Buffers,
    grid: &Grid,
    interval: usize,
    body: &mut StatementBlock,
) -> Result<(), CodegenError> {
    if cfg.outputs.is_empty() {
        return Ok(());
    }
    let d = &bufs.dims;
    let lo = grid.points()[interval];
    let hi = grid.points()[interval + 1];
    let span = hi - lo;
    let mut refreshed = false;
    for (k, out) in cfg.outputs.iter().enumerate() {
        let dim = out.rhs.dim();
        for (pi, &t) in out.grid.points().iter().enumerate().skip(1) {
            if t <= lo + 1e-12 * span.abs() || t > hi + 1e-12 * span.abs() {
                continue;
            }
            if !refreshed && d.nx12() > 0 {
                body.add_arithmetic(ArithmeticStatement::assign(
                    bufs.xxx().block(0, 0, d.nx12(), 1),
                    bufs.eta_x().block(0, 0, d.nx12(), 1),
                ));
                refreshed = true;
            }
            body.add_function_call(
                out.rhs.name(),
                vec![
                    "rk_xxx".to_string(),
                    offset_arg(&format!("rk_outputs{}", k), (pi - 1) * dim),
                ],
            );
            if bufs.forward {
                body.add_function_call(
                    out.rhs.diffs_name(),
                    vec![
                        "rk_xxx".to_string(),
                        offset_arg(
                            &format!("rk_diffsOutputs{}", k),
                            (pi - 1) * dim * d.nvars,
                        ),
                    ],
                );
            }
        }
    }
    Ok(())
}

/// Collect the global buffer declarations of the generated code.
fn collect_declarations(
    cfg: &Config,
    gen: &dyn SchemeGenerator,
    bufs: &Buffers,
) -> Vec<Variable> {
    let d = &bufs.dims;
    let mut vars = vec![bufs.xxx()];
    if d.nx1 > 0 || d.nx3 > 0 {
        vars.push(bufs.xtmp());
    }
    if d.nx2 > 0 {
        vars.push(bufs.kkk());
    }
    if d.nx3 > 0 {
        if d.nx12() > 0 {
            vars.push(bufs.stage_x());
        }
        vars.push(bufs.rhs_temp3());
        vars.push(bufs.out3_acc());
    }
    if bufs.forward {
        if d.nx2 > 0 {
            vars.push(bufs.stage_sens());
            vars.push(bufs.diff_k_flat());
            vars.push(Variable::new(
                "rk_diffsTemp2",
                bufs.stages * d.nx2,
                d.nvars2,
            ));
            vars.push(bufs.diffs_new2());
            vars.push(bufs.diffs_prev2());
        }
        if d.nx1 > 0 {
            vars.push(bufs.diffs_new1());
            vars.push(bufs.diffs_prev1());
        }
        if d.nx3 > 0 {
            vars.push(bufs.diffs_new3());
            vars.push(bufs.diffs_prev3());
            vars.push(bufs.diffs_temp3());
            vars.push(bufs.aux3());
        }
    }
    for (k, out) in cfg.outputs.iter().enumerate() {
        let dim = out.rhs.dim();
        let points = out.grid.num_intervals();
        vars.push(Variable::vector(format!("rk_outputs{}", k), dim * points));
        if bufs.forward {
            vars.push(Variable::vector(
                format!("rk_diffsOutputs{}", k),
                dim * d.nvars * points,
            ));
        }
    }
    vars.extend(gen.extra_declarations(bufs));
    vars
}

/// Collect the prototypes of every externally supplied routine.
fn collect_externals(
    cfg: &Config,
    gen: &dyn SchemeGenerator,
    bufs: &Buffers,
    generated: &[Function],
) -> Vec<Function> {
    let io = || vec![FunctionArg::input("in"), FunctionArg::output("out")];
    let mut externals = Vec::new();
    let generated_names: Vec<&str> = generated.iter().map(|f| f.name()).collect();
    let push = |name: &str, externals: &mut Vec<Function>| {
        if !generated_names.contains(&name)
            && !externals.iter().any(|f: &Function| f.name() == name)
        {
            externals.push(Function::new(name, io()));
        }
    };
    if let Some(rhs) = &cfg.rhs {
        push(rhs.name(), &mut externals);
        if bufs.forward {
            push(rhs.diffs_name(), &mut externals);
        }
    }
    if let Some(lin) = &cfg.output {
        push(lin.rhs.name(), &mut externals);
        if bufs.forward {
            push(lin.rhs.diffs_name(), &mut externals);
        }
    }
    for out in &cfg.outputs {
        push(out.rhs.name(), &mut externals);
        if bufs.forward {
            push(out.rhs.diffs_name(), &mut externals);
        }
    }
    externals.extend(gen.extra_externals(bufs));
    externals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ExportOptions;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;

    fn symbolic_export(nx2: usize, nu: usize) -> IntegratorExport {
        let mut export = IntegratorExport::explicit_runge_kutta(ButcherTableau::erk2());
        let nin = nx2 + nu;
        export
            .set_differential_equation(
                SymbolicFunction::new("acado_rhs", nin, nx2),
                SymbolicFunction::new("acado_diffs", nin, nx2 * nin),
            )
            .unwrap();
        export.set_dimensions(nx2, nu).unwrap();
        export
            .set_grid(Grid::equidistant(0.0, 1.0, 2).unwrap())
            .unwrap();
        export
    }

    #[test]
    fn setup_is_a_terminal_transition() {
        let mut export = symbolic_export(2, 0);
        export.setup().unwrap();
        assert!(export.is_setup());
        assert!(matches!(
            export.set_dimensions(3, 0),
            Err(CodegenError::InvalidStateTransition(_))
        ));
        assert!(matches!(
            export.set_grid(Grid::equidistant(0.0, 1.0, 4).unwrap()),
            Err(CodegenError::InvalidStateTransition(_))
        ));
        assert!(matches!(
            export.setup(),
            Err(CodegenError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn setup_requires_a_grid_and_a_model() {
        let mut export = IntegratorExport::explicit_runge_kutta(ButcherTableau::erk4());
        assert!(matches!(
            export.setup(),
            Err(CodegenError::InvalidStateTransition(_))
        ));
        export
            .set_grid(Grid::equidistant(0.0, 1.0, 1).unwrap())
            .unwrap();
        assert!(matches!(
            export.setup(),
            Err(CodegenError::ModelNotAssigned)
        ));
    }

    #[test]
    fn emission_before_setup_is_refused() {
        let export = symbolic_export(1, 0);
        let mut block = StatementBlock::new();
        assert!(matches!(
            export.get_code(&mut block),
            Err(CodegenError::InvalidStateTransition(_))
        ));
        assert!(block.is_empty());
    }

    #[test]
    fn adjoint_modes_are_rejected_at_setup() {
        for mode in [
            SensitivityMode::Backward,
            SensitivityMode::ForwardOverBackward,
        ] {
            let mut export = symbolic_export(1, 0);
            export.set_sensitivity_mode(mode).unwrap();
            assert!(matches!(
                export.setup(),
                Err(CodegenError::UnsupportedSensitivityMode(_))
            ));
        }
    }

    #[test]
    fn latest_output_registration_wins() {
        let mut export = symbolic_export(2, 0);
        let grid = || Grid::equidistant(0.0, 1.0, 2).unwrap();
        export
            .setup_output(
                vec![grid(), grid()],
                vec![
                    (
                        SymbolicFunction::new("h0", 2, 1),
                        SymbolicFunction::new("h0_diffs", 2, 2),
                    ),
                    (
                        SymbolicFunction::new("h1", 2, 1),
                        SymbolicFunction::new("h1_diffs", 2, 2),
                    ),
                ],
            )
            .unwrap();
        assert_eq!(export.cfg.outputs.len(), 2);
        export
            .setup_output_named(
                vec![grid()],
                vec!["meas".into()],
                vec!["meas_diffs".into()],
                vec![3],
            )
            .unwrap();
        assert_eq!(export.cfg.outputs.len(), 1);
        assert_eq!(export.cfg.outputs[0].rhs.name(), "meas");
    }

    #[test]
    fn output_length_mismatches_are_rejected() {
        let mut export = symbolic_export(2, 0);
        let result = export.setup_output_named(
            vec![Grid::equidistant(0.0, 1.0, 2).unwrap()],
            vec!["a".into(), "b".into()],
            vec!["da".into()],
            vec![1],
        );
        assert!(matches!(
            result,
            Err(CodegenError::InconsistentPartitionDimensions { .. })
        ));
        assert!(export.cfg.outputs.is_empty());
    }

    #[test]
    fn dependency_row_counts_are_checked() {
        let mut export = symbolic_export(2, 0);
        let result = export.setup_output_with_dependencies(
            vec![Grid::equidistant(0.0, 1.0, 2).unwrap()],
            vec!["meas".into()],
            vec!["meas_diffs".into()],
            vec![2],
            vec![DMatrix::zeros(3, 2)],
        );
        assert!(matches!(
            result,
            Err(CodegenError::InconsistentPartitionDimensions { .. })
        ));
    }

    #[test]
    fn step_counts_must_cover_every_interval() {
        let mut export = symbolic_export(1, 0);
        export.set_num_steps(vec![2, 2, 2]).unwrap();
        assert!(matches!(export.setup(), Err(CodegenError::InvalidGrid(_))));
    }

    #[test]
    fn symbolic_shapes_are_validated() {
        let mut export = IntegratorExport::explicit_runge_kutta(ButcherTableau::erk2());
        export
            .set_differential_equation(
                SymbolicFunction::new("acado_rhs", 5, 2),
                SymbolicFunction::new("acado_diffs", 5, 4),
            )
            .unwrap();
        export.set_dimensions(2, 0).unwrap();
        export
            .set_grid(Grid::equidistant(0.0, 1.0, 1).unwrap())
            .unwrap();
        assert!(matches!(
            export.setup(),
            Err(CodegenError::InconsistentPartitionDimensions { .. })
        ));
    }

    #[test]
    fn empty_partitions_emit_nothing() {
        let mut export = symbolic_export(2, 0);
        export.setup().unwrap();
        let mut block = StatementBlock::new();
        export.update_input_system(&mut block).unwrap();
        export.propagate_input_system(&mut block).unwrap();
        export.update_output_system(&mut block).unwrap();
        export.propagate_output_system(&mut block).unwrap();
        assert!(block.is_empty());
    }

    #[test]
    fn update_precedes_propagate_in_generated_code() {
        let mut export = symbolic_export(2, 0);
        export.setup().unwrap();
        let mut block = StatementBlock::new();
        export.get_code(&mut block).unwrap();
        let code = block.render_code(&ExportOptions::default()).unwrap();
        let body = &code[code.find("void acado_integrate").unwrap()..];
        let update = body.find("acado_rhs( rk_xxx").unwrap();
        // the chain multiplies into the saved previous-step sensitivities
        let propagate = body.find("*rk_diffsPrev2").unwrap();
        assert!(update < propagate);
        // the previous-step copy happens before any partition update
        let prev_copy = body.find("rk_diffsPrev2[0] =").unwrap();
        assert!(prev_copy < update);
    }

    #[test]
    fn forward_mode_seeds_the_identity() {
        let mut export = symbolic_export(2, 1);
        export.setup().unwrap();
        let mut block = StatementBlock::new();
        export.get_code(&mut block).unwrap();
        let code = block.render_code(&ExportOptions::default()).unwrap();
        // nx = 2, nu = 1: seed rows start at offset 3, diagonal at 3 and 7
        assert!(code.contains("rk_eta[3] = 1.000000000000000e0;"));
        assert!(code.contains("rk_eta[7] = 1.000000000000000e0;"));
        assert!(code.contains("for (run = 0; run < 6; ++run)"));
    }

    #[test]
    fn declarations_and_code_come_from_the_same_layout() {
        let mut export = symbolic_export(2, 1);
        export.setup().unwrap();
        let mut decls = StatementBlock::new();
        export.get_data_declarations(&mut decls).unwrap();
        let mut protos = StatementBlock::new();
        export.get_function_declarations(&mut protos).unwrap();
        let opts = ExportOptions::default();
        let decl_text = decls.render_code(&opts).unwrap();
        let proto_text = protos.render_code(&opts).unwrap();
        assert!(decl_text.contains("real_t rk_xxx[3];"));
        assert!(decl_text.contains("real_t rk_kkk[4];"));
        assert!(proto_text.contains("acado_integrate"));
        assert!(proto_text.contains("acado_full_rhs"));
        assert!(proto_text.contains("acado_rhs"));
        assert!(proto_text.contains("acado_diffs"));
    }

    #[test]
    fn fold_input_map_explicit_euler_matches_the_closed_form() {
        let lin = LinearInput {
            m: DMatrix::identity(2, 2),
            a: dmatrix![0.0, 1.0; -2.0, -3.0],
            b: dmatrix![0.0; 1.0],
        };
        let tableau = ButcherTableau::explicit_euler();
        let h = 0.1;
        let map = fold_input_map(Some(&tableau), h, &lin).unwrap();
        let expected_phi = DMatrix::identity(2, 2) + h * &lin.a;
        let expected_gamma = h * &lin.b;
        assert_relative_eq!(map.phi, expected_phi, epsilon = 1e-12);
        assert_relative_eq!(map.gamma, expected_gamma, epsilon = 1e-12);
        // the single stage sees the unshifted start state
        assert_relative_eq!(map.stage_phi[0], DMatrix::identity(2, 2), epsilon = 1e-12);
    }

    #[test]
    fn fold_input_map_midpoint_rule_halves_a_decaying_state() {
        // dx = -x, h = 1: k0 = -1, k1 = -(1 - 0.5) = -0.5, x_new = 0.5 * x
        let lin = LinearInput {
            m: DMatrix::identity(1, 1),
            a: dmatrix![-1.0],
            b: DMatrix::zeros(1, 0),
        };
        let map = fold_input_map(Some(&ButcherTableau::erk2()), 1.0, &lin).unwrap();
        assert_relative_eq!(map.phi[(0, 0)], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn fold_input_map_backward_euler_is_the_resolvent() {
        let a = -1.5;
        let lin = LinearInput {
            m: DMatrix::identity(1, 1),
            a: dmatrix![a],
            b: DMatrix::zeros(1, 0),
        };
        let tableau = ButcherTableau::radau_iia(1).unwrap();
        let h = 0.2;
        let map = fold_input_map(Some(&tableau), h, &lin).unwrap();
        assert_relative_eq!(map.phi[(0, 0)], 1.0 / (1.0 - h * a), epsilon = 1e-12);
    }

    #[test]
    fn discrete_maps_fold_to_the_matrices_themselves() {
        let lin = LinearInput {
            m: dmatrix![2.0],
            a: dmatrix![1.0],
            b: dmatrix![4.0],
        };
        let map = fold_input_map(None, 1.0, &lin).unwrap();
        assert_relative_eq!(map.phi[(0, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(map.gamma[(0, 0)], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_mass_matrices_are_rejected() {
        let lin = LinearInput {
            m: DMatrix::zeros(1, 1),
            a: dmatrix![1.0],
            b: dmatrix![1.0],
        };
        assert!(matches!(
            fold_input_map(Some(&ButcherTableau::erk2()), 0.1, &lin),
            Err(CodegenError::InconsistentPartitionDimensions { .. })
        ));
    }

    #[test]
    fn partitioned_setup_resolves_all_three_blocks() {
        let mut export = IntegratorExport::explicit_runge_kutta(ButcherTableau::erk4());
        export
            .set_linear_input(
                DMatrix::identity(1, 1),
                dmatrix![-1.0],
                DMatrix::from_element(1, 1, 1.0),
            )
            .unwrap();
        // nonlinear core over x1, x2 and u
        export
            .set_differential_equation(
                SymbolicFunction::new("acado_rhs", 4, 2),
                SymbolicFunction::new("acado_diffs", 4, 8),
            )
            .unwrap();
        export
            .set_linear_output(
                DMatrix::identity(1, 1),
                dmatrix![-0.5],
                SymbolicFunction::new("acado_out3", 4, 1),
                SymbolicFunction::new("acado_out3_diffs", 4, 4),
            )
            .unwrap();
        export.set_dimensions(4, 1).unwrap();
        export
            .set_grid(Grid::equidistant(0.0, 2.0, 2).unwrap())
            .unwrap();
        export.set_num_steps(vec![2, 4]).unwrap();
        export.setup().unwrap();
        let dims = export.dims().unwrap();
        assert_eq!(dims.nx1, 1);
        assert_eq!(dims.nx2, 2);
        assert_eq!(dims.nx3, 1);
        assert_eq!(dims.nvars, 5);
        assert_eq!(dims.nvars2, 4);

        let mut block = StatementBlock::new();
        export.get_code(&mut block).unwrap();
        let code = block.render_code(&ExportOptions::default()).unwrap();
        assert!(code.contains("acado_out3( rk_xxx, rk_rhsTemp3 );"));
        assert!(code.contains("for (run1 = 0; run1 < 2; ++run1)"));
        assert!(code.contains("for (run1 = 0; run1 < 4; ++run1)"));

        // the coupling term reads the shared call buffer, no side buffer
        // exists for it
        let mut decls = StatementBlock::new();
        export.get_data_declarations(&mut decls).unwrap();
        let decl_text = decls.render_code(&ExportOptions::default()).unwrap();
        assert!(!decl_text.contains("rk_xxx3"));
        assert!(!code.contains("rk_xxx3"));
    }

    #[test]
    fn measurement_outputs_are_evaluated_inside_their_interval() {
        let mut export = symbolic_export(2, 0);
        export
            .setup_output_named(
                vec![Grid::new(vec![0.0, 0.5, 1.0]).unwrap()],
                vec!["meas".into()],
                vec!["meas_diffs".into()],
                vec![2],
            )
            .unwrap();
        export.setup().unwrap();
        let mut block = StatementBlock::new();
        export.get_code(&mut block).unwrap();
        let code = block.render_code(&ExportOptions::default()).unwrap();
        assert!(code.contains("meas( rk_xxx, rk_outputs0 );"));
        assert!(code.contains("meas( rk_xxx, &rk_outputs0[ 2 ] );"));
        assert!(code.contains("meas_diffs( rk_xxx, rk_diffsOutputs0 );"));
    }
}
