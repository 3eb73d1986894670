//! Model right-hand-side and output descriptions.
//!
//! The symbolic expression / automatic-differentiation engine is an external
//! collaborator: it materialises expressions as exported routines and hands
//! over a [SymbolicFunction] naming the routine, its dimensions and the
//! static sparsity of its Jacobian. The alternative is a pair of externally
//! compiled function names. Both spellings are captured by [ModelRhs] and
//! resolved exactly once during `setup()`.

use nalgebra::DMatrix;

use super::grid::Grid;

/// Handle to a routine materialised by the external symbolic engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicFunction {
    name: String,
    inputs: usize,
    outputs: usize,
    /// Static dependency pattern of the Jacobian (`outputs` x `inputs`);
    /// zero entries mark derivatives known to vanish.
    dependencies: Option<DMatrix<f64>>,
}

impl SymbolicFunction {
    pub fn new(name: impl Into<String>, inputs: usize, outputs: usize) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs,
            dependencies: None,
        }
    }

    /// Attach the Jacobian dependency pattern reported by the engine.
    pub fn with_dependencies(mut self, dependencies: DMatrix<f64>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn dependencies(&self) -> Option<&DMatrix<f64>> {
        self.dependencies.as_ref()
    }
}

/// The model right-hand side: a symbolic expression pair or a pair of
/// externally compiled routine names.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelRhs {
    Symbolic {
        rhs: SymbolicFunction,
        diffs: SymbolicFunction,
    },
    External {
        name: String,
        diffs_name: String,
    },
}

impl ModelRhs {
    /// The name under which the right-hand side is callable.
    pub fn name(&self) -> &str {
        match self {
            ModelRhs::Symbolic { rhs, .. } => rhs.name(),
            ModelRhs::External { name, .. } => name,
        }
    }

    /// The name under which the derivative evaluation is callable.
    pub fn diffs_name(&self) -> &str {
        match self {
            ModelRhs::Symbolic { diffs, .. } => diffs.name(),
            ModelRhs::External { diffs_name, .. } => diffs_name,
        }
    }

    /// The state dimension, when the symbolic engine reported one.
    pub fn dimension(&self) -> Option<usize> {
        match self {
            ModelRhs::Symbolic { rhs, .. } => Some(rhs.outputs()),
            ModelRhs::External { .. } => None,
        }
    }
}

/// How one auxiliary output function is described.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRhs {
    /// Expression-based, materialised by the symbolic engine
    Symbolic {
        rhs: SymbolicFunction,
        diffs: SymbolicFunction,
    },
    /// Externally compiled routines with an explicit dimension
    External {
        name: String,
        diffs_name: String,
        dim: usize,
    },
    /// Externally compiled routines plus a per-output dependency matrix
    /// used to prune generated sensitivity code
    ExternalWithDependencies {
        name: String,
        diffs_name: String,
        dim: usize,
        dependencies: DMatrix<f64>,
    },
}

impl OutputRhs {
    pub fn name(&self) -> &str {
        match self {
            OutputRhs::Symbolic { rhs, .. } => rhs.name(),
            OutputRhs::External { name, .. } => name,
            OutputRhs::ExternalWithDependencies { name, .. } => name,
        }
    }

    pub fn diffs_name(&self) -> &str {
        match self {
            OutputRhs::Symbolic { diffs, .. } => diffs.name(),
            OutputRhs::External { diffs_name, .. } => diffs_name,
            OutputRhs::ExternalWithDependencies { diffs_name, .. } => diffs_name,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            OutputRhs::Symbolic { rhs, .. } => rhs.outputs(),
            OutputRhs::External { dim, .. } => *dim,
            OutputRhs::ExternalWithDependencies { dim, .. } => *dim,
        }
    }

    pub fn dependencies(&self) -> Option<&DMatrix<f64>> {
        match self {
            OutputRhs::Symbolic { rhs, .. } => rhs.dependencies(),
            OutputRhs::External { .. } => None,
            OutputRhs::ExternalWithDependencies { dependencies, .. } => Some(dependencies),
        }
    }
}

/// One auxiliary output function with its own evaluation grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub grid: Grid,
    pub rhs: OutputRhs,
}
