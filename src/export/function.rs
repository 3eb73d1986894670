//! Named exported routines.
//!
//! A [Function] pairs a prototype with a body of exported statements.
//! Declarations and definitions for the same routine are emitted as matched
//! pairs under the same [ExportOptions].

use std::fmt::Write as _;

use super::block::StatementBlock;
use super::index::Index;
use super::variable::Variable;
use super::ExportOptions;
use crate::error::CodegenError;

/// Kind of a function argument in the generated signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// `const real_t*`
    Input,
    /// `real_t*`
    Output,
    /// plain integer by value
    Int,
    /// pointer to mutable integer storage
    IntOutput,
}

/// One argument of an exported routine.
#[derive(Debug, Clone)]
pub struct FunctionArg {
    pub name: String,
    pub kind: ArgKind,
}

impl FunctionArg {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Input,
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Output,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Int,
        }
    }

    pub fn int_output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::IntOutput,
        }
    }
}

/// A named routine of the generated code.
#[derive(Debug, Clone, Default)]
pub struct Function {
    name: String,
    args: Vec<FunctionArg>,
    locals: Vec<Variable>,
    local_indices: Vec<Index>,
    body: StatementBlock,
}

impl Function {
    pub fn new(name: impl Into<String>, args: Vec<FunctionArg>) -> Self {
        Self {
            name: name.into(),
            args,
            locals: Vec::new(),
            local_indices: Vec::new(),
            body: StatementBlock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a routine-local buffer.
    pub fn add_local(&mut self, variable: Variable) {
        self.locals.push(variable);
    }

    /// Declare a routine-local loop counter.
    pub fn add_local_index(&mut self, index: Index) {
        self.local_indices.push(index);
    }

    /// The routine body, for appending statements.
    pub fn body_mut(&mut self) -> &mut StatementBlock {
        &mut self.body
    }

    pub fn body(&self) -> &StatementBlock {
        &self.body
    }

    fn signature(&self, options: &ExportOptions) -> String {
        let args = self
            .args
            .iter()
            .map(|a| match a.kind {
                ArgKind::Input => format!("const {}* {}", options.real_type, a.name),
                ArgKind::Output => format!("{}* {}", options.real_type, a.name),
                ArgKind::Int => format!("{} {}", options.int_type, a.name),
                ArgKind::IntOutput => format!("{}* {}", options.int_type, a.name),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("void {}( {} )", self.name, args)
    }

    /// Export the forward declaration of the routine.
    pub fn export_declaration(
        &self,
        target: &mut dyn std::fmt::Write,
        options: &ExportOptions,
    ) -> Result<(), CodegenError> {
        writeln!(target, "{};", self.signature(options))?;
        Ok(())
    }

    /// Export the full definition of the routine.
    pub fn export_code(
        &self,
        target: &mut dyn std::fmt::Write,
        options: &ExportOptions,
    ) -> Result<(), CodegenError> {
        let mut out = String::new();
        writeln!(out, "{}\n{{", self.signature(options))?;
        for index in &self.local_indices {
            if let Some(counter) = index.counter() {
                writeln!(out, "{} {};", options.int_type, counter)?;
            }
        }
        for local in &self.locals {
            writeln!(out, "{}", local.render_declaration(&options.real_type))?;
        }
        out.push_str(&self.body.render_code(options)?);
        writeln!(out, "}}\n")?;
        target.write_str(&out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::statement::ArithmeticStatement;

    #[test]
    fn test_declaration_and_definition_match() {
        let mut f = Function::new(
            "acado_full_rhs",
            vec![FunctionArg::input("in"), FunctionArg::output("out")],
        );
        f.body_mut().add_arithmetic(ArithmeticStatement::assign(
            Variable::vector("out", 1),
            Variable::vector("in", 1),
        ));
        let options = ExportOptions::default();
        let mut decl = String::new();
        f.export_declaration(&mut decl, &options).unwrap();
        assert_eq!(
            decl,
            "void acado_full_rhs( const real_t* in, real_t* out );\n"
        );
        let mut code = String::new();
        f.export_code(&mut code, &options).unwrap();
        assert!(code.starts_with("void acado_full_rhs( const real_t* in, real_t* out )\n{"));
        assert!(code.contains("out[0] = in[0];"));
    }
}
