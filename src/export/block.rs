//! Ordered containers of exportable statements.

use std::fmt::Write as _;

use super::function::Function;
use super::index::Index;
use super::statement::ArithmeticStatement;
use super::variable::Variable;
use super::ExportOptions;
use crate::error::CodegenError;

/// One node of exported code.
#[derive(Debug, Clone)]
pub enum Statement {
    /// A fused arithmetic statement, unrolled on emission
    Arithmetic(ArithmeticStatement),
    /// A line comment
    Comment(String),
    /// A call to a named exported routine
    FunctionCall { name: String, args: Vec<String> },
    /// A data declaration for a variable's backing buffer
    Declaration(Variable),
    /// A fixed-bound counting loop (the only control flow ever emitted)
    Loop {
        index: Index,
        limit: usize,
        body: StatementBlock,
    },
    /// The full definition of an exported routine
    Function(Function),
    /// The forward declaration of an exported routine
    FunctionDeclaration(Function),
    /// A pre-rendered target-language line
    Raw(String),
}

/// An ordered, append-only container of exported statements.
#[derive(Debug, Clone, Default)]
pub struct StatementBlock {
    statements: Vec<Statement>,
}

impl StatementBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement node.
    pub fn add_statement(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    /// Append an arithmetic statement.
    pub fn add_arithmetic(&mut self, statement: ArithmeticStatement) {
        self.statements.push(Statement::Arithmetic(statement));
    }

    /// Append a line comment.
    pub fn add_comment(&mut self, text: impl Into<String>) {
        self.statements.push(Statement::Comment(text.into()));
    }

    /// Append a call to a named routine.
    pub fn add_function_call(&mut self, name: impl Into<String>, args: Vec<String>) {
        self.statements.push(Statement::FunctionCall {
            name: name.into(),
            args,
        });
    }

    /// Append a data declaration.
    pub fn add_declaration(&mut self, variable: Variable) {
        self.statements.push(Statement::Declaration(variable));
    }

    /// Append a pre-rendered line.
    pub fn add_raw(&mut self, line: impl Into<String>) {
        self.statements.push(Statement::Raw(line.into()));
    }

    /// Append every statement of another block.
    pub fn append(&mut self, other: StatementBlock) {
        self.statements.extend(other.statements);
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Statement> {
        self.statements.iter()
    }

    /// Export the executable code of every contained statement.
    pub fn export_code(
        &self,
        target: &mut dyn std::fmt::Write,
        options: &ExportOptions,
    ) -> Result<(), CodegenError> {
        let rendered = self.render_code(options)?;
        target.write_str(&rendered)?;
        Ok(())
    }

    /// Render the executable code to a string.
    pub fn render_code(&self, options: &ExportOptions) -> Result<String, CodegenError> {
        let mut out = String::new();
        for statement in &self.statements {
            match statement {
                Statement::Arithmetic(st) => out.push_str(&st.render(options)?),
                Statement::Comment(text) => writeln!(out, "/* {} */", text)?,
                Statement::FunctionCall { name, args } => {
                    writeln!(out, "{}( {} );", name, args.join(", "))?
                }
                Statement::Declaration(var) => {
                    writeln!(out, "{}", var.render_declaration(&options.real_type))?
                }
                Statement::Loop { index, limit, body } => {
                    let counter = index.counter().unwrap_or("run");
                    writeln!(
                        out,
                        "for ({} = 0; {} < {}; ++{})\n{{",
                        counter, counter, limit, counter
                    )?;
                    out.push_str(&body.render_code(options)?);
                    writeln!(out, "}}")?;
                }
                Statement::Function(f) => f.export_code(&mut out, options)?,
                Statement::FunctionDeclaration(f) => f.export_declaration(&mut out, options)?,
                Statement::Raw(line) => writeln!(out, "{}", line)?,
            }
        }
        Ok(out)
    }

    /// Export the data declarations of every contained statement.
    pub fn export_data_declaration(
        &self,
        target: &mut dyn std::fmt::Write,
        options: &ExportOptions,
    ) -> Result<(), CodegenError> {
        let mut out = String::new();
        for statement in &self.statements {
            match statement {
                Statement::Declaration(var) => {
                    writeln!(out, "{}", var.render_declaration(&options.real_type))?
                }
                Statement::Loop { index, body, .. } => {
                    if let Some(counter) = index.counter() {
                        writeln!(out, "{} {};", options.int_type, counter)?;
                    }
                    body.export_data_declaration(&mut out, options)?;
                }
                _ => {}
            }
        }
        target.write_str(&out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::statement::Operator;
    use crate::export::ExportOptions;

    #[test]
    fn test_block_preserves_order() {
        let mut block = StatementBlock::new();
        block.add_comment("stage 0");
        block.add_function_call("acado_rhs", vec!["rk_xxx".into(), "rk_kkk".into()]);
        block.add_arithmetic(ArithmeticStatement::assign(
            Variable::vector("y", 1),
            Variable::vector("x", 1),
        ));
        let code = block.render_code(&ExportOptions::default()).unwrap();
        let lines: Vec<_> = code.lines().collect();
        assert_eq!(lines[0], "/* stage 0 */");
        assert_eq!(lines[1], "acado_rhs( rk_xxx, rk_kkk );");
        assert_eq!(lines[2], "y[0] = x[0];");
    }

    #[test]
    fn test_loop_emission() {
        let mut body = StatementBlock::new();
        body.add_arithmetic(ArithmeticStatement::product(
            Variable::vector("y", 1),
            Operator::AddAssign,
            Variable::literal(2.0),
            Variable::vector("x", 1),
        ));
        let mut block = StatementBlock::new();
        block.add_statement(Statement::Loop {
            index: Index::named("run"),
            limit: 10,
            body,
        });
        let code = block.render_code(&ExportOptions::default()).unwrap();
        assert!(code.starts_with("for (run = 0; run < 10; ++run)"));
        assert!(code.contains("y[0] +="));
    }
}
