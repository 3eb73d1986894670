//! The fused arithmetic statement IR.
//!
//! An [ArithmeticStatement] describes one operation of the form
//! `lhs <op0> rhs1 <op1> rhs2 <op2> rhs3` and lowers directly to a block of
//! loop-unrolled target-language statements. Every pruning decision (which
//! output cells get a statement, which terms survive a contraction) is made
//! here, at generation time, from the static patterns of the operands.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::variable::{format_real, Element, Variable};
use super::ExportOptions;
use crate::error::CodegenError;

/// Operators usable in the slots of an arithmetic statement.
///
/// `op0` must be one of `Assign`, `AddAssign`, `SubAssign`; `op1` one of
/// `Add`, `Subtract`, `Multiply` or `Undefined`; `op2` one of `Add`,
/// `Subtract` or `Undefined`, and only legal when `op1` is `Multiply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Assign,
    AddAssign,
    SubAssign,
    Add,
    Subtract,
    Multiply,
    Undefined,
}

impl Operator {
    fn assign_token(&self) -> Option<&'static str> {
        match self {
            Operator::Assign => Some("="),
            Operator::AddAssign => Some("+="),
            Operator::SubAssign => Some("-="),
            _ => None,
        }
    }
}

/// One fused generation-time operation.
///
/// Constructed on demand while assembling a routine body, appended to a
/// statement block and never mutated afterwards. Cloning yields a fully
/// independent deep copy that emits identical text.
#[derive(Debug, Clone, PartialEq)]
pub struct ArithmeticStatement {
    lhs: Variable,
    rhs1: Variable,
    rhs2: Option<Variable>,
    rhs3: Option<Variable>,
    op0: Operator,
    op1: Operator,
    op2: Operator,
}

impl ArithmeticStatement {
    /// The general form `lhs <op0> rhs1 <op1> rhs2 <op2> rhs3`.
    pub fn new(
        lhs: Variable,
        op0: Operator,
        rhs1: Variable,
        op1: Operator,
        rhs2: Option<Variable>,
        op2: Operator,
        rhs3: Option<Variable>,
    ) -> Self {
        Self {
            lhs,
            rhs1,
            rhs2,
            rhs3,
            op0,
            op1,
            op2,
        }
    }

    /// `lhs = rhs1`
    pub fn assign(lhs: Variable, rhs1: Variable) -> Self {
        Self::new(
            lhs,
            Operator::Assign,
            rhs1,
            Operator::Undefined,
            None,
            Operator::Undefined,
            None,
        )
    }

    /// `lhs += rhs1`
    pub fn add_assign(lhs: Variable, rhs1: Variable) -> Self {
        Self::new(
            lhs,
            Operator::AddAssign,
            rhs1,
            Operator::Undefined,
            None,
            Operator::Undefined,
            None,
        )
    }

    /// `lhs -= rhs1`
    pub fn sub_assign(lhs: Variable, rhs1: Variable) -> Self {
        Self::new(
            lhs,
            Operator::SubAssign,
            rhs1,
            Operator::Undefined,
            None,
            Operator::Undefined,
            None,
        )
    }

    /// `lhs <op0> rhs1 <op1> rhs2` with an elementwise `op1`.
    pub fn elementwise(
        lhs: Variable,
        op0: Operator,
        rhs1: Variable,
        op1: Operator,
        rhs2: Variable,
    ) -> Self {
        Self::new(lhs, op0, rhs1, op1, Some(rhs2), Operator::Undefined, None)
    }

    /// `lhs <op0> rhs1 * rhs2`
    pub fn product(lhs: Variable, op0: Operator, rhs1: Variable, rhs2: Variable) -> Self {
        Self::new(
            lhs,
            op0,
            rhs1,
            Operator::Multiply,
            Some(rhs2),
            Operator::Undefined,
            None,
        )
    }

    /// `lhs <op0> rhs1 * rhs2 <op2> rhs3` (fused multiply-accumulate).
    pub fn multiply_add(
        lhs: Variable,
        op0: Operator,
        rhs1: Variable,
        rhs2: Variable,
        op2: Operator,
        rhs3: Variable,
    ) -> Self {
        Self::new(
            lhs,
            op0,
            rhs1,
            Operator::Multiply,
            Some(rhs2),
            op2,
            Some(rhs3),
        )
    }

    /// Number of rows of the statement's result.
    pub fn num_rows(&self) -> usize {
        self.lhs.rows()
    }

    /// Number of columns of the statement's result.
    pub fn num_cols(&self) -> usize {
        self.lhs.cols()
    }

    /// Whether `rhs1` acts as a scalar scaling of `rhs2`.
    fn is_scalar_product(&self) -> bool {
        self.op1 == Operator::Multiply && self.rhs1.rows() == 1 && self.rhs1.cols() == 1
    }

    /// Check the operator/shape configuration.
    pub fn validate(&self) -> Result<(), CodegenError> {
        if self.op0.assign_token().is_none() {
            return Err(CodegenError::UnsupportedStatementShape(format!(
                "{:?} is not an assignment operator",
                self.op0
            )));
        }
        for i in 0..self.lhs.rows() {
            for j in 0..self.lhs.cols() {
                if !matches!(self.lhs.element_kind(i, j), Element::Unknown) {
                    return Err(CodegenError::UnsupportedStatementShape(
                        "assignment to a compile-time constant".into(),
                    ));
                }
            }
        }
        match self.op1 {
            Operator::Undefined => {
                if self.rhs2.is_some() || self.rhs3.is_some() || self.op2 != Operator::Undefined {
                    return Err(CodegenError::UnsupportedStatementShape(
                        "rhs2/rhs3 given without an op1".into(),
                    ));
                }
                self.require_same_shape(&self.rhs1)?;
            }
            Operator::Add | Operator::Subtract => {
                if self.op2 != Operator::Undefined || self.rhs3.is_some() {
                    return Err(CodegenError::UnsupportedStatementShape(
                        "op2 is only legal when op1 is a multiplication".into(),
                    ));
                }
                let rhs2 = self.require_rhs2()?;
                self.require_same_shape(&self.rhs1)?;
                self.require_same_shape(rhs2)?;
            }
            Operator::Multiply => {
                let rhs2 = self.require_rhs2()?;
                if self.is_scalar_product() {
                    self.require_same_shape(rhs2)?;
                } else {
                    if self.rhs1.cols() != rhs2.rows() {
                        return Err(CodegenError::UnsupportedStatementShape(format!(
                            "inner dimensions do not match: {}x{} * {}x{}",
                            self.rhs1.rows(),
                            self.rhs1.cols(),
                            rhs2.rows(),
                            rhs2.cols()
                        )));
                    }
                    if self.lhs.rows() != self.rhs1.rows() || self.lhs.cols() != rhs2.cols() {
                        return Err(CodegenError::UnsupportedStatementShape(format!(
                            "result shape {}x{} does not fit {}x{} * {}x{}",
                            self.lhs.rows(),
                            self.lhs.cols(),
                            self.rhs1.rows(),
                            self.rhs1.cols(),
                            rhs2.rows(),
                            rhs2.cols()
                        )));
                    }
                }
                match self.op2 {
                    Operator::Undefined => {
                        if self.rhs3.is_some() {
                            return Err(CodegenError::UnsupportedStatementShape(
                                "rhs3 given without an op2".into(),
                            ));
                        }
                    }
                    Operator::Add | Operator::Subtract => {
                        let rhs3 = self.rhs3.as_ref().ok_or_else(|| {
                            CodegenError::UnsupportedStatementShape("op2 given without rhs3".into())
                        })?;
                        self.require_same_shape(rhs3)?;
                    }
                    _ => {
                        return Err(CodegenError::UnsupportedStatementShape(format!(
                            "{:?} is not a valid op2",
                            self.op2
                        )))
                    }
                }
            }
            _ => {
                return Err(CodegenError::UnsupportedStatementShape(format!(
                    "{:?} is not a valid op1",
                    self.op1
                )))
            }
        }
        Ok(())
    }

    fn require_rhs2(&self) -> Result<&Variable, CodegenError> {
        self.rhs2.as_ref().ok_or_else(|| {
            CodegenError::UnsupportedStatementShape("op1 given without rhs2".into())
        })
    }

    fn require_same_shape(&self, other: &Variable) -> Result<(), CodegenError> {
        if self.lhs.rows() != other.rows() || self.lhs.cols() != other.cols() {
            return Err(CodegenError::UnsupportedStatementShape(format!(
                "elementwise operands must agree in shape: {}x{} vs {}x{}",
                self.lhs.rows(),
                self.lhs.cols(),
                other.rows(),
                other.cols()
            )));
        }
        Ok(())
    }

    /// Export the data declaration of the statement. Arithmetic statements
    /// own no data, so nothing is emitted; the entry point exists to keep
    /// declaration/code emission as matched pairs.
    pub fn export_data_declaration(
        &self,
        _target: &mut dyn std::fmt::Write,
        _options: &ExportOptions,
    ) -> Result<(), CodegenError> {
        Ok(())
    }

    /// Export the unrolled statements into the caller-supplied target.
    ///
    /// The text is rendered completely before anything is written: a failed
    /// call leaves the target untouched.
    pub fn export_code(
        &self,
        target: &mut dyn std::fmt::Write,
        options: &ExportOptions,
    ) -> Result<(), CodegenError> {
        let rendered = self.render(options)?;
        target.write_str(&rendered)?;
        Ok(())
    }

    /// Render the statement block to a string.
    pub fn render(&self, options: &ExportOptions) -> Result<String, CodegenError> {
        self.validate()?;
        let mut out = String::new();
        match self.op1 {
            Operator::Multiply => self.render_multiply(&mut out, options)?,
            _ => self.render_elementwise(&mut out, options)?,
        }
        Ok(out)
    }

    fn render_elementwise(
        &self,
        out: &mut String,
        options: &ExportOptions,
    ) -> Result<(), CodegenError> {
        let op0 = self.op0.assign_token().unwrap_or("=");
        for i in 0..self.lhs.rows() {
            for j in 0..self.lhs.cols() {
                let e1 = self.rhs1.element_kind(i, j);
                let e2 = self.rhs2.as_ref().map(|r| r.element_kind(i, j));
                let expr = match (e1.is_zero(), e2.map(|e| e.is_zero())) {
                    // copy form
                    (true, None) => continue,
                    (false, None) => self.rhs1.render_element(i, j, options.precision),
                    // elementwise add/subtract
                    (true, Some(true)) => continue,
                    (false, Some(true)) => self.rhs1.render_element(i, j, options.precision),
                    (zero1, Some(false)) => {
                        let rhs2 = self.rhs2.as_ref().expect("checked by validate");
                        let negate = self.op1 == Operator::Subtract;
                        let second = match rhs2.constant_value(i, j) {
                            Some(c) if negate => format_real(-c, options.precision),
                            Some(c) => format_real(c, options.precision),
                            None if negate => {
                                format!("-{}", rhs2.render_element(i, j, options.precision))
                            }
                            None => rhs2.render_element(i, j, options.precision),
                        };
                        if zero1 {
                            second
                        } else if second.starts_with('-') {
                            format!(
                                "{} - {}",
                                self.rhs1.render_element(i, j, options.precision),
                                &second[1..]
                            )
                        } else {
                            format!(
                                "{} + {}",
                                self.rhs1.render_element(i, j, options.precision),
                                second
                            )
                        }
                    }
                };
                writeln!(
                    out,
                    "{} {} {};",
                    self.lhs.render_element(i, j, options.precision),
                    op0,
                    expr
                )?;
            }
        }
        Ok(())
    }

    fn render_multiply(&self, out: &mut String, options: &ExportOptions) -> Result<(), CodegenError> {
        let op0 = self.op0.assign_token().unwrap_or("=");
        let rhs2 = self.rhs2.as_ref().expect("checked by validate");
        let scalar = self.is_scalar_product();
        let inner = if scalar { 1 } else { self.rhs1.cols() };
        for i in 0..self.lhs.rows() {
            for j in 0..self.lhs.cols() {
                let mut terms: Vec<String> = Vec::new();
                for k in 0..inner {
                    let (ai, ak, bi, bj) = if scalar { (0, 0, i, j) } else { (i, k, k, j) };
                    if self.rhs1.is_structural_zero(ai, ak) || rhs2.is_structural_zero(bi, bj) {
                        continue;
                    }
                    terms.push(render_term(
                        &self.rhs1, ai, ak, rhs2, bi, bj, options.precision,
                    ));
                }
                let tail = match (self.op2, self.rhs3.as_ref()) {
                    (Operator::Add, Some(r3)) if !r3.is_structural_zero(i, j) => {
                        Some(r3.render_element(i, j, options.precision))
                    }
                    (Operator::Subtract, Some(r3)) if !r3.is_structural_zero(i, j) => {
                        Some(match r3.constant_value(i, j) {
                            Some(c) => format_real(-c, options.precision),
                            None => format!("-{}", r3.render_element(i, j, options.precision)),
                        })
                    }
                    _ => None,
                };
                if terms.is_empty() && tail.is_none() {
                    continue;
                }
                let mut expr = String::new();
                for term in terms.iter().chain(tail.iter()) {
                    if expr.is_empty() {
                        expr.push_str(term);
                    } else if let Some(stripped) = term.strip_prefix('-') {
                        expr.push_str(" - ");
                        expr.push_str(stripped);
                    } else {
                        expr.push_str(" + ");
                        expr.push_str(term);
                    }
                }
                writeln!(
                    out,
                    "{} {} {};",
                    self.lhs.render_element(i, j, options.precision),
                    op0,
                    expr
                )?;
            }
        }
        Ok(())
    }
}

/// Render one product term, folding constants and eliding unit factors.
#[allow(clippy::too_many_arguments)]
fn render_term(
    a: &Variable,
    ai: usize,
    aj: usize,
    b: &Variable,
    bi: usize,
    bj: usize,
    precision: usize,
) -> String {
    match (a.constant_value(ai, aj), b.constant_value(bi, bj)) {
        (Some(ca), Some(cb)) => format_real(ca * cb, precision),
        (Some(ca), None) => {
            let factor = b.render_element(bi, bj, precision);
            if ca == 1.0 {
                factor
            } else if ca == -1.0 {
                format!("-{}", factor)
            } else {
                format!("{}*{}", format_real(ca, precision), factor)
            }
        }
        (None, Some(cb)) => {
            let factor = a.render_element(ai, aj, precision);
            if cb == 1.0 {
                factor
            } else if cb == -1.0 {
                format!("-{}", factor)
            } else {
                format!("{}*{}", factor, format_real(cb, precision))
            }
        }
        (None, None) => format!(
            "{}*{}",
            a.render_element(ai, aj, precision),
            b.render_element(bi, bj, precision)
        ),
    }
}
