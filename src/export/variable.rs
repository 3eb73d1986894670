//! Named, shaped, optionally sparse handles to slots in generated memory.
//!
//! A [Variable] describes a scalar, vector or matrix living in the exported
//! code. Its shape is fixed for the lifetime of the descriptor. Elements may
//! carry a static pattern ([Element]): a structural zero never produces a
//! statement, and a compile-time constant is embedded as a literal. The
//! pattern is generation-time metadata only; the generated code never
//! branches on it.

use nalgebra::DMatrix;

use super::index::Index;

/// Static knowledge about a single element of a [Variable].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    /// Value only known at run time of the generated code
    Unknown,
    /// Known to be zero, independent of runtime values
    Zero,
    /// Known numeric constant, embedded as a literal
    Constant(f64),
}

impl Element {
    /// Whether the element never contributes a value
    pub fn is_zero(&self) -> bool {
        matches!(self, Element::Zero)
    }
}

/// A named, shaped, optionally sparse slot in generated memory.
///
/// Views created with [Variable::block] and friends share the base name and
/// stride of the original descriptor, so element references address the
/// backing buffer directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    rows: usize,
    cols: usize,
    /// Leading dimension of the backing buffer
    stride: usize,
    row_offset: usize,
    col_offset: usize,
    /// Transpose flag applied at the point of use
    transposed: bool,
    /// Additional symbolic flat offset into the backing buffer
    index: Option<Index>,
    /// Static pattern in storage orientation, row major
    pattern: Option<Vec<Element>>,
}

impl Variable {
    /// A variable with fully opaque content.
    pub fn new(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        Self {
            name: name.into(),
            rows,
            cols,
            stride: cols,
            row_offset: 0,
            col_offset: 0,
            transposed: false,
            index: None,
            pattern: None,
        }
    }

    /// A column vector with opaque content.
    pub fn vector(name: impl Into<String>, rows: usize) -> Self {
        Self::new(name, rows, 1)
    }

    /// A variable whose every element is known at generation time.
    ///
    /// Zeros in `values` become structural zeros; everything else becomes an
    /// embedded constant. The name never appears in generated code.
    pub fn constant(name: impl Into<String>, values: &DMatrix<f64>) -> Self {
        let pattern = values
            .row_iter()
            .flat_map(|row| {
                row.iter()
                    .map(|&v| {
                        if v == 0.0 {
                            Element::Zero
                        } else {
                            Element::Constant(v)
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            name: name.into(),
            rows: values.nrows(),
            cols: values.ncols(),
            stride: values.ncols(),
            row_offset: 0,
            col_offset: 0,
            transposed: false,
            index: None,
            pattern: Some(pattern),
        }
    }

    /// A variable whose every element is a known constant, with zeros kept
    /// as embedded literals instead of structural zeros. Used when a runtime
    /// buffer must be written completely.
    pub fn dense_constant(name: impl Into<String>, values: &DMatrix<f64>) -> Self {
        let mut v = Self::constant(name, values);
        v.pattern = Some(
            values
                .row_iter()
                .flat_map(|row| row.iter().map(|&e| Element::Constant(e)).collect::<Vec<_>>())
                .collect(),
        );
        v
    }

    /// A 1x1 compile-time constant.
    pub fn literal(value: f64) -> Self {
        Self::constant("lit", &DMatrix::from_element(1, 1, value))
    }

    /// A constant identity pattern, padded with structural zeros when the
    /// shape is not square.
    pub fn identity(rows: usize, cols: usize) -> Self {
        let mut m = DMatrix::zeros(rows, cols);
        for i in 0..rows.min(cols) {
            m[(i, i)] = 1.0;
        }
        Self::constant("eye", &m)
    }

    /// The logical number of rows, respecting the transpose flag.
    pub fn rows(&self) -> usize {
        if self.transposed {
            self.cols
        } else {
            self.rows
        }
    }

    /// The logical number of columns, respecting the transpose flag.
    pub fn cols(&self) -> usize {
        if self.transposed {
            self.rows
        } else {
            self.cols
        }
    }

    /// The base name of the backing buffer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of elements of the backing view.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every element is known at generation time.
    pub fn is_given(&self) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|p| p.iter().all(|e| !matches!(e, Element::Unknown)))
    }

    /// The same slot, transposed at the point of use.
    pub fn transposed(&self) -> Self {
        let mut v = self.clone();
        v.transposed = !v.transposed;
        v
    }

    /// A rectangular view into this variable.
    ///
    /// Offsets are in logical (post-transpose) coordinates of `self`.
    pub fn block(&self, row: usize, col: usize, rows: usize, cols: usize) -> Self {
        // map logical coordinates back to storage
        let (srow, scol, srows, scols) = if self.transposed {
            (col, row, cols, rows)
        } else {
            (row, col, rows, cols)
        };
        assert!(
            srow + srows <= self.rows && scol + scols <= self.cols,
            "block ({},{})+{}x{} out of range for {} ({}x{})",
            row,
            col,
            rows,
            cols,
            self.name,
            self.rows(),
            self.cols()
        );
        let pattern = self.pattern.as_ref().map(|p| {
            let mut sub = Vec::with_capacity(srows * scols);
            for i in 0..srows {
                for j in 0..scols {
                    sub.push(p[(srow + i) * self.cols + scol + j]);
                }
            }
            sub
        });
        Self {
            name: self.name.clone(),
            rows: srows,
            cols: scols,
            stride: self.stride,
            row_offset: self.row_offset + srow,
            col_offset: self.col_offset + scol,
            transposed: self.transposed,
            index: self.index.clone(),
            pattern,
        }
    }

    /// A single-row view.
    pub fn row(&self, row: usize) -> Self {
        self.block(row, 0, 1, self.cols())
    }

    /// A single-column view.
    pub fn col(&self, col: usize) -> Self {
        self.block(0, col, self.rows(), 1)
    }

    /// A 1x1 view of one element.
    pub fn element(&self, row: usize, col: usize) -> Self {
        self.block(row, col, 1, 1)
    }

    /// The same slot with an additional symbolic flat offset, used when the
    /// buffer is addressed by a loop counter of the generated code.
    pub fn indexed(&self, index: Index) -> Self {
        let mut v = self.clone();
        v.index = Some(index);
        v
    }

    /// Static knowledge about the element at logical position `(row, col)`.
    pub fn element_kind(&self, row: usize, col: usize) -> Element {
        let (si, sj) = if self.transposed {
            (col, row)
        } else {
            (row, col)
        };
        match &self.pattern {
            Some(p) => p[si * self.cols + sj],
            None => Element::Unknown,
        }
    }

    /// Whether the element at `(row, col)` is a structural zero.
    pub fn is_structural_zero(&self, row: usize, col: usize) -> bool {
        self.element_kind(row, col).is_zero()
    }

    /// The constant value at `(row, col)`, if known.
    pub fn constant_value(&self, row: usize, col: usize) -> Option<f64> {
        match self.element_kind(row, col) {
            Element::Constant(v) => Some(v),
            Element::Zero => Some(0.0),
            Element::Unknown => None,
        }
    }

    /// Render a reference to the element at logical `(row, col)`.
    ///
    /// Constants are embedded as literals with `precision` significant
    /// digits; everything else becomes an indexed buffer access.
    pub fn render_element(&self, row: usize, col: usize, precision: usize) -> String {
        match self.element_kind(row, col) {
            Element::Constant(v) => format_real(v, precision),
            Element::Zero => format_real(0.0, precision),
            Element::Unknown => {
                let (si, sj) = if self.transposed {
                    (col, row)
                } else {
                    (row, col)
                };
                let flat = (self.row_offset + si) * self.stride + self.col_offset + sj;
                match &self.index {
                    Some(idx) => format!("{}[{}]", self.name, idx.shifted(flat as i64)),
                    None => format!("{}[{}]", self.name, flat),
                }
            }
        }
    }

    /// Render the data declaration for this variable's backing buffer.
    /// Always an array, matching the indexed element references.
    pub fn render_declaration(&self, real_type: &str) -> String {
        format!("{} {}[{}];", real_type, self.name, self.rows * self.cols)
    }
}

/// Format a numeric literal with the requested number of significant digits.
pub fn format_real(value: f64, precision: usize) -> String {
    format!("{:.*e}", precision.saturating_sub(1), value)
}
