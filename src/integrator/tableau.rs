//! Butcher tableaux.
//!
//! A [ButcherTableau] fixes the stage structure of a Runge-Kutta scheme. The
//! explicit presets carry their classical coefficients; the Gauss-Legendre
//! and Radau IIA families are collocation methods and are constructed from
//! their nodes by exact integration of the Lagrange basis polynomials.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::CodegenError;

/// The `(A, b, c)` coefficient set of a Runge-Kutta scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButcherTableau {
    a: DMatrix<f64>,
    b: DVector<f64>,
    c: DVector<f64>,
}

impl ButcherTableau {
    /// A tableau from explicit coefficients.
    pub fn new(a: DMatrix<f64>, b: DVector<f64>, c: DVector<f64>) -> Result<Self, CodegenError> {
        let s = b.len();
        if a.nrows() != s || a.ncols() != s || c.len() != s || s == 0 {
            return Err(CodegenError::InconsistentPartitionDimensions {
                partition: "Butcher tableau",
                expected: format!("A {0}x{0}, b {0}, c {0}", s),
                got: format!("A {}x{}, c {}", a.nrows(), a.ncols(), c.len()),
            });
        }
        Ok(Self { a, b, c })
    }

    pub fn num_stages(&self) -> usize {
        self.b.len()
    }

    pub fn a(&self, i: usize, j: usize) -> f64 {
        self.a[(i, j)]
    }

    pub fn b(&self, i: usize) -> f64 {
        self.b[i]
    }

    pub fn c(&self, i: usize) -> f64 {
        self.c[i]
    }

    pub fn a_matrix(&self) -> &DMatrix<f64> {
        &self.a
    }

    /// Whether `A` is strictly lower triangular: every stage depends only on
    /// previously computed stages.
    pub fn is_explicit(&self) -> bool {
        let s = self.num_stages();
        (0..s).all(|i| (i..s).all(|j| self.a[(i, j)] == 0.0))
    }

    /// Row `i` of `A` scaled by `h`, for direct use as an IR coefficient row.
    pub fn stage_row(&self, i: usize, h: f64) -> DMatrix<f64> {
        DMatrix::from_fn(1, self.num_stages(), |_, j| h * self.a[(i, j)])
    }

    /// The weight row `h * b`, for the final update statement.
    pub fn weight_row(&self, h: f64) -> DMatrix<f64> {
        DMatrix::from_fn(1, self.num_stages(), |_, j| h * self.b[j])
    }

    /// Collocation tableau over the given distinct nodes: `A[i][j]` is the
    /// integral of the `j`-th Lagrange basis polynomial from 0 to `c[i]`,
    /// `b[j]` its integral over the unit interval.
    pub fn collocation(nodes: &[f64]) -> Result<Self, CodegenError> {
        let s = nodes.len();
        if s == 0 {
            return Err(CodegenError::InvalidGrid(
                "collocation needs at least one node".into(),
            ));
        }
        let mut a = DMatrix::zeros(s, s);
        let mut b = DVector::zeros(s);
        for j in 0..s {
            let poly = lagrange_coefficients(nodes, j);
            for i in 0..s {
                a[(i, j)] = integrate_polynomial(&poly, nodes[i]);
            }
            b[j] = integrate_polynomial(&poly, 1.0);
        }
        Self::new(a, b, DVector::from_column_slice(nodes))
    }

    /// Explicit Euler.
    pub fn explicit_euler() -> Self {
        Self {
            a: DMatrix::zeros(1, 1),
            b: DVector::from_element(1, 1.0),
            c: DVector::zeros(1),
        }
    }

    /// Explicit midpoint rule (order 2).
    pub fn erk2() -> Self {
        Self {
            a: DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 0.5, 0.0]),
            b: DVector::from_column_slice(&[0.0, 1.0]),
            c: DVector::from_column_slice(&[0.0, 0.5]),
        }
    }

    /// Classical third-order Kutta scheme.
    pub fn erk3() -> Self {
        Self {
            a: DMatrix::from_row_slice(3, 3, &[0.0, 0.0, 0.0, 0.5, 0.0, 0.0, -1.0, 2.0, 0.0]),
            b: DVector::from_column_slice(&[1.0 / 6.0, 2.0 / 3.0, 1.0 / 6.0]),
            c: DVector::from_column_slice(&[0.0, 0.5, 1.0]),
        }
    }

    /// The classical fourth-order Runge-Kutta scheme.
    pub fn erk4() -> Self {
        Self {
            a: DMatrix::from_row_slice(
                4,
                4,
                &[
                    0.0, 0.0, 0.0, 0.0, //
                    0.5, 0.0, 0.0, 0.0, //
                    0.0, 0.5, 0.0, 0.0, //
                    0.0, 0.0, 1.0, 0.0,
                ],
            ),
            b: DVector::from_column_slice(&[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0]),
            c: DVector::from_column_slice(&[0.0, 0.5, 0.5, 1.0]),
        }
    }

    /// Gauss-Legendre collocation of order 2, 4, 6 or 8.
    pub fn gauss_legendre(order: usize) -> Result<Self, CodegenError> {
        const SQRT3: f64 = 1.732_050_807_568_877_2;
        const SQRT15: f64 = 3.872_983_346_207_417;
        let nodes: &[f64] = match order {
            2 => &[0.5],
            4 => &[0.5 - SQRT3 / 6.0, 0.5 + SQRT3 / 6.0],
            6 => &[0.5 - SQRT15 / 10.0, 0.5, 0.5 + SQRT15 / 10.0],
            8 => &[
                0.069_431_844_202_973_71,
                0.330_009_478_207_571_9,
                0.669_990_521_792_428_1,
                0.930_568_155_797_026_3,
            ],
            _ => {
                return Err(CodegenError::InvalidGrid(format!(
                    "no Gauss-Legendre tableau of order {}",
                    order
                )))
            }
        };
        Self::collocation(nodes)
    }

    /// Radau IIA collocation of order 1, 3 or 5.
    pub fn radau_iia(order: usize) -> Result<Self, CodegenError> {
        const SQRT6: f64 = 2.449_489_742_783_178;
        let nodes: &[f64] = match order {
            1 => &[1.0],
            3 => &[1.0 / 3.0, 1.0],
            5 => &[(4.0 - SQRT6) / 10.0, (4.0 + SQRT6) / 10.0, 1.0],
            _ => {
                return Err(CodegenError::InvalidGrid(format!(
                    "no Radau IIA tableau of order {}",
                    order
                )))
            }
        };
        Self::collocation(nodes)
    }

    /// Diagonally implicit schemes of order 3, 4 or 5.
    pub fn dirk(order: usize) -> Result<Self, CodegenError> {
        const SQRT3: f64 = 1.732_050_807_568_877_2;
        match order {
            3 => {
                // two-stage SDIRK with gamma = (3 + sqrt(3)) / 6
                let g = (3.0 + SQRT3) / 6.0;
                Self::new(
                    DMatrix::from_row_slice(2, 2, &[g, 0.0, 1.0 - 2.0 * g, g]),
                    DVector::from_column_slice(&[0.5, 0.5]),
                    DVector::from_column_slice(&[g, 1.0 - g]),
                )
            }
            4 => {
                // three-stage scheme of Crouzeix
                let g = (std::f64::consts::PI / 18.0).cos() / SQRT3 + 0.5;
                let d = 1.0 / (6.0 * (2.0 * g - 1.0) * (2.0 * g - 1.0));
                Self::new(
                    DMatrix::from_row_slice(
                        3,
                        3,
                        &[
                            g,
                            0.0,
                            0.0,
                            0.5 - g,
                            g,
                            0.0,
                            2.0 * g,
                            1.0 - 4.0 * g,
                            g,
                        ],
                    ),
                    DVector::from_column_slice(&[d, 1.0 - 2.0 * d, d]),
                    DVector::from_column_slice(&[g, 0.5, 1.0 - g]),
                )
            }
            5 => {
                // five-stage, stiffly accurate scheme with gamma = 1/4
                let b = [
                    25.0 / 24.0,
                    -49.0 / 48.0,
                    125.0 / 16.0,
                    -85.0 / 12.0,
                    0.25,
                ];
                Self::new(
                    DMatrix::from_row_slice(
                        5,
                        5,
                        &[
                            0.25, 0.0, 0.0, 0.0, 0.0, //
                            0.5, 0.25, 0.0, 0.0, 0.0, //
                            17.0 / 50.0, -1.0 / 25.0, 0.25, 0.0, 0.0, //
                            371.0 / 1360.0, -137.0 / 2720.0, 15.0 / 544.0, 0.25, 0.0, //
                            b[0], b[1], b[2], b[3], b[4],
                        ],
                    ),
                    DVector::from_column_slice(&b),
                    DVector::from_column_slice(&[0.25, 0.75, 11.0 / 20.0, 0.5, 1.0]),
                )
            }
            _ => Err(CodegenError::InvalidGrid(format!(
                "no diagonally implicit tableau of order {}",
                order
            ))),
        }
    }
}

/// Coefficients (ascending powers) of the `j`-th Lagrange basis polynomial
/// over the given nodes.
fn lagrange_coefficients(nodes: &[f64], j: usize) -> Vec<f64> {
    let mut poly = vec![1.0];
    for (k, &node) in nodes.iter().enumerate() {
        if k == j {
            continue;
        }
        let denom = nodes[j] - node;
        // multiply by (t - node) / denom
        let mut next = vec![0.0; poly.len() + 1];
        for (d, &coef) in poly.iter().enumerate() {
            next[d] -= coef * node / denom;
            next[d + 1] += coef / denom;
        }
        poly = next;
    }
    poly
}

/// Integral of the polynomial from 0 to `x`.
fn integrate_polynomial(coefficients: &[f64], x: f64) -> f64 {
    let mut acc = 0.0;
    let mut power = x;
    for (d, &coef) in coefficients.iter().enumerate() {
        acc += coef * power / (d as f64 + 1.0);
        power *= x;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Apply one generic Runge-Kutta step of the tableau to a scalar model.
    fn step(tableau: &ButcherTableau, f: impl Fn(f64) -> f64, x0: f64, h: f64) -> (Vec<f64>, f64) {
        let s = tableau.num_stages();
        let mut k = vec![0.0; s];
        for i in 0..s {
            let mut xi = x0;
            for (j, kj) in k.iter().enumerate().take(i) {
                xi += h * tableau.a(i, j) * kj;
            }
            k[i] = f(xi);
        }
        let x_new = x0 + h * (0..s).map(|i| tableau.b(i) * k[i]).sum::<f64>();
        (k, x_new)
    }

    #[test]
    fn test_erk2_tableau_values() {
        let t = ButcherTableau::erk2();
        assert_eq!(t.num_stages(), 2);
        assert_eq!(t.a(1, 0), 0.5);
        assert_eq!(t.b(1), 1.0);
        assert_eq!(t.c(1), 0.5);
        assert!(t.is_explicit());
    }

    #[test]
    fn test_erk2_scenario_decaying_state() {
        // f(x) = -x, h = 1, x0 = 1: k0 = -1, k1 = f(0.5) = -0.5,
        // x_new = 1 + 1 * k1 = 0.5
        let t = ButcherTableau::erk2();
        let (k, x_new) = step(&t, |x| -x, 1.0, 1.0);
        assert_relative_eq!(k[0], -1.0);
        assert_relative_eq!(k[1], -0.5);
        assert_relative_eq!(x_new, 0.5);
    }

    #[test]
    fn test_explicit_presets_are_explicit() {
        for t in [
            ButcherTableau::explicit_euler(),
            ButcherTableau::erk2(),
            ButcherTableau::erk3(),
            ButcherTableau::erk4(),
        ] {
            assert!(t.is_explicit());
            // consistency: b sums to one, c_i matches the row sum of A
            let sum_b: f64 = (0..t.num_stages()).map(|i| t.b(i)).sum();
            assert_relative_eq!(sum_b, 1.0, epsilon = 1e-14);
            for i in 0..t.num_stages() {
                let row: f64 = (0..t.num_stages()).map(|j| t.a(i, j)).sum();
                assert_relative_eq!(row, t.c(i), epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_gauss_legendre_collocation() {
        // midpoint rule
        let gl2 = ButcherTableau::gauss_legendre(2).unwrap();
        assert_relative_eq!(gl2.a(0, 0), 0.5);
        assert_relative_eq!(gl2.b(0), 1.0);

        // classical 2-stage Gauss coefficients
        let gl4 = ButcherTableau::gauss_legendre(4).unwrap();
        assert_relative_eq!(gl4.a(0, 0), 0.25, epsilon = 1e-14);
        assert_relative_eq!(gl4.b(0), 0.5, epsilon = 1e-14);
        assert_relative_eq!(gl4.b(1), 0.5, epsilon = 1e-14);

        assert!(ButcherTableau::gauss_legendre(5).is_err());
    }

    #[test]
    fn test_radau_iia_collocation() {
        // order 1 is backward Euler
        let r1 = ButcherTableau::radau_iia(1).unwrap();
        assert_relative_eq!(r1.a(0, 0), 1.0);

        // order 3: A = [[5/12, -1/12], [3/4, 1/4]], b = [3/4, 1/4]
        let r3 = ButcherTableau::radau_iia(3).unwrap();
        assert_relative_eq!(r3.a(0, 0), 5.0 / 12.0, epsilon = 1e-14);
        assert_relative_eq!(r3.a(0, 1), -1.0 / 12.0, epsilon = 1e-14);
        assert_relative_eq!(r3.b(0), 0.75, epsilon = 1e-14);
        assert_relative_eq!(r3.b(1), 0.25, epsilon = 1e-14);
    }

    #[test]
    fn test_tableau_survives_a_serde_round_trip() {
        let t = ButcherTableau::erk4();
        let json = serde_json::to_string(&t).unwrap();
        let back: ButcherTableau = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert_relative_eq!(back.a(3, 2), 1.0);
    }

    #[test]
    fn test_weight_row_scaling() {
        let t = ButcherTableau::erk2();
        let w = t.weight_row(0.1);
        assert_relative_eq!(w[(0, 1)], 0.1);
        assert_eq!(w[(0, 0)], 0.0);
    }
}
