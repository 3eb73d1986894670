//! Explicit construction-time registry of integrator schemes.
//!
//! Nothing registers itself: a registry starts empty (or from
//! [IntegratorRegistry::with_default_schemes]) and is populated by plain
//! calls, so the full scheme table is visible at the construction site.

use crate::error::CodegenError;

use super::{ButcherTableau, IntegratorExport, IntegratorKind};

/// Fallible constructor of a fresh, unconfigured exporter.
pub type Constructor = fn() -> Result<IntegratorExport, CodegenError>;

/// A lookup table from scheme tags to exporter constructors.
pub struct IntegratorRegistry {
    entries: Vec<(IntegratorKind, Constructor)>,
}

impl IntegratorRegistry {
    /// A registry with no schemes.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A registry holding every scheme this crate generates, in a fixed
    /// deterministic order.
    pub fn with_default_schemes() -> Self {
        let mut reg = Self::empty();
        let table: [(IntegratorKind, Constructor); 16] = [
            (IntegratorKind::ExplicitEuler, || {
                Ok(IntegratorExport::explicit_runge_kutta(
                    ButcherTableau::explicit_euler(),
                ))
            }),
            (IntegratorKind::ExplicitRungeKutta2, || {
                Ok(IntegratorExport::explicit_runge_kutta(ButcherTableau::erk2()))
            }),
            (IntegratorKind::ExplicitRungeKutta3, || {
                Ok(IntegratorExport::explicit_runge_kutta(ButcherTableau::erk3()))
            }),
            (IntegratorKind::ExplicitRungeKutta4, || {
                Ok(IntegratorExport::explicit_runge_kutta(ButcherTableau::erk4()))
            }),
            (IntegratorKind::GaussLegendre2, || {
                Ok(IntegratorExport::implicit_runge_kutta(
                    ButcherTableau::gauss_legendre(2)?,
                ))
            }),
            (IntegratorKind::GaussLegendre4, || {
                Ok(IntegratorExport::implicit_runge_kutta(
                    ButcherTableau::gauss_legendre(4)?,
                ))
            }),
            (IntegratorKind::GaussLegendre6, || {
                Ok(IntegratorExport::implicit_runge_kutta(
                    ButcherTableau::gauss_legendre(6)?,
                ))
            }),
            (IntegratorKind::GaussLegendre8, || {
                Ok(IntegratorExport::implicit_runge_kutta(
                    ButcherTableau::gauss_legendre(8)?,
                ))
            }),
            (IntegratorKind::RadauIIA1, || {
                Ok(IntegratorExport::implicit_runge_kutta(
                    ButcherTableau::radau_iia(1)?,
                ))
            }),
            (IntegratorKind::RadauIIA3, || {
                Ok(IntegratorExport::implicit_runge_kutta(
                    ButcherTableau::radau_iia(3)?,
                ))
            }),
            (IntegratorKind::RadauIIA5, || {
                Ok(IntegratorExport::implicit_runge_kutta(
                    ButcherTableau::radau_iia(5)?,
                ))
            }),
            (IntegratorKind::DiagonallyImplicitRk3, || {
                Ok(IntegratorExport::implicit_runge_kutta(ButcherTableau::dirk(
                    3,
                )?))
            }),
            (IntegratorKind::DiagonallyImplicitRk4, || {
                Ok(IntegratorExport::implicit_runge_kutta(ButcherTableau::dirk(
                    4,
                )?))
            }),
            (IntegratorKind::DiagonallyImplicitRk5, || {
                Ok(IntegratorExport::implicit_runge_kutta(ButcherTableau::dirk(
                    5,
                )?))
            }),
            (IntegratorKind::DiscreteTime, || {
                Ok(IntegratorExport::discrete_time())
            }),
            (IntegratorKind::Narx, || Ok(IntegratorExport::narx(3))),
        ];
        for (kind, ctor) in table {
            // an empty registry cannot hold duplicates
            let _ = reg.register(kind, ctor);
        }
        reg
    }

    /// Add a scheme under a tag. Registering the same tag twice is refused.
    pub fn register(
        &mut self,
        kind: IntegratorKind,
        ctor: Constructor,
    ) -> Result<(), CodegenError> {
        if self.contains(kind) {
            return Err(CodegenError::AlreadyRegistered(kind));
        }
        self.entries.push((kind, ctor));
        Ok(())
    }

    pub fn contains(&self, kind: IntegratorKind) -> bool {
        self.entries.iter().any(|(k, _)| *k == kind)
    }

    /// Tags in registration order.
    pub fn kinds(&self) -> Vec<IntegratorKind> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    /// Construct a fresh exporter for a registered tag.
    pub fn create(&self, kind: IntegratorKind) -> Result<IntegratorExport, CodegenError> {
        let (_, ctor) = self
            .entries
            .iter()
            .find(|(k, _)| *k == kind)
            .ok_or(CodegenError::UnknownIntegratorType(kind))?;
        ctor()
    }
}

impl Default for IntegratorRegistry {
    fn default() -> Self {
        Self::with_default_schemes()
    }
}
