//! Factor representation.

use scirs2_core::ndarray::ArrayD;

use crate::error::{InferenceError, Result};

/// A discrete potential function over an ordered set of variables.
///
/// Represents φ(X₁, X₂, ..., Xₖ) → ℝ⁺ where dimension `k` of `vals`
/// enumerates the values of `vars[k]`. Factors are immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Factor {
    vars: Vec<usize>,
    vals: ArrayD<f64>,
}

impl Factor {
    /// Create a new factor.
    ///
    /// Fails when the rank of `vals` differs from the number of variables,
    /// when a variable is repeated, or when an entry is negative or not finite.
    pub fn new(vars: Vec<usize>, vals: ArrayD<f64>) -> Result<Self> {
        if vals.ndim() != vars.len() {
            return Err(InferenceError::DimensionMismatch {
                expected: vec![vars.len()],
                got: vec![vals.ndim()],
            });
        }

        for (i, v) in vars.iter().enumerate() {
            if vars[..i].contains(v) {
                return Err(InferenceError::InvalidFactor(format!(
                    "variable {} appears twice in {:?}",
                    v, vars
                )));
            }
        }

        if let Some(bad) = vals.iter().find(|x| !x.is_finite() || **x < 0.0) {
            return Err(InferenceError::InvalidFactor(format!(
                "entries must be finite and non-negative, found {}",
                bad
            )));
        }

        Ok(Self { vars, vals })
    }

    /// Variables this factor depends on.
    pub fn vars(&self) -> &[usize] {
        &self.vars
    }

    /// Potential values.
    pub fn vals(&self) -> &ArrayD<f64> {
        &self.vals
    }

    /// Consume the factor and return its parts.
    pub fn into_parts(self) -> (Vec<usize>, ArrayD<f64>) {
        (self.vars, self.vals)
    }

    /// Get cardinality of a variable.
    pub fn get_cardinality(&self, var: usize) -> Option<usize> {
        self.vars
            .iter()
            .position(|&v| v == var)
            .map(|idx| self.vals.shape()[idx])
    }

    /// Look up the potential of one assignment given as a variable lookup.
    pub fn value_at<F>(&self, mut assignment: F) -> Result<f64>
    where
        F: FnMut(usize) -> Option<usize>,
    {
        let mut index = Vec::with_capacity(self.vars.len());
        for (k, &var) in self.vars.iter().enumerate() {
            let value = assignment(var).ok_or(InferenceError::VariableNotFound(var))?;
            let card = self.vals.shape()[k];
            if value >= card {
                return Err(InferenceError::Domain(format!(
                    "value {} out of range for variable {} with cardinality {}",
                    value, var, card
                )));
            }
            index.push(value);
        }
        Ok(self.vals[index.as_slice()])
    }
}
