use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayViewD, Axis, Dimension, IxDyn, Zip};

use crate::model::NodeId;
use crate::{BnError, Result};

/// Tables with at least this many entries are combined in parallel.
const PARALLEL_COMBINE_STATES: usize = 1 << 14;

/// Value (label index) of some variables.
pub type Assignment = BTreeMap<NodeId, usize>;

/// How a variable is removed from a potential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marginalization {
    Sum,
    Max,
}

/// Dense table over an ordered, duplicate-free scope of variables.
///
/// Axis `i` of the table is indexed by the labels of `scope[i]`. A potential
/// with an empty scope is a scalar.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "PotentialRepr", into = "PotentialRepr")]
pub struct Potential {
    scope: Vec<NodeId>,
    values: ArrayD<f64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PotentialRepr {
    scope: Vec<NodeId>,
    values: ArrayD<f64>,
}

impl TryFrom<PotentialRepr> for Potential {
    type Error = BnError;
    fn try_from(p: PotentialRepr) -> Result<Self> {
        Self::new(p.scope, p.values)
    }
}

impl From<Potential> for PotentialRepr {
    fn from(p: Potential) -> Self {
        Self {
            scope: p.scope,
            values: p.values,
        }
    }
}

impl Potential {
    /// Checked constructor: one axis per scope variable, no repeated
    /// variable, finite non-negative values.
    pub fn new(scope: Vec<NodeId>, values: ArrayD<f64>) -> Result<Self> {
        if values.ndim() != scope.len() {
            return Err(BnError::InvalidArgument(format!(
                "scope {:?} has {} variables but the table has {} dimensions",
                scope,
                scope.len(),
                values.ndim()
            )));
        }
        for (i, v) in scope.iter().enumerate() {
            if scope[..i].contains(v) {
                return Err(BnError::InvalidArgument(format!(
                    "variable {} appears twice in scope {:?}",
                    v, scope
                )));
            }
        }
        if values.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(BnError::InvalidArgument(
                "potential values must be finite and non-negative".to_owned(),
            ));
        }
        Ok(Self { scope, values })
    }

    /// Build from values given in row-major order.
    pub fn from_vec(scope: Vec<NodeId>, shape: &[usize], values: Vec<f64>) -> Result<Self> {
        let len = values.len();
        let values =
            ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| BnError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![len],
            })?;
        Self::new(scope, values)
    }

    /// Scalar potential.
    pub fn constant(value: f64) -> Self {
        Self::filled(Vec::new(), &[], value)
    }

    /// Potential holding `value` everywhere. Unlike [`Potential::new`], any
    /// value is accepted (log-domain tables hold negative entries).
    pub fn filled(scope: Vec<NodeId>, shape: &[usize], value: f64) -> Self {
        Self {
            scope,
            values: ArrayD::from_elem(IxDyn(shape), value),
        }
    }

    /// Neutral element of the product.
    pub fn unit() -> Self {
        Self::constant(1.0)
    }

    pub fn uniform(var: NodeId, size: usize) -> Self {
        Self {
            scope: vec![var],
            values: ArrayD::from_elem(IxDyn(&[size]), 1.0 / size as f64),
        }
    }

    /// Hard observation of `label` on `var`.
    pub fn one_hot(var: NodeId, size: usize, label: usize) -> Result<Self> {
        if label >= size {
            return Err(BnError::InvalidArgument(format!(
                "label {} out of range for a variable with {} labels",
                label, size
            )));
        }
        let mut values = ArrayD::zeros(IxDyn(&[size]));
        values[[label].as_slice()] = 1.0;
        Ok(Self {
            scope: vec![var],
            values,
        })
    }

    pub fn scope(&self) -> &[NodeId] {
        self.scope.as_slice()
    }
    pub fn values(&self) -> ArrayViewD<'_, f64> {
        self.values.view()
    }
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }
    pub fn contains(&self, var: NodeId) -> bool {
        self.scope.contains(&var)
    }
    pub fn domain_size(&self, var: NodeId) -> Option<usize> {
        self.axis_of(var).map(|ax| self.values.shape()[ax])
    }
    /// Number of entries of the table.
    pub fn nb_states(&self) -> usize {
        self.values.len()
    }
    fn axis_of(&self, var: NodeId) -> Option<usize> {
        self.scope.iter().position(|v| *v == var)
    }

    /// View of the table with axes ordered along `scope` (a superset of
    /// this potential's scope), missing variables inserted as length-1 axes.
    fn aligned(&self, scope: &[NodeId]) -> Result<ArrayViewD<'_, f64>> {
        let positions = self
            .scope
            .iter()
            .map(|v| {
                scope.iter().position(|s| s == v).ok_or_else(|| {
                    BnError::InvalidArgument(format!("variable {} missing from {:?}", v, scope))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut order: Vec<usize> = (0..self.scope.len()).collect();
        order.sort_by_key(|i| positions[*i]);
        let mut view = self.values.view().permuted_axes(order.as_slice());
        for (i, v) in scope.iter().enumerate() {
            if !self.scope.contains(v) {
                view.insert_axis_inplace(Axis(i));
            }
        }
        Ok(view)
    }

    /// Pointwise combination of two potentials over the union of their scopes.
    ///
    /// The resulting scope is `self.scope` followed by the variables of
    /// `other` that `self` does not have.
    pub fn combine_with<F>(&self, other: &Potential, f: F) -> Result<Potential>
    where
        F: Fn(f64, f64) -> f64 + Send + Sync,
    {
        let mut scope = self.scope.clone();
        let mut shape = self.values.shape().to_vec();
        for (v, size) in other.scope.iter().zip(other.values.shape()) {
            match self.domain_size(*v) {
                Some(s) if s != *size => {
                    return Err(BnError::ShapeMismatch {
                        expected: vec![s],
                        got: vec![*size],
                    });
                }
                Some(_) => {}
                None => {
                    scope.push(*v);
                    shape.push(*size);
                }
            }
        }
        let a = self.aligned(&scope)?;
        let b = other.aligned(&scope)?;
        let mismatch = || BnError::ShapeMismatch {
            expected: shape.clone(),
            got: other.shape().to_vec(),
        };
        let a = a.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
        let b = b.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
        let zip = Zip::from(&a).and(&b);
        let values = if a.len() >= PARALLEL_COMBINE_STATES {
            zip.par_map_collect(|x, y| f(*x, *y))
        } else {
            zip.map_collect(|x, y| f(*x, *y))
        };
        Ok(Potential { scope, values })
    }

    pub fn product(&self, other: &Potential) -> Result<Potential> {
        self.combine_with(other, |x, y| x * y)
    }

    /// Product of all potentials, combined left to right.
    pub fn product_all<'a>(potentials: impl IntoIterator<Item = &'a Potential>) -> Result<Self> {
        potentials
            .into_iter()
            .try_fold(Self::unit(), |acc, p| acc.product(p))
    }

    /// Pointwise quotient, with 0/0 = 0.
    pub fn divide(&self, other: &Potential) -> Result<Potential> {
        self.combine_with(other, |x, y| if y == 0.0 { 0.0 } else { x / y })
    }

    /// Remove `vars` (those present) from the scope.
    pub fn eliminate(&self, vars: &[NodeId], how: Marginalization) -> Potential {
        let mut axes: Vec<usize> = vars.iter().filter_map(|v| self.axis_of(*v)).collect();
        axes.sort_unstable();
        axes.dedup();
        let mut scope = self.scope.clone();
        let mut values = self.values.clone();
        for ax in axes.into_iter().rev() {
            values = match how {
                Marginalization::Sum => values.sum_axis(Axis(ax)),
                Marginalization::Max => {
                    values.fold_axis(Axis(ax), f64::NEG_INFINITY, |m, x| m.max(*x))
                }
            };
            scope.remove(ax);
        }
        Potential { scope, values }
    }

    pub fn sum_out(&self, vars: &[NodeId]) -> Potential {
        self.eliminate(vars, Marginalization::Sum)
    }

    pub fn max_out(&self, vars: &[NodeId]) -> Potential {
        self.eliminate(vars, Marginalization::Max)
    }

    /// Eliminate every variable not in `keep`, the result being ordered as
    /// `keep`. Fails if some variable of `keep` is not in the scope.
    pub fn marginalize_to(&self, keep: &[NodeId], how: Marginalization) -> Result<Potential> {
        let drop: Vec<NodeId> = self
            .scope
            .iter()
            .filter(|v| !keep.contains(v))
            .copied()
            .collect();
        self.eliminate(&drop, how).reorder(keep)
    }

    /// Same potential with axes ordered as `scope` (a permutation of the
    /// current scope).
    pub fn reorder(&self, scope: &[NodeId]) -> Result<Potential> {
        if scope.len() != self.scope.len() {
            return Err(BnError::InvalidArgument(format!(
                "{:?} is not a permutation of {:?}",
                scope, self.scope
            )));
        }
        let view = self.aligned(scope)?;
        Ok(Potential {
            scope: scope.to_vec(),
            values: view.as_standard_layout().into_owned(),
        })
    }

    pub fn total(&self) -> f64 {
        self.values.sum()
    }

    pub fn max_value(&self) -> f64 {
        self.values.fold(f64::NEG_INFINITY, |m, x| m.max(*x))
    }

    /// Scaled copy summing to one. A zero mass can only come from
    /// contradictory observations.
    pub fn normalize(&self) -> Result<Potential> {
        let total = self.total();
        if total <= 0.0 || !total.is_finite() {
            return Err(BnError::IncompatibleEvidence);
        }
        Ok(Potential {
            scope: self.scope.clone(),
            values: self.values.mapv(|x| x / total),
        })
    }

    /// Pointwise base-2 logarithm (0 maps to -inf).
    pub fn log2(&self) -> Potential {
        Potential {
            scope: self.scope.clone(),
            values: self.values.mapv(f64::log2),
        }
    }

    fn index_of(&self, assignment: &Assignment) -> Result<Vec<usize>> {
        self.scope
            .iter()
            .zip(self.values.shape())
            .map(|(v, size)| match assignment.get(v) {
                None => Err(BnError::UndefinedElement(format!(
                    "variable {} is not assigned",
                    v
                ))),
                Some(label) if label >= size => Err(BnError::InvalidArgument(format!(
                    "label {} out of range for variable {}",
                    label, v
                ))),
                Some(label) => Ok(*label),
            })
            .collect()
    }

    /// Entry of the table selected by `assignment` (which may assign more
    /// variables than the scope).
    pub fn value_at(&self, assignment: &Assignment) -> Result<f64> {
        let idx = self.index_of(assignment)?;
        Ok(self.values[idx.as_slice()])
    }

    /// Fix the variables of `assignment` that belong to the scope.
    pub fn restrict(&self, assignment: &Assignment) -> Result<Potential> {
        let mut fixed: Vec<(usize, usize)> = Vec::new();
        for (ax, (v, size)) in self.scope.iter().zip(self.values.shape()).enumerate() {
            if let Some(label) = assignment.get(v) {
                if label >= size {
                    return Err(BnError::InvalidArgument(format!(
                        "label {} out of range for variable {}",
                        label, v
                    )));
                }
                fixed.push((ax, *label));
            }
        }
        let mut scope = self.scope.clone();
        let mut values = self.values.view();
        for (ax, label) in fixed.into_iter().rev() {
            values.index_axis_inplace(Axis(ax), label);
            scope.remove(ax);
        }
        Ok(Potential {
            scope,
            values: values.to_owned(),
        })
    }

    /// Labels of the largest entry (first one in row-major order on ties)
    /// and its value. `None` if the table is empty.
    pub fn argmax(&self) -> Option<(Assignment, f64)> {
        let mut best: Option<(IxDyn, f64)> = None;
        for (idx, x) in self.values.indexed_iter() {
            if best.as_ref().map_or(true, |(_, b)| *x > *b) {
                best = Some((idx, *x));
            }
        }
        best.map(|(idx, x)| {
            let assignment = self
                .scope
                .iter()
                .copied()
                .zip(idx.slice().iter().copied())
                .collect();
            (assignment, x)
        })
    }

    /// Observed label if this is a one-variable potential with exactly one
    /// non-zero entry.
    pub fn hard_label(&self) -> Option<usize> {
        if self.scope.len() != 1 {
            return None;
        }
        let mut non_zero = self
            .values
            .iter()
            .enumerate()
            .filter(|(_, x)| **x != 0.0)
            .map(|(i, _)| i);
        match (non_zero.next(), non_zero.next()) {
            (Some(label), None) => Some(label),
            _ => None,
        }
    }
}
