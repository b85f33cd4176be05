use crate::error::AssemblyError;
use crate::evaluator::{Evaluator, FieldBinder, SetupData};
use crate::field::{DataLayout, FieldStore, FieldTag};
use crate::fill::FillType;
use crate::workset::Workset;
use fefill_traits::FillScalar;
use std::marker::PhantomData;

/// Prescribed value of a Dirichlet condition.
#[derive(Debug, Clone, PartialEq)]
pub enum DirichletValue {
    Constant(f64),
    /// Taken from the scalar parameter library, so that tangent fills see its derivative.
    Parameter(String),
    /// Piecewise linear in time, constant beyond the first and last sample.
    TimeTable { times: Vec<f64>, values: Vec<f64> },
}

impl DirichletValue {
    fn resolve<E: FillType>(&self, workset: &Workset<'_>) -> Result<E::ScalarT, AssemblyError> {
        match self {
            DirichletValue::Constant(value) => Ok(E::ScalarT::constant(*value)),
            DirichletValue::Parameter(name) => {
                let param = workset
                    .param_lib()?
                    .get(name)
                    .ok_or_else(|| AssemblyError::UnknownParameter(name.clone()))?;
                Ok(E::parameter(param))
            }
            DirichletValue::TimeTable { times, values } => {
                Ok(E::ScalarT::constant(interpolate(times, values, workset.current_time)))
            }
        }
    }
}

fn interpolate(times: &[f64], values: &[f64], t: f64) -> f64 {
    let n = times.len().min(values.len());
    if n == 0 {
        return 0.0;
    }
    if t <= times[0] {
        return values[0];
    }
    for i in 1..n {
        if t <= times[i] {
            let s = (t - times[i - 1]) / (times[i] - times[i - 1]);
            return values[i - 1] + s * (values[i] - values[i - 1]);
        }
    }
    values[n - 1]
}

/// Tag evaluated by the Dirichlet condition on equation `offset` of a node set.
pub fn dirichlet_tag(node_set: &str, offset: usize) -> FieldTag {
    FieldTag::new(format!("Dirichlet {} dof {}", node_set, offset), DataLayout::dummy())
}

/// Tag evaluated by the strong Dirichlet condition on equation `offset` of a node set.
pub fn strong_dirichlet_tag(node_set: &str, offset: usize) -> FieldTag {
    FieldTag::new(format!("SDBC {} dof {}", node_set, offset), DataLayout::dummy())
}

/// Dirichlet condition on one equation of a node set, applied by row replacement.
///
/// Runs on the owned accumulators after export: the residual row becomes `x - value` and the
/// Jacobian row becomes `j_coeff` times the identity row.
pub struct DirichletBc<E> {
    node_set: String,
    offset: usize,
    value: DirichletValue,
    tag: FieldTag,
    marker: PhantomData<fn() -> E>,
}

impl<E: FillType> DirichletBc<E> {
    pub fn new(node_set: impl Into<String>, offset: usize, value: DirichletValue) -> Self {
        let node_set = node_set.into();
        Self {
            tag: dirichlet_tag(&node_set, offset),
            node_set,
            offset,
            value,
            marker: PhantomData,
        }
    }
}

fn node_set_dofs<'a>(workset: &Workset<'a>, node_set: &str, offset: usize) -> Result<Vec<usize>, AssemblyError> {
    let nodes = workset
        .node_sets()?
        .get(node_set)
        .ok_or_else(|| AssemblyError::WorksetMismatch {
            evaluation: workset.evaluation,
            reason: format!("unknown node set \"{}\"", node_set),
        })?;
    nodes
        .iter()
        .map(|dofs| {
            dofs.get(offset).copied().ok_or_else(|| AssemblyError::WorksetMismatch {
                evaluation: workset.evaluation,
                reason: format!("equation offset {} out of range", offset),
            })
        })
        .collect()
}

impl<E: FillType> Evaluator<E> for DirichletBc<E> {
    fn name(&self) -> &str {
        "Dirichlet"
    }

    fn evaluated_fields(&self) -> Vec<FieldTag> {
        vec![self.tag.clone()]
    }

    fn dependent_fields(&self) -> Vec<FieldTag> {
        Vec::new()
    }

    fn post_registration_setup(&mut self, _setup: &SetupData, _binder: &FieldBinder<'_>) -> eyre::Result<()> {
        Ok(())
    }

    fn evaluate_fields(&mut self, workset: &mut Workset<'_>, _fields: &mut FieldStore<E::ScalarT>) -> eyre::Result<()> {
        let value = self.value.resolve::<E>(workset)?;
        for dof in node_set_dofs(workset, &self.node_set, self.offset)? {
            E::apply_dirichlet(workset, dof, &value)?;
        }
        Ok(())
    }
}

/// Strong Dirichlet condition: writes the prescribed value into the solution itself and
/// turns the constrained rows into identity rows with zero residual.
pub struct StrongDirichletBc<E> {
    node_set: String,
    offset: usize,
    value: DirichletValue,
    tag: FieldTag,
    marker: PhantomData<fn() -> E>,
}

impl<E: FillType> StrongDirichletBc<E> {
    pub fn new(node_set: impl Into<String>, offset: usize, value: DirichletValue) -> Self {
        let node_set = node_set.into();
        Self {
            tag: strong_dirichlet_tag(&node_set, offset),
            node_set,
            offset,
            value,
            marker: PhantomData,
        }
    }
}

impl<E: FillType> Evaluator<E> for StrongDirichletBc<E> {
    fn name(&self) -> &str {
        "Strong Dirichlet"
    }

    fn evaluated_fields(&self) -> Vec<FieldTag> {
        vec![self.tag.clone()]
    }

    fn dependent_fields(&self) -> Vec<FieldTag> {
        Vec::new()
    }

    fn post_registration_setup(&mut self, _setup: &SetupData, _binder: &FieldBinder<'_>) -> eyre::Result<()> {
        Ok(())
    }

    fn evaluate_fields(&mut self, workset: &mut Workset<'_>, _fields: &mut FieldStore<E::ScalarT>) -> eyre::Result<()> {
        let value = self.value.resolve::<E>(workset)?.value();
        for dof in node_set_dofs(workset, &self.node_set, self.offset)? {
            workset.x.to_mut()[dof] = value;
            E::apply_strong_dirichlet(workset, dof)?;
        }
        Ok(())
    }
}
