use super::{bind_all, bound, SOLUTION, SOLUTION_DOT, SOLUTION_DOTDOT};
use crate::evaluator::{Evaluator, FieldBinder, SetupData};
use crate::field::{DataLayout, FieldHandle, FieldStore, FieldTag};
use crate::fill::{FillType, SolutionKind};
use crate::workset::Workset;
use std::marker::PhantomData;

/// Gathers the solution and its time derivatives from the overlapping vectors into fields.
///
/// Each gathered value is seeded with the derivative the fill type calls for, so downstream
/// evaluators differentiate with respect to the local DOFs of the cell.
pub struct GatherSolution<E> {
    tags: Vec<(SolutionKind, FieldTag)>,
    handles: Option<Vec<FieldHandle>>,
    marker: PhantomData<fn() -> E>,
}

impl<E: FillType> GatherSolution<E> {
    /// Gathers x and, depending on `num_time_derivatives`, xdot and xdotdot.
    pub fn new(nodes_per_cell: usize, num_eqs: usize, num_time_derivatives: usize) -> Self {
        let layout = DataLayout::node_vector(nodes_per_cell, num_eqs);
        let kinds = [
            (SolutionKind::X, SOLUTION),
            (SolutionKind::XDot, SOLUTION_DOT),
            (SolutionKind::XDotDot, SOLUTION_DOTDOT),
        ];
        let tags = kinds
            .iter()
            .take(num_time_derivatives.min(2) + 1)
            .map(|&(kind, name)| (kind, FieldTag::new(name, layout.clone())))
            .collect();
        Self {
            tags,
            handles: None,
            marker: PhantomData,
        }
    }
}

impl<E: FillType> Evaluator<E> for GatherSolution<E> {
    fn name(&self) -> &str {
        "Gather Solution"
    }

    fn evaluated_fields(&self) -> Vec<FieldTag> {
        self.tags.iter().map(|(_, tag)| tag.clone()).collect()
    }

    fn dependent_fields(&self) -> Vec<FieldTag> {
        Vec::new()
    }

    fn post_registration_setup(&mut self, _setup: &SetupData, binder: &FieldBinder<'_>) -> eyre::Result<()> {
        let tags: Vec<FieldTag> = self.evaluated_fields();
        self.handles = Some(bind_all(binder, &tags)?);
        Ok(())
    }

    fn evaluate_fields(&mut self, workset: &mut Workset<'_>, fields: &mut FieldStore<E::ScalarT>) -> eyre::Result<()> {
        let handles = bound(self.handles.clone(), "Gather Solution")?;
        let partition = workset.partition()?;
        let workset = &*workset;
        for ((kind, _), &handle) in self.tags.iter().zip(&handles) {
            let field = fields.get_mut(handle);
            for cell in 0..workset.num_cells {
                let values = field.cell_mut(cell);
                for (k, dof) in partition.cell_dofs(cell).enumerate() {
                    values[k] = E::gather_solution(workset, *kind, dof, k)?;
                }
            }
        }
        Ok(())
    }
}

/// Gathers the nodal values of a distributed parameter into a field named after the parameter.
///
/// In a distributed parameter derivative fill with respect to this parameter, the values are
/// seeded with respect to the parameter nodes of the cell.
pub struct GatherDistParam<E> {
    name: String,
    tag: FieldTag,
    handle: Option<FieldHandle>,
    marker: PhantomData<fn() -> E>,
}

impl<E: FillType> GatherDistParam<E> {
    pub fn new(name: impl Into<String>, nodes_per_cell: usize) -> Self {
        let name = name.into();
        Self {
            tag: FieldTag::new(name.clone(), DataLayout::node_scalar(nodes_per_cell)),
            name,
            handle: None,
            marker: PhantomData,
        }
    }
}

impl<E: FillType> Evaluator<E> for GatherDistParam<E> {
    fn name(&self) -> &str {
        "Gather Distributed Parameter"
    }

    fn evaluated_fields(&self) -> Vec<FieldTag> {
        vec![self.tag.clone()]
    }

    fn dependent_fields(&self) -> Vec<FieldTag> {
        Vec::new()
    }

    fn post_registration_setup(&mut self, _setup: &SetupData, binder: &FieldBinder<'_>) -> eyre::Result<()> {
        self.handle = Some(binder.bind(&self.tag)?);
        Ok(())
    }

    fn evaluate_fields(&mut self, workset: &mut Workset<'_>, fields: &mut FieldStore<E::ScalarT>) -> eyre::Result<()> {
        let handle = bound(self.handle, "Gather Distributed Parameter")?;
        let partition = workset.partition()?;
        let param = workset.dist_param_lib()?.get(&self.name)?;
        let elem_dofs = param.workset_elem_dofs(workset.workset_index);
        let values = param.overlapped_vector();
        let npc = partition.nodes_per_cell;
        let field = fields.get_mut(handle);
        for cell in 0..workset.num_cells {
            let cell_values = field.cell_mut(cell);
            for node in 0..npc {
                let value = values[elem_dofs[npc * cell + node]];
                cell_values[node] = E::dist_param_value(workset, &self.name, value, node)?;
            }
        }
        Ok(())
    }
}
