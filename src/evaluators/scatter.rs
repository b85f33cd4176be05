use super::bound;
use crate::evaluator::{Evaluator, FieldBinder, SetupData};
use crate::field::{DataLayout, FieldHandle, FieldStore, FieldTag};
use crate::fill::FillType;
use crate::workset::Workset;
use std::marker::PhantomData;

/// Accumulates a node-vector residual field into the accumulators of the workset.
///
/// Several scatters may feed the same accumulators, e.g. one for the bulk residual and one
/// for a boundary flux. The evaluated field only orders the scatter in the graph; require it
/// to make the graph run the scatter.
pub struct ScatterResidual<E> {
    residual: FieldTag,
    scatter: FieldTag,
    handle: Option<FieldHandle>,
    marker: PhantomData<fn() -> E>,
}

impl<E: FillType> ScatterResidual<E> {
    pub fn new(residual_name: impl Into<String>, nodes_per_cell: usize, num_eqs: usize) -> Self {
        let residual_name = residual_name.into();
        Self {
            scatter: scatter_tag(&residual_name),
            residual: FieldTag::new(residual_name, DataLayout::node_vector(nodes_per_cell, num_eqs)),
            handle: None,
            marker: PhantomData,
        }
    }

    /// The tag to require for this scatter to run.
    pub fn scatter_tag(&self) -> &FieldTag {
        &self.scatter
    }
}

/// Ordering tag evaluated by the scatter of `residual_name`.
pub fn scatter_tag(residual_name: &str) -> FieldTag {
    FieldTag::new(format!("Scatter {}", residual_name), DataLayout::dummy())
}

impl<E: FillType> Evaluator<E> for ScatterResidual<E> {
    fn name(&self) -> &str {
        "Scatter Residual"
    }

    fn evaluated_fields(&self) -> Vec<FieldTag> {
        vec![self.scatter.clone()]
    }

    fn dependent_fields(&self) -> Vec<FieldTag> {
        vec![self.residual.clone()]
    }

    fn post_registration_setup(&mut self, _setup: &SetupData, binder: &FieldBinder<'_>) -> eyre::Result<()> {
        self.handle = Some(binder.bind(&self.residual)?);
        Ok(())
    }

    fn evaluate_fields(&mut self, workset: &mut Workset<'_>, fields: &mut FieldStore<E::ScalarT>) -> eyre::Result<()> {
        let handle = bound(self.handle, "Scatter Residual")?;
        let field = fields.get(handle);
        for cell in 0..workset.num_cells {
            E::scatter_cell(workset, cell, field.cell(cell))?;
        }
        Ok(())
    }
}
