use super::{bound, simplex_measure};
use crate::evaluator::{Evaluator, FieldBinder, SetupData};
use crate::field::{DataLayout, FieldHandle, FieldStore, FieldTag};
use crate::fill::FillType;
use crate::workset::Workset;
use fefill_traits::FillScalar;
use std::marker::PhantomData;

/// Constant normal flux through the sides of a side set, for one equation.
///
/// The flux integrated over a side is split evenly among the side's nodes and written, with
/// negative sign, into a node-vector field named `"<side set> Neumann"`. Pair it with a
/// [`ScatterResidual`](super::ScatterResidual) of that field in a Neumann graph.
pub struct NeumannFlux<E> {
    side_set: String,
    eq: usize,
    flux: f64,
    tag: FieldTag,
    handle: Option<FieldHandle>,
    marker: PhantomData<fn() -> E>,
}

impl<E: FillType> NeumannFlux<E> {
    pub fn new(side_set: impl Into<String>, eq: usize, flux: f64, nodes_per_cell: usize, num_eqs: usize) -> Self {
        let side_set = side_set.into();
        Self {
            tag: FieldTag::new(
                neumann_field_name(&side_set),
                DataLayout::node_vector(nodes_per_cell, num_eqs),
            ),
            side_set,
            eq,
            flux,
            handle: None,
            marker: PhantomData,
        }
    }
}

/// Name of the field a [`NeumannFlux`] on `side_set` evaluates.
pub fn neumann_field_name(side_set: &str) -> String {
    format!("{} Neumann", side_set)
}

impl<E: FillType> Evaluator<E> for NeumannFlux<E> {
    fn name(&self) -> &str {
        "Neumann Flux"
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
        let handle = bound(self.handle, "Neumann Flux")?;
        let partition = workset.partition()?;
        let field = fields.get_mut(handle);
        field.zero(workset.num_cells);

        let neq = partition.num_eqs;
        if let Some(sides) = partition.side_sets.get(&self.side_set) {
            for side in sides {
                let points: Vec<&[f64]> = side
                    .side_nodes
                    .iter()
                    .map(|&node| partition.node_coords(side.cell, node))
                    .collect();
                let nodal_flux = self.flux * simplex_measure(&points) / side.side_nodes.len() as f64;
                let values = field.cell_mut(side.cell);
                for &node in &side.side_nodes {
                    let k = node * neq + self.eq;
                    values[k] = values[k].clone() - E::ScalarT::constant(nodal_flux);
                }
            }
        }
        Ok(())
    }
}
