//! Field tags and per-graph field storage.
use fefill_traits::FillScalar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

/// Shape of the per-cell data of a field, e.g. `("Node Vector", [nodes, eqs])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataLayout {
    name: String,
    dims: Vec<usize>,
}

impl DataLayout {
    pub fn new(name: impl Into<String>, dims: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }

    /// One value per cell node.
    pub fn node_scalar(nodes_per_cell: usize) -> Self {
        Self::new("Node Scalar", vec![nodes_per_cell])
    }

    /// `num_eqs` values per cell node.
    pub fn node_vector(nodes_per_cell: usize, num_eqs: usize) -> Self {
        Self::new("Node Vector", vec![nodes_per_cell, num_eqs])
    }

    /// Layout of fields that carry no data and only order evaluators, such as boundary conditions.
    pub fn dummy() -> Self {
        Self::new("Dummy", vec![0])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of scalar values stored per cell.
    pub fn size_per_cell(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Identifies a field in an evaluator graph by name and layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldTag {
    name: String,
    layout: DataLayout,
}

impl FieldTag {
    pub fn new(name: impl Into<String>, layout: DataLayout) -> Self {
        Self {
            name: name.into(),
            layout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }
}

impl Display for FieldTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" ({}: {:?})", self.name, self.layout.name, self.layout.dims)
    }
}

/// Index of a field in the storage of a finalized graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FieldHandle(pub(crate) usize);

/// Values of one field for all cells of the largest workset.
#[derive(Debug, Clone)]
pub struct FieldData<S> {
    values: Vec<S>,
    per_cell: usize,
}

impl<S> Default for FieldData<S> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            per_cell: 0,
        }
    }
}

impl<S: FillScalar> FieldData<S> {
    pub(crate) fn allocate(per_cell: usize, max_cells: usize) -> Self {
        Self {
            values: vec![S::constant(0.0); per_cell * max_cells],
            per_cell,
        }
    }

    pub fn per_cell(&self) -> usize {
        self.per_cell
    }

    pub fn cell(&self, cell: usize) -> &[S] {
        &self.values[self.per_cell * cell..self.per_cell * (cell + 1)]
    }

    pub fn cell_mut(&mut self, cell: usize) -> &mut [S] {
        &mut self.values[self.per_cell * cell..self.per_cell * (cell + 1)]
    }

    /// Resets the first `num_cells` cells to zero.
    pub fn zero(&mut self, num_cells: usize) {
        let n = (self.per_cell * num_cells).min(self.values.len());
        self.values[..n].iter_mut().for_each(|v| *v = S::constant(0.0));
    }

    /// Grows the storage so that it holds at least `num_cells` cells.
    pub fn ensure_cells(&mut self, num_cells: usize) {
        let required = self.per_cell * num_cells;
        if self.values.len() < required {
            self.values.resize(required, S::constant(0.0));
        }
    }
}

/// Storage for all fields of one finalized evaluator graph.
#[derive(Debug, Clone)]
pub struct FieldStore<S> {
    fields: Vec<FieldData<S>>,
}

impl<S> Default for FieldStore<S> {
    fn default() -> Self {
        Self { fields: Vec::new() }
    }
}

impl<S: FillScalar> FieldStore<S> {
    pub(crate) fn new(fields: Vec<FieldData<S>>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, handle: FieldHandle) -> &FieldData<S> {
        &self.fields[handle.0]
    }

    pub fn get_mut(&mut self, handle: FieldHandle) -> &mut FieldData<S> {
        &mut self.fields[handle.0]
    }

    /// Gives mutable access to one field while the remaining fields stay readable.
    ///
    /// While `f` runs, the field behind `handle` reads as empty through the store.
    pub fn with_field_mut<R>(
        &mut self,
        handle: FieldHandle,
        f: impl FnOnce(&mut FieldData<S>, &FieldStore<S>) -> R,
    ) -> R {
        let mut field = std::mem::take(&mut self.fields[handle.0]);
        let result = f(&mut field, self);
        self.fields[handle.0] = field;
        result
    }

    /// Grows every field to hold at least `num_cells` cells.
    pub(crate) fn ensure_cells(&mut self, num_cells: usize) {
        self.fields.iter_mut().for_each(|field| field.ensure_cells(num_cells));
    }
}
