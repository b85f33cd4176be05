//! The narrow interface through which the assembly driver sees the mesh.
//!
//! Mesh generation and file input live elsewhere. [`MeshDiscretization`] is a simple in-memory
//! implementation that a mesh reader (or a test) fills with connectivity.
use fefill_sparse::nalgebra_sparse::pattern::SparsityPattern;
use fefill_sparse::{pattern_from_element_dofs, DofMap, MapMismatch};
use itertools::Itertools;
use std::collections::BTreeMap;

/// Owned local DOF index per equation for every node of a node set.
pub type NodeSetDofs = BTreeMap<String, Vec<Vec<usize>>>;

/// One side of a cell lying on a side set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideData {
    /// Cell index within the partition.
    pub cell: usize,
    /// Local indices of the cell nodes on the side.
    pub side_nodes: Vec<usize>,
}

/// A batch of cells of one element block, processed together by an evaluator graph.
#[derive(Debug, Clone)]
pub struct WorksetPartition {
    pub element_block: String,
    /// Selects the bulk (and Neumann) graph that applies to the partition.
    pub physics_index: usize,
    pub nodes_per_cell: usize,
    pub num_eqs: usize,
    pub spatial_dim: usize,
    /// Overlapping local node index of every cell node, stored `(cell, node)` row-major.
    pub cell_nodes: Vec<usize>,
    /// Coordinates of every cell node, stored `(cell, node, dim)` row-major.
    pub coords: Vec<f64>,
    pub side_sets: BTreeMap<String, Vec<SideData>>,
}

impl WorksetPartition {
    pub fn num_cells(&self) -> usize {
        if self.nodes_per_cell == 0 {
            0
        } else {
            self.cell_nodes.len() / self.nodes_per_cell
        }
    }

    /// Number of local DOFs of a cell.
    pub fn dofs_per_cell(&self) -> usize {
        self.nodes_per_cell * self.num_eqs
    }

    pub fn cell_nodes(&self, cell: usize) -> &[usize] {
        &self.cell_nodes[self.nodes_per_cell * cell..self.nodes_per_cell * (cell + 1)]
    }

    /// Overlapping local DOF of equation `eq` at local node `node` of `cell`.
    pub fn dof(&self, cell: usize, node: usize, eq: usize) -> usize {
        self.cell_nodes[self.nodes_per_cell * cell + node] * self.num_eqs + eq
    }

    /// Overlapping local DOFs of a cell in `(node, eq)` order.
    pub fn cell_dofs(&self, cell: usize) -> impl Iterator<Item = usize> + '_ {
        let neq = self.num_eqs;
        self.cell_nodes(cell)
            .iter()
            .flat_map(move |&node| (0..neq).map(move |eq| node * neq + eq))
    }

    pub fn node_coords(&self, cell: usize, node: usize) -> &[f64] {
        let offset = (self.nodes_per_cell * cell + node) * self.spatial_dim;
        &self.coords[offset..offset + self.spatial_dim]
    }

    pub fn has_sides(&self) -> bool {
        self.side_sets.values().any(|sides| !sides.is_empty())
    }
}

pub trait Discretization: Send + Sync {
    fn num_equations(&self) -> usize;

    /// Partitions in a fixed, deterministic order.
    fn partitions(&self) -> &[WorksetPartition];

    fn owned_node_map(&self) -> &DofMap;

    fn overlap_node_map(&self) -> &DofMap;

    fn owned_dof_map(&self) -> &DofMap;

    fn overlap_dof_map(&self) -> &DofMap;

    fn owned_jacobian_pattern(&self) -> &SparsityPattern;

    fn overlap_jacobian_pattern(&self) -> &SparsityPattern;

    fn node_sets(&self) -> &NodeSetDofs;

    /// Largest number of cells in a partition.
    fn max_workset_size(&self) -> usize {
        self.partitions()
            .iter()
            .map(WorksetPartition::num_cells)
            .max()
            .unwrap_or(0)
    }
}

/// Serial, in-memory discretization of a mesh made of element blocks.
///
/// Overlapping node indices are assigned in order of first appearance while traversing the
/// element blocks, so the overlapping distribution is a permutation of the owned one.
#[derive(Debug, Clone)]
pub struct MeshDiscretization {
    num_eqs: usize,
    partitions: Vec<WorksetPartition>,
    owned_nodes: DofMap,
    overlap_nodes: DofMap,
    owned_dofs: DofMap,
    overlap_dofs: DofMap,
    owned_pattern: SparsityPattern,
    overlap_pattern: SparsityPattern,
    node_sets: NodeSetDofs,
}

#[derive(Debug, Clone)]
struct ElementBlock {
    name: String,
    physics_index: usize,
    nodes_per_cell: usize,
    connectivity: Vec<usize>,
    side_sets: BTreeMap<String, Vec<(usize, Vec<usize>)>>,
}

/// Incrementally describes a [`MeshDiscretization`].
#[derive(Debug, Clone)]
pub struct MeshDiscretizationBuilder {
    coords: Vec<Vec<f64>>,
    num_eqs: usize,
    workset_size: usize,
    blocks: Vec<ElementBlock>,
    node_sets: BTreeMap<String, Vec<usize>>,
}

impl MeshDiscretizationBuilder {
    /// Starts a discretization of the given nodes with `num_eqs` unknowns per node.
    pub fn new(node_coords: Vec<Vec<f64>>, num_eqs: usize) -> Self {
        Self {
            coords: node_coords,
            num_eqs,
            workset_size: usize::MAX,
            blocks: Vec::new(),
            node_sets: BTreeMap::new(),
        }
    }

    /// Maximum number of cells per workset partition.
    pub fn with_workset_size(mut self, workset_size: usize) -> Self {
        self.workset_size = workset_size.max(1);
        self
    }

    /// Adds an element block. `connectivity` lists the global nodes of each cell.
    pub fn with_element_block(
        mut self,
        name: impl Into<String>,
        physics_index: usize,
        connectivity: Vec<Vec<usize>>,
    ) -> Self {
        let nodes_per_cell = connectivity.first().map(Vec::len).unwrap_or(0);
        assert!(
            connectivity.iter().all(|cell| cell.len() == nodes_per_cell),
            "All cells of an element block must have the same number of nodes"
        );
        self.blocks.push(ElementBlock {
            name: name.into(),
            physics_index,
            nodes_per_cell,
            connectivity: connectivity.into_iter().flatten().collect(),
            side_sets: BTreeMap::new(),
        });
        self
    }

    /// Marks the side `side_nodes` (local node indices) of block cell `cell` as part of a side set.
    ///
    /// Applies to the most recently added element block.
    ///
    /// # Panics
    ///
    /// Panics if no element block has been added yet.
    pub fn with_side(mut self, side_set: impl Into<String>, cell: usize, side_nodes: Vec<usize>) -> Self {
        let block = self
            .blocks
            .last_mut()
            .expect("An element block must be added before its sides");
        block
            .side_sets
            .entry(side_set.into())
            .or_default()
            .push((cell, side_nodes));
        self
    }

    pub fn with_node_set(mut self, name: impl Into<String>, nodes: Vec<usize>) -> Self {
        self.node_sets.insert(name.into(), nodes);
        self
    }

    pub fn build(self) -> Result<MeshDiscretization, MapMismatch> {
        let num_nodes = self.coords.len();
        let neq = self.num_eqs;
        let spatial_dim = self.coords.first().map(Vec::len).unwrap_or(0);

        let overlap_global_nodes: Vec<usize> = self
            .blocks
            .iter()
            .flat_map(|block| block.connectivity.iter().copied())
            .unique()
            .collect();
        let overlap_nodes = DofMap::try_from_global_ids(overlap_global_nodes)?;
        let owned_nodes = DofMap::contiguous(num_nodes);

        let dofs_of = |nodes: &DofMap| -> Result<DofMap, MapMismatch> {
            DofMap::try_from_global_ids(
                nodes
                    .global_ids()
                    .iter()
                    .flat_map(|&node| (0..neq).map(move |eq| node * neq + eq))
                    .collect(),
            )
        };
        let owned_dofs = dofs_of(&owned_nodes)?;
        let overlap_dofs = dofs_of(&overlap_nodes)?;

        let mut partitions = Vec::new();
        for block in &self.blocks {
            let n = block.nodes_per_cell;
            let num_cells = if n == 0 { 0 } else { block.connectivity.len() / n };
            let mut start = 0;
            while start < num_cells {
                let end = num_cells.min(start.saturating_add(self.workset_size));
                let global_nodes = &block.connectivity[n * start..n * end];
                let cell_nodes = global_nodes
                    .iter()
                    .map(|&node| {
                        overlap_nodes
                            .local_id(node)
                            .ok_or(MapMismatch::MissingGlobalId { global_id: node })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let coords = global_nodes
                    .iter()
                    .flat_map(|&node| self.coords[node].iter().copied())
                    .collect();
                let mut side_sets = BTreeMap::new();
                for (name, sides) in &block.side_sets {
                    let local_sides: Vec<SideData> = sides
                        .iter()
                        .filter(|(cell, _)| (start..end).contains(cell))
                        .map(|(cell, side_nodes)| SideData {
                            cell: cell - start,
                            side_nodes: side_nodes.clone(),
                        })
                        .collect();
                    if !local_sides.is_empty() {
                        side_sets.insert(name.clone(), local_sides);
                    }
                }
                partitions.push(WorksetPartition {
                    element_block: block.name.clone(),
                    physics_index: block.physics_index,
                    nodes_per_cell: n,
                    num_eqs: neq,
                    spatial_dim,
                    cell_nodes,
                    coords,
                    side_sets,
                });
                start = end;
            }
        }

        let overlap_cells: Vec<Vec<usize>> = partitions
            .iter()
            .flat_map(|p| (0..p.num_cells()).map(move |c| p.cell_dofs(c).collect()))
            .collect();
        let overlap_pattern =
            pattern_from_element_dofs(overlap_dofs.len(), overlap_cells.iter().map(Vec::as_slice));

        let owned_cells: Vec<Vec<usize>> = overlap_cells
            .iter()
            .map(|cell| {
                cell.iter()
                    .map(|&dof| {
                        let global_id = overlap_dofs.global_id(dof);
                        owned_dofs
                            .local_id(global_id)
                            .ok_or(MapMismatch::MissingGlobalId { global_id })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<_, _>>()?;
        let owned_pattern = pattern_from_element_dofs(owned_dofs.len(), owned_cells.iter().map(Vec::as_slice));

        let mut node_sets = NodeSetDofs::new();
        for (name, nodes) in &self.node_sets {
            let dofs = nodes
                .iter()
                .map(|&node| {
                    (0..neq)
                        .map(|eq| {
                            let global_id = node * neq + eq;
                            owned_dofs
                                .local_id(global_id)
                                .ok_or(MapMismatch::MissingGlobalId { global_id })
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()?;
            node_sets.insert(name.clone(), dofs);
        }

        Ok(MeshDiscretization {
            num_eqs: neq,
            partitions,
            owned_nodes,
            overlap_nodes,
            owned_dofs,
            overlap_dofs,
            owned_pattern,
            overlap_pattern,
            node_sets,
        })
    }
}

impl Discretization for MeshDiscretization {
    fn num_equations(&self) -> usize {
        self.num_eqs
    }

    fn partitions(&self) -> &[WorksetPartition] {
        &self.partitions
    }

    fn owned_node_map(&self) -> &DofMap {
        &self.owned_nodes
    }

    fn overlap_node_map(&self) -> &DofMap {
        &self.overlap_nodes
    }

    fn owned_dof_map(&self) -> &DofMap {
        &self.owned_dofs
    }

    fn overlap_dof_map(&self) -> &DofMap {
        &self.overlap_dofs
    }

    fn owned_jacobian_pattern(&self) -> &SparsityPattern {
        &self.owned_pattern
    }

    fn overlap_jacobian_pattern(&self) -> &SparsityPattern {
        &self.overlap_pattern
    }

    fn node_sets(&self) -> &NodeSetDofs {
        &self.node_sets
    }
}
