//! Scalar and distributed parameter libraries.
use crate::discretization::Discretization;
use crate::error::AssemblyError;
use fefill_sparse::{CombineMode, DofMap, Exporter, Importer, MapMismatch};
use log::debug;
use nalgebra::{DMatrix, DVector};
use num_dual::DualDVec64;
use std::collections::BTreeMap;

/// A named scalar parameter.
///
/// The same parameter presents a plain value to value-only fills and may additionally carry a
/// seeded dual value that tangent fills differentiate against.
#[derive(Debug, Clone)]
pub struct ScalarParameter {
    name: String,
    value: f64,
    tangent: Option<DualDVec64>,
}

impl ScalarParameter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// The seeded value, if the parameter is currently a tangent direction.
    pub fn tangent(&self) -> Option<&DualDVec64> {
        self.tangent.as_ref()
    }
}

/// A parameter value handed to a fill operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamValue {
    pub name: String,
    pub base_value: f64,
}

impl ParamValue {
    pub fn new(name: impl Into<String>, base_value: f64) -> Self {
        Self {
            name: name.into(),
            base_value,
        }
    }
}

pub type ParamVec = Vec<ParamValue>;

#[derive(Debug, Clone, Default)]
pub struct ParamLib {
    params: BTreeMap<String, ScalarParameter>,
}

impl ParamLib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter, or resets the value of an existing one.
    pub fn add(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        self.params.insert(
            name.clone(),
            ScalarParameter {
                name,
                value,
                tangent: None,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ScalarParameter> {
        self.params.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Sets the value seen by every fill type and drops any tangent seed.
    pub fn set_real_value_for_all_types(&mut self, name: &str, value: f64) -> Result<(), AssemblyError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| AssemblyError::UnknownParameter(name.to_string()))?;
        param.value = value;
        param.tangent = None;
        Ok(())
    }

    /// Applies every entry of every parameter vector.
    pub fn set_all(&mut self, params: &[ParamVec]) -> Result<(), AssemblyError> {
        for param in params.iter().flatten() {
            self.set_real_value_for_all_types(&param.name, param.base_value)?;
        }
        Ok(())
    }

    pub fn set_tangent(&mut self, name: &str, seeded: DualDVec64) -> Result<(), AssemblyError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| AssemblyError::UnknownParameter(name.to_string()))?;
        param.tangent = Some(seeded);
        Ok(())
    }

    pub fn clear_tangents(&mut self) {
        self.params.values_mut().for_each(|p| p.tangent = None);
    }
}

/// A parameter field with one value per mesh node.
#[derive(Debug, Clone)]
pub struct DistParam {
    name: String,
    owned_map: DofMap,
    overlap_map: DofMap,
    importer: Importer,
    exporter: Exporter,
    vector: DVector<f64>,
    overlapped: DVector<f64>,
    lower_bounds: DVector<f64>,
    upper_bounds: DVector<f64>,
    /// Overlapping local index of the parameter at each `(cell, node)` of each workset.
    workset_elem_dofs: Vec<Vec<usize>>,
}

impl DistParam {
    /// Creates a nodal parameter over the nodes of a discretization, initialized to `value`.
    pub fn nodal(name: impl Into<String>, disc: &dyn Discretization, value: f64) -> Result<Self, MapMismatch> {
        let owned_map = disc.owned_node_map().clone();
        let overlap_map = disc.overlap_node_map().clone();
        let importer = Importer::new(&owned_map, &overlap_map)?;
        let exporter = Exporter::new(&overlap_map, &owned_map)?;
        let workset_elem_dofs = disc
            .partitions()
            .iter()
            .map(|partition| partition.cell_nodes.clone())
            .collect();
        let n = owned_map.len();
        Ok(Self {
            name: name.into(),
            vector: DVector::repeat(n, value),
            overlapped: DVector::repeat(overlap_map.len(), value),
            lower_bounds: DVector::repeat(n, f64::NEG_INFINITY),
            upper_bounds: DVector::repeat(n, f64::INFINITY),
            owned_map,
            overlap_map,
            importer,
            exporter,
            workset_elem_dofs,
        })
    }

    pub fn with_bounds(mut self, lower: DVector<f64>, upper: DVector<f64>) -> Result<Self, MapMismatch> {
        self.owned_map.check_len(lower.len())?;
        self.owned_map.check_len(upper.len())?;
        self.lower_bounds = lower;
        self.upper_bounds = upper;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owned_map(&self) -> &DofMap {
        &self.owned_map
    }

    pub fn overlap_map(&self) -> &DofMap {
        &self.overlap_map
    }

    pub fn vector(&self) -> &DVector<f64> {
        &self.vector
    }

    pub fn overlapped_vector(&self) -> &DVector<f64> {
        &self.overlapped
    }

    pub fn lower_bounds(&self) -> &DVector<f64> {
        &self.lower_bounds
    }

    pub fn upper_bounds(&self) -> &DVector<f64> {
        &self.upper_bounds
    }

    /// Replaces the owned values and refreshes the overlapping copy. The length never changes.
    pub fn set_vector(&mut self, vector: DVector<f64>) -> Result<(), MapMismatch> {
        self.owned_map.check_len(vector.len())?;
        self.vector = vector;
        self.scatter()
    }

    /// Copies the owned values into the overlapping distribution.
    pub fn scatter(&mut self) -> Result<(), MapMismatch> {
        self.importer.import_vector(&self.vector, &mut self.overlapped)
    }

    pub fn import(&self, owned: &DMatrix<f64>, overlapped: &mut DMatrix<f64>) -> Result<(), MapMismatch> {
        self.importer.import_multivector(owned, overlapped)
    }

    /// Sums overlapping contributions into `owned`.
    pub fn export_add(&self, overlapped: &DMatrix<f64>, owned: &mut DMatrix<f64>) -> Result<(), MapMismatch> {
        self.exporter
            .export_multivector(overlapped, owned, CombineMode::Add)
    }

    /// Parameter indices of the `(cell, node)` entries of a workset.
    pub fn workset_elem_dofs(&self, workset_index: usize) -> &[usize] {
        &self.workset_elem_dofs[workset_index]
    }
}

/// Named distributed parameters, shared between the applications of a coupled problem.
#[derive(Debug, Clone, Default)]
pub struct DistParamLib {
    params: BTreeMap<String, DistParam>,
}

impl DistParamLib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, param: DistParam) {
        debug!("Adding distributed parameter \"{}\"", param.name);
        self.params.insert(param.name.clone(), param);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&DistParam, AssemblyError> {
        self.params
            .get(name)
            .ok_or_else(|| AssemblyError::UnknownDistParam(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut DistParam, AssemblyError> {
        self.params
            .get_mut(name)
            .ok_or_else(|| AssemblyError::UnknownDistParam(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Refreshes the overlapping copies of all parameters.
    pub fn scatter(&mut self) -> Result<(), MapMismatch> {
        self.params.values_mut().try_for_each(DistParam::scatter)
    }
}

/// Name of the library entry that receives the sensitivity with respect to `name`.
pub fn sensitivity_name(name: &str) -> String {
    format!("{}_sensitivity", name)
}
