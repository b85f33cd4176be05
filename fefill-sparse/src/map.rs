use nalgebra::{DMatrix, DVector, Scalar};
use nalgebra_sparse::CsrMatrix;
use rustc_hash::FxHashMap;
use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::ops::AddAssign;

/// Maps local indices of a distribution to global DOF identifiers and back.
#[derive(Debug, Clone, PartialEq)]
pub struct DofMap {
    global_ids: Vec<usize>,
    local_ids: FxHashMap<usize, usize>,
}

/// How values transferred into a target distribution are combined with what is already there.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CombineMode {
    /// Sum all contributions into the target entry.
    Add,
    /// Overwrite the target entry.
    Insert,
}

/// Error produced when two distributions or containers are incompatible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapMismatch {
    /// A global id of the source map has no counterpart in the target map.
    MissingGlobalId { global_id: usize },
    /// Container length differs from the size of the map it is supposed to conform to.
    LengthMismatch { expected: usize, actual: usize },
    /// A matrix entry has no slot in the sparsity pattern of the target matrix.
    MissingEntry { row: usize, col: usize },
    /// The map lists the same global id twice.
    DuplicateGlobalId { global_id: usize },
}

impl Display for MapMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingGlobalId { global_id } => {
                write!(f, "global DOF {} is not present in the target distribution", global_id)
            }
            Self::LengthMismatch { expected, actual } => {
                write!(f, "expected length {} to match the distribution, got {}", expected, actual)
            }
            Self::MissingEntry { row, col } => {
                write!(f, "entry ({}, {}) is not part of the sparsity pattern", row, col)
            }
            Self::DuplicateGlobalId { global_id } => {
                write!(f, "global DOF {} appears more than once in the distribution", global_id)
            }
        }
    }
}

impl Error for MapMismatch {}

impl DofMap {
    pub fn try_from_global_ids(global_ids: Vec<usize>) -> Result<Self, MapMismatch> {
        let mut local_ids = FxHashMap::default();
        for (local, &global_id) in global_ids.iter().enumerate() {
            if local_ids.insert(global_id, local).is_some() {
                return Err(MapMismatch::DuplicateGlobalId { global_id });
            }
        }
        Ok(Self { global_ids, local_ids })
    }

    /// A contiguous map with global ids `0 .. n`.
    pub fn contiguous(n: usize) -> Self {
        Self {
            global_ids: (0..n).collect(),
            local_ids: (0..n).map(|i| (i, i)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.global_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global_ids.is_empty()
    }

    pub fn global_ids(&self) -> &[usize] {
        &self.global_ids
    }

    pub fn global_id(&self, local: usize) -> usize {
        self.global_ids[local]
    }

    pub fn local_id(&self, global_id: usize) -> Option<usize> {
        self.local_ids.get(&global_id).copied()
    }

    /// Checks that a container of `len` entries conforms to this map.
    pub fn check_len(&self, len: usize) -> Result<(), MapMismatch> {
        if len == self.len() {
            Ok(())
        } else {
            Err(MapMismatch::LengthMismatch {
                expected: self.len(),
                actual: len,
            })
        }
    }
}

/// Precomputed index translation from one distribution to another.
fn translation(source: &DofMap, target: &DofMap) -> Result<Vec<usize>, MapMismatch> {
    source
        .global_ids()
        .iter()
        .map(|&global_id| {
            target
                .local_id(global_id)
                .ok_or(MapMismatch::MissingGlobalId { global_id })
        })
        .collect()
}

/// Transfers owned data into the overlapping distribution.
///
/// Every overlapping entry receives the value of the owned entry with the same global id.
#[derive(Debug, Clone)]
pub struct Importer {
    source_len: usize,
    /// For each target local index, the source local index.
    source_index: Vec<usize>,
}

impl Importer {
    pub fn new(source: &DofMap, target: &DofMap) -> Result<Self, MapMismatch> {
        Ok(Self {
            source_len: source.len(),
            source_index: translation(target, source)?,
        })
    }

    pub fn target_len(&self) -> usize {
        self.source_index.len()
    }

    pub fn import_vector<T: Scalar>(&self, source: &DVector<T>, target: &mut DVector<T>) -> Result<(), MapMismatch> {
        self.check_lengths(source.len(), target.len())?;
        for (t, &s) in target.iter_mut().zip(&self.source_index) {
            *t = source[s].clone();
        }
        Ok(())
    }

    /// Imports every column of a multivector.
    pub fn import_multivector<T: Scalar>(
        &self,
        source: &DMatrix<T>,
        target: &mut DMatrix<T>,
    ) -> Result<(), MapMismatch> {
        self.check_lengths(source.nrows(), target.nrows())?;
        if source.ncols() != target.ncols() {
            return Err(MapMismatch::LengthMismatch {
                expected: source.ncols(),
                actual: target.ncols(),
            });
        }
        for (mut target_col, source_col) in target.column_iter_mut().zip(source.column_iter()) {
            for (t, &s) in target_col.iter_mut().zip(&self.source_index) {
                *t = source_col[s].clone();
            }
        }
        Ok(())
    }

    fn check_lengths(&self, source: usize, target: usize) -> Result<(), MapMismatch> {
        if source != self.source_len {
            return Err(MapMismatch::LengthMismatch {
                expected: self.source_len,
                actual: source,
            });
        }
        if target != self.target_len() {
            return Err(MapMismatch::LengthMismatch {
                expected: self.target_len(),
                actual: target,
            });
        }
        Ok(())
    }
}

/// Reduces overlapping contributions into the owned distribution.
#[derive(Debug, Clone)]
pub struct Exporter {
    target_len: usize,
    /// For each source local index, the target local index.
    target_index: Vec<usize>,
}

impl Exporter {
    pub fn new(source: &DofMap, target: &DofMap) -> Result<Self, MapMismatch> {
        Ok(Self {
            target_len: target.len(),
            target_index: translation(source, target)?,
        })
    }

    pub fn source_len(&self) -> usize {
        self.target_index.len()
    }

    pub fn export_vector<T>(
        &self,
        source: &DVector<T>,
        target: &mut DVector<T>,
        mode: CombineMode,
    ) -> Result<(), MapMismatch>
    where
        T: Scalar + AddAssign,
    {
        self.check_lengths(source.len(), target.len())?;
        for (s, &t) in source.iter().zip(&self.target_index) {
            combine(&mut target[t], s.clone(), mode);
        }
        Ok(())
    }

    pub fn export_multivector<T>(
        &self,
        source: &DMatrix<T>,
        target: &mut DMatrix<T>,
        mode: CombineMode,
    ) -> Result<(), MapMismatch>
    where
        T: Scalar + AddAssign,
    {
        self.check_lengths(source.nrows(), target.nrows())?;
        if source.ncols() != target.ncols() {
            return Err(MapMismatch::LengthMismatch {
                expected: source.ncols(),
                actual: target.ncols(),
            });
        }
        for (source_col, mut target_col) in source.column_iter().zip(target.column_iter_mut()) {
            for (s, &t) in source_col.iter().zip(&self.target_index) {
                combine(&mut target_col[t], s.clone(), mode);
            }
        }
        Ok(())
    }

    /// Exports a square matrix whose rows and columns both follow the source distribution.
    ///
    /// Every stored entry of `source` must have a slot in the sparsity pattern of `target`.
    pub fn export_csr<T>(&self, source: &CsrMatrix<T>, target: &mut CsrMatrix<T>, mode: CombineMode) -> Result<(), MapMismatch>
    where
        T: Scalar + AddAssign,
    {
        self.check_lengths(source.nrows(), target.nrows())?;
        self.check_lengths(source.ncols(), target.ncols())?;
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        for (i, row) in source.row_iter().enumerate() {
            let target_row = self.target_index[i];
            cols.clear();
            vals.clear();
            cols.extend(row.col_indices().iter().map(|&j| self.target_index[j]));
            vals.extend(row.values().iter().cloned());
            crate::add_to_csr_row(target, target_row, &cols, &vals, mode)?;
        }
        Ok(())
    }

    fn check_lengths(&self, source: usize, target: usize) -> Result<(), MapMismatch> {
        if source != self.source_len() {
            return Err(MapMismatch::LengthMismatch {
                expected: self.source_len(),
                actual: source,
            });
        }
        if target != self.target_len {
            return Err(MapMismatch::LengthMismatch {
                expected: self.target_len,
                actual: target,
            });
        }
        Ok(())
    }
}

pub(crate) fn combine<T: AddAssign>(target: &mut T, value: T, mode: CombineMode) {
    match mode {
        CombineMode::Add => *target += value,
        CombineMode::Insert => *target = value,
    }
}
