use crate::error::SetupError;
use crate::field::{FieldHandle, FieldStore, FieldTag};
use crate::fill::{EvaluationType, FillType};
use crate::workset::Workset;
use rustc_hash::FxHashMap;

/// Information available to evaluators when a graph is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupData {
    pub evaluation: EvaluationType,
    /// Largest number of cells of any workset the graph will see.
    pub max_cells: usize,
    /// Width of derivative vectors. Zero for the residual fill and for fills whose width is
    /// only known per call, such as the tangent fill.
    pub deriv_dim: usize,
}

/// Resolves field tags to storage handles during setup.
pub struct FieldBinder<'a> {
    handles: &'a FxHashMap<FieldTag, FieldHandle>,
    evaluator: &'a str,
}

impl<'a> FieldBinder<'a> {
    pub(crate) fn new(handles: &'a FxHashMap<FieldTag, FieldHandle>, evaluator: &'a str) -> Self {
        Self { handles, evaluator }
    }

    pub fn bind(&self, tag: &FieldTag) -> Result<FieldHandle, SetupError> {
        self.handles
            .get(tag)
            .copied()
            .ok_or_else(|| SetupError::MissingField {
                field: tag.clone(),
                evaluator: self.evaluator.to_string(),
            })
    }
}

/// A unit of an evaluator graph that computes its evaluated fields from its dependent fields.
///
/// The graph calls [`post_registration_setup`](Self::post_registration_setup) once, when the
/// graph for the fill type `E` is finalized, and then
/// [`evaluate_fields`](Self::evaluate_fields) once per workset, after every evaluator that
/// produces one of its dependent fields.
pub trait Evaluator<E: FillType>: Send {
    fn name(&self) -> &str;

    fn evaluated_fields(&self) -> Vec<FieldTag>;

    fn dependent_fields(&self) -> Vec<FieldTag>;

    fn post_registration_setup(&mut self, setup: &SetupData, binder: &FieldBinder<'_>) -> eyre::Result<()>;

    fn evaluate_fields(&mut self, workset: &mut Workset<'_>, fields: &mut FieldStore<E::ScalarT>) -> eyre::Result<()>;
}
