//! Evaluator graphs, one per fill type, behind a single registration and execution interface.
use crate::error::SetupError;
use crate::evaluator::{Evaluator, FieldBinder, SetupData};
use crate::field::{FieldData, FieldHandle, FieldStore, FieldTag};
use crate::fill::FillType;
use crate::workset::Workset;
use eyre::WrapErr;
use log::{debug, trace};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write;

struct FinalizedGraph<S> {
    /// Indices into the evaluator list, in evaluation order.
    order: Vec<usize>,
    fields: FieldStore<S>,
    /// `(producer, consumer, field)` triples among the evaluators in `order`.
    edges: Vec<(usize, usize, FieldTag)>,
}

/// The evaluator graph of a single fill type.
pub struct EvaluatorGraph<E: FillType> {
    evaluators: Vec<Box<dyn Evaluator<E>>>,
    required: Vec<FieldTag>,
    finalized: Option<FinalizedGraph<E::ScalarT>>,
}

impl<E: FillType> Default for EvaluatorGraph<E> {
    fn default() -> Self {
        Self {
            evaluators: Vec::new(),
            required: Vec::new(),
            finalized: None,
        }
    }
}

impl<E: FillType> EvaluatorGraph<E> {
    fn finalize(&mut self, setup: &SetupData) -> eyre::Result<()> {
        let mut producers: FxHashMap<&FieldTag, usize> = FxHashMap::default();
        let evaluated: Vec<Vec<FieldTag>> = self.evaluators.iter().map(|e| e.evaluated_fields()).collect();
        let dependent: Vec<Vec<FieldTag>> = self.evaluators.iter().map(|e| e.dependent_fields()).collect();
        for (i, fields) in evaluated.iter().enumerate() {
            for field in fields {
                if let Some(&first) = producers.get(field) {
                    return Err(SetupError::DuplicateField {
                        field: field.clone(),
                        first: self.evaluators[first].name().to_string(),
                        second: self.evaluators[i].name().to_string(),
                    }
                    .into());
                }
                producers.insert(field, i);
            }
        }

        // Only evaluators that contribute to a required field take part
        let mut active = vec![false; self.evaluators.len()];
        let mut queue = VecDeque::new();
        for field in &self.required {
            let &producer = producers
                .get(field)
                .ok_or_else(|| SetupError::UnproducedRequiredField { field: field.clone() })?;
            queue.push_back(producer);
        }
        let mut edges = Vec::new();
        while let Some(i) = queue.pop_front() {
            if active[i] {
                continue;
            }
            active[i] = true;
            for field in &dependent[i] {
                let &producer = producers.get(field).ok_or_else(|| SetupError::MissingField {
                    field: field.clone(),
                    evaluator: self.evaluators[i].name().to_string(),
                })?;
                edges.push((producer, i, field.clone()));
                queue.push_back(producer);
            }
        }

        // Kahn's algorithm, always picking the earliest registered evaluator that is ready
        let mut in_degree = vec![0usize; self.evaluators.len()];
        let mut successors = vec![Vec::new(); self.evaluators.len()];
        for (producer, consumer, _) in &edges {
            in_degree[*consumer] += 1;
            successors[*producer].push(*consumer);
        }
        let mut ready: BTreeSet<usize> = (0..self.evaluators.len())
            .filter(|&i| active[i] && in_degree[i] == 0)
            .collect();
        let mut order = Vec::new();
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &j in &successors[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        let num_active = active.iter().filter(|a| **a).count();
        if order.len() != num_active {
            let evaluators = (0..self.evaluators.len())
                .filter(|&i| active[i] && in_degree[i] > 0)
                .map(|i| self.evaluators[i].name().to_string())
                .collect();
            return Err(SetupError::CyclicDependency { evaluators }.into());
        }

        let mut handles = FxHashMap::default();
        let mut storage = Vec::new();
        for &i in &order {
            for field in evaluated[i].iter().chain(&dependent[i]) {
                handles.entry(field.clone()).or_insert_with(|| {
                    storage.push(FieldData::allocate(field.layout().size_per_cell(), setup.max_cells));
                    FieldHandle(storage.len() - 1)
                });
            }
        }

        for &i in &order {
            let evaluator = &mut self.evaluators[i];
            let name = evaluator.name().to_string();
            let binder = FieldBinder::new(&handles, &name);
            evaluator
                .post_registration_setup(setup, &binder)
                .wrap_err_with(|| format!("Setup of evaluator \"{}\" failed", name))?;
        }

        debug!(
            "Finalized {} graph with {} of {} evaluators and {} fields",
            E::EVALUATION,
            order.len(),
            self.evaluators.len(),
            storage.len()
        );
        self.finalized = Some(FinalizedGraph {
            order,
            fields: FieldStore::new(storage),
            edges,
        });
        Ok(())
    }
}

/// Type-erased storage of one [`EvaluatorGraph`] per fill type.
#[derive(Default)]
struct GraphStore {
    graphs: Vec<Box<dyn Any + Send>>,
}

impl GraphStore {
    fn get<W: 'static>(&self) -> Option<&W> {
        self.graphs.iter().find_map(|g| g.downcast_ref())
    }

    fn get_mut<W: 'static>(&mut self) -> Option<&mut W> {
        self.graphs.iter_mut().find_map(|g| g.downcast_mut())
    }

    fn get_or_default<W: 'static + Send + Default>(&mut self) -> &mut W {
        let existing_idx = self.graphs.iter().position(|g| g.is::<W>());
        let idx = match existing_idx {
            Some(idx) => idx,
            None => {
                self.graphs.push(Box::new(W::default()));
                self.graphs.len() - 1
            }
        };
        self.graphs[idx]
            .downcast_mut()
            .expect("Internal error: Downcasting can by definition not fail")
    }
}

/// Owns the evaluator graphs of all fill types for one class of partitions.
///
/// Evaluators are registered per fill type, and a fill type's graph is finalized exactly once
/// by [`post_registration_setup`](Self::post_registration_setup); repeated calls are no-ops.
pub struct FieldManager {
    name: String,
    graphs: GraphStore,
}

impl FieldManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graphs: GraphStore::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers an evaluator with the graph of fill type `E`.
    ///
    /// # Panics
    ///
    /// Panics if the graph of `E` has already been finalized.
    pub fn register_evaluator<E: FillType>(&mut self, evaluator: impl Evaluator<E> + 'static) {
        let graph = self.graphs.get_or_default::<EvaluatorGraph<E>>();
        assert!(
            graph.finalized.is_none(),
            "Cannot register evaluator \"{}\" after the {} graph was finalized",
            evaluator.name(),
            E::EVALUATION
        );
        graph.evaluators.push(Box::new(evaluator));
    }

    /// Marks a field as a required output of the graph of fill type `E`.
    ///
    /// # Panics
    ///
    /// Panics if the graph of `E` has already been finalized.
    pub fn require_field<E: FillType>(&mut self, tag: FieldTag) {
        let graph = self.graphs.get_or_default::<EvaluatorGraph<E>>();
        assert!(
            graph.finalized.is_none(),
            "Cannot require field {} after the {} graph was finalized",
            tag,
            E::EVALUATION
        );
        if !graph.required.contains(&tag) {
            graph.required.push(tag);
        }
    }

    /// Whether any evaluator is registered for fill type `E`.
    pub fn has_graph<E: FillType>(&self) -> bool {
        self.graphs
            .get::<EvaluatorGraph<E>>()
            .map(|g| !g.evaluators.is_empty())
            .unwrap_or(false)
    }

    pub fn is_finalized<E: FillType>(&self) -> bool {
        self.graphs
            .get::<EvaluatorGraph<E>>()
            .map(|g| g.finalized.is_some())
            .unwrap_or(false)
    }

    /// Finalizes the graph of fill type `E`: resolves dependencies, orders evaluators
    /// topologically, allocates field storage and binds evaluators to it.
    ///
    /// Does nothing if the graph is already finalized.
    pub fn post_registration_setup<E: FillType>(&mut self, setup: &SetupData) -> eyre::Result<()> {
        let name = self.name.clone();
        let graph = self.graphs.get_or_default::<EvaluatorGraph<E>>();
        if graph.finalized.is_some() {
            debug!("{} graph of field manager \"{}\" is already set up", E::EVALUATION, name);
            return Ok(());
        }
        graph
            .finalize(setup)
            .wrap_err_with(|| format!("Failed to set up {} graph of field manager \"{}\"", E::EVALUATION, name))
    }

    /// Runs the finalized graph of fill type `E` over one workset.
    pub fn evaluate_fields<E: FillType>(&mut self, workset: &mut Workset<'_>) -> eyre::Result<()> {
        let graph = self
            .graphs
            .get_mut::<EvaluatorGraph<E>>()
            .ok_or(SetupError::NotFinalized {
                evaluation: E::EVALUATION,
            })?;
        let EvaluatorGraph {
            evaluators, finalized, ..
        } = graph;
        let finalized = finalized.as_mut().ok_or(SetupError::NotFinalized {
            evaluation: E::EVALUATION,
        })?;
        workset.check(E::EVALUATION)?;
        finalized.fields.ensure_cells(workset.num_cells);

        for &i in &finalized.order {
            let evaluator = &mut evaluators[i];
            trace!("Evaluating \"{}\" ({})", evaluator.name(), E::EVALUATION);
            evaluator
                .evaluate_fields(workset, &mut finalized.fields)
                .wrap_err_with(|| format!("Evaluator \"{}\" failed", evaluator.name()))?;
        }
        Ok(())
    }

    /// Names of the evaluators of fill type `E` in evaluation order, once finalized.
    pub fn evaluation_order<E: FillType>(&self) -> Option<Vec<String>> {
        let graph = self.graphs.get::<EvaluatorGraph<E>>()?;
        let finalized = graph.finalized.as_ref()?;
        Some(
            finalized
                .order
                .iter()
                .map(|&i| graph.evaluators[i].name().to_string())
                .collect(),
        )
    }

    /// Renders the finalized graph of fill type `E` in Graphviz DOT format.
    pub fn write_graphviz<E: FillType>(&self) -> Option<String> {
        let graph = self.graphs.get::<EvaluatorGraph<E>>()?;
        let finalized = graph.finalized.as_ref()?;
        let mut dot = String::new();
        // Writing to a String cannot fail
        let _ = writeln!(dot, "digraph \"{} ({})\" {{", self.name, E::EVALUATION);
        let _ = writeln!(dot, "  node [shape=box];");
        for &i in &finalized.order {
            let _ = writeln!(dot, "  e{} [label=\"{}\"];", i, graph.evaluators[i].name());
        }
        for (producer, consumer, field) in &finalized.edges {
            let _ = writeln!(dot, "  e{} -> e{} [label=\"{}\"];", producer, consumer, field.name());
        }
        dot.push_str("}\n");
        Some(dot)
    }
}
