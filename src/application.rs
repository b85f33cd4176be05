//! The global assembly driver.
//!
//! An [`Application`] owns the evaluator graphs of a problem and runs them over the workset
//! partitions of a discretization to assemble residuals, Jacobians, tangents and distributed
//! parameter derivatives in the owned DOF distribution. Every fill follows the same pipeline:
//! scatter the inputs to the overlapping distribution, zero the overlapping accumulators,
//! evaluate the bulk (and Neumann) graphs partition by partition, export with addition,
//! scale, and finally run the Dirichlet graph on the owned accumulators.
use crate::config::{counter_fires, AssemblyConfig};
use crate::derivative_check::{check_derivatives, DerivativeCheckReport};
use crate::discretization::{Discretization, WorksetPartition};
use crate::error::{AssemblyError, ConfigError, SetupError};
use crate::evaluator::SetupData;
use crate::field_manager::FieldManager;
use crate::fill::{DistParamDeriv, EvaluationType, FillType, Jacobian, Residual, Tangent};
use crate::params::{sensitivity_name, DistParamLib, ParamLib, ParamVec};
use crate::scaling::{Scaling, ScalingMode};
use crate::sdbc::{SdbcTracker, SharedSdbcTracker};
use crate::solution::SolutionManager;
use crate::workset::Workset;
use eyre::WrapErr;
use fefill_sparse::{fill_zero, zeroed_csr};
use fefill_traits::FillScalar;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use num_dual::DualDVec64;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry key under which the setup of the state field managers is memoized.
const STATE_SETUP_KEY: &str = "State";

/// The evaluator graphs of a problem, fully wired by the problem layer.
#[derive(Default)]
pub struct Problem {
    /// Bulk graphs, indexed by physics index.
    pub bulk: Vec<FieldManager>,
    pub dirichlet: Option<FieldManager>,
    /// Neumann graphs. A single graph serves every physics index, otherwise they are indexed
    /// by physics index.
    pub neumann: Vec<FieldManager>,
    /// Graphs computing state (output) fields, indexed by physics index.
    pub state: Vec<FieldManager>,
    /// Equations constrained by the Dirichlet graph, per node set.
    pub dirichlet_offsets: BTreeMap<String, Vec<usize>>,
}

/// Solution and time at which a fill is evaluated, all in the owned distribution.
#[derive(Debug, Copy, Clone)]
pub struct SolutionState<'a> {
    pub time: f64,
    pub x: &'a DVector<f64>,
    pub xdot: Option<&'a DVector<f64>>,
    pub xdotdot: Option<&'a DVector<f64>>,
}

impl<'a> SolutionState<'a> {
    pub fn steady(x: &'a DVector<f64>) -> Self {
        Self {
            time: 0.0,
            x,
            xdot: None,
            xdotdot: None,
        }
    }

    pub fn transient(time: f64, x: &'a DVector<f64>, xdot: &'a DVector<f64>) -> Self {
        Self {
            time,
            x,
            xdot: Some(xdot),
            xdotdot: None,
        }
    }

    pub fn with_time(self, time: f64) -> Self {
        Self { time, ..self }
    }

    pub fn with_xdotdot(self, xdotdot: &'a DVector<f64>) -> Self {
        Self {
            xdotdot: Some(xdotdot),
            ..self
        }
    }
}

/// Coefficients of the combined Jacobian `alpha df/dxdot + beta df/dx + omega df/dxdotdot`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct JacobianCoefficients {
    pub alpha: f64,
    pub beta: f64,
    pub omega: f64,
}

impl JacobianCoefficients {
    /// `df/dx` alone.
    pub fn steady() -> Self {
        Self {
            alpha: 0.0,
            beta: 1.0,
            omega: 0.0,
        }
    }
}

impl Default for JacobianCoefficients {
    fn default() -> Self {
        Self::steady()
    }
}

/// Seed directions of a tangent fill, in the owned distribution.
#[derive(Debug, Clone, Default)]
pub struct TangentSeeds<'a> {
    pub coefficients: JacobianCoefficients,
    /// Sum the solution and parameter directions instead of stacking them.
    pub sum_derivs: bool,
    /// Parameters to differentiate against.
    pub deriv_params: Option<&'a ParamVec>,
    pub vx: Option<&'a DMatrix<f64>>,
    pub vxdot: Option<&'a DMatrix<f64>>,
    pub vxdotdot: Option<&'a DMatrix<f64>>,
    /// Parameter directions, one row per derivative parameter.
    pub vp: Option<&'a DMatrix<f64>>,
}

/// Outputs of a tangent fill. Each one is optional.
#[derive(Debug, Default)]
pub struct TangentOutputs<'a> {
    pub f: Option<&'a mut DVector<f64>>,
    pub jv: Option<&'a mut DMatrix<f64>>,
    pub fp: Option<&'a mut DMatrix<f64>>,
}

/// What a fill did.
#[derive(Debug, Clone, PartialEq)]
pub struct FillSummary {
    pub evaluation: EvaluationType,
    /// Number of partition evaluations, counting both passes of a strong Dirichlet reassembly.
    pub worksets: usize,
    /// Whether a strong Dirichlet fill ran its second pass with the post-BC solution.
    pub reassembled: bool,
    pub derivative_check: Option<DerivativeCheckReport>,
    /// The solution with strong Dirichlet values written into it.
    pub post_bc_solution: Option<DVector<f64>>,
}

impl FillSummary {
    fn new(evaluation: EvaluationType, worksets: usize) -> Self {
        Self {
            evaluation,
            worksets,
            reassembled: false,
            derivative_check: None,
            post_bc_solution: None,
        }
    }
}

/// Borrowed inputs shared by all worksets of one pass.
struct WorksetInputs<'a> {
    time: f64,
    x: &'a DVector<f64>,
    xdot: Option<&'a DVector<f64>>,
    xdotdot: Option<&'a DVector<f64>>,
    params: &'a ParamLib,
    dist_params: &'a DistParamLib,
}

impl<'a> WorksetInputs<'a> {
    fn workset(&self, evaluation: EvaluationType) -> Workset<'a> {
        let mut workset = Workset::new(evaluation, Cow::Borrowed(self.x), self.time);
        workset.xdot = self.xdot;
        workset.xdotdot = self.xdotdot;
        workset.transient_terms = self.xdot.is_some();
        workset.accel_terms = self.xdotdot.is_some();
        workset.param_lib = Some(self.params);
        workset.dist_param_lib = Some(self.dist_params);
        workset
    }
}

pub struct Application {
    config: AssemblyConfig,
    disc: Arc<dyn Discretization>,
    app_index: usize,
    bulk: Vec<FieldManager>,
    dirichlet: Option<FieldManager>,
    neumann: Vec<FieldManager>,
    state: Vec<FieldManager>,
    dirichlet_offsets: BTreeMap<String, Vec<usize>>,
    setup_registry: FxHashSet<&'static str>,
    solution: SolutionManager,
    scaling: Scaling,
    sdbc: SharedSdbcTracker,
    param_lib: Arc<RwLock<ParamLib>>,
    dist_param_lib: Arc<RwLock<DistParamLib>>,
    residual_count: usize,
    jacobian_count: usize,
}

impl Application {
    /// Creates the driver after validating the configuration against the problem.
    pub fn new(config: AssemblyConfig, disc: Arc<dyn Discretization>, problem: Problem) -> eyre::Result<Self> {
        config
            .validate(problem.dirichlet.is_some())
            .wrap_err("Invalid assembly configuration")?;

        for partition in disc.partitions() {
            if partition.physics_index >= problem.bulk.len() {
                return Err(SetupError::MissingFieldManager {
                    physics_index: partition.physics_index,
                }
                .into());
            }
        }

        let solution = SolutionManager::new(disc.as_ref())?;
        let scaling = Scaling::new(&config.scaling);
        debug!(
            "Created application with {} partitions, {} owned DOFs, solver {}",
            disc.partitions().len(),
            solution.owned_len(),
            config.solution_method.solver_token(config.second_order)
        );
        Ok(Self {
            config,
            disc,
            app_index: 0,
            bulk: problem.bulk,
            dirichlet: problem.dirichlet,
            neumann: problem.neumann,
            state: problem.state,
            dirichlet_offsets: problem.dirichlet_offsets,
            setup_registry: FxHashSet::default(),
            solution,
            scaling,
            sdbc: SdbcTracker::shared(),
            param_lib: Arc::new(RwLock::new(ParamLib::new())),
            dist_param_lib: Arc::new(RwLock::new(DistParamLib::new())),
            residual_count: 0,
            jacobian_count: 0,
        })
    }

    /// Index of this application among coupled applications sharing an SDBC tracker.
    pub fn with_app_index(mut self, app_index: usize) -> Self {
        self.app_index = app_index;
        self
    }

    pub fn with_sdbc_tracker(mut self, tracker: SharedSdbcTracker) -> Self {
        self.sdbc = tracker;
        self
    }

    pub fn with_param_lib(mut self, param_lib: Arc<RwLock<ParamLib>>) -> Self {
        self.param_lib = param_lib;
        self
    }

    pub fn with_dist_param_lib(mut self, dist_param_lib: Arc<RwLock<DistParamLib>>) -> Self {
        self.dist_param_lib = dist_param_lib;
        self
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    pub fn discretization(&self) -> &Arc<dyn Discretization> {
        &self.disc
    }

    pub fn app_index(&self) -> usize {
        self.app_index
    }

    pub fn param_lib(&self) -> &Arc<RwLock<ParamLib>> {
        &self.param_lib
    }

    pub fn dist_param_lib(&self) -> &Arc<RwLock<DistParamLib>> {
        &self.dist_param_lib
    }

    pub fn sdbc_tracker(&self) -> &SharedSdbcTracker {
        &self.sdbc
    }

    pub fn scaling(&self) -> &Scaling {
        &self.scaling
    }

    pub fn field_manager(&self, physics_index: usize) -> Option<&FieldManager> {
        self.bulk.get(physics_index)
    }

    pub fn dirichlet_field_manager(&self) -> Option<&FieldManager> {
        self.dirichlet.as_ref()
    }

    /// Number of residual fills requested through [`compute_residual`](Self::compute_residual).
    ///
    /// Residuals evaluated by the derivative check are not counted.
    pub fn residual_count(&self) -> usize {
        self.residual_count
    }

    /// Number of Jacobian fills requested through [`compute_jacobian`](Self::compute_jacobian).
    pub fn jacobian_count(&self) -> usize {
        self.jacobian_count
    }

    pub fn num_owned_dofs(&self) -> usize {
        self.solution.owned_len()
    }

    /// A zero Jacobian with the owned sparsity pattern.
    pub fn create_jacobian(&self) -> CsrMatrix<f64> {
        zeroed_csr(self.disc.owned_jacobian_pattern())
    }

    /// Finalizes the graphs of fill type `E` in every field manager. Memoized per fill type.
    pub fn post_reg_setup<E: FillType>(&mut self) -> eyre::Result<()> {
        let key = E::EVALUATION.name();
        if self.setup_registry.contains(key) {
            debug!("{} graphs are already set up", E::EVALUATION);
            return Ok(());
        }

        let disc = self.disc.as_ref();
        let max_cells = disc.max_workset_size();
        for (physics_index, fm) in self.bulk.iter_mut().enumerate() {
            let setup = SetupData {
                evaluation: E::EVALUATION,
                max_cells,
                deriv_dim: setup_deriv_dim::<E>(disc, Some(physics_index)),
            };
            fm.post_registration_setup::<E>(&setup)?;
        }
        let shared_neumann = self.neumann.len() == 1;
        for (physics_index, fm) in self.neumann.iter_mut().enumerate() {
            let physics = if shared_neumann { None } else { Some(physics_index) };
            let setup = SetupData {
                evaluation: E::EVALUATION,
                max_cells,
                deriv_dim: setup_deriv_dim::<E>(disc, physics),
            };
            fm.post_registration_setup::<E>(&setup)?;
        }
        if let Some(dfm) = self.dirichlet.as_mut() {
            let setup = SetupData {
                evaluation: E::EVALUATION,
                max_cells: 0,
                deriv_dim: setup_deriv_dim::<E>(disc, None),
            };
            dfm.post_registration_setup::<E>(&setup)?;
        }
        self.setup_registry.insert(key);

        if self.config.graph_visualization_detail > 0 {
            let managers = self.bulk.iter().chain(&self.neumann).chain(&self.dirichlet);
            for fm in managers {
                if let Some(dot) = fm.write_graphviz::<E>() {
                    info!("{} graph of field manager \"{}\":\n{}", E::EVALUATION, fm.name(), dot);
                }
            }
        }
        Ok(())
    }

    /// Finalizes the residual graphs of the state field managers. Memoized.
    fn post_reg_setup_state(&mut self) -> eyre::Result<()> {
        if self.setup_registry.contains(STATE_SETUP_KEY) {
            return Ok(());
        }
        let setup = SetupData {
            evaluation: EvaluationType::Residual,
            max_cells: self.disc.max_workset_size(),
            deriv_dim: 0,
        };
        for fm in &mut self.state {
            fm.post_registration_setup::<Residual>(&setup)?;
        }
        self.setup_registry.insert(STATE_SETUP_KEY);
        Ok(())
    }

    /// Assembles the residual `f(x)`.
    pub fn compute_residual(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        f: &mut DVector<f64>,
    ) -> eyre::Result<FillSummary> {
        let summary = self.residual_fill(state, params, f)?;

        self.residual_count += 1;
        if counter_fires(self.config.debug.write_residual, self.residual_count) {
            info!("Global Residual #{}:{}", self.residual_count, f);
        }
        Ok(summary)
    }

    /// Residual fill without the per-call debug counters, shared by solver calls and the
    /// derivative check.
    fn residual_fill(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        f: &mut DVector<f64>,
    ) -> eyre::Result<FillSummary> {
        if self.config.use_sdbcs {
            self.compute_residual_sdbc(state, params, f)
        } else {
            self.compute_residual_standard(state, params, f)
        }
    }

    fn compute_residual_standard(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        f: &mut DVector<f64>,
    ) -> eyre::Result<FillSummary> {
        self.post_reg_setup::<Residual>()?;
        self.prepare_fill(state, params)?;

        let worksets = self.residual_pass(state.time, f)?;

        match self.scaling.mode() {
            ScalingMode::Identity => {}
            ScalingMode::Global => {
                self.scaling.ensure_allocated(f.len());
                self.scaling.apply_to_residual(f);
            }
            ScalingMode::BcDofs => {
                self.scaling.ensure_allocated(f.len());
                self.scaling
                    .set_scale_bc_dofs(self.disc.node_sets(), &self.dirichlet_offsets, None);
            }
        }

        self.dirichlet_residual(state, state.x, f)?;

        if self.scaling.mode() == ScalingMode::BcDofs {
            self.scaling.apply_to_residual(f);
        }
        Ok(FillSummary::new(EvaluationType::Residual, worksets))
    }

    fn compute_residual_sdbc(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        f: &mut DVector<f64>,
    ) -> eyre::Result<FillSummary> {
        self.check_no_sdbc_scaling()?;
        self.post_reg_setup::<Residual>()?;
        let begin_time_step = self.sdbc.lock().begins_time_step(self.app_index, state.time);

        self.prepare_fill(state, params)?;
        let mut worksets = self.residual_pass(state.time, f)?;
        let mut post_bc_x = self.dirichlet_residual(state, state.x, f)?;

        if begin_time_step {
            debug!("Reassembling residual with the post-BC solution at t = {}", state.time);
            self.scatter_solution(state, &post_bc_x)?;
            worksets += self.residual_pass(state.time, f)?;
            if self.config.reassembly_applies_bcs() {
                post_bc_x = self.dirichlet_residual(state, &post_bc_x, f)?;
            }
        }
        self.sdbc.lock().record(self.app_index, state.time);

        let mut summary = FillSummary::new(EvaluationType::Residual, worksets);
        summary.reassembled = begin_time_step;
        summary.post_bc_solution = Some(post_bc_x);
        Ok(summary)
    }

    /// Zeroes the residual accumulators, evaluates all partitions and exports into `f`.
    fn residual_pass(&mut self, time: f64, f: &mut DVector<f64>) -> eyre::Result<usize> {
        self.solution.zero_residual();
        f.fill(0.0);

        let params = self.param_lib.read();
        let dist_params = self.dist_param_lib.read();
        let SolutionManager {
            x, xdot, xdotdot, f: overlapped_f, ..
        } = &mut self.solution;
        let inputs = WorksetInputs {
            time,
            x,
            xdot: xdot.as_ref(),
            xdotdot: xdotdot.as_ref(),
            params: &params,
            dist_params: &dist_params,
        };

        let partitions = self.disc.partitions();
        for (ws, partition) in partitions.iter().enumerate() {
            let mut workset = inputs
                .workset(EvaluationType::Residual)
                .with_partition(ws, partition);
            workset.f = Some(&mut *overlapped_f);
            evaluate_partition::<Residual>(&mut self.bulk, &mut self.neumann, partition, &mut workset)?;
        }
        self.solution.export_residual(f)?;
        Ok(partitions.len())
    }

    /// Runs the Dirichlet graph on the owned residual and returns the solution as the graph
    /// left it.
    fn dirichlet_residual(
        &mut self,
        state: &SolutionState<'_>,
        x: &DVector<f64>,
        f: &mut DVector<f64>,
    ) -> eyre::Result<DVector<f64>> {
        let Some(dfm) = self.dirichlet.as_mut() else {
            return Ok(x.clone());
        };
        let params = self.param_lib.read();
        let dist_params = self.dist_param_lib.read();
        let inputs = owned_inputs(state, x, &params, &dist_params, &self.config);
        let mut workset = inputs.workset(EvaluationType::Residual);
        workset.node_sets = Some(self.disc.node_sets());
        workset.f = Some(f);
        dfm.evaluate_fields::<Residual>(&mut workset)
            .wrap_err("Dirichlet residual fill failed")?;
        Ok(workset.x.into_owned())
    }

    /// Assembles the Jacobian `alpha df/dxdot + beta df/dx + omega df/dxdotdot` and,
    /// if requested, the residual.
    pub fn compute_jacobian(
        &mut self,
        coefficients: JacobianCoefficients,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        mut f: Option<&mut DVector<f64>>,
        jac: &mut CsrMatrix<f64>,
    ) -> eyre::Result<FillSummary> {
        let mut summary = if self.config.use_sdbcs {
            self.compute_jacobian_sdbc(coefficients, state, params, f.as_deref_mut(), jac)?
        } else {
            self.compute_jacobian_standard(coefficients, state, params, f.as_deref_mut(), jac)?
        };

        if self.config.debug.derivative_check > 0 {
            summary.derivative_check = Some(self.derivative_check(state, params, f.as_deref(), jac)?);
        }

        self.jacobian_count += 1;
        let debug = &self.config.debug;
        if counter_fires(debug.write_jacobian, self.jacobian_count) {
            info!("Global Jacobian #{}:{}", self.jacobian_count, DMatrix::from(&*jac));
        }
        if counter_fires(debug.jacobian_condition_number, self.jacobian_count) {
            match condition_number(jac) {
                Some(cond) => info!("Jacobian #{} condition number = {:e}", self.jacobian_count, cond),
                None => warn!("Jacobian #{}: condition number estimation did not converge", self.jacobian_count),
            }
        }
        Ok(summary)
    }

    fn compute_jacobian_standard(
        &mut self,
        coefficients: JacobianCoefficients,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        mut f: Option<&mut DVector<f64>>,
        jac: &mut CsrMatrix<f64>,
    ) -> eyre::Result<FillSummary> {
        self.post_reg_setup::<Jacobian>()?;
        self.prepare_fill(state, params)?;

        let worksets = self.jacobian_pass(coefficients, state.time, f.as_deref_mut(), jac)?;

        if !self.scaling.is_identity() {
            self.scaling.ensure_allocated(jac.nrows());
        }
        if self.scaling.mode() == ScalingMode::Global {
            self.scaling.set_scale(Some(jac));
            self.scaling.apply_to_jacobian(jac);
            if let Some(f) = f.as_deref_mut() {
                self.scaling.apply_to_residual(f);
            }
        }
        if self.scaling.mode() == ScalingMode::BcDofs {
            self.scaling
                .set_scale_bc_dofs(self.disc.node_sets(), &self.dirichlet_offsets, Some(jac));
        }

        self.dirichlet_jacobian(coefficients, state, state.x, f.as_deref_mut(), jac)?;

        if self.scaling.mode() == ScalingMode::BcDofs {
            self.scaling.apply_to_jacobian(jac);
            if let Some(f) = f.as_deref_mut() {
                self.scaling.apply_to_residual(f);
            }
        }
        Ok(FillSummary::new(EvaluationType::Jacobian, worksets))
    }

    fn compute_jacobian_sdbc(
        &mut self,
        coefficients: JacobianCoefficients,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        mut f: Option<&mut DVector<f64>>,
        jac: &mut CsrMatrix<f64>,
    ) -> eyre::Result<FillSummary> {
        self.check_no_sdbc_scaling()?;
        self.post_reg_setup::<Jacobian>()?;
        let begin_time_step = self.sdbc.lock().begins_time_step(self.app_index, state.time);

        self.prepare_fill(state, params)?;
        let mut worksets = self.jacobian_pass(coefficients, state.time, f.as_deref_mut(), jac)?;
        let mut post_bc_x = self.dirichlet_jacobian(coefficients, state, state.x, f.as_deref_mut(), jac)?;

        if begin_time_step {
            debug!("Reassembling Jacobian with the post-BC solution at t = {}", state.time);
            self.scatter_solution(state, &post_bc_x)?;
            worksets += self.jacobian_pass(coefficients, state.time, f.as_deref_mut(), jac)?;
            if self.config.reassembly_applies_bcs() {
                post_bc_x = self.dirichlet_jacobian(coefficients, state, &post_bc_x, f.as_deref_mut(), jac)?;
            }
        }
        self.sdbc.lock().record(self.app_index, state.time);

        let mut summary = FillSummary::new(EvaluationType::Jacobian, worksets);
        summary.reassembled = begin_time_step;
        summary.post_bc_solution = Some(post_bc_x);
        Ok(summary)
    }

    /// Zeroes the Jacobian accumulators, evaluates all partitions and exports into `jac`
    /// (and `f`).
    fn jacobian_pass(
        &mut self,
        coefficients: JacobianCoefficients,
        time: f64,
        mut f: Option<&mut DVector<f64>>,
        jac: &mut CsrMatrix<f64>,
    ) -> eyre::Result<usize> {
        let with_residual = f.is_some();
        self.solution.zero_residual();
        self.solution.zero_jacobian();
        fill_zero(jac);
        if let Some(f) = f.as_deref_mut() {
            f.fill(0.0);
        }

        let params = self.param_lib.read();
        let dist_params = self.dist_param_lib.read();
        let SolutionManager {
            x,
            xdot,
            xdotdot,
            f: overlapped_f,
            jac: overlapped_jac,
            ..
        } = &mut self.solution;
        let inputs = WorksetInputs {
            time,
            x,
            xdot: xdot.as_ref(),
            xdotdot: xdotdot.as_ref(),
            params: &params,
            dist_params: &dist_params,
        };

        let partitions = self.disc.partitions();
        for (ws, partition) in partitions.iter().enumerate() {
            let mut workset = inputs
                .workset(EvaluationType::Jacobian)
                .with_partition(ws, partition);
            set_coefficients(&mut workset, coefficients);
            workset.deriv_dim = Some(partition.dofs_per_cell());
            workset.ignore_residual = self.config.ignore_residual_in_jacobian;
            workset.is_adjoint = self.config.solve_adjoint;
            workset.jac = Some(&mut *overlapped_jac);
            if with_residual {
                workset.f = Some(&mut *overlapped_f);
            }
            evaluate_partition::<Jacobian>(&mut self.bulk, &mut self.neumann, partition, &mut workset)?;
        }

        if let Some(f) = f {
            self.solution.export_residual(f)?;
        }
        self.solution.export_jacobian(jac)?;
        Ok(partitions.len())
    }

    fn dirichlet_jacobian(
        &mut self,
        coefficients: JacobianCoefficients,
        state: &SolutionState<'_>,
        x: &DVector<f64>,
        f: Option<&mut DVector<f64>>,
        jac: &mut CsrMatrix<f64>,
    ) -> eyre::Result<DVector<f64>> {
        let Some(dfm) = self.dirichlet.as_mut() else {
            return Ok(x.clone());
        };
        let params = self.param_lib.read();
        let dist_params = self.dist_param_lib.read();
        let inputs = owned_inputs(state, x, &params, &dist_params, &self.config);
        let mut workset = inputs.workset(EvaluationType::Jacobian);
        set_coefficients(&mut workset, coefficients);
        let perturb = self.config.perturb_dirichlet;
        if coefficients.beta == 0.0 && perturb > 0.0 {
            workset.j_coeff = perturb;
        }
        workset.deriv_dim = Some(max_dofs_per_cell(self.disc.as_ref(), None));
        workset.node_sets = Some(self.disc.node_sets());
        workset.f = f;
        workset.jac = Some(jac);
        dfm.evaluate_fields::<Jacobian>(&mut workset)
            .wrap_err("Dirichlet Jacobian fill failed")?;
        Ok(workset.x.into_owned())
    }

    /// The perturbed residuals are evaluated at the time of the Jacobian fill, so with SDBCs
    /// they never begin a new time step.
    fn derivative_check(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        f: Option<&DVector<f64>>,
        jac: &CsrMatrix<f64>,
    ) -> eyre::Result<DerivativeCheckReport> {
        let f = match f {
            Some(f) => f.clone(),
            None => {
                let mut f = DVector::zeros(self.num_owned_dofs());
                self.residual_fill(state, params, &mut f)?;
                f
            }
        };
        let debug = self.config.debug.clone();
        check_derivatives(
            debug.derivative_check,
            debug.derivative_check_step,
            debug.derivative_check_seed,
            state.x,
            &f,
            jac,
            |x_perturbed| {
                let perturbed_state = SolutionState {
                    x: x_perturbed,
                    ..*state
                };
                let mut f_perturbed = DVector::zeros(x_perturbed.len());
                self.residual_fill(&perturbed_state, params, &mut f_perturbed)?;
                Ok(f_perturbed)
            },
        )
    }

    /// Computes the tangent `JV = alpha df/dxdot Vxdot + beta df/dx Vx + omega df/dxdotdot Vxdotdot`
    /// and the parameter derivative `fp = df/dp Vp`, along with the residual if requested.
    ///
    /// Parameter tangents seeded for the fill are cleared again on return, also when the fill
    /// fails.
    pub fn compute_tangent(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        seeds: &TangentSeeds<'_>,
        outputs: TangentOutputs<'_>,
    ) -> eyre::Result<FillSummary> {
        let result = self.compute_tangent_seeded(state, params, seeds, outputs);
        self.param_lib.write().clear_tangents();
        result
    }

    fn compute_tangent_seeded(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        seeds: &TangentSeeds<'_>,
        outputs: TangentOutputs<'_>,
    ) -> eyre::Result<FillSummary> {
        self.post_reg_setup::<Tangent>()?;
        self.prepare_fill(state, params)?;

        let overlapped_vx = seeds.vx.map(|v| self.solution.import_multivector(v)).transpose()?;
        let overlapped_vxdot = seeds.vxdot.map(|v| self.solution.import_multivector(v)).transpose()?;
        let overlapped_vxdotdot = seeds
            .vxdotdot
            .map(|v| self.solution.import_multivector(v))
            .transpose()?;

        let num_cols_x = seeds
            .vx
            .or(seeds.vxdot)
            .or(seeds.vxdotdot)
            .map(|v| v.ncols())
            .unwrap_or(0);
        let num_cols_p = match (seeds.deriv_params, seeds.vp) {
            (Some(_), Some(vp)) => vp.ncols(),
            (Some(deriv_params), None) => deriv_params.len(),
            (None, _) => 0,
        };
        if seeds.sum_derivs && num_cols_x != 0 && num_cols_p != 0 && num_cols_x != num_cols_p {
            return Err(AssemblyError::TangentColumnMismatch { num_cols_x, num_cols_p }.into());
        }
        if let (Some(deriv_params), Some(vp)) = (seeds.deriv_params, seeds.vp) {
            if vp.nrows() != deriv_params.len() {
                return Err(AssemblyError::TangentParameterRowMismatch {
                    num_params: deriv_params.len(),
                    num_rows: vp.nrows(),
                }
                .into());
            }
        }
        let param_offset = if seeds.sum_derivs { 0 } else { num_cols_x };
        let deriv_dim = num_cols_x.max(param_offset + num_cols_p);

        if let Some(deriv_params) = seeds.deriv_params {
            let mut param_lib = self.param_lib.write();
            for (i, param) in deriv_params.iter().enumerate() {
                let mut derivatives = vec![0.0; param_offset + num_cols_p];
                match seeds.vp {
                    Some(vp) => {
                        for k in 0..num_cols_p {
                            derivatives[param_offset + k] = vp[(i, k)];
                        }
                    }
                    None => derivatives[param_offset + i] = 1.0,
                }
                let seeded = DualDVec64::with_derivatives(param.base_value, &derivatives);
                param_lib.set_tangent(&param.name, seeded)?;
            }
        }

        let TangentOutputs {
            mut f,
            mut jv,
            mut fp,
        } = outputs;
        let overlap_len = self.solution.overlap_len();
        self.solution.zero_residual();
        let mut overlapped_jv = jv.as_deref().map(|jv| DMatrix::zeros(overlap_len, jv.ncols()));
        let mut overlapped_fp = fp.as_deref().map(|fp| DMatrix::zeros(overlap_len, fp.ncols()));
        if let Some(f) = f.as_deref_mut() {
            f.fill(0.0);
        }
        if let Some(jv) = jv.as_deref_mut() {
            jv.fill(0.0);
        }
        if let Some(fp) = fp.as_deref_mut() {
            fp.fill(0.0);
        }

        let worksets = {
            let params = self.param_lib.read();
            let dist_params = self.dist_param_lib.read();
            let SolutionManager {
                x,
                xdot,
                xdotdot,
                f: overlapped_f,
                ..
            } = &mut self.solution;
            let inputs = WorksetInputs {
                time: state.time,
                x,
                xdot: xdot.as_ref(),
                xdotdot: xdotdot.as_ref(),
                params: &params,
                dist_params: &dist_params,
            };

            let partitions = self.disc.partitions();
            for (ws, partition) in partitions.iter().enumerate() {
                let mut workset = inputs
                    .workset(EvaluationType::Tangent)
                    .with_partition(ws, partition);
                set_coefficients(&mut workset, seeds.coefficients);
                workset.deriv_dim = Some(deriv_dim);
                workset.num_cols_x = num_cols_x;
                workset.num_cols_p = num_cols_p;
                workset.param_offset = param_offset;
                workset.vx = overlapped_vx.as_ref();
                workset.vxdot = overlapped_vxdot.as_ref();
                workset.vxdotdot = overlapped_vxdotdot.as_ref();
                workset.vp = seeds.vp;
                if f.is_some() {
                    workset.f = Some(&mut *overlapped_f);
                }
                workset.jv = overlapped_jv.as_mut();
                workset.fp = overlapped_fp.as_mut();
                evaluate_partition::<Tangent>(&mut self.bulk, &mut self.neumann, partition, &mut workset)?;
            }
            partitions.len()
        };

        if let Some(f) = f.as_deref_mut() {
            self.solution.export_residual(f)?;
        }
        if let (Some(jv), Some(overlapped)) = (jv.as_deref_mut(), &overlapped_jv) {
            self.solution.export_multivector(overlapped, jv)?;
        }
        if let (Some(fp), Some(overlapped)) = (fp.as_deref_mut(), &overlapped_fp) {
            self.solution.export_multivector(overlapped, fp)?;
        }

        if let Some(dfm) = self.dirichlet.as_mut() {
            let params = self.param_lib.read();
            let dist_params = self.dist_param_lib.read();
            let inputs = owned_inputs(state, state.x, &params, &dist_params, &self.config);
            let mut workset = inputs.workset(EvaluationType::Tangent);
            set_coefficients(&mut workset, seeds.coefficients);
            workset.deriv_dim = Some(deriv_dim);
            workset.num_cols_x = num_cols_x;
            workset.num_cols_p = num_cols_p;
            workset.param_offset = param_offset;
            workset.vx = seeds.vx;
            workset.node_sets = Some(self.disc.node_sets());
            workset.f = f;
            workset.jv = jv;
            workset.fp = fp;
            dfm.evaluate_fields::<Tangent>(&mut workset)
                .wrap_err("Dirichlet tangent fill failed")?;
        }

        Ok(FillSummary::new(EvaluationType::Tangent, worksets))
    }

    /// Applies the derivative of the residual with respect to the distributed parameter `name`
    /// to the multivector `v`.
    ///
    /// Computes `fpv = df/dp v` with `v` on the parameter's owned distribution, or, when
    /// `transpose` is set, `fpv += (df/dp)^T v` with `v` on the solution's owned distribution.
    /// A transposed fill also stores the first column of `fpv` in the library entry
    /// `<name>_sensitivity`, if one exists.
    pub fn apply_dist_param_deriv(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
        name: &str,
        transpose: bool,
        v: &DMatrix<f64>,
        fpv: &mut DMatrix<f64>,
    ) -> eyre::Result<FillSummary> {
        self.post_reg_setup::<DistParamDeriv>()?;
        self.prepare_fill(state, params)?;
        let deriv_dim = max_nodes_per_cell(self.disc.as_ref());

        let (overlapped_v, mut overlapped_fpv) = {
            let dist_params = self.dist_param_lib.read();
            let param = dist_params.get(name)?;
            if transpose {
                // Constrained rows of the seed directions do not contribute
                let mut v_bc = v.clone();
                if let Some(dfm) = self.dirichlet.as_mut() {
                    let params = self.param_lib.read();
                    let inputs = owned_inputs(state, state.x, &params, &dist_params, &self.config);
                    let mut workset = inputs.workset(EvaluationType::DistParamDeriv);
                    workset.deriv_dim = Some(deriv_dim);
                    workset.dist_param_deriv_name = Some(name);
                    workset.transpose_dist_param_deriv = true;
                    workset.node_sets = Some(self.disc.node_sets());
                    workset.vp_bc = Some(&mut v_bc);
                    dfm.evaluate_fields::<DistParamDeriv>(&mut workset)
                        .wrap_err("Dirichlet distributed parameter derivative fill failed")?;
                }
                let overlapped_v = self.solution.import_multivector(&v_bc)?;
                let overlapped_fpv = DMatrix::zeros(param.overlap_map().len(), fpv.ncols());
                (overlapped_v, overlapped_fpv)
            } else {
                let mut overlapped_v = DMatrix::zeros(param.overlap_map().len(), v.ncols());
                param.import(v, &mut overlapped_v)?;
                let overlapped_fpv = DMatrix::zeros(self.solution.overlap_len(), fpv.ncols());
                fpv.fill(0.0);
                (overlapped_v, overlapped_fpv)
            }
        };

        let worksets = {
            let params = self.param_lib.read();
            let dist_params = self.dist_param_lib.read();
            let SolutionManager { x, xdot, xdotdot, .. } = &self.solution;
            let inputs = WorksetInputs {
                time: state.time,
                x,
                xdot: xdot.as_ref(),
                xdotdot: xdotdot.as_ref(),
                params: &params,
                dist_params: &dist_params,
            };
            let partitions = self.disc.partitions();
            for (ws, partition) in partitions.iter().enumerate() {
                let mut workset = inputs
                    .workset(EvaluationType::DistParamDeriv)
                    .with_partition(ws, partition);
                workset.deriv_dim = Some(deriv_dim);
                workset.dist_param_deriv_name = Some(name);
                workset.transpose_dist_param_deriv = transpose;
                workset.vp = Some(&overlapped_v);
                workset.fpv = Some(&mut overlapped_fpv);
                evaluate_partition::<DistParamDeriv>(&mut self.bulk, &mut self.neumann, partition, &mut workset)?;
            }
            partitions.len()
        };

        if transpose {
            {
                let dist_params = self.dist_param_lib.read();
                dist_params.get(name)?.export_add(&overlapped_fpv, fpv)?;
            }
            let sensitivity = sensitivity_name(name);
            let mut dist_params = self.dist_param_lib.write();
            if dist_params.contains(&sensitivity) && fpv.ncols() > 0 {
                debug!("Storing sensitivity of \"{}\" in \"{}\"", name, sensitivity);
                dist_params
                    .get_mut(&sensitivity)?
                    .set_vector(fpv.column(0).into_owned())?;
            }
        } else {
            self.solution.export_multivector(&overlapped_fpv, fpv)?;
            if let Some(dfm) = self.dirichlet.as_mut() {
                let params = self.param_lib.read();
                let dist_params = self.dist_param_lib.read();
                let inputs = owned_inputs(state, state.x, &params, &dist_params, &self.config);
                let mut workset = inputs.workset(EvaluationType::DistParamDeriv);
                workset.deriv_dim = Some(deriv_dim);
                workset.dist_param_deriv_name = Some(name);
                workset.node_sets = Some(self.disc.node_sets());
                workset.fpv = Some(fpv);
                dfm.evaluate_fields::<DistParamDeriv>(&mut workset)
                    .wrap_err("Dirichlet distributed parameter derivative fill failed")?;
            }
        }
        Ok(FillSummary::new(EvaluationType::DistParamDeriv, worksets))
    }

    /// Runs the state field managers over all partitions with the residual fill type.
    pub fn evaluate_state_field_manager(
        &mut self,
        state: &SolutionState<'_>,
        params: &[ParamVec],
    ) -> eyre::Result<FillSummary> {
        self.post_reg_setup_state()?;
        self.prepare_fill(state, params)?;

        let params = self.param_lib.read();
        let dist_params = self.dist_param_lib.read();
        let SolutionManager { x, xdot, xdotdot, .. } = &self.solution;
        let inputs = WorksetInputs {
            time: state.time,
            x,
            xdot: xdot.as_ref(),
            xdotdot: xdotdot.as_ref(),
            params: &params,
            dist_params: &dist_params,
        };
        let mut worksets = 0;
        for (ws, partition) in self.disc.partitions().iter().enumerate() {
            let Some(sfm) = self.state.get_mut(partition.physics_index) else {
                continue;
            };
            let mut workset = inputs
                .workset(EvaluationType::Residual)
                .with_partition(ws, partition);
            sfm.evaluate_fields::<Residual>(&mut workset)
                .wrap_err_with(|| format!("State fill failed on workset {}", ws))?;
            worksets += 1;
        }
        Ok(FillSummary::new(EvaluationType::Residual, worksets))
    }

    /// Scatters the solution and distributed parameters and sets the parameter values.
    fn prepare_fill(&mut self, state: &SolutionState<'_>, params: &[ParamVec]) -> eyre::Result<()> {
        self.scatter_solution(state, state.x)?;
        self.dist_param_lib.write().scatter()?;
        self.param_lib.write().set_all(params)?;
        Ok(())
    }

    fn scatter_solution(&mut self, state: &SolutionState<'_>, x: &DVector<f64>) -> eyre::Result<()> {
        let (xdot, xdotdot) = time_derivatives(state, &self.config);
        self.solution.scatter_x(x, xdot, xdotdot)?;
        Ok(())
    }

    fn check_no_sdbc_scaling(&self) -> Result<(), ConfigError> {
        let scale = self.config.scaling.effective_scale();
        if scale != 1.0 {
            return Err(ConfigError::ScalingWithSdbcs { scale });
        }
        Ok(())
    }
}

/// The time derivatives a fill may use, given the configured number of time derivatives.
fn time_derivatives<'a>(
    state: &SolutionState<'a>,
    config: &AssemblyConfig,
) -> (Option<&'a DVector<f64>>, Option<&'a DVector<f64>>) {
    let n = config.number_of_time_derivatives;
    (state.xdot.filter(|_| n >= 1), state.xdotdot.filter(|_| n >= 2))
}

fn owned_inputs<'a>(
    state: &SolutionState<'a>,
    x: &'a DVector<f64>,
    params: &'a ParamLib,
    dist_params: &'a DistParamLib,
    config: &AssemblyConfig,
) -> WorksetInputs<'a> {
    let (xdot, xdotdot) = time_derivatives(state, config);
    WorksetInputs {
        time: state.time,
        x,
        xdot,
        xdotdot,
        params,
        dist_params,
    }
}

fn set_coefficients(workset: &mut Workset<'_>, coefficients: JacobianCoefficients) {
    workset.m_coeff = coefficients.alpha;
    workset.j_coeff = coefficients.beta;
    workset.n_coeff = coefficients.omega;
}

/// Runs the bulk graph of a partition, followed by its Neumann graph if the partition has
/// boundary sides.
fn evaluate_partition<E: FillType>(
    bulk: &mut [FieldManager],
    neumann: &mut [FieldManager],
    partition: &WorksetPartition,
    workset: &mut Workset<'_>,
) -> eyre::Result<()> {
    let physics_index = partition.physics_index;
    let fm = bulk
        .get_mut(physics_index)
        .ok_or(SetupError::MissingFieldManager { physics_index })?;
    fm.evaluate_fields::<E>(workset)
        .wrap_err_with(|| format!("{} fill failed on workset {}", E::EVALUATION, workset.workset_index))?;

    if partition.has_sides() {
        let shared = neumann.len() == 1;
        let nfm = if shared {
            neumann.first_mut()
        } else {
            neumann.get_mut(physics_index)
        };
        if let Some(nfm) = nfm {
            nfm.evaluate_fields::<E>(workset).wrap_err_with(|| {
                format!("Neumann {} fill failed on workset {}", E::EVALUATION, workset.workset_index)
            })?;
        }
    }
    Ok(())
}

fn max_dofs_per_cell(disc: &dyn Discretization, physics_index: Option<usize>) -> usize {
    disc.partitions()
        .iter()
        .filter(|p| physics_index.map(|i| p.physics_index == i).unwrap_or(true))
        .map(WorksetPartition::dofs_per_cell)
        .max()
        .unwrap_or(0)
}

fn max_nodes_per_cell(disc: &dyn Discretization) -> usize {
    disc.partitions()
        .iter()
        .map(|p| p.nodes_per_cell)
        .max()
        .unwrap_or(0)
}

/// Derivative width recorded at setup. Tangent widths depend on the seeds of each call and are
/// recorded as zero.
fn setup_deriv_dim<E: FillType>(disc: &dyn Discretization, physics_index: Option<usize>) -> usize {
    match E::EVALUATION {
        EvaluationType::Residual | EvaluationType::Tangent => 0,
        EvaluationType::Jacobian => max_dofs_per_cell(disc, physics_index),
        EvaluationType::DistParamDeriv => max_nodes_per_cell(disc),
    }
}

/// Ratio of the largest to the smallest singular value, or `None` if the SVD does not converge.
fn condition_number(jac: &CsrMatrix<f64>) -> Option<f64> {
    let dense = DMatrix::from(jac);
    let svd = dense.try_svd(false, false, f64::EPSILON, 1000)?;
    let max = svd.singular_values.max();
    let min = svd.singular_values.min();
    Some(max / min)
}
