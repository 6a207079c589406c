//! Node feasibility checks.
//!
//! Checks come in three tiers. Job and task-group checks depend only on a
//! node's computed class, so their outcome is cached per class in
//! [`EvalEligibility`](crate::context::EvalEligibility) unless a constraint
//! reads unique node data. Availability checks (volumes) depend on live
//! claims and always run. Distinct-hosts and distinct-property look at the
//! proposed placement set and run last.

use std::collections::BTreeSet;
use std::sync::Arc;

use convoy_id::AllocId;
use convoy_structs::{
    node_meets, resolve_target, Constraint, Job, Node, Operand, RequestedDevice, TaskGroup,
    VolumeKind, VolumeRequest,
};

use crate::context::{ClassStatus, EvalContext};

pub const FILTER_CLASS_INELIGIBLE: &str = "computed class ineligible";
pub const FILTER_MISSING_DRIVERS: &str = "missing drivers";
pub const FILTER_MISSING_DEVICES: &str = "missing devices";
pub const FILTER_MISSING_HOST_VOLUMES: &str = "missing compatible host volumes";
pub const FILTER_MISSING_CSI_VOLUME: &str = "missing CSI volume";
pub const FILTER_CSI_UNSCHEDULABLE: &str = "CSI volume is unschedulable";
pub const FILTER_CSI_PLUGIN_MISSING: &str = "CSI plugin is missing from client";
pub const FILTER_CSI_PLUGIN_UNHEALTHY: &str = "CSI plugin is unhealthy on client";
pub const FILTER_CSI_MAX_VOLUMES: &str = "CSI plugin has reached max volumes";
pub const FILTER_CSI_TOPOLOGY: &str = "CSI volume topology does not match node";
pub const FILTER_CSI_CLAIMS: &str = "CSI volume has exhausted its available claims";
pub const FILTER_DISTINCT_HOSTS: &str = "distinct_hosts";
pub const FILTER_MISSING_PROPERTY: &str = "distinct_property: missing property";

/// A single node filter.
pub trait FeasibilityChecker: Send {
    /// Returns whether `node` passes, recording the reason in the context's
    /// metrics when it does not.
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool;
}

/// Checks a list of constraint expressions.
pub struct ConstraintChecker {
    constraints: Vec<Constraint>,
}

impl ConstraintChecker {
    /// Distinct operands are skipped; they are evaluated over the proposed
    /// placement set instead.
    pub fn new<'a>(constraints: impl IntoIterator<Item = &'a Constraint>) -> Self {
        Self {
            constraints: constraints
                .into_iter()
                .filter(|c| {
                    !matches!(c.operand, Operand::DistinctHosts | Operand::DistinctProperty)
                })
                .cloned()
                .collect(),
        }
    }
}

impl FeasibilityChecker for ConstraintChecker {
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        for constraint in &self.constraints {
            if !node_meets(constraint, node, &mut ctx.cache) {
                ctx.metrics.filter_node(node, &constraint.to_string());
                return false;
            }
        }
        true
    }
}

/// Requires every task driver to be detected and healthy.
pub struct DriverChecker {
    drivers: BTreeSet<String>,
}

impl DriverChecker {
    pub fn new(tg: &TaskGroup) -> Self {
        Self {
            drivers: tg.tasks.iter().map(|t| t.driver.clone()).collect(),
        }
    }
}

impl FeasibilityChecker for DriverChecker {
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        let ok = self.drivers.iter().all(|d| {
            node.drivers
                .get(d)
                .is_some_and(|info| info.detected && info.healthy)
        });
        if !ok {
            ctx.metrics.filter_node(node, FILTER_MISSING_DRIVERS);
        }
        ok
    }
}

/// Requires the node to have enough healthy matching device instances.
/// Whether they are free is decided when ranking.
pub struct DeviceChecker {
    requests: Vec<RequestedDevice>,
}

impl DeviceChecker {
    pub fn new(tg: &TaskGroup) -> Self {
        Self {
            requests: tg
                .tasks
                .iter()
                .flat_map(|t| t.resources.devices.iter().cloned())
                .collect(),
        }
    }
}

impl FeasibilityChecker for DeviceChecker {
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        let ok = self.requests.iter().all(|request| {
            node.resources
                .devices
                .iter()
                .filter(|group| group.matches(request))
                .any(|group| group.healthy_ids().count() >= request.count as usize)
        });
        if !ok {
            ctx.metrics.filter_node(node, FILTER_MISSING_DEVICES);
        }
        ok
    }
}

/// Requires host volumes with compatible access.
pub struct HostVolumeChecker {
    volumes: Vec<VolumeRequest>,
    alloc_name: String,
}

impl HostVolumeChecker {
    pub fn new(tg: &TaskGroup, alloc_name: &str) -> Self {
        Self {
            volumes: tg
                .volumes
                .values()
                .filter(|v| v.kind == VolumeKind::Host)
                .cloned()
                .collect(),
            alloc_name: alloc_name.to_string(),
        }
    }
}

impl FeasibilityChecker for HostVolumeChecker {
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        let ok = self.volumes.iter().all(|request| {
            let source = request.source_for(&self.alloc_name);
            node.host_volumes
                .get(&source)
                .is_some_and(|vol| request.read_only || !vol.read_only)
        });
        if !ok {
            ctx.metrics.filter_node(node, FILTER_MISSING_HOST_VOLUMES);
        }
        ok
    }
}

/// Requires CSI volumes to be claimable from the node.
pub struct CsiVolumeChecker {
    namespace: String,
    volumes: Vec<VolumeRequest>,
    alloc_name: String,
    /// Claims held by the allocation being replaced don't block.
    previous: Option<AllocId>,
}

impl CsiVolumeChecker {
    pub fn new(
        namespace: &str,
        tg: &TaskGroup,
        alloc_name: &str,
        previous: Option<AllocId>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            volumes: tg
                .volumes
                .values()
                .filter(|v| v.kind == VolumeKind::Csi)
                .cloned()
                .collect(),
            alloc_name: alloc_name.to_string(),
            previous,
        }
    }

    fn check(&self, ctx: &EvalContext, node: &Node) -> Result<(), &'static str> {
        for request in &self.volumes {
            let source = request.source_for(&self.alloc_name);
            let Some(vol) = ctx.state.csi_volume_by_id(&self.namespace, &source) else {
                return Err(FILTER_MISSING_CSI_VOLUME);
            };
            if !vol.schedulable {
                return Err(FILTER_CSI_UNSCHEDULABLE);
            }
            let Some(plugin) = node.csi_node_plugins.get(&vol.plugin_id) else {
                return Err(FILTER_CSI_PLUGIN_MISSING);
            };
            if !plugin.healthy {
                return Err(FILTER_CSI_PLUGIN_UNHEALTHY);
            }
            if plugin.max_volumes > 0 {
                let already_here = vol.claimed_nodes().any(|n| *n == node.id);
                let mounted = ctx
                    .state
                    .csi_volumes_by_plugin(&vol.plugin_id)
                    .iter()
                    .filter(|v| v.claimed_nodes().any(|n| *n == node.id))
                    .count();
                if !already_here && mounted >= plugin.max_volumes as usize {
                    return Err(FILTER_CSI_MAX_VOLUMES);
                }
            }
            if !vol.reachable_from(&plugin.segments) {
                return Err(FILTER_CSI_TOPOLOGY);
            }
            if !vol.claimable(request.read_only, self.previous) {
                return Err(FILTER_CSI_CLAIMS);
            }
        }
        Ok(())
    }
}

impl FeasibilityChecker for CsiVolumeChecker {
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        match self.check(ctx, node) {
            Ok(()) => true,
            Err(reason) => {
                ctx.metrics.filter_node(node, reason);
                false
            }
        }
    }
}

/// Runs the tiered checks for one task group, caching class results.
pub struct FeasibilityWrapper {
    tg: String,
    job_checkers: Vec<Box<dyn FeasibilityChecker>>,
    tg_checkers: Vec<Box<dyn FeasibilityChecker>>,
    availability: Vec<Box<dyn FeasibilityChecker>>,
}

impl FeasibilityWrapper {
    /// Builds the checks for placing `alloc_name` of `tg`, marking the
    /// evaluation escaped where constraints read unique node data.
    pub fn new(
        ctx: &mut EvalContext,
        job: &Job,
        tg: &TaskGroup,
        alloc_name: &str,
        previous: Option<AllocId>,
    ) -> Self {
        let job_escaped = job.constraints.iter().any(Constraint::escapes_computed_class);
        ctx.eligibility.set_job_escaped(job_escaped);

        let tg_constraints: Vec<&Constraint> = tg
            .constraints
            .iter()
            .chain(tg.tasks.iter().flat_map(|t| t.constraints.iter()))
            .collect();
        let tg_escaped = tg_constraints.iter().any(|c| c.escapes_computed_class());
        ctx.eligibility.set_tg_escaped(&tg.name, tg_escaped);

        Self {
            tg: tg.name.clone(),
            job_checkers: vec![Box::new(ConstraintChecker::new(&job.constraints))],
            tg_checkers: vec![
                Box::new(DriverChecker::new(tg)),
                Box::new(ConstraintChecker::new(tg_constraints)),
                Box::new(DeviceChecker::new(tg)),
            ],
            availability: vec![
                Box::new(HostVolumeChecker::new(tg, alloc_name)),
                Box::new(CsiVolumeChecker::new(&job.namespace, tg, alloc_name, previous)),
            ],
        }
    }

    pub fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        let class = node.computed_class.as_str();

        match ctx.eligibility.job_status(class) {
            ClassStatus::Ineligible => {
                ctx.metrics.filter_node(node, FILTER_CLASS_INELIGIBLE);
                return false;
            }
            ClassStatus::Eligible => {}
            status => {
                let ok = run_all(&mut self.job_checkers, ctx, node);
                if status == ClassStatus::Unknown {
                    ctx.eligibility.set_job_eligibility(ok, class);
                }
                if !ok {
                    return false;
                }
            }
        }

        match ctx.eligibility.tg_status(&self.tg, class) {
            ClassStatus::Ineligible => {
                ctx.metrics.filter_node(node, FILTER_CLASS_INELIGIBLE);
                return false;
            }
            ClassStatus::Eligible => {}
            status => {
                let ok = run_all(&mut self.tg_checkers, ctx, node);
                if status == ClassStatus::Unknown {
                    ctx.eligibility.set_tg_eligibility(ok, &self.tg, class);
                }
                if !ok {
                    return false;
                }
            }
        }

        run_all(&mut self.availability, ctx, node)
    }
}

fn run_all(
    checkers: &mut [Box<dyn FeasibilityChecker>],
    ctx: &mut EvalContext,
    node: &Node,
) -> bool {
    checkers.iter_mut().all(|c| c.feasible(ctx, node))
}

/// `distinct_hosts` at job or group scope.
pub struct DistinctHostsChecker {
    job: Arc<Job>,
    tg: String,
    job_scope: bool,
    tg_scope: bool,
}

impl DistinctHostsChecker {
    pub fn new(job: &Arc<Job>, tg: &TaskGroup) -> Self {
        let is_distinct = |c: &Constraint| c.operand == Operand::DistinctHosts;
        Self {
            job: Arc::clone(job),
            tg: tg.name.clone(),
            job_scope: job.constraints.iter().any(is_distinct),
            tg_scope: tg.constraints.iter().any(is_distinct),
        }
    }
}

impl FeasibilityChecker for DistinctHostsChecker {
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        if !self.job_scope && !self.tg_scope {
            return true;
        }
        let collision = ctx
            .proposed_job_allocs(&self.job.namespace, &self.job.id)
            .iter()
            .filter(|a| a.node_id == node.id)
            .any(|a| self.job_scope || a.task_group == self.tg);
        if collision {
            ctx.metrics.filter_node(node, FILTER_DISTINCT_HOSTS);
        }
        !collision
    }
}

/// One `distinct_property` constraint and the allocations it counts.
struct PropertyLimit {
    attribute: String,
    limit: usize,
    /// `None` counts the whole job.
    tg: Option<String>,
}

/// `distinct_property` at job or group scope: at most `limit` allocations
/// per distinct value of the attribute.
pub struct DistinctPropertyChecker {
    job: Arc<Job>,
    limits: Vec<PropertyLimit>,
}

impl DistinctPropertyChecker {
    pub fn new(job: &Arc<Job>, tg: &TaskGroup) -> Self {
        let limit_of = |c: &Constraint, scope: Option<String>| PropertyLimit {
            attribute: c.l_target.clone(),
            limit: c.r_target.trim().parse::<usize>().unwrap_or(1).max(1),
            tg: scope,
        };
        let limits = job
            .constraints
            .iter()
            .filter(|c| c.operand == Operand::DistinctProperty)
            .map(|c| limit_of(c, None))
            .chain(
                tg.constraints
                    .iter()
                    .filter(|c| c.operand == Operand::DistinctProperty)
                    .map(|c| limit_of(c, Some(tg.name.clone()))),
            )
            .collect();
        Self {
            job: Arc::clone(job),
            limits,
        }
    }
}

impl FeasibilityChecker for DistinctPropertyChecker {
    fn feasible(&mut self, ctx: &mut EvalContext, node: &Node) -> bool {
        if self.limits.is_empty() {
            return true;
        }
        let proposed = ctx.proposed_job_allocs(&self.job.namespace, &self.job.id);

        for limit in &self.limits {
            let Some(value) = resolve_target(&limit.attribute, node) else {
                ctx.metrics.filter_node(node, FILTER_MISSING_PROPERTY);
                return false;
            };

            let used = proposed
                .iter()
                .filter(|a| limit.tg.as_ref().is_none_or(|tg| a.task_group == *tg))
                .filter(|a| {
                    let stored;
                    let host = if a.node_id == node.id {
                        node
                    } else {
                        match ctx.state.node_by_id(&a.node_id) {
                            Some(n) => {
                                stored = n;
                                &*stored
                            }
                            None => return false,
                        }
                    };
                    resolve_target(&limit.attribute, host).as_deref() == Some(value.as_ref())
                })
                .count();

            if used >= limit.limit {
                let reason = format!(
                    "distinct_property: {}={} used by {} allocs",
                    limit.attribute, value, used
                );
                ctx.metrics.filter_node(node, &reason);
                return false;
            }
        }
        true
    }
}
