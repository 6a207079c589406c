//! Fixture builders for tests.
//!
//! Every builder returns a fully-populated value that passes validation, so
//! tests only spell out the fields they care about.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use convoy_id::{AllocId, EvalId, NodeId};

use crate::{
    alloc_name, AllocClientStatus, AllocDesiredStatus, AllocatedResources,
    AllocatedSharedResources, AllocatedTaskResources, Allocation, CsiAccessMode, CsiVolume,
    DelayFunction, Deployment, DeploymentState, DriverInfo, DrainStrategy, EphemeralDisk,
    EvalTrigger, Evaluation, Job, JobType, NetworkResource, Node, NodeDevice,
    NodeDeviceResource, NodeReservedResources, NodeResources, NodeStatus, Port,
    ReschedulePolicy, Resources, SchedulingEligibility, Task, TaskGroup, DEFAULT_NAMESPACE,
    DEFAULT_NODE_POOL,
};

fn suffix() -> String {
    NodeId::new().short().to_lowercase()
}

/// A ready, eligible Linux node in `dc1` with the `exec` and `docker` drivers.
pub fn node() -> Node {
    let id = NodeId::new();
    let mut node = Node {
        id,
        name: format!("node-{}", id.short().to_lowercase()),
        datacenter: "dc1".to_string(),
        node_class: String::new(),
        node_pool: DEFAULT_NODE_POOL.to_string(),
        attributes: BTreeMap::from([
            ("kernel.name".to_string(), "linux".to_string()),
            ("cpu.arch".to_string(), "amd64".to_string()),
            ("unique.hostname".to_string(), format!("host-{}", id.short())),
        ]),
        meta: BTreeMap::from([("rack".to_string(), "r1".to_string())]),
        resources: NodeResources::default(),
        reserved: NodeReservedResources {
            cpu_shares: 0,
            cores: Vec::new(),
            memory_mb: 0,
            disk_mb: 0,
            reserved_ports: Vec::new(),
        },
        status: NodeStatus::Ready,
        scheduling_eligibility: SchedulingEligibility::Eligible,
        drain: None,
        drivers: BTreeMap::from([
            ("exec".to_string(), DriverInfo::default()),
            ("docker".to_string(), DriverInfo::default()),
        ]),
        host_volumes: BTreeMap::new(),
        csi_node_plugins: BTreeMap::new(),
        computed_class: String::new(),
        status_updated_at: None,
        create_index: 1,
        modify_index: 1,
    };
    node.compute_class();
    node
}

/// A node with `count` healthy `nvidia/gpu/1080ti` instances.
pub fn gpu_node(count: usize) -> Node {
    let mut node = node();
    node.resources.devices.push(NodeDeviceResource {
        vendor: "nvidia".to_string(),
        device_type: "gpu".to_string(),
        name: "1080ti".to_string(),
        instances: (0..count)
            .map(|i| NodeDevice {
                id: format!("gpu-{i}"),
                healthy: true,
            })
            .collect(),
        attributes: BTreeMap::from([("memory".to_string(), "11GiB".to_string())]),
    });
    node.compute_class();
    node
}

/// A node being drained.
pub fn drain_node() -> Node {
    let mut node = node();
    node.drain = Some(DrainStrategy {
        deadline: None,
        ignore_system_jobs: false,
    });
    node.scheduling_eligibility = SchedulingEligibility::Ineligible;
    node
}

fn web_group(count: u32, networks: bool) -> TaskGroup {
    TaskGroup {
        name: "web".to_string(),
        count,
        constraints: Vec::new(),
        affinities: Vec::new(),
        spreads: Vec::new(),
        tasks: vec![Task {
            name: "web".to_string(),
            driver: "exec".to_string(),
            config: serde_json::json!({ "command": "/bin/date" }),
            env: BTreeMap::new(),
            resources: Resources {
                cpu: 500,
                cores: 0,
                memory_mb: 256,
                memory_max_mb: 0,
                devices: Vec::new(),
            },
            constraints: Vec::new(),
            affinities: Vec::new(),
            meta: BTreeMap::new(),
        }],
        ephemeral_disk: EphemeralDisk {
            sticky: false,
            size_mb: 150,
            migrate: false,
        },
        networks: if networks {
            vec![NetworkResource {
                mode: "host".to_string(),
                mbits: 0,
                reserved_ports: Vec::new(),
                dynamic_ports: vec![Port::new("http", 0)],
            }]
        } else {
            Vec::new()
        },
        volumes: BTreeMap::new(),
        update: None,
        reschedule_policy: Some(ReschedulePolicy {
            attempts: 2,
            interval: Duration::from_secs(10 * 60),
            delay: Duration::from_secs(5),
            delay_function: DelayFunction::Constant,
            max_delay: Duration::ZERO,
            unlimited: false,
        }),
        migrate: None,
        disconnect: None,
        meta: BTreeMap::new(),
    }
}

fn base_job(job_type: JobType, count: u32, networks: bool) -> Job {
    let mut job = Job {
        namespace: DEFAULT_NAMESPACE.to_string(),
        id: format!("mock-{}-{}", job_type, suffix()),
        name: String::new(),
        job_type,
        priority: 50,
        datacenters: vec!["dc1".to_string()],
        node_pool: DEFAULT_NODE_POOL.to_string(),
        constraints: Vec::new(),
        affinities: Vec::new(),
        spreads: Vec::new(),
        task_groups: vec![web_group(count, networks)],
        update: None,
        stop: false,
        stable: false,
        version: 0,
        create_index: 42,
        modify_index: 99,
        job_modify_index: 99,
        meta: BTreeMap::new(),
    };
    job.canonicalize();
    job
}

/// Service job with one `web` group of 10, each asking 500 CPU / 256 MB and
/// one dynamic port.
pub fn job() -> Job {
    base_job(JobType::Service, 10, true)
}

/// Batch job with one `web` group of 10.
pub fn batch_job() -> Job {
    base_job(JobType::Batch, 10, false)
}

/// System job; one allocation per eligible node.
pub fn system_job() -> Job {
    let mut job = base_job(JobType::System, 1, false);
    job.priority = 100;
    job.task_groups[0].reschedule_policy = None;
    job
}

pub fn sysbatch_job() -> Job {
    let mut job = base_job(JobType::Sysbatch, 1, false);
    job.task_groups[0].reschedule_policy = None;
    job
}

/// Running allocation of `job`'s first group on `node` with the given index.
pub fn alloc_for(job: &Arc<Job>, node: &Node, index: u32) -> Allocation {
    let tg = &job.task_groups[0];
    let now = Utc::now();
    let tasks = tg
        .tasks
        .iter()
        .map(|t| {
            (
                t.name.clone(),
                AllocatedTaskResources {
                    cpu_shares: t.resources.cpu,
                    reserved_cores: Vec::new(),
                    memory_mb: t.resources.memory_mb,
                    memory_max_mb: t.resources.memory_max_mb,
                    devices: Vec::new(),
                },
            )
        })
        .collect();
    Allocation {
        id: AllocId::new(),
        namespace: job.namespace.clone(),
        eval_id: EvalId::new(),
        name: alloc_name(&job.id, &tg.name, index),
        node_id: node.id,
        node_name: node.name.clone(),
        job_id: job.id.clone(),
        job: Some(Arc::clone(job)),
        task_group: tg.name.clone(),
        allocated_resources: AllocatedResources {
            tasks,
            shared: AllocatedSharedResources {
                disk_mb: tg.ephemeral_disk.size_mb,
                ports: Vec::new(),
                mbits: 0,
            },
        },
        metrics: None,
        desired_status: AllocDesiredStatus::Run,
        desired_description: String::new(),
        desired_transition: Default::default(),
        client_status: AllocClientStatus::Running,
        client_description: String::new(),
        deployment_id: None,
        deployment_status: None,
        reschedule_tracker: None,
        followup_eval_id: None,
        previous_allocation: None,
        next_allocation: None,
        preempted_allocations: Vec::new(),
        preempted_by_allocation: None,
        alloc_states: Vec::new(),
        create_index: 100,
        modify_index: 100,
        alloc_modify_index: 100,
        create_time: now,
        modify_time: now,
    }
}

/// Pending allocation of a fresh [`job`] on a random node.
pub fn alloc() -> Allocation {
    let job = Arc::new(job());
    let node = node();
    let mut alloc = alloc_for(&job, &node, 0);
    alloc.client_status = AllocClientStatus::Pending;
    alloc
}

/// Pending job-register evaluation for a fresh [`job`].
pub fn eval() -> Evaluation {
    Evaluation::for_job(&job(), EvalTrigger::JobRegister, Utc::now())
}

/// Running deployment for `job` with one state per group.
pub fn deployment(job: &Job) -> Deployment {
    let mut d = Deployment::new(job);
    for tg in &job.task_groups {
        let update = tg.update.clone().unwrap_or_default();
        d.task_groups.insert(
            tg.name.clone(),
            DeploymentState {
                auto_revert: update.auto_revert,
                auto_promote: update.auto_promote,
                desired_canaries: update.canary,
                desired_total: tg.count,
                progress_deadline: update.progress_deadline,
                ..Default::default()
            },
        );
    }
    d
}

/// Single-node-writer CSI volume served by `plugin_id`.
pub fn csi_volume(id: &str, plugin_id: &str) -> CsiVolume {
    CsiVolume {
        id: id.to_string(),
        namespace: DEFAULT_NAMESPACE.to_string(),
        plugin_id: plugin_id.to_string(),
        access_mode: CsiAccessMode::SingleNodeWriter,
        topologies: Vec::new(),
        schedulable: true,
        read_claims: BTreeMap::new(),
        write_claims: BTreeMap::new(),
    }
}
