use anyhow::Context;
use clap::Parser;
use devmux::logging::{init_with_config, LoggingConfig};
use devmux::resources::JobUsage;
use devmux::task::{GraphId, NodeId, OutputSpec};
use devmux::{
    Completion, DeviceSpec, DeviceType, Dispatcher, ExecConfig, ExecStatus, ExecutionContext,
    JobId, Metrics, NodeKey, Operation, ResourceMap, ResourceTag, StaticDeviceRegistry,
};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "devmux-sim", version)]
#[command(about = "Run a synthetic workload through the admission-controlled dispatcher", long_about = None)]
struct Cli {
    /// JSON executor configuration (defaults, then DEVMUX_* overrides, otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated GPUs
    #[arg(long, default_value_t = 2)]
    gpus: u32,

    /// Memory per GPU in bytes, unless the config sets it
    #[arg(long, default_value_t = 1 << 30)]
    gpu_memory: u64,

    /// Host memory in bytes, unless the config sets it
    #[arg(long, default_value_t = 4 << 30)]
    cpu_memory: u64,

    #[arg(long, default_value_t = 4)]
    jobs: u64,

    #[arg(long, default_value_t = 64)]
    ops_per_job: u32,

    /// Largest single operation output in bytes
    #[arg(long, default_value_t = 256 << 20)]
    max_op_bytes: u64,

    /// Probability that an attempt reports running out of memory
    #[arg(long, default_value_t = 0.05)]
    exhaustion_rate: f64,

    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Also print metrics in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

#[derive(Debug)]
struct SimOp {
    key: NodeKey,
    job: JobId,
    bytes: u64,
    types: Vec<DeviceType>,
    exhaustion_rate: f64,
}

impl Operation for SimOp {
    fn key(&self) -> NodeKey {
        self.key
    }

    fn job(&self) -> JobId {
        self.job
    }

    fn op_type(&self) -> &str {
        "SimOp"
    }

    fn supported_device_types(&self) -> Vec<DeviceType> {
        self.types.clone()
    }

    fn output_specs(&self) -> Option<Vec<OutputSpec>> {
        Some(vec![OutputSpec::new(&[self.bytes], 1)])
    }

    fn execute(&self, ctx: ExecutionContext, completion: Completion) {
        let scratch = self.bytes / 4;
        if rand::random::<f64>() < self.exhaustion_rate || !ctx.device().allocate(scratch) {
            completion.complete(ExecStatus::ResourceExhausted);
            return;
        }
        ctx.device().deallocate(scratch);
        completion.complete(ExecStatus::Ok);
    }
}

#[derive(Debug, Serialize)]
struct Report {
    ops: usize,
    succeeded: usize,
    failed: usize,
    memory_failures: u32,
    admission_retries: usize,
    elapsed_ms: u128,
    dispatcher: devmux::DispatcherStats,
}

fn load_config(cli: &Cli) -> anyhow::Result<ExecConfig> {
    let mut config = match &cli.config {
        Some(path) => ExecConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => ExecConfig::from_env().context("reading DEVMUX_* environment")?,
    };
    if config.device_memory.is_empty() {
        config = config.with_device_memory(DeviceSpec::cpu(0), cli.cpu_memory);
        for id in 0..cli.gpus {
            config = config.with_device_memory(DeviceSpec::gpu(id), cli.gpu_memory);
        }
    }
    Ok(config)
}

fn workload(cli: &Cli, dispatcher: &Dispatcher) -> anyhow::Result<VecDeque<(Arc<SimOp>, usize)>> {
    let mut rng = rand::thread_rng();
    let max_bytes = cli.max_op_bytes.max(1);
    let levels = dispatcher.config().max_priority;
    let mut ops = VecDeque::new();

    for job in 0..cli.jobs {
        let job_id = JobId(job);
        let mut peak = ResourceMap::new();
        for node in 0..cli.ops_per_job {
            let bytes = rng.gen_range(1..=max_bytes);
            let types = match rng.gen_range(0..4) {
                0 => vec![DeviceType::Cpu],
                1 => vec![DeviceType::Gpu],
                _ => vec![DeviceType::Cpu, DeviceType::Gpu],
            };
            for id in 0..cli.gpus {
                let tag = ResourceTag::memory(DeviceSpec::gpu(id));
                if peak.get(&tag) < bytes {
                    peak.set(tag, bytes);
                }
            }
            ops.push_back((
                Arc::new(SimOp {
                    key: NodeKey::new(GraphId(job), NodeId(node)),
                    job: job_id,
                    bytes,
                    types,
                    exhaustion_rate: cli.exhaustion_rate,
                }),
                rng.gen_range(0..levels),
            ));
        }
        dispatcher.tracker().set_baseline(
            job_id,
            JobUsage {
                persistent: ResourceMap::new(),
                temporary: peak,
            },
        )?;
    }
    Ok(ops)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_with_config(&LoggingConfig::from_env())?;

    let config = load_config(&cli)?;
    let registry = Arc::new(StaticDeviceRegistry::with_host_and_gpus(cli.gpus));
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Dispatcher::new(config, registry)?.with_metrics(Arc::clone(&metrics));

    let queue = Mutex::new(workload(&cli, &dispatcher)?);
    let total = queue.lock().map(|q| q.len()).unwrap_or(0);
    let totals = Mutex::new((0usize, 0usize, 0u32, 0usize));
    tracing::info!(ops = total, workers = cli.workers, gpus = cli.gpus, "Starting simulation");

    let started = Instant::now();
    std::thread::scope(|scope| {
        for _ in 0..cli.workers.max(1) {
            scope.spawn(|| loop {
                let next = match queue.lock() {
                    Ok(mut q) => q.pop_front(),
                    Err(_) => None,
                };
                let Some((op, priority)) = next else {
                    break;
                };
                let mut task = dispatcher.create_task(op);
                let result = dispatcher.dispatch(&mut task, priority);
                if let Ok(mut t) = totals.lock() {
                    match result {
                        Ok(report) => {
                            t.0 += 1;
                            t.2 += report.memory_failures;
                            t.3 += report.admission_retries;
                        }
                        Err(_) => t.1 += 1,
                    }
                }
            });
        }
    });

    for job in 0..cli.jobs {
        dispatcher.flush_graph(GraphId(job))?;
    }

    let (succeeded, failed, memory_failures, admission_retries) = *totals
        .lock()
        .map_err(|_| anyhow::anyhow!("worker panicked while recording results"))?;
    let report = Report {
        ops: total,
        succeeded,
        failed,
        memory_failures,
        admission_retries,
        elapsed_ms: started.elapsed().as_millis(),
        dispatcher: dispatcher.stats()?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if cli.prometheus {
        print!("{}", metrics.export());
    }
    Ok(())
}
