use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use converge_checks::{
    claim_capacity, pod_phase, volume_capacity, Absent, ClaimCapacityChanged, CountEquals, PodRunning, SnapshotReady,
    VolumeCapacityChanged,
};
use converge_kubehub::{app_selector, DeleteUntilGone, KubeApi, KubeClient, KubeFetch, KubeWatch, SelectorList};
use converge_wait::{
    Classifier, EventDrivenWaiter, FetchSource, PollingWaiter, ResourceIdentity, StopSignal, WaitConfig, WaitOptions,
    WaitOutcome,
};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{info, warn};

const SNAPSHOT_GVK: &str = "snapshot.storage.k8s.io/v1/VolumeSnapshot";

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Wait for Kubernetes resources to converge")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the target resource
    #[arg(long = "ns", global = true, env = "CONVERGE_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Overall deadline in seconds (overrides CONVERGE_DEADLINE_SECS)
    #[arg(long = "deadline", global = true)]
    deadline_secs: Option<u64>,

    /// Poll interval in seconds (overrides CONVERGE_POLL_SECS)
    #[arg(long = "interval", global = true)]
    poll_secs: Option<u64>,

    /// Bound on subscription teardown in seconds (overrides CONVERGE_TEARDOWN_GRACE_SECS)
    #[arg(long = "teardown-grace", global = true)]
    teardown_grace_secs: Option<u64>,

    /// Tracing filter directives
    #[arg(long = "log", global = true, env = "CONVERGE_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", global = true, env = "CONVERGE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for a pod to reach Running
    PodRunning {
        name: String,
        /// Poll with GET instead of watching
        #[arg(long)]
        poll: bool,
    },
    /// Wait until an object no longer exists
    Deleted {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        gvk: String,
        name: String,
    },
    /// Delete an object, repeating the delete until it is gone
    Delete {
        /// GVK key, e.g. "v1/PersistentVolumeClaim" or "v1/Namespace"
        gvk: String,
        name: String,
    },
    /// Wait until exactly COUNT pods labelled app=APP exist
    PodCount { app: String, count: usize },
    /// Wait for a bound volume to report a new storage capacity
    PvResized {
        name: String,
        /// Capacity to move away from (default: current capacity)
        #[arg(long = "from")]
        baseline: Option<String>,
    },
    /// Wait for a bound claim to report a new storage capacity
    PvcResized {
        name: String,
        /// Capacity to move away from (default: current capacity)
        #[arg(long = "from")]
        baseline: Option<String>,
    },
    /// Wait for a volume snapshot to become ready to use
    SnapshotReady {
        name: String,
        #[arg(long = "gvk", default_value = SNAPSHOT_GVK)]
        gvk: String,
    },
}

/// Logs go to stderr so `-o json` output on stdout stays machine-readable.
fn init_telemetry(cli: &Cli) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log).with_context(|| format!("invalid log filter {:?}", cli.log))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("serving metrics on {}", addr))?;
        info!(%addr, "prometheus exporter listening");
    }
    Ok(())
}

/// Everything a subcommand needs to run one wait.
struct Ctx {
    client: KubeClient,
    namespace: String,
    cfg: WaitConfig,
    cancel: StopSignal,
}

impl Ctx {
    fn options(&self) -> WaitOptions {
        self.cfg.options().with_cancel(self.cancel.clone())
    }

    fn target(&self, kind: &str, namespaced: bool, name: &str) -> ResourceIdentity {
        if namespaced {
            ResourceIdentity::namespaced(kind, &self.namespace, name)
        } else {
            ResourceIdentity::cluster(kind, name)
        }
    }

    async fn watch_for<K, C>(&self, api: KubeApi<K>, target: &ResourceIdentity, classifier: &C) -> WaitOutcome<C::Output>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        C: Classifier<K>,
    {
        let watch = KubeWatch::new(api).with_buffer(self.cfg.watch_buffer);
        EventDrivenWaiter::with_options(watch, self.options()).await_condition(target, classifier, self.cfg.deadline).await
    }

    async fn poll_for<S, F, C>(&self, source: F, target: &ResourceIdentity, classifier: &C) -> WaitOutcome<C::Output>
    where
        S: Send + 'static,
        F: FetchSource<S>,
        C: Classifier<S>,
    {
        PollingWaiter::with_options(source, self.options())
            .poll_until(target, classifier, self.cfg.poll_interval, self.cfg.deadline)
            .await
    }
}

#[derive(serde::Serialize)]
struct Report {
    target: String,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    elapsed_ms: u64,
}

impl Report {
    fn new<T>(target: &ResourceIdentity, started: Instant, outcome: &WaitOutcome<T>, describe: impl FnOnce(&T) -> Option<String>) -> Self {
        let (reason, detail) = match outcome {
            WaitOutcome::Success(v) => (None, describe(v)),
            WaitOutcome::TerminalFailure(r) => (Some(r.clone()), None),
            WaitOutcome::TransportError(e) => (Some(e.to_string()), None),
            WaitOutcome::Timeout | WaitOutcome::Cancelled => (None, None),
        };
        Self { target: target.to_string(), outcome: outcome.label(), reason, detail, elapsed_ms: started.elapsed().as_millis() as u64 }
    }

    fn print(&self, output: Output) -> Result<()> {
        match output {
            Output::Human => {
                let mut line = format!("{} • {} • {}ms", self.target, self.outcome, self.elapsed_ms);
                if let Some(r) = &self.reason {
                    line.push_str(&format!(" • {}", r));
                }
                if let Some(d) = &self.detail {
                    line.push_str(&format!(" • {}", d));
                }
                println!("{}", line);
            }
            Output::Json => println!("{}", serde_json::to_string_pretty(self)?),
        }
        Ok(())
    }

    fn into_exit(self) -> Result<()> {
        if self.outcome == "success" {
            Ok(())
        } else {
            bail!("wait for {} ended with {}", self.target, self.outcome)
        }
    }
}

fn quantity(raw: Option<String>, current: Option<&Quantity>, what: &str) -> Result<Quantity> {
    match (raw, current) {
        (Some(q), _) => Ok(Quantity(q)),
        (None, Some(q)) => Ok(q.clone()),
        (None, None) => Err(anyhow!("{} reports no storage capacity; pass --from", what)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli)?;

    let mut cfg = WaitConfig::from_env()?;
    if let Some(s) = cli.deadline_secs {
        cfg.deadline = Duration::from_secs(s);
    }
    if let Some(s) = cli.poll_secs {
        cfg.poll_interval = Duration::from_secs(s);
    }
    if let Some(s) = cli.teardown_grace_secs {
        cfg.teardown_grace = Duration::from_secs(s);
    }
    cfg.validate()?;

    let cancel = StopSignal::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; cancelling wait");
                cancel.raise();
            }
        }
    });

    let ctx = Ctx { client: converge_kubehub::client().await?, namespace: cli.namespace.clone(), cfg, cancel };
    let started = Instant::now();

    let report = match cli.command {
        Commands::PodRunning { name, poll } => {
            let api = KubeApi::<Pod>::namespaced(ctx.client.clone());
            let target = ctx.target(api.kind(), true, &name);
            info!(resource = %target, poll, "pod-running invoked");
            let outcome = if poll {
                ctx.poll_for(KubeFetch::new(api), &target, &PodRunning).await
            } else {
                ctx.watch_for(api, &target, &PodRunning).await
            };
            Report::new(&target, started, &outcome, |pod| {
                pod_phase(pod).map(|phase| format!("phase={} node={}", phase, pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or("-")))
            })
        }
        Commands::Deleted { gvk, name } => {
            let api = KubeApi::discover(ctx.client.clone(), &gvk).await?;
            let target = ctx.target(api.kind(), api.is_namespaced(), &name);
            info!(resource = %target, "deleted invoked");
            let outcome = ctx.poll_for(KubeFetch::new(api), &target, &Absent).await;
            Report::new(&target, started, &outcome, |_| None)
        }
        Commands::Delete { gvk, name } => {
            let api = KubeApi::discover(ctx.client.clone(), &gvk).await?;
            let target = ctx.target(api.kind(), api.is_namespaced(), &name);
            info!(resource = %target, "delete invoked");
            let outcome = ctx.poll_for(DeleteUntilGone::new(api), &target, &Absent).await;
            Report::new(&target, started, &outcome, |_| None)
        }
        Commands::PodCount { app, count } => {
            let api = KubeApi::<Pod>::namespaced(ctx.client.clone());
            let selector = app_selector(&app);
            let target = ctx.target(api.kind(), true, &selector);
            let listing = SelectorList::new(api, selector);
            info!(resource = %target, selector = listing.selector(), count, "pod-count invoked");
            let outcome = ctx.poll_for(listing, &target, &CountEquals { expected: count }).await;
            Report::new(&target, started, &outcome, |pods| Some(pods.iter().map(|p| p.name_any()).collect::<Vec<_>>().join(",")))
        }
        Commands::PvResized { name, baseline } => {
            let api = KubeApi::<PersistentVolume>::cluster(ctx.client.clone());
            let target = ctx.target(api.kind(), false, &name);
            let current = KubeFetch::new(api.clone()).fetch(&target).await?.with_context(|| format!("{} not found", target))?;
            let baseline = quantity(baseline, volume_capacity(&current), &target.to_string())?;
            info!(resource = %target, baseline = %baseline.0, "pv-resized invoked");
            let outcome = ctx.watch_for(api, &target, &VolumeCapacityChanged { baseline }).await;
            Report::new(&target, started, &outcome, |pv| volume_capacity(pv).map(|q| format!("capacity={}", q.0)))
        }
        Commands::PvcResized { name, baseline } => {
            let api = KubeApi::<PersistentVolumeClaim>::namespaced(ctx.client.clone());
            let target = ctx.target(api.kind(), true, &name);
            let current = KubeFetch::new(api.clone()).fetch(&target).await?.with_context(|| format!("{} not found", target))?;
            let baseline = quantity(baseline, claim_capacity(&current), &target.to_string())?;
            info!(resource = %target, baseline = %baseline.0, "pvc-resized invoked");
            let outcome = ctx.watch_for(api, &target, &ClaimCapacityChanged { baseline }).await;
            Report::new(&target, started, &outcome, |pvc| claim_capacity(pvc).map(|q| format!("capacity={}", q.0)))
        }
        Commands::SnapshotReady { name, gvk } => {
            let api = KubeApi::discover(ctx.client.clone(), &gvk).await?;
            let target = ctx.target(api.kind(), api.is_namespaced(), &name);
            info!(resource = %target, "snapshot-ready invoked");
            let outcome = ctx.watch_for(api, &target, &SnapshotReady).await;
            Report::new(&target, started, &outcome, |snap| {
                snap.data.pointer("/status/restoreSize").and_then(|v| v.as_str()).map(|s| format!("restoreSize={}", s))
            })
        }
    };

    if report.outcome != "success" {
        warn!(resource = %report.target, outcome = report.outcome, "wait did not succeed");
    }
    report.print(cli.output)?;
    report.into_exit()
}
