use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use conform_core::{ResourceId, ScopeId, StatusError};
use conform_graph::DependencyGraph;
use conform_inventory::{InventoryStore, DEFAULT_NAMESPACE};
use conform_kubehub::{Backoff, ClusterClient, KubeCluster};
use conform_ownership::ConflictPolicy;
use conform_reconciler::{DirSource, Reconciler, ReconcilerConfig, SyncStatus};
use conform_remediator::WatchRegistry;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "conformctl", version, about = "conform: keep a cluster converged to a manifest directory")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Args, Debug, Clone)]
struct ScopeArgs {
    /// Reconciler name; part of the ownership stamp
    #[arg(long = "name", env = "CONFORM_SCOPE_NAME", default_value = "root")]
    name: String,
    /// Bind the reconciler to one namespace (namespace scope); root scope when omitted
    #[arg(long = "scope-ns", env = "CONFORM_SCOPE_NAMESPACE")]
    namespace: Option<String>,
    /// Namespace holding root scope inventories
    #[arg(long = "inventory-ns", env = "CONFORM_INVENTORY_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    inventory_namespace: String,
    /// Attempts per cluster call before giving up
    #[arg(long = "retry-attempts", env = "CONFORM_RETRY_ATTEMPTS", default_value_t = 6)]
    retry_attempts: u32,
}

impl ScopeArgs {
    fn scope(&self) -> ScopeId {
        match &self.namespace {
            Some(ns) => ScopeId::namespaced(ns.clone(), self.name.clone()),
            None => ScopeId::root(self.name.clone()),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff { max_attempts: self.retry_attempts.max(1), ..Backoff::default() }
    }
}

#[derive(Args, Debug, Clone)]
struct ApplyArgs {
    /// Directory of rendered manifests (YAML or JSON, multi-document)
    #[arg(long = "dir", env = "CONFORM_MANIFEST_DIR")]
    dir: PathBuf,
    #[command(flatten)]
    scope: ScopeArgs,
    /// Let this root scope take over objects held by namespace scopes
    #[arg(long = "root-preempts-namespace", env = "CONFORM_ROOT_PREEMPTS_NAMESPACE", action = ArgAction::SetTrue)]
    root_preempts_namespace: bool,
}

impl ApplyArgs {
    fn config(&self) -> ReconcilerConfig {
        let mut config = ReconcilerConfig::new(self.scope.scope()).with_backoff(self.scope.backoff());
        config.inventory_namespace = self.scope.inventory_namespace.clone();
        config.policy = ConflictPolicy { root_preempts_namespace: self.root_preempts_namespace, ..ConflictPolicy::default() };
        config
    }

    fn source(&self) -> DirSource {
        DirSource::new(self.dir.clone(), self.scope.namespace.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile continuously, correcting drift between cycles, until Ctrl-C
    Run {
        #[command(flatten)]
        apply: ApplyArgs,
        /// Seconds between checks for a new manifest revision
        #[arg(long = "poll-secs", env = "CONFORM_POLL_SECS", default_value_t = 15)]
        poll_secs: u64,
        /// Seconds after which a cycle runs even without a new revision
        #[arg(long = "resync-secs", env = "CONFORM_RESYNC_SECS", default_value_t = 3600)]
        resync_secs: u64,
    },
    /// Run exactly one apply cycle and print its status
    Apply {
        #[command(flatten)]
        apply: ApplyArgs,
    },
    /// Print the apply order of a manifest directory without contacting the cluster
    Plan {
        /// Directory of rendered manifests
        #[arg(long = "dir", env = "CONFORM_MANIFEST_DIR")]
        dir: PathBuf,
        /// Namespace filled into manifests that leave it empty
        #[arg(long = "default-ns")]
        default_namespace: Option<String>,
    },
    /// Print a scope's persisted inventory
    Inventory {
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("CONFORM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONFORM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONFORM_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect() -> Result<Arc<dyn ClusterClient>> {
    let cluster = KubeCluster::try_default().await.context("connecting to the cluster")?;
    Ok(Arc::new(cluster))
}

fn print_status(output: Output, status: &SyncStatus) -> Result<()> {
    match output {
        Output::Human => print!("{}", status.render()),
        Output::Json => println!("{}", serde_json::to_string_pretty(status)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { apply, poll_secs, resync_secs } => {
            let mut config = apply.config();
            config.poll_period = Duration::from_secs(poll_secs.max(1));
            config.resync_period = Duration::from_secs(resync_secs.max(1));
            info!(scope = %config.scope, dir = %apply.dir.display(), "run invoked");
            let cluster = connect().await?;
            let watches = Arc::new(WatchRegistry::new(Arc::clone(&cluster), config.backoff.clone()));
            let reconciler = Reconciler::new(config, cluster, Arc::new(apply.source()), watches);

            let mut status = reconciler.status();
            let output = cli.output;
            let printer = tokio::spawn(async move {
                while let Some(s) = status.changed().await {
                    if let Err(e) = print_status(output, &s) {
                        warn!(error = %e, "failed to print status");
                    }
                }
            });
            reconciler
                .run(async {
                    if let Err(e) = signal::ctrl_c().await {
                        warn!(error = %e, "cannot listen for Ctrl-C; stopping");
                    }
                    info!("Ctrl-C received; shutting down");
                })
                .await;
            let _ = printer.await;
        }
        Commands::Apply { apply } => {
            let config = apply.config();
            info!(scope = %config.scope, dir = %apply.dir.display(), "apply invoked");
            let cluster = connect().await?;
            let watches = Arc::new(WatchRegistry::new(Arc::clone(&cluster), config.backoff.clone()));
            let mut reconciler = Reconciler::new(config, cluster, Arc::new(apply.source()), watches);
            let status = reconciler.run_cycle().await;
            print_status(cli.output, &status)?;
            if !status.is_healthy() {
                bail!("apply finished with {} error(s)", status.errors.len());
            }
        }
        Commands::Plan { dir, default_namespace } => {
            let set = DirSource::new(dir.clone(), default_namespace)
                .load()
                .with_context(|| format!("reading {}", dir.display()))?;
            let graph = DependencyGraph::build(set.resources.iter());
            let order = graph.order();
            let errors: Vec<StatusError> = order.errors().iter().map(|e| e.to_status()).collect();
            match cli.output {
                Output::Human => {
                    println!("revision {}  resources {}", set.revision, set.resources.len());
                    for (i, layer) in order.layers.iter().enumerate() {
                        println!("layer {}:", i);
                        for id in layer {
                            let external = graph.external_prerequisites(id);
                            if external.is_empty() {
                                println!("  {}", id);
                            } else {
                                let refs: Vec<String> = external.iter().map(ToString::to_string).collect();
                                println!("  {}  (waits for {})", id, refs.join(", "));
                            }
                        }
                    }
                    for e in &errors {
                        println!("{} {}", e.code, e.message);
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Plan<'a> {
                        revision: &'a str,
                        layers: &'a [Vec<ResourceId>],
                        errors: &'a [StatusError],
                    }
                    let plan = Plan { revision: &set.revision, layers: &order.layers, errors: &errors };
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                }
            }
        }
        Commands::Inventory { scope } => {
            let id = scope.scope();
            info!(scope = %id, "inventory invoked");
            let cluster = connect().await?;
            let store = InventoryStore::new(cluster, id, &scope.inventory_namespace, scope.backoff());
            let inv = store.load().await.with_context(|| format!("reading inventory {}", store.id()))?;
            match cli.output {
                Output::Human => {
                    println!("{}  owner {}  generation {}  entries {}", store.id(), inv.owner, inv.generation, inv.len());
                    for e in &inv.entries {
                        println!("  {}", e);
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> {
                        owner: &'a ScopeId,
                        generation: u64,
                        entries: Vec<&'a ResourceId>,
                    }
                    let row = Row { owner: &inv.owner, generation: inv.generation, entries: inv.entries.iter().collect() };
                    println!("{}", serde_json::to_string_pretty(&row)?);
                }
            }
        }
    }

    Ok(())
}
