use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_cache::CacheEngine;
use vigil_controller::{Manager, ManagerConfig};
use vigil_core::{Tenancy, TokenResolver, UpdateEvent};
use vigil_datasource::{new_correlation_id, DataSource};
use vigil_store::{ResourceStore, WatchSet};

mod world;

use world::{RemoteCatalog, ServiceQuery, World, LOCAL_DC, REMOTE_DC};

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Vigil CLI")]
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

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered resource types
    Types,
    /// Run the two-datacenter demo: local and remote subscriptions plus the workload controller
    Demo {
        /// How long to run
        #[arg(long = "seconds", default_value_t = 3)]
        seconds: u64,
        /// Pause between simulated changes
        #[arg(long = "interval-ms", default_value_t = 500)]
        interval_ms: u64,
    },
    /// Subscribe to a service address and print every update
    Watch {
        #[arg(default_value = "web")]
        service: String,
        /// Datacenter to read from; anything but dc1 goes through the cache
        #[arg(long = "dc", default_value = LOCAL_DC)]
        dc: String,
        #[arg(long = "token", env = "VIGIL_TOKEN", default_value = "operator")]
        token: String,
        #[arg(long = "interval-ms", default_value_t = 500)]
        interval_ms: u64,
        /// Stop after this many events
        #[arg(long = "count")]
        count: Option<usize>,
        /// Revoke the token after this many events
        #[arg(long = "revoke-after")]
        revoke_after: Option<usize>,
    },
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Types => list_types(cli.output)?,
        Commands::Demo { seconds, interval_ms } => {
            info!(seconds, interval_ms, "demo invoked");
            run_demo(cli.output, Duration::from_secs(seconds), Duration::from_millis(interval_ms)).await?;
        }
        Commands::Watch { service, dc, token, interval_ms, count, revoke_after } => {
            let query = ServiceQuery { name: service, datacenter: dc, token };
            run_watch(cli.output, query, Duration::from_millis(interval_ms), count, revoke_after).await?;
        }
    }
    Ok(())
}

fn list_types(output: Output) -> Result<()> {
    let world = World::build(CancellationToken::new())?;
    let types = world.registry.types();
    match output {
        Output::Human => {
            println!("GVK                    SCHEMA                 DESCRIPTION");
            for reg in &types {
                println!("{:<22} {:<22} {}", reg.ty.gvk(), reg.schema.name, reg.schema.description);
            }
        }
        Output::Json => {
            let items: Vec<_> = types.iter().map(|reg| json!({ "gvk": reg.ty.gvk(), "schema": reg.schema })).collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

fn print_event(output: Output, source: &str, ev: &UpdateEvent<Option<String>>) -> Result<()> {
    match output {
        Output::Human => match &ev.result {
            Ok(value) => println!("{:<7} #{:<5} {}", source, ev.index, value.as_deref().unwrap_or("<none>")),
            Err(err) => println!("{:<7} #{:<5} error: {}", source, ev.index, err),
        },
        Output::Json => {
            let line = match &ev.result {
                Ok(value) => json!({
                    "source": source,
                    "correlation_id": ev.correlation_id,
                    "index": ev.index,
                    "value": value,
                }),
                Err(err) => json!({
                    "source": source,
                    "correlation_id": ev.correlation_id,
                    "index": ev.index,
                    "error": err.to_string(),
                    "kind": err.kind(),
                }),
            };
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

/// Apply one round of simulated change per tick until cancelled.
async fn drive(world: Arc<World>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut round: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        round += 1;
        if let Err(err) = world.step(round) {
            warn!(round, error = %err, "demo step failed");
        }
    }
}

async fn run_demo(output: Output, duration: Duration, interval: Duration) -> Result<()> {
    let cancel = CancellationToken::new();
    let world = Arc::new(World::build(cancel.child_token())?);
    world.seed()?;

    let manager = Arc::new(Manager::with_config(world.local.clone(), world.registry.clone(), ManagerConfig::from_env()));
    manager.register(world::workload_controller())?;
    let manager_task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    let local_query = ServiceQuery { name: "web".into(), datacenter: LOCAL_DC.into(), token: "web-reader".into() };
    let remote_query = ServiceQuery { name: "web".into(), datacenter: REMOTE_DC.into(), token: "operator".into() };
    let mut local = world.dispatch.subscribe(local_query, new_correlation_id()).await?;
    let mut remote = world.dispatch.subscribe(remote_query, new_correlation_id()).await?;
    let driver = tokio::spawn(drive(world.clone(), interval, cancel.clone()));

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping demo");
                break;
            }
            Some(ev) = local.next() => print_event(output, "local", &ev)?,
            Some(ev) = remote.next() => print_event(output, "remote", &ev)?,
        }
    }

    cancel.cancel();
    drop(local);
    drop(remote);
    if let Err(err) = driver.await {
        warn!(error = %err, "demo driver ended abnormally");
    }
    manager_task.await??;
    world.cache.close();
    print_summary(output, &world, &manager, &world.cache)?;
    Ok(())
}

fn print_summary(output: Output, world: &World, manager: &Manager, cache: &CacheEngine<RemoteCatalog>) -> Result<()> {
    let statuses = manager.statuses();
    let stats = cache.stats();
    let operator = world.tokens.resolve("operator")?;
    world.registry.admit_list(operator.as_ref(), &world::workload_type(), &Tenancy::default())?;
    let (_, workloads) = world.local.list(&mut WatchSet::new(), &world::workload_type(), None)?;
    match output {
        Output::Human => {
            println!();
            println!("CONTROLLER        QUEUED  IN-FLIGHT  RECONCILES  FAILURES  DEGRADED");
            for s in &statuses {
                println!(
                    "{:<17} {:<7} {:<10} {:<11} {:<9} {}",
                    s.managed_type.gvk(),
                    s.queued,
                    s.in_flight,
                    s.reconciles,
                    s.failures,
                    s.degraded.len()
                );
            }
            println!();
            println!("WORKLOAD  NODE  READY");
            for w in &workloads {
                let node = w.data.get("node").and_then(|n| n.as_str()).unwrap_or("-");
                let ready = w.metadata.get("ready").map(String::as_str).unwrap_or("-");
                println!("{:<9} {:<5} {}", w.id.name, node, ready);
            }
            println!();
            println!(
                "cache {}: fetches={} hits={} misses={} errors={} evictions={} hit_rate={:.2}",
                cache.name(),
                stats.fetches(),
                stats.hits(),
                stats.misses(),
                stats.errors(),
                stats.evictions(),
                stats.hit_rate()
            );
        }
        Output::Json => {
            let ready: Vec<_> = workloads
                .iter()
                .map(|w| json!({ "name": w.id.name, "node": w.data.get("node"), "ready": w.metadata.get("ready") }))
                .collect();
            let summary = json!({
                "controllers": statuses,
                "workloads": ready,
                "cache": {
                    "name": cache.name(),
                    "fetches": stats.fetches(),
                    "hits": stats.hits(),
                    "misses": stats.misses(),
                    "errors": stats.errors(),
                    "evictions": stats.evictions(),
                },
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

async fn run_watch(
    output: Output,
    query: ServiceQuery,
    interval: Duration,
    count: Option<usize>,
    revoke_after: Option<usize>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let world = Arc::new(World::build(cancel.child_token())?);
    world.seed()?;
    info!(service = %query.name, dc = %query.datacenter, route = world.dispatch.route(&query).as_str(), "watch invoked");

    let token = query.token.clone();
    let mut sub = world.dispatch.subscribe(query, new_correlation_id()).await?;
    let driver = tokio::spawn(drive(world.clone(), interval, cancel.clone()));
    let mut seen = 0usize;
    loop {
        tokio::select! {
            maybe = sub.next() => {
                match maybe {
                    Some(ev) => {
                        print_event(output, "watch", &ev)?;
                        seen += 1;
                        if revoke_after == Some(seen) {
                            warn!(events = seen, "revoking token");
                            world.tokens.revoke(&token);
                        }
                        if count.map_or(false, |c| seen >= c) {
                            break;
                        }
                    }
                    None => {
                        warn!("subscription closed; exiting watch loop");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }

    cancel.cancel();
    drop(sub);
    if let Err(err) = driver.await {
        warn!(error = %err, "watch driver ended abnormally");
    }
    world.cache.close();
    Ok(())
}
