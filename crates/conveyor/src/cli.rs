//! CLI surface for the conveyor worker binary.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use conveyor_broker::{Connector, MemoryBroker, RecoveringChannel};
use conveyor_core::{PipelineName, WorkerConfig};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::warn;

use crate::{
    announce::ServiceAnnouncer,
    dispatch::DispatchLoop,
    service::{generate_identity, Service},
    shell_pipeline::{CommandPipeline, CommandPipelineSpec},
};

pub fn build_cli() -> Command {
    Command::new("conveyor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pipeline job-claiming worker")
        .subcommand_required(true)
        .subcommand(cmd_run())
        .subcommand(cmd_announce())
}

fn cmd_run() -> Command {
    Command::new("run")
        .about("Run a worker hosting the configured pipelines")
        .arg(arg_config())
        .arg(arg_service())
}

fn cmd_announce() -> Command {
    Command::new("announce")
        .about("Announce this service's pipelines once and exit")
        .arg(arg_config())
        .arg(arg_service())
}

fn arg_config() -> Arg {
    Arg::new("config")
        .long("config")
        .value_name("PATH")
        .help("Path to a TOML config file")
}

fn arg_service() -> Arg {
    Arg::new("service")
        .long("service")
        .value_name("NAME")
        .help("Service name (overrides config and environment)")
}

/// On-disk config: worker settings plus the command pipelines the binary
/// hosts.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(flatten)]
    worker: WorkerConfig,
    #[serde(default)]
    pipelines: BTreeMap<String, CommandPipelineSpec>,
}

fn load_config(matches: &ArgMatches) -> Result<(WorkerConfig, BTreeMap<String, CommandPipelineSpec>)> {
    let file = match matches.get_one::<String>("config") {
        Some(path) => {
            let path = PathBuf::from(path);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            toml::from_str::<FileConfig>(&text)
                .with_context(|| format!("cannot parse config file {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let mut worker = file.worker.with_env_overrides()?;
    if let Some(service) = matches.get_one::<String>("service") {
        worker.service_name.clone_from(service);
    }
    worker.validate()?;
    Ok((worker, file.pipelines))
}

fn build_service(
    config: &WorkerConfig,
    pipelines: &BTreeMap<String, CommandPipelineSpec>,
) -> Result<Service> {
    let mut service = Service::new(config.service()?, generate_identity());
    for (name, spec) in pipelines {
        let pipeline = PipelineName::parse(name.clone())?;
        let spec = spec.clone();
        service.register_pipeline(pipeline, move || {
            Arc::new(CommandPipeline::new(spec.clone()))
        });
    }
    if pipelines.is_empty() {
        warn!("no pipelines configured; the worker will only see other services' announcements");
    }
    Ok(service)
}

fn connect_broker(url: &str) -> Result<Box<dyn Connector>> {
    if url.starts_with("memory://") {
        return Ok(Box::new(MemoryBroker::new().connector()));
    }
    bail!("unsupported broker url '{url}' (only memory:// is built in; other backends plug in behind the Connector trait)");
}

/// Route a parsed command line to its handler.
pub async fn dispatch(matches: &ArgMatches, shutdown: watch::Receiver<bool>) -> Result<()> {
    match matches.subcommand() {
        Some(("run", sub_m)) => handle_run(sub_m, shutdown).await,
        Some(("announce", sub_m)) => handle_announce(sub_m).await,
        _ => bail!("a subcommand is required"),
    }
}

async fn handle_run(matches: &ArgMatches, shutdown: watch::Receiver<bool>) -> Result<()> {
    let (config, pipelines) = load_config(matches)?;
    let service = Arc::new(build_service(&config, &pipelines)?);
    let connector = connect_broker(&config.broker_url)?;
    let channel = Arc::new(RecoveringChannel::new(connector, service.topology()));
    channel.ensure_ready().await?;

    let announcer = ServiceAnnouncer::new(Arc::clone(&channel), &service, config.message_ttl_ms());
    announcer.announce_once().await?;
    if let Some(interval) = config.announce_interval() {
        let announce_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = announcer.run_periodic(interval, announce_shutdown).await {
                warn!(error = %err, "periodic announcer stopped");
            }
        });
    }

    let dispatch_loop = DispatchLoop::new(service, channel, config);
    dispatch_loop.run(shutdown).await?;
    Ok(())
}

async fn handle_announce(matches: &ArgMatches) -> Result<()> {
    let (config, pipelines) = load_config(matches)?;
    let service = Arc::new(build_service(&config, &pipelines)?);
    let connector = connect_broker(&config.broker_url)?;
    let channel = Arc::new(RecoveringChannel::new(connector, service.topology()));
    channel.ensure_ready().await?;

    let announcer = ServiceAnnouncer::new(channel, &service, config.message_ttl_ms());
    announcer.announce_once().await?;
    println!(
        "Announced service '{}' ({} pipelines)",
        service.name(),
        service.registry().names().len()
    );
    Ok(())
}
