mod config;
mod plugin;
mod profile;

use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use flowci_api::{AgentClient, ControllerSession, HttpControllerClient};
use flowci_engine::docker::DockerClient;
use flowci_engine::{AgentContext, ControllerClient, Dispatcher};
use flowci_types::AgentInit;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Args;
use crate::plugin::GitPluginFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let http = HttpControllerClient::new(&args.server_url, &args.token)?;
    let client = Arc::new(AgentClient::new(http));
    let init = AgentInit {
        token: args.token.clone(),
        port: args.port,
        os: std::env::consts::OS.to_string(),
        k8s_enabled: args.k8s_enabled,
        docker_enabled: docker_available(&args.docker_host).await,
        resource: profile::sample(&args.workspace_dir()),
    };
    let settings = client.connect(&init).await.context("register agent with controller")?;
    info!(agent_id = %settings.agent.id, name = %settings.agent.name, "agent registered");

    let context = Arc::new(args.context(&settings.agent.id)?);
    context.ensure_dirs().with_context(|| format!("create workspace {}", context.workspace.display()))?;

    let (session, commands) = ControllerSession::connect(&args.server_url, &args.token)
        .await
        .context("open controller session")?;
    if client.attach(session).is_err() {
        anyhow::bail!("controller session attached twice");
    }

    let shutdown = CancellationToken::new();
    let reporter = profile::spawn_reporter(client.clone(), context.workspace.clone(), args.profile_interval(), shutdown.clone());
    let dispatcher = Dispatcher::new(context.clone(), client.clone(), Arc::new(GitPluginFetcher::new(&args.plugin_url)));

    run(&dispatcher, commands, &context).await;

    shutdown.cancel();
    let _ = reporter.await;
    client.close().await;
    info!("agent stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

async fn docker_available(docker_host: &str) -> bool {
    match DockerClient::connect(docker_host) {
        Ok(client) => client.ping().await.is_ok(),
        Err(error) => {
            warn!(error = %error, "docker host is not usable");
            false
        }
    }
}

/// Routes controller commands until CLOSE, Ctrl-C or the session ends.
async fn run(dispatcher: &Dispatcher, mut commands: tokio::sync::mpsc::Receiver<flowci_types::AgentCommand>, context: &AgentContext) {
    info!(workspace = %context.workspace.display(), k8s = context.k8s.enabled, "waiting for commands");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let ControlFlow::Break(()) = dispatcher.handle(command).await {
                        info!("controller requested shutdown");
                        return;
                    }
                }
                None => {
                    warn!("controller session ended");
                    dispatcher.shutdown().await;
                    return;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                dispatcher.shutdown().await;
                return;
            }
        }
    }
}
