use clap::Parser;

use buildbox::config::{CliArgs, Config};
use buildbox::orchestrator::{BuildRequest, Orchestrator};
use buildbox::sandbox::WorkspaceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        workspace: workspace_config,
        toolchain: toolchain_config,
    } = cli.to_config()?;

    let source = std::fs::read_to_string(&cli.source_path)?;

    let manager = match &workspace_config.temp_root {
        Some(root) => WorkspaceManager::new(root)?,
        None => WorkspaceManager::with_os_temp_dir()?,
    };
    log::warn!("buildbox provides NO OS-level isolation - build commands run as this user");
    log::info!("Workspaces under {}", manager.temp_root().display());

    let orchestrator = Orchestrator::new(manager.clone(), toolchain_config);
    let request = BuildRequest {
        project_name: cli.name.clone(),
        source,
        dependencies: cli.dependencies.clone(),
    };

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
            None
        }
        report = orchestrator.run(&request) => Some(report),
    };

    // A dropped run has already SIGKILLed its process group; drain the
    // workspaces still live before exiting
    manager.cleanup_all();

    match outcome {
        Some(Ok(report)) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success() {
                std::process::exit(1);
            }
        }
        Some(Err(e)) => {
            log::error!("Build request failed: {e:#}");
            std::process::exit(2);
        }
        None => std::process::exit(130),
    }

    log::info!("Shutdown complete");
    Ok(())
}
