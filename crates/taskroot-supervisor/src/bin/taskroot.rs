//! Owning process: holds the dataset, serves it over RPC and supervises
//! the sibling components.

use std::sync::Arc;

use tracing::info;

use taskroot_core::ControlPlaneConfig;
use taskroot_supervisor::{
    component_program, default_exporters, default_roster, init_logging, ControlPlane, FileSink,
    TracingSink,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _log_guard = init_logging()?;

    let config = ControlPlaneConfig::from_env();
    config.validate()?;
    let roster = default_roster(&config, &component_program()?);

    info!(
        subsystem = "supervisor",
        components = roster.len(),
        db_path = config
            .database
            .db_path
            .as_ref()
            .map(|p| p.display().to_string())
            .as_deref()
            .unwrap_or("(memory)"),
        "Starting taskroot"
    );

    let mut control_plane = ControlPlane::new(config.clone())
        .with_roster(roster)
        .with_sink(Arc::new(TracingSink));
    if let Some(log_dir) = &config.supervisor.log_dir {
        info!(subsystem = "supervisor", log_dir = %log_dir.display(), "Writing component log files");
        control_plane = control_plane.with_sink(Arc::new(FileSink::new(log_dir.clone())?));
    }
    for exporter in default_exporters(&config) {
        control_plane = control_plane.with_exporter(exporter);
    }

    let summary = control_plane
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(
                    subsystem = "supervisor",
                    error = %e,
                    "Failed to listen for shutdown signal"
                );
            }
        })
        .await?;

    if !summary.start.failed.is_empty() {
        anyhow::bail!(
            "{} component(s) failed to start",
            summary.start.failed.len()
        );
    }
    Ok(())
}
