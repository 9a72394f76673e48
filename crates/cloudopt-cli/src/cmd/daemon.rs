use crate::cmd::{runtime, Workspace};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the scheduler loop until Ctrl-C.
pub fn run(root: &Path) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let accounts: Vec<&str> = ws.engines.providers().accounts().collect();
    info!(
        accounts = ?accounts,
        tick_seconds = ws.config.scheduler.tick_seconds,
        "starting cloudopt daemon"
    );

    let rt = runtime()?;
    rt.block_on(async {
        let cancel = CancellationToken::new();
        let scheduler = ws.engines.run(cancel.clone());
        tokio::pin!(scheduler);
        tokio::select! {
            result = &mut scheduler => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                cancel.cancel();
                scheduler.await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}
