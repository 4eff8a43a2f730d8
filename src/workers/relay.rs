use crate::core::relay::{server, Relay};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::RelayArgs;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Serve the signaling relay until `sos` fires.
pub async fn run(args: RelayArgs, sos: SignalOfStop) -> Result<()> {
    let addr = args.listen_addr()?;
    let relay = Arc::new(Relay::new());
    server::serve(addr, relay.clone(), sos, None).await?;
    info!(
        event = "relay_stopped",
        rooms = relay.room_count().await,
        "Signaling relay stopped"
    );
    Ok(())
}
