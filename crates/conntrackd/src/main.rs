//! NAT connection tracker daemon.
//!
//! Mirrors the kernel conntrack table into user space and periodically
//! logs the tracker statistics. Embedders normally consume the library
//! crate directly; this binary exists for standalone operation and
//! debugging.

#[cfg(target_os = "linux")]
mod daemon {
    use conntrackd::{Conntracker, NatConntracker, TrackerConfig};
    use std::time::Duration;
    use tracing::{error, info, Level};
    use tracing_subscriber::FmtSubscriber;

    const STATS_INTERVAL: Duration = Duration::from_secs(30);

    pub async fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_target(true)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;

        info!("conntrackd: starting NAT connection tracker");

        let tracker = match NatConntracker::new(TrackerConfig::default()) {
            Ok(tracker) => tracker,
            Err(e) => {
                error!(error = %e, "conntrackd: failed to initialize tracker");
                return Err(Box::new(e));
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("conntrackd: received SIGINT, shutting down");
                    break;
                }
                _ = tokio::time::sleep(STATS_INTERVAL) => {
                    let stats = tracker.stats();
                    info!(
                        state_size = stats.get("state_size").copied().unwrap_or(0),
                        short_term_buffer_size = stats.get("short_term_buffer_size").copied().unwrap_or(0),
                        expires_total = stats.get("expires_total").copied().unwrap_or(0),
                        "conntrackd: tracker stats"
                    );
                }
            }
        }

        tracker.close();
        info!("conntrackd: shutdown complete");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    daemon::run().await
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("conntrackd requires Linux (ctnetlink)");
    std::process::exit(1);
}
