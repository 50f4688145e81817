//! C6: Cert Reconciler. Periodic sweep calling C5's `tryQueueIssueIfMissing`
//! over every SSL-enabled host, grounded on the teacher's
//! `bootstrap.rs::run_scheduler` background-loop idiom (spawn + tokio
//! interval) generalized to spec.md §4.6's 2-minute sweep.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigService;
use crate::prelude::*;

use super::provider::LiveCertProvider;

const SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Spawns the reconciler loop; returns its join handle so callers can await
/// it during shutdown if desired.
pub fn spawn(config: Arc<ConfigService>, provider: Arc<LiveCertProvider>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
		loop {
			ticker.tick().await;
			sweep(&config, &provider).await;
		}
	})
}

async fn sweep(config: &Arc<ConfigService>, provider: &Arc<LiveCertProvider>) {
	let cfg = config.get().await;
	let mut want: Vec<String> = cfg.domains.values().filter(|d| d.use_ssl).map(|d| d.domain.clone()).collect();
	want.extend(provider.enumerate_authorized_ipns_hosts().await);

	debug!("cert reconciler sweeping {} hosts", want.len());
	for host in want {
		provider.try_queue_issue_if_missing(&host).await;
	}
}

// vim: ts=4
