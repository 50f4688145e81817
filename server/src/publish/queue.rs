//! C7: Publish Queue. Single-consumer FIFO of `PublishJob`s with per-domain
//! serialization via a mutex table, grounded on `core/worker.rs`'s
//! channel-plus-background-loop shape, generalized from a CPU task pool to
//! a job queue per spec.md §4.7.

use std::collections::HashMap;
use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ConfigService;
use crate::node::Node;
use crate::prelude::*;

use super::pipeline;

#[derive(Debug, Clone)]
pub struct PublishJob {
	pub job_id: String,
	pub domain: String,
	pub site_leaf: String,
	pub tgp_leaf: String,
	pub staging_root: String,
	pub note: Option<String>,
}

pub struct PublishQueue {
	tx: Sender<PublishJob>,
}

impl PublishQueue {
	/// Spawns the single consumer loop and returns a handle to enqueue jobs.
	pub fn start(node: Arc<Node>, config: Arc<ConfigService>) -> Arc<Self> {
		let (tx, rx) = flume::unbounded();
		tokio::spawn(consumer_loop(rx, node, config));
		Arc::new(PublishQueue { tx })
	}

	pub fn enqueue(&self, job: PublishJob) -> ClResult<()> {
		self.tx
			.send(job)
			.map_err(|_| Error::ServiceUnavailable("publish queue is no longer accepting jobs".into()))
	}
}

async fn consumer_loop(rx: Receiver<PublishJob>, node: Arc<Node>, config: Arc<ConfigService>) {
	let domain_locks: Arc<AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>> =
		Arc::new(AsyncMutex::new(HashMap::new()));

	while let Ok(job) = rx.recv_async().await {
		let lock = {
			let mut locks = domain_locks.lock().await;
			locks.entry(job.domain.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
		};
		let node = node.clone();
		let config = config.clone();

		tokio::spawn(async move {
			let _guard = lock.lock().await;
			let job_id = job.job_id.clone();
			let staging_root = job.staging_root.clone();
			if let Err(e) = pipeline::run(&node, &config, &job).await {
				warn!("publish job {} for {} failed: {}", job_id, job.domain, e);
				if let Err(cleanup_err) = node.files_rm(&staging_root, true).await {
					warn!("failed to clean up staging root {} after failed publish: {}", staging_root, cleanup_err);
				}
			}
		});
	}
}

// vim: ts=4
