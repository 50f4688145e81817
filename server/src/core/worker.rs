//! CPU-bound worker pool with three priority lanes, used for PKCS#12/CSR
//! key generation, scrypt/bcrypt hashing and other synchronous work that
//! would otherwise block an async task.

use std::{sync::Arc, thread};

use flume::{Receiver, Sender};
use futures::channel::oneshot;

use crate::prelude::*;

#[derive(Clone, Copy, Debug)]
pub enum Priority {
	High,
	Medium,
	Low,
}

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
pub struct WorkerPool {
	tx_high: Sender<Job>,
	tx_med: Sender<Job>,
	tx_low: Sender<Job>,
}

impl WorkerPool {
	pub fn new(n_high: usize, n_med: usize, n_low: usize) -> Self {
		let (tx_high, rx_high) = flume::unbounded();
		let (tx_med, rx_med) = flume::unbounded();
		let (tx_low, rx_low) = flume::unbounded();

		let rx_high = Arc::new(rx_high);
		let rx_med = Arc::new(rx_med);
		let rx_low = Arc::new(rx_low);

		for _ in 0..n_high {
			let rx_high = Arc::clone(&rx_high);
			thread::spawn(move || worker_loop(vec![rx_high]));
		}
		for _ in 0..n_med {
			let rx_high = Arc::clone(&rx_high);
			let rx_med = Arc::clone(&rx_med);
			thread::spawn(move || worker_loop(vec![rx_high, rx_med]));
		}
		for _ in 0..n_low {
			let rx_high = Arc::clone(&rx_high);
			let rx_med = Arc::clone(&rx_med);
			let rx_low = Arc::clone(&rx_low);
			thread::spawn(move || worker_loop(vec![rx_high, rx_med, rx_low]));
		}

		Self { tx_high, tx_med, tx_low }
	}

	async fn submit<F, T>(tx: &Sender<Job>, f: F) -> ClResult<T>
	where
		F: FnOnce() -> T + Send + 'static,
		T: Send + 'static,
	{
		let (res_tx, res_rx) = oneshot::channel();
		let job: Job = Box::new(move || {
			let result = f();
			let _ = res_tx.send(result);
		});
		tx.send(job).map_err(|_| Error::Internal("worker pool queue closed".into()))?;
		res_rx.await.map_err(|_| Error::Internal("worker pool dropped result".into()))
	}

	pub async fn run_immed<F, T>(&self, f: F) -> ClResult<T>
	where
		F: FnOnce() -> T + Send + 'static,
		T: Send + 'static,
	{
		Self::submit(&self.tx_high, f).await
	}

	pub async fn run<F, T>(&self, f: F) -> ClResult<T>
	where
		F: FnOnce() -> T + Send + 'static,
		T: Send + 'static,
	{
		Self::submit(&self.tx_med, f).await
	}

	pub async fn run_slow<F, T>(&self, f: F) -> ClResult<T>
	where
		F: FnOnce() -> T + Send + 'static,
		T: Send + 'static,
	{
		Self::submit(&self.tx_low, f).await
	}
}

fn worker_loop(queues: Vec<Arc<Receiver<Job>>>) {
	loop {
		let mut job = None;
		for rx in &queues {
			if let Ok(j) = rx.try_recv() {
				job = Some(j);
				break;
			}
		}

		if let Some(job) = job {
			job();
			continue;
		}

		let mut selector = flume::Selector::new();
		for rx in &queues {
			selector = selector.recv(rx, |res| res);
		}

		if let Ok(job) = selector.wait() {
			job();
		}
	}
}

// vim: ts=4
