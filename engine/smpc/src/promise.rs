//! One-shot broadcast values. A producer resolves once; any number of
//! cloned consumers observe the result, immediately if it is already there.

use tokio::sync::watch;

use std::sync::Arc;

pub fn promise<T: Clone>() -> (PromiseResolver<T>, Promise<T>) {
	let (tx, rx) = watch::channel(None);
	(PromiseResolver { tx: Arc::new(tx) }, Promise { rx })
}

#[derive(Clone)]
pub struct Promise<T> {
	rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Promise<T> {
	/// Wait for the value. Returns `None` only if the producer was dropped
	/// without resolving.
	pub async fn wait(&self) -> Option<T> {
		let mut rx = self.rx.clone();
		let result = match rx.wait_for(|v| v.is_some()).await {
			Ok(value) => value.clone(),
			Err(_) => None,
		};
		result
	}

	pub fn try_get(&self) -> Option<T> {
		self.rx.borrow().clone()
	}

	pub fn is_resolved(&self) -> bool {
		self.rx.borrow().is_some()
	}
}

pub struct PromiseResolver<T> {
	tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for PromiseResolver<T> {
	fn clone(&self) -> Self {
		PromiseResolver { tx: self.tx.clone() }
	}
}

impl<T: Clone> PromiseResolver<T> {
	/// Resolve the promise. The first resolution wins; later calls are
	/// ignored so a value can never change after consumers have seen it.
	pub fn resolve(&self, value: T) {
		self.tx.send_if_modified(|current| {
			if current.is_some() {
				false
			} else {
				*current = Some(value);
				true
			}
		});
	}

	pub fn is_resolved(&self) -> bool {
		self.tx.borrow().is_some()
	}

	pub fn subscribe(&self) -> Promise<T> {
		Promise { rx: self.tx.subscribe() }
	}
}
