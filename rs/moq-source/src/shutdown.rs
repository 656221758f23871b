use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::{Condvar, Mutex};

/// Stops all state mutation once teardown begins, then waits for callbacks to drain.
///
/// Callbacks call [ShutdownCoordinator::enter] first. It is the cheap rejection path: no
/// shared lock is taken and a closing instance returns `None`. Otherwise the returned
/// [InFlight] guard keeps the instance alive until the callback returns.
///
/// The flag is only an optimistic check. The owner must check again after acquiring its
/// own lock before mutating anything, since [ShutdownCoordinator::begin] can run in between.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
	closing: AtomicBool,
	in_flight: Mutex<usize>,
	idle: Condvar,
}

impl ShutdownCoordinator {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_closing(&self) -> bool {
		self.closing.load(Ordering::Acquire)
	}

	/// Set the flag. Returns true only for the first call; the flag never clears.
	pub fn begin(&self) -> bool {
		!self.closing.swap(true, Ordering::AcqRel)
	}

	pub fn enter(&self) -> Option<InFlight<'_>> {
		if self.is_closing() {
			return None;
		}

		*self.in_flight.lock() += 1;
		let guard = InFlight { coordinator: self };

		// begin() may have run between the check and the increment.
		if self.is_closing() {
			return None;
		}

		Some(guard)
	}

	pub fn in_flight(&self) -> usize {
		*self.in_flight.lock()
	}

	/// Block until every [InFlight] guard has been dropped.
	pub fn wait_idle(&self) {
		let mut count = self.in_flight.lock();
		while *count > 0 {
			self.idle.wait(&mut count);
		}
	}

	#[cfg(test)]
	fn wait_idle_timeout(&self, timeout: std::time::Duration) -> bool {
		let mut count = self.in_flight.lock();
		while *count > 0 {
			if self.idle.wait_for(&mut count, timeout).timed_out() {
				return *count == 0;
			}
		}
		true
	}

	fn exit(&self) {
		let mut count = self.in_flight.lock();
		*count -= 1;
		if *count == 0 {
			self.idle.notify_all();
		}
	}
}

/// A callback currently executing past the shutdown check.
#[must_use]
pub struct InFlight<'a> {
	coordinator: &'a ShutdownCoordinator,
}

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		self.coordinator.exit();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{mpsc, Arc};
	use std::thread;
	use std::time::Duration;

	use super::*;

	#[test]
	fn rejects_after_begin() {
		let shutdown = ShutdownCoordinator::new();
		assert!(shutdown.enter().is_some());
		assert_eq!(shutdown.in_flight(), 0);

		assert!(shutdown.begin());
		assert!(!shutdown.begin());
		assert!(shutdown.is_closing());
		assert!(shutdown.enter().is_none());
		assert_eq!(shutdown.in_flight(), 0);
	}

	#[test]
	fn waits_for_in_flight() {
		let shutdown = Arc::new(ShutdownCoordinator::new());
		let (entered_tx, entered_rx) = mpsc::channel();
		let (release_tx, release_rx) = mpsc::channel::<()>();

		let worker = {
			let shutdown = shutdown.clone();
			thread::spawn(move || {
				let _guard = shutdown.enter().expect("not closing yet");
				entered_tx.send(()).unwrap();
				release_rx.recv().unwrap();
			})
		};

		entered_rx.recv().unwrap();
		shutdown.begin();
		assert_eq!(shutdown.in_flight(), 1);
		assert!(!shutdown.wait_idle_timeout(Duration::from_millis(20)));

		release_tx.send(()).unwrap();
		shutdown.wait_idle();
		assert_eq!(shutdown.in_flight(), 0);

		worker.join().unwrap();
	}
}
