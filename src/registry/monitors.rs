//! Reference-counted endpoint monitors.
//!
//! Every endpoint referenced by at least one group carries exactly one armed
//! monitor here, shared across all of its memberships: the watcher count is
//! the sum of the endpoint's join-counters over every group, and the monitor
//! is released only when that sum reaches zero. The inverse index recovers
//! the endpoint from a monitor reference at death-notification time without
//! scanning.
//!
//! When the first join references an endpoint homed on a node the substrate
//! is not yet connected to, the monitor is brokered by a relay task instead
//! of being armed from the worker directly; the relay forwards the one-shot
//! death into the worker's death channel and is torn down when the watcher
//! count drains. The state table never sees the difference.

use {
	crate::{
		id::{EndpointId, MonitorRef},
		substrate::{DeathSink, Substrate},
	},
	std::collections::{HashMap, HashSet},
	tokio::sync::mpsc,
	tokio_util::sync::DropGuard,
	tracing::trace,
};

pub(crate) struct Monitors<S: Substrate> {
	substrate: S,
	deaths: DeathSink,
	entries: HashMap<EndpointId, Entry>,
	index: HashMap<MonitorRef, EndpointId>,

	/// Monitor refs that had already fired when they were released; their
	/// in-flight death notification is discarded on arrival.
	flush: HashSet<MonitorRef>,
}

struct Entry {
	monitor: MonitorRef,

	/// Sum of this endpoint's join-counters across all groups.
	watchers: u32,

	watcher: Watcher,

	/// Set once the death notification for this entry has been claimed, so
	/// the final release skips the demonitor.
	fired: bool,
}

enum Watcher {
	/// The monitor is armed directly against the endpoint.
	Direct,

	/// The monitor is brokered by a relay task; dropping the guard kills it.
	Relay(DropGuard),
}

/// Resolution of an inbound death notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Claim {
	/// The reference belongs to a monitored member endpoint.
	Member(EndpointId),

	/// The reference was released after firing; the notification is stale
	/// and has now been flushed.
	Flushed,

	/// The reference is not ours.
	Unknown,
}

impl<S: Substrate> Monitors<S> {
	pub(crate) fn new(substrate: S, deaths: DeathSink) -> Self {
		Self {
			substrate,
			deaths,
			entries: HashMap::new(),
			index: HashMap::new(),
			flush: HashSet::new(),
		}
	}

	/// Accounts one more join of the endpoint, arming its monitor on the
	/// first one.
	pub(crate) fn retain(&mut self, endpoint: &EndpointId) {
		if let Some(entry) = self.entries.get_mut(endpoint) {
			entry.watchers += 1;
			return;
		}

		let entry = self.install(endpoint);
		trace!(endpoint = %endpoint, monitor = %entry.monitor, "monitoring");
		self.index.insert(entry.monitor, endpoint.clone());
		self.entries.insert(endpoint.clone(), entry);
	}

	/// Accounts one leave of the endpoint; at zero the monitor is released
	/// and any relay torn down.
	pub(crate) fn release(&mut self, endpoint: &EndpointId) {
		let Some(entry) = self.entries.get_mut(endpoint) else {
			return;
		};

		entry.watchers -= 1;
		if entry.watchers > 0 {
			return;
		}

		let entry = self
			.entries
			.remove(endpoint)
			.expect("entry present: just accessed");
		self.index.remove(&entry.monitor);
		trace!(endpoint = %endpoint, monitor = %entry.monitor, "demonitoring");

		if !entry.fired && !self.substrate.demonitor(entry.monitor) {
			// fired between the death and this release: flush the stale
			// notification when it arrives
			self.flush.insert(entry.monitor);
		}
	}

	/// Resolves an inbound death notification to its endpoint.
	pub(crate) fn claim(&mut self, monitor: MonitorRef) -> Claim {
		if let Some(endpoint) = self.index.get(&monitor).cloned() {
			if let Some(entry) = self.entries.get_mut(&endpoint) {
				entry.fired = true;
			}
			return Claim::Member(endpoint);
		}

		if self.flush.remove(&monitor) {
			return Claim::Flushed;
		}

		Claim::Unknown
	}

	fn install(&mut self, endpoint: &EndpointId) -> Entry {
		let home = endpoint.node();
		if *home == self.substrate.node() || self.substrate.is_connected(home) {
			let monitor = self.substrate.monitor(endpoint, self.deaths.clone());
			return Entry {
				monitor,
				watchers: 1,
				watcher: Watcher::Direct,
				fired: false,
			};
		}

		// The endpoint's node is not connected yet: broker the monitor
		// through a relay task so the worker never arms it directly.
		let (relay, mut notified) = mpsc::unbounded_channel();
		let monitor = self.substrate.monitor(endpoint, relay);
		let deaths = self.deaths.clone();
		let cancel = tokio_util::sync::CancellationToken::new();
		let guard = cancel.clone().drop_guard();

		tokio::spawn(async move {
			tokio::select! {
				() = cancel.cancelled() => {
					// killed: forward anything already delivered, then exit
					while let Ok(down) = notified.try_recv() {
						let _ = deaths.send(down);
					}
				}
				down = notified.recv() => {
					if let Some(down) = down {
						let _ = deaths.send(down);
					}
				}
			}
		});

		Entry {
			monitor,
			watchers: 1,
			watcher: Watcher::Relay(guard),
			fired: false,
		}
	}

	#[cfg(test)]
	pub(crate) fn total(&self, endpoint: &EndpointId) -> u32 {
		self
			.entries
			.get(endpoint)
			.map(|entry| entry.watchers)
			.unwrap_or(0)
	}

	#[cfg(test)]
	pub(crate) fn is_relayed(&self, endpoint: &EndpointId) -> bool {
		self
			.entries
			.get(endpoint)
			.is_some_and(|entry| matches!(entry.watcher, Watcher::Relay(_)))
	}

	#[cfg(test)]
	pub(crate) fn is_empty(&self) -> bool {
		self.entries.is_empty() && self.index.is_empty()
	}
}
