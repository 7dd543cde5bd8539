//! The local observer set.
//!
//! Observers are local subscribers that receive an [`Update`] for every
//! mutation on this node that changed group membership. The registry holds
//! no strong ownership over them: each observer endpoint is watched with the
//! same monitor primitive used for members, and drops out of the subscriber
//! set silently when its monitor fires or its sink closes.

use {
	crate::{
		id::{EndpointId, GroupName, MonitorRef},
		registry::protocol::{Subscribed, Update},
		substrate::{DeathSink, Substrate},
	},
	std::collections::{HashMap, HashSet},
	tokio::sync::mpsc,
	tracing::debug,
};

pub(crate) struct Observers<S: Substrate> {
	substrate: S,
	deaths: DeathSink,
	entries: HashMap<EndpointId, Entry>,
	index: HashMap<MonitorRef, EndpointId>,

	/// Monitor refs released after firing; their in-flight notification is
	/// discarded on arrival.
	flush: HashSet<MonitorRef>,
}

struct Entry {
	monitor: MonitorRef,
	sink: mpsc::UnboundedSender<Update>,
}

/// Resolution of an inbound death notification against the observer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Claim {
	/// A subscribed observer died and has been removed.
	Observer(EndpointId),

	/// Stale notification for an already-removed observer; flushed.
	Flushed,

	/// The reference is not ours.
	Unknown,
}

impl<S: Substrate> Observers<S> {
	pub(crate) fn new(substrate: S, deaths: DeathSink) -> Self {
		Self {
			substrate,
			deaths,
			entries: HashMap::new(),
			index: HashMap::new(),
			flush: HashSet::new(),
		}
	}

	pub(crate) fn subscribe(
		&mut self,
		observer: EndpointId,
		sink: mpsc::UnboundedSender<Update>,
	) -> Subscribed {
		if self.entries.contains_key(&observer) {
			return Subscribed::AlreadyPresent;
		}

		let monitor = self.substrate.monitor(&observer, self.deaths.clone());
		self.index.insert(monitor, observer.clone());
		self.entries.insert(observer, Entry { monitor, sink });
		Subscribed::New
	}

	/// Delivers a membership delta to every subscriber, dropping the ones
	/// whose sink has closed.
	pub(crate) fn notify(&mut self, groups: &[GroupName]) {
		let closed: Vec<EndpointId> = self
			.entries
			.iter()
			.filter_map(|(observer, entry)| {
				entry
					.sink
					.send(Update(groups.to_vec()))
					.is_err()
					.then(|| observer.clone())
			})
			.collect();

		for observer in closed {
			debug!(observer = %observer, "observer sink closed, unsubscribing");
			self.remove(&observer);
		}
	}

	/// Resolves an inbound death notification; a dead observer is removed
	/// from the subscriber set without any further notice.
	pub(crate) fn claim(&mut self, monitor: MonitorRef) -> Claim {
		if let Some(observer) = self.index.remove(&monitor) {
			self.entries.remove(&observer);
			debug!(observer = %observer, "observer died, unsubscribing");
			return Claim::Observer(observer);
		}

		if self.flush.remove(&monitor) {
			return Claim::Flushed;
		}

		Claim::Unknown
	}

	fn remove(&mut self, observer: &EndpointId) {
		let Some(entry) = self.entries.remove(observer) else {
			return;
		};

		self.index.remove(&entry.monitor);
		if !self.substrate.demonitor(entry.monitor) {
			self.flush.insert(entry.monitor);
		}
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.entries.len()
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::substrate::{Down, mesh::Mesh}};

	fn observers(
		mesh: &Mesh,
		node: &str,
	) -> (
		Observers<crate::substrate::mesh::MeshNode>,
		mpsc::UnboundedReceiver<Down>,
	) {
		let (deaths, rx) = mpsc::unbounded_channel();
		(Observers::new(mesh.node(node), deaths), rx)
	}

	#[tokio::test]
	async fn double_subscribe_is_reported() {
		let mesh = Mesh::default();
		let (mut observers, _deaths) = observers(&mesh, "a");
		let watcher = mesh.endpoint("a");
		let (sink, _updates) = mpsc::unbounded_channel();

		assert_eq!(
			observers.subscribe(watcher.clone(), sink.clone()),
			Subscribed::New
		);
		assert_eq!(
			observers.subscribe(watcher, sink),
			Subscribed::AlreadyPresent
		);
		assert_eq!(observers.len(), 1);
	}

	#[tokio::test]
	async fn updates_reach_every_subscriber_in_order() {
		let mesh = Mesh::default();
		let (mut observers, _deaths) = observers(&mesh, "a");

		let (sink1, mut updates1) = mpsc::unbounded_channel();
		let (sink2, mut updates2) = mpsc::unbounded_channel();
		observers.subscribe(mesh.endpoint("a"), sink1);
		observers.subscribe(mesh.endpoint("a"), sink2);

		observers.notify(&[GroupName::from("g")]);
		observers.notify(&[GroupName::from("h")]);

		for updates in [&mut updates1, &mut updates2] {
			assert_eq!(
				updates.recv().await,
				Some(Update(vec![GroupName::from("g")]))
			);
			assert_eq!(
				updates.recv().await,
				Some(Update(vec![GroupName::from("h")]))
			);
		}
	}

	#[tokio::test]
	async fn dead_observer_is_removed_silently() {
		let mesh = Mesh::default();
		let (mut observers, mut deaths) = observers(&mesh, "a");
		let watcher = mesh.endpoint("a");
		let (sink, _updates) = mpsc::unbounded_channel();

		observers.subscribe(watcher.clone(), sink);
		mesh.kill(&watcher);

		let Down(monitor) = deaths.recv().await.unwrap();
		assert_eq!(observers.claim(monitor), Claim::Observer(watcher));
		assert_eq!(observers.len(), 0);
		assert_eq!(observers.claim(monitor), Claim::Unknown);
	}

	#[tokio::test]
	async fn closed_sink_unsubscribes_on_next_notify() {
		let mesh = Mesh::default();
		let (mut observers, _deaths) = observers(&mesh, "a");
		let (sink, updates) = mpsc::unbounded_channel();

		observers.subscribe(mesh.endpoint("a"), sink);
		drop(updates);

		observers.notify(&[GroupName::from("g")]);
		assert_eq!(observers.len(), 0);
	}
}
