//! The registry service loop.
//!
//! One long-lived worker task per node owns the state table, the monitor
//! registry and the observer set, and consumes a single event channel that
//! serializes local calls, peer wire messages, link events and death
//! notifications. The worker itself never blocks: calls are synchronous for
//! the caller but are answered inline from the loop.

use {
	super::{
		error::WorkerError,
		monitors::{self, Monitors},
		observers::{self, Observers},
		protocol::{Mutation, Reply, Request, Wire},
		table::{Left, Table, Views},
	},
	crate::{
		id::{EndpointId, GroupName, MonitorRef, NodeId},
		substrate::{Down, Intake, LinkEvent, Substrate},
	},
	tokio::{
		sync::{mpsc, watch},
		task::JoinHandle,
	},
	tokio_util::sync::CancellationToken,
	tracing::{debug, error, info},
};

/// Channel ends held by the [`Registry`](super::Registry) handle after
/// spawning the worker.
pub(crate) struct Handle {
	pub intake: mpsc::UnboundedSender<Intake>,
	pub views: watch::Receiver<Views>,
	pub task: JoinHandle<()>,
}

pub(crate) struct WorkerLoop<S: Substrate> {
	substrate: S,
	table: Table,
	monitors: Monitors<S>,
	observers: Observers<S>,
	intake: mpsc::UnboundedReceiver<Intake>,

	/// Sender half of the intake, used to enqueue events to ourselves so
	/// they interleave with already-queued work in arrival order.
	loopback: mpsc::UnboundedSender<Intake>,

	deaths: mpsc::UnboundedReceiver<Down>,
	termination: CancellationToken,
}

impl<S: Substrate> WorkerLoop<S> {
	/// Assembles the worker and binds it to the substrate. Events may start
	/// queueing on the intake from this point on; they are consumed once the
	/// loop runs.
	fn new(
		substrate: S,
		termination: CancellationToken,
	) -> (Self, mpsc::UnboundedSender<Intake>, watch::Receiver<Views>) {
		let (intake_tx, intake_rx) = mpsc::unbounded_channel();
		let (deaths_tx, deaths_rx) = mpsc::unbounded_channel();
		let (table, views) = Table::new(substrate.node());

		substrate.attach(intake_tx.clone());

		let worker = Self {
			monitors: Monitors::new(substrate.clone(), deaths_tx.clone()),
			observers: Observers::new(substrate.clone(), deaths_tx),
			substrate,
			table,
			intake: intake_rx,
			loopback: intake_tx.clone(),
			deaths: deaths_rx,
			termination,
		};

		(worker, intake_tx, views)
	}

	/// Spawns the worker loop as a background task and returns the channel
	/// ends the registry handle needs.
	pub(crate) fn spawn(
		substrate: S,
		termination: CancellationToken,
	) -> Handle {
		let (worker, intake, views) = Self::new(substrate, termination.clone());

		let task = tokio::spawn(async move {
			let node = worker.substrate.node();
			if let Err(e) = worker.run().await {
				error!(error = %e, node = %node, "registry worker terminated");
			}

			// whatever the cause, a stopped worker means a stopped service
			termination.cancel();
		});

		Handle {
			intake,
			views,
			task,
		}
	}

	async fn run(mut self) -> Result<(), WorkerError> {
		let node = self.substrate.node();
		info!(node = %node, "registry service starting");

		// Announce ourselves to every node the substrate already knows, and
		// enqueue a node-up for each so we exchange state with it; their own
		// hello handling covers the opposite direction.
		for peer in self.substrate.nodes() {
			self
				.substrate
				.send(&peer, Wire::Hello { from: node.clone() });
			let _ = self.loopback.send(Intake::Link(LinkEvent::Up(peer)));
		}

		loop {
			tokio::select! {
				// deaths take precedence over queued work so that a dead
				// endpoint never survives into later mutations
				biased;

				() = self.termination.cancelled() => {
					info!(node = %node, "registry service stopping");
					return Ok(());
				}

				Some(Down(monitor)) = self.deaths.recv() => self.on_down(monitor)?,

				Some(event) = self.intake.recv() => self.on_intake(event)?,
			}
		}
	}

	fn on_intake(&mut self, event: Intake) -> Result<(), WorkerError> {
		match event {
			Intake::Call(request, reply) => {
				let _ = reply.send(self.on_call(request));
			}
			Intake::Wire(wire) => self.on_wire(wire),
			Intake::Link(LinkEvent::Up(peer)) => {
				debug!(peer = %peer, "node up");
				self.exchange_with(&peer);
			}
			Intake::Link(LinkEvent::Down(peer)) => {
				// membership reaping is monitor-driven only; a disconnected
				// node's members linger until their monitors fire or the
				// node returns and exchanges
				debug!(peer = %peer, "node down");
			}
			Intake::Observe(observer, sink, reply) => {
				let _ = reply.send(self.observers.subscribe(observer, sink));
			}
		}

		Ok(())
	}

	fn on_call(&mut self, request: Request) -> Reply {
		match request {
			Request::Apply(mutation) => {
				let delta = self.apply(mutation);
				if !delta.is_empty() {
					self.observers.notify(&delta);
				}
				Reply::Applied
			}
			Request::Snapshot { group } => {
				Reply::Snapshot(self.table.snapshot(group.as_ref()))
			}
			Request::Sync => Reply::Synced,
		}
	}

	/// Applies one mutation to the state table, returning the delta list
	/// for observer notification.
	fn apply(&mut self, mutation: Mutation) -> Vec<GroupName> {
		match mutation {
			Mutation::Create(name) => {
				self.table.assure(&name);
				Vec::new()
			}

			Mutation::Delete(name) => {
				for (endpoint, counter) in self.table.delete(&name) {
					for _ in 0..counter {
						self.monitors.release(&endpoint);
					}
				}
				vec![name]
			}

			Mutation::Join(name, endpoint) => {
				// a join reaching a node that never saw the create gives
				// birth to the group implicitly
				self.table.join(&name, &endpoint);
				self.monitors.retain(&endpoint);
				vec![name]
			}

			Mutation::Leave(name, endpoint) => {
				match self.table.leave(&name, &endpoint) {
					Left::NotMember => Vec::new(),
					Left::Remaining | Left::Removed => {
						self.monitors.release(&endpoint);
						vec![name]
					}
				}
			}
		}
	}

	fn on_wire(&mut self, wire: Wire) {
		match wire {
			Wire::Hello { from } => {
				debug!(peer = %from, "peer hello");
				self.exchange_with(&from);
			}
			Wire::Exchange { from, groups } => {
				debug!(peer = %from, groups = groups.len(), "peer exchange");
				self.merge(groups);
			}
			Wire::Resync => {
				debug!("resync requested");
				for peer in self.substrate.nodes() {
					self.exchange_with(&peer);
				}
			}
		}
	}

	/// Union-only merge of an inbound exchange: groups are assured, missing
	/// members are joined, nothing is ever removed here.
	fn merge(&mut self, groups: Vec<(GroupName, Vec<EndpointId>)>) {
		let mut delta = Vec::new();

		for (name, members) in groups {
			self.table.assure(&name);

			let mut changed = false;
			for endpoint in members {
				if !self.table.contains(&name, &endpoint) {
					self.table.join(&name, &endpoint);
					self.monitors.retain(&endpoint);
					changed = true;
				}
			}

			if changed {
				delta.push(name);
			}
		}

		if !delta.is_empty() {
			self.observers.notify(&delta);
		}
	}

	/// Pushes this node's state at `peer`, subset to the exchanging pair.
	fn exchange_with(&self, peer: &NodeId) {
		self.substrate.send(peer, Wire::Exchange {
			from: self.substrate.node(),
			groups: self.table.exchange_payload(peer),
		});
	}

	fn on_down(&mut self, monitor: MonitorRef) -> Result<(), WorkerError> {
		match self.monitors.claim(monitor) {
			monitors::Claim::Member(endpoint) => {
				self.member_died(&endpoint);
				Ok(())
			}
			monitors::Claim::Flushed => Ok(()),
			monitors::Claim::Unknown => match self.observers.claim(monitor) {
				observers::Claim::Observer(_) | observers::Claim::Flushed => Ok(()),
				observers::Claim::Unknown => {
					Err(WorkerError::UnknownMonitor(monitor))
				}
			},
		}
	}

	/// Removes a dead endpoint from every group it had joined, once per unit
	/// of its join-counter, and notifies observers with the affected names.
	fn member_died(&mut self, endpoint: &EndpointId) {
		debug!(endpoint = %endpoint, "member died");

		let mut delta = Vec::new();
		for (name, counter) in self.table.groups_of(endpoint) {
			for _ in 0..counter {
				if self.table.leave(&name, endpoint) != Left::NotMember {
					self.monitors.release(endpoint);
				}
			}
			delta.push(name);
		}

		if !delta.is_empty() {
			self.observers.notify(&delta);
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::substrate::mesh::{Mesh, MeshNode},
	};

	fn worker(mesh: &Mesh, node: &str) -> WorkerLoop<MeshNode> {
		let (worker, _intake, _views) =
			WorkerLoop::new(mesh.node(node), CancellationToken::new());
		worker
	}

	/// The monitor watcher count always equals the sum of the endpoint's
	/// join-counters across all groups.
	#[tokio::test]
	async fn monitor_count_tracks_join_counters() {
		let mesh = Mesh::default();
		let mut worker = worker(&mesh, "a");
		let e = mesh.endpoint("a");
		let g = GroupName::from("g");
		let h = GroupName::from("h");

		worker.apply(Mutation::Join(g.clone(), e.clone()));
		worker.apply(Mutation::Join(g.clone(), e.clone()));
		worker.apply(Mutation::Join(h.clone(), e.clone()));
		assert_eq!(worker.monitors.total(&e), 3);

		worker.apply(Mutation::Leave(g.clone(), e.clone()));
		assert_eq!(worker.monitors.total(&e), 2);

		worker.apply(Mutation::Delete(h));
		assert_eq!(worker.monitors.total(&e), 1);

		worker.apply(Mutation::Leave(g.clone(), e.clone()));
		assert_eq!(worker.monitors.total(&e), 0);
		assert!(worker.monitors.is_empty());

		// leaving a non-member touches nothing
		assert!(worker.apply(Mutation::Leave(g, e.clone())).is_empty());
		assert_eq!(worker.monitors.total(&e), 0);
	}

	#[tokio::test]
	async fn member_death_clears_every_membership() {
		let mesh = Mesh::default();
		let mut worker = worker(&mesh, "a");
		let e = mesh.endpoint("a");
		let other = mesh.endpoint("a");
		let g = GroupName::from("g");
		let h = GroupName::from("h");

		worker.apply(Mutation::Join(g.clone(), e.clone()));
		worker.apply(Mutation::Join(g.clone(), e.clone()));
		worker.apply(Mutation::Join(h.clone(), e.clone()));
		worker.apply(Mutation::Join(g.clone(), other.clone()));

		mesh.kill(&e);
		let Down(monitor) = worker.deaths.recv().await.unwrap();
		worker.on_down(monitor).unwrap();

		assert!(!worker.table.contains(&g, &e));
		assert!(!worker.table.contains(&h, &e));
		assert!(worker.table.contains(&g, &other));
		assert_eq!(worker.monitors.total(&e), 0);
		assert_eq!(worker.monitors.total(&other), 1);
	}

	#[tokio::test]
	async fn unknown_monitor_is_fatal() {
		let mesh = Mesh::default();
		let mut worker = worker(&mesh, "a");

		let result = worker.on_down(MonitorRef::new(4096));
		assert!(matches!(result, Err(WorkerError::UnknownMonitor(_))));
	}

	#[tokio::test]
	async fn exchange_merge_is_union_only() {
		let mesh = Mesh::default();
		let mut worker = worker(&mesh, "a");
		let ours = mesh.endpoint("a");
		let theirs = mesh.endpoint("b");
		let g = GroupName::from("g");

		worker.apply(Mutation::Join(g.clone(), ours.clone()));

		// merging the peer's view adds its member and keeps ours
		worker.merge(vec![(g.clone(), vec![theirs.clone()])]);
		assert!(worker.table.contains(&g, &ours));
		assert!(worker.table.contains(&g, &theirs));

		// merging the same view again changes nothing
		worker.merge(vec![(g.clone(), vec![theirs.clone()])]);
		assert_eq!(worker.table.count(&g, &theirs), 1);
		assert_eq!(worker.monitors.total(&theirs), 1);

		// an exchange missing `ours` does not remove it
		worker.merge(vec![(g.clone(), Vec::new())]);
		assert!(worker.table.contains(&g, &ours));

		// unknown groups are born on exchange
		worker.merge(vec![(GroupName::from("new"), Vec::new())]);
		assert!(worker.table.has_group(&GroupName::from("new")));
	}
}
