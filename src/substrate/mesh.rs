//! Built-in in-process substrate.
//!
//! The mesh hosts any number of named nodes inside one process and wires
//! their registry services together with plain channels: addressed messages
//! and calls are channel sends, the named lock is a per-key mutex, and
//! endpoint monitors are entries in a shared watch table. Links between
//! nodes are managed explicitly, which makes partitions and reconnects
//! trivial to script. The mesh is what the integration tests and examples
//! run on, and it performs no i/o.

use {
	super::{
		CallError,
		DeathSink,
		Down,
		Intake,
		LinkEvent,
		LockKey,
		Substrate,
	},
	crate::{
		id::{EndpointId, MonitorRef, NodeId},
		registry::protocol::{Reply, Request, Wire},
	},
	core::{
		sync::atomic::{AtomicU64, AtomicUsize, Ordering},
		time::Duration,
	},
	itertools::Itertools,
	parking_lot::{Mutex, RwLock},
	std::{
		collections::{HashMap, HashSet},
		sync::Arc,
	},
	tokio::sync::{mpsc, oneshot},
};

/// An in-process cluster of named nodes.
///
/// Notes:
///
/// - This type is cheap to clone; all clones refer to the same mesh.
///
/// - Nodes come into existence implicitly when first named via
///   [`Mesh::node`]; links between them are symmetric and managed with
///   [`Mesh::connect`] / [`Mesh::disconnect`].
///
/// - Endpoints are spawned with [`Mesh::endpoint`] and stay alive until
///   [`Mesh::kill`]ed. Killing an endpoint fires every armed monitor on it,
///   connected or not: monitor delivery is the mesh's own obligation, not
///   the links'.
pub struct Mesh(Arc<Inner>);

impl Clone for Mesh {
	fn clone(&self) -> Self {
		Self(Arc::clone(&self.0))
	}
}

impl Default for Mesh {
	fn default() -> Self {
		Self(Arc::new(Inner {
			services: RwLock::new(HashMap::new()),
			links: RwLock::new(HashSet::new()),
			alive: RwLock::new(HashSet::new()),
			watches: RwLock::new(HashMap::new()),
			fired: RwLock::new(HashSet::new()),
			locks: Mutex::new(HashMap::new()),
			lock_refusals: AtomicUsize::new(0),
			serials: AtomicU64::new(0),
			monitors: AtomicU64::new(0),
		}))
	}
}

/// Cluster management public API.
impl Mesh {
	/// Returns a substrate handle for the named node, creating the node if it
	/// does not exist yet.
	pub fn node(&self, name: impl Into<NodeId>) -> MeshNode {
		MeshNode {
			inner: Arc::clone(&self.0),
			id: name.into(),
		}
	}

	/// Establishes a symmetric link between two nodes and delivers a node-up
	/// event to each attached service. A no-op for already-linked pairs and
	/// for self-links.
	pub fn connect(&self, a: impl Into<NodeId>, b: impl Into<NodeId>) {
		let (a, b) = (a.into(), b.into());
		if a == b {
			return;
		}

		if self.0.links.write().insert(ordered(&a, &b)) {
			self.0.deliver(&a, Intake::Link(LinkEvent::Up(b.clone())));
			self.0.deliver(&b, Intake::Link(LinkEvent::Up(a)));
		}
	}

	/// Severs the link between two nodes and delivers a node-down event to
	/// each attached service. A no-op for unlinked pairs.
	pub fn disconnect(&self, a: impl Into<NodeId>, b: impl Into<NodeId>) {
		let (a, b) = (a.into(), b.into());
		if self.0.links.write().remove(&ordered(&a, &b)) {
			self.0.deliver(&a, Intake::Link(LinkEvent::Down(b.clone())));
			self.0.deliver(&b, Intake::Link(LinkEvent::Down(a)));
		}
	}

	/// Spawns a live endpoint homed on the given node.
	pub fn endpoint(&self, node: impl Into<NodeId>) -> EndpointId {
		let serial = self.0.serials.fetch_add(1, Ordering::Relaxed) + 1;
		let endpoint = EndpointId::new(node, serial);
		self.0.alive.write().insert(endpoint.clone());
		endpoint
	}

	/// Marks the endpoint as dead and fires every monitor armed on it.
	pub fn kill(&self, endpoint: &EndpointId) {
		self.0.alive.write().remove(endpoint);

		let due: Vec<(MonitorRef, Watch)> = {
			let mut watches = self.0.watches.write();
			let refs: Vec<MonitorRef> = watches
				.iter()
				.filter(|(_, watch)| watch.endpoint == *endpoint)
				.map(|(monitor, _)| *monitor)
				.collect();

			refs
				.into_iter()
				.filter_map(|monitor| {
					watches.remove(&monitor).map(|watch| (monitor, watch))
				})
				.collect()
		};

		let mut fired = self.0.fired.write();
		for (monitor, watch) in due {
			fired.insert(monitor);
			let _ = watch.sink.send(Down(monitor));
		}
	}

	/// Makes the next `count` lock acquisition attempts abort, regardless of
	/// key. A `lock` call retries aborted attempts up to its retry budget, so
	/// exhausting a call takes one more refusal than the budget. Used to
	/// exercise the retry paths.
	pub fn refuse_locks(&self, count: usize) {
		self.0.lock_refusals.fetch_add(count, Ordering::AcqRel);
	}
}

/// One node's view of the mesh; this is the [`Substrate`] implementation
/// handed to [`Registry::spawn`](crate::Registry::spawn).
pub struct MeshNode {
	inner: Arc<Inner>,
	id: NodeId,
}

impl Clone for MeshNode {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
			id: self.id.clone(),
		}
	}
}

impl MeshNode {
	/// Whether the registry service on `node` can be reached from this node.
	fn reachable(&self, node: &NodeId) -> bool {
		*node == self.id
			|| self.inner.links.read().contains(&ordered(&self.id, node))
	}
}

impl Substrate for MeshNode {
	type Lock = tokio::sync::OwnedMutexGuard<()>;

	fn node(&self) -> NodeId {
		self.id.clone()
	}

	fn nodes(&self) -> Vec<NodeId> {
		self
			.inner
			.links
			.read()
			.iter()
			.filter_map(|(a, b)| {
				if *a == self.id {
					Some(b.clone())
				} else if *b == self.id {
					Some(a.clone())
				} else {
					None
				}
			})
			.sorted()
			.collect()
	}

	fn is_connected(&self, node: &NodeId) -> bool {
		self.inner.links.read().contains(&ordered(&self.id, node))
	}

	fn attach(&self, intake: mpsc::UnboundedSender<Intake>) {
		self.inner.services.write().insert(self.id.clone(), intake);
	}

	fn send(&self, node: &NodeId, wire: Wire) {
		if self.reachable(node) {
			self.inner.deliver(node, Intake::Wire(wire));
		}
	}

	fn call(
		&self,
		node: &NodeId,
		request: Request,
		timeout: Option<Duration>,
	) -> impl Future<Output = Result<Reply, CallError>> + Send {
		let this = self.clone();
		let node = node.clone();

		async move {
			if !this.reachable(&node) {
				return Err(CallError::Unreachable);
			}

			let service = this
				.inner
				.services
				.read()
				.get(&node)
				.cloned()
				.ok_or(CallError::Unreachable)?;

			let (reply_tx, reply_rx) = oneshot::channel();
			service
				.send(Intake::Call(request, reply_tx))
				.map_err(|_| CallError::Unreachable)?;

			match timeout {
				Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
					Ok(Ok(reply)) => Ok(reply),
					Ok(Err(_)) => Err(CallError::Unreachable),
					Err(_) => Err(CallError::Timeout),
				},
				None => reply_rx.await.map_err(|_| CallError::Unreachable),
			}
		}
	}

	fn lock(
		&self,
		key: &LockKey,
		retries: usize,
	) -> impl Future<Output = Option<Self::Lock>> + Send {
		let this = self.clone();
		let key = key.clone();

		async move {
			// one initial attempt plus `retries` re-attempts; every aborted
			// attempt consumes one injected refusal
			let mut attempts = retries + 1;
			while this.inner.take_refusal() {
				attempts -= 1;
				if attempts == 0 {
					return None;
				}
			}

			let mutex = {
				let mut locks = this.inner.locks.lock();
				Arc::clone(
					locks
						.entry(key)
						.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
				)
			};

			Some(mutex.lock_owned().await)
		}
	}

	fn monitor(&self, endpoint: &EndpointId, deaths: DeathSink) -> MonitorRef {
		let monitor =
			MonitorRef::new(self.inner.monitors.fetch_add(1, Ordering::Relaxed) + 1);

		if self.inner.alive.read().contains(endpoint) {
			self.inner.watches.write().insert(monitor, Watch {
				endpoint: endpoint.clone(),
				sink: deaths,
			});
		} else {
			// already dead: fire immediately
			self.inner.fired.write().insert(monitor);
			let _ = deaths.send(Down(monitor));
		}

		monitor
	}

	fn demonitor(&self, monitor: MonitorRef) -> bool {
		if self.inner.watches.write().remove(&monitor).is_some() {
			true
		} else {
			self.inner.fired.write().remove(&monitor);
			false
		}
	}
}

struct Inner {
	/// Attached registry services, one intake per node.
	services: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Intake>>>,

	/// Symmetric links, stored as ordered pairs.
	links: RwLock<HashSet<(NodeId, NodeId)>>,

	/// Endpoints that have been spawned and not yet killed.
	alive: RwLock<HashSet<EndpointId>>,

	/// Armed monitors.
	watches: RwLock<HashMap<MonitorRef, Watch>>,

	/// Monitors that have fired and not yet been demonitored.
	fired: RwLock<HashSet<MonitorRef>>,

	/// The cluster-wide named lock, one fair mutex per key.
	locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,

	/// Pending acquisition aborts injected by [`Mesh::refuse_locks`].
	lock_refusals: AtomicUsize,

	serials: AtomicU64,
	monitors: AtomicU64,
}

impl Inner {
	fn deliver(&self, node: &NodeId, event: Intake) {
		if let Some(service) = self.services.read().get(node) {
			let _ = service.send(event);
		}
	}

	fn take_refusal(&self) -> bool {
		self
			.lock_refusals
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
			.is_ok()
	}
}

struct Watch {
	endpoint: EndpointId,
	sink: DeathSink,
}

fn ordered(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
	if a <= b {
		(a.clone(), b.clone())
	} else {
		(b.clone(), a.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn service(
		mesh: &Mesh,
		node: &str,
	) -> mpsc::UnboundedReceiver<Intake> {
		let (tx, rx) = mpsc::unbounded_channel();
		mesh.node(node).attach(tx);
		rx
	}

	#[tokio::test]
	async fn connect_delivers_link_events_to_both_sides() {
		let mesh = Mesh::default();
		let mut a = service(&mesh, "a");
		let mut b = service(&mesh, "b");

		mesh.connect("a", "b");

		assert!(matches!(
			a.recv().await,
			Some(Intake::Link(LinkEvent::Up(node))) if node == NodeId::from("b")
		));
		assert!(matches!(
			b.recv().await,
			Some(Intake::Link(LinkEvent::Up(node))) if node == NodeId::from("a")
		));

		mesh.disconnect("a", "b");

		assert!(matches!(
			a.recv().await,
			Some(Intake::Link(LinkEvent::Down(node))) if node == NodeId::from("b")
		));
		assert!(matches!(
			b.recv().await,
			Some(Intake::Link(LinkEvent::Down(node))) if node == NodeId::from("a")
		));
	}

	#[tokio::test]
	async fn nodes_reflects_links() {
		let mesh = Mesh::default();
		let a = mesh.node("a");

		assert!(a.nodes().is_empty());

		mesh.connect("a", "b");
		mesh.connect("a", "c");
		mesh.connect("b", "c");

		assert_eq!(a.nodes(), vec![NodeId::from("b"), NodeId::from("c")]);
		assert!(a.is_connected(&NodeId::from("b")));

		mesh.disconnect("a", "b");
		assert_eq!(a.nodes(), vec![NodeId::from("c")]);
		assert!(!a.is_connected(&NodeId::from("b")));
	}

	#[tokio::test]
	async fn call_to_unreachable_node_fails() {
		let mesh = Mesh::default();
		let _a = service(&mesh, "a");
		let a = mesh.node("a");

		// not linked
		let result = a
			.call(&NodeId::from("b"), Request::Sync, None)
			.await;
		assert_eq!(result, Err(CallError::Unreachable));

		// linked but no service attached
		mesh.connect("a", "b");
		let result = a
			.call(&NodeId::from("b"), Request::Sync, None)
			.await;
		assert_eq!(result, Err(CallError::Unreachable));
	}

	#[tokio::test]
	async fn self_call_round_trips() {
		let mesh = Mesh::default();
		let mut inbox = service(&mesh, "a");
		let a = mesh.node("a");

		tokio::spawn(async move {
			if let Some(Intake::Call(Request::Sync, reply)) = inbox.recv().await {
				let _ = reply.send(Reply::Synced);
			}
		});

		let reply = a.call(&NodeId::from("a"), Request::Sync, None).await;
		assert_eq!(reply, Ok(Reply::Synced));
	}

	#[tokio::test]
	async fn kill_fires_every_armed_monitor() {
		let mesh = Mesh::default();
		let a = mesh.node("a");
		let b = mesh.node("b");
		let endpoint = mesh.endpoint("a");

		let (deaths_a, mut rx_a) = mpsc::unbounded_channel();
		let (deaths_b, mut rx_b) = mpsc::unbounded_channel();
		let mon_a = a.monitor(&endpoint, deaths_a);
		let mon_b = b.monitor(&endpoint, deaths_b);

		mesh.kill(&endpoint);

		assert_eq!(rx_a.recv().await, Some(Down(mon_a)));
		assert_eq!(rx_b.recv().await, Some(Down(mon_b)));
	}

	#[tokio::test]
	async fn monitoring_a_dead_endpoint_fires_immediately() {
		let mesh = Mesh::default();
		let a = mesh.node("a");
		let endpoint = mesh.endpoint("a");
		mesh.kill(&endpoint);

		let (deaths, mut rx) = mpsc::unbounded_channel();
		let monitor = a.monitor(&endpoint, deaths);

		assert_eq!(rx.recv().await, Some(Down(monitor)));
		// fired: a flush is required
		assert!(!a.demonitor(monitor));
	}

	#[tokio::test]
	async fn demonitor_reports_flush_requirement() {
		let mesh = Mesh::default();
		let a = mesh.node("a");
		let endpoint = mesh.endpoint("a");

		let (deaths, _rx) = mpsc::unbounded_channel();
		let armed = a.monitor(&endpoint, deaths.clone());
		assert!(a.demonitor(armed));

		let fired = a.monitor(&endpoint, deaths);
		mesh.kill(&endpoint);
		assert!(!a.demonitor(fired));
	}

	#[tokio::test]
	async fn refusals_are_absorbed_by_the_retry_budget() {
		let mesh = Mesh::default();
		let a = mesh.node("a");
		let key = LockKey::group(&"g".into());

		// up to `retries` aborted attempts are retried internally
		mesh.refuse_locks(5);
		assert!(a.lock(&key, 5).await.is_some());

		// one refusal more than the budget exhausts every attempt
		mesh.refuse_locks(6);
		assert!(a.lock(&key, 5).await.is_none());

		// the exhausted call consumed its refusals; the next one succeeds
		assert!(a.lock(&key, 5).await.is_some());
	}

	#[tokio::test]
	async fn lock_is_exclusive_per_key() {
		let mesh = Mesh::default();
		let a = mesh.node("a");
		let b = mesh.node("b");
		let key = LockKey::group(&"g".into());

		let guard = a.lock(&key, 5).await.expect("first acquisition");

		let contended = tokio::time::timeout(
			Duration::from_millis(50),
			b.lock(&key, 5),
		)
		.await;
		assert!(contended.is_err(), "second acquisition must block");

		drop(guard);
		assert!(b.lock(&key, 5).await.is_some());

		// different keys do not contend
		let other = LockKey::group(&"h".into());
		let _g = a.lock(&key, 5).await.expect("reacquire");
		assert!(b.lock(&other, 5).await.is_some());
	}
}
