//! The process-group registry service and its public handle.

use {
	crate::{
		error::Error,
		id::{EndpointId, GroupName, NodeId},
		substrate::{Intake, Substrate},
		verify::Report,
	},
	parking_lot::Mutex,
	protocol::{Mutation, Request, Subscribed, Update, Wire},
	rand::Rng,
	std::{fmt, sync::Arc},
	table::Views,
	worker::WorkerLoop,
	tokio::{
		sync::{mpsc, oneshot},
		task::JoinHandle,
	},
	tokio_util::sync::{CancellationToken, DropGuard},
};

mod coordinator;
mod error;
mod monitors;
mod observers;
mod table;
mod worker;

pub mod protocol;

/// A cluster-wide directory mapping group names to the live worker endpoints
/// that have joined them.
///
/// Notes:
///
/// - This type is cheap to clone; all clones refer to the same registry
///   service on the local node. The service stops when the last clone is
///   dropped or [`Registry::shutdown`] is called.
///
/// - One registry service runs per node, bound to the substrate under a
///   well-known service id. Mutations coordinate cluster-wide through a
///   group-scoped lock and a best-effort fan-out; reads are answered from a
///   local snapshot with no coordination at all.
///
/// - The registry is eventually consistent. A mutation that fails to reach a
///   node is not an error: divergence is repaired by the pairwise exchange
///   protocol, triggered on node-up, on hello and on resync.
pub struct Registry<S: Substrate>(Arc<Inner<S>>);

impl<S: Substrate> Clone for Registry<S> {
	fn clone(&self) -> Self {
		Self(Arc::clone(&self.0))
	}
}

struct Inner<S: Substrate> {
	/// The clustering substrate this node runs on.
	substrate: S,

	/// Event channel into the worker loop.
	intake: mpsc::UnboundedSender<Intake>,

	/// Materialised group views published by the worker; every read is
	/// served from the latest snapshot here.
	views: tokio::sync::watch::Receiver<Views>,

	/// Cancelled to stop the worker; also cancelled by the worker itself on
	/// fatal errors.
	termination: CancellationToken,

	/// The worker task, taken by [`Registry::shutdown`].
	task: Mutex<Option<JoinHandle<()>>>,

	/// Stops the worker when the last handle is dropped.
	_abort: DropGuard,
}

/// Construction API.
impl<S: Substrate> Registry<S> {
	/// Binds a registry service to the substrate and spawns its worker loop.
	///
	/// The new service immediately announces itself to every currently
	/// connected peer and exchanges state with each of them.
	pub fn spawn(substrate: S) -> Self {
		let termination = CancellationToken::new();
		let handle = WorkerLoop::spawn(substrate.clone(), termination.clone());

		Self(Arc::new(Inner {
			substrate,
			intake: handle.intake,
			views: handle.views,
			termination: termination.clone(),
			task: Mutex::new(Some(handle.task)),
			_abort: termination.drop_guard(),
		}))
	}
}

/// Mutation API. Each of these coordinates cluster-wide under the
/// group-scoped lock and succeeds regardless of unreachable peers.
impl<S: Substrate> Registry<S> {
	/// Creates the group everywhere. Idempotent; creating an existing group
	/// is a no-op answered locally.
	pub async fn create(&self, name: impl Into<GroupName>) -> Result<(), Error> {
		let name = name.into();
		if self.0.views.borrow().contains_key(&name) {
			return Ok(());
		}

		self.alive()?;
		self.coordinate(Mutation::Create(name)).await;
		Ok(())
	}

	/// Deletes the group everywhere, removing every membership it held.
	pub async fn delete(&self, name: impl Into<GroupName>) -> Result<(), Error> {
		self.alive()?;
		self.coordinate(Mutation::Delete(name.into())).await;
		Ok(())
	}

	/// Joins an endpoint to the group. An endpoint may join the same group
	/// multiple times; it must then leave equally many times.
	pub async fn join(
		&self,
		name: impl Into<GroupName>,
		endpoint: EndpointId,
	) -> Result<(), Error> {
		let name = name.into();
		if !self.0.views.borrow().contains_key(&name) {
			return Err(Error::NoSuchGroup(name));
		}

		self.alive()?;
		self.coordinate(Mutation::Join(name, endpoint)).await;
		Ok(())
	}

	/// Undoes one join of the endpoint from the group. Leaving a group the
	/// endpoint is not a member of has no effect.
	pub async fn leave(
		&self,
		name: impl Into<GroupName>,
		endpoint: EndpointId,
	) -> Result<(), Error> {
		let name = name.into();
		if !self.0.views.borrow().contains_key(&name) {
			return Err(Error::NoSuchGroup(name));
		}

		self.alive()?;
		self.coordinate(Mutation::Leave(name, endpoint)).await;
		Ok(())
	}
}

/// Read API. All reads are served from the local materialised snapshot and
/// never coordinate.
impl<S: Substrate> Registry<S> {
	/// All members of the group as known on this node, repeated once per
	/// join.
	pub fn members(
		&self,
		name: impl Into<GroupName>,
	) -> Result<Vec<EndpointId>, Error> {
		let name = name.into();
		self
			.0
			.views
			.borrow()
			.get(&name)
			.map(|view| view.members.iter().cloned().collect())
			.ok_or(Error::NoSuchGroup(name))
	}

	/// The members of the group hosted on this node.
	pub fn local_members(
		&self,
		name: impl Into<GroupName>,
	) -> Result<Vec<EndpointId>, Error> {
		let name = name.into();
		self
			.0
			.views
			.borrow()
			.get(&name)
			.map(|view| view.local.iter().cloned().collect())
			.ok_or(Error::NoSuchGroup(name))
	}

	/// The names of every group known on this node.
	pub fn groups(&self) -> Vec<GroupName> {
		self.0.views.borrow().keys().cloned().collect()
	}

	/// Picks a member for dispatch, preferring local ones: a sole local
	/// member is returned as-is, otherwise a uniformly random pick from the
	/// local members, falling back to the full list.
	pub fn closest(
		&self,
		name: impl Into<GroupName>,
	) -> Result<EndpointId, Error> {
		let name = name.into();
		let views = self.0.views.borrow();
		let Some(view) = views.get(&name) else {
			drop(views);
			return Err(Error::NoSuchGroup(name));
		};

		if view.local.len() == 1 {
			return Ok(view.local[0].clone());
		}

		let pool = if view.local.is_empty() {
			&view.members
		} else {
			&view.local
		};

		if pool.is_empty() {
			drop(views);
			return Err(Error::NoProcess(name));
		}

		let pick = rand::rng().random_range(0..pool.len());
		Ok(pool[pick].clone())
	}
}

/// Synchronization and introspection API.
impl<S: Substrate> Registry<S> {
	/// Mailbox barrier: resolves once every event enqueued to the local
	/// service before this call has been processed.
	pub async fn sync(&self) -> Result<(), Error> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self
			.0
			.intake
			.send(Intake::Call(Request::Sync, reply_tx))
			.map_err(|_| Error::Terminated)?;

		reply_rx.await.map(|_| ()).map_err(|_| Error::Terminated)
	}

	/// Asks the local service to re-push its state to all of its peers.
	/// Fire-and-forget.
	pub fn resync(&self) {
		let _ = self.0.intake.send(Intake::Wire(Wire::Resync));
	}

	/// Signals every known registry service, the local one included, to
	/// re-push its state to all of its peers. Returns the number of services
	/// signalled.
	pub async fn global_resync(&self) -> Result<usize, Error> {
		self.alive()?;

		let peers = self.0.substrate.nodes();
		for peer in &peers {
			self.0.substrate.send(peer, Wire::Resync);
		}
		self.resync();

		Ok(peers.len() + 1)
	}

	/// Subscribes a local observer: every mutation on this node that changes
	/// group membership is delivered to `sink` as an [`Update`] carrying the
	/// affected group names, in mutation order.
	///
	/// The observer endpoint is monitored; a dead observer, or one whose
	/// sink has closed, is removed from the subscriber set silently.
	pub async fn observe(
		&self,
		observer: EndpointId,
		sink: mpsc::UnboundedSender<Update>,
	) -> Result<Subscribed, Error> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self
			.0
			.intake
			.send(Intake::Observe(observer, sink, reply_tx))
			.map_err(|_| Error::Terminated)?;

		reply_rx.await.map_err(|_| Error::Terminated)
	}

	/// Scrapes every known node's view of the given group (or of all groups)
	/// and reports the asymmetries. Read-only; unreachable nodes are listed
	/// in the report rather than raised.
	pub async fn verify(&self, group: Option<GroupName>) -> Report {
		crate::verify::verify_cluster_state(&self.0.substrate, group).await
	}

	/// The identity of the node this registry runs on.
	pub fn node(&self) -> NodeId {
		self.0.substrate.node()
	}

	/// Returns a reference to the substrate this registry runs on.
	pub fn substrate(&self) -> &S {
		&self.0.substrate
	}

	/// Stops the worker loop and waits for it to finish.
	pub async fn shutdown(&self) {
		self.0.termination.cancel();
		let task = self.0.task.lock().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}

/// Internal API.
impl<S: Substrate> Registry<S> {
	async fn coordinate(&self, mutation: Mutation) {
		coordinator::coordinate(&self.0.substrate, &self.0.intake, mutation)
			.await;
	}

	fn alive(&self) -> Result<(), Error> {
		if self.0.termination.is_cancelled() {
			return Err(Error::Terminated);
		}
		Ok(())
	}
}

impl<S: Substrate> fmt::Debug for Registry<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registry")
			.field("node", &self.0.substrate.node())
			.field("groups", &self.0.views.borrow().len())
			.finish()
	}
}

impl<S: Substrate> fmt::Display for Registry<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Registry({})", self.0.substrate.node())
	}
}
