//! Distributed process-group registry.
//!
//! A cluster-wide directory mapping user-chosen group names to the set of
//! live worker endpoints that have joined them, replicated independently on
//! every node and kept eventually consistent through a lock-and-fan-out
//! mutation pipeline plus a pairwise state-exchange protocol.
//!
//! The crate is transport-agnostic: everything it needs from a cluster is
//! expressed by the [`substrate::Substrate`] trait, and a built-in
//! in-process [`substrate::mesh::Mesh`] is provided for tests, examples and
//! single-process embeddings.

mod error;
mod id;
mod registry;

pub mod substrate;
pub mod verify;

pub use {
	error::Error,
	id::{EndpointId, GroupName, MonitorRef, NodeId},
	registry::{Registry, protocol},
};

pub mod prelude {
	pub use super::{
		error::Error,
		id::{EndpointId, GroupName, NodeId},
		registry::{
			Registry,
			protocol::{Subscribed, Update},
		},
		substrate::{
			Substrate,
			mesh::{Mesh, MeshNode},
		},
		verify::{Diff, Report},
	};
}

#[cfg(feature = "test-utils")]
pub mod test_utils;
