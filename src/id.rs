use {
	core::{convert::Infallible, fmt, str::FromStr},
	derive_more::{Deref, Display, From, Into},
	serde::{Deserialize, Serialize},
};

/// This type identifies a process group by its user-chosen name.
///
/// Group names are the unit of membership: endpoints join and leave groups by
/// name, and the same name refers to the same logical group on every node of
/// the cluster.
#[derive(
	Debug,
	Clone,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
	Deref,
	From,
	Into,
	Display,
)]
pub struct GroupName(String);

impl GroupName {
	pub fn new(name: impl Into<String>) -> Self {
		Self(name.into())
	}
}

impl From<&str> for GroupName {
	fn from(s: &str) -> Self {
		Self::new(s)
	}
}

impl FromStr for GroupName {
	type Err = Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self::new(s))
	}
}

/// This type uniquely identifies a node in the cluster.
///
/// Node identities are assigned by the clustering substrate; the registry
/// treats them as opaque names and only compares them for equality and
/// ordering.
#[derive(
	Debug,
	Clone,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
	Deref,
	From,
	Into,
	Display,
)]
pub struct NodeId(String);

impl NodeId {
	pub fn new(name: impl Into<String>) -> Self {
		Self(name.into())
	}
}

impl From<&str> for NodeId {
	fn from(s: &str) -> Self {
		Self::new(s)
	}
}

/// This type uniquely identifies an addressable worker endpoint across the
/// whole cluster.
///
/// An endpoint identifier carries its home node: the node an endpoint lives
/// on is a property of the identifier itself, never of registry state. The
/// serial disambiguates endpoints spawned on the same node.
#[derive(
	Debug,
	Clone,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
)]
pub struct EndpointId {
	node: NodeId,
	serial: u64,
}

impl EndpointId {
	pub fn new(node: impl Into<NodeId>, serial: u64) -> Self {
		Self {
			node: node.into(),
			serial,
		}
	}

	/// Returns the home node of this endpoint.
	pub const fn node(&self) -> &NodeId {
		&self.node
	}

	pub const fn serial(&self) -> u64 {
		self.serial
	}
}

impl fmt::Display for EndpointId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<{}.{}>", self.node, self.serial)
	}
}

/// An opaque reference to an armed endpoint monitor.
///
/// References are unique for the lifetime of the substrate that issued them
/// and are never reused, so a death notification can always be traced back to
/// the endpoint it was armed for.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
)]
pub struct MonitorRef(u64);

impl MonitorRef {
	pub const fn new(raw: u64) -> Self {
		Self(raw)
	}
}

impl fmt::Display for MonitorRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#mon{}", self.0)
	}
}
