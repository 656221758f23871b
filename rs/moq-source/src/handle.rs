use std::fmt;
use std::sync::Arc;

use crate::{Error, Id, Transport};

/// The kind of transport resource behind a [Handle].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
	Origin,
	Session,
	Broadcast,
	CatalogTask,
	Catalog,
	Track,
	Frame,
}

impl fmt::Display for Resource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Resource::Origin => "origin",
			Resource::Session => "session",
			Resource::Broadcast => "broadcast",
			Resource::CatalogTask => "catalog task",
			Resource::Catalog => "catalog",
			Resource::Track => "track",
			Resource::Frame => "frame",
		};
		f.write_str(name)
	}
}

/// An owned transport resource, closed exactly once.
///
/// Closing twice is a no-op, and dropping an open handle closes it. Never drop a handle
/// while holding the session lock unless the transport is known not to call back.
pub struct Handle {
	resource: Resource,
	id: Option<Id>,
	transport: Arc<dyn Transport>,
}

impl Handle {
	pub fn new(transport: Arc<dyn Transport>, resource: Resource, id: Id) -> Self {
		Self {
			resource,
			id: Some(id),
			transport,
		}
	}

	pub fn resource(&self) -> Resource {
		self.resource
	}

	/// The id, or `None` once closed.
	pub fn id(&self) -> Option<Id> {
		self.id
	}

	pub fn is_closed(&self) -> bool {
		self.id.is_none()
	}

	pub fn close(&mut self) -> Result<(), Error> {
		let Some(id) = self.id.take() else {
			tracing::debug!(resource = %self.resource, "already closed");
			return Ok(());
		};

		tracing::debug!(resource = %self.resource, %id, "closing");
		self.transport.close(self.resource, id)
	}
}

impl Drop for Handle {
	fn drop(&mut self) {
		if self.id.is_none() {
			return;
		}

		if let Err(err) = self.close() {
			tracing::warn!(resource = %self.resource, %err, "failed to close");
		}
	}
}

impl fmt::Debug for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Handle")
			.field("resource", &self.resource)
			.field("id", &self.id)
			.finish()
	}
}
