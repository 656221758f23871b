use std::num::NonZero;

use crate::Error;

/// An opaque transport resource identifier.
///
/// Zero is never a valid id, so `Option<Id>` costs nothing and "invalid" is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(NonZero<u32>);

impl std::fmt::Display for Id {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0.get())
	}
}

/// A slab that hands out [Id]s starting at 1.
pub struct NonZeroSlab<T>(slab::Slab<T>);

impl<T> NonZeroSlab<T> {
	pub fn insert(&mut self, value: T) -> Result<Id, Error> {
		let entry = self.0.vacant_entry();
		let id = Self::id(entry.key()).ok_or(Error::InvalidId)?;
		entry.insert(value);
		Ok(id)
	}

	pub fn get(&self, id: Id) -> Option<&T> {
		self.0.get(Self::index(id))
	}

	pub fn remove(&mut self, id: Id) -> Option<T> {
		self.0.try_remove(Self::index(id))
	}

	pub fn contains(&self, id: Id) -> bool {
		self.0.contains(Self::index(id))
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
		self.0.iter().filter_map(|(key, value)| Some((Self::id(key)?, value)))
	}

	fn id(key: usize) -> Option<Id> {
		let id = u32::try_from(key.checked_add(1)?).ok()?;
		NonZero::new(id).map(Id)
	}

	fn index(id: Id) -> usize {
		(id.0.get() - 1) as usize
	}
}

impl TryFrom<u32> for Id {
	type Error = Error;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		NonZero::try_from(value).map(Id).map_err(|_| Error::InvalidId)
	}
}

impl TryFrom<i32> for Id {
	type Error = Error;

	fn try_from(value: i32) -> Result<Self, Self::Error> {
		Self::try_from(u32::try_from(value).map_err(|_| Error::InvalidId)?)
	}
}

impl From<Id> for u32 {
	fn from(value: Id) -> Self {
		value.0.get()
	}
}

impl<T> Default for NonZeroSlab<T> {
	fn default() -> Self {
		Self(slab::Slab::new())
	}
}
