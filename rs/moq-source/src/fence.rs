use std::fmt;

use crate::Error;

/// A monotonically increasing connection attempt counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
	pub fn get(&self) -> u64 {
		self.0
	}
}

impl fmt::Display for Generation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Captured by every asynchronous request when it is issued.
///
/// The completion handler must present the token to the [Fence] before touching any
/// shared state. A token is cheap to copy and carries no resources of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(Generation);

impl Token {
	pub fn generation(&self) -> Generation {
		self.0
	}
}

/// The live generation, plus whether it is still accepting completions.
///
/// [Fence::advance] starts a new attempt and cancels every outstanding token.
/// [Fence::revoke] cancels the current attempt without starting another one, which is
/// what a disconnect or a failed attempt does.
#[derive(Debug, Default)]
pub struct Fence {
	current: Generation,
	live: bool,
}

impl Fence {
	pub fn advance(&mut self) -> Token {
		self.current = Generation(self.current.0 + 1);
		self.live = true;
		Token(self.current)
	}

	pub fn revoke(&mut self) {
		self.live = false;
	}

	pub fn generation(&self) -> Generation {
		self.current
	}

	pub fn is_live(&self) -> bool {
		self.live
	}

	pub fn is_current(&self, token: &Token) -> bool {
		self.live && token.0 == self.current
	}

	pub fn check(&self, token: &Token) -> Result<(), Error> {
		match self.is_current(token) {
			true => Ok(()),
			false => Err(Error::Stale),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn advance_cancels_older_tokens() {
		let mut fence = Fence::default();
		assert!(!fence.is_live());

		let first = fence.advance();
		assert!(fence.is_current(&first));

		let second = fence.advance();
		assert!(!fence.is_current(&first));
		assert!(fence.is_current(&second));
		assert!(second.generation() > first.generation());
		assert!(matches!(fence.check(&first), Err(Error::Stale)));
	}

	#[test]
	fn revoke_keeps_generation() {
		let mut fence = Fence::default();
		let token = fence.advance();

		fence.revoke();
		assert!(!fence.is_current(&token));
		assert_eq!(fence.generation(), token.generation());
		assert!(!fence.is_live());

		let next = fence.advance();
		assert_eq!(next.generation().get(), 2);
	}
}
