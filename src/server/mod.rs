//! Checkout backend: the authoritative store the offline queue replays into.

pub mod checkout;
pub mod customers;
pub mod db;
pub mod error;
pub mod inventory;
pub mod routes;
pub mod serials;
pub mod stock;

/// Result of an idempotent mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Created(T),
    /// The idempotency key was seen before; this is the original result.
    Replayed(T),
}

impl<T> Outcome<T> {
    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Outcome::Created(value) | Outcome::Replayed(value) => value,
        }
    }
}
