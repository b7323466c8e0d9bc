//! Pure commission arithmetic and the commission state machine.
//!
//! Everything in this crate is deterministic and IO-free: no store handles,
//! no time, no randomness. `qh-db` drives these functions from inside its
//! transactions; the unit tests here pin down the capacity/floor rules, the
//! canonical lock order, and the idempotent resolution semantics without
//! needing a database.

mod checks;
mod ordering;
mod state;

pub use checks::{check_delta, check_reversal, validate_limit, HoldingView};
pub use ordering::canonical_order;
pub use state::{resolve, Resolution, Transition};
