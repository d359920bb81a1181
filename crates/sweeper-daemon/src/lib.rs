//! Sweeper daemon - hosts the cleanup engine next to a simulated world.
//!
//! The simulated world stands in for a game server: a tick thread advances
//! its clock and drains the engine's mutation mailbox once per tick, exactly
//! where a real host would call it from its update loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod report;
pub mod sim;

pub use cli::{Cli, Command, Preset};
pub use sim::{SimWorld, TickLoop};
