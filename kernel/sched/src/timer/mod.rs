//! The soft-timer engine.
//!
//! Clients schedule callbacks to run within a time window. Triggers
//! whose windows overlap are grouped into one [`event::EventGroup`] so a
//! single hardware-timer interrupt retires all of them; groups are kept
//! sorted in a red-black tree ([`sorter::NodeSorter`]) with cached
//! leftmost/rightmost nodes, and [`queue::EventQueue`] is the client
//! interface over the tree. One kernel-owned hardware timer (PIT or
//! HPET) carries the engine through the [`queue::HardwareTimer`]
//! capability.

pub mod event;
pub mod queue;
pub mod sorter;

pub use event::{Delay, EventCallback, EventGroup, Timestamp, Trigger};
pub use queue::{EventQueue, FiredGroup, HardwareTimer, TriggerHandle, retire_active_events};
pub use sorter::NodeSorter;
