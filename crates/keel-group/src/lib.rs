//! An ephemeral-membership view over an external coordination service.
//!
//! The group actor is the one place that talks to the coordination
//! service; everything else consumes its observed set of memberships.
//! Memberships are ephemeral and sequence-ordered; by convention the
//! smallest live sequence is the leader.

pub mod error;
pub mod group;
pub mod service;

pub use error::{GroupError, GroupResult};
pub use group::{Group, GroupOptions, Membership};
pub use service::{CoordinationService, LocalCoordinationService, ServiceEvent, SessionId};
