//! courier library — peer channel subsystem for a two-party messenger.
//!
//! The pure protocol machines (`session`, `call`, `chunk`, `codec`) carry
//! no I/O; `manager` drives them from one event loop per local user, and
//! `relay` holds the signaling relay's routing state. Binary targets and
//! integration tests build on these modules.

pub mod call;
pub mod candidate_filter;
pub mod chunk;
pub mod codec;
pub mod control;
pub mod key_directory;
pub mod key_store;
pub mod manager;
pub mod message;
pub mod relay;
pub mod session;
pub mod transport;
