//! Device-side half of order synchronization: the transport channel, the
//! location producer, offer countdowns and the tracking view a rider or
//! customer app embeds.

pub mod backend;
pub mod channel;
pub mod error;
pub mod location;
pub mod offer;
pub mod tracking;
