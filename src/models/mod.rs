pub mod actor;
pub mod envelope;
pub mod location;
pub mod offer;
pub mod order;
pub mod rider;
