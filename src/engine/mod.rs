pub mod assignment;
pub mod lifecycle;
pub mod orders;
pub mod positions;
pub mod queue;
pub mod scoring;
