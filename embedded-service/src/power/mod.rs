//! Power related interfaces
pub mod wireless;
