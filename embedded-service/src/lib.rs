//! Embedded Services Interface Exports

#![no_std]
#![warn(missing_docs)]

pub mod fmt;
pub mod mms;
pub mod power;
pub mod vote;
