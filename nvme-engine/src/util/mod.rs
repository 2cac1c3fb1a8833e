//! Helpers shared by the wire encoders and the device models.

pub mod iov;
pub mod string;
