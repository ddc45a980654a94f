//! Client side of the status endpoint of a running controller.
pub mod status;
