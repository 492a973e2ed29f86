//! Network primitives.
mod socket;

pub use socket::Socket;
