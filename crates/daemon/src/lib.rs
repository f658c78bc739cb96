/// Circuit daemon library
///
/// Runs a client and its relays on an in-process loopback network and
/// serves the client's guard and circuit state over HTTP.

pub mod api;
pub mod sim;

pub use api::ApiServer;
pub use sim::{SimOptions, SimReport};
