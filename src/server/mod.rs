pub mod fleet;
#[allow(clippy::module_inception)]
pub mod server;
pub mod session;

pub use fleet::Fleet;
pub use server::ComputeServer;
pub use session::{process_tile, Session};
