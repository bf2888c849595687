pub mod control_surface;
pub mod framing;
pub mod server;

pub use server::Server;
