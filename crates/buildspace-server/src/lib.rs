pub mod gateway;
pub mod server;
pub mod session;

pub use gateway::{Gateway, Toolset};
pub use server::{build_router, start, ServerConfig, ServerHandle};
pub use session::{Session, SessionRegistry};
