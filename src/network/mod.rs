pub mod client;
pub mod config;
pub mod driver;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use client::{Client, ClientEvent, ClientOptions};
pub use config::{DEFAULT_PORT, RelayConfig};
pub use driver::{DriverContext, display_name, drive};
pub use registry::SessionRegistry;
pub use router::{BroadcastReport, RouteSink, Router, join_notice, leave_notice};
pub use server::{RelayHandle, SERVER_NAME, Server};
pub use session::{Frame, Session, SessionId, SessionInfo, SessionOptions};
