//! Gateway façade and admin server

mod facade;
mod router;
mod server;

pub use facade::{BackendDiagnostics, DiagnosticsReport, Gateway, GatewayBuilder, Submission};
pub use router::{AppState, create_router};
pub use server::GatewayServer;
