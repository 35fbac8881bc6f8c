//! Calls to peer applications.

mod apps_client;
mod transport;

pub use apps_client::{app_route, AppsClient};
#[cfg(feature = "http-client")]
pub use transport::ReqwestTransport;
pub use transport::{ClientRequest, ClientResponse, ClientTransport, Method};
