pub mod context;
pub mod handler;
pub mod route;

pub use context::{BoxBody, RequestContext};
pub use handler::handle_request;
