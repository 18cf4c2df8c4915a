//! Network transport and request routing.

mod router;
mod transport;

pub use router::{FetchRequest, FetchRouter};
pub use transport::{HttpTransport, Transport};
