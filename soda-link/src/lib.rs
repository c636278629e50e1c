mod link;
pub use link::*;
mod messenger;
pub use messenger::*;
mod transport;
pub use transport::*;
pub mod sim;

pub use tokio_util::sync::CancellationToken;
