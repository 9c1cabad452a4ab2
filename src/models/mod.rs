pub mod proxy;
pub mod session;

pub use proxy::*;
pub use session::*;
