pub mod market;
pub mod order;
pub mod position;
pub mod session;
pub mod signal;
pub mod trade;

pub use market::*;
pub use order::*;
pub use position::*;
pub use session::*;
pub use signal::*;
pub use trade::*;
