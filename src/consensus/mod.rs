pub mod acceptor;
pub mod epoch;
pub mod message;
pub mod proof;
pub mod store;
pub mod view;

pub use acceptor::*;
pub use epoch::*;
pub use message::*;
pub use proof::*;
pub use store::*;
pub use view::*;
