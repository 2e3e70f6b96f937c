//! The agent core: session state, mention resolution, argument repair, and
//! the bounded tool-use turn loop.

pub mod mention;
pub mod repair;
pub mod session;
pub mod turn_loop;

pub use mention::resolve_mentions;
pub use session::SessionState;
pub use turn_loop::{TurnLoop, TurnLoopConfig, TurnObserver};
