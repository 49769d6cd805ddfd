pub mod entity;
pub mod learning;
pub mod state;
pub mod task;
pub mod transaction;

pub use entity::*;
pub use learning::*;
pub use state::*;
pub use task::*;
pub use transaction::*;
