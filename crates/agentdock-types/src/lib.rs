mod event;
mod provider;
mod task;
mod value;

pub use event::*;
pub use provider::*;
pub use task::*;
pub use value::*;
