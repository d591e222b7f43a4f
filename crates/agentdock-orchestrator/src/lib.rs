pub mod cost;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod poller;
pub mod supervisor;
pub mod validation;

pub use cost::*;
pub use engine::*;
pub use error::*;
pub use normalize::*;
pub use poller::*;
pub use supervisor::*;
pub use validation::*;
