pub mod acquisition;
pub mod config;
pub mod configuration;
pub mod decoder;
pub mod device;
pub mod digitizer;
pub mod drain;
pub mod error;
pub mod event;
pub mod mask;
pub mod model;
pub mod sim;
pub mod store;

pub use acquisition::*;
pub use config::*;
pub use configuration::*;
pub use decoder::*;
pub use device::*;
pub use digitizer::*;
pub use drain::*;
pub use error::*;
pub use event::*;
pub use mask::*;
pub use model::*;
pub use sim::SimDigitizer;
pub use store::*;
