pub mod aft;
pub mod agent;
pub mod bcd;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingress;
pub mod journal;
pub mod meters;
pub mod poll;
pub mod sink;
pub mod transport;

#[macro_use]
mod macros;

pub use agent::Agent;
pub use config::Config;
pub use error::{Error, Result};
