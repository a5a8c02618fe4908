mod error;
pub use error::*;

pub mod config;
pub mod dispatch;
mod fsio;
pub mod message;
pub mod scb;
pub mod seed;
pub mod sphinx;
pub mod system;
