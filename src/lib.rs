pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod handle;
pub mod io;
pub mod node;
mod test;
pub mod transport;
pub mod utils;

pub mod prelude;
