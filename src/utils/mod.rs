pub use cancel_token::*;
pub use core_pinner::*;
pub use health_flag::*;
pub use rate::Rate;
pub use registry::{Registry, SlotId};

mod cancel_token;
pub mod config_io;
mod core_pinner;
mod health_flag;
pub mod logger;
mod rate;
mod registry;
