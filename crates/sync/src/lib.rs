mod factory;
mod message;
mod record;

pub use factory::*;
pub use message::*;
pub use record::*;

pub use uhlc::NTP64;
