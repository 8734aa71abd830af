pub mod domain;
pub mod relay;
pub mod timezone;
pub mod usage;
pub use domain::*;
pub use relay::*;
pub use timezone::*;
pub use usage::Usage;
