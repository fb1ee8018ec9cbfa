pub mod clock;
pub mod record;
pub mod tier;

pub use clock::*;
pub use record::*;
pub use tier::*;
