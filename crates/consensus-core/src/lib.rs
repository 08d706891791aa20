pub mod error;
pub mod memory;
pub mod prices;
pub mod traits;
pub mod types;

pub use error::*;
pub use memory::InMemoryMarket;
pub use prices::PriceSnapshot;
pub use traits::*;
pub use types::*;
