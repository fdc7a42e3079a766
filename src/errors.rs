//! All public error types, gathered in one place for the binary and downstream users.

pub use crate::client::{esplora::EsploraClientError, price::PriceFetchError};
pub use crate::client::{PoolError, ProviderError};
pub use crate::imports::{tags::TagsError, wallet::ParseError};
pub use crate::model::PriceDbError;
pub use crate::store::StoreError;
