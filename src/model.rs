pub use self::{address::*, exchange_rate::*, flow::*, record::*, stats::*, tree::*};

pub(crate) mod address;
pub(crate) mod exchange_rate;
pub(crate) mod flow;
pub(crate) mod record;
mod stats;
pub(crate) mod tree;
