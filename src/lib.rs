#![forbid(unsafe_code)]

pub use esploda;

pub mod basis;
pub mod client;
pub mod errors;
pub mod flow;
pub mod imports;
pub mod model;
pub mod store;
pub mod trace;
pub mod tree;
