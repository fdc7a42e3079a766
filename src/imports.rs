pub mod tags;
pub mod wallet;
