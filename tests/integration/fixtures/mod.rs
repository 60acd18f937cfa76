pub mod network;
pub mod parties;
