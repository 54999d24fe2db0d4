pub mod filters;
pub mod manager;
pub mod preference;
pub mod run_history;
pub mod store;

pub use manager::InstanceOfferManager;
