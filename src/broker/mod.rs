pub mod actor;
pub mod allow_list;

pub use actor::Broker;
pub use allow_list::AllowList;
