pub mod attendance;
pub mod core;
pub mod notify;
pub mod scan;
pub mod settings;
pub mod stats;
pub mod students;
