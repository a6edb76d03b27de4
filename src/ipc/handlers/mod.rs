pub mod admins;
pub mod attendance;
pub mod backup_exchange;
pub mod batches;
pub mod coaches;
pub mod core;
pub mod fees;
pub mod students;
