pub mod monitor;
pub mod suspendible_thread_set;
