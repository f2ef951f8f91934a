pub mod observer;
pub mod poller;
