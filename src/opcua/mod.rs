pub mod server;

pub use server::OpcUaAdapter;
