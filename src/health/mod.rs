pub mod registry;

pub use registry::{HealthRegistry, HealthSnapshot, ReadinessState};
