pub mod compactlogix;
mod eip;
pub mod mock;
pub mod slc500;
pub mod traits;

pub use traits::{DriverError, DriverResult, PlcDriver, ReadOutcome};
