pub mod exporter;

pub use exporter::MetricsRegistry;
