pub mod builders;
pub mod upstream;

pub use builders::{BundleBuilder, GateBuilder};
pub use upstream::Upstream;
