//! Request authorization gate: configuration, identity extraction and the
//! enforcing middleware.

pub mod config;
pub mod directive;
pub mod enforcer;
pub mod errors;
pub mod input;

pub use config::{parse_directives, ChainConfig, GateConfig};
pub use enforcer::{authorize, PolicyGate};
pub use errors::{AuthorizationError, ConfigError, SetupError};
pub use input::{DecisionInput, IdentityStrategy};
