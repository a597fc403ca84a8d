//! Channel adapters, the registry that holds them and the router that picks one.

pub mod error;
pub mod factory;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod router;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use provider::ChannelAdapter;
pub use registry::{ChannelRegistry, RegistrySnapshot};
pub use router::{RouteSelection, Router, RoutingError};
