//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod checkout {
    use super::*;

    pub const NAMESPACE: &str = "checkout";

    #[derive(Debug, Clone)]
    pub struct TicketKey {
        pub checkout_id: String,
    }

    impl TicketKey {
        pub fn new(checkout_id: impl Into<String>) -> Self {
            Self {
                checkout_id: checkout_id.into(),
            }
        }
    }

    impl fmt::Display for TicketKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:ticket:{}", VERSION, NAMESPACE, self.checkout_id)
        }
    }
}
