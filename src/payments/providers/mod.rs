pub mod flutterwave;
pub mod mpesa;
pub mod paystack;

pub use flutterwave::{FlutterwaveAdapter, FlutterwaveConfig};
pub use mpesa::{MpesaAdapter, MpesaConfig};
pub use paystack::{PaystackAdapter, PaystackConfig};
