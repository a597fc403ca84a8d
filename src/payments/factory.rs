use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::ChannelAdapter;
use crate::payments::providers::{FlutterwaveAdapter, MpesaAdapter, PaystackAdapter};
use crate::payments::types::{ChannelAccount, ChannelCode};
use std::sync::Arc;

/// Builds a live adapter from a configured channel account.
pub trait AdapterBuilder: Send + Sync {
    fn build(&self, account: &ChannelAccount) -> PaymentResult<Arc<dyn ChannelAdapter>>;
}

/// Production builder for the three external providers.
#[derive(Debug, Clone)]
pub struct ChannelAdapterFactory {
    callback_base_url: String,
}

impl ChannelAdapterFactory {
    pub fn new(callback_base_url: impl Into<String>) -> Self {
        Self {
            callback_base_url: callback_base_url.into(),
        }
    }
}

impl AdapterBuilder for ChannelAdapterFactory {
    fn build(&self, account: &ChannelAccount) -> PaymentResult<Arc<dyn ChannelAdapter>> {
        match account.channel_code {
            ChannelCode::Flutterwave => Ok(Arc::new(FlutterwaveAdapter::from_account(account)?)),
            ChannelCode::Paystack => Ok(Arc::new(PaystackAdapter::from_account(account)?)),
            ChannelCode::Mpesa => Ok(Arc::new(MpesaAdapter::from_account(
                account,
                &self.callback_base_url,
            )?)),
            ChannelCode::Cash | ChannelCode::Sandbox => Err(PaymentError::ConfigurationError {
                account_id: account.account_id.clone(),
                message: format!("{} is handled internally and has no adapter", account.channel_code),
            }),
        }
    }
}
