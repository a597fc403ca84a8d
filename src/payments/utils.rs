use crate::payments::error::{PaymentError, PaymentResult};
use bigdecimal::{BigDecimal, ToPrimitive};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// Outbound HTTP client shared by the channel adapters.
///
/// `request_json` retries transport errors, 429 and 5xx with exponential
/// backoff and is meant for idempotent calls (status queries, token fetches).
/// `send_once` performs a single attempt and is used for charge submission.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: Option<&str>,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        self.execute(
            method,
            url,
            bearer_token,
            body,
            additional_headers,
            self.max_retries,
        )
        .await
    }

    pub async fn send_once<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: Option<&str>,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        self.execute(method, url, bearer_token, body, additional_headers, 0)
            .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: Option<&str>,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
        max_retries: u32,
    ) -> PaymentResult<T> {
        let mut last_error = None;
        for attempt in 0..=max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);

            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            for (k, v) in additional_headers {
                request = request.header(*k, *v);
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let response = request
                .send()
                .await
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("provider request failed: {}", e),
                });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::ProviderError {
                                provider: "http".to_string(),
                                message: format!("invalid provider JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < max_retries {
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::RateLimitError {
                            message: "provider rate limit exceeded".to_string(),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() && attempt < max_retries {
                        warn!(
                            status = %status,
                            attempt = attempt + 1,
                            "provider server error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }

                    return Err(PaymentError::ProviderError {
                        provider: "http".to_string(),
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                        retryable: status.is_server_error(),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: "provider request failed".to_string(),
        }))
    }
}

pub fn verify_hmac_sha512_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha512;

    type HmacSha512 = Hmac<Sha512>;
    let mut mac = match HmacSha512::new_from_slice(secret.as_bytes()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    mac.update(payload);
    let computed = hex::encode(mac.finalize().into_bytes());
    secure_eq(computed.as_bytes(), signature.trim().as_bytes())
}

pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Read a string-or-number field by JSON pointer, rendered as a string.
pub fn json_string(value: &JsonValue, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Deserialize a channel account's settings JSON into a provider config.
pub fn parse_account_settings<T: DeserializeOwned>(
    account_id: &str,
    settings: &JsonValue,
) -> PaymentResult<T> {
    serde_json::from_value(settings.clone()).map_err(|e| PaymentError::ConfigurationError {
        account_id: account_id.to_string(),
        message: format!("invalid settings: {}", e),
    })
}

/// Webhook URL handed to the provider; the trailing segment is the payment id.
pub fn webhook_callback_url(base_url: &str, channel: &str, payment_id: &uuid::Uuid) -> String {
    format!(
        "{}/webhooks/{}/{}",
        base_url.trim_end_matches('/'),
        channel,
        payment_id
    )
}

/// Amount in the currency's minor unit (kobo, pesewa, cents). Fractions below
/// the minor unit are truncated.
pub fn to_minor_units(amount: &BigDecimal, exponent: i64) -> PaymentResult<i64> {
    let factor = BigDecimal::from(10_i64.pow(exponent as u32));
    (amount * factor)
        .with_scale(0)
        .to_i64()
        .ok_or_else(|| PaymentError::ValidationError {
            message: format!("amount {} out of range", amount),
            field: Some("amount".to_string()),
        })
}

/// Inverse of `to_minor_units`, for providers that report kobo or cents.
pub fn from_minor_units(amount: i64, exponent: i64) -> BigDecimal {
    BigDecimal::new(amount.into(), exponent)
}
