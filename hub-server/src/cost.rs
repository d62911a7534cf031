//! Cost signal providers.
//!
//! The admission controller polls a [`CostProvider`] on a fixed interval.
//! A failed poll never blocks or crashes anything; the controller falls
//! back to its linear estimate instead.

use async_trait::async_trait;
use hub_core::CostReading;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::CostError;

/// Source of current and projected spend.
#[async_trait]
pub trait CostProvider: Send + Sync {
    /// Fetch a fresh reading.
    async fn poll(&self) -> Result<CostReading, CostError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

fn check_reading(reading: CostReading) -> Result<CostReading, CostError> {
    let valid = |v: f64| v.is_finite() && v >= 0.0;
    if valid(reading.current_spend) && valid(reading.projected_spend) {
        Ok(reading)
    } else {
        Err(CostError::InvalidReading(format!(
            "current={} projected={}",
            reading.current_spend, reading.projected_spend
        )))
    }
}

/// A provider holding a value set by hand.
///
/// Used by operators pinning a known spend and by tests driving mode
/// transitions.
#[derive(Debug)]
pub struct StaticCostProvider {
    reading: Mutex<Result<CostReading, String>>,
}

impl StaticCostProvider {
    /// Provider returning `reading` until changed.
    pub fn new(reading: CostReading) -> Self {
        Self {
            reading: Mutex::new(Ok(reading)),
        }
    }

    /// Provider reporting zero spend.
    pub fn zero() -> Self {
        Self::new(CostReading {
            current_spend: 0.0,
            projected_spend: 0.0,
        })
    }

    /// Provider whose reading puts projected spend at `ratio` of `budget`.
    pub fn at_ratio(ratio: f64, budget: f64) -> Self {
        Self::new(CostReading {
            current_spend: 0.0,
            projected_spend: ratio * budget,
        })
    }

    /// Replace the reading.
    pub fn set(&self, reading: CostReading) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = Ok(reading);
    }

    /// Make subsequent polls fail with `reason`.
    pub fn fail(&self, reason: impl Into<String>) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = Err(reason.into());
    }
}

#[async_trait]
impl CostProvider for StaticCostProvider {
    async fn poll(&self) -> Result<CostReading, CostError> {
        let reading = self
            .reading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        reading
            .map_err(CostError::Unavailable)
            .and_then(check_reading)
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// A provider fetching `{"current_spend": f64, "projected_spend": f64}`
/// over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCostProvider {
    url: String,
    http: reqwest::Client,
}

impl HttpCostProvider {
    /// Create a provider for `url` with a request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CostError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    /// Endpoint being polled.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CostProvider for HttpCostProvider {
    async fn poll(&self) -> Result<CostReading, CostError> {
        let response = self.http.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(CostError::Unavailable(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        let reading: CostReading = response.json().await?;
        check_reading(reading)
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_returns_and_updates_reading() {
        let provider = StaticCostProvider::at_ratio(0.5, 100.0);
        let r = provider.poll().await.unwrap();
        assert_eq!(r.projected_spend, 50.0);

        provider.set(CostReading {
            current_spend: 10.0,
            projected_spend: 96.0,
        });
        assert_eq!(provider.poll().await.unwrap().projected_spend, 96.0);
    }

    #[tokio::test]
    async fn static_provider_can_fail() {
        let provider = StaticCostProvider::zero();
        provider.fail("billing API down");
        assert!(matches!(
            provider.poll().await,
            Err(CostError::Unavailable(reason)) if reason == "billing API down"
        ));
    }

    #[tokio::test]
    async fn negative_or_nan_readings_are_rejected() {
        let provider = StaticCostProvider::new(CostReading {
            current_spend: -1.0,
            projected_spend: 5.0,
        });
        assert!(matches!(
            provider.poll().await,
            Err(CostError::InvalidReading(_))
        ));

        provider.set(CostReading {
            current_spend: 1.0,
            projected_spend: f64::NAN,
        });
        assert!(provider.poll().await.is_err());
    }

    #[tokio::test]
    async fn http_provider_unreachable_is_an_error() {
        let provider =
            HttpCostProvider::new("http://127.0.0.1:9/cost", Duration::from_millis(200)).unwrap();
        assert_eq!(provider.url(), "http://127.0.0.1:9/cost");
        assert!(provider.poll().await.is_err());
    }
}
