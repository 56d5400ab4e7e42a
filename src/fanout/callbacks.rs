//! Subscriber handlers and the isolation boundary around each call.

use crate::fanout::pair::PairUpdate;
use crate::fanout::registry::SubscriptionId;
use crate::orderbook::{BookSnapshot, PriceSnapshot, TradeEvent};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use tracing::warn;

pub type Handler<T> = Box<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(&SubscriptionError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    PriceUpdate,
    BookUpdate,
    LastTrade,
    PairUpdate,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::PriceUpdate => write!(f, "on_price_update"),
            HandlerKind::BookUpdate => write!(f, "on_book_update"),
            HandlerKind::LastTrade => write!(f, "on_last_trade"),
            HandlerKind::PairUpdate => write!(f, "on_pair_update"),
        }
    }
}

/// A subscriber handler returned an error or panicked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{handler} of subscription {subscription_id} failed: {message}")]
pub struct CallbackError {
    pub subscription_id: SubscriptionId,
    pub handler: HandlerKind,
    pub message: String,
}

/// Delivered to a subscription's `on_error` handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Named handlers for one subscription. All optional; an absent handler
/// simply receives nothing.
#[derive(Default)]
pub struct Callbacks {
    pub(crate) on_price_update: Option<Handler<PriceSnapshot>>,
    pub(crate) on_book_update: Option<Handler<BookSnapshot>>,
    pub(crate) on_last_trade: Option<Handler<TradeEvent>>,
    pub(crate) on_pair_update: Option<Handler<PairUpdate>>,
    pub(crate) on_error: Option<ErrorHandler>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_price_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&PriceSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_price_update = Some(Box::new(f));
        self
    }

    pub fn on_book_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&BookSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_book_update = Some(Box::new(f));
        self
    }

    pub fn on_last_trade<F>(mut self, f: F) -> Self
    where
        F: Fn(&TradeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_last_trade = Some(Box::new(f));
        self
    }

    pub fn on_pair_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&PairUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_pair_update = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SubscriptionError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Route an error to `on_error`, or log it when there is none.
    pub(crate) fn report(&self, subscription_id: SubscriptionId, err: SubscriptionError) {
        match &self.on_error {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(&err))).is_err() {
                    warn!(subscription_id = %subscription_id, error = %err, "on_error handler panicked");
                }
            }
            None => {
                warn!(subscription_id = %subscription_id, error = %err, "unhandled subscription error");
            }
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_price_update", &self.on_price_update.is_some())
            .field("on_book_update", &self.on_book_update.is_some())
            .field("on_last_trade", &self.on_last_trade.is_some())
            .field("on_pair_update", &self.on_pair_update.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Run one handler, catching both returned errors and panics.
pub(crate) fn invoke<T>(
    subscription_id: SubscriptionId,
    kind: HandlerKind,
    handler: Option<&Handler<T>>,
    arg: &T,
) -> Result<(), CallbackError> {
    let Some(handler) = handler else {
        return Ok(());
    };
    let message = match catch_unwind(AssertUnwindSafe(|| handler(arg))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => format!("{e:#}"),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    Err(CallbackError {
        subscription_id,
        handler: kind,
        message,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn snap() -> PriceSnapshot {
        PriceSnapshot::from_quotes("A", Some(rust_decimal::Decimal::ONE), None, None, 1).unwrap()
    }

    #[test]
    fn test_invoke_catches_errors_and_panics() {
        let id = SubscriptionId(7);
        let failing = Callbacks::new().on_price_update(|_| anyhow::bail!("boom"));
        let err = invoke(id, HandlerKind::PriceUpdate, failing.on_price_update.as_ref(), &snap()).unwrap_err();
        assert_eq!(err.subscription_id, id);
        assert_eq!(err.message, "boom");

        let panicking = Callbacks::new().on_price_update(|_| panic!("kaput"));
        let err = invoke(id, HandlerKind::PriceUpdate, panicking.on_price_update.as_ref(), &snap()).unwrap_err();
        assert!(err.message.contains("kaput"));

        let absent = Callbacks::new();
        assert!(invoke(id, HandlerKind::PriceUpdate, absent.on_price_update.as_ref(), &snap()).is_ok());
    }

    #[test]
    fn test_report_goes_to_on_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = Callbacks::new().on_error(move |e| sink.lock().push(e.clone()));
        callbacks.report(SubscriptionId(1), SubscriptionError::Upstream("bad asset".into()));
        assert_eq!(*seen.lock(), vec![SubscriptionError::Upstream("bad asset".into())]);

        // without on_error this only logs
        Callbacks::new().report(SubscriptionId(1), SubscriptionError::Upstream("x".into()));
    }
}
