//! Subscription fan-out over one market feed connection.
//!
//! The service keeps a registry of local subscriptions, reference-counts each
//! instrument's upstream registration, applies inbound updates to the shared
//! [`MarketCache`] and calls subscriber handlers in registration order. When
//! the connection comes back up it replays every tracked instrument.

pub mod callbacks;
pub mod pair;
pub mod registry;

use crate::cache::MarketCache;
use crate::market::MarketResolver;
use crate::orderbook::{BookSnapshot, PriceSnapshot, TradeEvent};
use crate::ws::connection::{ConnectionState, FeedConnection};
use crate::ws::protocol::{ControlMessage, FeedMessage};
use crate::ws::WsError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use callbacks::{CallbackError, Callbacks, HandlerKind, SubscriptionError};
pub use pair::{PairBinding, PairUpdate};
pub use registry::{SubscriptionId, SubscriptionState};

use callbacks::invoke;
use registry::{Registry, SubscriptionEntry};

#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("market resolution failed: {0}")]
    Resolution(String),
    #[error("fan-out service is closed")]
    ServiceClosed,
}

struct ServiceInner {
    feed: FeedConnection,
    cache: MarketCache,
    registry: Mutex<Registry>,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Fan-out service bound to one [`FeedConnection`].
#[derive(Clone)]
pub struct FanoutService {
    inner: Arc<ServiceInner>,
}

impl FanoutService {
    pub fn new(feed: FeedConnection) -> Self {
        Self::with_cache(feed, MarketCache::new())
    }

    /// Share one cache between several services (one per connection).
    ///
    /// The cache is shared wholesale: [`close`](Self::close) on any of the
    /// services clears every entry, including those the others track.
    pub fn with_cache(feed: FeedConnection, cache: MarketCache) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                feed,
                cache,
                registry: Mutex::new(Registry::default()),
                closed: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Spawn the dispatch loop (once) and connect the feed.
    ///
    /// A failed first handshake is returned, but the connection keeps
    /// retrying in the background and the dispatch loop stays up.
    pub async fn start(&self) -> Result<(), WsError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(WsError::Closed);
        }
        if let Some(mut stream) = self.inner.feed.messages() {
            let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
            let handle = tokio::spawn(async move {
                while let Some(msg) = stream.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.dispatch(msg);
                }
                debug!("dispatch loop finished");
            });
            *self.inner.dispatcher.lock() = Some(handle);
        }
        self.inner.feed.connect().await
    }

    /// Subscribe to a yes/no pair. Both ids must be non-empty and distinct.
    pub fn subscribe_market(
        &self,
        yes_id: &str,
        no_id: &str,
        callbacks: Callbacks,
    ) -> Result<Subscription, SubscribeError> {
        let yes_id = validate_id(yes_id)?;
        let no_id = validate_id(no_id)?;
        if yes_id == no_id {
            return Err(SubscribeError::InvalidArgument(format!(
                "pair needs two distinct instruments, got {yes_id} twice"
            )));
        }
        let binding = PairBinding::new(yes_id.clone(), no_id.clone());
        self.register(vec![yes_id, no_id], callbacks, Some(binding))
    }

    pub fn subscribe_instrument(
        &self,
        asset_id: &str,
        callbacks: Callbacks,
    ) -> Result<Subscription, SubscribeError> {
        let asset_id = validate_id(asset_id)?;
        self.register(vec![asset_id], callbacks, None)
    }

    /// Resolve a market's yes/no tokens and subscribe to them as a pair.
    pub async fn subscribe_resolved(
        &self,
        resolver: &dyn MarketResolver,
        market_id: &str,
        callbacks: Callbacks,
    ) -> Result<Subscription, SubscribeError> {
        let tokens = resolver
            .resolve(market_id)
            .await
            .map_err(|e| SubscribeError::Resolution(format!("{e:#}")))?;
        self.subscribe_market(&tokens.yes_token_id, &tokens.no_token_id, callbacks)
    }

    fn register(
        &self,
        instrument_ids: Vec<String>,
        callbacks: Callbacks,
        pair: Option<PairBinding>,
    ) -> Result<Subscription, SubscribeError> {
        // Registry changes and their control frames are ordered under one lock.
        let (entry, new_upstream) = {
            let mut registry = self.inner.registry.lock();
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(SubscribeError::ServiceClosed);
            }
            let (entry, newly_tracked) = registry.insert(instrument_ids, callbacks, pair);
            let new_upstream = newly_tracked.len();
            if !newly_tracked.is_empty() {
                self.inner.send_control(ControlMessage::Subscribe(newly_tracked));
            }
            (entry, new_upstream)
        };
        info!(
            subscription_id = %entry.id,
            instruments = ?entry.instrument_ids,
            new_upstream,
            "subscribed"
        );

        Ok(Subscription {
            entry,
            service: Arc::downgrade(&self.inner),
        })
    }

    /// Dispatch one message as if it came from the feed.
    pub fn handle_message(&self, msg: FeedMessage) {
        self.inner.dispatch(msg);
    }

    pub fn get_price(&self, asset_id: &str) -> Option<PriceSnapshot> {
        self.inner.cache.get_price(asset_id)
    }

    pub fn get_all_prices(&self) -> HashMap<String, PriceSnapshot> {
        self.inner.cache.get_all_prices()
    }

    pub fn get_book(&self, asset_id: &str) -> Option<BookSnapshot> {
        self.inner.cache.get_book(asset_id)
    }

    pub fn cache(&self) -> &MarketCache {
        &self.inner.cache
    }

    pub fn feed(&self) -> &FeedConnection {
        &self.inner.feed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.feed.state()
    }

    pub fn tracked_instruments(&self) -> Vec<String> {
        self.inner.registry.lock().tracked()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Number of live subscriptions covering one instrument.
    pub fn ref_count(&self, asset_id: &str) -> usize {
        self.inner.registry.lock().ref_count(asset_id)
    }

    /// Close every subscription, unsubscribe upstream, close the feed and
    /// clear the cache.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (entries, ack) = {
            let mut registry = self.inner.registry.lock();
            let (entries, tracked) = registry.drain();
            let ack = if !tracked.is_empty() && self.inner.feed.state().is_connected() {
                self.inner.feed.queue_flushed(ControlMessage::Unsubscribe(tracked)).ok()
            } else {
                None
            };
            (entries, ack)
        };
        for entry in &entries {
            entry.mark_closed();
        }
        if let Some(ack) = ack {
            if let Err(e) = ack.wait().await {
                debug!(error = %e, "final unsubscribe not delivered");
            }
        }

        self.inner.feed.close().await;
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        self.inner.cache.clear();
        info!(subscriptions = entries.len(), "fan-out service closed");
    }
}

fn validate_id(asset_id: &str) -> Result<String, SubscribeError> {
    let trimmed = asset_id.trim();
    if trimmed.is_empty() {
        return Err(SubscribeError::InvalidArgument(
            "instrument id must be non-empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

impl ServiceInner {
    fn send_control(&self, control: ControlMessage) {
        if let Err(e) = self.feed.send(control) {
            debug!(error = %e, "control frame not queued");
        }
    }

    fn dispatch(&self, msg: FeedMessage) {
        match msg {
            FeedMessage::PriceChange(snapshot) => self.dispatch_price(&snapshot),
            FeedMessage::BookChange(snapshot) => self.dispatch_book(&snapshot),
            FeedMessage::LastTrade(trade) => self.dispatch_trade(&trade),
            FeedMessage::Error { asset_id, message } => self.dispatch_upstream_error(asset_id, message),
            FeedMessage::ConnectionStateChange(state) => self.on_connection_state(state),
        }
    }

    fn dispatch_price(&self, snapshot: &PriceSnapshot) {
        let subscribers = {
            let registry = self.registry.lock();
            if !registry.is_tracked(&snapshot.asset_id) {
                return;
            }
            if !self.cache.apply_price(snapshot).is_applied() {
                return;
            }
            registry.subscribers_of(&snapshot.asset_id)
        };

        for sub in &subscribers {
            if !sub.is_active() {
                continue;
            }
            let res = invoke(
                sub.id,
                HandlerKind::PriceUpdate,
                sub.callbacks.on_price_update.as_ref(),
                snapshot,
            );
            report_failure(sub, res);
        }

        for sub in &subscribers {
            if !sub.is_active() {
                continue;
            }
            let Some(tracker) = &sub.pair else {
                continue;
            };
            let update = tracker.lock().observe(&snapshot.asset_id, snapshot.price);
            if let Some(update) = update {
                debug!(
                    subscription_id = %sub.id,
                    yes = %update.price_yes,
                    no = %update.price_no,
                    spread = %update.spread,
                    "pair update"
                );
                let res = invoke(
                    sub.id,
                    HandlerKind::PairUpdate,
                    sub.callbacks.on_pair_update.as_ref(),
                    &update,
                );
                report_failure(sub, res);
            }
        }
    }

    fn dispatch_book(&self, snapshot: &BookSnapshot) {
        let subscribers = {
            let registry = self.registry.lock();
            if !registry.is_tracked(&snapshot.asset_id) {
                return;
            }
            if !self.cache.apply_book(snapshot).is_applied() {
                return;
            }
            registry.subscribers_of(&snapshot.asset_id)
        };

        for sub in subscribers.iter().filter(|s| s.is_active()) {
            let res = invoke(
                sub.id,
                HandlerKind::BookUpdate,
                sub.callbacks.on_book_update.as_ref(),
                snapshot,
            );
            report_failure(sub, res);
        }
    }

    fn dispatch_trade(&self, trade: &TradeEvent) {
        let subscribers = self.registry.lock().subscribers_of(&trade.asset_id);
        for sub in subscribers.iter().filter(|s| s.is_active()) {
            let res = invoke(
                sub.id,
                HandlerKind::LastTrade,
                sub.callbacks.on_last_trade.as_ref(),
                trade,
            );
            report_failure(sub, res);
        }
    }

    fn dispatch_upstream_error(&self, asset_id: Option<String>, message: String) {
        warn!(asset_id = ?asset_id, error = %message, "upstream error frame");
        let Some(asset_id) = asset_id else {
            return;
        };
        let subscribers = self.registry.lock().subscribers_of(&asset_id);
        for sub in subscribers.iter().filter(|s| s.is_active()) {
            sub.callbacks
                .report(sub.id, SubscriptionError::Upstream(message.clone()));
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected | ConnectionState::Reconnected => {
                // subscribes already on the socket are dropped there, so replaying is safe
                let registry = self.registry.lock();
                let tracked = registry.tracked();
                info!(state = ?state, instruments = tracked.len(), "feed up, replaying subscriptions");
                if !tracked.is_empty() {
                    self.send_control(ControlMessage::Subscribe(tracked));
                }
            }
            ConnectionState::UpstreamUnavailable => {
                warn!("feed unavailable, cache will go stale until connect() is called again");
            }
            ConnectionState::Closed => {
                info!("feed closed, no more updates");
            }
            other => debug!(state = ?other, "feed state change"),
        }
    }

    async fn release(&self, entry: &SubscriptionEntry) {
        let ack = {
            let mut registry = self.registry.lock();
            let untracked = registry.remove(entry.id);
            if untracked.is_empty() {
                None
            } else {
                Some(self.feed.queue_flushed(ControlMessage::Unsubscribe(untracked)))
            }
        };
        // untracked instruments are not replayed on reconnect, so a lost frame needs no undo
        match ack {
            Some(Ok(ack)) => {
                if let Err(e) = ack.wait().await {
                    debug!(error = %e, "unsubscribe frame not delivered");
                }
            }
            Some(Err(e)) => debug!(error = %e, "unsubscribe frame not queued"),
            None => {}
        }
        entry.mark_closed();
        info!(subscription_id = %entry.id, "unsubscribed");
    }
}

fn report_failure(sub: &SubscriptionEntry, res: Result<(), CallbackError>) {
    if let Err(e) = res {
        sub.callbacks.report(sub.id, SubscriptionError::Callback(e));
    }
}

/// Caller-owned handle for one registration. Dropping it does not
/// unsubscribe; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    entry: Arc<SubscriptionEntry>,
    service: Weak<ServiceInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.entry.id
    }

    pub fn instrument_ids(&self) -> &[String] {
        &self.entry.instrument_ids
    }

    pub fn pair(&self) -> Option<PairBinding> {
        self.entry.binding()
    }

    pub fn state(&self) -> SubscriptionState {
        self.entry.state()
    }

    /// Stop dispatch to this subscription. Sends an upstream unsubscribe for
    /// any instrument whose reference count drops to zero. Repeat calls are no-ops.
    pub async fn unsubscribe(&self) {
        if !self.entry.begin_unsubscribe() {
            return;
        }
        match self.service.upgrade() {
            Some(service) => service.release(&self.entry).await,
            None => self.entry.mark_closed(),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("instrument_ids", &self.entry.instrument_ids)
            .field("state", &self.entry.state())
            .finish()
    }
}
