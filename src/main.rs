use anyhow::bail;
use pairfeed::market::GammaResolver;
use pairfeed::{Callbacks, ConnectionState, Config, FanoutService, FeedConnection, Subscription};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

const USAGE: &str = "usage: pairfeed --market <condition_id|slug> | pairfeed <yes_token> <no_token> | pairfeed <token>";

/// Back-off before a manual reconnect once the feed reports it is unavailable.
const UNAVAILABLE_RETRY: Duration = Duration::from_secs(300);

enum Target {
    Market(String),
    Pair(String, String),
    Instrument(String),
}

fn parse_args(args: &[String]) -> anyhow::Result<Target> {
    match args {
        [flag, market] if flag == "--market" => Ok(Target::Market(market.clone())),
        [yes, no] => Ok(Target::Pair(yes.clone(), no.clone())),
        [token] if !token.starts_with("--") => Ok(Target::Instrument(token.clone())),
        _ => bail!(USAGE),
    }
}

fn logging_callbacks() -> Callbacks {
    Callbacks::new()
        .on_price_update(|p| {
            info!(asset_id = %p.asset_id, price = %p.price, spread = %p.spread, ts = p.timestamp, "price");
            Ok(())
        })
        .on_book_update(|b| {
            info!("{}", b);
            Ok(())
        })
        .on_last_trade(|t| {
            info!(asset_id = %t.asset_id, side = %t.side, price = %t.price, size = %t.size, "trade");
            Ok(())
        })
        .on_pair_update(|u| {
            info!(
                yes = %u.price_yes,
                no = %u.price_no,
                spread = %u.spread,
                "pair: {} / {}",
                u.yes_id,
                u.no_id
            );
            Ok(())
        })
        .on_error(|e| warn!(error = %e, "subscription error"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new("pairfeed.toml").exists() {
        Config::load(Path::new("pairfeed.toml"))?
    } else {
        let config = Config::from_env();
        config.feed.validate()?;
        config
    };

    // RUST_LOG wins; verbose bumps the configured level to debug
    let level = if config.feed.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("pairfeed v{} starting", env!("CARGO_PKG_VERSION"));
    if !Path::new("pairfeed.toml").exists() {
        info!("no pairfeed.toml found, using env-only config");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let target = parse_args(&args)?;

    let feed = FeedConnection::new(config.feed.clone())?;
    let mut states = feed.state_changes();
    let service = FanoutService::new(feed.clone());

    let subscription: Subscription = match target {
        Target::Market(market_id) => {
            let resolver = GammaResolver::new(config.markets.gamma_url.clone())?;
            service
                .subscribe_resolved(&resolver, &market_id, logging_callbacks())
                .await?
        }
        Target::Pair(yes, no) => service.subscribe_market(&yes, &no, logging_callbacks())?,
        Target::Instrument(token) => service.subscribe_instrument(&token, logging_callbacks())?,
    };
    info!(subscription = ?subscription, "subscription registered");

    if let Err(e) = service.start().await {
        warn!(error = %e, "initial connect failed, retrying in background");
    }

    info!("entering main event loop - press Ctrl+C to stop");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut retry_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down...");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                match state {
                    ConnectionState::UpstreamUnavailable => {
                        warn!(retry_in = ?UNAVAILABLE_RETRY, "upstream unavailable");
                        retry_at = Some(Instant::now() + UNAVAILABLE_RETRY);
                    }
                    ConnectionState::Closed => {
                        error!("feed closed unexpectedly");
                        break;
                    }
                    s if s.is_connected() => retry_at = None,
                    _ => {}
                }
            }
            _ = async {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                retry_at = None;
                info!("retrying upstream connection");
                if let Err(e) = feed.connect().await {
                    warn!(error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    subscription.unsubscribe().await;
    let prices = service.get_all_prices();
    info!("--- Final prices ({} assets) ---", prices.len());
    for (asset_id, p) in &prices {
        info!("{}: {} (spread {}, ts {})", asset_id, p.price, p.spread, p.timestamp);
    }
    service.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert!(matches!(parse_args(&args(&["--market", "will-it-rain"])), Ok(Target::Market(m)) if m == "will-it-rain"));
        assert!(matches!(parse_args(&args(&["Y1", "N1"])), Ok(Target::Pair(..))));
        assert!(matches!(parse_args(&args(&["Y1"])), Ok(Target::Instrument(..))));
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
    }
}
