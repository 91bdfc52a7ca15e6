//! OANDA broker session over the v1 REST and streaming API.
//!
//! Candle responses are handed to the pipeline as the raw HTTP body
//! (`reqwest::blocking::Response` implements `Read`), so rows are decoded
//! while the body is still arriving. Metadata calls (accounts, symbols,
//! prices) are small and decoded as whole JSON documents.
//!
//! No retries happen here; a failed call surfaces as a `SessionError`.

use super::planner::ChunkRequest;
use super::session::{
    Account, BrokerSession, CandleStream, Price, SessionError, SymbolInfo, Tick, TickSubscription,
};
use crate::config::{BrokerConfig, Environment};
use crate::domain::FeedVariant;
use chrono::SecondsFormat;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `dateFormat=unix` candle times are microseconds since the epoch.
const MICROS_PER_SECOND: u32 = 1_000_000;

#[derive(Debug, Deserialize)]
struct AccountsEnvelope {
    accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsEnvelope {
    instruments: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct PricesEnvelope {
    prices: Vec<Price>,
}

/// One line of the price stream: either a tick or a heartbeat.
#[derive(Debug, Deserialize)]
struct StreamLine {
    tick: Option<Tick>,
    heartbeat: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// A live tick stream and its stop flag.
#[derive(Debug)]
struct ActiveSubscription {
    id: usize,
    symbols: Vec<String>,
    stop: Arc<AtomicBool>,
}

/// OANDA session.
pub struct OandaSession {
    client: Client,
    /// Streaming requests stay open indefinitely, so this client has no timeout.
    stream_client: Client,
    config: BrokerConfig,
    subscriptions: Mutex<Vec<ActiveSubscription>>,
    next_subscription: AtomicUsize,
    closed: AtomicBool,
}

impl OandaSession {
    pub fn new(config: BrokerConfig) -> Result<Self, SessionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SessionError::Other(format!("failed to build HTTP client: {e}")))?;
        let stream_client = Client::builder()
            .timeout(None)
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SessionError::Other(format!("failed to build HTTP client: {e}")))?;

        info!(environment = %config.environment, api = config.api_base(), "oanda_session_created");

        Ok(Self {
            client,
            stream_client,
            config,
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of tick streams still running.
    pub fn active_subscriptions(&self) -> usize {
        self.lock_subscriptions().len()
    }

    fn url(&self, base: &str, path: &str, params: &[(&str, &str)]) -> Result<Url, SessionError> {
        let raw = format!("{base}{path}");
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|e| SessionError::Other(format!("invalid broker URL '{raw}': {e}")))
    }

    fn candles_url(&self, chunk: &ChunkRequest, feed: FeedVariant) -> Result<Url, SessionError> {
        let start = chunk.from.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = chunk.until.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.url(
            self.config.api_base(),
            "/v1/candles",
            &[
                ("instrument", chunk.symbol.as_str()),
                ("granularity", chunk.granularity.code()),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("candleFormat", feed.candle_format()),
                // Numeric timestamps; RFC 3339 text would not survive digit extraction.
                ("dateFormat", "unix"),
            ],
        )
    }

    fn accounts_url(&self) -> Result<Url, SessionError> {
        match (&self.config.environment, &self.config.username) {
            (Environment::Sandbox, Some(username)) => self.url(
                self.config.api_base(),
                "/v1/accounts",
                &[("username", username.as_str())],
            ),
            _ => self.url(self.config.api_base(), "/v1/accounts", &[]),
        }
    }

    fn instruments_url(&self) -> Result<Url, SessionError> {
        self.url(
            self.config.api_base(),
            "/v1/instruments",
            &[("accountId", self.config.account_id.as_str())],
        )
    }

    fn prices_url(&self, symbols: &[String]) -> Result<Url, SessionError> {
        self.url(
            self.config.api_base(),
            "/v1/prices",
            &[("instruments", symbols.join(",").as_str())],
        )
    }

    fn price_stream_url(&self, symbols: &[String]) -> Result<Url, SessionError> {
        self.url(
            self.config.stream_base(),
            "/v1/prices",
            &[
                ("accountId", self.config.account_id.as_str()),
                ("instruments", symbols.join(",").as_str()),
            ],
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.config.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.config.token)
        }
    }

    /// Send a GET and map transport and status failures.
    fn get(&self, client: &Client, url: Url, symbol: Option<&str>) -> Result<Response, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        debug!(url = %url.path(), "oanda_request");

        let resp = self
            .authorize(client.get(url))
            .send()
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    SessionError::NetworkUnreachable(e.to_string())
                } else {
                    SessionError::Other(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(status_error(status, &body, symbol))
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, SessionError> {
        let body = self
            .get(&self.client, url, None)?
            .text()
            .map_err(|e| SessionError::NetworkUnreachable(e.to_string()))?;
        decode(&body, what)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<ActiveSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerSession for OandaSession {
    fn name(&self) -> &str {
        "oanda"
    }

    fn open_candle_stream(
        &self,
        chunk: &ChunkRequest,
        feed: FeedVariant,
    ) -> Result<CandleStream, SessionError> {
        let url = self.candles_url(chunk, feed)?;
        let resp = self.get(&self.client, url, Some(&chunk.symbol))?;
        Ok(Box::new(resp))
    }

    fn candle_time_divisor(&self) -> u32 {
        MICROS_PER_SECOND
    }

    fn accounts(&self) -> Result<Vec<Account>, SessionError> {
        let envelope: AccountsEnvelope = self.get_json(self.accounts_url()?, "accounts")?;
        Ok(envelope.accounts)
    }

    fn symbols(&self) -> Result<Vec<SymbolInfo>, SessionError> {
        let envelope: InstrumentsEnvelope = self.get_json(self.instruments_url()?, "instruments")?;
        Ok(envelope.instruments)
    }

    fn current_prices(&self, symbols: &[String]) -> Result<Vec<Price>, SessionError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let envelope: PricesEnvelope = self.get_json(self.prices_url(symbols)?, "prices")?;
        Ok(envelope.prices)
    }

    fn subscribe_ticks(&self, symbols: &[String]) -> Result<TickSubscription, SessionError> {
        let url = self.price_stream_url(symbols)?;
        let resp = self.get(&self.stream_client, url, None)?;

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let thread_stop = Arc::clone(&stop);
        thread::Builder::new()
            .name(format!("candlefetch-ticks-{id}"))
            .spawn(move || {
                for line in BufReader::new(resp).lines() {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(subscription = id, error = %e, "tick_stream_failed");
                            break;
                        }
                    };
                    match parse_stream_line(&line) {
                        Ok(Some(tick)) => {
                            if tx.send(tick).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!(subscription = id, error = %e, "tick_line_skipped"),
                    }
                }
                debug!(subscription = id, "tick_stream_ended");
            })
            .map_err(|e| SessionError::Other(format!("failed to spawn tick stream: {e}")))?;

        self.lock_subscriptions().push(ActiveSubscription {
            id,
            symbols: symbols.to_vec(),
            stop,
        });
        info!(subscription = id, symbols = %symbols.join(","), "tick_subscription_started");

        Ok(TickSubscription::new(symbols.to_vec(), rx))
    }

    fn unsubscribe_ticks(&self, symbols: &[String]) -> Result<(), SessionError> {
        let mut subscriptions = self.lock_subscriptions();
        subscriptions.retain(|sub| {
            let matches = sub.symbols.iter().any(|s| symbols.contains(s));
            if matches {
                sub.stop.store(true, Ordering::SeqCst);
                info!(subscription = sub.id, "tick_subscription_stopped");
            }
            !matches
        });
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for sub in self.lock_subscriptions().drain(..) {
            sub.stop.store(true, Ordering::SeqCst);
        }
        info!("oanda_session_closed");
    }
}

impl Drop for OandaSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn status_error(status: StatusCode, body: &str, symbol: Option<&str>) -> SessionError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.chars().take(200).collect());

    match (status, symbol) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            SessionError::AuthenticationRequired(message)
        }
        (StatusCode::NOT_FOUND, Some(symbol)) => SessionError::SymbolNotFound {
            symbol: symbol.to_string(),
        },
        _ => SessionError::Http {
            status: status.as_u16(),
            message,
        },
    }
}

fn decode<T: DeserializeOwned>(body: &str, what: &str) -> Result<T, SessionError> {
    serde_json::from_str(body)
        .map_err(|e| SessionError::ResponseFormatChanged(format!("failed to parse {what}: {e}")))
}

/// `Ok(None)` for heartbeats and blank keep-alive lines.
fn parse_stream_line(line: &str) -> Result<Option<Tick>, SessionError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: StreamLine = decode(line, "price stream line")?;
    match (parsed.tick, parsed.heartbeat) {
        (Some(tick), _) => Ok(Some(tick)),
        (None, Some(_)) => Ok(None),
        (None, None) => Err(SessionError::ResponseFormatChanged(format!(
            "unrecognised price stream line: {line}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RecordStreamParser, RowLayout};
    use crate::domain::{CandleRow, Granularity};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn session(environment: Environment) -> OandaSession {
        OandaSession::new(BrokerConfig {
            environment,
            token: "token".into(),
            account_id: "1234".into(),
            username: Some("sandboxuser".into()),
            ..BrokerConfig::default()
        })
        .unwrap()
    }

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn candles_url_carries_chunk_window() {
        let s = session(Environment::Practice);
        let chunk = ChunkRequest {
            index: 0,
            symbol: "EUR_USD".into(),
            granularity: Granularity::M5,
            from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            until: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            row_count_estimate: 288,
        };
        let url = s.candles_url(&chunk, FeedVariant::BidAsk).unwrap();

        assert_eq!(url.host_str(), Some("api-fxpractice.oanda.com"));
        assert_eq!(url.path(), "/v1/candles");
        let q = query(&url);
        assert_eq!(q["instrument"], "EUR_USD");
        assert_eq!(q["granularity"], "M5");
        assert_eq!(q["start"], "2024-01-01T00:00:00Z");
        assert_eq!(q["end"], "2024-01-02T00:00:00Z");
        assert_eq!(q["candleFormat"], "bidask");
        assert_eq!(q["dateFormat"], "unix");
    }

    #[test]
    fn sandbox_accounts_url_includes_username() {
        let url = session(Environment::Sandbox).accounts_url().unwrap();
        assert_eq!(query(&url)["username"], "sandboxuser");

        let url = session(Environment::Live).accounts_url().unwrap();
        assert!(url.query().is_none());
        assert!(!url.as_str().contains('?'));
    }

    #[test]
    fn price_urls_join_instruments() {
        let s = session(Environment::Practice);
        let symbols = vec!["EUR_USD".to_string(), "NZD_AUD".to_string()];

        let url = s.prices_url(&symbols).unwrap();
        assert_eq!(query(&url)["instruments"], "EUR_USD,NZD_AUD");

        let url = s.price_stream_url(&symbols).unwrap();
        assert_eq!(url.host_str(), Some("stream-fxpractice.oanda.com"));
        assert_eq!(query(&url)["accountId"], "1234");
    }

    #[test]
    fn unix_candle_times_decode_to_seconds() {
        let s = session(Environment::Practice);
        let layout = RowLayout::new(FeedVariant::Bid).with_time_divisor(s.candle_time_divisor());
        let body = br#"{"instrument":"EUR_USD","granularity":"M1","candles":[{"time":"1704067200000000","openMid":1.1,"highMid":1.3,"lowMid":1.0,"closeMid":1.2,"volume":10,"complete":true}]}"#;

        let mut parser = RecordStreamParser::new(layout);
        let mut rows: Vec<CandleRow> = Vec::new();
        if let Some(buf) = parser.push(body) {
            rows.extend(buf.rows());
        }
        if let Some(buf) = parser.finish() {
            rows.extend(buf.rows());
        }

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, 1_704_067_200.0);
        assert_eq!(rows[0].volume, 10.0);
    }

    #[test]
    fn instruments_envelope_renames_instrument_to_name() {
        let body = r#"{"instruments":[{"instrument":"BCO_USD","displayName":"Brent Crude Oil","pip":"0.01","maxTradeUnits":10000}]}"#;
        let envelope: InstrumentsEnvelope = decode(body, "instruments").unwrap();
        assert_eq!(envelope.instruments[0].name, "BCO_USD");
    }

    #[test]
    fn prices_envelope_decodes() {
        let body = r#"{"prices":[{"instrument":"EUR_USD","time":"1420070400000000","bid":1.1,"ask":1.2}]}"#;
        let envelope: PricesEnvelope = decode(body, "prices").unwrap();
        assert_eq!(envelope.prices.len(), 1);
        assert_eq!(envelope.prices[0].ask, 1.2);
    }

    #[test]
    fn malformed_body_is_a_format_change() {
        let err = decode::<AccountsEnvelope>(r#"{"accts":[]}"#, "accounts").unwrap_err();
        assert!(matches!(err, SessionError::ResponseFormatChanged(_)));
    }

    #[test]
    fn stream_lines_yield_ticks_and_skip_heartbeats() {
        let tick = r#"{"tick":{"instrument":"EUR_USD","time":"1","bid":1.1,"ask":1.2}}"#;
        assert_eq!(parse_stream_line(tick).unwrap().map(|t| t.instrument), Some("EUR_USD".into()));
        assert!(parse_stream_line(r#"{"heartbeat":{"time":"2"}}"#).unwrap().is_none());
        assert!(parse_stream_line("  ").unwrap().is_none());
        assert!(parse_stream_line(r#"{"disconnect":{}}"#).is_err());
    }

    #[test]
    fn status_codes_map_to_session_errors() {
        let err = status_error(StatusCode::UNAUTHORIZED, r#"{"code":4,"message":"bad token"}"#, None);
        assert!(matches!(err, SessionError::AuthenticationRequired(ref m) if m == "bad token"));

        let err = status_error(StatusCode::NOT_FOUND, "", Some("XXX_YYY"));
        assert!(matches!(err, SessionError::SymbolNotFound { ref symbol } if symbol == "XXX_YYY"));

        let err = status_error(StatusCode::BAD_REQUEST, "nope", Some("EUR_USD"));
        assert!(matches!(err, SessionError::Http { status: 400, .. }));
    }

    #[test]
    fn closed_session_refuses_calls() {
        let s = session(Environment::Practice);
        s.close();
        assert!(s.is_closed());
        assert!(matches!(s.accounts(), Err(SessionError::Closed)));
        assert!(!s.test_connection());
    }
}
