//! The multi-DEX client core.
//!
//! [`Core`] owns one connection per configured DEX server. Each connection
//! carries a [`DexConn`]: the server's asset table, the set of tracked
//! order books, and the dispatcher its listener task feeds. Listeners are
//! single-threaded per connection, so the order two deltas hit a book is the
//! order the transport delivered them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use url::Url;

use crate::book::{BookError, OrderBook};
use crate::comms::{CommsError, DexLink, WsCfg, WsConn};
use crate::db::{ClientDb, DbError};
use crate::msg::{
    self, Asset, BookOrderNote, ConfigResult, EpochOrderNote, Message, MessageKind,
    OrderBookSnapshot, OrderBookSubscription, UnbookOrderNote, UnsubOrderBook,
};

/// Capacity of the core's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Client-core errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("link error: {0}")]
    Comms(#[from] CommsError),

    #[error("message error: {0}")]
    Msg(#[from] msg::MsgError),

    #[error("book error: {0}")]
    Book(#[from] BookError),

    #[error("invalid DEX url '{0}'")]
    InvalidDexUrl(String),

    #[error("no connection to DEX '{0}'")]
    UnknownDex(String),

    #[error("no order book found with market id '{0}'")]
    UnknownMarket(String),
}

/// Configuration for the core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// DEX URL → TLS certificate filepath, for self-signed servers.
    pub certs: HashMap<String, String>,
}

/// Events the core surfaces to the application.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A DEX connection came up and its configuration was accepted.
    DexConnected { dex: String, markets: usize },
    /// An order book finished its snapshot sync.
    BookSynced { dex: String, market_id: String },
    /// The server unsubscribed a market; its book is gone.
    BookUnsubscribed { dex: String, market_id: String },
    /// An epoch order arrived. Epoch queue semantics live with the
    /// application; the core only surfaces the note.
    EpochOrder { dex: String, note: EpochOrderNote },
}

/// One market, with symbols resolved from the asset table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Market {
    pub base_id: u32,
    pub base_symbol: String,
    pub quote_id: u32,
    pub quote_symbol: String,
}

/// The markets offered by one DEX.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub dex: String,
    pub markets: Vec<Market>,
}

/// One DEX connection: the link, the server's configuration, and the
/// registry of tracked books keyed by market id.
pub struct DexConn {
    url: String,
    link: Arc<dyn DexLink>,
    assets: HashMap<u32, Asset>,
    /// Markets whose base and quote both appear in the asset table.
    markets: Vec<(u32, u32)>,
    books: SyncRwLock<HashMap<String, Arc<OrderBook>>>,
}

impl DexConn {
    /// Build a connection from an accepted `config` response. Markets naming
    /// assets the server did not describe are logged and skipped.
    pub fn new(url: impl Into<String>, link: Arc<dyn DexLink>, cfg: ConfigResult) -> Self {
        let url = url.into();
        let assets: HashMap<u32, Asset> = cfg.assets.iter().map(|a| (a.id, a.clone())).collect();

        let mut markets = Vec::with_capacity(cfg.markets.len());
        for &(base, quote) in &cfg.markets {
            if !assets.contains_key(&base) {
                tracing::error!(
                    "{url} reported a market with base asset {base} but did not provide the asset info"
                );
                continue;
            }
            if !assets.contains_key(&quote) {
                tracing::error!(
                    "{url} reported a market with quote asset {quote} but did not provide the asset info"
                );
                continue;
            }
            markets.push((base, quote));
        }

        Self {
            url,
            link,
            assets,
            markets,
            books: SyncRwLock::new(HashMap::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The validated `(base, quote)` market list.
    pub fn markets(&self) -> &[(u32, u32)] {
        &self.markets
    }

    /// The tracked book for `market_id`, if any.
    pub fn book(&self, market_id: &str) -> Option<Arc<OrderBook>> {
        self.books.read().get(market_id).cloned()
    }

    /// Request the order book for a market. An unsynced book is registered
    /// immediately so deltas arriving before the snapshot buffer into it;
    /// the snapshot lands via the listener as an `order_book` response.
    pub async fn subscribe(&self, market_id: &str) -> Result<(), CoreError> {
        self.books
            .write()
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(OrderBook::new(market_id)));

        let payload = OrderBookSubscription {
            market_id: market_id.to_string(),
        };
        let req = Message::request(self.link.next_id(), msg::ORDER_BOOK_ROUTE, &payload)?;
        self.link.send(req).await?;
        Ok(())
    }

    /// Drop every tracked book and request fresh snapshots. Run after the
    /// transport re-establishes: the old books may have missed deltas.
    pub async fn resync_books(&self) {
        let market_ids: Vec<String> = {
            let mut books = self.books.write();
            let ids = books.keys().cloned().collect();
            books.clear();
            ids
        };
        for market_id in market_ids {
            if let Err(err) = self.subscribe(&market_id).await {
                tracing::error!("resubscribe to {market_id} on {} failed: {err}", self.url);
            }
        }
    }

    /// Drop a diverged book and request a fresh snapshot for its market.
    async fn resubscribe(&self, market_id: &str) {
        self.books.write().remove(market_id);
        if let Err(err) = self.subscribe(market_id).await {
            tracing::error!("resubscribe to {market_id} on {} failed: {err}", self.url);
        }
    }

    /// Dispatch one inbound message. Errors are returned for the listener
    /// to log; none of them end the session.
    pub async fn handle_message(
        &self,
        msg: &Message,
        events: &mpsc::Sender<CoreEvent>,
    ) -> Result<(), CoreError> {
        match msg.kind {
            MessageKind::Response => match msg.route.as_str() {
                msg::ORDER_BOOK_ROUTE => self.handle_order_book(msg, events).await,
                other => {
                    tracing::debug!("unhandled response route '{other}' from {}", self.url);
                    Ok(())
                }
            },
            MessageKind::Notification => match msg.route.as_str() {
                msg::BOOK_ORDER_ROUTE => self.handle_book_order(msg).await,
                msg::UNBOOK_ORDER_ROUTE => self.handle_unbook_order(msg).await,
                msg::EPOCH_ORDER_ROUTE => self.handle_epoch_order(msg, events),
                other => {
                    tracing::debug!("unhandled notification route '{other}' from {}", self.url);
                    Ok(())
                }
            },
            MessageKind::Request => match msg.route.as_str() {
                msg::UNSUB_ORDER_BOOK_ROUTE => self.handle_unsub_order_book(msg, events),
                msg::MATCH_ROUTE
                | msg::AUDIT_ROUTE
                | msg::REDEMPTION_ROUTE
                | msg::PREIMAGE_ROUTE
                | msg::REVOKE_MATCH_ROUTE
                | msg::SUSPENSION_ROUTE
                | msg::MATCH_PROOF_ROUTE
                | msg::MATCH_DATA_ROUTE => {
                    tracing::info!("{} message received from {}", msg.route, self.url);
                    Ok(())
                }
                other => {
                    tracing::debug!("unhandled request route '{other}' from {}", self.url);
                    Ok(())
                }
            },
        }
    }

    async fn handle_order_book(
        &self,
        msg: &Message,
        events: &mpsc::Sender<CoreEvent>,
    ) -> Result<(), CoreError> {
        let snapshot: OrderBookSnapshot = msg.parse_payload()?;

        let book = self
            .books
            .write()
            .entry(snapshot.market_id.clone())
            .or_insert_with(|| Arc::new(OrderBook::new(&snapshot.market_id)))
            .clone();

        if let Err(err) = book.apply_snapshot(&snapshot) {
            if err.is_terminal() {
                self.resubscribe(&snapshot.market_id).await;
            }
            // Otherwise the book stays registered, unsynced, and keeps
            // buffering until the next snapshot attempt.
            return Err(err.into());
        }

        emit(
            events,
            CoreEvent::BookSynced {
                dex: self.url.clone(),
                market_id: snapshot.market_id,
            },
        );
        Ok(())
    }

    async fn handle_book_order(&self, msg: &Message) -> Result<(), CoreError> {
        let note: BookOrderNote = msg.parse_payload()?;
        let book = self
            .book(&note.market_id)
            .ok_or_else(|| CoreError::UnknownMarket(note.market_id.clone()))?;

        if let Err(err) = book.book(&note) {
            if err.is_terminal() {
                self.resubscribe(&note.market_id).await;
            }
            return Err(err.into());
        }
        Ok(())
    }

    async fn handle_unbook_order(&self, msg: &Message) -> Result<(), CoreError> {
        let note: UnbookOrderNote = msg.parse_payload()?;
        let book = self
            .book(&note.market_id)
            .ok_or_else(|| CoreError::UnknownMarket(note.market_id.clone()))?;

        if let Err(err) = book.unbook(&note) {
            if err.is_terminal() {
                self.resubscribe(&note.market_id).await;
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn handle_epoch_order(
        &self,
        msg: &Message,
        events: &mpsc::Sender<CoreEvent>,
    ) -> Result<(), CoreError> {
        let note: EpochOrderNote = msg.parse_payload()?;
        emit(
            events,
            CoreEvent::EpochOrder {
                dex: self.url.clone(),
                note,
            },
        );
        Ok(())
    }

    fn handle_unsub_order_book(
        &self,
        msg: &Message,
        events: &mpsc::Sender<CoreEvent>,
    ) -> Result<(), CoreError> {
        let unsub: UnsubOrderBook = msg.parse_payload()?;
        self.books.write().remove(&unsub.market_id);
        emit(
            events,
            CoreEvent::BookUnsubscribed {
                dex: self.url.clone(),
                market_id: unsub.market_id,
            },
        );
        Ok(())
    }
}

/// Forward an event without blocking the listener; a full channel drops the
/// event with a warning.
fn emit(events: &mpsc::Sender<CoreEvent>, event: CoreEvent) {
    if let Err(mpsc::error::TrySendError::Full(dropped)) = events.try_send(event) {
        tracing::warn!("core event channel full, dropping {dropped:?}");
    }
}

/// The core client application: one [`DexConn`] per configured server.
pub struct Core {
    cfg: CoreConfig,
    db: Arc<dyn ClientDb>,
    conns: RwLock<HashMap<String, Arc<DexConn>>>,
    events_tx: mpsc::Sender<CoreEvent>,
    events_rx: SyncRwLock<Option<mpsc::Receiver<CoreEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    pub fn new(cfg: CoreConfig, db: Arc<dyn ClientDb>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            cfg,
            db,
            conns: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: SyncRwLock::new(Some(events_rx)),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<CoreEvent>> {
        self.events_rx.write().take()
    }

    /// Connect to every DEX the database knows about.
    pub async fn run(self: &Arc<Self>) {
        tracing::info!("started DEX client core");
        let urls = match self.db.list_accounts() {
            Ok(urls) => urls,
            Err(err) => {
                tracing::error!("error retrieving accounts from database: {err}");
                return;
            }
        };

        let mut handles = Vec::with_capacity(urls.len());
        for url in &urls {
            let core = Arc::clone(self);
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = core.add_dex(&url).await {
                    tracing::error!("error connecting to DEX {url}: {err}");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let connected = self.conns.read().await.len();
        if !urls.is_empty() {
            tracing::info!(
                "successfully connected to {connected} out of {} DEX servers",
                urls.len()
            );
        }
    }

    /// Connect to one DEX: dial, fetch its configuration, register the
    /// connection, and start its listener.
    pub async fn add_dex(self: &Arc<Self>, url: &str) -> Result<(), CoreError> {
        let parsed = Url::parse(url).map_err(|_| CoreError::InvalidDexUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| CoreError::InvalidDexUrl(url.to_string()))?;

        let mut ws_cfg = WsCfg::new(format!("wss://{host}/ws"));
        ws_cfg.cert_path = self.cfg.certs.get(url).cloned();
        ws_cfg.reconnect_sync = Some(self.reconnect_hook(url.to_string()));

        let link = WsConn::connect(ws_cfg, self.shutdown_rx.clone()).await?;
        self.attach(url, link).await
    }

    /// Register a connection over an established link. Split out of
    /// [`add_dex`](Self::add_dex) so alternate links can be attached.
    pub async fn attach(self: &Arc<Self>, url: &str, link: Arc<dyn DexLink>) -> Result<(), CoreError> {
        let cfg_req = Message::request(link.next_id(), msg::CONFIG_ROUTE, &serde_json::json!({}))?;
        let response = link.request(cfg_req).await?;
        let dex_cfg: ConfigResult = response.parse_payload()?;

        let source = link
            .take_message_source()
            .ok_or(CommsError::ChannelClosed)?;

        let conn = Arc::new(DexConn::new(url, link, dex_cfg));
        emit(
            &self.events_tx,
            CoreEvent::DexConnected {
                dex: url.to_string(),
                markets: conn.markets().len(),
            },
        );
        self.conns
            .write()
            .await
            .insert(url.to_string(), conn.clone());

        let events = self.events_tx.clone();
        let shutdown = self.shutdown_rx.clone();
        let listener = tokio::spawn(listen(conn, source, shutdown, events));
        self.tasks.lock().await.push(listener);
        Ok(())
    }

    /// The hook the link fires after re-establishing a lost connection:
    /// discard every book on that connection and request fresh snapshots.
    fn reconnect_hook(self: &Arc<Self>, url: String) -> Arc<dyn Fn() + Send + Sync> {
        let core = Arc::downgrade(self);
        Arc::new(move || {
            let Some(core) = core.upgrade() else { return };
            let url = url.clone();
            tokio::spawn(async move {
                tracing::info!("DEX at {url} has reconnected");
                let conn = core.conns.read().await.get(&url).cloned();
                if let Some(conn) = conn {
                    conn.resync_books().await;
                }
            });
        })
    }

    /// Known markets across every connected DEX.
    pub async fn list_markets(&self) -> Vec<MarketInfo> {
        let conns = self.conns.read().await;
        let mut infos = Vec::with_capacity(conns.len());
        for (url, conn) in conns.iter() {
            let markets = conn
                .markets()
                .iter()
                .map(|&(base, quote)| Market {
                    base_id: base,
                    base_symbol: conn.assets[&base].symbol.clone(),
                    quote_id: quote,
                    quote_symbol: conn.assets[&quote].symbol.clone(),
                })
                .collect();
            infos.push(MarketInfo {
                dex: url.clone(),
                markets,
            });
        }
        infos
    }

    /// Track the order book for one market on one DEX.
    pub async fn subscribe_market(&self, dex: &str, market_id: &str) -> Result<(), CoreError> {
        let conn = self
            .conns
            .read()
            .await
            .get(dex)
            .cloned()
            .ok_or_else(|| CoreError::UnknownDex(dex.to_string()))?;
        conn.subscribe(market_id).await
    }

    /// The tracked book for a market, if its connection exists.
    pub async fn book(&self, dex: &str, market_id: &str) -> Option<Arc<OrderBook>> {
        let conn = self.conns.read().await.get(dex).cloned()?;
        conn.book(market_id)
    }

    /// Cooperative shutdown: flag every listener and link, then wait for
    /// each task to finish its final message.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
        let conns = self.conns.read().await;
        for conn in conns.values() {
            conn.link.wait_for_shutdown().await;
        }
        tracing::info!("DEX client core off");
    }
}

/// Per-connection listener: drains the message source until shutdown or the
/// link gives up. Dispatch errors never end the session.
async fn listen(
    conn: Arc<DexConn>,
    mut source: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<CoreEvent>,
) {
    loop {
        tokio::select! {
            msg = source.recv() => {
                match msg {
                    Some(msg) => {
                        if let Err(err) = conn.handle_message(&msg, &events).await {
                            tracing::error!("error handling '{}' from {}: {err}", msg.route, conn.url());
                        }
                    }
                    None => {
                        tracing::info!("message source for {} closed", conn.url());
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
