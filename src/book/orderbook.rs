//! The replicated per-market order book.
//!
//! Lifecycle: the registry creates a book when it subscribes to a market, so
//! delta notes can arrive (and buffer) before the snapshot does. Applying the
//! snapshot drains the buffer in arrival order, then the book serves queries
//! and applies live deltas under a gapless sequence rule. Any divergence
//! poisons the instance; the owner discards it and resubscribes.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use super::{BookError, Fill, Order, OrderId, Side, SideBook};
use crate::msg::{BookOrderNote, OrderBookSnapshot, UnbookOrderNote};

/// Default capacity of the pre-sync note buffer.
const NOTE_QUEUE_CAPACITY: usize = 10;

/// A note buffered while the book awaits its snapshot.
#[derive(Debug, Clone)]
enum CachedNote {
    Book(BookOrderNote),
    Unbook(UnbookOrderNote),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    /// Waiting for the snapshot; notes buffer.
    Unsynced,
    /// Serving queries and applying deltas in order.
    Synced,
    /// Diverged from the server; every call fails until discarded.
    Poisoned,
}

struct BookState {
    state: SyncState,
    seq: u64,
    orders: HashMap<OrderId, Order>,
    buys: SideBook,
    sells: SideBook,
    pending: VecDeque<CachedNote>,
}

/// A client-tracked order book for one market on one DEX.
///
/// All mutators and queries go through a single reader-writer lock; the
/// sequence counter only moves under the write guard, together with the book
/// mutation it accounts for.
pub struct OrderBook {
    market_id: String,
    inner: RwLock<BookState>,
}

impl OrderBook {
    /// Create an unsynced book for `market_id`.
    pub fn new(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            inner: RwLock::new(BookState {
                state: SyncState::Unsynced,
                seq: 0,
                orders: HashMap::new(),
                buys: SideBook::descending(),
                sells: SideBook::ascending(),
                pending: VecDeque::with_capacity(NOTE_QUEUE_CAPACITY),
            }),
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn is_synced(&self) -> bool {
        self.inner.read().state == SyncState::Synced
    }

    /// The sequence number of the last applied snapshot or delta.
    pub fn seq(&self) -> u64 {
        self.inner.read().seq
    }

    /// Number of resting orders currently tracked.
    pub fn order_count(&self) -> usize {
        self.inner.read().orders.len()
    }

    /// Instantiate the book from a server snapshot, then drain any notes
    /// that arrived before it.
    ///
    /// A malformed snapshot leaves the book unsynced with its buffer intact;
    /// a failure while draining poisons the book.
    pub fn apply_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<(), BookError> {
        let mut st = self.inner.write();
        match st.state {
            SyncState::Synced => return Err(BookError::AlreadySynced),
            SyncState::Poisoned => return Err(BookError::Poisoned),
            SyncState::Unsynced => {}
        }
        if snapshot.market_id != self.market_id {
            st.state = SyncState::Poisoned;
            return Err(BookError::WrongMarket {
                expected: self.market_id.clone(),
                got: snapshot.market_id.clone(),
            });
        }

        // Fold into fresh collections first so a malformed snapshot leaves
        // the previous (empty) state and the note buffer untouched.
        let mut orders = HashMap::with_capacity(snapshot.orders.len());
        let mut buys = SideBook::descending();
        let mut sells = SideBook::ascending();
        for o in &snapshot.orders {
            let order_id = OrderId::from_slice(&o.order_id).ok_or_else(|| {
                BookError::MalformedSnapshot(format!(
                    "order id length is not {}: got {}",
                    OrderId::LEN,
                    o.order_id.len()
                ))
            })?;
            let side = Side::from_wire(o.side)
                .ok_or_else(|| BookError::MalformedSnapshot(format!("unknown order side {}", o.side)))?;
            let order = Order {
                order_id,
                side,
                quantity: o.quantity,
                rate: o.rate,
                time: o.time,
            };
            if orders.insert(order_id, order.clone()).is_some() {
                return Err(BookError::MalformedSnapshot(format!(
                    "duplicate order id {order_id}"
                )));
            }
            match side {
                Side::Buy => buys.add(order),
                Side::Sell => sells.add(order),
            }
        }

        st.seq = snapshot.seq;
        st.orders = orders;
        st.buys = buys;
        st.sells = sells;

        while let Some(note) = st.pending.pop_front() {
            let applied = match note {
                CachedNote::Book(n) => Self::book_note(&mut st, &self.market_id, &n),
                CachedNote::Unbook(n) => Self::unbook_note(&mut st, &self.market_id, &n),
            };
            if let Err(err) = applied {
                st.state = SyncState::Poisoned;
                return Err(err);
            }
        }

        st.state = SyncState::Synced;
        Ok(())
    }

    /// Apply (or buffer) a `book_order` delta.
    pub fn book(&self, note: &BookOrderNote) -> Result<(), BookError> {
        let mut st = self.inner.write();
        match st.state {
            SyncState::Poisoned => Err(BookError::Poisoned),
            SyncState::Unsynced => {
                if note.market_id != self.market_id {
                    st.state = SyncState::Poisoned;
                    return Err(BookError::WrongMarket {
                        expected: self.market_id.clone(),
                        got: note.market_id.clone(),
                    });
                }
                st.pending.push_back(CachedNote::Book(note.clone()));
                Ok(())
            }
            SyncState::Synced => {
                let res = Self::book_note(&mut st, &self.market_id, note);
                if let Err(ref err) = res {
                    if err.is_terminal() {
                        st.state = SyncState::Poisoned;
                    }
                }
                res
            }
        }
    }

    /// Apply (or buffer) an `unbook_order` delta.
    pub fn unbook(&self, note: &UnbookOrderNote) -> Result<(), BookError> {
        let mut st = self.inner.write();
        match st.state {
            SyncState::Poisoned => Err(BookError::Poisoned),
            SyncState::Unsynced => {
                if note.market_id != self.market_id {
                    st.state = SyncState::Poisoned;
                    return Err(BookError::WrongMarket {
                        expected: self.market_id.clone(),
                        got: note.market_id.clone(),
                    });
                }
                st.pending.push_back(CachedNote::Unbook(note.clone()));
                Ok(())
            }
            SyncState::Synced => {
                let res = Self::unbook_note(&mut st, &self.market_id, note);
                if let Err(ref err) = res {
                    if err.is_terminal() {
                        st.state = SyncState::Poisoned;
                    }
                }
                res
            }
        }
    }

    /// Up to `n` best orders from `side`. Requires a synced book.
    pub fn best_n(&self, side: Side, n: usize) -> Result<Vec<Order>, BookError> {
        let st = self.inner.read();
        Self::check_query_state(&st)?;
        Ok(match side {
            Side::Buy => st.buys.best_n(n),
            Side::Sell => st.sells.best_n(n),
        })
    }

    /// Projected best-first fills for `qty` from `side`. Requires a synced
    /// book; never mutates it.
    pub fn best_fill(&self, side: Side, qty: u64) -> Result<Vec<Fill>, BookError> {
        let st = self.inner.read();
        Self::check_query_state(&st)?;
        Ok(match side {
            Side::Buy => st.buys.best_fill(qty),
            Side::Sell => st.sells.best_fill(qty),
        })
    }

    fn check_query_state(st: &BookState) -> Result<(), BookError> {
        match st.state {
            SyncState::Synced => Ok(()),
            SyncState::Poisoned => Err(BookError::Poisoned),
            SyncState::Unsynced => Err(BookError::Unsynced),
        }
    }

    /// The workhorse behind [`book`](Self::book): applies a delta to a book
    /// that holds its snapshot, live or from the drain.
    fn book_note(st: &mut BookState, market_id: &str, note: &BookOrderNote) -> Result<(), BookError> {
        if note.market_id != market_id {
            return Err(BookError::WrongMarket {
                expected: market_id.to_string(),
                got: note.market_id.clone(),
            });
        }
        // The book is synced past this note: a replay, discard.
        if note.seq <= st.seq {
            return Ok(());
        }
        let order_id = OrderId::from_slice(&note.order_id)
            .ok_or(BookError::InvalidOrderId(note.order_id.len()))?;
        let side = Side::from_wire(note.side).ok_or(BookError::InvalidSide(note.side))?;
        if note.seq != st.seq + 1 {
            return Err(BookError::OutOfSync {
                next: st.seq + 1,
                got: note.seq,
            });
        }
        st.seq = note.seq;

        let order = Order {
            order_id,
            side,
            quantity: note.quantity,
            rate: note.rate,
            time: 0,
        };
        st.orders.insert(order_id, order.clone());
        match side {
            Side::Buy => st.buys.add(order),
            Side::Sell => st.sells.add(order),
        }
        Ok(())
    }

    /// The workhorse behind [`unbook`](Self::unbook). The removal is routed
    /// by the stored order's side, not anything in the note.
    fn unbook_note(
        st: &mut BookState,
        market_id: &str,
        note: &UnbookOrderNote,
    ) -> Result<(), BookError> {
        if note.market_id != market_id {
            return Err(BookError::WrongMarket {
                expected: market_id.to_string(),
                got: note.market_id.clone(),
            });
        }
        if note.seq <= st.seq {
            return Ok(());
        }
        let order_id = OrderId::from_slice(&note.order_id)
            .ok_or(BookError::InvalidOrderId(note.order_id.len()))?;
        if note.seq != st.seq + 1 {
            return Err(BookError::OutOfSync {
                next: st.seq + 1,
                got: note.seq,
            });
        }
        let order = st
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(BookError::NotFound(order_id))?;
        st.seq = note.seq;

        match order.side {
            Side::Buy => st.buys.remove(order.rate, &order_id)?,
            Side::Sell => st.sells.remove(order.rate, &order_id)?,
        };
        st.orders.remove(&order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKET: &str = "dcr_btc";

    fn oid(tag: u8) -> Vec<u8> {
        vec![tag; 32]
    }

    fn snapshot(seq: u64, orders: Vec<crate::msg::SnapshotOrder>) -> OrderBookSnapshot {
        OrderBookSnapshot {
            seq,
            market_id: MARKET.into(),
            orders,
        }
    }

    fn snap_order(tag: u8, side: u8, quantity: u64, rate: u64, time: u64) -> crate::msg::SnapshotOrder {
        crate::msg::SnapshotOrder {
            order_id: oid(tag),
            side,
            quantity,
            rate,
            time,
        }
    }

    fn book_note(seq: u64, tag: u8, side: u8, quantity: u64, rate: u64) -> BookOrderNote {
        BookOrderNote {
            seq,
            market_id: MARKET.into(),
            order_id: oid(tag),
            side,
            quantity,
            rate,
        }
    }

    fn unbook_note(seq: u64, tag: u8) -> UnbookOrderNote {
        UnbookOrderNote {
            seq,
            market_id: MARKET.into(),
            order_id: oid(tag),
        }
    }

    fn synced_book(seq: u64) -> OrderBook {
        let ob = OrderBook::new(MARKET);
        ob.apply_snapshot(&snapshot(
            seq,
            vec![
                snap_order(1, 1, 5, 100, 1_000),
                snap_order(2, 2, 3, 105, 1_001),
            ],
        ))
        .unwrap();
        ob
    }

    #[test]
    fn test_snapshot_builds_sides() {
        let ob = synced_book(42);
        assert!(ob.is_synced());
        assert_eq!(ob.seq(), 42);
        assert_eq!(ob.order_count(), 2);

        let buys = ob.best_n(Side::Buy, 5).unwrap();
        assert_eq!(buys.len(), 1);
        assert_eq!(buys[0].rate, 100);
        let sells = ob.best_n(Side::Sell, 5).unwrap();
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].rate, 105);
    }

    #[test]
    fn test_second_snapshot_rejected() {
        let ob = synced_book(42);
        assert!(matches!(
            ob.apply_snapshot(&snapshot(43, vec![])),
            Err(BookError::AlreadySynced)
        ));
    }

    #[test]
    fn test_malformed_snapshot_leaves_unsynced() {
        let ob = OrderBook::new(MARKET);
        // Buffer a note first; it must survive the failed snapshot.
        ob.book(&book_note(44, 7, 1, 1, 99)).unwrap();

        let bad = snapshot(
            43,
            vec![crate::msg::SnapshotOrder {
                order_id: vec![1; 31],
                side: 1,
                quantity: 1,
                rate: 1,
                time: 0,
            }],
        );
        assert!(matches!(
            ob.apply_snapshot(&bad),
            Err(BookError::MalformedSnapshot(_))
        ));
        assert!(!ob.is_synced());

        // A good snapshot still works and drains the buffered note.
        ob.apply_snapshot(&snapshot(43, vec![])).unwrap();
        assert!(ob.is_synced());
        assert_eq!(ob.seq(), 44);
        assert_eq!(ob.order_count(), 1);
    }

    #[test]
    fn test_snapshot_bad_side() {
        let ob = OrderBook::new(MARKET);
        let bad = snapshot(1, vec![snap_order(1, 3, 1, 1, 0)]);
        assert!(matches!(
            ob.apply_snapshot(&bad),
            Err(BookError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn test_stale_delta_discarded() {
        let ob = synced_book(42);
        ob.book(&book_note(42, 9, 1, 2, 101)).unwrap();
        assert_eq!(ob.seq(), 42);
        assert_eq!(ob.order_count(), 2);
    }

    #[test]
    fn test_gap_poisons() {
        let ob = synced_book(42);
        assert!(matches!(
            ob.book(&book_note(44, 9, 1, 2, 101)),
            Err(BookError::OutOfSync { next: 43, got: 44 })
        ));
        assert!(matches!(
            ob.book(&book_note(43, 9, 1, 2, 101)),
            Err(BookError::Poisoned)
        ));
        assert!(matches!(ob.best_n(Side::Buy, 1), Err(BookError::Poisoned)));
    }

    #[test]
    fn test_in_order_book_and_unbook() {
        let ob = synced_book(42);
        ob.book(&book_note(43, 9, 1, 2, 101)).unwrap();
        assert_eq!(ob.seq(), 43);
        assert_eq!(ob.best_n(Side::Buy, 1).unwrap()[0].rate, 101);

        ob.unbook(&unbook_note(44, 9)).unwrap();
        assert_eq!(ob.seq(), 44);
        assert_eq!(ob.order_count(), 2);
        // Gone from both the side and the id map.
        assert!(ob.best_n(Side::Buy, 5).unwrap().iter().all(|o| o.rate != 101));
    }

    #[test]
    fn test_unbook_routed_by_stored_side() {
        let ob = synced_book(42);
        // Order 2 rests on the sell side; the note carries no side at all.
        ob.unbook(&unbook_note(43, 2)).unwrap();
        assert!(ob.best_n(Side::Sell, 5).unwrap().is_empty());
        assert_eq!(ob.best_n(Side::Buy, 5).unwrap().len(), 1);
    }

    #[test]
    fn test_unbook_unknown_id_poisons() {
        let ob = synced_book(42);
        assert!(matches!(
            ob.unbook(&unbook_note(43, 77)),
            Err(BookError::NotFound(_))
        ));
        assert!(matches!(
            ob.book(&book_note(43, 9, 1, 2, 101)),
            Err(BookError::Poisoned)
        ));
    }

    #[test]
    fn test_wrong_market_poisons() {
        let ob = synced_book(42);
        let mut note = book_note(43, 9, 1, 2, 101);
        note.market_id = "ltc_btc".into();
        assert!(matches!(
            ob.book(&note),
            Err(BookError::WrongMarket { .. })
        ));
        assert_eq!(ob.seq(), 42);
        assert!(matches!(
            ob.book(&book_note(43, 9, 1, 2, 101)),
            Err(BookError::Poisoned)
        ));
    }

    #[test]
    fn test_invalid_note_fields() {
        let ob = synced_book(42);
        let mut short_id = book_note(43, 9, 1, 2, 101);
        short_id.order_id = vec![9; 16];
        assert!(matches!(
            ob.book(&short_id),
            Err(BookError::InvalidOrderId(16))
        ));
        // Not terminal: the seq did not advance and the book still works.
        ob.book(&book_note(43, 9, 1, 2, 101)).unwrap();

        let bad_side = book_note(44, 8, 0, 2, 101);
        assert!(matches!(ob.book(&bad_side), Err(BookError::InvalidSide(0))));
    }

    #[test]
    fn test_queries_require_sync() {
        let ob = OrderBook::new(MARKET);
        assert!(matches!(ob.best_n(Side::Buy, 1), Err(BookError::Unsynced)));
        assert!(matches!(ob.best_fill(Side::Sell, 1), Err(BookError::Unsynced)));
    }

    #[test]
    fn test_buffered_notes_drain_in_arrival_order() {
        let ob = OrderBook::new(MARKET);
        ob.book(&book_note(9, 3, 1, 2, 99)).unwrap();
        ob.unbook(&unbook_note(10, 3)).unwrap();
        assert!(!ob.is_synced());

        ob.apply_snapshot(&snapshot(8, vec![snap_order(2, 2, 3, 105, 0)]))
            .unwrap();
        assert!(ob.is_synced());
        assert_eq!(ob.seq(), 10);
        // The book note applied, then its unbook removed it again.
        assert!(ob.best_n(Side::Buy, 5).unwrap().is_empty());
        assert_eq!(ob.order_count(), 1);
    }

    #[test]
    fn test_drain_failure_poisons() {
        let ob = OrderBook::new(MARKET);
        // Unbook of an id the snapshot will not contain, at the next seq.
        ob.unbook(&unbook_note(9, 77)).unwrap();
        let err = ob.apply_snapshot(&snapshot(8, vec![])).unwrap_err();
        assert!(matches!(err, BookError::NotFound(_)));
        assert!(matches!(
            ob.apply_snapshot(&snapshot(8, vec![])),
            Err(BookError::Poisoned)
        ));
    }

    #[test]
    fn test_best_fill_requires_sync_then_projects() {
        let ob = synced_book(42);
        let fills = ob.best_fill(Side::Sell, 2).unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].quantity, 2);
        // Projection only: nothing was consumed.
        assert_eq!(ob.best_n(Side::Sell, 1).unwrap()[0].quantity, 3);
    }
}
