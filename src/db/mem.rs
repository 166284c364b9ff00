//! In-memory implementation of the storage contract.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{AccountInfo, ClientDb, DbError, MatchRecord, OrderRecord};
use crate::book::OrderId;

/// A heap-backed store. Used by tests and as a stand-in wherever durability
/// is not required.
#[derive(Default)]
pub struct MemDb {
    inner: RwLock<MemInner>,
}

#[derive(Default)]
struct MemInner {
    accounts: HashMap<String, AccountInfo>,
    orders: HashMap<OrderId, OrderRecord>,
    matches: HashMap<[u8; 32], MatchRecord>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sort newest-first and apply the `n`/`since` filters shared by the order
/// query methods.
fn filter_orders(mut orders: Vec<OrderRecord>, n: usize, since: u64) -> Vec<OrderRecord> {
    if since > 0 {
        orders.retain(|o| o.time >= since);
    }
    orders.sort_by(|a, b| b.time.cmp(&a.time));
    if n > 0 {
        orders.truncate(n);
    }
    orders
}

impl ClientDb for MemDb {
    fn list_accounts(&self) -> Result<Vec<String>, DbError> {
        Ok(self.inner.read().accounts.keys().cloned().collect())
    }

    fn account(&self, url: &str) -> Result<Option<AccountInfo>, DbError> {
        Ok(self.inner.read().accounts.get(url).cloned())
    }

    fn create_account(&self, account: &AccountInfo) -> Result<(), DbError> {
        self.inner
            .write()
            .accounts
            .insert(account.url.clone(), account.clone());
        Ok(())
    }

    fn update_order(&self, order: &OrderRecord) -> Result<(), DbError> {
        self.inner.write().orders.insert(order.order_id, order.clone());
        Ok(())
    }

    fn order(&self, order_id: &OrderId) -> Result<Option<OrderRecord>, DbError> {
        Ok(self.inner.read().orders.get(order_id).cloned())
    }

    fn active_orders(&self) -> Result<Vec<OrderRecord>, DbError> {
        Ok(self
            .inner
            .read()
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect())
    }

    fn account_orders(&self, dex: &str, n: usize, since: u64) -> Result<Vec<OrderRecord>, DbError> {
        let orders = self
            .inner
            .read()
            .orders
            .values()
            .filter(|o| o.dex == dex)
            .cloned()
            .collect();
        Ok(filter_orders(orders, n, since))
    }

    fn market_orders(
        &self,
        dex: &str,
        base: u32,
        quote: u32,
        n: usize,
        since: u64,
    ) -> Result<Vec<OrderRecord>, DbError> {
        let orders = self
            .inner
            .read()
            .orders
            .values()
            .filter(|o| o.dex == dex && o.base == base && o.quote == quote)
            .cloned()
            .collect();
        Ok(filter_orders(orders, n, since))
    }

    fn update_match(&self, m: &MatchRecord) -> Result<(), DbError> {
        self.inner.write().matches.insert(m.match_id, m.clone());
        Ok(())
    }

    fn active_matches(&self) -> Result<Vec<MatchRecord>, DbError> {
        Ok(self
            .inner
            .read()
            .matches
            .values()
            .filter(|m| m.status.is_active())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Side;
    use crate::db::{MatchStatus, OrderStatus};

    fn record(tag: u8, dex: &str, base: u32, quote: u32, time: u64, status: OrderStatus) -> OrderRecord {
        OrderRecord {
            order_id: OrderId::from([tag; 32]),
            dex: dex.into(),
            base,
            quote,
            side: Side::Buy,
            quantity: 1,
            rate: 1,
            time,
            status,
        }
    }

    #[test]
    fn test_account_round_trip() {
        let db = MemDb::new();
        let account = AccountInfo {
            url: "wss://dex.example.org".into(),
            pubkey: vec![1, 2, 3],
            dex_pubkey: vec![4, 5, 6],
        };
        db.create_account(&account).unwrap();

        assert_eq!(db.list_accounts().unwrap(), vec![account.url.clone()]);
        assert_eq!(db.account(&account.url).unwrap(), Some(account));
        assert_eq!(db.account("wss://other.example.org").unwrap(), None);
    }

    #[test]
    fn test_update_order_overwrites() {
        let db = MemDb::new();
        let mut order = record(1, "dex1", 42, 0, 100, OrderStatus::Epoch);
        db.update_order(&order).unwrap();
        order.status = OrderStatus::Booked;
        db.update_order(&order).unwrap();

        let stored = db.order(&order.order_id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Booked);
    }

    #[test]
    fn test_active_orders_filters_status() {
        let db = MemDb::new();
        db.update_order(&record(1, "dex1", 42, 0, 100, OrderStatus::Epoch)).unwrap();
        db.update_order(&record(2, "dex1", 42, 0, 101, OrderStatus::Booked)).unwrap();
        db.update_order(&record(3, "dex1", 42, 0, 102, OrderStatus::Executed)).unwrap();
        db.update_order(&record(4, "dex1", 42, 0, 103, OrderStatus::Canceled)).unwrap();

        let active = db.active_orders().unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|o| o.status.is_active()));
    }

    #[test]
    fn test_account_orders_newest_n_since() {
        let db = MemDb::new();
        for (tag, time) in [(1u8, 100u64), (2, 200), (3, 300), (4, 400)] {
            db.update_order(&record(tag, "dex1", 42, 0, time, OrderStatus::Booked)).unwrap();
        }
        db.update_order(&record(5, "dex2", 42, 0, 500, OrderStatus::Booked)).unwrap();

        // n = 0 and since = 0 disable both filters.
        assert_eq!(db.account_orders("dex1", 0, 0).unwrap().len(), 4);

        let newest_two = db.account_orders("dex1", 2, 0).unwrap();
        let times: Vec<u64> = newest_two.iter().map(|o| o.time).collect();
        assert_eq!(times, vec![400, 300]);

        let recent = db.account_orders("dex1", 0, 250).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|o| o.time >= 250));
    }

    #[test]
    fn test_market_orders_filters_pair() {
        let db = MemDb::new();
        db.update_order(&record(1, "dex1", 42, 0, 100, OrderStatus::Booked)).unwrap();
        db.update_order(&record(2, "dex1", 2, 0, 200, OrderStatus::Booked)).unwrap();
        db.update_order(&record(3, "dex2", 42, 0, 300, OrderStatus::Booked)).unwrap();

        let orders = db.market_orders("dex1", 42, 0, 0, 0).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, OrderId::from([1; 32]));
    }

    #[test]
    fn test_active_matches_excludes_complete() {
        let db = MemDb::new();
        let mut m = MatchRecord {
            match_id: [1; 32],
            order_id: OrderId::from([1; 32]),
            status: MatchStatus::NewlyMatched,
            quantity: 1,
            rate: 1,
            time: 100,
        };
        db.update_match(&m).unwrap();
        m.match_id = [2; 32];
        m.status = MatchStatus::Complete;
        db.update_match(&m).unwrap();

        let active = db.active_matches().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].match_id, [1; 32]);
    }
}
