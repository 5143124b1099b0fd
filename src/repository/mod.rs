//! Typed repositories over the document store.
//!
//! The engine and scheduler receive these by `Arc` at startup; there
//! is no process-global handle.

pub mod store;

use serde_json::{json, Value};
use std::path::Path;

use crate::domain::{Accumulation, Cycle, CycleStatus};
use crate::error::Result;
use crate::exchange::Exchange;

use store::{Document, JsonCollection};

impl Document for Cycle {
    const COLLECTION: &'static str = "cycles";

    fn id_int(&self) -> u64 {
        self.id_int
    }

    fn set_id_int(&mut self, id: u64) {
        self.id_int = id;
    }
}

impl Document for Accumulation {
    const COLLECTION: &'static str = "accumulations";

    fn id_int(&self) -> u64 {
        self.id_int
    }

    fn set_id_int(&mut self, id: u64) {
        self.id_int = id;
    }
}

pub struct CycleRepository {
    collection: JsonCollection<Cycle>,
}

impl CycleRepository {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            collection: JsonCollection::open(data_dir).await?,
        })
    }

    pub async fn find_all(&self) -> Vec<Cycle> {
        self.collection.find_all().await
    }

    pub async fn find_all_desc(&self) -> Vec<Cycle> {
        self.collection.find_all_desc().await
    }

    pub async fn find_by_id_int(&self, id: u64) -> Option<Cycle> {
        self.collection.find_by_id_int(id).await
    }

    pub async fn page(&self, offset: usize, limit: usize) -> Vec<Cycle> {
        self.collection.page(offset, limit).await
    }

    pub async fn save(&self, cycle: Cycle) -> Result<u64> {
        self.collection.save(cycle).await
    }

    pub async fn update_by_id_int(&self, id: u64, fields: Value) -> Result<()> {
        self.collection.update_by_id_int(id, fields).await
    }

    pub async fn delete_by_id_int(&self, id: u64) -> Result<bool> {
        self.collection.delete_by_id_int(id).await
    }

    pub async fn count_by_status(&self, status: CycleStatus) -> usize {
        self.collection
            .count_by_field("status", &json!(status))
            .await
    }

    /// Cycles the reconciliation engine still drives (buy or sell).
    pub async fn active(&self) -> Vec<Cycle> {
        self.collection
            .find_all()
            .await
            .into_iter()
            .filter(|c| c.status.is_active())
            .collect()
    }

    /// Completed cycles on one exchange; the accumulation decision
    /// sums their realized gains.
    pub async fn completed_for(&self, exchange: Exchange) -> Vec<Cycle> {
        self.collection
            .find_all()
            .await
            .into_iter()
            .filter(|c| c.status == CycleStatus::Completed && c.exchange == exchange)
            .collect()
    }
}

pub struct AccumulationRepository {
    collection: JsonCollection<Accumulation>,
}

impl AccumulationRepository {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            collection: JsonCollection::open(data_dir).await?,
        })
    }

    pub async fn find_all(&self) -> Vec<Accumulation> {
        self.collection.find_all().await
    }

    pub async fn find_all_desc(&self) -> Vec<Accumulation> {
        self.collection.find_all_desc().await
    }

    pub async fn page(&self, offset: usize, limit: usize) -> Vec<Accumulation> {
        self.collection.page(offset, limit).await
    }

    pub async fn save(&self, accumulation: Accumulation) -> Result<u64> {
        self.collection.save(accumulation).await
    }

    pub async fn delete_by_id_int(&self, id: u64) -> Result<bool> {
        self.collection.delete_by_id_int(id).await
    }

    pub async fn for_exchange(&self, exchange: Exchange) -> Vec<Accumulation> {
        self.collection
            .find_all()
            .await
            .into_iter()
            .filter(|a| a.exchange == exchange)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cycler-repo-{}", Uuid::new_v4()))
    }

    fn cycle(exchange: Exchange, status: CycleStatus) -> Cycle {
        let mut c = Cycle::new(
            exchange,
            dec!(0.01),
            dec!(60000),
            "100".to_string(),
            Utc::now(),
        );
        c.status = status;
        c
    }

    #[tokio::test]
    async fn active_filters_terminal_cycles() {
        let dir = temp_dir();
        let repo = CycleRepository::open(&dir).await.unwrap();
        repo.save(cycle(Exchange::Binance, CycleStatus::Buy)).await.unwrap();
        repo.save(cycle(Exchange::Binance, CycleStatus::Sell)).await.unwrap();
        repo.save(cycle(Exchange::Binance, CycleStatus::Completed)).await.unwrap();
        repo.save(cycle(Exchange::Binance, CycleStatus::Cancelled)).await.unwrap();

        let active = repo.active().await;
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|c| c.status.is_active()));
    }

    #[tokio::test]
    async fn completed_for_scopes_by_exchange() {
        let dir = temp_dir();
        let repo = CycleRepository::open(&dir).await.unwrap();
        repo.save(cycle(Exchange::Binance, CycleStatus::Completed)).await.unwrap();
        repo.save(cycle(Exchange::Kraken, CycleStatus::Completed)).await.unwrap();
        repo.save(cycle(Exchange::Kraken, CycleStatus::Buy)).await.unwrap();

        let completed = repo.completed_for(Exchange::Kraken).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].exchange, Exchange::Kraken);
    }

    #[tokio::test]
    async fn count_by_status_uses_serialized_form() {
        let dir = temp_dir();
        let repo = CycleRepository::open(&dir).await.unwrap();
        repo.save(cycle(Exchange::Mexc, CycleStatus::Buy)).await.unwrap();
        repo.save(cycle(Exchange::Mexc, CycleStatus::Buy)).await.unwrap();
        assert_eq!(repo.count_by_status(CycleStatus::Buy).await, 2);
        assert_eq!(repo.count_by_status(CycleStatus::Sell).await, 0);
    }

    #[tokio::test]
    async fn accumulations_round_trip() {
        let dir = temp_dir();
        let repo = AccumulationRepository::open(&dir).await.unwrap();
        let id = repo
            .save(Accumulation {
                id_int: 0,
                exchange: Exchange::Kucoin,
                cycle_id_int: 3,
                quantity: dec!(0.01),
                original_buy_price: dec!(58000),
                target_sell_price: dec!(60000),
                cancel_price: dec!(57500),
                deviation: dec!(4.17),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(repo.for_exchange(Exchange::Kucoin).await.len(), 1);
        assert!(repo.for_exchange(Exchange::Binance).await.is_empty());
    }
}
