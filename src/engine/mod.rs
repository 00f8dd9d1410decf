//! Engine: owner and sole manipulator of the orchestrator pool
//!
//! One scheduling loop wakes on a periodic tick or a coalesced stale signal,
//! reaps orchestrators that have gone quiet, fills free pool slots with
//! pending work from signers not already in flight, and applies fairness
//! eviction when the pool is saturated. All mutations of the orchestrator
//! map and the pause table happen under one mutex held for the whole poll.

use crate::config::{EngineConfig, OrchestratorConfig};
use crate::error::{EngineError, EngineResult};
use crate::orchestrator::{
    Orchestrator, OrchestratorContext, OrchestratorState, ALL_ORCHESTRATOR_STATES,
};
use crate::types::{
    PublicTransaction, PubTxStatus, SortBy, StatusUpdate, TxFilter, TxId, TxStatusInfo,
};

use ethers::types::{Address, Bytes, U256};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pool state guarded by a single mutex: the orchestrator map and the
/// fairness pause table always change together
struct PoolState {
    orchestrators: HashMap<Address, Arc<Orchestrator>>,
    paused_until: HashMap<Address, Instant>,
}

/// The public transaction submission engine
pub struct PubTxEngine {
    cfg: EngineConfig,
    orchestrator_cfg: OrchestratorConfig,
    ctx: OrchestratorContext,
    pool: Mutex<PoolState>,
    stale_tx: mpsc::Sender<()>,
    stale_rx: StdMutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tx_cache: StdMutex<LruCache<TxId, PublicTransaction>>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl PubTxEngine {
    pub fn new(
        cfg: EngineConfig,
        orchestrator_cfg: OrchestratorConfig,
        ctx: OrchestratorContext,
    ) -> Arc<Self> {
        // Single-slot channel: concurrent stale notifications coalesce into
        // one extra poll
        let (stale_tx, stale_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let capacity =
            NonZeroUsize::new(cfg.transaction_cache_capacity.max(1)).unwrap();

        Arc::new(Self {
            cfg,
            orchestrator_cfg,
            ctx,
            pool: Mutex::new(PoolState {
                orchestrators: HashMap::new(),
                paused_until: HashMap::new(),
            }),
            stale_tx,
            stale_rx: StdMutex::new(Some(stale_rx)),
            shutdown_tx,
            shutdown_rx,
            tx_cache: StdMutex::new(LruCache::new(capacity)),
            loop_handle: StdMutex::new(None),
        })
    }

    /// Start the scheduling loop and the confirmation tracker
    pub fn start(self: &Arc<Self>) {
        // New rows wake the engine only after they are durably committed
        let weak = Arc::downgrade(self);
        self.ctx.store.add_post_commit_hook(Arc::new(move || {
            if let Some(engine) = weak.upgrade() {
                engine.mark_in_flight_orchestrators_stale();
            }
        }));

        let tracker = self.ctx.tracker.clone();
        tokio::spawn(tracker.run(self.shutdown_rx.clone()));

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.engine_loop().await;
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
    }

    /// Stop the engine and every orchestrator it owns
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let pool = self.pool.lock().await;
        for orchestrator in pool.orchestrators.values() {
            orchestrator.stop();
        }
        info!("Engine stopped");
    }

    /// Non-blocking wake primitive: a full buffer means a poll is already due
    pub fn mark_in_flight_orchestrators_stale(&self) {
        let _ = self.stale_tx.try_send(());
    }

    /// Shutdown signal shared with auxiliary tasks (block feed, tracker)
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    async fn engine_loop(self: Arc<Self>) {
        let mut stale_rx = match self.stale_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.cfg.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Engine started polling on interval {:?}",
            self.cfg.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stale_rx.recv() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Engine poller exiting");
                        return;
                    }
                }
            }

            let (polled, total) = self.poll().await;
            debug!(
                "Engine polling complete: {} orchestrators created, {} in flight",
                polled, total
            );
        }
    }

    /// One scheduling pass: reap, fill capacity or evict for fairness, then
    /// publish pool metrics
    async fn poll(&self) -> (i64, usize) {
        let poll_start = Instant::now();
        let mut pool = self.pool.lock().await;

        let old_in_flight = std::mem::take(&mut pool.orchestrators);
        let mut in_flight_signers: Vec<Address> = Vec::with_capacity(old_in_flight.len());
        let mut state_counts: HashMap<&'static str, usize> = ALL_ORCHESTRATOR_STATES
            .iter()
            .map(|s| (s.as_str(), 0))
            .collect();

        // Reap phase: carry over orchestrators that are not ready for removal
        for (signer, orchestrator) in old_in_flight {
            let state = orchestrator.state();
            debug!(
                "Engine checking orchestrator for {:?}: state {}, state duration {:?}, {} transactions",
                signer,
                state.as_str(),
                orchestrator.state_duration(),
                orchestrator.in_flight_count()
            );

            let expired = (state == OrchestratorState::Stale
                && orchestrator.state_duration() > self.cfg.max_stale_time())
                || (state == OrchestratorState::Idle
                    && orchestrator.state_duration() > self.cfg.max_idle_time());
            if expired {
                // Stop is asynchronous; the Stopped state is observed on a
                // later poll
                orchestrator.stop();
            }

            if orchestrator.state() != OrchestratorState::Stopped {
                orchestrator.mark_in_flight_tx_stale();
                *state_counts
                    .entry(orchestrator.state().as_str())
                    .or_default() += 1;
                in_flight_signers.push(signer);
                pool.orchestrators.insert(signer, orchestrator);
            } else {
                info!("Engine removed orchestrator for signing address {:?}", signer);
            }
        }

        let total_before = pool.orchestrators.len();
        let spaces = self
            .cfg
            .max_in_flight_orchestrators
            .saturating_sub(total_before);
        let mut polled: i64 = 0;
        let mut total = total_before;

        if spaces > 0 {
            // Paused signers are excluded from polling until their deadline
            // passes, but still count for metrics
            let now = Instant::now();
            pool.paused_until.retain(|signer, until| {
                if *until > now {
                    debug!(
                        "Engine excluding paused signing address {:?} until {:?}",
                        signer, until
                    );
                    *state_counts
                        .entry(OrchestratorState::Paused.as_str())
                        .or_default() += 1;
                    in_flight_signers.push(*signer);
                    true
                } else {
                    false
                }
            });

            let filter = TxFilter {
                in_status: vec![PubTxStatus::Pending],
                not_from: in_flight_signers.clone(),
                sort: SortBy::SequenceAsc,
                limit: Some(spaces),
                ..Default::default()
            };
            let rows = match self
                .ctx
                .retry
                .with_retry(&self.shutdown_rx, "poll pending transactions", || {
                    self.ctx.store.list_transactions(&filter)
                })
                .await
            {
                Ok(rows) => rows,
                Err(_) => {
                    info!("Engine polling cancelled while retrying");
                    return (-1, pool.orchestrators.len());
                }
            };
            debug!(
                "Engine polled {} items to fill {} empty slots",
                rows.len(),
                spaces
            );

            for row in rows {
                if pool.orchestrators.contains_key(&row.from) {
                    warn!(
                        "Engine fetched extra transactions from signing address {:?}",
                        row.from
                    );
                    continue;
                }
                let orchestrator = Orchestrator::new(
                    row.from,
                    self.orchestrator_cfg.clone(),
                    self.ctx.clone(),
                    self.shutdown_rx.clone(),
                );
                orchestrator.start();
                *state_counts
                    .entry(orchestrator.state().as_str())
                    .or_default() += 1;
                pool.orchestrators.insert(row.from, orchestrator);
                info!("Engine added orchestrator for signing address {:?}", row.from);
            }

            total = pool.orchestrators.len();
            polled = total as i64 - total_before as i64;
        } else {
            // Pool is full: fairness control. Only orchestrators past the
            // overload threshold are candidates, only as many are stopped as
            // other signers are waiting, oldest first.
            let mut candidates: Vec<(Address, std::time::Duration)> = pool
                .orchestrators
                .iter()
                .filter(|(_, oc)| oc.age() > self.cfg.max_overload_process_time())
                .map(|(signer, oc)| (*signer, oc.age()))
                .collect();

            if !candidates.is_empty() {
                candidates.sort_by(|a, b| b.1.cmp(&a.1));

                let mut excluded = in_flight_signers.clone();
                let now = Instant::now();
                for (signer, until) in pool.paused_until.iter() {
                    if *until > now {
                        excluded.push(*signer);
                    }
                }
                let filter = TxFilter {
                    in_status: vec![PubTxStatus::Pending],
                    not_from: excluded,
                    sort: SortBy::SequenceAsc,
                    limit: Some(candidates.len()),
                    ..Default::default()
                };
                let waiting = match self
                    .ctx
                    .retry
                    .with_retry(&self.shutdown_rx, "poll waiting signers", || {
                        self.ctx.store.list_transactions(&filter)
                    })
                    .await
                {
                    Ok(rows) => rows
                        .into_iter()
                        .map(|r| r.from)
                        .collect::<std::collections::HashSet<_>>()
                        .len(),
                    Err(_) => {
                        info!("Engine polling cancelled while retrying");
                        return (-1, pool.orchestrators.len());
                    }
                };

                let mut evicted = 0usize;
                for (signer, age) in candidates.into_iter().take(waiting) {
                    info!(
                        "Engine pausing orchestrator for signing address {:?} after {:?}",
                        signer, age
                    );
                    if let Some(orchestrator) = pool.orchestrators.get(&signer) {
                        orchestrator.stop();
                    }
                    pool.paused_until
                        .insert(signer, Instant::now() + self.cfg.max_overload_process_time());
                    evicted += 1;
                }
                if evicted > 0 {
                    // Freed slots are claimable as soon as the stops land
                    self.mark_in_flight_orchestrators_stale();
                }
            }
        }

        crate::metrics::record_pool_state(
            &state_counts,
            self.cfg
                .max_in_flight_orchestrators
                .saturating_sub(pool.orchestrators.len()),
        );
        crate::metrics::record_poll_duration(poll_start.elapsed().as_secs_f64());
        debug!("Engine poll loop took {:?}", poll_start.elapsed());

        (polled, total)
    }

    /// Enqueue a public transaction for submission
    pub async fn submit_public_transaction(
        &self,
        from: Address,
        to: Option<Address>,
        data: Bytes,
        value: U256,
        gas_limit: U256,
    ) -> EngineResult<TxId> {
        let tx = PublicTransaction::new(from, to, data, value, gas_limit);
        let id = tx.id;
        self.ctx.store.insert_transaction(&tx).await?;
        debug!("Submitted public transaction {} for {:?}", id, from);
        Ok(id)
    }

    /// Cancel a transaction. Permitted only while it is Pending with no
    /// nonce assigned; anything later is already racing the ledger.
    pub async fn cancel_transaction(&self, id: &TxId) -> EngineResult<()> {
        if self.ctx.store.delete_unassigned(id).await? {
            info!("Cancelled transaction {}", id);
            return Ok(());
        }
        match self.ctx.store.get_transaction(id).await? {
            Some(tx) => Err(EngineError::NotCancellable {
                id: *id,
                status: tx.status.to_string(),
            }),
            None => Err(EngineError::TransactionNotFound(*id)),
        }
    }

    /// Report a transaction's status, with hash, block and error detail
    /// where applicable. Terminal rows are served from a hot cache.
    pub async fn get_transaction_status(&self, id: &TxId) -> EngineResult<TxStatusInfo> {
        if let Some(tx) = self.tx_cache.lock().unwrap().get(id).cloned() {
            return self.build_status_info(tx).await;
        }

        let tx = self
            .ctx
            .store
            .get_transaction(id)
            .await?
            .ok_or(EngineError::TransactionNotFound(*id))?;

        if tx.status.is_terminal() {
            self.tx_cache.lock().unwrap().put(*id, tx.clone());
        }
        self.build_status_info(tx).await
    }

    async fn build_status_info(&self, tx: PublicTransaction) -> EngineResult<TxStatusInfo> {
        let block_number = if tx.status.is_terminal() {
            self.ctx
                .store
                .get_latest_receipt(&tx.id)
                .await?
                .map(|r| r.block_number)
        } else {
            None
        };
        Ok(TxStatusInfo {
            id: tx.id,
            status: tx.status,
            hash: tx.last_hash,
            block_number,
            error: tx.last_error,
            attempt_count: tx.attempt_count,
        })
    }

    /// Operator action: put a Suspended transaction back in line. Its
    /// orchestrator re-broadcasts it with a bumped fee.
    pub async fn resume_transaction(&self, id: &TxId) -> EngineResult<()> {
        let tx = self
            .ctx
            .store
            .get_transaction(id)
            .await?
            .ok_or(EngineError::TransactionNotFound(*id))?;

        if tx.status != PubTxStatus::Suspended {
            return Err(EngineError::InvalidStatusTransition {
                from: tx.status.to_string(),
                to: PubTxStatus::Submitted.to_string(),
            });
        }

        self.ctx
            .store
            .update_status(id, PubTxStatus::Submitted, StatusUpdate::default())
            .await?;

        // The owning orchestrator may have been reaped while the transaction
        // sat suspended; give it one again if there is room
        {
            let mut pool = self.pool.lock().await;
            if !pool.orchestrators.contains_key(&tx.from)
                && pool.orchestrators.len() < self.cfg.max_in_flight_orchestrators
            {
                let orchestrator = Orchestrator::new(
                    tx.from,
                    self.orchestrator_cfg.clone(),
                    self.ctx.clone(),
                    self.shutdown_rx.clone(),
                );
                orchestrator.start();
                pool.orchestrators.insert(tx.from, orchestrator);
            }
        }
        self.mark_in_flight_orchestrators_stale();
        info!("Resumed suspended transaction {}", id);
        Ok(())
    }

    /// Pool size, for observability
    pub async fn in_flight_orchestrator_count(&self) -> usize {
        self.pool.lock().await.orchestrators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::confirm::ConfirmationTracker;
    use crate::events::EventDispatcher;
    use crate::fueling::CompletedNonceCache;
    use crate::gas::GasPriceOracle;
    use crate::keystore::{KeyStoreListable, LocalKeyStore};
    use crate::retry::RetryPolicy;
    use crate::store::{InMemoryTxStore, TransactionStore};
    use crate::testutil::MockLedger;
    use ethers::signers::LocalWallet;
    use std::time::Duration;

    struct Harness {
        engine: Arc<PubTxEngine>,
        store: Arc<InMemoryTxStore>,
        ledger: Arc<MockLedger>,
        signers: Vec<Address>,
    }

    fn harness(cfg: EngineConfig, wallets: usize) -> Harness {
        let store: Arc<InMemoryTxStore> = Arc::new(InMemoryTxStore::new());
        let ledger = MockLedger::new(0);
        let keys = Arc::new(LocalKeyStore::from_wallets(
            (0..wallets)
                .map(|_| LocalWallet::new(&mut ethers::core::rand::thread_rng()))
                .collect(),
            1,
        ));
        let signers = keys.list_addresses();
        let completed = Arc::new(CompletedNonceCache::new());
        let tracker = Arc::new(ConfirmationTracker::new(ledger.clone(), 3));
        let gas = Arc::new(GasPriceOracle::new(
            ledger.clone(),
            Duration::from_millis(0),
        ));
        let orchestrator_cfg = OrchestratorConfig {
            interval_ms: 5,
            ..Default::default()
        };

        let ctx = OrchestratorContext {
            store: store.clone(),
            ledger: ledger.clone(),
            keys,
            gas,
            fueling: None,
            tracker,
            completed,
            dispatcher: EventDispatcher::new(),
            retry: RetryPolicy::new(&RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 4,
                factor: 2.0,
            }),
            chain_id: 1,
        };

        let engine = PubTxEngine::new(cfg, orchestrator_cfg, ctx);
        Harness {
            engine,
            store,
            ledger,
            signers,
        }
    }

    impl Harness {
        async fn submit_for(&self, signer: Address) -> TxId {
            self.engine
                .submit_public_transaction(
                    signer,
                    Some(Address::random()),
                    Bytes::default(),
                    U256::zero(),
                    U256::from(21_000u64),
                )
                .await
                .unwrap()
        }

        async fn wait_for_stopped(&self, signer: Address) {
            for _ in 0..200 {
                let stopped = {
                    let pool = self.engine.pool.lock().await;
                    pool.orchestrators
                        .get(&signer)
                        .map(|oc| oc.state() == OrchestratorState::Stopped)
                        .unwrap_or(true)
                };
                if stopped {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("orchestrator for {:?} never stopped", signer);
        }
    }

    #[tokio::test]
    async fn test_wake_signals_coalesce_to_one_poll() {
        let h = harness(EngineConfig::default(), 1);

        for _ in 0..10 {
            h.engine.mark_in_flight_orchestrators_stale();
        }

        let mut rx = h.engine.stale_rx.lock().unwrap().take().unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pool_bounded_by_max_in_flight() {
        let cfg = EngineConfig {
            max_in_flight_orchestrators: 2,
            ..Default::default()
        };
        let h = harness(cfg, 3);

        for signer in &h.signers {
            h.submit_for(*signer).await;
        }

        let (polled, total) = h.engine.poll().await;
        assert_eq!(polled, 2);
        assert_eq!(total, 2);
        assert_eq!(h.engine.in_flight_orchestrator_count().await, 2);

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_signer_rows_share_one_orchestrator() {
        let h = harness(EngineConfig::default(), 1);
        let signer = h.signers[0];
        h.submit_for(signer).await;
        h.submit_for(signer).await;
        h.submit_for(signer).await;

        let (polled, total) = h.engine.poll().await;
        assert_eq!(polled, 1);
        assert_eq!(total, 1);

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_fairness_evicts_oldest_for_waiting_signer() {
        let cfg = EngineConfig {
            max_in_flight_orchestrators: 2,
            max_overload_process_time_ms: 50,
            ..Default::default()
        };
        let h = harness(cfg, 3);
        let (a, b, c) = (h.signers[0], h.signers[1], h.signers[2]);

        // Both orchestrators sit on transactions that never confirm
        h.ledger.set_broadcast_error(Some("connection refused"));

        h.submit_for(a).await;
        h.engine.poll().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.submit_for(b).await;
        h.engine.poll().await;
        assert_eq!(h.engine.in_flight_orchestrator_count().await, 2);

        // Both exceed the overload threshold; only one signer is waiting
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.submit_for(c).await;
        h.engine.poll().await;

        // Exactly the older orchestrator (a) was stopped and paused
        {
            let pool = h.engine.pool.lock().await;
            assert!(pool.paused_until.contains_key(&a));
            assert!(!pool.paused_until.contains_key(&b));
        }
        h.wait_for_stopped(a).await;

        // The freed slot goes to the waiting signer, b survives
        h.engine.poll().await;
        {
            let pool = h.engine.pool.lock().await;
            assert!(pool.orchestrators.contains_key(&b));
            assert!(pool.orchestrators.contains_key(&c));
            assert!(!pool.orchestrators.contains_key(&a));
        }

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_starved_signer_runs_and_original_resumes_after_pause() {
        let cfg = EngineConfig {
            max_in_flight_orchestrators: 1,
            max_overload_process_time_ms: 50,
            ..Default::default()
        };
        let h = harness(cfg, 2);
        let (s, e) = (h.signers[0], h.signers[1]);

        h.ledger.set_broadcast_error(Some("connection refused"));
        for _ in 0..3 {
            h.submit_for(s).await;
        }
        h.engine.poll().await;
        assert_eq!(h.engine.in_flight_orchestrator_count().await, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.submit_for(e).await;
        h.engine.poll().await;
        h.wait_for_stopped(s).await;

        // The newcomer takes the slot while the original signer is paused
        h.engine.poll().await;
        {
            let pool = h.engine.pool.lock().await;
            assert!(pool.orchestrators.contains_key(&e));
            assert!(!pool.orchestrators.contains_key(&s));
            assert!(pool.paused_until.contains_key(&s));
        }

        // Once the newcomer finishes and the pause lapses, the original
        // signer gets its orchestrator back
        {
            let pool = h.engine.pool.lock().await;
            pool.orchestrators.get(&e).unwrap().stop();
        }
        h.wait_for_stopped(e).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.engine.poll().await;
        h.engine.poll().await;
        {
            let pool = h.engine.pool.lock().await;
            assert!(pool.orchestrators.contains_key(&s));
        }

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_only_before_nonce_assignment() {
        let h = harness(EngineConfig::default(), 1);
        let signer = h.signers[0];

        let id = h.submit_for(signer).await;
        h.engine.cancel_transaction(&id).await.unwrap();

        let id = h.submit_for(signer).await;
        h.store.assign_nonce(&id, 0).await.unwrap();
        let err = h.engine.cancel_transaction(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotCancellable { .. }));

        let missing = TxId::new_v4();
        let err = h.engine.cancel_transaction(&missing).await.unwrap_err();
        assert!(matches!(err, EngineError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_reporting_includes_receipt_detail() {
        let h = harness(EngineConfig::default(), 1);
        let signer = h.signers[0];

        let id = h.submit_for(signer).await;
        let info = h.engine.get_transaction_status(&id).await.unwrap();
        assert_eq!(info.status, PubTxStatus::Pending);
        assert!(info.hash.is_none());

        h.store.assign_nonce(&id, 0).await.unwrap();
        let hash = ethers::types::H256::random();
        h.store
            .record_receipt(&crate::types::ReceiptRecord {
                tx_id: id,
                signer,
                nonce: 0,
                hash,
                success: true,
                block_number: 42,
                block_hash: ethers::types::H256::random(),
            })
            .await
            .unwrap();

        let info = h.engine.get_transaction_status(&id).await.unwrap();
        assert_eq!(info.status, PubTxStatus::Succeeded);
        assert_eq!(info.hash, Some(hash));
        assert_eq!(info.block_number, Some(42));
    }

    #[tokio::test]
    async fn test_resume_suspended_transaction() {
        let h = harness(EngineConfig::default(), 1);
        let signer = h.signers[0];

        let id = h.submit_for(signer).await;
        h.store.assign_nonce(&id, 0).await.unwrap();
        h.store
            .update_status(&id, PubTxStatus::Suspended, Default::default())
            .await
            .unwrap();

        h.engine.resume_transaction(&id).await.unwrap();
        let row = h.store.get_transaction(&id).await.unwrap().unwrap();
        assert_eq!(row.status, PubTxStatus::Submitted);
        assert_eq!(h.engine.in_flight_orchestrator_count().await, 1);

        // Resuming a non-suspended transaction is refused
        let err = h.engine.resume_transaction(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStatusTransition { .. }));

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_stops_all_orchestrators() {
        let cfg = EngineConfig {
            interval_ms: 10,
            max_in_flight_orchestrators: 4,
            ..Default::default()
        };
        let h = harness(cfg, 3);

        for signer in h.signers.clone() {
            h.submit_for(signer).await;
        }
        h.engine.start();

        // Wait until the pool has picked up the work
        for _ in 0..100 {
            if h.engine.in_flight_orchestrator_count().await == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.engine.in_flight_orchestrator_count().await, 3);

        h.engine.stop().await;

        for signer in h.signers.clone() {
            h.wait_for_stopped(signer).await;
        }
    }

    #[tokio::test]
    async fn test_post_commit_hook_wakes_engine() {
        let h = harness(EngineConfig::default(), 1);
        h.engine.start();

        // Drain whatever the startup produced, then submit and observe a wake
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.submit_for(h.signers[0]).await;

        for _ in 0..100 {
            if h.engine.in_flight_orchestrator_count().await == 1 {
                h.engine.stop().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine never picked up the submitted transaction");
    }
}
