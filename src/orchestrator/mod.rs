//! Per-signing-address orchestrator
//!
//! Each orchestrator owns a bounded FIFO of in-flight transactions for one
//! signing address and drives them through nonce assignment, gas pricing,
//! signing, broadcast and confirmation. Submissions are strictly
//! nonce-ascending and terminal statuses are persisted in nonce order even
//! when the ledger reports receipts out of order.

use crate::chain::{GasPrice, LedgerClient};
use crate::config::OrchestratorConfig;
use crate::confirm::{ConfirmationNotice, ConfirmationTracker, TrackerEvent};
use crate::error::{classify_rejection, EngineError, EngineResult, RejectionClass};
use crate::events::{EventDispatcher, TxOutcomeEvent};
use crate::fueling::{CompletedNonceCache, FuelingManager};
use crate::gas::GasPriceOracle;
use crate::keystore::KeyStore;
use crate::retry::RetryPolicy;
use crate::store::TransactionStore;
use crate::types::{
    PublicTransaction, PubTxStatus, ReceiptRecord, StatusUpdate, SortBy, TxErrorKind, TxFilter,
};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256,
};
use ethers::utils::keccak256;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of an orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stale,
    Idle,
    Running,
    Paused,
    Stopped,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::Stale => "stale",
            OrchestratorState::Idle => "idle",
            OrchestratorState::Running => "running",
            OrchestratorState::Paused => "paused",
            OrchestratorState::Stopped => "stopped",
        }
    }
}

pub const ALL_ORCHESTRATOR_STATES: [OrchestratorState; 5] = [
    OrchestratorState::Stale,
    OrchestratorState::Idle,
    OrchestratorState::Running,
    OrchestratorState::Paused,
    OrchestratorState::Stopped,
];

/// Narrow capability set handed to each orchestrator at construction. The
/// orchestrator holds no link back to the engine beyond these handles.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub store: Arc<dyn TransactionStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub keys: Arc<dyn KeyStore>,
    pub gas: Arc<GasPriceOracle>,
    pub fueling: Option<Arc<FuelingManager>>,
    pub tracker: Arc<ConfirmationTracker>,
    pub completed: Arc<CompletedNonceCache>,
    pub dispatcher: Arc<EventDispatcher>,
    pub retry: RetryPolicy,
    pub chain_id: u64,
}

struct StateInfo {
    state: OrchestratorState,
    entered: Instant,
}

/// A transaction in the orchestrator's working set
struct InFlightTx {
    tx: PublicTransaction,
    broadcast_at: Option<Instant>,
    watched_hash: Option<H256>,
    /// Terminal status has been persisted
    terminal: bool,
    /// A reorg invalidated the last broadcast
    needs_rebroadcast: bool,
}

/// Mutable processing state owned by the run loop
struct ProcState {
    queue: Vec<InFlightTx>,
    /// Local monotonic nonce counter, seeded from the ledger
    next_nonce: Option<u64>,
    /// Receipts seen out of order, held until lower nonces are terminal
    buffered_receipts: BTreeMap<u64, ReceiptRecord>,
    /// Receipts at threshold depth awaiting in-order persistence
    pending_final: BTreeMap<u64, ReceiptRecord>,
    empty_ticks: u32,
}

impl ProcState {
    fn new() -> Self {
        Self {
            queue: Vec::new(),
            next_nonce: None,
            buffered_receipts: BTreeMap::new(),
            pending_final: BTreeMap::new(),
            empty_ticks: 0,
        }
    }

    fn sort_queue(&mut self) {
        self.queue
            .sort_by_key(|item| (item.tx.nonce.unwrap_or(u64::MAX), item.tx.sequence));
    }

    fn find_by_id(&mut self, id: &crate::types::TxId) -> Option<&mut InFlightTx> {
        self.queue.iter_mut().find(|item| item.tx.id == *id)
    }
}

/// State machine driving one signing address
pub struct Orchestrator {
    signer: Address,
    cfg: OrchestratorConfig,
    ctx: OrchestratorContext,
    state: Mutex<StateInfo>,
    birth: Instant,
    stop_requested: AtomicBool,
    stale_notify: Notify,
    in_flight_count: AtomicUsize,
    notice_tx: mpsc::Sender<ConfirmationNotice>,
    notice_rx: Mutex<Option<mpsc::Receiver<ConfirmationNotice>>>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        signer: Address,
        cfg: OrchestratorConfig,
        ctx: OrchestratorContext,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (notice_tx, notice_rx) = mpsc::channel(256);
        Arc::new(Self {
            signer,
            cfg,
            ctx,
            state: Mutex::new(StateInfo {
                state: OrchestratorState::Stale,
                entered: Instant::now(),
            }),
            birth: Instant::now(),
            stop_requested: AtomicBool::new(false),
            stale_notify: Notify::new(),
            in_flight_count: AtomicUsize::new(0),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            shutdown,
        })
    }

    pub fn state(&self) -> OrchestratorState {
        self.state.lock().unwrap().state
    }

    pub fn state_duration(&self) -> std::time::Duration {
        self.state.lock().unwrap().entered.elapsed()
    }

    pub fn age(&self) -> std::time::Duration {
        self.birth.elapsed()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_count.load(Ordering::Relaxed)
    }

    fn set_state(&self, new: OrchestratorState) {
        let mut info = self.state.lock().unwrap();
        if info.state != new {
            debug!(
                "Orchestrator {:?} {} -> {}",
                self.signer,
                info.state.as_str(),
                new.as_str()
            );
            info.state = new;
            info.entered = Instant::now();
        }
    }

    /// Request termination. Asynchronous: the engine observes the Stopped
    /// state on its next poll. Idempotent.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stale_notify.notify_one();
    }

    /// Nudge the orchestrator to re-check its queue outside its tick
    pub fn mark_in_flight_tx_stale(&self) {
        self.stale_notify.notify_one();
    }

    /// Spawn the run loop
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        let mut notice_rx = match self.notice_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("Orchestrator {:?} started twice", self.signer);
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.cfg.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.clone();
        let mut state = ProcState::new();

        info!("Orchestrator started for signing address {:?}", self.signer);

        loop {
            if self.stop_requested.load(Ordering::SeqCst) || *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stale_notify.notified() => {}
                Some(notice) = notice_rx.recv() => {
                    if let Err(e) = self.handle_notice(&mut state, notice).await {
                        if matches!(e, EngineError::Cancelled) {
                            break;
                        }
                        warn!("Orchestrator {:?} notice handling error: {}", self.signer, e);
                    }
                    continue;
                }
                _ = shutdown.changed() => { continue; }
            }

            if self.stop_requested.load(Ordering::SeqCst) || *shutdown.borrow() {
                break;
            }

            match self.process_tick(&mut state).await {
                Ok(()) => {}
                Err(EngineError::Cancelled) => break,
                Err(EngineError::KeyNotFound(addr)) => {
                    error!("Orchestrator {:?} has no signing key, stopping", addr);
                    break;
                }
                Err(e) => {
                    warn!("Orchestrator {:?} tick error: {}", self.signer, e);
                }
            }
        }

        self.set_state(OrchestratorState::Stopped);
        info!("Orchestrator exiting for signing address {:?}", self.signer);
    }

    /// One full pass: refill the queue, assign nonces, broadcast in order,
    /// then settle the resulting state
    async fn process_tick(&self, state: &mut ProcState) -> EngineResult<()> {
        self.refill(state).await?;
        self.in_flight_count.store(state.queue.len(), Ordering::Relaxed);

        if state.queue.is_empty() {
            state.empty_ticks = state.empty_ticks.saturating_add(1);
            match self.state() {
                OrchestratorState::Running => self.set_state(OrchestratorState::Idle),
                OrchestratorState::Idle if state.empty_ticks > self.cfg.empty_ticks_to_stale => {
                    self.set_state(OrchestratorState::Stale)
                }
                _ => {}
            }
            return Ok(());
        }
        state.empty_ticks = 0;

        self.assign_nonces(state).await?;
        let progressed = self.broadcast_pass(state).await?;
        self.drain_receipts(state).await?;

        // Fully gated by a suspended nonce: degrade so the engine reaps us
        // after maxStaleTime instead of holding the slot forever
        if !progressed && self.fully_suspended(state) {
            self.set_state(OrchestratorState::Stale);
        } else {
            self.set_state(OrchestratorState::Running);
        }
        Ok(())
    }

    /// Merge pending work from the store into the local queue, up to the cap
    async fn refill(&self, state: &mut ProcState) -> EngineResult<()> {
        let filter = TxFilter {
            in_status: vec![
                PubTxStatus::Pending,
                PubTxStatus::Submitted,
                PubTxStatus::Suspended,
            ],
            from: Some(self.signer),
            sort: SortBy::SequenceAsc,
            limit: Some(self.cfg.max_in_flight_txs),
            ..Default::default()
        };

        let rows = self
            .ctx
            .retry
            .with_retry(&self.shutdown, "list in-flight transactions", || {
                self.ctx.store.list_transactions(&filter)
            })
            .await?;

        for row in rows {
            if let Some(item) = state.find_by_id(&row.id) {
                // An operator resume flips Suspended back to Submitted out
                // of band; adopt it so the next pass re-broadcasts
                if item.tx.status == PubTxStatus::Suspended
                    && row.status == PubTxStatus::Submitted
                {
                    item.tx.status = PubTxStatus::Submitted;
                    item.tx.attempt_count = row.attempt_count;
                    item.broadcast_at = None;
                }
                continue;
            }
            if state.queue.len() >= self.cfg.max_in_flight_txs {
                break;
            }
            state.queue.push(InFlightTx {
                tx: row,
                broadcast_at: None,
                watched_hash: None,
                terminal: false,
                needs_rebroadcast: false,
            });
        }
        state.sort_queue();
        Ok(())
    }

    /// Assign ledger nonces to queue items that lack one, in FIFO order
    async fn assign_nonces(&self, state: &mut ProcState) -> EngineResult<()> {
        let needs_nonce = state
            .queue
            .iter()
            .any(|item| item.tx.nonce.is_none() && item.tx.status == PubTxStatus::Pending);
        if !needs_nonce {
            return Ok(());
        }

        if state.next_nonce.is_none() {
            let ledger_nonce = self.ctx.ledger.get_nonce(self.signer).await?;
            let highest_assigned = state.queue.iter().filter_map(|i| i.tx.nonce).max();
            let seed = match highest_assigned {
                Some(n) => ledger_nonce.max(n + 1),
                None => ledger_nonce,
            };
            debug!(
                "Orchestrator {:?} seeded nonce counter at {}",
                self.signer, seed
            );
            state.next_nonce = Some(seed);
        }

        let mut next = state.next_nonce.unwrap();
        for item in state.queue.iter_mut() {
            if item.tx.nonce.is_some() || item.tx.status != PubTxStatus::Pending {
                continue;
            }
            let id = item.tx.id;
            self.ctx
                .retry
                .with_retry(&self.shutdown, "assign nonce", || {
                    self.ctx.store.assign_nonce(&id, next)
                })
                .await?;
            item.tx.nonce = Some(next);
            debug!(
                "Assigned nonce {} to transaction {} for {:?}",
                next, item.tx.id, self.signer
            );
            next += 1;
        }
        state.next_nonce = Some(next);
        state.sort_queue();
        Ok(())
    }

    fn fully_suspended(&self, state: &ProcState) -> bool {
        let lowest_suspended = state
            .queue
            .iter()
            .filter(|i| i.tx.status == PubTxStatus::Suspended && !i.terminal)
            .filter_map(|i| i.tx.nonce)
            .min();
        match lowest_suspended {
            Some(gate) => {
                let suspended_count = state
                    .queue
                    .iter()
                    .filter(|i| i.tx.status == PubTxStatus::Suspended && !i.terminal)
                    .count();
                suspended_count >= self.cfg.suspended_nonce_gap
                    && state.queue.iter().all(|i| {
                        i.terminal
                            || i.tx.status == PubTxStatus::Suspended
                            || i.tx.nonce.map(|n| n > gate).unwrap_or(true)
                    })
            }
            None => false,
        }
    }

    /// Broadcast work in strictly ascending nonce order. Returns true when
    /// at least one transaction was broadcast or is progressing normally.
    async fn broadcast_pass(&self, state: &mut ProcState) -> EngineResult<bool> {
        // The ledger rejects every successor of a suspended nonce, so stop
        // broadcasting past it once the configured gap is reached
        let suspended: Vec<u64> = state
            .queue
            .iter()
            .filter(|i| i.tx.status == PubTxStatus::Suspended && !i.terminal)
            .filter_map(|i| i.tx.nonce)
            .collect();
        let gate = if suspended.len() >= self.cfg.suspended_nonce_gap {
            suspended.iter().min().copied()
        } else {
            None
        };

        let mut progressed = false;

        for idx in 0..state.queue.len() {
            let (id, nonce, status, needs_rebroadcast, broadcast_at, stored_price) = {
                let item = &state.queue[idx];
                (
                    item.tx.id,
                    item.tx.nonce,
                    item.tx.status,
                    item.needs_rebroadcast,
                    item.broadcast_at,
                    item.tx.gas_price.clone(),
                )
            };

            if state.queue[idx].terminal || status.is_terminal() {
                continue;
            }
            let nonce = match nonce {
                Some(n) => n,
                // Nonce assignment failed upstream; later items cannot move
                None => break,
            };
            if status == PubTxStatus::Suspended {
                continue;
            }
            if let Some(gate) = gate {
                if nonce > gate {
                    debug!(
                        "Orchestrator {:?} holding nonce {} behind suspended nonce {}",
                        self.signer, nonce, gate
                    );
                    break;
                }
            }

            let stuck = broadcast_at
                .map(|at| at.elapsed() >= self.cfg.resubmit_interval())
                .unwrap_or(status == PubTxStatus::Submitted);
            let wants_broadcast = match status {
                PubTxStatus::Pending => broadcast_at.is_none(),
                PubTxStatus::Submitted => needs_rebroadcast || stuck,
                _ => false,
            };
            if !wants_broadcast {
                progressed = true;
                continue;
            }

            match self
                .broadcast_one(state, idx, id, nonce, stored_price, needs_rebroadcast || stuck)
                .await?
            {
                BroadcastStep::Sent => progressed = true,
                // This nonce never reached the mempool; nothing later may be
                // broadcast ahead of it
                BroadcastStep::FailedAttempt | BroadcastStep::Blocked => break,
            }
        }

        Ok(progressed)
    }

    async fn broadcast_one(
        &self,
        state: &mut ProcState,
        idx: usize,
        id: crate::types::TxId,
        nonce: u64,
        stored_price: Option<GasPrice>,
        replacing: bool,
    ) -> EngineResult<BroadcastStep> {
        let snapshot = match self.ctx.gas.current_price().await {
            Ok(s) => s,
            Err(e) => {
                debug!("Gas price unavailable, deferring broadcast: {}", e);
                return Ok(BroadcastStep::Blocked);
            }
        };

        let pricing = match &stored_price {
            None => snapshot.price.clone(),
            Some(stored) => {
                if replacing || stored.below_by_percent(&snapshot.price, self.cfg.replacement_percent)
                {
                    // The mempool replacement policy wants at least a 10%
                    // bump over what it already holds
                    stored
                        .increased(self.cfg.replacement_percent.max(10))
                        .max(&snapshot.price)
                } else {
                    stored.clone()
                }
            }
        };

        let (value, gas_limit, to, data) = {
            let tx = &state.queue[idx].tx;
            (tx.value, tx.gas_limit, tx.to, tx.data.clone())
        };

        // Callers may leave the limit to us; an estimate that reverts is a
        // real rejection, not a transient fault
        let gas_limit = if gas_limit.is_zero() {
            let probe = self.build_typed_tx(to, data.clone(), value, U256::zero(), nonce, &pricing);
            match self.ctx.ledger.estimate_gas(&probe).await {
                Ok(estimated) => estimated + estimated / 5,
                Err(e) => {
                    let message = e.to_string();
                    if classify_rejection(&message) == RejectionClass::Reverted {
                        self.record_failed_attempt(state, idx, RejectionClass::Reverted, &message)
                            .await?;
                        return Ok(BroadcastStep::FailedAttempt);
                    }
                    debug!("Gas estimate unavailable, deferring broadcast: {}", e);
                    return Ok(BroadcastStep::Blocked);
                }
            }
        } else {
            gas_limit
        };

        // Floor needed to submit: value plus worst-case gas cost
        let required = value + pricing.max_cost(gas_limit);
        if let Some(fueling) = &self.ctx.fueling {
            if self.signer != fueling.source_address() {
                let balance = self.ctx.ledger.get_balance(self.signer).await?;
                if balance < required {
                    let shortfall = required - balance;
                    info!(
                        "Orchestrator {:?} balance {} below floor {}, requesting fueling",
                        self.signer, balance, required
                    );
                    fueling.ensure_fueled(self.signer, shortfall).await?;
                    return Ok(BroadcastStep::Blocked);
                }
            }
        }

        let typed_tx = self.build_typed_tx(to, data, value, gas_limit, nonce, &pricing);
        let raw = self.ctx.keys.sign_transaction(self.signer, &typed_tx).await?;
        trace!("Signed payload for nonce {}: 0x{}", nonce, hex::encode(&raw));
        // The hash is deterministic from the signed payload, so it is known
        // even when the broadcast outcome is not
        let tx_hash = H256::from(keccak256(&raw));

        let attempts = state.queue[idx].tx.attempt_count;
        let send = timeout(
            self.cfg.broadcast_timeout(),
            self.ctx.ledger.send_raw_transaction(raw),
        )
        .await;

        match send {
            Ok(Ok(hash)) => {
                self.finish_broadcast(state, idx, hash, &pricing, attempts).await?;
                Ok(BroadcastStep::Sent)
            }
            Ok(Err(EngineError::Broadcast(message))) => {
                let class = classify_rejection(&message);
                if class.is_benign() {
                    // Mempool already holds it (or it was mined); proceed to
                    // confirmation tracking under the deterministic hash
                    debug!(
                        "Benign rejection for nonce {} ({:?}): {}",
                        nonce, class, message
                    );
                    self.finish_broadcast(state, idx, tx_hash, &pricing, attempts).await?;
                    Ok(BroadcastStep::Sent)
                } else if class == RejectionClass::Transient {
                    debug!("Transient broadcast error for nonce {}: {}", nonce, message);
                    Ok(BroadcastStep::Blocked)
                } else {
                    self.record_failed_attempt(state, idx, class, &message).await?;
                    Ok(BroadcastStep::FailedAttempt)
                }
            }
            Ok(Err(e)) if e.is_retryable() => {
                debug!("Transient ledger error for nonce {}: {}", nonce, e);
                Ok(BroadcastStep::Blocked)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Broadcast deadline expired: outcome unknown, watch the
                // deterministic hash and let confirmation or a later
                // re-broadcast decide
                warn!(
                    "Broadcast deadline expired for nonce {} of {:?}",
                    nonce, self.signer
                );
                self.finish_broadcast(state, idx, tx_hash, &pricing, attempts).await?;
                Ok(BroadcastStep::Sent)
            }
        }
    }

    async fn finish_broadcast(
        &self,
        state: &mut ProcState,
        idx: usize,
        hash: H256,
        pricing: &GasPrice,
        attempts: u32,
    ) -> EngineResult<()> {
        let id = state.queue[idx].tx.id;
        self.ctx
            .retry
            .with_retry(&self.shutdown, "record broadcast", || {
                self.ctx.store.record_broadcast(&id, hash, pricing, attempts)
            })
            .await?;

        let item = &mut state.queue[idx];
        // A replacement supersedes the previous hash for this nonce
        if let Some(old) = item.watched_hash {
            if old != hash {
                self.ctx.tracker.unwatch(&old);
            }
        }
        self.ctx.tracker.watch(
            hash,
            item.tx.id,
            self.signer,
            item.tx.nonce.unwrap_or_default(),
            self.notice_tx.clone(),
        );

        item.tx.status = PubTxStatus::Submitted;
        item.tx.gas_price = Some(pricing.clone());
        item.tx.last_hash = Some(hash);
        item.watched_hash = Some(hash);
        item.broadcast_at = Some(Instant::now());
        item.needs_rebroadcast = false;

        crate::metrics::record_tx_submitted();
        info!(
            "Broadcast nonce {} for {:?} as {:?}",
            item.tx.nonce.unwrap_or_default(),
            self.signer,
            hash
        );
        Ok(())
    }

    async fn record_failed_attempt(
        &self,
        state: &mut ProcState,
        idx: usize,
        class: RejectionClass,
        message: &str,
    ) -> EngineResult<()> {
        let error_kind = match class {
            RejectionClass::InsufficientFunds => TxErrorKind::InsufficientFunds,
            RejectionClass::Underpriced => TxErrorKind::Underpriced,
            RejectionClass::Reverted => TxErrorKind::Reverted,
            _ => TxErrorKind::Rejected,
        };

        let (id, attempts, status) = {
            let item = &state.queue[idx];
            (item.tx.id, item.tx.attempt_count + 1, item.tx.status)
        };

        let (new_status, suspend) = if attempts >= self.cfg.max_attempts {
            (PubTxStatus::Suspended, true)
        } else {
            (status, false)
        };

        warn!(
            "Broadcast attempt {} for transaction {} failed ({:?}): {}",
            attempts, id, class, message
        );

        self.ctx
            .retry
            .with_retry(&self.shutdown, "record failed attempt", || {
                self.ctx.store.update_status(
                    &id,
                    new_status,
                    StatusUpdate {
                        error: Some(error_kind),
                        attempt_count: Some(attempts),
                        last_hash: None,
                    },
                )
            })
            .await?;

        let item = &mut state.queue[idx];
        item.tx.attempt_count = attempts;
        item.tx.last_error = Some(error_kind);
        item.tx.status = new_status;

        if suspend {
            crate::metrics::record_tx_suspended();
            warn!(
                "Transaction {} suspended after {} attempts",
                id, attempts
            );
        }
        Ok(())
    }

    fn build_typed_tx(
        &self,
        to: Option<Address>,
        data: Bytes,
        value: U256,
        gas_limit: U256,
        nonce: u64,
        pricing: &GasPrice,
    ) -> TypedTransaction {
        match pricing {
            GasPrice::Legacy { gas_price } => {
                let mut tx = TransactionRequest::new()
                    .data(data)
                    .value(value)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*gas_price)
                    .chain_id(self.ctx.chain_id);
                if let Some(to) = to {
                    tx = tx.to(to);
                }
                TypedTransaction::Legacy(tx)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut tx = Eip1559TransactionRequest::new()
                    .data(data)
                    .value(value)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(self.ctx.chain_id);
                if let Some(to) = to {
                    tx = tx.to(to);
                }
                TypedTransaction::Eip1559(tx)
            }
        }
    }

    /// React to a confirmation tracker notice
    async fn handle_notice(
        &self,
        state: &mut ProcState,
        notice: ConfirmationNotice,
    ) -> EngineResult<()> {
        match notice.event {
            TrackerEvent::Mined(receipt) => {
                state.buffered_receipts.insert(
                    notice.nonce,
                    ReceiptRecord {
                        tx_id: notice.tx_id,
                        signer: notice.signer,
                        nonce: notice.nonce,
                        hash: notice.hash,
                        success: receipt.success,
                        block_number: receipt.block_number,
                        block_hash: receipt.block_hash,
                    },
                );
                self.drain_receipts(state).await?;
            }
            TrackerEvent::Finalized(receipt) => {
                state.pending_final.insert(
                    notice.nonce,
                    ReceiptRecord {
                        tx_id: notice.tx_id,
                        signer: notice.signer,
                        nonce: notice.nonce,
                        hash: notice.hash,
                        success: receipt.success,
                        block_number: receipt.block_number,
                        block_hash: receipt.block_hash,
                    },
                );
                // Finality implies the receipt was seen; make sure it is in
                // the drain set even if the Mined notice was missed
                state.buffered_receipts.entry(notice.nonce).or_insert(ReceiptRecord {
                    tx_id: notice.tx_id,
                    signer: notice.signer,
                    nonce: notice.nonce,
                    hash: notice.hash,
                    success: receipt.success,
                    block_number: receipt.block_number,
                    block_hash: receipt.block_hash,
                });
                self.drain_receipts(state).await?;
            }
            TrackerEvent::Reorged => {
                self.handle_reorg(state, notice).await?;
            }
        }
        Ok(())
    }

    /// Persist buffered receipts strictly in nonce order. A receipt for a
    /// higher nonce implies every lower nonce is also terminal on the
    /// ledger, so gaps are resolved by receipt lookup or by implication.
    async fn drain_receipts(&self, state: &mut ProcState) -> EngineResult<()> {
        loop {
            let (&lowest, _) = match state.buffered_receipts.iter().next() {
                Some(entry) => entry,
                None => break,
            };

            // Already persisted (a Finalized notice repeats the receipt)
            let already_done = state
                .queue
                .iter()
                .any(|i| i.tx.nonce == Some(lowest) && i.terminal)
                || !state.queue.iter().any(|i| i.tx.nonce == Some(lowest));
            if already_done {
                state.buffered_receipts.remove(&lowest);
                continue;
            }

            // A lower, still-open nonce blocks this receipt
            let blocker = state
                .queue
                .iter()
                .filter(|i| !i.terminal)
                .filter_map(|i| i.tx.nonce.map(|n| (n, i.tx.id, i.tx.last_hash)))
                .filter(|(n, _, _)| *n < lowest)
                .min_by_key(|(n, _, _)| *n);

            match blocker {
                None => {
                    let record = state.buffered_receipts.remove(&lowest).unwrap();
                    self.persist_terminal(state, record).await?;
                }
                Some((blocked_nonce, blocked_id, last_hash)) => {
                    // The ledger mined a higher nonce, so this one is mined
                    // too; its receipt may live under a superseded hash
                    let fetched = match last_hash {
                        Some(hash) => self.ctx.ledger.get_receipt(hash).await?,
                        None => None,
                    };
                    match fetched {
                        Some(receipt) => {
                            state.buffered_receipts.insert(
                                blocked_nonce,
                                ReceiptRecord {
                                    tx_id: blocked_id,
                                    signer: self.signer,
                                    nonce: blocked_nonce,
                                    hash: receipt.tx_hash,
                                    success: receipt.success,
                                    block_number: receipt.block_number,
                                    block_hash: receipt.block_hash,
                                },
                            );
                        }
                        None => {
                            // No receipt under any hash we know: a superseded
                            // broadcast carried it. Close it out as succeeded
                            // so the sequence can advance.
                            self.ctx
                                .retry
                                .with_retry(&self.shutdown, "close superseded nonce", || {
                                    self.ctx.store.update_status(
                                        &blocked_id,
                                        PubTxStatus::Succeeded,
                                        StatusUpdate::default(),
                                    )
                                })
                                .await?;
                            self.ctx.completed.promote(self.signer, blocked_nonce);
                            if let Some(item) = state.find_by_id(&blocked_id) {
                                if let Some(hash) = item.watched_hash.take() {
                                    self.ctx.tracker.unwatch(&hash);
                                }
                            }
                            // No watch remains, so no finality notice will
                            // release this slot later
                            state.queue.retain(|i| i.tx.id != blocked_id);
                        }
                    }
                }
            }
        }

        // Release queue slots for transactions whose finality has landed
        let final_nonces: Vec<u64> = state
            .pending_final
            .keys()
            .copied()
            .filter(|n| {
                state
                    .queue
                    .iter()
                    .any(|i| i.tx.nonce == Some(*n) && i.terminal)
            })
            .collect();
        for nonce in final_nonces {
            let record = state.pending_final.remove(&nonce).unwrap();
            self.publish_outcome(&record);
            state.queue.retain(|i| i.tx.id != record.tx_id);
        }
        self.in_flight_count.store(state.queue.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn persist_terminal(
        &self,
        state: &mut ProcState,
        record: ReceiptRecord,
    ) -> EngineResult<()> {
        self.ctx
            .retry
            .with_retry(&self.shutdown, "record receipt", || {
                self.ctx.store.record_receipt(&record)
            })
            .await?;

        self.ctx.completed.promote(record.signer, record.nonce);

        if record.success {
            crate::metrics::record_tx_confirmed();
        } else {
            crate::metrics::record_tx_failed();
        }

        if let Some(item) = state.find_by_id(&record.tx_id) {
            item.terminal = true;
            item.tx.status = if record.success {
                PubTxStatus::Succeeded
            } else {
                PubTxStatus::Failed
            };
        }

        info!(
            "Transaction {} nonce {} {} at block {}",
            record.tx_id,
            record.nonce,
            if record.success { "succeeded" } else { "failed" },
            record.block_number
        );
        Ok(())
    }

    async fn handle_reorg(
        &self,
        state: &mut ProcState,
        notice: ConfirmationNotice,
    ) -> EngineResult<()> {
        warn!(
            "Reorg dropped receipt for transaction {} nonce {}",
            notice.tx_id, notice.nonce
        );
        state.buffered_receipts.remove(&notice.nonce);
        state.pending_final.remove(&notice.nonce);

        let was_terminal = state
            .find_by_id(&notice.tx_id)
            .map(|i| i.terminal)
            .unwrap_or(false);

        if was_terminal {
            // The terminal status was persisted below threshold depth;
            // un-mark it. The completed-nonce watermark is monotonic and is
            // deliberately not rolled back.
            self.ctx
                .retry
                .with_retry(&self.shutdown, "reopen reorged transaction", || {
                    self.ctx.store.reopen_transaction(&notice.tx_id)
                })
                .await?;
        }

        if let Some(item) = state.find_by_id(&notice.tx_id) {
            item.terminal = false;
            item.tx.status = PubTxStatus::Submitted;
            item.needs_rebroadcast = true;
            item.broadcast_at = None;
        }
        self.stale_notify.notify_one();
        Ok(())
    }

    fn publish_outcome(&self, record: &ReceiptRecord) {
        let status = if record.success {
            PubTxStatus::Succeeded
        } else {
            PubTxStatus::Failed
        };
        self.ctx.dispatcher.publish(TxOutcomeEvent {
            tx_id: record.tx_id,
            signer: record.signer,
            nonce: record.nonce,
            status,
            hash: Some(record.hash),
            block_number: Some(record.block_number),
            error: (!record.success).then_some(TxErrorKind::Reverted),
        });
    }
}

enum BroadcastStep {
    /// Broadcast recorded (or treated as such); later nonces may proceed
    Sent,
    /// Rejected with an attempt consumed; later nonces wait for it
    FailedAttempt,
    /// Nothing past this point can move this tick
    Blocked,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockEvent, ReceiptInfo};
    use crate::config::RetryConfig;
    use crate::keystore::{KeyStoreListable, LocalKeyStore};
    use crate::store::InMemoryTxStore;
    use crate::testutil::MockLedger;
    use ethers::signers::LocalWallet;

    struct Harness {
        store: Arc<InMemoryTxStore>,
        ledger: Arc<MockLedger>,
        tracker: Arc<ConfirmationTracker>,
        completed: Arc<CompletedNonceCache>,
        dispatcher: Arc<EventDispatcher>,
        orchestrator: Arc<Orchestrator>,
        signer: Address,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn harness_with(
        ledger_nonce: u64,
        cfg: OrchestratorConfig,
        fueling_source: Option<Address>,
    ) -> Harness {
        let store: Arc<InMemoryTxStore> = Arc::new(InMemoryTxStore::new());
        let ledger = MockLedger::new(ledger_nonce);
        let wallet = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        let keys = Arc::new(LocalKeyStore::from_wallets(vec![wallet], 1));
        let signer = keys.list_addresses()[0];
        let completed = Arc::new(CompletedNonceCache::new());
        let dispatcher = EventDispatcher::new();
        let tracker = Arc::new(ConfirmationTracker::new(ledger.clone(), 3));
        let gas = Arc::new(GasPriceOracle::new(
            ledger.clone(),
            std::time::Duration::from_millis(0),
        ));
        let fueling = fueling_source.map(|source| {
            let fueling_store: Arc<dyn TransactionStore> = store.clone();
            Arc::new(FuelingManager::new(
                fueling_store,
                completed.clone(),
                source,
                U256::from(21_000u64),
            ))
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = OrchestratorContext {
            store: store.clone(),
            ledger: ledger.clone(),
            keys,
            gas,
            fueling,
            tracker: tracker.clone(),
            completed: completed.clone(),
            dispatcher: dispatcher.clone(),
            retry: RetryPolicy::new(&RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 4,
                factor: 2.0,
            }),
            chain_id: 1,
        };

        let orchestrator = Orchestrator::new(signer, cfg, ctx, shutdown_rx);

        Harness {
            store,
            ledger,
            tracker,
            completed,
            dispatcher,
            orchestrator,
            signer,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn harness(ledger_nonce: u64) -> Harness {
        harness_with(ledger_nonce, OrchestratorConfig::default(), None)
    }

    impl Harness {
        async fn enqueue(&self, value: U256) -> crate::types::TxId {
            let tx = PublicTransaction::new(
                self.signer,
                Some(Address::random()),
                Bytes::default(),
                value,
                U256::from(21_000u64),
            );
            let id = tx.id;
            self.store.insert_transaction(&tx).await.unwrap();
            id
        }

        /// Pull tracker notices into the orchestrator synchronously
        async fn pump_notices(&self, state: &mut ProcState) {
            let mut rx = self.orchestrator.notice_rx.lock().unwrap().take().unwrap();
            while let Ok(notice) = rx.try_recv() {
                self.orchestrator
                    .handle_notice(state, notice)
                    .await
                    .unwrap();
            }
            *self.orchestrator.notice_rx.lock().unwrap() = Some(rx);
        }
    }

    #[tokio::test]
    async fn test_happy_path_assigns_nonce_and_confirms() {
        let h = harness(5);
        let id = h.enqueue(U256::zero()).await;

        let mut sub = h.dispatcher.subscribe();
        let mut state = ProcState::new();
        h.orchestrator.process_tick(&mut state).await.unwrap();

        // Nonce 5 assigned (the ledger reports 5 as next) and broadcast
        let row = h.store.get_transaction(&id).await.unwrap().unwrap();
        assert_eq!(row.nonce, Some(5));
        assert_eq!(row.status, PubTxStatus::Submitted);
        let hash = row.last_hash.unwrap();
        assert_eq!(h.tracker.watched_count(), 1);

        // Receipt at block 100 with status 1, then three confirmations
        let block_hash = H256::random();
        h.ledger.add_receipt(hash, true, 100, block_hash);
        let b100 = BlockEvent {
            number: 100,
            hash: block_hash,
            parent_hash: H256::random(),
        };
        h.tracker.process_block(&b100).await;
        let b101 = BlockEvent {
            number: 101,
            hash: H256::random(),
            parent_hash: block_hash,
        };
        h.tracker.process_block(&b101).await;
        let b102 = BlockEvent {
            number: 102,
            hash: H256::random(),
            parent_hash: b101.hash,
        };
        h.tracker.process_block(&b102).await;

        h.pump_notices(&mut state).await;

        let row = h.store.get_transaction(&id).await.unwrap().unwrap();
        assert_eq!(row.status, PubTxStatus::Succeeded);
        assert_eq!(h.completed.get(h.signer), Some(5));
        assert!(state.queue.is_empty());

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.event.tx_id, id);
        assert_eq!(delivery.event.nonce, 5);
        assert_eq!(delivery.event.block_number, Some(100));
        delivery.ack();
    }

    #[tokio::test]
    async fn test_receipts_persisted_in_nonce_order() {
        let h = harness(5);
        let id_low = h.enqueue(U256::zero()).await;
        let id_high = h.enqueue(U256::zero()).await;

        let mut state = ProcState::new();
        h.orchestrator.process_tick(&mut state).await.unwrap();
        assert_eq!(h.ledger.sent_count(), 2);

        let low_hash = h
            .store
            .get_transaction(&id_low)
            .await
            .unwrap()
            .unwrap()
            .last_hash
            .unwrap();
        let high_hash = h
            .store
            .get_transaction(&id_high)
            .await
            .unwrap()
            .unwrap()
            .last_hash
            .unwrap();

        // Both receipts exist but only the higher nonce is reported first
        let block_hash = H256::random();
        h.ledger.add_receipt(low_hash, true, 100, block_hash);
        h.ledger.add_receipt(high_hash, true, 100, block_hash);

        let notice = ConfirmationNotice {
            tx_id: id_high,
            signer: h.signer,
            nonce: 6,
            hash: high_hash,
            event: TrackerEvent::Mined(ReceiptInfo {
                tx_hash: high_hash,
                success: true,
                block_number: 100,
                block_hash,
            }),
        };
        h.orchestrator
            .handle_notice(&mut state, notice)
            .await
            .unwrap();

        // The gap was resolved by looking up nonce 5's receipt; both are
        // terminal and the watermark is at the higher nonce
        let low = h.store.get_transaction(&id_low).await.unwrap().unwrap();
        let high = h.store.get_transaction(&id_high).await.unwrap().unwrap();
        assert_eq!(low.status, PubTxStatus::Succeeded);
        assert_eq!(high.status, PubTxStatus::Succeeded);
        assert_eq!(h.completed.get(h.signer), Some(6));
    }

    #[tokio::test]
    async fn test_attempt_saturation_suspends_and_gates_successors() {
        let cfg = OrchestratorConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let h = harness_with(5, cfg, None);
        let id_first = h.enqueue(U256::zero()).await;
        let _id_second = h.enqueue(U256::zero()).await;

        h.ledger.set_broadcast_error(Some("execution reverted: bad call"));

        let mut state = ProcState::new();
        h.orchestrator.process_tick(&mut state).await.unwrap();
        h.orchestrator.process_tick(&mut state).await.unwrap();

        let first = h.store.get_transaction(&id_first).await.unwrap().unwrap();
        assert_eq!(first.status, PubTxStatus::Suspended);
        assert_eq!(first.attempt_count, 2);
        assert_eq!(first.last_error, Some(TxErrorKind::Reverted));

        // With the default gap of 1 the successor nonce must not have been
        // broadcast
        assert_eq!(h.ledger.sent_count(), 0);
        assert!(h.orchestrator.fully_suspended(&state));
        assert_eq!(h.orchestrator.state(), OrchestratorState::Stale);
    }

    #[tokio::test]
    async fn test_benign_rejection_proceeds_to_tracking() {
        let h = harness(5);
        let id = h.enqueue(U256::zero()).await;

        h.ledger.set_broadcast_error(Some("already known"));

        let mut state = ProcState::new();
        h.orchestrator.process_tick(&mut state).await.unwrap();

        let row = h.store.get_transaction(&id).await.unwrap().unwrap();
        assert_eq!(row.status, PubTxStatus::Submitted);
        assert_eq!(row.attempt_count, 0);
        assert!(row.last_hash.is_some());
        assert_eq!(h.tracker.watched_count(), 1);
    }

    #[tokio::test]
    async fn test_low_balance_requests_fueling_once() {
        let source = Address::random();
        let h = harness_with(5, OrchestratorConfig::default(), Some(source));
        h.enqueue(U256::from(1_000u64)).await;
        *h.ledger.balance.lock().unwrap() = U256::zero();

        let mut state = ProcState::new();
        h.orchestrator.process_tick(&mut state).await.unwrap();
        h.orchestrator.process_tick(&mut state).await.unwrap();

        // Nothing broadcast, exactly one fueling transaction enqueued
        assert_eq!(h.ledger.sent_count(), 0);
        let fuelings = h
            .store
            .list_transactions(&TxFilter {
                from: Some(source),
                has_value: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fuelings.len(), 1);
        assert_eq!(fuelings[0].to, Some(h.signer));
    }

    #[tokio::test]
    async fn test_reorg_returns_transaction_to_in_flight() {
        let h = harness(5);
        let id = h.enqueue(U256::zero()).await;

        let mut state = ProcState::new();
        h.orchestrator.process_tick(&mut state).await.unwrap();
        let first_hash = h
            .store
            .get_transaction(&id)
            .await
            .unwrap()
            .unwrap()
            .last_hash
            .unwrap();

        // Mined below threshold depth: marked Succeeded, still watched
        let block_hash = H256::random();
        h.orchestrator
            .handle_notice(
                &mut state,
                ConfirmationNotice {
                    tx_id: id,
                    signer: h.signer,
                    nonce: 5,
                    hash: first_hash,
                    event: TrackerEvent::Mined(ReceiptInfo {
                        tx_hash: first_hash,
                        success: true,
                        block_number: 100,
                        block_hash,
                    }),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            h.store.get_transaction(&id).await.unwrap().unwrap().status,
            PubTxStatus::Succeeded
        );
        assert_eq!(h.completed.get(h.signer), Some(5));

        // Reorg drops block 100 before threshold depth
        h.orchestrator
            .handle_notice(
                &mut state,
                ConfirmationNotice {
                    tx_id: id,
                    signer: h.signer,
                    nonce: 5,
                    hash: first_hash,
                    event: TrackerEvent::Reorged,
                },
            )
            .await
            .unwrap();

        let row = h.store.get_transaction(&id).await.unwrap().unwrap();
        assert_eq!(row.status, PubTxStatus::Submitted);
        // The watermark is monotonic and survives the rollback
        assert_eq!(h.completed.get(h.signer), Some(5));

        // Next tick re-broadcasts with a bumped fee
        h.orchestrator.process_tick(&mut state).await.unwrap();
        assert_eq!(h.ledger.sent_count(), 2);
        let row = h.store.get_transaction(&id).await.unwrap().unwrap();
        assert_eq!(row.status, PubTxStatus::Submitted);
        assert_ne!(row.last_hash, Some(first_hash));
        match row.gas_price.unwrap() {
            GasPrice::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => assert!(max_priority_fee_per_gas > U256::from(10u64)),
            other => panic!("unexpected pricing {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_then_stale_when_no_work() {
        let cfg = OrchestratorConfig {
            empty_ticks_to_stale: 1,
            ..Default::default()
        };
        let h = harness_with(0, cfg, None);
        let id = h.enqueue(U256::zero()).await;

        let mut state = ProcState::new();
        h.orchestrator.process_tick(&mut state).await.unwrap();
        assert_eq!(h.orchestrator.state(), OrchestratorState::Running);

        // Finish the only transaction
        let hash = h
            .store
            .get_transaction(&id)
            .await
            .unwrap()
            .unwrap()
            .last_hash
            .unwrap();
        let block_hash = H256::random();
        h.orchestrator
            .handle_notice(
                &mut state,
                ConfirmationNotice {
                    tx_id: id,
                    signer: h.signer,
                    nonce: 0,
                    hash,
                    event: TrackerEvent::Finalized(ReceiptInfo {
                        tx_hash: hash,
                        success: true,
                        block_number: 10,
                        block_hash,
                    }),
                },
            )
            .await
            .unwrap();

        h.orchestrator.process_tick(&mut state).await.unwrap();
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        h.orchestrator.process_tick(&mut state).await.unwrap();
        h.orchestrator.process_tick(&mut state).await.unwrap();
        assert_eq!(h.orchestrator.state(), OrchestratorState::Stale);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_observed_async() {
        let cfg = OrchestratorConfig {
            interval_ms: 5,
            ..Default::default()
        };
        let h = harness_with(0, cfg, None);
        h.orchestrator.start();

        assert_ne!(h.orchestrator.state(), OrchestratorState::Stopped);
        h.orchestrator.stop();
        h.orchestrator.stop();

        for _ in 0..100 {
            if h.orchestrator.state() == OrchestratorState::Stopped {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("orchestrator did not reach Stopped");
    }
}
