//! Top-level checkout controller.
//!
//! Owns the draft and the selected payment method, decides when an order
//! may be created, and starts the card or bank-transfer paths. The gateway
//! return is handled by [`GatewayReturnHandler`], which picks up the pending
//! card order from session storage after the round trip.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::checkout::address::{
    AddressResolver, ManualAddressInput, RegionDirectory, SavedAddress,
};
use crate::checkout::model::{
    CartSnapshot, CustomerContext, OrderDraft, OrderPaymentStatus, OrderReceipt, OrderTotals,
    PaymentMethod,
};
use crate::checkout::order_ref::{BuyNowStore, OrderRefManager};
use crate::checkout::payment_session::{
    PaymentSessionController, SessionDeps, SessionFinalizer, SessionSnapshot, SessionStatus,
};
use crate::checkout::session_store::{SessionStore, SessionStoreExt};
use crate::checkout::submitter::{
    AddressBook, CardPaymentConfirmation, CartStore, OrderAck, OrderService, OrderSubmitter,
    SubmitContext,
};
use crate::config::CheckoutConfig;
use crate::errors::{FieldErrors, ServiceError};
use crate::events::{Event, EventSender};
use crate::payments::card::{CardCheck, CardInput};
use crate::payments::gateway::{
    GatewayParams, GatewaySigner, GatewayVerifier, PaymentRedirect, PaymentRequest,
};
use crate::payments::status::{ConfirmationHeuristic, PaymentStatusClient};

pub const PENDING_CARD_ORDER_KEY: &str = "checkout.pending_card_order";

/// External collaborators of a checkout.
#[derive(Clone)]
pub struct CheckoutDeps {
    pub session_store: Arc<dyn SessionStore>,
    pub cart: Arc<dyn CartStore>,
    pub address_book: Arc<dyn AddressBook>,
    pub regions: Arc<dyn RegionDirectory>,
    pub orders: Arc<dyn OrderService>,
    pub status_client: Arc<dyn PaymentStatusClient>,
    /// Consulted only when degraded confirmation is enabled.
    pub heuristic: Option<Arc<dyn ConfirmationHeuristic>>,
    pub events: Option<EventSender>,
}

impl CheckoutDeps {
    fn submitter(&self) -> OrderSubmitter {
        OrderSubmitter::new(
            self.orders.clone(),
            self.cart.clone(),
            self.address_book.clone(),
            BuyNowStore::new(self.session_store.clone()),
            self.events.clone(),
        )
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

/// Whether "place order" is available, and why not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderGate {
    Ready,
    Blocked(String),
}

impl OrderGate {
    pub fn is_ready(&self) -> bool {
        matches!(self, OrderGate::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceOrderOutcome {
    /// The order exists; show the confirmation view.
    Submitted(OrderReceipt),
    /// A `pending_payment` order exists; send the shopper to the gateway.
    RedirectToGateway {
        order_number: String,
        redirect: PaymentRedirect,
    },
}

/// What survives the gateway round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingCardOrder {
    order_ref: String,
    order_number: String,
    draft: OrderDraft,
    context: SubmitContext,
}

struct CheckoutState {
    customer: CustomerContext,
    method: PaymentMethod,
    address: AddressResolver,
    card: CardInput,
    note: Option<String>,
    receipt: Option<OrderReceipt>,
    pending_redirect: Option<PlaceOrderOutcome>,
    submitting: bool,
    abandoned: bool,
}

enum Prepared {
    Done(PlaceOrderOutcome),
    Draft(OrderDraft, SubmitContext),
}

struct CheckoutInner {
    config: CheckoutConfig,
    deps: CheckoutDeps,
    snapshot: CartSnapshot,
    order_ref: String,
    order_refs: OrderRefManager,
    buy_now: BuyNowStore,
    submitter: OrderSubmitter,
    signer: GatewaySigner,
    state: Mutex<CheckoutState>,
    session: Mutex<Option<Arc<PaymentSessionController>>>,
}

impl CheckoutInner {
    fn lock_state(&self) -> MutexGuard<'_, CheckoutState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Arc<PaymentSessionController>>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_session(&self) -> Option<Arc<PaymentSessionController>> {
        self.lock_session().clone()
    }

    fn totals(&self) -> OrderTotals {
        OrderTotals::compute(&self.snapshot, &self.config.shipping)
    }

    fn gate(&self, state: &CheckoutState, session: Option<SessionStatus>) -> OrderGate {
        if state.abandoned {
            return OrderGate::Blocked("This checkout was abandoned".to_string());
        }
        if state.receipt.is_some() {
            return OrderGate::Blocked("This order has already been placed".to_string());
        }
        if self.snapshot.is_empty() {
            return OrderGate::Blocked("Your cart is empty".to_string());
        }
        match state.method {
            PaymentMethod::Cod => OrderGate::Ready,
            PaymentMethod::BankTransfer => match session {
                Some(SessionStatus::Confirmed) => OrderGate::Ready,
                Some(SessionStatus::Failed) => OrderGate::Blocked(
                    "The transfer window has expired. Restart the bank transfer or pay on delivery"
                        .to_string(),
                ),
                Some(SessionStatus::Pending) | Some(SessionStatus::Checking) | None => {
                    OrderGate::Blocked(
                        "Complete the bank transfer and wait for confirmation, or tell us you have transferred"
                            .to_string(),
                    )
                }
            },
            PaymentMethod::Card => match state.card.check().first_problem() {
                None => OrderGate::Ready,
                Some(problem) => OrderGate::Blocked(problem.to_string()),
            },
        }
    }

    fn prepare(&self, session: Option<SessionStatus>) -> Result<Prepared, ServiceError> {
        let mut state = self.lock_state();
        if let Some(receipt) = &state.receipt {
            return Ok(Prepared::Done(PlaceOrderOutcome::Submitted(receipt.clone())));
        }
        if state.method == PaymentMethod::Card {
            if let Some(pending) = &state.pending_redirect {
                return Ok(Prepared::Done(pending.clone()));
            }
        }
        if state.submitting {
            return Err(ServiceError::InvalidOperation(
                "Your order is already being placed".to_string(),
            ));
        }
        if let OrderGate::Blocked(reason) = self.gate(&state, session) {
            return Err(ServiceError::InvalidOperation(reason));
        }

        let shipping_address = state.address.resolve(self.deps.regions.as_ref())?;
        let totals = self.totals();
        let payment_status = match state.method {
            PaymentMethod::Cod => OrderPaymentStatus::Unpaid,
            PaymentMethod::BankTransfer => OrderPaymentStatus::Paid,
            PaymentMethod::Card => OrderPaymentStatus::PendingPayment,
        };
        let draft = OrderDraft {
            order_ref: self.order_ref.clone(),
            items: self.snapshot.lines().to_vec(),
            note: state
                .note
                .clone()
                .or_else(|| shipping_address.note.clone()),
            shipping_address,
            payment_method: state.method,
            payment_status,
            subtotal: totals.subtotal,
            shipping_fee: totals.shipping_fee,
            total: totals.total,
        };
        let ctx = SubmitContext {
            customer: state.customer.clone(),
            used_saved_address: state.address.is_saved(),
            mode: self.snapshot.mode(),
        };
        state.submitting = true;
        Ok(Prepared::Draft(draft, ctx))
    }

    async fn place(&self) -> Result<PlaceOrderOutcome, ServiceError> {
        let session = self.current_session().map(|s| s.status());
        let (draft, ctx) = match self.prepare(session)? {
            Prepared::Done(outcome) => return Ok(outcome),
            Prepared::Draft(draft, ctx) => (draft, ctx),
        };

        let result = match draft.payment_method {
            PaymentMethod::Card => self.start_card_payment(draft, ctx).await,
            PaymentMethod::Cod | PaymentMethod::BankTransfer => self
                .submitter
                .submit(&draft, &ctx)
                .await
                .map(PlaceOrderOutcome::Submitted),
        };

        let acknowledged = {
            let mut state = self.lock_state();
            state.submitting = false;
            match &result {
                Ok(PlaceOrderOutcome::Submitted(receipt)) => {
                    state.receipt = Some(receipt.clone());
                    true
                }
                Ok(redirect) => {
                    state.pending_redirect = Some(redirect.clone());
                    false
                }
                Err(_) => false,
            }
        };
        if acknowledged {
            self.order_refs.clear();
        }
        result
    }

    async fn start_card_payment(
        &self,
        draft: OrderDraft,
        context: SubmitContext,
    ) -> Result<PlaceOrderOutcome, ServiceError> {
        let ack = self.submitter.create(&draft).await?;

        let pending = PendingCardOrder {
            order_ref: draft.order_ref.clone(),
            order_number: ack.order_number.clone(),
            draft,
            context,
        };
        self.deps
            .session_store
            .set_json(PENDING_CARD_ORDER_KEY, &pending)?;

        let request = PaymentRequest::new(
            pending.order_ref.clone(),
            pending.draft.total,
            format!("Payment for order {}", pending.order_ref),
        );
        let redirect = self.signer.redirect(&request)?;
        info!(order_ref = %pending.order_ref, order_number = %ack.order_number, "redirecting to card gateway");

        self.deps.emit(Event::CardOrderPending {
            order_ref: pending.order_ref.clone(),
            order_number: ack.order_number.clone(),
        });
        Ok(PlaceOrderOutcome::RedirectToGateway {
            order_number: ack.order_number,
            redirect,
        })
    }
}

/// Lets a confirmed bank-transfer session create the order without owning
/// the checkout.
struct TransferFinalizer {
    checkout: Weak<CheckoutInner>,
}

#[async_trait]
impl SessionFinalizer for TransferFinalizer {
    async fn finalize(&self, order_ref: &str) -> Result<String, ServiceError> {
        let checkout = self.checkout.upgrade().ok_or_else(|| {
            ServiceError::InvalidOperation("The checkout is no longer active".to_string())
        })?;
        if checkout.order_ref != order_ref {
            return Err(ServiceError::InvalidOperation(format!(
                "Confirmed transfer {} does not belong to this checkout",
                order_ref
            )));
        }
        match checkout.place().await? {
            PlaceOrderOutcome::Submitted(receipt) => Ok(receipt.order_number),
            PlaceOrderOutcome::RedirectToGateway { .. } => Err(ServiceError::InvalidOperation(
                "Bank transfer confirmed while card payment is selected".to_string(),
            )),
        }
    }
}

/// One checkout attempt. Dropping it tears down every timer it started.
pub struct CheckoutOrchestrator {
    inner: Arc<CheckoutInner>,
}

impl std::fmt::Debug for CheckoutOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutOrchestrator").finish_non_exhaustive()
    }
}

impl CheckoutOrchestrator {
    /// Enters checkout: captures the buy-now item or the cart, and reuses or
    /// creates the order reference.
    #[instrument(skip_all)]
    pub async fn enter(
        config: CheckoutConfig,
        deps: CheckoutDeps,
        customer: CustomerContext,
        saved_addresses: &[SavedAddress],
    ) -> Result<Self, ServiceError> {
        let buy_now = BuyNowStore::new(deps.session_store.clone());
        let snapshot = match buy_now.snapshot() {
            Some(snapshot) => snapshot,
            None => CartSnapshot::from_cart(deps.cart.lines().await?),
        };
        if snapshot.is_empty() {
            return Err(ServiceError::InvalidOperation("Your cart is empty".to_string()));
        }

        let order_refs = OrderRefManager::new(deps.session_store.clone());
        let order_ref = order_refs.ensure();
        info!(order_ref = %order_ref, mode = ?snapshot.mode(), lines = snapshot.lines().len(), "entered checkout");

        let state = CheckoutState {
            address: AddressResolver::for_customer(&customer, saved_addresses),
            customer,
            method: PaymentMethod::Cod,
            card: CardInput::default(),
            note: None,
            receipt: None,
            pending_redirect: None,
            submitting: false,
            abandoned: false,
        };
        let inner = CheckoutInner {
            signer: GatewaySigner::new(config.gateway.clone()),
            submitter: deps.submitter(),
            config,
            snapshot,
            order_ref,
            order_refs,
            buy_now,
            deps,
            state: Mutex::new(state),
            session: Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn order_ref(&self) -> &str {
        &self.inner.order_ref
    }

    pub fn snapshot(&self) -> &CartSnapshot {
        &self.inner.snapshot
    }

    pub fn totals(&self) -> OrderTotals {
        self.inner.totals()
    }

    pub fn method(&self) -> PaymentMethod {
        self.inner.lock_state().method
    }

    pub fn receipt(&self) -> Option<OrderReceipt> {
        self.inner.lock_state().receipt.clone()
    }

    /// Switches payment method. The previous method's timers are stopped
    /// before anything new starts.
    pub fn select_method(&self, method: PaymentMethod) -> Result<(), ServiceError> {
        {
            let state = self.inner.lock_state();
            if state.abandoned {
                return Err(ServiceError::InvalidOperation(
                    "This checkout was abandoned".to_string(),
                ));
            }
            if state.receipt.is_some() || state.pending_redirect.is_some() {
                return Err(ServiceError::InvalidOperation(
                    "This order has already been placed".to_string(),
                ));
            }
            if state.submitting {
                return Err(ServiceError::InvalidOperation(
                    "Your order is already being placed".to_string(),
                ));
            }
            if state.method == method {
                return Ok(());
            }
        }
        {
            let mut slot = self.inner.lock_session();
            if let Some(session) = slot.as_ref() {
                if !session.cancel_unless_confirmed() {
                    return Err(ServiceError::InvalidOperation(
                        "Your bank transfer is confirmed and the order is being placed"
                            .to_string(),
                    ));
                }
            }
            slot.take();
        }
        self.inner.lock_state().method = method;
        info!(order_ref = %self.inner.order_ref, %method, "payment method selected");

        if method == PaymentMethod::BankTransfer {
            let finalizer = Arc::new(TransferFinalizer {
                checkout: Arc::downgrade(&self.inner),
            });
            let session = PaymentSessionController::start(
                self.inner.order_ref.clone(),
                self.inner.config.payment_status.clone(),
                SessionDeps {
                    status_client: self.inner.deps.status_client.clone(),
                    finalizer,
                    heuristic: self.inner.deps.heuristic.clone(),
                    events: self.inner.deps.events.clone(),
                },
            );
            *self.inner.lock_session() = Some(Arc::new(session));
        }
        Ok(())
    }

    pub fn use_saved_address(&self, address: SavedAddress) {
        self.inner.lock_state().address.use_saved(address);
    }

    pub fn use_manual_address(&self, input: ManualAddressInput) {
        self.inner.lock_state().address.use_manual(input);
    }

    /// Edits the form fields in place. Returns false while a saved address is active.
    pub fn edit_manual_address(&self, edit: impl FnOnce(&mut ManualAddressInput)) -> bool {
        match self.inner.lock_state().address.manual_mut() {
            Some(input) => {
                edit(input);
                true
            }
            None => false,
        }
    }

    pub fn address_errors(&self) -> FieldErrors {
        self.inner.lock_state().address.errors().clone()
    }

    pub fn set_card(&self, card: CardInput) {
        self.inner.lock_state().card = card;
    }

    pub fn card_check(&self) -> CardCheck {
        self.inner.lock_state().card.check()
    }

    pub fn set_note(&self, note: Option<String>) {
        self.inner.lock_state().note = note.filter(|n| !n.trim().is_empty());
    }

    pub fn order_gate(&self) -> OrderGate {
        let session = self.inner.current_session().map(|s| s.status());
        let state = self.inner.lock_state();
        self.inner.gate(&state, session)
    }

    /// The "place order" action. Placing twice returns the first outcome.
    #[instrument(skip(self), fields(order_ref = %self.inner.order_ref))]
    pub async fn place_order(&self) -> Result<PlaceOrderOutcome, ServiceError> {
        self.inner.place().await
    }

    fn bank_session(&self) -> Result<Arc<PaymentSessionController>, ServiceError> {
        self.inner.current_session().ok_or_else(|| {
            ServiceError::InvalidOperation("Bank transfer is not the selected method".to_string())
        })
    }

    /// "I have transferred."
    pub async fn confirm_transfer(&self) -> Result<SessionSnapshot, ServiceError> {
        self.bank_session()?.confirm_transfer().await
    }

    pub async fn check_transfer_now(&self) -> Result<SessionStatus, ServiceError> {
        self.bank_session()?.check_now().await
    }

    pub fn retry_transfer(&self) -> Result<(), ServiceError> {
        self.bank_session()?.retry()
    }

    pub fn transfer_snapshot(&self) -> Option<SessionSnapshot> {
        self.inner.current_session().map(|s| s.snapshot())
    }

    pub fn subscribe_transfer(&self) -> Option<watch::Receiver<SessionSnapshot>> {
        self.inner.current_session().map(|s| s.subscribe())
    }

    /// Timers currently running for this checkout.
    pub fn active_timers(&self) -> usize {
        self.inner
            .current_session()
            .map_or(0, |s| s.active_timers())
    }

    /// Explicit cancel: stops timers and forgets the order reference and
    /// any buy-now or pending card state.
    pub fn abandon(&self) {
        if let Some(session) = self.inner.lock_session().take() {
            session.cancel();
        }
        {
            let mut state = self.inner.lock_state();
            if state.abandoned {
                return;
            }
            state.abandoned = true;
        }
        self.inner.order_refs.clear();
        self.inner.buy_now.clear();
        self.inner.deps.session_store.remove(PENDING_CARD_ORDER_KEY);
        info!(order_ref = %self.inner.order_ref, "checkout abandoned");
        self.inner.deps.emit(Event::CheckoutAbandoned {
            order_ref: self.inner.order_ref.clone(),
        });
    }
}

impl Drop for CheckoutOrchestrator {
    fn drop(&mut self) {
        if let Some(session) = self.inner.lock_session().take() {
            session.cancel();
        }
    }
}

/// Result of a verified gateway return, for the confirmation view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayReturnOutcome {
    pub order_ref: String,
    pub order_number: String,
    pub amount: u64,
    pub response_code: String,
    pub message: &'static str,
    pub transaction_no: Option<String>,
    pub bank_code: Option<String>,
    pub confirmation_path: String,
}

/// Handles the shopper's return from the card gateway.
pub struct GatewayReturnHandler {
    verifier: GatewayVerifier,
    deps: CheckoutDeps,
    order_refs: OrderRefManager,
    submitter: OrderSubmitter,
}

impl GatewayReturnHandler {
    pub fn new(config: &CheckoutConfig, deps: CheckoutDeps) -> Self {
        Self {
            verifier: GatewayVerifier::new(config.gateway.clone()),
            order_refs: OrderRefManager::new(deps.session_store.clone()),
            submitter: deps.submitter(),
            deps,
        }
    }

    /// Finalizes the pending card order only for an authentic success callback
    /// whose amount matches the order.
    #[instrument(skip_all)]
    pub async fn handle(&self, params: &GatewayParams) -> Result<GatewayReturnOutcome, ServiceError> {
        let callback = match self.verifier.verify(params) {
            Ok(callback) => callback,
            Err(err) => {
                self.deps.emit(Event::GatewayCallbackRejected {
                    order_ref: params.get("vnp_TxnRef").cloned(),
                });
                return Err(err);
            }
        };

        let pending = self
            .deps
            .session_store
            .get_json::<PendingCardOrder>(PENDING_CARD_ORDER_KEY)?
            .filter(|p| p.order_ref == callback.order_ref)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No pending card payment for order {}",
                    callback.order_ref
                ))
            })?;

        if !callback.is_success() {
            warn!(order_ref = %pending.order_ref, code = %callback.response_code, "card payment failed");
            self.fail(&pending, &callback.response_code).await;
            return Err(ServiceError::PaymentDeclined {
                code: callback.response_code,
                message: callback.message.to_string(),
            });
        }
        if callback.amount != pending.draft.total {
            warn!(
                order_ref = %pending.order_ref,
                paid = callback.amount,
                expected = pending.draft.total,
                "gateway amount does not match order total"
            );
            self.fail(&pending, &callback.response_code).await;
            return Err(ServiceError::ValidationError(
                "The paid amount does not match the order total".to_string(),
            ));
        }

        let confirmation = CardPaymentConfirmation {
            order_ref: pending.order_ref.clone(),
            amount: callback.amount,
            response_code: callback.response_code.clone(),
            transaction_no: callback.transaction_no.clone(),
            bank_code: callback.bank_code.clone(),
            pay_date: callback.pay_date.clone(),
        };
        self.submitter
            .orders()
            .confirm_card_payment(&pending.order_number, &confirmation)
            .await?;

        let ack = OrderAck {
            id: None,
            order_number: pending.order_number.clone(),
        };
        let receipt = self
            .submitter
            .complete(&pending.draft, &ack, &pending.context)
            .await;
        self.deps.session_store.remove(PENDING_CARD_ORDER_KEY);
        self.order_refs.clear();
        info!(order_ref = %receipt.order_ref, order_number = %receipt.order_number, "card payment confirmed");

        self.deps.emit(Event::CardPaymentSucceeded {
            order_ref: receipt.order_ref.clone(),
            order_number: receipt.order_number.clone(),
            transaction_no: callback.transaction_no.clone(),
        });
        Ok(GatewayReturnOutcome {
            confirmation_path: receipt.confirmation_path(),
            order_ref: receipt.order_ref,
            order_number: receipt.order_number,
            amount: callback.amount,
            response_code: callback.response_code,
            message: callback.message,
            transaction_no: callback.transaction_no,
            bank_code: callback.bank_code,
        })
    }

    /// Best-effort failure report. The order reference is kept so a new
    /// attempt reattaches to the same order.
    async fn fail(&self, pending: &PendingCardOrder, response_code: &str) {
        if let Err(err) = self
            .submitter
            .orders()
            .report_card_failure(&pending.order_number, response_code)
            .await
        {
            warn!(order_number = %pending.order_number, error = %err, "could not report card failure");
        }
        self.deps.session_store.remove(PENDING_CARD_ORDER_KEY);
        self.deps.emit(Event::CardPaymentFailed {
            order_ref: pending.order_ref.clone(),
            response_code: response_code.to_string(),
        });
    }
}
