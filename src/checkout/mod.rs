//! Checkout flow: snapshot, address, order submission and the payment paths.

pub mod address;
pub mod model;
pub mod orchestrator;
pub mod order_ref;
pub mod payment_session;
pub mod scheduler;
pub mod session_store;
pub mod submitter;

pub use address::{
    AddressResolver, AddressSource, ManualAddressInput, RegionDirectory, SavedAddress,
    ShippingAddress, StaticRegionDirectory,
};
pub use model::{
    CartLine, CartSnapshot, CustomerContext, OrderDraft, OrderPaymentStatus, OrderReceipt,
    OrderTotals, PaymentMethod, PurchaseMode,
};
pub use orchestrator::{
    CheckoutDeps, CheckoutOrchestrator, GatewayReturnHandler, GatewayReturnOutcome, OrderGate,
    PlaceOrderOutcome, PENDING_CARD_ORDER_KEY,
};
pub use order_ref::{generate_order_ref, BuyNowStore, OrderRefManager};
pub use payment_session::{
    ConfirmationSource, PaymentSessionController, SessionDeps, SessionFinalizer, SessionSnapshot,
    SessionStatus, SubmissionState,
};
pub use session_store::{InMemorySessionStore, SessionStore, SessionStoreExt};
pub use submitter::{
    AddressBook, CardPaymentConfirmation, CartStore, HttpOrderService, OrderAck, OrderService,
    OrderSubmitter, SubmitContext,
};
