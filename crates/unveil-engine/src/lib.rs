//! Delivery engine: the send pipeline, delivery tracking, scheduled
//! dispatch and the delivery-gated guest read path.

pub mod error;
pub mod hosts;
pub mod pipeline;
pub mod providers;
pub mod reader;
pub mod replies;
pub mod scheduler;
pub mod signature;
pub mod tracker;

use std::sync::Arc;

use unveil_db::Database;
use unveil_messaging::ComplianceConfig;

pub use error::{EngineError, TrackingGap};
pub use pipeline::{DispatchSettings, SendPipeline, SendReport, SendRequest};
pub use providers::{ChannelProvider, LogProvider, OutboundMessage, ProviderOutcome, ProviderSet, WebhookProvider};
pub use reader::{DeliveryGatedReader, InboxCursor};
pub use scheduler::{BackfillReport, ClaimOutcome, ProcessReport, SchedulingEngine, run_scheduler_loop};
pub use tracker::{DeliveryTracker, StatusUpdate};

/// Every engine component, wired to one database.
#[derive(Clone)]
pub struct Engine {
    pub db: Arc<Database>,
    pub pipeline: Arc<SendPipeline>,
    pub scheduler: Arc<SchedulingEngine>,
    pub reader: DeliveryGatedReader,
}

impl Engine {
    pub fn new(
        db: Arc<Database>,
        providers: ProviderSet,
        compliance: ComplianceConfig,
        dispatch: DispatchSettings,
        scheduler_batch_size: u32,
    ) -> Self {
        let pipeline = Arc::new(SendPipeline::new(db.clone(), providers, compliance, dispatch));
        let scheduler = Arc::new(SchedulingEngine::new(pipeline.clone(), scheduler_batch_size));
        Self {
            reader: DeliveryGatedReader::new(db.clone()),
            db,
            pipeline,
            scheduler,
        }
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        self.pipeline.tracker()
    }
}
