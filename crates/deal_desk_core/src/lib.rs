pub mod activity;
pub mod admission;
pub mod domain;
pub mod ledger;
pub mod lifecycle;
pub mod normalizer;
pub mod pipeline;
pub mod ports;
pub mod resolver;
pub mod search;
pub mod settings;
pub mod sla;

pub use domain::{
    ActionKind, ActivityFilter, ActivityLogEntry, Actor, ActorRole, AiAnalysis, Contact,
    Conversation, Deal, DealFilter, DealStatus, InboundMessageEvent, Manager, ManagerAlert,
    ManagerCredentials, Platform, RequestOrigin,
};
pub use lifecycle::{DealLifecycleEngine, LifecycleError};
pub use pipeline::{DeliveryError, DeliveryReport, IngestionPipeline, ItemOutcome};
pub use ports::{
    AnalysisFailure, AnalysisQueue, AnalysisService, DatabaseService, MessageHistoryService,
    NotificationService, PortError, PortResult, QueueError,
};
pub use settings::{PipelineSettings, SettingsHandle};
