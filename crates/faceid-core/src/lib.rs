//! faceid-core: identity matching engine.
//!
//! Aggregates enrollment bursts into canonical encodings, matches live
//! embeddings against a gallery snapshot with adaptive tolerance and
//! cosine verification, and runs external embedders through a
//! primary/fallback policy. Model inference lives behind [`Embedder`].

pub mod enrollment;
pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod notify;
pub mod orchestrator;
pub mod types;

pub use enrollment::{aggregate, Enrollment, EnrollmentAggregator, EnrollmentError, EnrollmentPolicy};
pub use frame::{Frame, FrameError};
pub use gallery::{
    integrity_hash, Gallery, Identity, IntegrityViolation, InvalidIdentity, ViolationReason,
};
pub use matcher::{adaptive_tolerance, MatchConfig, MatchEngine, MatchError};
pub use notify::{Event, EventKind, Notifier, NullNotifier, TracingNotifier};
pub use orchestrator::{
    DetectionError, DetectionOrchestrator, Embedder, EmbedderError, FaceDetection,
    OrchestratorConfig,
};
pub use types::{
    BoundingBox, Candidate, DetectionResult, DetectorSource, Embedding, EnrollmentSample,
    MatchDecision, Verdict,
};
