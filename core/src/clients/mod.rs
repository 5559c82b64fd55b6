//! Typed clients for the downstream services: the analysis/CSP API and the
//! A-MINT extractor. Both share the jittered-backoff retry policy and
//! surface cancellation as a distinct error kind.

pub mod analysis;
pub mod extractor;
pub mod retry;

pub use analysis::{AnalysisApi, AnalysisClient, AnalysisJob, JobStatus};
pub use extractor::ExtractorClient;
pub use retry::{retry_request, RetryConfig};
