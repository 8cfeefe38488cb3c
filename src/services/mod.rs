//! Business logic services layer

pub mod firewall_pipeline;
pub mod gateway_service;
pub mod trace;

pub use firewall_pipeline::{FirewallPipeline, PipelineOutcome};
pub use gateway_service::{Admission, GatewayService, Verdict};
pub use trace::assemble_trace;
