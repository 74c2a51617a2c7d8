//! # arl-sdk
//!
//! Rust client SDK for [ARL](https://github.com/arl-infra/arl) — the sandbox
//! lifecycle and session control plane for agentic workloads.
//!
//! ## Quick Start
//!
//! ```no_run
//! # async fn example() -> arl_sdk::Result<()> {
//! use arl_sdk::Arl;
//!
//! let client = Arl::builder().build()?;
//! let session = client.create_session("base-pool", Default::default()).await?;
//! let result = client
//!     .execute(session.id, &[arl_sdk::StepRequest::new("echo", &["echo", "hello"])])
//!     .await?;
//! println!("{:?}", result.results);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod types;

pub use client::{Arl, ArlBuilder, SessionHandle};
pub use error::{Error, Result};
pub use types::{
    ExecuteResponse, InlineTool, PoolCondition, PoolInfo, ResourceRequirements, SessionInfo,
    SessionOptions, StepOutput, StepRequest, StepResult,
};
