//! Process and Request Context
//!
//! All shared collaborators live in one process-wide context struct that is
//! threaded through request handling; nothing hides in module globals
//! except the metric collectors. Each request gets a small value carrying
//! its identity and caller facts. Handlers never store back-references.

use crate::config::Config;
use crate::meta::envelope::Envelope;
use crate::meta::snaplink::SnaplinkGate;
use crate::meta::RoleResolver;
use crate::ops::OrphanSink;
use crate::picker::Picker;
use crate::shark::SharkRegistry;
use crate::throttle::Throttle;
use std::sync::Arc;
use std::time::Instant;

/// Everything a request handler needs, built once at startup
pub struct ProcessContext {
    pub config: Config,
    pub envelope: Envelope,
    pub picker: Arc<Picker>,
    pub sharks: Arc<SharkRegistry>,
    pub throttle: Arc<Throttle>,
    pub roles: Arc<dyn RoleResolver>,
    pub snaplinks: SnaplinkGate,
    pub orphans: OrphanSink,
}

/// Per-request facts, resolved before the handler runs
#[derive(Debug, Clone)]
pub struct ReqCtx {
    /// Propagated or generated x-request-id
    pub req_id: String,
    /// Account owning the addressed namespace
    pub account: String,
    /// Active role ids for the caller
    pub caller_roles: Vec<String>,
    /// Role names the caller asked to activate explicitly
    pub requested_roles: Option<Vec<String>>,
    /// Operator requests see the wider placement view and extra knobs
    pub operator: bool,
    /// When the request started, for latency metrics
    pub started: Instant,
}

impl ReqCtx {
    pub fn new(req_id: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            req_id: req_id.into(),
            account: account.into(),
            caller_roles: Vec::new(),
            requested_roles: None,
            operator: false,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1_000.0
    }
}
