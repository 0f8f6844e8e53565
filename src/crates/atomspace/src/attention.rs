//! Attention broker collaborator interface.
//!
//! The spreading-activation service lives behind an RPC boundary; the
//! core only depends on this trait. [`NullAttentionBroker`] is the
//! default when no broker address is configured and
//! [`RecordingAttentionBroker`] backs tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::handle::Handle;

/// Interface required of the attention broker service.
#[async_trait]
pub trait AttentionBroker: Send + Sync {
    async fn set_parameters(
        &self,
        rent_rate: f64,
        spreading_rate_lowerbound: f64,
        spreading_rate_upperbound: f64,
    ) -> Result<()>;

    /// Records that the handles co-occurred in one answer.
    async fn correlate(&self, handles: &HashSet<Handle>, context: &str) -> Result<()>;

    /// Injects stimulus into the handles, weighted by count.
    async fn stimulate(&self, handle_count: &HashMap<Handle, u32>, context: &str) -> Result<()>;

    /// Registers determiner groups for correlated spreading.
    async fn set_determiners(&self, handle_lists: &[Vec<Handle>], context: &str) -> Result<()>;

    /// Importance of each handle under the context, in input order.
    async fn get_importance(&self, handles: &[Handle], context: &str) -> Result<Vec<f64>>;

    /// Asks the broker to persist a context snapshot.
    async fn save_context(&self, context_key: &str, file_path: &Path) -> Result<()>;

    async fn health_check(&self) -> bool;
}

/// Broker used when no attention service is configured: ignores all
/// updates and reports zero importance for everything.
#[derive(Debug, Default, Clone)]
pub struct NullAttentionBroker;

#[async_trait]
impl AttentionBroker for NullAttentionBroker {
    async fn set_parameters(&self, _rent: f64, _lo: f64, _hi: f64) -> Result<()> {
        Ok(())
    }

    async fn correlate(&self, _handles: &HashSet<Handle>, _context: &str) -> Result<()> {
        Ok(())
    }

    async fn stimulate(&self, _handle_count: &HashMap<Handle, u32>, _context: &str) -> Result<()> {
        Ok(())
    }

    async fn set_determiners(&self, _handle_lists: &[Vec<Handle>], _context: &str) -> Result<()> {
        Ok(())
    }

    async fn get_importance(&self, handles: &[Handle], _context: &str) -> Result<Vec<f64>> {
        Ok(vec![0.0; handles.len()])
    }

    async fn save_context(&self, _context_key: &str, _file_path: &Path) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Calls observed by a [`RecordingAttentionBroker`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttentionEvent {
    SetParameters {
        rent_rate: f64,
        spreading_rate_lowerbound: f64,
        spreading_rate_upperbound: f64,
    },
    Correlate {
        handles: Vec<Handle>,
        context: String,
    },
    Stimulate {
        handle_count: Vec<(Handle, u32)>,
        context: String,
    },
    SetDeterminers {
        group_count: usize,
        context: String,
    },
}

/// Broker that records every call and serves importance values from a
/// configurable table. Used by tests and local experiments.
#[derive(Debug, Default)]
pub struct RecordingAttentionBroker {
    events: Mutex<Vec<AttentionEvent>>,
    importance: Mutex<HashMap<Handle, f64>>,
}

impl RecordingAttentionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_importance(&self, handle: Handle, importance: f64) {
        self.importance.lock().insert(handle, importance);
    }

    pub fn events(&self) -> Vec<AttentionEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AttentionBroker for RecordingAttentionBroker {
    async fn set_parameters(
        &self,
        rent_rate: f64,
        spreading_rate_lowerbound: f64,
        spreading_rate_upperbound: f64,
    ) -> Result<()> {
        self.events.lock().push(AttentionEvent::SetParameters {
            rent_rate,
            spreading_rate_lowerbound,
            spreading_rate_upperbound,
        });
        Ok(())
    }

    async fn correlate(&self, handles: &HashSet<Handle>, context: &str) -> Result<()> {
        let mut sorted: Vec<Handle> = handles.iter().cloned().collect();
        sorted.sort();
        self.events.lock().push(AttentionEvent::Correlate {
            handles: sorted,
            context: context.to_string(),
        });
        Ok(())
    }

    async fn stimulate(&self, handle_count: &HashMap<Handle, u32>, context: &str) -> Result<()> {
        let mut sorted: Vec<(Handle, u32)> = handle_count
            .iter()
            .map(|(handle, count)| (handle.clone(), *count))
            .collect();
        sorted.sort();
        self.events.lock().push(AttentionEvent::Stimulate {
            handle_count: sorted,
            context: context.to_string(),
        });
        Ok(())
    }

    async fn set_determiners(&self, handle_lists: &[Vec<Handle>], context: &str) -> Result<()> {
        self.events.lock().push(AttentionEvent::SetDeterminers {
            group_count: handle_lists.len(),
            context: context.to_string(),
        });
        Ok(())
    }

    async fn get_importance(&self, handles: &[Handle], _context: &str) -> Result<Vec<f64>> {
        let table = self.importance.lock();
        Ok(handles
            .iter()
            .map(|handle| table.get(handle).copied().unwrap_or(0.0))
            .collect())
    }

    async fn save_context(&self, _context_key: &str, _file_path: &Path) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
