//! Scripted generator: replays a fixed sequence of patches.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{GenerateRequest, PatchGenerator};
use crate::error::{DevloopError, Result};
use crate::patch::RawPatch;

/// Hands out queued patches in order and records every request it saw.
///
/// With `repeating`, the last patch keeps being returned once the queue is
/// down to one entry.
pub struct ScriptedGenerator {
    patches: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<GenerateRequest>>,
    repeating: bool,
}

impl ScriptedGenerator {
    pub fn new<I, S>(patches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patches: Mutex::new(patches.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
            repeating: false,
        }
    }

    /// Always return the same patch.
    pub fn repeating(patch: impl Into<String>) -> Self {
        let mut generator = Self::new([patch.into()]);
        generator.repeating = true;
        generator
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl PatchGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerateRequest, _cancel: &CancellationToken) -> Result<RawPatch> {
        self.requests
            .lock()
            .map_err(|_| DevloopError::Generator("request log poisoned".to_string()))?
            .push(request.clone());

        let mut patches = self
            .patches
            .lock()
            .map_err(|_| DevloopError::Generator("patch queue poisoned".to_string()))?;
        let next = if self.repeating && patches.len() == 1 {
            patches.front().cloned()
        } else {
            patches.pop_front()
        };
        next.map(RawPatch::new).ok_or_else(|| {
            DevloopError::Generator(format!("no scripted patch left for attempt {}", request.attempt))
        })
    }

    fn description(&self) -> String {
        "scripted".to_string()
    }
}
