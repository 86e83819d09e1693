//! Process-wide session registry.

use crate::config::SessionOptions;
use crate::session::Session;
use anyhow::{Context, Result};
use graphforge_graph::Target;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Registry {
    sessions: HashMap<usize, Arc<Session>>,
    next_id: usize,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry {
        sessions: HashMap::new(),
        next_id: 0,
    })
});

/// Create a session and return its id.
pub fn create_session(target: Target, opts: SessionOptions) -> Result<usize> {
    let session = Session::new(target, opts)?;
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    let id = registry.next_id;
    registry.next_id += 1;
    registry.sessions.insert(id, session);
    Ok(id)
}

/// Register an externally constructed session (tests inject custom
/// codegen/measurement components this way).
pub fn register_session(session: Arc<Session>) -> usize {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    let id = registry.next_id;
    registry.next_id += 1;
    registry.sessions.insert(id, session);
    id
}

/// Look up a session; an unknown id is an error, never a fresh session.
pub fn get_session(session_id: usize) -> Result<Arc<Session>> {
    let registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    registry
        .sessions
        .get(&session_id)
        .cloned()
        .with_context(|| format!("can't find session {session_id}"))
}

pub fn delete_session(session_id: usize) -> Result<()> {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    registry
        .sessions
        .remove(&session_id)
        .map(|_| ())
        .with_context(|| format!("can't find session {session_id}"))
}
