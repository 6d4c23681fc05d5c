//! Process-wide singletons: the loaded configuration and the composition
//! root (`ServerContext`). Everything else is threaded through explicitly.

use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::context::ServerContext;

static CONFIG_CELL: Lazy<RwLock<Option<Arc<Config>>>> = Lazy::new(|| RwLock::new(None));
static CONTEXT_CELL: Lazy<RwLock<Option<Arc<ServerContext>>>> = Lazy::new(|| RwLock::new(None));

pub fn set_config(config: Arc<Config>) {
    *CONFIG_CELL.write().unwrap() = Some(config);
}

pub fn get_config() -> Option<Arc<Config>> {
    CONFIG_CELL.read().unwrap().clone()
}

pub fn set_context(context: Arc<ServerContext>) {
    *CONTEXT_CELL.write().unwrap() = Some(context);
}

pub fn get_context() -> Option<Arc<ServerContext>> {
    CONTEXT_CELL.read().unwrap().clone()
}

/// Reset both cells. Test-only: production only ever sets these once.
#[cfg(test)]
pub fn reset() {
    *CONFIG_CELL.write().unwrap() = None;
    *CONTEXT_CELL.write().unwrap() = None;
}
