//! [`ScriptEngine`] implementation backed by V8.

use std::sync::Arc;

use async_trait::async_trait;
use microsvc::{CompileError, EngineHost, ScriptEngine, ScriptHandle, ScriptSource};

use crate::spawn::spawn_service_runtime;
use crate::worker::init_platform;

/// Runs every service in its own V8 isolate on a dedicated thread.
#[derive(Debug, Clone, Default)]
pub struct JsEngine {
    _private: (),
}

impl JsEngine {
    pub fn new() -> Self {
        init_platform();
        Self { _private: () }
    }
}

#[async_trait]
impl ScriptEngine for JsEngine {
    async fn compile(
        &self,
        source: ScriptSource,
        host: EngineHost,
    ) -> Result<Arc<dyn ScriptHandle>, CompileError> {
        let name = format!("svc-{}", &host.identity().cache_key()[..12]);
        let handle = spawn_service_runtime(name, source, host).await?;
        Ok(Arc::new(handle))
    }
}
