//! Closed action registry mapping names to component handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use od_common::ProgressSink;

/// Success carries the response message, failure the error message; the
/// boundary folds both into the `{result, message}` frame.
pub type ActionResult = Result<String, String>;

type BoxedFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;
type Handler = Arc<dyn Fn(Vec<Value>, Option<ProgressSink>) -> BoxedFuture + Send + Sync>;

#[derive(Default)]
pub struct ActionTable {
    handlers: HashMap<String, Handler>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under an action name. Handlers capture their
    /// component Arcs; registration happens once at wiring time.
    pub fn register<F, Fut>(&mut self, action: &str, handler: F)
    where
        F: Fn(Vec<Value>, Option<ProgressSink>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.handlers.insert(
            action.to_string(),
            Arc::new(move |data, progress| Box::pin(handler(data, progress))),
        );
    }

    pub fn get(&self, action: &str) -> Option<Handler> {
        self.handlers.get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Pull a required string argument out of the data list.
pub fn str_arg(data: &[Value], index: usize, name: &str) -> Result<String, String> {
    data.get(index)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| format!("missing argument: {name}"))
}

/// Optional string argument.
pub fn opt_str_arg(data: &[Value], index: usize) -> Option<String> {
    data.get(index).and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_handler_runs() {
        let mut table = ActionTable::new();
        table.register("echo", |data, _progress| async move {
            Ok(str_arg(&data, 0, "text")?)
        });
        let handler = table.get("echo").unwrap();
        let result = handler(vec![Value::String("hi".into())], None).await;
        assert_eq!(result.unwrap(), "hi");
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn arg_helpers() {
        let data = vec![Value::String("a".into()), Value::Bool(true)];
        assert_eq!(str_arg(&data, 0, "x").unwrap(), "a");
        assert!(str_arg(&data, 1, "flag").is_err());
        assert!(str_arg(&data, 9, "none").is_err());
        assert_eq!(opt_str_arg(&data, 0).as_deref(), Some("a"));
        assert!(opt_str_arg(&data, 9).is_none());
    }
}
