use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::MonitorError;

/// Defaults handed to the web frontend. Updates live in memory only.
#[derive(Clone, Default)]
pub struct UiDefaults {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl UiDefaults {
    pub fn new(initial: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self) -> HashMap<String, Value> {
        self.inner.read().await.clone()
    }

    pub async fn update(&self, key: &str, raw_json: &str) -> Result<()> {
        let v: Value = serde_json::from_str(raw_json)
            .map_err(|e| MonitorError::Validation(format!("value of {key:?} is not JSON: {e}")))?;
        self.inner.write().await.insert(key.to_string(), v);
        Ok(())
    }
}

#[tokio::test]
async fn test_update_is_validated() {
    let ui = UiDefaults::new(HashMap::from([(
        "plot_general_lineWidth".to_string(),
        Value::from(3),
    )]));
    let snapshot = ui.get().await;

    ui.update("plot_general_lineWidth", "1").await.unwrap();
    assert!(ui.update("job_view_selectedMetrics", "[\"flops_any\"").await.is_err());

    assert_eq!(snapshot["plot_general_lineWidth"], Value::from(3));
    let now = ui.get().await;
    assert_eq!(now["plot_general_lineWidth"], Value::from(1));
    assert!(!now.contains_key("job_view_selectedMetrics"));
}
