use serde_json::Value;

/// Registry of controllable things (lamps, speakers...).
///
/// Descriptor and state snapshots are JSON text; the application sends
/// states only when the text changes.
pub trait ThingManager: Send + Sync {
    fn descriptors_json(&self) -> String;
    fn states_json(&self) -> String;
    fn invoke(&self, command: &Value);
}
