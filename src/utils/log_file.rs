use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Splits an event into its message, its `event` name and the remaining fields.
#[derive(Default)]
struct LineVisitor {
    message: String,
    event: Option<String>,
    fields: String,
}

impl LineVisitor {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "event" => self.event = Some(format!("{value:?}").trim_matches('"').to_string()),
            name => self.push_field(name, format_args!("{value:?}")),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "event" => self.event = Some(value.to_string()),
            name => self.push_field(name, format_args!("{value}")),
        }
    }
}

/// Appends one line per event to a log file, with ISO 8601 local timestamps:
///
/// `[2026-01-01T12:00:00.000+01:00] INFO roomdrop::core::node node_started: Connected peer_id=...`
pub struct FileLogLayer {
    writer: Arc<Mutex<File>>,
}

impl FileLogLayer {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(file)),
        })
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
        let mut line = format!("[{timestamp}] {} {}", meta.level(), meta.target());
        if let Some(name) = &visitor.event {
            let _ = write!(line, " {name}:");
        }
        if !visitor.message.is_empty() {
            let _ = write!(line, " {}", visitor.message);
        }
        if !visitor.fields.is_empty() {
            let _ = write!(line, " {}", visitor.fields);
        }
        line.push('\n');

        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn writes_event_name_message_and_fields() {
        let path = std::env::temp_dir()
            .join("roomdrop_test")
            .join(format!("log_{}", uuid::Uuid::new_v4().simple()))
            .join("roomdrop.log");
        let layer = FileLogLayer::new(&path).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(event = "offer_invalid", file = "a.bin", chunks = 3, "Declining invalid offer");
            tracing::info!("plain line");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" WARN "));
        assert!(lines[0].contains("offer_invalid: Declining invalid offer file=a.bin chunks=3"));
        assert!(lines[1].ends_with("plain line"));
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
