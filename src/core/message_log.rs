//! Append-only record of every frame sent to or received from the device.

use std::path::Path;

use chrono::{DateTime, Local};
use log::info;
use serde::Serialize;

use crate::core::error::{BridgeError, Result};
use crate::utils::ensure_directory_exists;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Sent,
    Received,
}

impl MessageDirection {
    fn marker(self) -> char {
        match self {
            MessageDirection::Sent => '>',
            MessageDirection::Received => '<',
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub direction: MessageDirection,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, direction: MessageDirection, content: impl Into<String>) {
        self.messages.push(Message {
            direction,
            content: content.into(),
            timestamp: Local::now(),
        });
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// One line per message: `[HH:MM:SS] > content` for sent, `< content` for received.
    pub fn export_as_text(&self) -> String {
        self.messages
            .iter()
            .map(|message| {
                format!(
                    "[{}] {} {}\n",
                    message.timestamp.format("%H:%M:%S"),
                    message.direction.marker(),
                    message.content
                )
            })
            .collect()
    }

    /// Reads back the `(direction, content)` pairs of an [`export_as_text`](Self::export_as_text) dump.
    pub fn parse_export(text: &str) -> Result<Vec<(MessageDirection, String)>> {
        text.lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                let malformed = || BridgeError::MalformedFrame(line.to_string());
                let rest = line
                    .strip_prefix('[')
                    .and_then(|l| l.split_once("] "))
                    .map(|(_, rest)| rest)
                    .ok_or_else(malformed)?;
                let mut chars = rest.chars();
                let direction = match chars.next() {
                    Some('>') => MessageDirection::Sent,
                    Some('<') => MessageDirection::Received,
                    _ => return Err(malformed()),
                };
                let content = chars.as_str().strip_prefix(' ').ok_or_else(malformed)?;
                Ok((direction, content.to_string()))
            })
            .collect()
    }

    /// Writes the text export to `path`, creating parent directories.
    pub async fn export_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_directory_exists(parent)
                .await
                .map_err(|e| BridgeError::Io(std::io::Error::other(e.to_string())))?;
        }
        tokio::fs::write(path, self.export_as_text()).await?;
        info!("Exported {} messages to {:?}", self.messages.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_format() {
        let mut log = MessageLog::new();
        log.record(MessageDirection::Sent, "GET_GPIO_STATE");
        log.record(MessageDirection::Received, "GPIO:2:1");

        let text = log.export_as_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert_eq!(&lines[0][9..], "] > GET_GPIO_STATE");
        assert_eq!(&lines[1][9..], "] < GPIO:2:1");
    }

    #[test]
    fn test_export_parses_back_in_order() {
        let recorded = vec![
            (MessageDirection::Sent, "SET_LOGIC:16:AND:32,33:1".to_string()),
            (MessageDirection::Received, "LOGIC:16:AND:32,33:1".to_string()),
            (MessageDirection::Received, "ERROR:Unknown command: X] < Y".to_string()),
            (MessageDirection::Sent, " padded ".to_string()),
        ];
        let mut log = MessageLog::new();
        for (direction, content) in &recorded {
            log.record(*direction, content.clone());
        }

        let parsed = MessageLog::parse_export(&log.export_as_text()).unwrap();
        assert_eq!(parsed, recorded);
    }

    #[test]
    fn test_parse_rejects_foreign_text() {
        assert!(MessageLog::parse_export("hello world").is_err());
        assert!(MessageLog::parse_export("[12:00:00] ? what").is_err());
    }

    #[test]
    fn test_clear() {
        let mut log = MessageLog::new();
        log.record(MessageDirection::Sent, "GET_GPIO_STATE");
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
        assert!(log.export_as_text().is_empty());
    }

    #[tokio::test]
    async fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("session.txt");

        let mut log = MessageLog::new();
        log.record(MessageDirection::Received, "GPIO:33:0");
        log.export_to_file(&path).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, log.export_as_text());
    }

    #[test]
    fn test_message_serializes_with_timestamp() {
        let mut log = MessageLog::new();
        log.record(MessageDirection::Received, "GPIO:2:1");

        let json = serde_json::to_value(&log.messages()[0]).unwrap();
        assert_eq!(json["direction"], "received");
        assert_eq!(json["content"], "GPIO:2:1");
        assert!(json["timestamp"].is_string());
    }
}
