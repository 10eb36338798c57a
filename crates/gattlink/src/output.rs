use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    kind: &'static str,
    role: &'a str,
    peer: &'a str,
    size: usize,
    payload: String,
    payload_hex: String,
    timestamp: String,
}

/// Print one reassembled message received from `peer`.
pub fn print_message(message: &[u8], role: &str, peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                kind: "message-received",
                role,
                peer,
                size: message.len(),
                payload: payload_preview(message),
                payload_hex: hex::encode(message),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ROLE", "PEER", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    role.to_string(),
                    peer.to_string(),
                    message.len().to_string(),
                    payload_preview(message),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "role={} peer={} size={} payload={}",
                role,
                peer,
                message.len(),
                payload_preview(message)
            );
        }
        OutputFormat::Raw => {
            print_raw(message);
        }
    }
}

/// Two-column table for single-record reports.
pub fn print_fields(title: &str, rows: &[(&str, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![title.to_string(), String::new()]);
    for (key, value) in rows {
        table.add_row(vec![key.to_string(), value.clone()]);
    }
    println!("{table}");
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

pub fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_shows_text_or_size() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }
}
