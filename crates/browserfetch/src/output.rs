use std::io::{IsTerminal, Write};

use browserfetch_broker::{FetchResponse, StatusReport};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
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

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// Print an evaluation result. `raw` prints strings without JSON quoting.
pub fn print_value(host: &str, value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{value}"),
        OutputFormat::Table => {
            let mut table = new_table(vec!["HOST", "RESULT"]);
            table.add_row(vec![host.to_string(), value.to_string()]);
            println!("{table}");
        }
        OutputFormat::Raw => match value {
            Value::String(text) => print_raw(text.as_bytes()),
            other => print_raw(other.to_string().as_bytes()),
        },
    }
}

#[derive(Serialize)]
struct FetchOutput<'a> {
    #[serde(flatten)]
    response: &'a FetchResponse,
    body: String,
}

pub fn print_fetch(response: &FetchResponse, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = FetchOutput {
                response,
                body: response.text().into_owned(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["FIELD", "VALUE"]);
            table
                .add_row(vec![
                    "status".to_string(),
                    format!("{} {}", response.status, response.status_text),
                ])
                .add_row(vec!["url".to_string(), response.final_url().to_string()])
                .add_row(vec!["ok".to_string(), response.ok.to_string()])
                .add_row(vec!["redirected".to_string(), response.redirected.to_string()]);
            for (name, value) in &response.headers {
                table.add_row(vec![format!("header {name}"), value.clone()]);
            }
            table.add_row(vec!["body".to_string(), body_preview(&response.body)]);
            println!("{table}");
        }
        OutputFormat::Raw => print_raw(&response.body),
    }
}

pub fn print_status(report: &StatusReport, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => println!(
            "{}",
            serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = new_table(vec!["ROLE", "VERSION", "HOSTS", "PENDING"]);
            table.add_row(vec![
                serde_json::to_value(report.role)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                report.version.clone(),
                report.hosts.len().to_string(),
                report.pending.len().to_string(),
            ]);
            println!("{table}");
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn body_preview(body: &[u8]) -> String {
    const LIMIT: usize = 2048;
    match std::str::from_utf8(body) {
        Ok(text) if text.len() <= LIMIT => text.to_string(),
        Ok(_) => format!("<{} bytes of text>", body.len()),
        Err(_) => format!("<binary {} bytes>", body.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_preview_handles_binary_and_long_text() {
        assert_eq!(body_preview(b"hello"), "hello");
        assert_eq!(body_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
        assert_eq!(body_preview(&[b'a'; 4096]), "<4096 bytes of text>");
    }
}
